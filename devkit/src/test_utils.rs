/*!
Simulateur de flotte de capteurs SmartSensor

Facilite le développement et les tests autour de la gateway sans broker :
- une flotte de devices simulés émet des frames au format wire exact
  (TPMS, environnemental) sur un canal que le code sous test consomme
  comme il consommerait les publications MQTT
- journal des frames émises par device, avec assertions de champs
*/

use crate::frames::FrameBuilder;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Une frame émise par un device simulé, telle qu'elle arriverait du
/// broker : topic de données + payload JSON sérialisé
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub device_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Flotte de devices simulée. Les frames partent sur le canal configuré
/// par `setup_receiver` et sont journalisées par device pour assertions.
pub struct DeviceFleet {
    topic_root: String,
    inbound: Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>,
    journal: Mutex<HashMap<String, Vec<Value>>>,
}

impl DeviceFleet {
    pub fn new<S: Into<String>>(topic_root: S) -> Self {
        env_logger::try_init().ok();
        Self {
            topic_root: topic_root.into(),
            inbound: Mutex::new(None),
            journal: Mutex::new(HashMap::new()),
        }
    }

    /// Canal de réception des frames de la flotte. Le code sous test le
    /// draine comme il drainerait les publications du broker ; il se ferme
    /// quand la flotte est droppée.
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<InboundFrame> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(sender);
        receiver
    }

    /// Émet une frame arbitraire au format wire pour un device
    pub fn send_frame(&self, device_id: &str, frame: Value) -> Result<()> {
        self.journal
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_default()
            .push(frame.clone());

        if let Some(sender) = self.inbound.lock().unwrap().as_ref() {
            sender
                .send(InboundFrame {
                    device_id: device_id.to_string(),
                    topic: FrameBuilder::data_topic(&self.topic_root, device_id),
                    payload: serde_json::to_vec(&frame)?,
                })
                .map_err(|e| anyhow::anyhow!("fleet receiver gone: {}", e))?;
        }

        log::info!("[fleet] {} emitted a frame", device_id);
        Ok(())
    }

    /// Frame TPMS : un pneu, pression + température
    pub fn send_tpms(&self, device_id: &str, position: &str, pressure_kpa: f64) -> Result<()> {
        let frame = FrameBuilder::tpms_single(device_id, position, pressure_kpa, 35.0);
        self.send_frame(device_id, frame)
    }

    /// Frame environnementale complète (température, humidité, pression
    /// ambiante, batterie, RSSI)
    pub fn send_environmental(
        &self,
        device_id: &str,
        temperature_c: f64,
        humidity_pct: f64,
    ) -> Result<()> {
        let frame = FrameBuilder::environmental(device_id, temperature_c, humidity_pct, 1013.2);
        self.send_frame(device_id, frame)
    }

    /// Frames émises par un device depuis le début du test
    pub fn frames_sent(&self, device_id: &str) -> Vec<Value> {
        self.journal
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Devices ayant émis au moins une frame
    pub fn devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.journal.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn total_frames(&self) -> usize {
        self.journal.lock().unwrap().values().map(Vec::len).sum()
    }

    /// Assert qu'un champ de la dernière frame émise par un device a une
    /// valeur donnée (chemin pointé : "sensors.humidity")
    pub fn assert_field_equals(
        &self,
        device_id: &str,
        field_path: &str,
        expected: &Value,
    ) -> Result<()> {
        let frames = self.frames_sent(device_id);
        let Some(last) = frames.last() else {
            anyhow::bail!("device {} emitted no frames", device_id);
        };
        match get_nested_field(last, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "field '{}' mismatch for {}: expected {:?}, got {:?}",
                field_path, device_id, expected, actual
            ),
            None => anyhow::bail!(
                "field '{}' not found in last frame of {}",
                field_path, device_id
            ),
        }
    }

    /// Reset pour un nouveau test
    pub fn reset(&mut self) {
        self.journal.lock().unwrap().clear();
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}
