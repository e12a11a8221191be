/*!
Builders de frames device au format wire de la gateway.

Produisent les payloads JSON publiés sur `<root>/devices/<id>/data`,
identiques à ce qu'émet le firmware (TPMS 4 roues, capteurs
environnementaux, batterie, RSSI).
*/

use serde_json::{json, Value};

/// Construit des frames device prêtes à publier (tests, simulateurs)
pub struct FrameBuilder;

impl FrameBuilder {
    /// Frame TPMS : un pneu, pression + température
    pub fn tpms_single<S: Into<String>>(
        device_id: S,
        position: &str,
        pressure_kpa: f64,
        temperature_c: f64,
    ) -> Value {
        json!({
            "device_id": device_id.into(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "sensors": {
                "tires": [
                    {"position": position, "pressure_kpa": pressure_kpa, "temperature_c": temperature_c}
                ]
            }
        })
    }

    /// Frame TPMS complète : les quatre roues
    pub fn tpms_full<S: Into<String>>(device_id: S, pressures_kpa: [f64; 4]) -> Value {
        let positions = ["FL", "FR", "RL", "RR"];
        let tires: Vec<Value> = positions
            .iter()
            .zip(pressures_kpa.iter())
            .map(|(pos, kpa)| json!({"position": pos, "pressure_kpa": kpa, "temperature_c": 35.0}))
            .collect();
        json!({
            "device_id": device_id.into(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "sensors": { "tires": tires }
        })
    }

    /// Frame environnementale : température, humidité, pression ambiante
    pub fn environmental<S: Into<String>>(
        device_id: S,
        temperature_c: f64,
        humidity_pct: f64,
        pressure_hpa: f64,
    ) -> Value {
        json!({
            "device_id": device_id.into(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "firmware": "2.1.0",
            "sensors": {
                "temperature": temperature_c,
                "humidity": humidity_pct,
                "pressure": pressure_hpa,
                "battery_v": 3.7,
                "rssi": -58
            }
        })
    }

    /// Message d'abonnement côté client WebSocket
    pub fn subscribe(devices: &[&str], kinds: &[&str]) -> Value {
        json!({
            "type": "subscribe",
            "filter": {
                "devices": devices,
                "kinds": kinds,
            }
        })
    }

    /// Topic de publication d'un device
    pub fn data_topic(root: &str, device_id: &str) -> String {
        format!("{}/devices/{}/data", root, device_id)
    }
}
