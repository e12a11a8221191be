use crate::config::MqttConf;
use crate::metrics::GatewayMetrics;
use crate::registry::SharedRegistry;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;
use tracing::{debug, warn};

/// Résumé de santé publié sur MQTT et servi par /healthz
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub uptime_seconds: u64,
    pub devices_tracked: u32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub wab_depth: i64,
    pub subscribers_connected: i64,
    pub shutting_down: bool,
}

/// Suivi de l'état de santé de la gateway elle-même.
/// Clonable : partagé entre l'ingest MQTT, le serveur HTTP et le publisher.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_connected: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_connected: Arc::new(AtomicBool::new(false)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        self.mqtt_connected.store(true, Ordering::Relaxed);
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    /// Passe en mode shutdown : /healthz cesse de répondre OK
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, registry: &SharedRegistry, metrics: &GatewayMetrics) -> GatewayHealth {
        GatewayHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_tracked: registry.len() as u32,
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            wab_depth: metrics.durable_wab_depth.load(Ordering::Relaxed),
            subscribers_connected: metrics.subscribers_connected.load(Ordering::Relaxed),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Démarre la publication auto du résumé de santé sur
    /// `<topic_root>/gateway/health`, toutes les 30s
    pub fn spawn_health_publisher(
        &self,
        mqtt_conf: MqttConf,
        registry: SharedRegistry,
        metrics: Arc<GatewayMetrics>,
    ) -> task::JoinHandle<()> {
        let health_tracker = self.clone();

        task::spawn(async move {
            let (host, port) = match parse_endpoint(mqtt_conf.brokers.first()) {
                Some(hp) => hp,
                None => {
                    warn!("[health] no broker endpoint, health publisher disabled");
                    return;
                }
            };

            let client_id = format!("{}-health", mqtt_conf.client_id);
            let mut opts = MqttOptions::new(client_id, host, port);
            opts.set_keep_alive(Duration::from_secs(mqtt_conf.keepalive_secs));
            if let (Some(user), Some(pass)) = (&mqtt_conf.username, &mqtt_conf.password) {
                opts.set_credentials(user.clone(), pass.clone());
            }

            let (client, mut eventloop) = AsyncClient::new(opts, 10);
            let topic = format!("{}/gateway/health", mqtt_conf.topic_root);
            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if health_tracker.is_shutting_down() {
                            return;
                        }
                        let health = health_tracker.get_health(&registry, &metrics);
                        if let Ok(payload) = serde_json::to_string(&health) {
                            if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                                warn!("[health] failed to publish: {:?}", e);
                            } else {
                                debug!("[health] published gateway health (uptime: {}s, devices: {})",
                                    health.uptime_seconds, health.devices_tracked);
                            }
                        }
                    },
                    event = eventloop.poll() => {
                        match event {
                            Ok(_) => {},
                            Err(e) => {
                                debug!("[health] MQTT error on health session: {:?}", e);
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                        }
                    }
                }
            }
        })
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// "host:port" -> (host, port)
pub fn parse_endpoint(endpoint: Option<&String>) -> Option<(String, u16)> {
    let endpoint = endpoint?;
    let mut parts = endpoint.rsplitn(2, ':');
    let port = parts.next()?.parse::<u16>().ok()?;
    let host = parts.next()?.to_string();
    Some((host, port))
}
