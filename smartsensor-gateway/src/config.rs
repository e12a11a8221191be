/**
 * CONFIGURATION GATEWAY - Chargement et gestion des paramètres SmartSensor
 *
 * RÔLE :
 * Ce module gère la configuration centralisée de la gateway depuis un fichier
 * YAML. Il couvre l'ingestion (MQTT + HTTP), le pipeline, le sink durable,
 * les abonnés WebSocket, les alertes, la sécurité et le shutdown.
 *
 * FONCTIONNEMENT :
 * - Lecture de gateway.yaml (ou variable SMARTSENSOR_GATEWAY_CONFIG)
 * - Parsing YAML -> structures typées avec serde
 * - Fallback vers configuration par défaut si fichier absent/invalide
 * - validate() fail-fast au démarrage : une config incohérente ne doit
 *   jamais produire une erreur en cours de run
 *
 * EXEMPLE GATEWAY.YAML :
 * ```yaml
 * ingest:
 *   mqtt:
 *     brokers: ["broker-a:1883", "broker-b:1883"]
 *     topic_root: "smartsensor"
 *     qos: 1
 *   http:
 *     bind: "0.0.0.0:8080"
 * pipeline:
 *   shards: 64
 * durable:
 *   wab_capacity: 1000000
 * ```
 */

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Erreurs de configuration détectées au démarrage (fail-fast)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pipeline.shards must be a power of two, got {0}")]
    ShardsNotPowerOfTwo(usize),
    #[error("ingest.mqtt.brokers must not be empty when MQTT ingest is enabled")]
    NoBrokers,
    #[error("broker endpoint '{0}' is not host:port")]
    BadBroker(String),
    #[error("ingest.mqtt.qos must be 0, 1 or 2, got {0}")]
    BadQos(u8),
    #[error("durable.batch_size must be > 0")]
    ZeroBatch,
    #[error("durable.wab_capacity must be >= durable.batch_size")]
    WabTooSmall,
    #[error("subscribers.drop_policy must be slow_drop or disconnect")]
    BadDropPolicy,
}

/// Configuration principale de la gateway
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub ingest: IngestConf,
    #[serde(default)]
    pub pipeline: PipelineConf,
    #[serde(default)]
    pub durable: DurableConf,
    #[serde(default)]
    pub subscribers: SubscribersConf,
    #[serde(default)]
    pub alerts: AlertsConf,
    #[serde(default)]
    pub security: SecurityConf,
    #[serde(default)]
    pub registry: RegistryConf,
    #[serde(default)]
    pub admission: AdmissionConf,
    #[serde(default)]
    pub shutdown: ShutdownConf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConf {
    #[serde(default)]
    pub mqtt: MqttConf,
    #[serde(default)]
    pub http: HttpConf,
}

/// Connexion au broker MQTT amont (la gateway est un *client* du broker)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConf {
    /// Endpoints "host:port", essayés en round-robin au reconnect
    pub brokers: Vec<String>,
    /// Racine des topics : on s'abonne à `<topic_root>/devices/+/data`
    pub topic_root: String,
    pub client_id: String,
    /// QoS d'abonnement : 0/1/2, 1 minimum recommandé (at-least-once)
    pub qos: u8,
    pub keepalive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Désactive complètement l'ingest MQTT (dev/tests HTTP uniquement)
    #[serde(default)]
    pub disabled: bool,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:1883".into()],
            topic_root: "smartsensor".into(),
            client_id: "smartsensor-gateway".into(),
            qos: 1,
            keepalive_secs: 15,
            username: None,
            password: None,
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConf {
    /// Adresse d'écoute du serveur HTTP (ingest + stream + admin + probes)
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConf {
    /// Nombre de shards (puissance de deux, une lane single-writer chacun)
    pub shards: usize,
    /// Profondeur de la file FIFO de chaque shard
    pub device_queue: usize,
    /// Durée d'inactivité avant destruction d'une Session
    pub session_idle_secs: u64,
}

impl Default for PipelineConf {
    fn default() -> Self {
        Self { shards: 64, device_queue: 256, session_idle_secs: 600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableConf {
    /// URL Postgres du store ; absente => store no-op (dev)
    pub url: Option<String>,
    /// Flush dès que le batch atteint cette taille...
    pub batch_size: usize,
    /// ...ou dès que le plus vieux élément du batch atteint cet âge
    pub batch_age_ms: u64,
    /// Capacité du write-ahead buffer en mémoire
    pub wab_capacity: usize,
    pub retry_backoff_min_ms: u64,
    pub retry_backoff_max_ms: u64,
}

impl Default for DurableConf {
    fn default() -> Self {
        Self {
            url: None,
            batch_size: 1_000,
            batch_age_ms: 500,
            wab_capacity: 1_000_000,
            retry_backoff_min_ms: 100,
            retry_backoff_max_ms: 30_000,
        }
    }
}

/// Politique appliquée quand l'outbox d'un abonné est pleine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Jette la frame la plus ancienne non livrée, incrémente un compteur
    SlowDrop,
    /// Ferme la socket avec raison "subscriber too slow"
    Disconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribersConf {
    pub outbox_capacity: usize,
    pub drop_policy: DropPolicy,
    pub heartbeat_interval_secs: u64,
    /// Pong manquant au-delà de ce délai => fermeture de la socket
    pub pong_timeout_secs: u64,
}

impl Default for SubscribersConf {
    fn default() -> Self {
        Self {
            outbox_capacity: 1024,
            drop_policy: DropPolicy::SlowDrop,
            heartbeat_interval_secs: 15,
            pong_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConf {
    /// Fichier YAML des règles déclaratives
    pub rules_path: String,
    /// Hystérésis de résolution par défaut si la règle n'en précise pas
    pub hold_down_default_secs: u64,
    /// Ré-émission périodique d'une alerte qui reste en Firing
    pub max_reminder_interval_secs: u64,
    /// Fenêtre pendant laquelle une réouverture réutilise le même alert_id
    pub dedup_window_secs: u64,
    /// Webhook de dispatch ; absent => sink log (dev)
    pub webhook_url: Option<String>,
    /// Tentatives de dispatch avant dead-letter
    pub dispatch_attempts: u32,
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self {
            rules_path: "alert-rules.yaml".into(),
            hold_down_default_secs: 60,
            max_reminder_interval_secs: 3600,
            dedup_window_secs: 300,
            webhook_url: None,
            dispatch_attempts: 5,
        }
    }
}

/// Rôle d'un porteur de token HTTP/WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Accès complet : admin API, filtre d'abonnement sans restriction
    Admin,
    /// Device : peut poster sur /v1/ingest pour son tenant
    Device,
    /// Dashboard : peut s'abonner au stream, borné à son tenant
    Dashboard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConf {
    pub token: String,
    /// Préfixe de device_id du tenant (ex : "HK")
    pub tenant: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConf {
    #[serde(default)]
    pub http_auth: HttpAuthConf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpAuthConf {
    #[serde(default)]
    pub tokens: Vec<TokenConf>,
}

/// Identité résolue d'un porteur de token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub tenant: String,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl SecurityConf {
    /// Résout un bearer token vers son principal. None = token inconnu.
    pub fn principal_for(&self, token: &str) -> Option<Principal> {
        self.http_auth
            .tokens
            .iter()
            .find(|t| t.token == token)
            .map(|t| Principal { tenant: t.tenant.clone(), role: t.role })
    }
}

/// Politique pour un device inconnu du registre
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownDevicePolicy {
    Reject,
    AutoProvision,
    Quarantine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConf {
    pub unknown_device_policy: UnknownDevicePolicy,
    /// Éviction TTL : device sans frame depuis cette durée
    pub idle_ttl_secs: u64,
    /// Cadence supposée pour un device qui ne la déclare pas
    pub default_cadence_secs: u64,
    /// Nombre de shards internes du registre
    pub shards: usize,
}

impl Default for RegistryConf {
    fn default() -> Self {
        Self {
            unknown_device_policy: UnknownDevicePolicy::AutoProvision,
            idle_ttl_secs: 7 * 24 * 3600,
            default_cadence_secs: 30,
            shards: 16,
        }
    }
}

/// Token buckets d'admission (anti-flood par device et par IP source)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConf {
    pub device_rate_per_sec: f64,
    pub device_burst: f64,
    pub ip_rate_per_sec: f64,
    pub ip_burst: f64,
}

impl Default for AdmissionConf {
    fn default() -> Self {
        Self {
            device_rate_per_sec: 10.0,
            device_burst: 30.0,
            ip_rate_per_sec: 200.0,
            ip_burst: 500.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConf {
    /// Temps maximum accordé au flush du WAB pendant le drain
    pub drain_deadline_secs: u64,
}

impl Default for ShutdownConf {
    fn default() -> Self {
        Self { drain_deadline_secs: 30 }
    }
}

impl GatewayConfig {
    /// Vérifications fail-fast : tout problème ici empêche le démarrage,
    /// jamais une erreur en cours de run (cf. politique d'erreurs Fatal)
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.pipeline.shards.is_power_of_two() {
            return Err(ConfigError::ShardsNotPowerOfTwo(self.pipeline.shards));
        }
        if !self.ingest.mqtt.disabled {
            if self.ingest.mqtt.brokers.is_empty() {
                return Err(ConfigError::NoBrokers);
            }
            for b in &self.ingest.mqtt.brokers {
                let mut parts = b.rsplitn(2, ':');
                let port_ok = parts
                    .next()
                    .map(|p| p.parse::<u16>().is_ok())
                    .unwrap_or(false);
                if !port_ok || parts.next().is_none() {
                    return Err(ConfigError::BadBroker(b.clone()));
                }
            }
        }
        if self.ingest.mqtt.qos > 2 {
            return Err(ConfigError::BadQos(self.ingest.mqtt.qos));
        }
        if self.durable.batch_size == 0 {
            return Err(ConfigError::ZeroBatch);
        }
        if self.durable.wab_capacity < self.durable.batch_size {
            return Err(ConfigError::WabTooSmall);
        }
        Ok(())
    }
}

/// Charge la configuration depuis le fichier YAML.
/// Gère les erreurs gracieusement avec fallback vers config par défaut ;
/// la validation fail-fast se fait ensuite dans main.
pub async fn load_config() -> GatewayConfig {
    let path = std::env::var("SMARTSENSOR_GATEWAY_CONFIG")
        .unwrap_or_else(|_| "gateway.yaml".into());

    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return GatewayConfig::default();
        }

        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            eprintln!("[config] YAML invalide dans {}: {}", path, e);
            eprintln!("[config] utilisation de la config par défaut");
            GatewayConfig::default()
        })
    } else {
        eprintln!("[config] fichier {} non trouvé, config par défaut", path);
        GatewayConfig::default()
    }
}
