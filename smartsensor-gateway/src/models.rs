/**
 * MODÈLES DE DONNÉES - Structures centrales de la gateway SmartSensor
 *
 * RÔLE : Définit les structures partagées entre tous les modules.
 * Types principaux : Reading (mesure normalisée), Device (état registre),
 * Alert (cycle de vie des alertes), et les énumérations de classification.
 *
 * UTILITÉ : Cohérence des données, sérialisation JSON, typage fort.
 */

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Famille d'un device connu du registre
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Tpms,
    Environmental,
    Gateway,
    /// Device auto-provisionné, famille pas encore confirmée par un opérateur
    Unknown,
}

/// Nature d'une mesure. `Unknown` conserve les capteurs non reconnus
/// (forward compatibility : jamais supprimés, marqués suspects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Pressure,
    Temperature,
    Humidity,
    Battery,
    Accel,
    Light,
    Composite,
    Unknown,
}

impl SensorKind {
    /// Nom canonique snake_case (colonnes SQL, métriques)
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pressure => "pressure",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Battery => "battery",
            Self::Accel => "accel",
            Self::Light => "light",
            Self::Composite => "composite",
            Self::Unknown => "unknown",
        }
    }
}

/// Position pneu pour les mesures TPMS, `None` pour tout le reste
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TirePosition {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
    None,
}

impl TirePosition {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FrontLeft => "front_left",
            Self::FrontRight => "front_right",
            Self::RearLeft => "rear_left",
            Self::RearRight => "rear_right",
            Self::None => "none",
        }
    }
}

impl TirePosition {
    /// Décode la forme courte du firmware ("FL", "FR", "RL", "RR")
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "FL" => Some(Self::FrontLeft),
            "FR" => Some(Self::FrontRight),
            "RL" => Some(Self::RearLeft),
            "RR" => Some(Self::RearRight),
            _ => None,
        }
    }
}

/// Qualité d'une mesure après validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Suspect,
    Invalid,
}

impl Quality {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Suspect => "suspect",
            Self::Invalid => "invalid",
        }
    }
}

/// Mesure normalisée, immuable une fois acceptée par le pipeline.
/// Une frame device en produit une ou plusieurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub sensor_kind: SensorKind,
    pub position: TirePosition,
    pub value: f64,
    /// Unité canonique (kPa, hPa, °C, %, V, g, lx, dBm, m)
    pub unit: String,
    /// Clé d'origine du payload, conservée pour les capteurs `Unknown`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_key: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub device_timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ingest_timestamp: OffsetDateTime,
    pub quality: Quality,
}

/// État d'un device tel que maintenu par le registre.
/// Seul le registre mute cette structure.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: String,
    pub kind: DeviceKind,
    /// SHA-256 hex du bearer token présenté au premier ingest authentifié
    pub credentials_fingerprint: Option<String>,
    pub known_since: OffsetDateTime,
    pub last_seen_at: OffsetDateTime,
    pub firmware_version: Option<String>,
    pub health_score: u8,
    /// Cadence déclarée entre deux frames (sert au calcul de fraîcheur)
    pub declared_cadence_secs: u64,
    /// true tant qu'un opérateur n'a pas confirmé un device en quarantaine
    pub quarantined: bool,
}

/// Copie immuable d'un Device pour les autres composants et l'API
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub kind: DeviceKind,
    pub known_since: String,
    pub last_seen: String,
    pub stale: bool,
    pub stale_for_seconds: i64,
    pub firmware_version: Option<String>,
    pub health_score: u8,
    pub quarantined: bool,
}

impl Device {
    pub fn to_view(&self) -> DeviceView {
        use time::format_description::well_known::Rfc3339;
        let now = OffsetDateTime::now_utc();
        let age = now - self.last_seen_at;
        let secs = age.whole_seconds().max(0);
        DeviceView {
            device_id: self.device_id.clone(),
            kind: self.kind,
            known_since: self.known_since.format(&Rfc3339).unwrap_or_default(),
            last_seen: self.last_seen_at.format(&Rfc3339).unwrap_or_default(),
            stale: secs as u64 > self.declared_cadence_secs * 3,
            stale_for_seconds: secs,
            firmware_version: self.firmware_version.clone(),
            health_score: self.health_score,
            quarantined: self.quarantined,
        }
    }
}

/// Sévérité d'une alerte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// États du cycle de vie d'une alerte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Firing,
    Resolved,
    Silenced,
}

/// Alerte ouverte par le moteur de règles.
/// Unicité garantie par (device_id, rule_id) : au plus une en `Firing`.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub device_id: String,
    pub rule_id: String,
    pub severity: Severity,
    #[serde(with = "time::serde::rfc3339")]
    pub opened_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_at: Option<OffsetDateTime>,
    pub last_value: f64,
    pub threshold: f64,
    pub state: AlertState,
    /// "device" pour les alertes capteur, "gateway" pour l'auto-monitoring
    pub source: &'static str,
}
