/**
 * CODEC - Décodage et validation des payloads device
 *
 * RÔLE :
 * Seul point du système qui connaît le format wire des frames. Transforme
 * un payload JSON (MQTT ou HTTP, même forme) en Readings normalisées, et
 * sérialise la forme canonique poussée aux abonnés WebSocket.
 *
 * FONCTIONNEMENT :
 * - Une frame = device_id + timestamp + objet `sensors`
 * - Chaque clé capteur reconnue devient une Reading typée ; les clés
 *   inconnues sont conservées en `SensorKind::Unknown` quality=suspect
 *   (forward compatibility, jamais de drop silencieux)
 * - Table de bornes par capteur : hors bornes => quality=invalid, valeur
 *   d'origine conservée pour audit
 * - Ne panique jamais sur une entrée malformée : DecodeError typée
 *
 * UTILITÉ DANS SMARTSENSOR :
 * 🎯 La table de validation vit ICI et nulle part ailleurs : firmware et
 *    dashboards consomment la forme canonique, ils ne re-valident pas
 */

use crate::models::{Quality, Reading, SensorKind, TirePosition};
use serde::Deserialize;
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Dérive de clock maximale tolérée entre device et serveur (défaut 24h).
/// Au-delà, les Readings de la frame passent en quality=invalid.
pub const MAX_CLOCK_SKEW: Duration = Duration::hours(24);

/// Erreur de décodage typée. Jamais de panic sur entrée malformée.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON at line {line}, column {column}: {message}")]
    Json {
        line: usize,
        column: usize,
        message: String,
    },
    #[error("frame has no device_id")]
    MissingDeviceId,
    #[error("unparseable timestamp '{0}'")]
    BadTimestamp(String),
}

/// Frame décodée : l'enveloppe + les Readings qu'elle contenait
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub device_id: String,
    pub firmware: Option<String>,
    pub device_timestamp: OffsetDateTime,
    /// true si le timestamp device dépasse MAX_CLOCK_SKEW
    pub skewed: bool,
    pub readings: Vec<Reading>,
}

// ===== Format wire (les clés inconnues au niveau frame sont ignorées) =====

#[derive(Debug, Deserialize)]
struct WireFrame {
    device_id: Option<String>,
    timestamp: Option<String>,
    firmware: Option<String>,
    #[serde(default)]
    sensors: WireSensors,
}

#[derive(Debug, Default, Deserialize)]
struct WireSensors {
    temperature: Option<f64>,
    humidity: Option<f64>,
    /// Pression barométrique ambiante, hPa
    pressure: Option<f64>,
    battery_v: Option<f64>,
    rssi: Option<f64>,
    light: Option<f64>,
    accel: Option<f64>,
    #[serde(default)]
    tires: Vec<WireTire>,
    /// Capteurs non reconnus : conservés, pas supprimés
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireTire {
    position: String,
    pressure_kpa: Option<f64>,
    temperature_c: Option<f64>,
}

// ===== Table de bornes =====

/// Bornes de validité par (kind, position pneu ou non).
/// None = pas de borne connue (capteurs Unknown notamment).
pub fn valid_range(kind: SensorKind, position: TirePosition) -> Option<(f64, f64)> {
    let tire = position != TirePosition::None;
    match kind {
        // pression pneu en kPa, pression ambiante en hPa
        SensorKind::Pressure if tire => Some((0.0, 600.0)),
        SensorKind::Pressure => Some((800.0, 1200.0)),
        // température pneu vs ambiante
        SensorKind::Temperature if tire => Some((-40.0, 120.0)),
        SensorKind::Temperature => Some((-40.0, 85.0)),
        SensorKind::Humidity => Some((0.0, 100.0)),
        SensorKind::Battery => Some((0.0, 5.0)),
        SensorKind::Accel => Some((0.0, 5.0)),
        SensorKind::Light => Some((0.0, 130_000.0)),
        // RSSI en dBm
        SensorKind::Composite => Some((-120.0, 0.0)),
        SensorKind::Unknown => None,
    }
}

/// Classe une valeur : hors bornes => Invalid, valeur conservée telle quelle
pub fn classify(kind: SensorKind, position: TirePosition, value: f64) -> Quality {
    if !value.is_finite() {
        return Quality::Invalid;
    }
    match valid_range(kind, position) {
        Some((lo, hi)) if value < lo || value > hi => Quality::Invalid,
        Some(_) => Quality::Good,
        None => Quality::Suspect,
    }
}

/// Décode une frame brute (payload MQTT ou élément d'un batch HTTP).
///
/// `now` est le timestamp d'ingestion serveur, appliqué à toutes les
/// Readings produites. Les frames sans timestamp device utilisent `now`
/// (les TPMS de première génération n'ont pas d'horloge).
pub fn decode_frame(payload: &[u8], now: OffsetDateTime) -> Result<DecodedFrame, DecodeError> {
    let frame: WireFrame = serde_json::from_slice(payload).map_err(|e| DecodeError::Json {
        line: e.line(),
        column: e.column(),
        message: e.to_string(),
    })?;

    let device_id = match frame.device_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(DecodeError::MissingDeviceId),
    };

    let device_timestamp = match &frame.timestamp {
        Some(ts) => OffsetDateTime::parse(ts, &Rfc3339)
            .map_err(|_| DecodeError::BadTimestamp(ts.clone()))?,
        None => now,
    };

    let skewed = (device_timestamp - now).abs() > MAX_CLOCK_SKEW;

    let mut readings = Vec::new();
    let mut push = |kind: SensorKind, position: TirePosition, value: f64, unit: &str, raw_key: Option<String>| {
        let mut quality = classify(kind, position, value);
        if skewed {
            quality = Quality::Invalid;
        }
        readings.push(Reading {
            device_id: device_id.clone(),
            sensor_kind: kind,
            position,
            value,
            unit: unit.to_string(),
            raw_key,
            device_timestamp,
            ingest_timestamp: now,
            quality,
        });
    };

    let s = frame.sensors;
    if let Some(v) = s.temperature {
        push(SensorKind::Temperature, TirePosition::None, v, "°C", None);
    }
    if let Some(v) = s.humidity {
        push(SensorKind::Humidity, TirePosition::None, v, "%", None);
    }
    if let Some(v) = s.pressure {
        push(SensorKind::Pressure, TirePosition::None, v, "hPa", None);
    }
    if let Some(v) = s.battery_v {
        push(SensorKind::Battery, TirePosition::None, v, "V", None);
    }
    if let Some(v) = s.rssi {
        push(SensorKind::Composite, TirePosition::None, v, "dBm", Some("rssi".into()));
    }
    if let Some(v) = s.light {
        push(SensorKind::Light, TirePosition::None, v, "lx", None);
    }
    if let Some(v) = s.accel {
        push(SensorKind::Accel, TirePosition::None, v, "g", None);
    }

    for tire in &s.tires {
        let position = match TirePosition::from_wire(&tire.position) {
            Some(p) => p,
            None => {
                // position inconnue : on garde les mesures, marquées suspectes
                if let Some(v) = tire.pressure_kpa {
                    push(SensorKind::Unknown, TirePosition::None, v, "kPa",
                         Some(format!("tires.{}.pressure_kpa", tire.position)));
                }
                continue;
            }
        };
        if let Some(v) = tire.pressure_kpa {
            push(SensorKind::Pressure, position, v, "kPa", None);
        }
        if let Some(v) = tire.temperature_c {
            push(SensorKind::Temperature, position, v, "°C", None);
        }
    }

    // capteurs non reconnus : Reading Unknown quality=suspect si numérique
    for (key, value) in &s.extra {
        if let Some(v) = value.as_f64() {
            push(SensorKind::Unknown, TirePosition::None, v, "", Some(key.clone()));
        }
    }

    Ok(DecodedFrame {
        device_id,
        firmware: frame.firmware,
        device_timestamp,
        skewed,
        readings,
    })
}

/// Politique quarantine : les mesures sont acceptées mais marquées
/// suspectes tant qu'un opérateur n'a pas confirmé le device
pub fn downgrade_quarantined(readings: &mut [Reading]) {
    for r in readings.iter_mut() {
        if r.quality == Quality::Good {
            r.quality = Quality::Suspect;
        }
    }
}

/// Forme canonique d'une Reading (stockage, audit, tests de round-trip)
pub fn encode_reading(reading: &Reading) -> String {
    // Reading ne contient que des types sérialisables sans état : to_string
    // ne peut pas échouer sur cette structure
    serde_json::to_string(reading).unwrap_or_default()
}

/// Frame poussée aux abonnés WebSocket : enveloppe {"type":"reading",...}.
/// Encodée UNE fois par broadcast, partagée par référence entre abonnés.
pub fn encode_stream_frame(reading: &Reading) -> String {
    let mut v = serde_json::to_value(reading).unwrap_or_default();
    if let Some(obj) = v.as_object_mut() {
        obj.insert("type".into(), serde_json::Value::String("reading".into()));
    }
    v.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn now() -> OffsetDateTime {
        datetime!(2024-01-26 14:31:00 UTC)
    }

    #[test]
    fn decodes_tpms_frame() {
        // scénario nominal : une frame TPMS avec un pneu avant-gauche
        let payload = br#"{"device_id":"HK_000001","timestamp":"2024-01-26T14:30:25Z",
            "sensors":{"tires":[{"position":"FL","pressure_kpa":220.0,"temperature_c":35.0}]}}"#;
        let frame = decode_frame(payload, now()).expect("decodes");

        assert_eq!(frame.device_id, "HK_000001");
        assert!(!frame.skewed);
        assert_eq!(frame.readings.len(), 2);

        let pressure = &frame.readings[0];
        assert_eq!(pressure.sensor_kind, SensorKind::Pressure);
        assert_eq!(pressure.position, TirePosition::FrontLeft);
        assert_eq!(pressure.value, 220.0);
        assert_eq!(pressure.unit, "kPa");
        assert_eq!(pressure.quality, Quality::Good);

        let temp = &frame.readings[1];
        assert_eq!(temp.sensor_kind, SensorKind::Temperature);
        assert_eq!(temp.quality, Quality::Good);
    }

    #[test]
    fn rejects_missing_device_id() {
        let payload = br#"{"timestamp":"2024-01-26T14:30:25Z","sensors":{"temperature":21.0}}"#;
        assert!(matches!(
            decode_frame(payload, now()),
            Err(DecodeError::MissingDeviceId)
        ));
    }

    #[test]
    fn malformed_json_reports_position() {
        let payload = br#"{"device_id":"#;
        match decode_frame(payload, now()) {
            Err(DecodeError::Json { line, .. }) => assert!(line >= 1),
            other => panic!("expected Json error, got {:?}", other),
        }
    }

    #[test]
    fn out_of_range_is_invalid_but_kept() {
        // pression pneu 9999 kPa : stockée, auditée, quality=invalid
        let payload = br#"{"device_id":"HK_000001",
            "sensors":{"tires":[{"position":"FL","pressure_kpa":9999.0}]}}"#;
        let frame = decode_frame(payload, now()).unwrap();
        assert_eq!(frame.readings.len(), 1);
        assert_eq!(frame.readings[0].quality, Quality::Invalid);
        assert_eq!(frame.readings[0].value, 9999.0);
    }

    #[test]
    fn unknown_sensor_key_is_suspect_not_dropped() {
        let payload = br#"{"device_id":"HK_000002",
            "sensors":{"temperature":20.0,"vibration_hz":12.5}}"#;
        let frame = decode_frame(payload, now()).unwrap();
        let unknown = frame
            .readings
            .iter()
            .find(|r| r.sensor_kind == SensorKind::Unknown)
            .expect("unknown sensor preserved");
        assert_eq!(unknown.quality, Quality::Suspect);
        assert_eq!(unknown.raw_key.as_deref(), Some("vibration_hz"));
        assert_eq!(unknown.value, 12.5);
    }

    #[test]
    fn clock_skew_invalidates_readings() {
        let payload = br#"{"device_id":"HK_000003","timestamp":"2020-01-01T00:00:00Z",
            "sensors":{"temperature":20.0}}"#;
        let frame = decode_frame(payload, now()).unwrap();
        assert!(frame.skewed);
        assert_eq!(frame.readings[0].quality, Quality::Invalid);
    }

    #[test]
    fn unknown_top_level_keys_ignored() {
        let payload = br#"{"device_id":"HK_000004","extra_field":true,
            "sensors":{"humidity":60.1}}"#;
        let frame = decode_frame(payload, now()).unwrap();
        assert_eq!(frame.readings.len(), 1);
        assert_eq!(frame.readings[0].quality, Quality::Good);
    }

    #[test]
    fn ambient_ranges_differ_from_tire_ranges() {
        // 1013 hPa est une pression ambiante normale, pas une pression pneu
        assert_eq!(
            classify(SensorKind::Pressure, TirePosition::None, 1013.2),
            Quality::Good
        );
        assert_eq!(
            classify(SensorKind::Pressure, TirePosition::FrontLeft, 1013.2),
            Quality::Invalid
        );
        // 85.1°C ambiant dépasse la borne environnement, pas la borne pneu
        assert_eq!(
            classify(SensorKind::Temperature, TirePosition::None, 85.1),
            Quality::Invalid
        );
        assert_eq!(
            classify(SensorKind::Temperature, TirePosition::RearLeft, 85.1),
            Quality::Good
        );
        // la bande barométrique ambiante est 800-1200 hPa
        assert_eq!(
            classify(SensorKind::Pressure, TirePosition::None, 500.0),
            Quality::Invalid
        );
    }

    #[test]
    fn accel_is_bounded_to_five_g() {
        assert_eq!(classify(SensorKind::Accel, TirePosition::None, 2.5), Quality::Good);
        assert_eq!(classify(SensorKind::Accel, TirePosition::None, 6.0), Quality::Invalid);
    }

    #[test]
    fn canonical_roundtrip() {
        let payload = br#"{"device_id":"HK_000001","timestamp":"2024-01-26T14:30:25Z",
            "sensors":{"temperature":35.2,"humidity":60.1,"pressure":1013.2,
            "tires":[{"position":"FL","pressure_kpa":220.0,"temperature_c":35.0}],
            "battery_v":3.7,"rssi":-58.0}}"#;
        let frame = decode_frame(payload, now()).unwrap();
        for reading in &frame.readings {
            let encoded = encode_reading(reading);
            let back: Reading = serde_json::from_str(&encoded).expect("re-decodes");
            assert_eq!(&back, reading, "canonical form round-trips");
        }
    }

    #[test]
    fn stream_frame_is_tagged() {
        let payload = br#"{"device_id":"HK_000001","sensors":{"temperature":20.0}}"#;
        let frame = decode_frame(payload, now()).unwrap();
        let blob = encode_stream_frame(&frame.readings[0]);
        let v: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(v["type"], "reading");
        assert_eq!(v["device_id"], "HK_000001");
        assert_eq!(v["sensor_kind"], "temperature");
    }
}
