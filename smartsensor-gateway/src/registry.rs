/**
 * DEVICE REGISTRY - Registre autoritaire des devices connus
 *
 * RÔLE :
 * Map en mémoire device_id -> Device : credentials, last-seen, santé.
 * Seul écrivain de l'état device ; les autres composants consomment des
 * snapshots immuables (DeviceView).
 *
 * FONCTIONNEMENT :
 * - Shardé par hash du device_id pour borner la contention (RwLock par
 *   shard, lectures en copie)
 * - resolve() applique la politique device-inconnu : reject /
 *   auto_provision / quarantine
 * - touch() roule la fenêtre de qualité et recalcule le health score
 * - Éviction TTL périodique des devices muets
 *
 * UTILITÉ DANS SMARTSENSOR :
 * 🎯 Le health score est une fonction PURE de la fenêtre : même entrée,
 *    même score, testable sans horloge ni effets de bord
 */

use crate::config::{RegistryConf, UnknownDevicePolicy};
use crate::models::{Device, DeviceKind, DeviceView, Quality};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Taille de la fenêtre de qualité roulante par device
const HEALTH_WINDOW: usize = 32;

/// Issue d'une résolution d'identité device
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Device connu (ou accepté par la politique), snapshot joint
    Known(DeviceView),
    /// Device inconnu et politique = reject
    Unknown,
    /// Credentials présentés ne correspondent pas au fingerprint enregistré
    AuthFailed,
}

/// Échantillon de qualité observé pour une frame (entrée de touch)
#[derive(Debug, Clone, Copy)]
pub struct QualitySample {
    pub quality: Quality,
    pub battery_v: Option<f64>,
}

struct DeviceSlot {
    device: Device,
    window: VecDeque<Quality>,
    last_battery_v: Option<f64>,
}

impl DeviceSlot {
    /// Vue avec le health score recalculé sur la fraîcheur RÉELLE.
    /// Le score stocké dans Device date de la dernière frame ; un device
    /// devenu muet doit voir sa composante fraîcheur décroître à chaque
    /// lecture, comme `stale`/`stale_for_seconds`.
    fn view(&self) -> DeviceView {
        let elapsed = (OffsetDateTime::now_utc() - self.device.last_seen_at)
            .whole_seconds()
            .max(0) as u64;
        let mut view = self.device.to_view();
        view.health_score = health_score(
            &self.window,
            elapsed,
            self.device.declared_cadence_secs,
            self.last_battery_v,
        );
        view
    }
}

struct Shard {
    devices: RwLock<HashMap<String, DeviceSlot>>,
}

pub struct DeviceRegistry {
    shards: Vec<Shard>,
    mask: usize,
    conf: RegistryConf,
}

/// SHA-256 hex d'un token : on ne stocke jamais le token en clair
pub fn fingerprint(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    format!("{:x}", h.finalize())
}

fn shard_index(device_id: &str, mask: usize) -> usize {
    let mut h = DefaultHasher::new();
    device_id.hash(&mut h);
    (h.finish() as usize) & mask
}

/// Score de santé [0,100], fonction pure de ses entrées.
///
/// Pondération : 50% fraction de frames Good dans la fenêtre, 30%
/// fraîcheur (âge de la dernière frame rapporté à la cadence déclarée),
/// 20% bande de tension batterie.
pub fn health_score(
    window: &VecDeque<Quality>,
    seconds_since_last: u64,
    declared_cadence_secs: u64,
    battery_v: Option<f64>,
) -> u8 {
    let quality_part = if window.is_empty() {
        0.5
    } else {
        let good = window.iter().filter(|q| **q == Quality::Good).count();
        good as f64 / window.len() as f64
    };

    let cadence = declared_cadence_secs.max(1) as f64;
    let staleness = seconds_since_last as f64 / cadence;
    // à jour => 1.0, dégradation linéaire, nul au-delà de 10 cadences
    let freshness_part = (1.0 - staleness / 10.0).clamp(0.0, 1.0);

    let battery_part = match battery_v {
        Some(v) if v >= 3.5 => 1.0,
        Some(v) if v >= 3.2 => 0.7,
        Some(v) if v >= 2.8 => 0.4,
        Some(_) => 0.1,
        None => 0.8,
    };

    let score = 100.0 * (0.5 * quality_part + 0.3 * freshness_part + 0.2 * battery_part);
    score.round().clamp(0.0, 100.0) as u8
}

impl DeviceRegistry {
    pub fn new(conf: RegistryConf) -> Self {
        let count = conf.shards.next_power_of_two().max(1);
        let shards = (0..count)
            .map(|_| Shard { devices: RwLock::new(HashMap::new()) })
            .collect();
        Self { shards, mask: count - 1, conf }
    }

    fn shard(&self, device_id: &str) -> &Shard {
        &self.shards[shard_index(device_id, self.mask)]
    }

    /// Résout l'identité d'un device à l'ingestion.
    ///
    /// `credentials` est le token présenté (HTTP) ou None (MQTT, où
    /// l'authentification device est déléguée au broker).
    pub fn resolve(&self, device_id: &str, credentials: Option<&str>) -> Resolution {
        let shard = self.shard(device_id);

        {
            let guard = shard.devices.read();
            if let Some(slot) = guard.get(device_id) {
                if let (Some(token), Some(fp)) =
                    (credentials, slot.device.credentials_fingerprint.as_deref())
                {
                    if fingerprint(token) != fp {
                        return Resolution::AuthFailed;
                    }
                }
                return Resolution::Known(slot.view());
            }
        }

        match self.conf.unknown_device_policy {
            UnknownDevicePolicy::Reject => Resolution::Unknown,
            UnknownDevicePolicy::AutoProvision => {
                Resolution::Known(self.provision(device_id, credentials, false))
            }
            UnknownDevicePolicy::Quarantine => {
                Resolution::Known(self.provision(device_id, credentials, true))
            }
        }
    }

    fn provision(&self, device_id: &str, credentials: Option<&str>, quarantined: bool) -> DeviceView {
        let now = OffsetDateTime::now_utc();
        let device = Device {
            device_id: device_id.to_string(),
            kind: DeviceKind::Unknown,
            credentials_fingerprint: credentials.map(fingerprint),
            known_since: now,
            last_seen_at: now,
            firmware_version: None,
            health_score: 50,
            declared_cadence_secs: self.conf.default_cadence_secs,
            quarantined,
        };
        let mut guard = self.shard(device_id).devices.write();
        let slot = guard.entry(device_id.to_string()).or_insert_with(|| {
            info!("[registry] provisioned device {} (quarantined: {})", device_id, quarantined);
            DeviceSlot { device, window: VecDeque::new(), last_battery_v: None }
        });
        slot.view()
    }

    /// Provisioning explicite par l'API admin
    pub fn provision_admin(&self, device_id: &str, kind: DeviceKind, cadence_secs: Option<u64>) -> DeviceView {
        let now = OffsetDateTime::now_utc();
        let device = Device {
            device_id: device_id.to_string(),
            kind,
            credentials_fingerprint: None,
            known_since: now,
            last_seen_at: now,
            firmware_version: None,
            health_score: 50,
            declared_cadence_secs: cadence_secs.unwrap_or(self.conf.default_cadence_secs),
            quarantined: false,
        };
        let slot = DeviceSlot { device, window: VecDeque::new(), last_battery_v: None };
        let view = slot.view();
        self.shard(device_id)
            .devices
            .write()
            .insert(device_id.to_string(), slot);
        info!("[registry] admin provisioned device {}", device_id);
        view
    }

    /// Met à jour last-seen + fenêtre de qualité + health score.
    /// Appelé par le pipeline une fois par frame traitée.
    pub fn touch(&self, device_id: &str, ingest_timestamp: OffsetDateTime, sample: QualitySample, firmware: Option<&str>) {
        let mut guard = self.shard(device_id).devices.write();
        let Some(slot) = guard.get_mut(device_id) else { return };

        slot.device.last_seen_at = ingest_timestamp;
        if let Some(fw) = firmware {
            slot.device.firmware_version = Some(fw.to_string());
        }
        if slot.window.len() >= HEALTH_WINDOW {
            slot.window.pop_front();
        }
        slot.window.push_back(sample.quality);
        if sample.battery_v.is_some() {
            slot.last_battery_v = sample.battery_v;
        }

        // score enregistré au moment de la frame ; les vues servies par
        // snapshot()/list() recalculent avec la fraîcheur courante
        slot.device.health_score = health_score(
            &slot.window,
            0,
            slot.device.declared_cadence_secs,
            slot.last_battery_v,
        );
    }

    /// Snapshot immuable d'un device pour les autres composants.
    /// Le health score y est recalculé sur l'âge réel de la dernière frame.
    pub fn snapshot(&self, device_id: &str) -> Option<DeviceView> {
        self.shard(device_id)
            .devices
            .read()
            .get(device_id)
            .map(|s| s.view())
    }

    /// Liste tous les devices (API admin)
    pub fn list(&self) -> Vec<DeviceView> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.devices.read();
            out.extend(guard.values().map(|s| s.view()));
        }
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.devices.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Éviction explicite (API admin)
    pub fn evict(&self, device_id: &str) -> bool {
        let removed = self.shard(device_id).devices.write().remove(device_id).is_some();
        if removed {
            info!("[registry] evicted device {}", device_id);
        }
        removed
    }

    /// Sort un device de quarantaine (confirmation opérateur)
    pub fn confirm(&self, device_id: &str, kind: DeviceKind) -> bool {
        let mut guard = self.shard(device_id).devices.write();
        match guard.get_mut(device_id) {
            Some(slot) => {
                slot.device.quarantined = false;
                slot.device.kind = kind;
                true
            }
            None => false,
        }
    }

    /// Supprime les devices muets depuis plus de idle_ttl. Retourne le
    /// nombre d'évictions (le sweep périodique est spawné par le superviseur).
    pub fn evict_idle(&self) -> usize {
        let cutoff = OffsetDateTime::now_utc() - Duration::seconds(self.conf.idle_ttl_secs as i64);
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.devices.write();
            guard.retain(|device_id, slot| {
                if slot.device.last_seen_at < cutoff {
                    debug!("[registry] TTL eviction of {}", device_id);
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        }
        if removed > 0 {
            info!("[registry] evicted {} idle devices", removed);
        }
        removed
    }
}

pub type SharedRegistry = Arc<DeviceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConf;

    fn conf(policy: UnknownDevicePolicy) -> RegistryConf {
        RegistryConf { unknown_device_policy: policy, ..RegistryConf::default() }
    }

    fn good_sample() -> QualitySample {
        QualitySample { quality: Quality::Good, battery_v: Some(3.7) }
    }

    #[test]
    fn auto_provision_creates_unknown_kind() {
        let reg = DeviceRegistry::new(conf(UnknownDevicePolicy::AutoProvision));
        match reg.resolve("HK_000001", None) {
            Resolution::Known(view) => {
                assert_eq!(view.kind, DeviceKind::Unknown);
                assert!(!view.quarantined);
            }
            other => panic!("expected Known, got {:?}", other),
        }
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reject_policy_returns_unknown() {
        let reg = DeviceRegistry::new(conf(UnknownDevicePolicy::Reject));
        assert!(matches!(reg.resolve("HK_000001", None), Resolution::Unknown));
        assert!(reg.is_empty());
    }

    #[test]
    fn quarantine_policy_marks_device() {
        let reg = DeviceRegistry::new(conf(UnknownDevicePolicy::Quarantine));
        match reg.resolve("HK_000001", None) {
            Resolution::Known(view) => assert!(view.quarantined),
            other => panic!("expected Known, got {:?}", other),
        }
        assert!(reg.confirm("HK_000001", DeviceKind::Tpms));
        assert!(!reg.snapshot("HK_000001").unwrap().quarantined);
    }

    #[test]
    fn credential_mismatch_fails_auth() {
        let reg = DeviceRegistry::new(conf(UnknownDevicePolicy::AutoProvision));
        // premier ingest : fingerprint enregistré
        assert!(matches!(
            reg.resolve("HK_000002", Some("secret-a")),
            Resolution::Known(_)
        ));
        // même token : ok ; autre token : refus
        assert!(matches!(
            reg.resolve("HK_000002", Some("secret-a")),
            Resolution::Known(_)
        ));
        assert!(matches!(
            reg.resolve("HK_000002", Some("secret-b")),
            Resolution::AuthFailed
        ));
    }

    #[test]
    fn touch_rolls_window_and_updates_score() {
        let reg = DeviceRegistry::new(conf(UnknownDevicePolicy::AutoProvision));
        reg.resolve("HK_000003", None);
        let now = OffsetDateTime::now_utc();
        for _ in 0..10 {
            reg.touch("HK_000003", now, good_sample(), Some("2.1.0"));
        }
        let view = reg.snapshot("HK_000003").unwrap();
        assert_eq!(view.firmware_version.as_deref(), Some("2.1.0"));
        // fenêtre 100% good, frais, batterie saine => score maximal
        assert_eq!(view.health_score, 100);
    }

    #[test]
    fn health_score_is_pure() {
        let window: VecDeque<Quality> =
            [Quality::Good, Quality::Good, Quality::Suspect, Quality::Invalid]
                .into_iter()
                .collect();
        let a = health_score(&window, 45, 30, Some(3.3));
        let b = health_score(&window, 45, 30, Some(3.3));
        assert_eq!(a, b, "same inputs, same score");
    }

    #[test]
    fn health_score_degrades_with_staleness_and_battery() {
        let window: VecDeque<Quality> = std::iter::repeat(Quality::Good).take(32).collect();
        let fresh = health_score(&window, 0, 30, Some(3.7));
        let stale = health_score(&window, 300, 30, Some(3.7));
        let dead_battery = health_score(&window, 0, 30, Some(2.0));
        assert!(fresh > stale);
        assert!(fresh > dead_battery);
    }

    #[test]
    fn snapshot_score_decays_while_device_is_silent() {
        // deux devices à l'historique identique ; B a reçu sa dernière
        // frame il y a 300s (10 cadences) : sa composante fraîcheur doit
        // être à zéro au moment de la LECTURE, pas figée au dernier touch
        let reg = DeviceRegistry::new(conf(UnknownDevicePolicy::AutoProvision));
        reg.resolve("HK_00000A", None);
        reg.resolve("HK_00000B", None);
        let now = OffsetDateTime::now_utc();
        for _ in 0..10 {
            reg.touch("HK_00000A", now, good_sample(), None);
            reg.touch("HK_00000B", now - Duration::seconds(300), good_sample(), None);
        }

        let fresh = reg.snapshot("HK_00000A").unwrap().health_score;
        let silent = reg.snapshot("HK_00000B").unwrap().health_score;
        assert_eq!(fresh, 100);
        // 50% qualité + 20% batterie restent, les 30% de fraîcheur sont perdus
        assert_eq!(silent, 70);
        assert!(reg.snapshot("HK_00000B").unwrap().stale);
    }

    #[test]
    fn evict_and_ttl() {
        let mut c = conf(UnknownDevicePolicy::AutoProvision);
        c.idle_ttl_secs = 0; // tout device déjà vu est immédiatement périmé
        let reg = DeviceRegistry::new(c);
        reg.resolve("HK_000004", None);
        reg.touch(
            "HK_000004",
            OffsetDateTime::now_utc() - Duration::seconds(5),
            good_sample(),
            None,
        );
        assert_eq!(reg.evict_idle(), 1);
        assert!(reg.snapshot("HK_000004").is_none());
        assert!(!reg.evict("HK_000004"), "already gone");
    }
}
