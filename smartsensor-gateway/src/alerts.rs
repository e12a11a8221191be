/**
 * ALERT ENGINE - Règles déclaratives, dédup et dispatch des alertes
 *
 * RÔLE :
 * Évalue chaque Reading contre les règles dont le scope matche le device,
 * maintient l'état glissant par (device, règle), ouvre/résout les alertes
 * et les remet au sink externe (webhook, log) en at-least-once.
 *
 * FONCTIONNEMENT :
 * - Prédicats v1 : threshold_above, threshold_below, rate_of_change,
 *   missing_data (deadline réarmée à chaque frame du kind surveillé)
 * - Dédup par (device_id, rule_id) : une seule alerte Firing à la fois,
 *   ré-émission seulement après résolution ou max_reminder_interval
 * - Résolution : prédicat continûment faux pendant hold_down
 * - Réouverture dans la fenêtre de dédup : même alert_id
 * - Dispatch : retry par alerte avec backoff, compteur dead-letter
 *
 * UTILITÉ DANS SMARTSENSOR :
 * 🎯 Le moteur tourne dans UNE task : l'ordre par device des Readings est
 *    préservé jusque dans l'évaluation des règles
 */

use crate::config::AlertsConf;
use crate::metrics::GatewayMetrics;
use crate::models::{Alert, AlertState, Reading, SensorKind, Severity};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ===== Règles =====

/// Prédicats supportés en v1
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    ThresholdAbove { kind: SensorKind, value: f64 },
    ThresholdBelow { kind: SensorKind, value: f64 },
    /// Pente |Δvaleur/Δt| en unités par minute, sur timestamps device
    RateOfChange { kind: SensorKind, delta_per_min: f64 },
    /// Aucune frame du kind depuis for_secs
    MissingData { kind: SensorKind, for_secs: f64 },
}

impl Predicate {
    fn kind(&self) -> SensorKind {
        match self {
            Self::ThresholdAbove { kind, .. }
            | Self::ThresholdBelow { kind, .. }
            | Self::RateOfChange { kind, .. }
            | Self::MissingData { kind, .. } => *kind,
        }
    }

    fn threshold(&self) -> f64 {
        match self {
            Self::ThresholdAbove { value, .. } | Self::ThresholdBelow { value, .. } => *value,
            Self::RateOfChange { delta_per_min, .. } => *delta_per_min,
            Self::MissingData { for_secs, .. } => *for_secs,
        }
    }
}

/// Ensemble de devices couverts par une règle : "*", préfixe "HK_*" ou ids
#[derive(Debug, Clone, Deserialize)]
pub struct Scope {
    pub devices: Vec<String>,
}

impl Scope {
    pub fn matches(&self, device_id: &str) -> bool {
        self.devices.iter().any(|d| {
            d == "*"
                || d == device_id
                || d.strip_suffix('*').map(|p| device_id.starts_with(p)).unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    pub predicate: Predicate,
    pub severity: Severity,
    /// Hystérésis de résolution ; défaut : alerts.hold_down_default_secs
    pub hold_down_secs: Option<f64>,
    pub scope: Scope,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("cannot read rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid rules YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RuleSet {
    /// Charge les règles. Fichier absent => ensemble vide (la gateway peut
    /// tourner sans règles) ; YAML invalide => erreur fatale au démarrage.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, RulesError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("[alerts] rules file {:?} not found, starting with no rules", path);
            return Ok(Self::default());
        }
        let txt = tokio::fs::read_to_string(path).await?;
        let set: RuleSet = serde_yaml::from_str(&txt)?;
        info!("[alerts] loaded {} rules from {:?}", set.rules.len(), path);
        Ok(set)
    }
}

// ===== Détection d'anomalies (seam pluggable) =====

/// Verdict d'un détecteur d'anomalies sur une Reading
#[derive(Debug, Clone)]
pub struct AnomalyVerdict {
    pub rule_id: String,
    pub severity: Severity,
    pub threshold: f64,
}

/// Point d'extension pour une détection d'anomalies (modèle externe).
/// Branché à côté des prédicats déclaratifs ; aucun modèle n'est livré ici.
pub trait AnomalyDetector: Send + Sync {
    fn inspect(&self, reading: &Reading) -> Option<AnomalyVerdict>;
    fn name(&self) -> &'static str;
}

// ===== Sink d'alertes =====

#[derive(Debug, thiserror::Error)]
pub enum AlertSinkError {
    #[error("alert sink unavailable: {0}")]
    Unavailable(String),
}

/// Contrat du transport d'alertes externe (email, chat, SMS...).
/// Le moteur garantit un handoff at-least-once avec retry + dead-letter.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertSinkError>;
    fn name(&self) -> &'static str;
}

/// Sink de dev/test : trace les alertes dans le log
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertSinkError> {
        warn!(
            "[alerts] {:?} {} rule={} device={} value={} threshold={}",
            alert.state, alert.alert_id, alert.rule_id, alert.device_id,
            alert.last_value, alert.threshold
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Dispatch HTTP vers un webhook (chat, pager...)
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self { client: reqwest::Client::new(), url }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertSinkError> {
        let resp = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| AlertSinkError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AlertSinkError::Unavailable(format!("http {}", resp.status())));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

// ===== Moteur =====

/// Alertes ouvertes, partagées avec l'API admin (GET /v1/alerts)
pub type OpenAlerts = Arc<RwLock<HashMap<(String, String), Alert>>>;

/// Poignée du moteur côté pipeline et superviseur
#[derive(Clone)]
pub struct AlertEngine {
    tx: mpsc::Sender<Reading>,
    dispatch_tx: mpsc::Sender<Alert>,
}

impl AlertEngine {
    /// Remet une Reading au moteur. Bounded-blocking : la file du moteur
    /// est courte et son traitement est rapide, l'attente est bornée.
    pub async fn offer(&self, reading: Reading) {
        // erreur possible uniquement pendant le shutdown : la Reading est
        // déjà durcie dans le WAB, on peut l'ignorer ici
        let _ = self.tx.send(reading).await;
    }

    /// Auto-alerte de la gateway elle-même (WAB saturé, drops élevés...),
    /// routée par le même sink avec source=gateway
    pub async fn raise_gateway(&self, rule_id: &str, severity: Severity, value: f64, threshold: f64) {
        let alert = Alert {
            alert_id: Uuid::new_v4(),
            device_id: "gateway".into(),
            rule_id: rule_id.into(),
            severity,
            opened_at: OffsetDateTime::now_utc(),
            closed_at: None,
            last_value: value,
            threshold,
            state: AlertState::Firing,
            source: "gateway",
        };
        let _ = self.dispatch_tx.send(alert).await;
    }
}

/// État glissant par (device_id, rule_id)
#[derive(Default)]
struct RuleState {
    /// Dernier échantillon vu (rate_of_change)
    last_sample: Option<(f64, OffsetDateTime)>,
    /// Instant depuis lequel le prédicat est continûment faux
    false_since: Option<Instant>,
    /// Deadline missing_data (réarmée à chaque frame du kind)
    deadline: Option<Instant>,
    /// Alerte courante : Firing, ou Resolved conservée pour la dédup
    alert: Option<Alert>,
    resolved_at: Option<Instant>,
    last_emit: Option<Instant>,
}

struct EngineCore {
    rules: Vec<Arc<Rule>>,
    detectors: Vec<Arc<dyn AnomalyDetector>>,
    conf: AlertsConf,
    states: HashMap<(String, String), RuleState>,
    open: OpenAlerts,
    dispatch_tx: mpsc::Sender<Alert>,
    metrics: Arc<GatewayMetrics>,
}

/// Démarre le moteur et son dispatcher. `tick_every` pilote la résolution
/// hold-down et les deadlines missing_data (1s en production).
pub fn spawn(
    rules: RuleSet,
    detectors: Vec<Arc<dyn AnomalyDetector>>,
    conf: AlertsConf,
    sink: Arc<dyn AlertSink>,
    metrics: Arc<GatewayMetrics>,
    tick_every: Duration,
) -> (AlertEngine, OpenAlerts, JoinHandle<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Reading>(1024);
    let (dispatch_tx, dispatch_rx) = mpsc::channel::<Alert>(256);
    let open: OpenAlerts = Arc::new(RwLock::new(HashMap::new()));

    let core = EngineCore {
        rules: rules.rules.into_iter().map(Arc::new).collect(),
        detectors,
        conf: conf.clone(),
        states: HashMap::new(),
        open: open.clone(),
        dispatch_tx: dispatch_tx.clone(),
        metrics: metrics.clone(),
    };

    let engine_handle = tokio::spawn(core.run(rx, tick_every));
    let dispatch_handle = tokio::spawn(dispatcher(dispatch_rx, sink, conf, metrics));

    (AlertEngine { tx, dispatch_tx }, open, engine_handle, dispatch_handle)
}

impl EngineCore {
    async fn run(mut self, mut rx: mpsc::Receiver<Reading>, tick_every: Duration) {
        info!("[alerts] engine started ({} rules)", self.rules.len());
        let mut tick = tokio::time::interval(tick_every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                r = rx.recv() => match r {
                    Some(reading) => self.evaluate(&reading).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }
        info!("[alerts] engine stopped");
    }

    async fn evaluate(&mut self, reading: &Reading) {
        // une Reading invalide ne doit pas déclencher de seuils : elle est
        // stockée pour audit mais exclue de l'évaluation
        let evaluable = reading.quality != crate::models::Quality::Invalid;

        let rules: Vec<Arc<Rule>> = self
            .rules
            .iter()
            .filter(|r| r.scope.matches(&reading.device_id))
            .cloned()
            .collect();

        for rule in rules {
            if rule.predicate.kind() != reading.sensor_kind {
                continue;
            }
            let key = (reading.device_id.clone(), rule.rule_id.clone());
            let state = self.states.entry(key.clone()).or_default();

            let breach = match &rule.predicate {
                Predicate::ThresholdAbove { value, .. } => evaluable && reading.value > *value,
                Predicate::ThresholdBelow { value, .. } => evaluable && reading.value < *value,
                Predicate::RateOfChange { delta_per_min, .. } => {
                    let breach = match state.last_sample {
                        Some((prev, prev_ts)) if evaluable => {
                            let dt_min =
                                (reading.device_timestamp - prev_ts).as_seconds_f64() / 60.0;
                            dt_min > 0.0
                                && ((reading.value - prev) / dt_min).abs() >= *delta_per_min
                        }
                        _ => false,
                    };
                    if evaluable {
                        state.last_sample = Some((reading.value, reading.device_timestamp));
                    }
                    breach
                }
                Predicate::MissingData { for_secs, .. } => {
                    // une frame du kind surveillé réarme la deadline
                    state.deadline = Some(Instant::now() + Duration::from_secs_f64(*for_secs));
                    false
                }
            };

            self.transition(&key, rule.as_ref(), breach, reading.value).await;
        }

        // seam anomalies : mêmes transitions, règles synthétiques
        for det in self.detectors.clone() {
            match det.inspect(reading) {
                Some(v) => {
                    let rule = Rule {
                        rule_id: v.rule_id.clone(),
                        predicate: Predicate::ThresholdAbove {
                            kind: reading.sensor_kind,
                            value: v.threshold,
                        },
                        severity: v.severity,
                        hold_down_secs: None,
                        scope: Scope { devices: vec!["*".into()] },
                    };
                    let key = (reading.device_id.clone(), v.rule_id);
                    self.states.entry(key.clone()).or_default();
                    self.transition(&key, &rule, true, reading.value).await;
                }
                None => {
                    // pas de verdict : compte comme prédicat faux pour les
                    // alertes anomalie déjà ouvertes sur ce device
                    let device = reading.device_id.clone();
                    let firing: Vec<(String, String)> = self
                        .states
                        .iter()
                        .filter(|((d, _), s)| {
                            *d == device
                                && s.alert
                                    .as_ref()
                                    .map(|a| a.state == AlertState::Firing && a.source == "device")
                                    .unwrap_or(false)
                        })
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in firing {
                        if self.rules.iter().any(|r| r.rule_id == key.1) {
                            continue; // règle déclarative, gérée au-dessus
                        }
                        if let Some(state) = self.states.get_mut(&key) {
                            if state.false_since.is_none() {
                                state.false_since = Some(Instant::now());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Applique la machine à états firing/resolved d'une (device, règle)
    async fn transition(&mut self, key: &(String, String), rule: &Rule, breach: bool, value: f64) {
        enum Action {
            Nothing,
            Open(Alert),
            Remind(Alert),
            ResolveDue,
        }

        let hold_down = rule
            .hold_down_secs
            .unwrap_or(self.conf.hold_down_default_secs as f64);
        let dedup_window = Duration::from_secs(self.conf.dedup_window_secs);
        let reminder = Duration::from_secs(self.conf.max_reminder_interval_secs);
        let now = Instant::now();

        // phase 1 : décision sous emprunt mutable de l'état
        let action = {
            let Some(state) = self.states.get_mut(key) else { return };

            if breach {
                state.false_since = None;
                match &mut state.alert {
                    Some(alert) if alert.state == AlertState::Firing => {
                        alert.last_value = value;
                        // pas de ré-émission tant que l'alerte n'est pas
                        // résolue, sauf rappel périodique
                        if state.last_emit.map(|t| now - t >= reminder).unwrap_or(false) {
                            state.last_emit = Some(now);
                            Action::Remind(alert.clone())
                        } else {
                            Action::Nothing
                        }
                    }
                    existing => {
                        // réouverture dans la fenêtre de dédup : même alert_id
                        let reuse_id = match (existing.as_ref(), state.resolved_at) {
                            (Some(prev), Some(t)) if now - t <= dedup_window => {
                                Some(prev.alert_id)
                            }
                            _ => None,
                        };
                        let alert = Alert {
                            alert_id: reuse_id.unwrap_or_else(Uuid::new_v4),
                            device_id: key.0.clone(),
                            rule_id: key.1.clone(),
                            severity: rule.severity,
                            opened_at: OffsetDateTime::now_utc(),
                            closed_at: None,
                            last_value: value,
                            threshold: rule.predicate.threshold(),
                            state: AlertState::Firing,
                            source: "device",
                        };
                        state.alert = Some(alert.clone());
                        state.last_emit = Some(now);
                        Action::Open(alert)
                    }
                }
            } else {
                let firing = state
                    .alert
                    .as_ref()
                    .map(|a| a.state == AlertState::Firing)
                    .unwrap_or(false);
                if firing {
                    let since = *state.false_since.get_or_insert(now);
                    if now - since >= Duration::from_secs_f64(hold_down) {
                        Action::ResolveDue
                    } else {
                        Action::Nothing
                    }
                } else {
                    Action::Nothing
                }
            }
        };

        // phase 2 : effets (gauges, map des ouvertes, dispatch)
        match action {
            Action::Open(alert) => {
                debug!(
                    "[alerts] open {} for {} ({})",
                    alert.rule_id, alert.device_id, alert.alert_id
                );
                self.gauge(rule.severity, 1);
                self.open.write().insert(key.clone(), alert.clone());
                let _ = self.dispatch_tx.send(alert).await;
            }
            Action::Remind(alert) => {
                let _ = self.dispatch_tx.send(alert).await;
            }
            Action::ResolveDue => self.resolve(key, rule.severity).await,
            Action::Nothing => {}
        }
    }

    async fn resolve(&mut self, key: &(String, String), severity: Severity) {
        let resolved = {
            let Some(state) = self.states.get_mut(key) else { return };
            let Some(alert) = &mut state.alert else { return };
            alert.state = AlertState::Resolved;
            alert.closed_at = Some(OffsetDateTime::now_utc());
            state.resolved_at = Some(Instant::now());
            state.false_since = None;
            alert.clone()
        };

        debug!(
            "[alerts] resolve {} for {} ({})",
            resolved.rule_id, resolved.device_id, resolved.alert_id
        );
        self.gauge(severity, -1);
        self.open.write().remove(key);
        let _ = self.dispatch_tx.send(resolved).await;
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        // deadlines missing_data échues => ouverture
        let mut to_open: Vec<((String, String), Arc<Rule>)> = Vec::new();
        for rule in &self.rules {
            if !matches!(rule.predicate, Predicate::MissingData { .. }) {
                continue;
            }
            for ((device, rule_id), state) in &self.states {
                if *rule_id != rule.rule_id {
                    continue;
                }
                let due = state.deadline.map(|d| now >= d).unwrap_or(false);
                let firing = state
                    .alert
                    .as_ref()
                    .map(|a| a.state == AlertState::Firing)
                    .unwrap_or(false);
                if due && !firing {
                    to_open.push(((device.clone(), rule_id.clone()), rule.clone()));
                }
            }
        }
        for (key, rule) in to_open {
            let elapsed = rule.predicate.threshold();
            self.transition(&key, rule.as_ref(), true, elapsed).await;
        }

        // hold-down de résolution + rappels périodiques. Les alertes issues
        // du seam anomalies n'ont pas de règle déclarative : hold-down par
        // défaut et sévérité portée par l'alerte elle-même.
        let reminder = Duration::from_secs(self.conf.max_reminder_interval_secs);
        let keys: Vec<(String, String)> = self.states.keys().cloned().collect();
        for key in keys {
            let rule = self.rule_for(&key.1);
            let hold_down = rule
                .as_ref()
                .and_then(|r| r.hold_down_secs)
                .unwrap_or(self.conf.hold_down_default_secs as f64);

            let (resolve_due, remind_due, alert_clone) = {
                let Some(state) = self.states.get(&key) else { continue };
                let firing = state
                    .alert
                    .as_ref()
                    .map(|a| a.state == AlertState::Firing)
                    .unwrap_or(false);
                if !firing {
                    continue;
                }
                let resolve_due = state
                    .false_since
                    .map(|t| now - t >= Duration::from_secs_f64(hold_down))
                    .unwrap_or(false);
                let remind_due = !resolve_due
                    && state.last_emit.map(|t| now - t >= reminder).unwrap_or(false);
                (resolve_due, remind_due, state.alert.clone())
            };

            if resolve_due {
                let severity = rule
                    .map(|r| r.severity)
                    .or_else(|| alert_clone.as_ref().map(|a| a.severity))
                    .unwrap_or(Severity::Warning);
                self.resolve(&key, severity).await;
            } else if remind_due {
                if let Some(alert) = alert_clone {
                    if let Some(state) = self.states.get_mut(&key) {
                        state.last_emit = Some(now);
                    }
                    let _ = self.dispatch_tx.send(alert).await;
                }
            }
        }
    }

    fn rule_for(&self, rule_id: &str) -> Option<Arc<Rule>> {
        self.rules.iter().find(|r| r.rule_id == rule_id).cloned()
    }

    fn gauge(&self, severity: Severity, delta: i64) {
        let g = match severity {
            Severity::Info => &self.metrics.alerts_open_info,
            Severity::Warning => &self.metrics.alerts_open_warning,
            Severity::Critical => &self.metrics.alerts_open_critical,
        };
        g.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Task de dispatch : retry par alerte, dead-letter après épuisement
async fn dispatcher(
    mut rx: mpsc::Receiver<Alert>,
    sink: Arc<dyn AlertSink>,
    conf: AlertsConf,
    metrics: Arc<GatewayMetrics>,
) {
    info!("[alerts] dispatcher started (sink: {})", sink.name());
    while let Some(alert) = rx.recv().await {
        let mut backoff = Duration::from_millis(200);
        let mut delivered = false;
        for attempt in 1..=conf.dispatch_attempts {
            match sink.emit(&alert).await {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "[alerts] dispatch attempt {}/{} failed for {}: {}",
                        attempt, conf.dispatch_attempts, alert.alert_id, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
        if !delivered {
            metrics.alerts_dead_letter.fetch_add(1, Ordering::Relaxed);
            warn!("[alerts] dead-lettered alert {} ({})", alert.alert_id, alert.rule_id);
        }
    }
    info!("[alerts] dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Quality, TirePosition};
    use parking_lot::Mutex;

    /// Sink d'enregistrement pour les assertions
    struct RecordingSink {
        emitted: Mutex<Vec<Alert>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { emitted: Mutex::new(Vec::new()) })
        }

        fn emitted(&self) -> Vec<Alert> {
            self.emitted.lock().clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn emit(&self, alert: &Alert) -> Result<(), AlertSinkError> {
            self.emitted.lock().push(alert.clone());
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        async fn emit(&self, _alert: &Alert) -> Result<(), AlertSinkError> {
            Err(AlertSinkError::Unavailable("always down".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn pressure_reading(device: &str, kpa: f64, ts: OffsetDateTime) -> Reading {
        Reading {
            device_id: device.into(),
            sensor_kind: SensorKind::Pressure,
            position: TirePosition::FrontLeft,
            value: kpa,
            unit: "kPa".into(),
            raw_key: None,
            device_timestamp: ts,
            ingest_timestamp: ts,
            quality: Quality::Good,
        }
    }

    fn tpms_low_rule(hold_down: f64) -> RuleSet {
        RuleSet {
            rules: vec![Rule {
                rule_id: "tpms_low".into(),
                predicate: Predicate::ThresholdBelow { kind: SensorKind::Pressure, value: 200.0 },
                severity: Severity::Critical,
                hold_down_secs: Some(hold_down),
                scope: Scope { devices: vec!["*".into()] },
            }],
        }
    }

    fn conf() -> AlertsConf {
        AlertsConf { dedup_window_secs: 300, ..AlertsConf::default() }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[test]
    fn rules_parse_from_yaml() {
        let yaml = r#"
rules:
  - rule_id: tpms_low
    predicate:
      type: threshold_below
      kind: pressure
      value: 200.0
    severity: critical
    hold_down_secs: 60
    scope:
      devices: ["HK_*"]
  - rule_id: battery_flat
    predicate:
      type: threshold_below
      kind: battery
      value: 2.8
    severity: warning
    scope:
      devices: ["*"]
  - rule_id: silent_device
    predicate:
      type: missing_data
      kind: pressure
      for_secs: 120
    severity: warning
    scope:
      devices: ["*"]
"#;
        let set: RuleSet = serde_yaml::from_str(yaml).expect("rules parse");
        assert_eq!(set.rules.len(), 3);
        assert!(set.rules[0].scope.matches("HK_000001"));
        assert!(!set.rules[0].scope.matches("OTHER_1"));
        assert!(matches!(
            set.rules[2].predicate,
            Predicate::MissingData { kind: SensorKind::Pressure, .. }
        ));
    }

    #[tokio::test]
    async fn threshold_alert_lifecycle() {
        // S2 : 180 ouvre, 190 ne ré-émet pas, 210 maintenu résout
        let sink = RecordingSink::new();
        let metrics = Arc::new(GatewayMetrics::default());
        let (engine, open, _core, _disp) = spawn(
            tpms_low_rule(0.05),
            vec![],
            conf(),
            sink.clone(),
            metrics.clone(),
            Duration::from_millis(10),
        );

        let t0 = OffsetDateTime::now_utc();
        engine.offer(pressure_reading("HK_000001", 180.0, t0)).await;
        settle().await;

        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].state, AlertState::Firing);
        assert_eq!(emitted[0].severity, Severity::Critical);
        assert_eq!(open.read().len(), 1);
        assert_eq!(metrics.alerts_open_critical.load(Ordering::Relaxed), 1);

        // deuxième frame sous le seuil dans la fenêtre : pas de nouvelle alerte
        engine.offer(pressure_reading("HK_000001", 190.0, t0)).await;
        settle().await;
        assert_eq!(sink.emitted().len(), 1, "still one firing alert");

        // au-dessus du seuil, maintenu au-delà du hold-down : résolution
        engine.offer(pressure_reading("HK_000001", 210.0, t0)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].state, AlertState::Resolved);
        assert_eq!(emitted[1].alert_id, emitted[0].alert_id);
        assert!(emitted[1].closed_at.is_some());
        assert_eq!(open.read().len(), 0);
        assert_eq!(metrics.alerts_open_critical.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn reopen_within_dedup_window_reuses_id() {
        let sink = RecordingSink::new();
        let (engine, _open, _core, _disp) = spawn(
            tpms_low_rule(0.02),
            vec![],
            conf(),
            sink.clone(),
            Arc::new(GatewayMetrics::default()),
            Duration::from_millis(10),
        );

        let t0 = OffsetDateTime::now_utc();
        engine.offer(pressure_reading("HK_000001", 180.0, t0)).await;
        settle().await;
        engine.offer(pressure_reading("HK_000001", 210.0, t0)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.offer(pressure_reading("HK_000001", 170.0, t0)).await;
        settle().await;

        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 3, "firing, resolved, firing again");
        assert_eq!(emitted[2].state, AlertState::Firing);
        assert_eq!(
            emitted[2].alert_id, emitted[0].alert_id,
            "reopened within dedup window keeps the alert id"
        );
    }

    #[tokio::test]
    async fn at_most_one_firing_per_device_rule() {
        let sink = RecordingSink::new();
        let (engine, open, _core, _disp) = spawn(
            tpms_low_rule(10.0),
            vec![],
            conf(),
            sink.clone(),
            Arc::new(GatewayMetrics::default()),
            Duration::from_millis(10),
        );

        let t0 = OffsetDateTime::now_utc();
        for _ in 0..20 {
            engine.offer(pressure_reading("HK_000001", 150.0, t0)).await;
        }
        settle().await;

        assert_eq!(sink.emitted().len(), 1, "dedup: one emission");
        assert_eq!(open.read().len(), 1, "one open alert for (device, rule)");
    }

    #[tokio::test]
    async fn invalid_readings_do_not_trigger_thresholds() {
        let sink = RecordingSink::new();
        let (engine, _open, _core, _disp) = spawn(
            tpms_low_rule(0.05),
            vec![],
            conf(),
            sink.clone(),
            Arc::new(GatewayMetrics::default()),
            Duration::from_millis(10),
        );

        let mut r = pressure_reading("HK_000001", -50.0, OffsetDateTime::now_utc());
        r.quality = Quality::Invalid;
        engine.offer(r).await;
        settle().await;
        assert!(sink.emitted().is_empty(), "invalid data is audit-only");
    }

    #[tokio::test]
    async fn rate_of_change_fires_on_steep_slope() {
        let rules = RuleSet {
            rules: vec![Rule {
                rule_id: "pressure_drop".into(),
                predicate: Predicate::RateOfChange {
                    kind: SensorKind::Pressure,
                    delta_per_min: 50.0,
                },
                severity: Severity::Warning,
                hold_down_secs: Some(10.0),
                scope: Scope { devices: vec!["HK_*".into()] },
            }],
        };
        let sink = RecordingSink::new();
        let (engine, _open, _core, _disp) = spawn(
            rules,
            vec![],
            conf(),
            sink.clone(),
            Arc::new(GatewayMetrics::default()),
            Duration::from_millis(10),
        );

        let t0 = OffsetDateTime::now_utc();
        engine.offer(pressure_reading("HK_000001", 220.0, t0)).await;
        // -100 kPa en 60s de temps device = 100/min, au-delà de 50/min
        engine
            .offer(pressure_reading("HK_000001", 120.0, t0 + time::Duration::seconds(60)))
            .await;
        settle().await;

        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].rule_id, "pressure_drop");
    }

    #[tokio::test]
    async fn missing_data_fires_after_silence_and_resolves_on_return() {
        let rules = RuleSet {
            rules: vec![Rule {
                rule_id: "silent".into(),
                predicate: Predicate::MissingData {
                    kind: SensorKind::Pressure,
                    // large devant le hold-down pour que la résolution soit
                    // observable avant une éventuelle re-expiration
                    for_secs: 0.3,
                },
                severity: Severity::Warning,
                hold_down_secs: Some(0.02),
                scope: Scope { devices: vec!["*".into()] },
            }],
        };
        let sink = RecordingSink::new();
        let (engine, open, _core, _disp) = spawn(
            rules,
            vec![],
            conf(),
            sink.clone(),
            Arc::new(GatewayMetrics::default()),
            Duration::from_millis(10),
        );

        let t0 = OffsetDateTime::now_utc();
        engine.offer(pressure_reading("HK_000001", 220.0, t0)).await;
        // silence > for_secs : la deadline expire, l'alerte s'ouvre au tick
        tokio::time::sleep(Duration::from_millis(400)).await;
        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 1, "missing_data opened");
        assert_eq!(emitted[0].rule_id, "silent");
        assert_eq!(open.read().len(), 1);

        // le device ré-émet : deadline réarmée, prédicat faux, résolution
        engine.offer(pressure_reading("HK_000001", 221.0, t0)).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 2, "resolved after data returned");
        assert_eq!(emitted[1].state, AlertState::Resolved);
    }

    #[tokio::test]
    async fn failed_dispatch_goes_to_dead_letter() {
        let metrics = Arc::new(GatewayMetrics::default());
        let mut c = conf();
        c.dispatch_attempts = 2;
        let (engine, _open, _core, _disp) = spawn(
            tpms_low_rule(0.05),
            vec![],
            c,
            Arc::new(FailingSink),
            metrics.clone(),
            Duration::from_millis(10),
        );

        engine
            .offer(pressure_reading("HK_000001", 100.0, OffsetDateTime::now_utc()))
            .await;
        // 2 tentatives à ~200ms + 400ms de backoff
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(metrics.alerts_dead_letter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn gateway_self_alert_routes_through_sink() {
        let sink = RecordingSink::new();
        let (engine, _open, _core, _disp) = spawn(
            RuleSet::default(),
            vec![],
            conf(),
            sink.clone(),
            Arc::new(GatewayMetrics::default()),
            Duration::from_millis(10),
        );

        engine.raise_gateway("wab_near_full", Severity::Warning, 950_000.0, 900_000.0).await;
        settle().await;

        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].source, "gateway");
        assert_eq!(emitted[0].rule_id, "wab_near_full");
    }

    #[tokio::test]
    async fn anomaly_detector_seam_opens_alerts() {
        struct SpikeDetector;
        impl AnomalyDetector for SpikeDetector {
            fn inspect(&self, reading: &Reading) -> Option<AnomalyVerdict> {
                (reading.value > 500.0).then(|| AnomalyVerdict {
                    rule_id: "anomaly_spike".into(),
                    severity: Severity::Warning,
                    threshold: 500.0,
                })
            }
            fn name(&self) -> &'static str {
                "spike"
            }
        }

        let sink = RecordingSink::new();
        let (engine, open, _core, _disp) = spawn(
            RuleSet::default(),
            vec![Arc::new(SpikeDetector)],
            conf(),
            sink.clone(),
            Arc::new(GatewayMetrics::default()),
            Duration::from_millis(10),
        );

        engine
            .offer(pressure_reading("HK_000001", 550.0, OffsetDateTime::now_utc()))
            .await;
        settle().await;

        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].rule_id, "anomaly_spike");
        assert_eq!(open.read().len(), 1);
    }
}
