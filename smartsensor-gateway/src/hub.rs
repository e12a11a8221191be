/**
 * SUBSCRIBER HUB - Fan-out temps réel vers les dashboards WebSocket
 *
 * RÔLE :
 * Gère les connexions WebSocket des abonnés (GET /v1/stream), leurs filtres
 * et la diffusion des Readings émises par le pipeline.
 *
 * FONCTIONNEMENT :
 * - Chaque abonné a une outbox bornée ; un abonné lent ne bloque JAMAIS
 *   ni les autres sockets ni le pipeline
 * - Outbox pleine : slow_drop jette la frame la plus ancienne (compteur),
 *   disconnect ferme la socket ("subscriber too slow")
 * - La frame est sérialisée UNE fois par broadcast et partagée par
 *   référence (Arc<str>) entre tous les abonnés
 * - Heartbeat ping périodique, pong manquant => fermeture
 *
 * UTILITÉ DANS SMARTSENSOR :
 * 🎯 C'est le seul endroit du système où on préfère jeter plutôt que
 *    bloquer : un dashboard gelé ne doit pas compromettre l'ingestion
 */

use crate::codec;
use crate::config::{DropPolicy, Principal, SubscribersConf};
use crate::metrics::GatewayMetrics;
use crate::models::{Reading, SensorKind};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ===== Protocole client <-> serveur =====

/// Filtre demandé par le client au handshake
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSpec {
    /// ["*"], des device_id exacts, ou des préfixes "HK_*"
    pub devices: Vec<String>,
    /// Masque de sensor kinds ; absent = tous
    #[serde(default)]
    pub kinds: Option<Vec<SensorKind>>,
}

/// Messages client -> serveur
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { filter: FilterSpec },
    Ping,
    Pong,
}

/// Messages serveur -> client (les frames `reading` sont pré-encodées
/// par le codec et ne passent pas par cet enum)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { subscriber_id: Uuid },
    Ping,
    Pong,
    Error { message: String },
}

// ===== Filtres compilés =====

#[derive(Debug, Clone)]
enum DeviceFilter {
    All,
    Prefix(String),
    Set(HashSet<String>),
}

/// Filtre validé contre le scope du principal
#[derive(Debug, Clone)]
pub struct Filter {
    devices: DeviceFilter,
    kinds: Option<HashSet<SensorKind>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("device '{0}' is outside your tenant scope")]
    OutOfScope(String),
    #[error("empty device filter")]
    Empty,
}

impl Filter {
    /// Compile un FilterSpec en le bornant au tenant du principal :
    /// un abonné non-admin ne voit que les devices `<tenant>_...`
    pub fn compile(spec: &FilterSpec, principal: &Principal) -> Result<Self, ScopeError> {
        if spec.devices.is_empty() {
            return Err(ScopeError::Empty);
        }
        let tenant_prefix = format!("{}_", principal.tenant);

        let devices = if spec.devices.iter().any(|d| d == "*") {
            if principal.is_admin() {
                DeviceFilter::All
            } else {
                DeviceFilter::Prefix(tenant_prefix)
            }
        } else {
            let mut set = HashSet::new();
            let mut prefixes = Vec::new();
            for d in &spec.devices {
                if !principal.is_admin() && !d.starts_with(&tenant_prefix) {
                    return Err(ScopeError::OutOfScope(d.clone()));
                }
                match d.strip_suffix('*') {
                    Some(prefix) => prefixes.push(prefix.to_string()),
                    None => {
                        set.insert(d.clone());
                    }
                }
            }
            // mélange préfixe + ids exacts : on garde la forme la plus large
            match (prefixes.len(), set.len()) {
                (0, _) => DeviceFilter::Set(set),
                (_, 0) if prefixes.len() == 1 => DeviceFilter::Prefix(prefixes.remove(0)),
                _ => {
                    // plusieurs préfixes : retombe sur le préfixe tenant
                    if principal.is_admin() {
                        DeviceFilter::All
                    } else {
                        DeviceFilter::Prefix(tenant_prefix)
                    }
                }
            }
        };

        let kinds = spec.kinds.as_ref().map(|ks| ks.iter().copied().collect());
        Ok(Self { devices, kinds })
    }

    pub fn matches(&self, device_id: &str, kind: SensorKind) -> bool {
        let dev_ok = match &self.devices {
            DeviceFilter::All => true,
            DeviceFilter::Prefix(p) => device_id.starts_with(p.as_str()),
            DeviceFilter::Set(s) => s.contains(device_id),
        };
        if !dev_ok {
            return false;
        }
        match &self.kinds {
            Some(ks) => ks.contains(&kind),
            None => true,
        }
    }
}

// ===== Outbox bornée =====

#[derive(Debug, PartialEq, Eq)]
enum PushOutcome {
    Queued,
    DroppedOldest,
    WouldBlock,
}

/// File bornée single-reader : le pipeline pousse (non bloquant), la task
/// d'écriture WebSocket de l'abonné dépile.
struct Outbox {
    q: Mutex<VecDeque<Arc<str>>>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self { q: Mutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), capacity }
    }

    fn push(&self, blob: Arc<str>, policy: DropPolicy) -> PushOutcome {
        let outcome = {
            let mut q = self.q.lock();
            if q.len() >= self.capacity {
                match policy {
                    DropPolicy::SlowDrop => {
                        q.pop_front();
                        q.push_back(blob);
                        PushOutcome::DroppedOldest
                    }
                    DropPolicy::Disconnect => PushOutcome::WouldBlock,
                }
            } else {
                q.push_back(blob);
                PushOutcome::Queued
            }
        };
        if outcome != PushOutcome::WouldBlock {
            self.notify.notify_one();
        }
        outcome
    }

    /// Messages de contrôle (subscribed, ping...) : jamais soumis à la
    /// politique de drop, la capacité est dépassée si nécessaire
    fn push_control(&self, blob: Arc<str>) {
        self.q.lock().push_back(blob);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Arc<str> {
        loop {
            if let Some(b) = self.q.lock().pop_front() {
                return b;
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.q.lock().len()
    }
}

// ===== Abonnement =====

/// Un abonné WebSocket connecté
pub struct Subscription {
    pub id: Uuid,
    principal: Principal,
    filter: RwLock<Option<Filter>>,
    outbox: Outbox,
    pub dropped: AtomicU64,
    /// Demande de fermeture côté serveur (slow, shutdown)
    close: Notify,
    close_reason: Mutex<Option<&'static str>>,
}

impl Subscription {
    fn request_close(&self, reason: &'static str) {
        let mut r = self.close_reason.lock();
        if r.is_none() {
            *r = Some(reason);
            self.close.notify_one();
        }
    }

    pub fn set_filter(&self, filter: Filter) {
        *self.filter.write() = Some(filter);
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }
}

// ===== Hub =====

pub struct SubscriberHub {
    subs: RwLock<HashMap<Uuid, Arc<Subscription>>>,
    conf: SubscribersConf,
    metrics: Arc<GatewayMetrics>,
    /// Séquence de diffusion (dernier numéro livré visible par abonné)
    seq: AtomicU64,
}

impl SubscriberHub {
    pub fn new(conf: SubscribersConf, metrics: Arc<GatewayMetrics>) -> Self {
        Self { subs: RwLock::new(HashMap::new()), conf, metrics, seq: AtomicU64::new(0) }
    }

    pub fn register(&self, principal: Principal) -> Arc<Subscription> {
        let sub = Arc::new(Subscription {
            id: Uuid::new_v4(),
            principal,
            filter: RwLock::new(None),
            outbox: Outbox::new(self.conf.outbox_capacity),
            dropped: AtomicU64::new(0),
            close: Notify::new(),
            close_reason: Mutex::new(None),
        });
        self.subs.write().insert(sub.id, sub.clone());
        self.metrics.subscribers_connected.fetch_add(1, Ordering::Relaxed);
        info!("[hub] subscriber {} connected ({})", sub.id, sub.principal.tenant);
        sub
    }

    pub fn unregister(&self, id: Uuid) {
        if self.subs.write().remove(&id).is_some() {
            self.metrics.subscribers_connected.fetch_sub(1, Ordering::Relaxed);
            info!("[hub] subscriber {} disconnected", id);
        }
    }

    pub fn connected(&self) -> usize {
        self.subs.read().len()
    }

    /// Diffuse une Reading à tous les abonnés dont le filtre matche.
    /// Non bloquant : un abonné saturé est traité selon sa politique.
    pub fn broadcast(&self, reading: &Reading) {
        let matching: Vec<Arc<Subscription>> = {
            let subs = self.subs.read();
            subs.values()
                .filter(|s| {
                    s.filter
                        .read()
                        .as_ref()
                        .map(|f| f.matches(&reading.device_id, reading.sensor_kind))
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        if matching.is_empty() {
            return;
        }

        // une seule sérialisation, partagée par référence entre abonnés
        let blob: Arc<str> = Arc::from(codec::encode_stream_frame(reading));
        self.seq.fetch_add(1, Ordering::Relaxed);

        for sub in matching {
            match sub.outbox.push(blob.clone(), self.conf.drop_policy) {
                PushOutcome::Queued => {}
                PushOutcome::DroppedOldest => {
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    self.metrics.subscriber_dropped_frames.fetch_add(1, Ordering::Relaxed);
                }
                PushOutcome::WouldBlock => {
                    self.metrics.ws_closed_slow.fetch_add(1, Ordering::Relaxed);
                    sub.request_close("subscriber too slow");
                }
            }
        }
    }

    /// Ferme tous les abonnés (shutdown)
    pub fn close_all(&self, reason: &'static str) {
        let subs: Vec<Arc<Subscription>> = self.subs.read().values().cloned().collect();
        for sub in subs {
            self.metrics.ws_closed_shutdown.fetch_add(1, Ordering::Relaxed);
            sub.request_close(reason);
        }
    }

    /// Section métriques par abonné (ajoutée au rendu global)
    pub fn render_metrics(&self, out: &mut String) {
        use std::fmt::Write;
        let subs = self.subs.read();
        for sub in subs.values() {
            let _ = write!(
                out,
                "subscriber_dropped_frames_total{{subscriber_id=\"{}\"}} {}\n",
                sub.id,
                sub.dropped.load(Ordering::Relaxed)
            );
        }
    }

    fn encode_control(msg: &ServerMessage) -> Arc<str> {
        Arc::from(serde_json::to_string(msg).unwrap_or_default())
    }

    /// Fait vivre une session WebSocket jusqu'à déconnexion.
    /// Appelé par le handler HTTP après upgrade + authentification.
    pub async fn run_session(self: Arc<Self>, socket: WebSocket, principal: Principal) {
        let sub = self.register(principal);
        let (mut ws_tx, mut ws_rx) = socket.split();

        let last_pong = Arc::new(Mutex::new(Instant::now()));
        let heartbeat = Duration::from_secs(self.conf.heartbeat_interval_secs);
        let pong_timeout = Duration::from_secs(self.conf.pong_timeout_secs);

        // task d'écriture : seule à toucher la moitié émission de la socket
        let writer_sub = sub.clone();
        let writer_pong = last_pong.clone();
        let writer_metrics = self.metrics.clone();
        let writer = tokio::spawn(async move {
            let mut ping_tick = tokio::time::interval(heartbeat);
            ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping_tick.tick().await; // le premier tick est immédiat

            loop {
                tokio::select! {
                    blob = writer_sub.outbox.pop() => {
                        if ws_tx.send(Message::Text(blob.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    _ = ping_tick.tick() => {
                        if writer_pong.lock().elapsed() > pong_timeout {
                            writer_metrics.ws_closed_ping_timeout.fetch_add(1, Ordering::Relaxed);
                            debug!("[hub] subscriber {} missed pong, closing", writer_sub.id);
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        }
                        let ping = Self::encode_control(&ServerMessage::Ping);
                        if ws_tx.send(Message::Text(ping.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    _ = writer_sub.close.notified() => {
                        let reason = (*writer_sub.close_reason.lock()).unwrap_or("closing");
                        warn!("[hub] closing subscriber {}: {}", writer_sub.id, reason);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // boucle de lecture : messages de contrôle du client
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Subscribe { filter }) => {
                            match Filter::compile(&filter, &sub.principal) {
                                Ok(f) => {
                                    sub.set_filter(f);
                                    sub.outbox.push_control(Self::encode_control(
                                        &ServerMessage::Subscribed { subscriber_id: sub.id },
                                    ));
                                }
                                Err(e) => {
                                    sub.outbox.push_control(Self::encode_control(
                                        &ServerMessage::Error { message: e.to_string() },
                                    ));
                                }
                            }
                        }
                        Ok(ClientMessage::Pong) => {
                            *last_pong.lock() = Instant::now();
                        }
                        Ok(ClientMessage::Ping) => {
                            sub.outbox.push_control(Self::encode_control(&ServerMessage::Pong));
                        }
                        Err(e) => {
                            debug!("[hub] subscriber {} sent invalid message: {}", sub.id, e);
                            sub.outbox.push_control(Self::encode_control(&ServerMessage::Error {
                                message: format!("invalid message: {}", e),
                            }));
                        }
                    }
                }
                Ok(Message::Pong(_)) => {
                    *last_pong.lock() = Instant::now();
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }

        writer.abort();
        self.unregister(sub.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::models::{Quality, TirePosition};
    use time::OffsetDateTime;

    fn principal(role: Role) -> Principal {
        Principal { tenant: "HK".into(), role }
    }

    fn spec(devices: &[&str]) -> FilterSpec {
        FilterSpec { devices: devices.iter().map(|s| s.to_string()).collect(), kinds: None }
    }

    fn reading(device: &str, n: u32) -> Reading {
        let now = OffsetDateTime::now_utc();
        Reading {
            device_id: device.into(),
            sensor_kind: SensorKind::Pressure,
            position: TirePosition::FrontLeft,
            value: n as f64,
            unit: "kPa".into(),
            raw_key: None,
            device_timestamp: now,
            ingest_timestamp: now,
            quality: Quality::Good,
        }
    }

    fn hub(capacity: usize, policy: DropPolicy) -> Arc<SubscriberHub> {
        let conf = SubscribersConf {
            outbox_capacity: capacity,
            drop_policy: policy,
            ..SubscribersConf::default()
        };
        Arc::new(SubscriberHub::new(conf, Arc::new(GatewayMetrics::default())))
    }

    #[test]
    fn admin_wildcard_matches_everything() {
        let f = Filter::compile(&spec(&["*"]), &principal(Role::Admin)).unwrap();
        assert!(f.matches("HK_000001", SensorKind::Pressure));
        assert!(f.matches("OTHER_9", SensorKind::Humidity));
    }

    #[test]
    fn dashboard_wildcard_is_tenant_bounded() {
        let f = Filter::compile(&spec(&["*"]), &principal(Role::Dashboard)).unwrap();
        assert!(f.matches("HK_000001", SensorKind::Pressure));
        assert!(!f.matches("OTHER_9", SensorKind::Pressure));
    }

    #[test]
    fn dashboard_cannot_subscribe_outside_tenant() {
        let err = Filter::compile(&spec(&["OTHER_9"]), &principal(Role::Dashboard));
        assert!(matches!(err, Err(ScopeError::OutOfScope(_))));
    }

    #[test]
    fn kind_mask_filters() {
        let s = FilterSpec {
            devices: vec!["*".into()],
            kinds: Some(vec![SensorKind::Pressure, SensorKind::Temperature]),
        };
        let f = Filter::compile(&s, &principal(Role::Admin)).unwrap();
        assert!(f.matches("HK_1", SensorKind::Pressure));
        assert!(!f.matches("HK_1", SensorKind::Humidity));
    }

    #[test]
    fn prefix_filter_matches() {
        let f = Filter::compile(&spec(&["HK_00*"]), &principal(Role::Admin)).unwrap();
        assert!(f.matches("HK_000001", SensorKind::Pressure));
        assert!(!f.matches("HK_999999", SensorKind::Pressure));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_without_blocking() {
        // S4 : abonné A en pause (outbox 4), abonné B drainé au fil de l'eau
        let hub = hub(4, DropPolicy::SlowDrop);
        let a = hub.register(principal(Role::Admin));
        a.set_filter(Filter::compile(&spec(&["*"]), &principal(Role::Admin)).unwrap());
        let b = hub.register(principal(Role::Admin));
        b.set_filter(Filter::compile(&spec(&["*"]), &principal(Role::Admin)).unwrap());

        let b_clone = b.clone();
        let drained = tokio::spawn(async move {
            let mut got = Vec::new();
            for _ in 0..10 {
                got.push(b_clone.outbox.pop().await);
            }
            got
        });

        for n in 0..10 {
            hub.broadcast(&reading("HK_000001", n));
            tokio::task::yield_now().await;
        }

        // A en pause : 4 gardées, 6 jetées (les plus anciennes)
        assert_eq!(a.dropped.load(Ordering::Relaxed), 6);
        assert_eq!(a.outbox_len(), 4);

        // B a tout reçu, dans l'ordre de diffusion
        let got = tokio::time::timeout(Duration::from_secs(1), drained)
            .await
            .expect("B received everything")
            .unwrap();
        let values: Vec<f64> = got
            .iter()
            .map(|blob| {
                serde_json::from_str::<serde_json::Value>(blob).unwrap()["value"]
                    .as_f64()
                    .unwrap()
            })
            .collect();
        assert_eq!(values, (0..10).map(f64::from).collect::<Vec<_>>());
        assert_eq!(b.dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn disconnect_policy_requests_close() {
        let hub = hub(2, DropPolicy::Disconnect);
        let a = hub.register(principal(Role::Admin));
        a.set_filter(Filter::compile(&spec(&["*"]), &principal(Role::Admin)).unwrap());

        for n in 0..3 {
            hub.broadcast(&reading("HK_000001", n));
        }
        assert_eq!(a.outbox_len(), 2, "capacity respected, nothing evicted");
        assert_eq!(
            *a.close_reason.lock(),
            Some("subscriber too slow"),
            "third frame triggered a close request"
        );
    }

    #[tokio::test]
    async fn broadcast_skips_subscribers_without_filter() {
        let hub = hub(4, DropPolicy::SlowDrop);
        let a = hub.register(principal(Role::Admin));
        // pas de subscribe encore : rien ne doit être poussé
        hub.broadcast(&reading("HK_000001", 1));
        assert_eq!(a.outbox_len(), 0);
    }

    #[tokio::test]
    async fn per_subscriber_metrics_rendered() {
        let hub = hub(1, DropPolicy::SlowDrop);
        let a = hub.register(principal(Role::Admin));
        a.set_filter(Filter::compile(&spec(&["*"]), &principal(Role::Admin)).unwrap());
        hub.broadcast(&reading("HK_000001", 1));
        hub.broadcast(&reading("HK_000001", 2));

        let mut out = String::new();
        hub.render_metrics(&mut out);
        assert!(out.contains(&format!(
            "subscriber_dropped_frames_total{{subscriber_id=\"{}\"}} 1",
            a.id
        )));
    }
}
