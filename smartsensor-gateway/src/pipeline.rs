/**
 * PIPELINE - Lanes single-writer par device, cœur de la gateway
 *
 * RÔLE :
 * Traitement ordonné par device : validation -> normalisation -> champs
 * dérivés -> offre aux trois sinks (store durable, hub WebSocket, moteur
 * d'alertes) -> touch du registre.
 *
 * FONCTIONNEMENT :
 * - Un hash du device_id choisit un shard parmi S (puissance de deux) ;
 *   chaque shard est une FIFO bornée drainée par UN worker : ordre total
 *   par device sans verrou par device
 * - Le worker n'avance pas tant que C5 n'a pas accepté la Reading dans le
 *   WAB et que C6/C7 n'ont pas rendu la main => ordre par device identique
 *   côté stockage, broadcast et alertes
 * - WAB plein : offer() attend, le shard se gare, la backpressure remonte
 *   jusqu'à l'ingest (MQTT n'acke plus, HTTP répond 503)
 * - Les erreurs déterministes (validation) sont comptées et la Reading part
 *   quand même au store en quality=invalid pour audit
 *
 * UTILITÉ DANS SMARTSENSOR :
 * 🎯 C'est ici que vivent les garanties d'ordre du système ; les sinks
 *    s'enregistrent au démarrage, jamais en cours de run
 */

use crate::alerts::AlertEngine;
use crate::codec::DecodedFrame;
use crate::config::PipelineConf;
use crate::hub::SubscriberHub;
use crate::metrics::GatewayMetrics;
use crate::models::{Quality, Reading, SensorKind, TirePosition};
use crate::registry::{QualitySample, SharedRegistry};
use crate::sink::DurableSink;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Un item de travail : une frame décodée, plus un signal d'acceptation
/// optionnel (l'ingest MQTT n'acke le broker qu'une fois `done` résolu,
/// c'est-à-dire la frame acceptée par le WAB)
pub struct WorkItem {
    pub frame: DecodedFrame,
    pub done: Option<oneshot::Sender<()>>,
}

/// La file du shard est pleine : backpressure à signaler à l'appelant
#[derive(Debug, thiserror::Error)]
#[error("pipeline shard at capacity")]
pub struct PipelineBusy;

/// Le pipeline est en cours d'arrêt
#[derive(Debug, thiserror::Error)]
#[error("pipeline closed")]
pub struct PipelineClosed;

/// Dépendances injectées au démarrage (pas de globals : tout est construit
/// par le superviseur et passé par valeur)
#[derive(Clone)]
pub struct PipelineDeps {
    pub registry: SharedRegistry,
    pub sink: DurableSink,
    pub hub: Arc<SubscriberHub>,
    pub alerts: AlertEngine,
    pub metrics: Arc<GatewayMetrics>,
}

/// Session par device vivant dans le worker de son shard.
/// Single-writer : aucun verrou nécessaire.
struct Session {
    seq: u64,
    last_activity: Instant,
}

pub struct Pipeline {
    /// Senders des shards, vidés par close() pour fermer l'entrée
    shards: parking_lot::RwLock<Vec<mpsc::Sender<WorkItem>>>,
    mask: usize,
    depth: Arc<Vec<AtomicI64>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

fn shard_index(device_id: &str, mask: usize) -> usize {
    let mut h = DefaultHasher::new();
    device_id.hash(&mut h);
    (h.finish() as usize) & mask
}

impl Pipeline {
    pub fn spawn(conf: PipelineConf, deps: PipelineDeps) -> Self {
        let count = conf.shards;
        let depth: Arc<Vec<AtomicI64>> =
            Arc::new((0..count).map(|_| AtomicI64::new(0)).collect());

        let mut shards = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for shard_id in 0..count {
            let (tx, rx) = mpsc::channel::<WorkItem>(conf.device_queue);
            shards.push(tx);
            handles.push(tokio::spawn(worker(
                shard_id,
                rx,
                deps.clone(),
                depth.clone(),
                Duration::from_secs(conf.session_idle_secs),
            )));
        }

        info!("[pipeline] started {} shards (queue depth {})", count, conf.device_queue);
        Self {
            shards: parking_lot::RwLock::new(shards),
            mask: count - 1,
            depth,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    fn sender_for(&self, device_id: &str) -> Option<(usize, mpsc::Sender<WorkItem>)> {
        let idx = shard_index(device_id, self.mask);
        self.shards.read().get(idx).cloned().map(|tx| (idx, tx))
    }

    /// Enfile en bloquant si le shard est plein (chemin MQTT : la
    /// backpressure retient l'ack broker)
    pub async fn enqueue(&self, item: WorkItem) -> Result<(), PipelineClosed> {
        let Some((idx, tx)) = self.sender_for(&item.frame.device_id) else {
            return Err(PipelineClosed);
        };
        tx.send(item).await.map_err(|_| PipelineClosed)?;
        self.depth[idx].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enfile sans attendre (chemin HTTP : shard plein => 503 Retry-After)
    pub fn try_enqueue(&self, item: WorkItem) -> Result<(), PipelineBusy> {
        let Some((idx, tx)) = self.sender_for(&item.frame.device_id) else {
            return Err(PipelineBusy);
        };
        match tx.try_send(item) {
            Ok(()) => {
                self.depth[idx].fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => Err(PipelineBusy),
        }
    }

    /// Section métriques par shard
    pub fn render_metrics(&self, out: &mut String) {
        use std::fmt::Write;
        for (i, d) in self.depth.iter().enumerate() {
            let _ = write!(
                out,
                "pipeline_queue_depth{{shard=\"{}\"}} {}\n",
                i,
                d.load(Ordering::Relaxed)
            );
        }
    }

    /// Ferme l'entrée et draine : les workers finissent leurs files puis
    /// s'arrêtent (fini, puisque l'ingest est déjà coupé en amont)
    pub async fn close(&self) {
        let senders = std::mem::take(&mut *self.shards.write());
        drop(senders);
        let handles = std::mem::take(&mut *self.handles.lock());
        for h in handles {
            let _ = h.await;
        }
        info!("[pipeline] drained and stopped");
    }
}

async fn worker(
    shard_id: usize,
    mut rx: mpsc::Receiver<WorkItem>,
    deps: PipelineDeps,
    depth: Arc<Vec<AtomicI64>>,
    session_idle: Duration,
) {
    let mut sessions: HashMap<String, Session> = HashMap::new();
    let mut sweep = tokio::time::interval(session_idle.max(Duration::from_secs(1)));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sweep.tick().await; // premier tick immédiat

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    depth[shard_id].fetch_sub(1, Ordering::Relaxed);
                    if process(&deps, &mut sessions, item).await.is_err() {
                        // sink fermé : shutdown en cours, on draine sans traiter
                        break;
                    }
                }
                None => break,
            },
            _ = sweep.tick() => {
                let before = sessions.len();
                sessions.retain(|_, s| s.last_activity.elapsed() < session_idle);
                if sessions.len() < before {
                    debug!("[pipeline] shard {} swept {} idle sessions",
                        shard_id, before - sessions.len());
                }
            }
        }
    }
}

/// Traite un item entièrement : un item est soit totalement traité, soit
/// pas commencé (aucune annulation au milieu d'un item)
async fn process(
    deps: &PipelineDeps,
    sessions: &mut HashMap<String, Session>,
    item: WorkItem,
) -> Result<(), crate::sink::SinkClosed> {
    let frame = item.frame;
    let session = sessions
        .entry(frame.device_id.clone())
        .or_insert_with(|| Session { seq: 0, last_activity: Instant::now() });

    let mut readings = frame.readings;
    append_derived(&mut readings);

    let mut worst = Quality::Good;
    let mut battery_v = None;
    for reading in &readings {
        match reading.quality {
            Quality::Invalid => {
                deps.metrics.readings_invalid.fetch_add(1, Ordering::Relaxed);
                worst = Quality::Invalid;
            }
            Quality::Suspect => {
                deps.metrics.readings_suspect.fetch_add(1, Ordering::Relaxed);
                if worst == Quality::Good {
                    worst = Quality::Suspect;
                }
            }
            Quality::Good => {}
        }
        if reading.sensor_kind == SensorKind::Battery {
            battery_v = Some(reading.value);
        }
    }

    let ingest_timestamp = readings
        .first()
        .map(|r| r.ingest_timestamp)
        .unwrap_or_else(time::OffsetDateTime::now_utc);

    for reading in readings {
        // ordre contractuel : store durable d'abord (une Reading n'est
        // jamais visible d'un abonné avant son acceptation par le WAB),
        // puis broadcast, puis évaluation des règles
        deps.sink.offer(reading.clone()).await?;
        deps.hub.broadcast(&reading);
        deps.alerts.offer(reading).await;
        session.seq += 1;
    }

    deps.registry.touch(
        &frame.device_id,
        ingest_timestamp,
        QualitySample { quality: worst, battery_v },
        frame.firmware.as_deref(),
    );
    session.last_activity = Instant::now();

    // la frame est acceptée par les trois sinks : l'ingest peut acker
    if let Some(done) = item.done {
        let _ = done.send(());
    }
    Ok(())
}

/// Champs dérivés : altitude barométrique depuis la pression ambiante
/// (formule barométrique internationale, référence 1013.25 hPa)
fn append_derived(readings: &mut Vec<Reading>) {
    let derived = readings
        .iter()
        .find(|r| {
            r.sensor_kind == SensorKind::Pressure
                && r.position == TirePosition::None
                && r.quality == Quality::Good
        })
        .map(|p| {
            let altitude_m = 44_330.0 * (1.0 - (p.value / 1013.25).powf(0.190284));
            Reading {
                device_id: p.device_id.clone(),
                sensor_kind: SensorKind::Composite,
                position: TirePosition::None,
                value: altitude_m,
                unit: "m".into(),
                raw_key: Some("altitude_m".into()),
                device_timestamp: p.device_timestamp,
                ingest_timestamp: p.ingest_timestamp,
                quality: Quality::Good,
            }
        });
    if let Some(r) = derived {
        readings.push(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{self, RuleSet};
    use crate::codec;
    use crate::config::{
        AlertsConf, DurableConf, RegistryConf, SubscribersConf, UnknownDevicePolicy,
    };
    use crate::registry::DeviceRegistry;
    use crate::sink::{self, MemStore};
    use tokio::sync::watch;

    struct Harness {
        pipeline: Pipeline,
        store: Arc<MemStore>,
        registry: SharedRegistry,
        metrics: Arc<GatewayMetrics>,
        sink_handle: JoinHandle<()>,
    }

    fn frame(device: &str, json: &str) -> DecodedFrame {
        let payload = format!(r#"{{"device_id":"{}",{}}}"#, device, json);
        codec::decode_frame(payload.as_bytes(), time::OffsetDateTime::now_utc()).unwrap()
    }

    fn harness(shards: usize, queue: usize, wab: usize) -> Harness {
        let metrics = Arc::new(GatewayMetrics::default());
        let registry = Arc::new(DeviceRegistry::new(RegistryConf {
            unknown_device_policy: UnknownDevicePolicy::AutoProvision,
            ..RegistryConf::default()
        }));
        let store = Arc::new(MemStore::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, sink_handle) = sink::spawn(
            store.clone(),
            DurableConf {
                batch_size: 4,
                batch_age_ms: 10,
                wab_capacity: wab,
                retry_backoff_min_ms: 1,
                retry_backoff_max_ms: 5,
                url: None,
            },
            Duration::from_secs(5),
            metrics.clone(),
            shutdown_rx,
        );
        let hub = Arc::new(SubscriberHub::new(
            SubscribersConf::default(),
            metrics.clone(),
        ));
        let (alerts_engine, _open, _core, _disp) = alerts::spawn(
            RuleSet::default(),
            vec![],
            AlertsConf::default(),
            Arc::new(alerts::LogSink),
            metrics.clone(),
            Duration::from_millis(50),
        );

        let pipeline = Pipeline::spawn(
            PipelineConf { shards, device_queue: queue, session_idle_secs: 600 },
            PipelineDeps {
                registry: registry.clone(),
                sink,
                hub,
                alerts: alerts_engine,
                metrics: metrics.clone(),
            },
        );
        Harness { pipeline, store, registry, metrics, sink_handle }
    }

    #[tokio::test]
    async fn per_device_order_reaches_store() {
        let h = harness(8, 64, 1024);
        // résolution registre comme le ferait l'ingest
        h.registry.resolve("HK_000001", None);
        h.registry.resolve("HK_000002", None);

        for n in 0..10 {
            let f = frame(
                "HK_000001",
                &format!(r#""sensors":{{"tires":[{{"position":"FL","pressure_kpa":{}}}]}}"#, 200 + n),
            );
            h.pipeline.enqueue(WorkItem { frame: f, done: None }).await.unwrap();
            let f = frame(
                "HK_000002",
                &format!(r#""sensors":{{"humidity":{}}}"#, 40 + n),
            );
            h.pipeline.enqueue(WorkItem { frame: f, done: None }).await.unwrap();
        }

        h.pipeline.close().await;
        h.sink_handle.await.unwrap();

        let rows = h.store.rows();
        assert_eq!(rows.len(), 20);
        // ordre strict par device, quel que soit l'entrelacement global
        let d1: Vec<f64> =
            rows.iter().filter(|r| r.device_id == "HK_000001").map(|r| r.value).collect();
        let d2: Vec<f64> =
            rows.iter().filter(|r| r.device_id == "HK_000002").map(|r| r.value).collect();
        assert_eq!(d1, (0..10).map(|n| 200.0 + n as f64).collect::<Vec<_>>());
        assert_eq!(d2, (0..10).map(|n| 40.0 + n as f64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn done_signal_fires_after_wab_acceptance() {
        let h = harness(2, 16, 64);
        h.registry.resolve("HK_000001", None);

        let (tx, rx) = oneshot::channel();
        let f = frame("HK_000001", r#""sensors":{"temperature":21.5}"#);
        h.pipeline.enqueue(WorkItem { frame: f, done: Some(tx) }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("done resolved")
            .expect("worker signalled acceptance");

        h.pipeline.close().await;
        h.sink_handle.await.unwrap();
        assert_eq!(h.store.rows().len(), 1);
    }

    #[tokio::test]
    async fn invalid_reading_is_stored_and_counted() {
        // S3 : hors bornes => quality=invalid, stockée, compteur invalid++
        let h = harness(2, 16, 64);
        h.registry.resolve("HK_000001", None);

        let f = frame(
            "HK_000001",
            r#""sensors":{"tires":[{"position":"FL","pressure_kpa":9999.0}]}"#,
        );
        h.pipeline.enqueue(WorkItem { frame: f, done: None }).await.unwrap();
        h.pipeline.close().await;
        h.sink_handle.await.unwrap();

        let rows = h.store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quality, Quality::Invalid);
        assert_eq!(rows[0].value, 9999.0);
        assert_eq!(h.metrics.readings_invalid.load(Ordering::Relaxed), 1);
        assert_eq!(h.metrics.ingest_rejected_decode.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn derived_altitude_from_ambient_pressure() {
        let h = harness(2, 16, 64);
        h.registry.resolve("HK_000009", None);

        let f = frame("HK_000009", r#""sensors":{"pressure":1013.25}"#);
        h.pipeline.enqueue(WorkItem { frame: f, done: None }).await.unwrap();
        h.pipeline.close().await;
        h.sink_handle.await.unwrap();

        let rows = h.store.rows();
        assert_eq!(rows.len(), 2, "pressure + derived altitude");
        let altitude = rows
            .iter()
            .find(|r| r.raw_key.as_deref() == Some("altitude_m"))
            .expect("altitude derived");
        assert!(altitude.value.abs() < 1.0, "sea-level pressure is ~0m");
    }

    #[tokio::test]
    async fn touch_updates_registry_health() {
        let h = harness(2, 16, 64);
        h.registry.resolve("HK_000001", None);

        let f = frame(
            "HK_000001",
            r#""firmware":"2.1.0","sensors":{"temperature":20.0,"battery_v":3.8}"#,
        );
        h.pipeline.enqueue(WorkItem { frame: f, done: None }).await.unwrap();
        h.pipeline.close().await;
        h.sink_handle.await.unwrap();

        let view = h.registry.snapshot("HK_000001").unwrap();
        assert_eq!(view.firmware_version.as_deref(), Some("2.1.0"));
        assert!(view.health_score > 50);
    }

    #[tokio::test]
    async fn ingests_frames_from_simulated_fleet() {
        // la flotte du devkit émet au format wire exact ; on la draine
        // comme l'ingest MQTT drainerait le broker : decode puis enqueue
        let h = harness(4, 32, 256);
        h.registry.resolve("HK_000007", None);

        let fleet = smartsensor_devkit::DeviceFleet::new("smartsensor");
        let mut rx = fleet.setup_receiver();
        fleet.send_tpms("HK_000007", "FL", 215.0).unwrap();
        fleet.send_environmental("HK_000007", 21.0, 55.0).unwrap();
        assert_eq!(fleet.total_frames(), 2);
        drop(fleet); // ferme le canal, la boucle d'ingestion se termine

        while let Some(inbound) = rx.recv().await {
            let frame =
                codec::decode_frame(&inbound.payload, time::OffsetDateTime::now_utc()).unwrap();
            assert_eq!(frame.device_id, inbound.device_id);
            h.pipeline.enqueue(WorkItem { frame, done: None }).await.unwrap();
        }

        h.pipeline.close().await;
        h.sink_handle.await.unwrap();

        let rows = h.store.rows();
        // frame TPMS : pression + température pneu ; frame environnementale :
        // 5 mesures + altitude dérivée de la pression ambiante
        assert_eq!(rows.len(), 8);
        assert!(rows.iter().all(|r| r.device_id == "HK_000007"));
        assert!(rows
            .iter()
            .any(|r| r.sensor_kind == SensorKind::Pressure && r.value == 215.0));
        assert!(rows.iter().any(|r| r.raw_key.as_deref() == Some("altitude_m")));
    }

    #[tokio::test]
    async fn backpressure_surfaces_as_busy() {
        // WAB minuscule + store gelé : le shard se gare, la file se remplit,
        // try_enqueue finit par répondre Busy (le chemin HTTP rendra 503)
        struct FrozenStore;
        #[async_trait::async_trait]
        impl crate::sink::ReadingStore for FrozenStore {
            async fn append(
                &self,
                _batch: &[Reading],
            ) -> Result<i64, crate::sink::StoreError> {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            fn name(&self) -> &'static str {
                "frozen"
            }
        }

        let metrics = Arc::new(GatewayMetrics::default());
        let registry = Arc::new(DeviceRegistry::new(RegistryConf::default()));
        registry.resolve("HK_000001", None);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sink, _sink_handle) = sink::spawn(
            Arc::new(FrozenStore),
            DurableConf {
                batch_size: 1,
                batch_age_ms: 5,
                wab_capacity: 1,
                retry_backoff_min_ms: 1,
                retry_backoff_max_ms: 5,
                url: None,
            },
            Duration::from_secs(5),
            metrics.clone(),
            shutdown_rx,
        );
        let hub = Arc::new(SubscriberHub::new(SubscribersConf::default(), metrics.clone()));
        let (alerts_engine, _open, _core, _disp) = alerts::spawn(
            RuleSet::default(),
            vec![],
            AlertsConf::default(),
            Arc::new(alerts::LogSink),
            metrics.clone(),
            Duration::from_millis(50),
        );
        let pipeline = Pipeline::spawn(
            PipelineConf { shards: 1, device_queue: 1, session_idle_secs: 600 },
            PipelineDeps { registry, sink, hub, alerts: alerts_engine, metrics },
        );

        let mut saw_busy = false;
        for _ in 0..200 {
            let f = frame("HK_000001", r#""sensors":{"temperature":20.0}"#);
            if pipeline.try_enqueue(WorkItem { frame: f, done: None }).is_err() {
                saw_busy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(saw_busy, "a frozen store must surface as pipeline backpressure");
    }
}
