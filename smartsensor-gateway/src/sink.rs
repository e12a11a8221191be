/**
 * DURABLE SINK - Write-ahead buffer + écriture batchée vers le store
 *
 * RÔLE :
 * Présente au pipeline un contrat unique `offer(reading)` adossé à un
 * write-ahead buffer (WAB) borné en mémoire. Un flusher batche par taille
 * ou par âge et écrit vers le store externe avec retry infini.
 *
 * FONCTIONNEMENT :
 * - WAB = canal mpsc borné : offer() attend quand il est plein, c'est LE
 *   point de backpressure du pipeline (on bloque l'ingest, on ne jette pas)
 * - Échec d'écriture : backoff exponentiel 100ms -> 30s, retry sans limite
 * - Au shutdown : drain avec deadline ; ce qui reste est compté perdu
 *   (la gateway n'est PAS un write-ahead log : le WAB meurt avec le process,
 *   le plancher de durabilité est le dernier batch acquitté)
 *
 * UTILITÉ DANS SMARTSENSOR :
 * 🎯 Le pipeline ne voit jamais une erreur de store par frame, uniquement
 *    de la backpressure
 */

use crate::config::DurableConf;
use crate::metrics::GatewayMetrics;
use crate::models::Reading;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Erreur du store externe. Toutes sont transitoires du point de vue du
/// flusher : retry avec backoff, jamais de drop.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Contrat du store durable : append d'un batch, retourne le high-water
/// mark (nombre total de readings acquittées par le store).
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn append(&self, batch: &[Reading]) -> Result<i64, StoreError>;
    fn name(&self) -> &'static str;
}

/// Le WAB est fermé (shutdown en cours), la Reading n'a pas été acceptée
#[derive(Debug, thiserror::Error)]
#[error("durable sink closed")]
pub struct SinkClosed;

/// Poignée clonable du sink, détenue par les workers du pipeline
#[derive(Clone)]
pub struct DurableSink {
    tx: mpsc::Sender<Reading>,
    metrics: Arc<GatewayMetrics>,
}

impl DurableSink {
    /// Accepte une Reading dans le WAB. Attend si le WAB est plein :
    /// c'est ici que le shard du pipeline se gare (backpressure).
    pub async fn offer(&self, reading: Reading) -> Result<(), SinkClosed> {
        // la jauge est créditée avant le send : le flusher peut débiter
        // dès réception sans passer transitoirement sous zéro
        self.metrics.durable_wab_depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(reading).await.is_err() {
            self.metrics.durable_wab_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(SinkClosed);
        }
        Ok(())
    }
}

/// Démarre le flusher. La poignée retournée est à cloner dans les workers ;
/// quand toutes les copies sont tombées, le flusher draine puis s'arrête.
/// `drain_deadline` borne le temps de flush une fois le shutdown observé.
pub fn spawn(
    store: Arc<dyn ReadingStore>,
    conf: DurableConf,
    drain_deadline: Duration,
    metrics: Arc<GatewayMetrics>,
    shutdown: watch::Receiver<bool>,
) -> (DurableSink, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Reading>(conf.wab_capacity);
    let sink = DurableSink { tx, metrics: metrics.clone() };
    let handle = tokio::spawn(flusher(store, conf, drain_deadline, metrics, shutdown, rx));
    (sink, handle)
}

async fn flusher(
    store: Arc<dyn ReadingStore>,
    conf: DurableConf,
    drain: Duration,
    metrics: Arc<GatewayMetrics>,
    shutdown: watch::Receiver<bool>,
    mut rx: mpsc::Receiver<Reading>,
) {
    info!("[sink] flusher started (store: {}, batch: {}, age: {}ms)",
        store.name(), conf.batch_size, conf.batch_age_ms);

    let batch_age = Duration::from_millis(conf.batch_age_ms);
    let mut batch: Vec<Reading> = Vec::with_capacity(conf.batch_size);
    // armée à la première observation du shutdown, borne les retries
    let mut drain_deadline: Option<Instant> = None;

    loop {
        let first = match rx.recv().await {
            Some(r) => r,
            None => break, // plus aucun producteur et WAB vide : fini
        };
        metrics.durable_wab_depth.fetch_sub(1, Ordering::Relaxed);
        batch.push(first);

        let age_limit = Instant::now() + batch_age;
        let mut closed = false;
        while batch.len() < conf.batch_size {
            match tokio::time::timeout_at(age_limit, rx.recv()).await {
                Ok(Some(r)) => {
                    metrics.durable_wab_depth.fetch_sub(1, Ordering::Relaxed);
                    batch.push(r);
                }
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break, // âge atteint, on flush ce qu'on a
            }
        }

        flush_with_retry(&*store, &mut batch, &conf, drain, &metrics, &shutdown, &mut drain_deadline)
            .await;

        if closed {
            break;
        }
    }

    info!("[sink] flusher stopped");
}

/// Écrit le batch avec retry infini (borné par la deadline de drain si un
/// shutdown est en cours). Vide toujours le batch : flushé ou compté perdu.
async fn flush_with_retry(
    store: &dyn ReadingStore,
    batch: &mut Vec<Reading>,
    conf: &DurableConf,
    drain: Duration,
    metrics: &GatewayMetrics,
    shutdown: &watch::Receiver<bool>,
    drain_deadline: &mut Option<Instant>,
) {
    let mut backoff = Duration::from_millis(conf.retry_backoff_min_ms);
    let max_backoff = Duration::from_millis(conf.retry_backoff_max_ms);

    loop {
        if drain_deadline.is_none() && *shutdown.borrow() {
            *drain_deadline = Some(Instant::now() + drain);
        }
        if let Some(deadline) = *drain_deadline {
            if Instant::now() >= deadline {
                let lost = batch.len() as u64;
                metrics.shutdown_lost_readings.fetch_add(lost, Ordering::Relaxed);
                warn!("[sink] drain deadline hit, {} readings lost", lost);
                batch.clear();
                return;
            }
        }

        let started = Instant::now();
        match store.append(batch).await {
            Ok(hwm) => {
                metrics.record_flush_latency(started.elapsed().as_nanos() as u64);
                metrics
                    .durable_flushed_total
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                metrics.durable_last_write_unix.store(
                    time::OffsetDateTime::now_utc().unix_timestamp(),
                    Ordering::Relaxed,
                );
                tracing::debug!("[sink] flushed {} readings (hwm: {})", batch.len(), hwm);
                batch.clear();
                return;
            }
            Err(e) => {
                metrics.durable_flush_errors.fetch_add(1, Ordering::Relaxed);
                warn!("[sink] append failed ({}), retrying in {:?}", e, backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

// ===== Stores intégrés =====

/// Store no-op : acquitte tout, ne stocke rien (dev sans base)
pub struct NoopStore {
    hwm: AtomicI64,
}

impl NoopStore {
    pub fn new() -> Self {
        Self { hwm: AtomicI64::new(0) }
    }
}

impl Default for NoopStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingStore for NoopStore {
    async fn append(&self, batch: &[Reading]) -> Result<i64, StoreError> {
        Ok(self.hwm.fetch_add(batch.len() as i64, Ordering::Relaxed) + batch.len() as i64)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Store en mémoire : conserve tout, enregistre la taille des batchs.
/// Utilisé par les tests et le devkit.
pub struct MemStore {
    rows: parking_lot::Mutex<Vec<Reading>>,
    batch_sizes: parking_lot::Mutex<Vec<usize>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            rows: parking_lot::Mutex::new(Vec::new()),
            batch_sizes: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn rows(&self) -> Vec<Reading> {
        self.rows.lock().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().clone()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingStore for MemStore {
    async fn append(&self, batch: &[Reading]) -> Result<i64, StoreError> {
        let mut rows = self.rows.lock();
        rows.extend_from_slice(batch);
        self.batch_sizes.lock().push(batch.len());
        Ok(rows.len() as i64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Writer SQL batché (Postgres). Le schéma est créé de manière idempotente
/// à la connexion.
pub struct SqlStore {
    pool: PgPool,
    hwm: AtomicI64,
}

impl SqlStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        create_schema(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        info!("[sink] connected to durable store");
        Ok(Self { pool, hwm: AtomicI64::new(0) })
    }
}

/// Crée la table readings si absente (idempotent, appelé au démarrage)
async fn create_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            id               BIGSERIAL PRIMARY KEY,
            device_id        TEXT        NOT NULL,
            sensor_kind      TEXT        NOT NULL,
            position         TEXT        NOT NULL,
            value            DOUBLE PRECISION NOT NULL,
            unit             TEXT        NOT NULL,
            raw_key          TEXT,
            device_timestamp TIMESTAMPTZ NOT NULL,
            ingest_timestamp TIMESTAMPTZ NOT NULL,
            quality          TEXT        NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_device_id
            ON readings (device_id, ingest_timestamp);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[async_trait]
impl ReadingStore for SqlStore {
    async fn append(&self, batch: &[Reading]) -> Result<i64, StoreError> {
        if batch.is_empty() {
            return Ok(self.hwm.load(Ordering::Relaxed));
        }

        let mut qb = sqlx::QueryBuilder::new(
            "INSERT INTO readings (device_id, sensor_kind, position, value, unit, \
             raw_key, device_timestamp, ingest_timestamp, quality) ",
        );
        qb.push_values(batch, |mut b, r| {
            b.push_bind(&r.device_id)
                .push_bind(r.sensor_kind.label())
                .push_bind(r.position.label())
                .push_bind(r.value)
                .push_bind(&r.unit)
                .push_bind(&r.raw_key)
                .push_bind(r.device_timestamp)
                .push_bind(r.ingest_timestamp)
                .push_bind(r.quality.label());
        });

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(self.hwm.fetch_add(batch.len() as i64, Ordering::Relaxed) + batch.len() as i64)
    }

    fn name(&self) -> &'static str {
        "sql"
    }
}
