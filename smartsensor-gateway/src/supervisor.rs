/**
 * SUPERVISEUR - Cycle de vie du process et arrêt propre
 *
 * RÔLE :
 * Construit tous les composants explicitement (aucun global), possède
 * toutes les tasks long-vécues et leur ordre d'arrêt.
 *
 * FONCTIONNEMENT (SIGTERM) :
 * 1. /healthz cesse de répondre OK, les front-ends d'ingest s'arrêtent
 * 2. les shards du pipeline drainent (fini : l'entrée est coupée)
 * 3. le WAB flush avec deadline ; le reste est loggé et compté perdu
 * 4. le hub envoie une frame close à toutes les sockets
 * 5. le process sort
 *
 * UTILITÉ DANS SMARTSENSOR :
 * 🎯 L'ordre d'arrêt EST le contrat de durabilité : tout ce qui a reçu un
 *    202 est soit écrit, soit compté dans shutdown_lost_readings_total
 */

use crate::admission::Admission;
use crate::alerts::{self, AlertEngine, AlertSink, LogSink, RuleSet, WebhookSink};
use crate::config::GatewayConfig;
use crate::health::HealthTracker;
use crate::http::{build_router, AppState};
use crate::hub::SubscriberHub;
use crate::metrics::GatewayMetrics;
use crate::models::Severity;
use crate::mqtt::spawn_mqtt_ingest;
use crate::pipeline::{Pipeline, PipelineDeps};
use crate::registry::{DeviceRegistry, SharedRegistry};
use crate::sink::{self, NoopStore, ReadingStore, SqlStore};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Supervisor {
    cfg: GatewayConfig,
    registry: SharedRegistry,
    metrics: Arc<GatewayMetrics>,
    health: HealthTracker,
    pipeline: Arc<Pipeline>,
    hub: Arc<SubscriberHub>,
    shutdown_tx: watch::Sender<bool>,
    mqtt_handle: JoinHandle<()>,
    http_handle: JoinHandle<()>,
    sink_handle: JoinHandle<()>,
    engine_handle: JoinHandle<()>,
    dispatch_handle: JoinHandle<()>,
    aux_handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Construit la gateway entière. Tout échec ici est fatal : on préfère
    /// refuser de démarrer que d'échouer en cours de run.
    pub async fn build(cfg: GatewayConfig) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(GatewayMetrics::default());
        let health = HealthTracker::new();
        let registry: SharedRegistry = Arc::new(DeviceRegistry::new(cfg.registry.clone()));

        // store durable : SQL si configuré, no-op sinon (dev)
        let store: Arc<dyn ReadingStore> = match &cfg.durable.url {
            Some(url) => Arc::new(
                SqlStore::connect(url)
                    .await
                    .context("cannot connect to durable store")?,
            ),
            None => {
                warn!("[supervisor] no durable.url configured, using no-op store");
                Arc::new(NoopStore::new())
            }
        };
        let (durable_sink, sink_handle) = sink::spawn(
            store,
            cfg.durable.clone(),
            Duration::from_secs(cfg.shutdown.drain_deadline_secs),
            metrics.clone(),
            shutdown_rx.clone(),
        );

        // moteur d'alertes + sink de dispatch
        let rules = RuleSet::load(&cfg.alerts.rules_path)
            .await
            .context("cannot load alert rules")?;
        let alert_sink: Arc<dyn AlertSink> = match &cfg.alerts.webhook_url {
            Some(url) => Arc::new(WebhookSink::new(url.clone())),
            None => Arc::new(LogSink),
        };
        let (alert_engine, open_alerts, engine_handle, dispatch_handle) = alerts::spawn(
            rules,
            vec![], // seam anomalies : aucun détecteur embarqué
            cfg.alerts.clone(),
            alert_sink,
            metrics.clone(),
            Duration::from_secs(1),
        );

        let hub = Arc::new(SubscriberHub::new(cfg.subscribers.clone(), metrics.clone()));

        let pipeline = Arc::new(Pipeline::spawn(
            cfg.pipeline.clone(),
            PipelineDeps {
                registry: registry.clone(),
                sink: durable_sink,
                hub: hub.clone(),
                alerts: alert_engine.clone(),
                metrics: metrics.clone(),
            },
        ));

        let admission = Arc::new(Admission::new(cfg.admission.clone()));

        // front-end MQTT
        let mqtt_handle = spawn_mqtt_ingest(
            cfg.ingest.mqtt.clone(),
            registry.clone(),
            pipeline.clone(),
            admission.clone(),
            health.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
        );

        // front-end HTTP
        let app_state = AppState {
            registry: registry.clone(),
            pipeline: pipeline.clone(),
            hub: hub.clone(),
            open_alerts,
            metrics: metrics.clone(),
            health: health.clone(),
            security: cfg.security.clone(),
            admission,
        };
        let router = build_router(app_state);
        let addr: SocketAddr = cfg
            .ingest
            .http
            .bind
            .parse()
            .with_context(|| format!("bad ingest.http.bind '{}'", cfg.ingest.http.bind))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind {}", addr))?;
        info!("[supervisor] http listening on {}", addr);

        let mut http_shutdown = shutdown_rx.clone();
        let http_handle = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = serve.await {
                error!("[supervisor] http server error: {}", e);
            }
        });

        let mut aux_handles = Vec::new();

        // publication santé sur MQTT (comme le reste de la flotte SmartSensor)
        if !cfg.ingest.mqtt.disabled {
            aux_handles.push(health.spawn_health_publisher(
                cfg.ingest.mqtt.clone(),
                registry.clone(),
                metrics.clone(),
            ));
        }

        // sweep TTL du registre
        aux_handles.push(spawn_registry_sweep(registry.clone(), shutdown_rx.clone()));

        // auto-monitoring : le WAB qui sature et les drops abonnés élevés
        // remontent par le même sink d'alertes, tagués source=gateway
        aux_handles.push(spawn_self_monitor(
            alert_engine,
            metrics.clone(),
            cfg.durable.wab_capacity,
            shutdown_rx,
        ));

        Ok(Self {
            cfg,
            registry,
            metrics,
            health,
            pipeline,
            hub,
            shutdown_tx,
            mqtt_handle,
            http_handle,
            sink_handle,
            engine_handle,
            dispatch_handle,
            aux_handles,
        })
    }

    /// Bloque jusqu'à SIGTERM/SIGINT puis déroule l'arrêt propre
    pub async fn run(self) -> Result<()> {
        wait_for_signal().await;
        info!("[supervisor] shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(self) {
        let drain = Duration::from_secs(self.cfg.shutdown.drain_deadline_secs);

        // 1. liveness down + stop des front-ends
        self.health.begin_shutdown();
        let _ = self.shutdown_tx.send(true);
        let _ = self.mqtt_handle.await;
        let _ = self.http_handle.await;
        info!("[supervisor] ingest front-ends stopped");

        // 2. drain du pipeline (fini : l'entrée est coupée)
        self.pipeline.close().await;

        // 3. flush du WAB sous deadline
        match tokio::time::timeout(drain + Duration::from_secs(5), self.sink_handle).await {
            Ok(_) => {}
            Err(_) => warn!("[supervisor] sink flusher did not stop within deadline"),
        }
        let lost = self.metrics.shutdown_lost_readings.load(Ordering::Relaxed);
        if lost > 0 {
            warn!("[supervisor] {} readings lost at shutdown (past drain deadline)", lost);
        }

        // 4. fermeture des abonnés
        self.hub.close_all("gateway shutting down");

        // 5. arrêt du moteur d'alertes et des tasks auxiliaires
        for h in self.aux_handles {
            h.abort();
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.engine_handle).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.dispatch_handle).await;

        info!(
            "[supervisor] shutdown complete ({} devices tracked, {} lost readings)",
            self.registry.len(),
            lost
        );
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("[supervisor] cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn spawn_registry_sweep(
    registry: SharedRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(600));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    registry.evict_idle();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

/// Surveillance de la gateway par elle-même, alertes edge-triggered
fn spawn_self_monitor(
    alerts: AlertEngine,
    metrics: Arc<GatewayMetrics>,
    wab_capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        tick.tick().await;
        let mut wab_alerted = false;
        let mut last_drops = 0u64;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let depth = metrics.durable_wab_depth.load(Ordering::Relaxed).max(0) as usize;
                    if depth * 10 >= wab_capacity * 9 {
                        if !wab_alerted {
                            wab_alerted = true;
                            alerts.raise_gateway(
                                "wab_near_full",
                                Severity::Warning,
                                depth as f64,
                                (wab_capacity * 9 / 10) as f64,
                            ).await;
                        }
                    } else if depth * 10 < wab_capacity * 8 {
                        wab_alerted = false;
                    }

                    let drops = metrics.subscriber_dropped_frames.load(Ordering::Relaxed);
                    let delta = drops.saturating_sub(last_drops);
                    last_drops = drops;
                    if delta > 1_000 {
                        alerts.raise_gateway(
                            "subscriber_drop_rate_high",
                            Severity::Info,
                            delta as f64,
                            1_000.0,
                        ).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}
