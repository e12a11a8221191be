/**
 * SMARTSENSOR GATEWAY - Point d'entrée principal
 *
 * RÔLE : Orchestration de tous les modules : config, ingest MQTT/HTTP,
 * pipeline, sink durable, hub WebSocket, alertes, santé.
 * Bootstrap du système complet avec gestion d'erreurs et logging.
 *
 * ARCHITECTURE : Télémétrie device -> ingest -> pipeline shardé ->
 * {store durable, broadcast temps réel, moteur d'alertes}.
 * UTILITÉ : Point d'administration unique de la flotte de capteurs.
 */

mod admission;
mod alerts;
mod codec;
mod config;
mod health;
mod http;
mod hub;
mod metrics;
mod models;
mod mqtt;
mod pipeline;
mod registry;
mod sink;
mod supervisor;

use anyhow::{Context, Result};
use supervisor::Supervisor;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = config::load_config().await;
    // toute incohérence de config est fatale ICI, jamais en cours de run
    cfg.validate().context("invalid configuration")?;

    tracing::info!(
        "[main] starting smartsensor-gateway v{} ({} shards, wab {})",
        env!("CARGO_PKG_VERSION"),
        cfg.pipeline.shards,
        cfg.durable.wab_capacity
    );

    let supervisor = Supervisor::build(cfg).await?;
    supervisor.run().await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .init();
}
