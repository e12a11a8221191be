/**
 * API HTTP - Ingest batch, stream WebSocket, admin devices/alertes, probes
 *
 * RÔLE :
 * Tout le plan HTTP de la gateway : POST /v1/ingest (batch de frames),
 * GET /v1/stream (upgrade WebSocket vers le hub), API admin du registre et
 * des alertes, et les endpoints d'observation /healthz /readyz /metrics.
 *
 * FONCTIONNEMENT :
 * - Auth bearer par middleware ; /healthz, /readyz et /metrics sont exempts
 * - Ingest : 202 {accepted, rejected, batch_id} dès que les frames sont
 *   ENFILÉES dans le pipeline (pas écrites), 503 + Retry-After sur
 *   backpressure (shard plein parce que le WAB se gare)
 * - 4xx (decode/auth) : jamais à re-tenter ; 503 : re-tentable
 */

use crate::admission::Admission;
use crate::alerts::OpenAlerts;
use crate::codec;
use crate::config::{Principal, Role, SecurityConf};
use crate::health::HealthTracker;
use crate::hub::SubscriberHub;
use crate::metrics::GatewayMetrics;
use crate::models::{DeviceKind, DeviceView};
use crate::pipeline::{Pipeline, WorkItem};
use crate::registry::{Resolution, SharedRegistry};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

/// Âge maximal du dernier write durable pour être "ready"
const READY_MAX_WRITE_AGE_SECS: i64 = 60;

/// Token brut conservé pour le fingerprint device (jamais loggé)
#[derive(Clone)]
pub struct AuthToken(pub String);

#[derive(Clone)]
pub struct AppState {
    pub registry: SharedRegistry,
    pub pipeline: Arc<Pipeline>,
    pub hub: Arc<SubscriberHub>,
    pub open_alerts: OpenAlerts,
    pub metrics: Arc<GatewayMetrics>,
    pub health: HealthTracker,
    pub security: SecurityConf,
    pub admission: Arc<Admission>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Middleware d'authentification : bearer obligatoire sauf pour les probes
async fn require_bearer(
    State(app): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/healthz" || path == "/readyz" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let Some(token) = bearer_token(req.headers()) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(principal) = app.security.principal_for(token) else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let token = token.to_string();
    req.extensions_mut().insert(principal);
    req.extensions_mut().insert(AuthToken(token));
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/ingest", post(ingest))
        .route("/v1/stream", get(stream))
        .route("/v1/devices", get(list_devices).post(provision_device))
        .route("/v1/devices/{id}", get(get_device).delete(evict_device))
        .route("/v1/devices/{id}/confirm", post(confirm_device))
        .route("/v1/alerts", get(list_alerts))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_bearer))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

// ===== Probes =====

/// Liveness : OK tant que le shutdown n'a pas commencé
async fn healthz(State(app): State<AppState>) -> Response {
    let health = app.health.get_health(&app.registry, &app.metrics);
    if app.health.is_shutting_down() {
        (StatusCode::SERVICE_UNAVAILABLE, Json(health)).into_response()
    } else {
        (StatusCode::OK, Json(health)).into_response()
    }
}

/// Readiness : session MQTT connectée ET dernier write durable récent
/// (un sink encore vierge de tout trafic compte comme prêt)
async fn readyz(State(app): State<AppState>) -> Response {
    let mqtt_ok = app.health.mqtt_connected();
    let last_write = app.metrics.durable_last_write_unix.load(Ordering::Relaxed);
    let flushed = app.metrics.durable_flushed_total.load(Ordering::Relaxed);
    let wab_depth = app.metrics.durable_wab_depth.load(Ordering::Relaxed);

    let write_ok = if flushed == 0 && wab_depth == 0 {
        true // aucun trafic encore : le sink n'a pas eu l'occasion d'écrire
    } else {
        OffsetDateTime::now_utc().unix_timestamp() - last_write < READY_MAX_WRITE_AGE_SECS
    };

    let body = serde_json::json!({ "mqtt": mqtt_ok, "durable": write_ok });
    if mqtt_ok && write_ok && !app.health.is_shutting_down() {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

/// Format texte Prometheus : compteurs gateway + sections pipeline et hub
async fn metrics(State(app): State<AppState>) -> Response {
    let mut out = String::with_capacity(4096);
    app.metrics.render_into(&mut out);
    app.pipeline.render_metrics(&mut out);
    app.hub.render_metrics(&mut out);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        out,
    )
        .into_response()
}

// ===== Ingest =====

#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: usize,
    rejected: usize,
    batch_id: Uuid,
}

async fn ingest(
    State(app): State<AppState>,
    connect_info: Result<ConnectInfo<SocketAddr>, axum::extract::rejection::ExtensionRejection>,
    Extension(principal): Extension<Principal>,
    Extension(AuthToken(token)): Extension<AuthToken>,
    Json(frames): Json<Vec<serde_json::Value>>,
) -> Response {
    if principal.role == Role::Dashboard {
        return StatusCode::FORBIDDEN.into_response();
    }

    let source_ip: IpAddr = connect_info
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let tenant_prefix = format!("{}_", principal.tenant);
    let now = OffsetDateTime::now_utc();

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut backpressure = false;

    for frame_value in frames {
        app.metrics.ingest_frames_http.fetch_add(1, Ordering::Relaxed);

        if !app.admission.admit_ip(source_ip) {
            app.metrics.ingest_rejected_rate.fetch_add(1, Ordering::Relaxed);
            rejected += 1;
            continue;
        }

        let payload = frame_value.to_string();
        let mut frame = match codec::decode_frame(payload.as_bytes(), now) {
            Ok(f) => f,
            Err(e) => {
                app.metrics.ingest_rejected_decode.fetch_add(1, Ordering::Relaxed);
                debug!("[http] undecodable frame in batch: {}", e);
                rejected += 1;
                continue;
            }
        };

        // un token device/tenant ne peut poster que pour son tenant
        if !principal.is_admin() && !frame.device_id.starts_with(&tenant_prefix) {
            app.metrics.ingest_rejected_auth.fetch_add(1, Ordering::Relaxed);
            rejected += 1;
            continue;
        }

        if !app.admission.admit_device(&frame.device_id) {
            app.metrics.ingest_rejected_rate.fetch_add(1, Ordering::Relaxed);
            rejected += 1;
            continue;
        }

        match app.registry.resolve(&frame.device_id, Some(&token)) {
            Resolution::Known(view) => {
                if view.quarantined {
                    codec::downgrade_quarantined(&mut frame.readings);
                }
            }
            Resolution::Unknown | Resolution::AuthFailed => {
                app.metrics.ingest_rejected_auth.fetch_add(1, Ordering::Relaxed);
                rejected += 1;
                continue;
            }
        }

        match app.pipeline.try_enqueue(WorkItem { frame, done: None }) {
            Ok(()) => accepted += 1,
            Err(_) => {
                backpressure = true;
                break;
            }
        }
    }

    if backpressure {
        app.metrics.ingest_rejected_backpressure.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "5")],
            Json(serde_json::json!({
                "error": "pipeline backpressure",
                "accepted": accepted,
                "rejected": rejected,
            })),
        )
            .into_response();
    }

    (
        StatusCode::ACCEPTED,
        Json(IngestResponse { accepted, rejected, batch_id: Uuid::new_v4() }),
    )
        .into_response()
}

// ===== Stream WebSocket =====

async fn stream(
    State(app): State<AppState>,
    Extension(principal): Extension<Principal>,
    ws: WebSocketUpgrade,
) -> Response {
    if principal.role == Role::Device {
        return StatusCode::FORBIDDEN.into_response();
    }
    let hub = app.hub.clone();
    ws.protocols(["smartsensor.v1"])
        .on_upgrade(move |socket| hub.run_session(socket, principal))
}

// ===== Admin : devices =====

fn require_admin(principal: &Principal) -> Result<(), StatusCode> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

async fn list_devices(
    State(app): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<DeviceView>>, StatusCode> {
    require_admin(&principal)?;
    Ok(Json(app.registry.list()))
}

async fn get_device(
    State(app): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    require_admin(&principal)?;
    app.registry.snapshot(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    device_id: String,
    kind: DeviceKind,
    cadence_secs: Option<u64>,
}

async fn provision_device(
    State(app): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<DeviceView>), StatusCode> {
    require_admin(&principal)?;
    let view = app.registry.provision_admin(&req.device_id, req.kind, req.cadence_secs);
    Ok((StatusCode::CREATED, Json(view)))
}

async fn evict_device(
    State(app): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    require_admin(&principal)?;
    if app.registry.evict(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
struct ConfirmRequest {
    kind: DeviceKind,
}

/// Sortie de quarantaine : un opérateur confirme le device et sa famille
async fn confirm_device(
    State(app): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<DeviceView>, StatusCode> {
    require_admin(&principal)?;
    if !app.registry.confirm(&id, req.kind) {
        return Err(StatusCode::NOT_FOUND);
    }
    app.registry.snapshot(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// ===== Admin : alertes =====

async fn list_alerts(
    State(app): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<crate::models::Alert>>, StatusCode> {
    require_admin(&principal)?;
    let mut alerts: Vec<_> = app.open_alerts.read().values().cloned().collect();
    alerts.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
    Ok(Json(alerts))
}
