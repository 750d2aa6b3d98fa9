/**
 * API REST VIGIL - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Interface humaine et point d'ingestion HTTP : enregistrement des
 * devices, ingestion d'audits, vues sessions/scores, envoi et retry de
 * commandes, santé du kernel.
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Validation côté middleware avant traitement métier
 * - Un audit au schéma invalide répond 422 avec la raison exacte
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::bus::TenantBus;
use crate::consolidate::Consolidator;
use crate::durable_log::LogEntry;
use crate::errors::CoreError;
use crate::health::{HealthBoard, HealthTracker, KernelHealth, ScoreView};
use crate::sessions::{CommandRecord, CommandResponseMsg, DeviceRegistry, DeviceView};
use crate::tenants::{Membership, TenantDirectory};

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("VIGIL_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("VIGIL_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub registry: DeviceRegistry,
    pub directory: TenantDirectory,
    pub consolidator: Arc<Consolidator>,
    pub board: Arc<HealthBoard>,
    pub tracker: HealthTracker,
    pub bus: Arc<TenantBus>,
    pub service_token: String,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/register", post(register_device))
        .route("/tenants", get(list_tenants).post(provision_tenant))
        .route("/tenants/{id}/rotate", post(rotate_tenant))
        .route("/tenants/{id}/replay", get(replay_tenant_log))
        .route("/ingest/audit", post(ingest_audit))
        .route("/devices", get(get_devices))
        .route("/devices/{id}", get(get_device))
        .route("/devices/{id}/scores", get(get_device_scores))
        .route("/devices/{id}/command", post(send_command))
        .route("/devices/{id}/decommission", post(decommission_device))
        .route("/scores/{tenant}", get(get_tenant_scores))
        .route("/commands/{id}", get(get_command))
        .route("/commands/{id}/retry", post(retry_command))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

/// Mapping erreur métier -> code HTTP, la raison passe dans le corps.
fn error_status(e: &CoreError) -> StatusCode {
    match e {
        CoreError::Schema(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::Authorization(_) => StatusCode::FORBIDDEN,
        CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
        CoreError::Consolidation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(e: &CoreError) -> (StatusCode, Json<Value>) {
    (error_status(e), Json(json!({ "error": e.to_string() })))
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    tenant_id: String,
}

// POST /tenants (provisioning : credential + ACL tenant.{id}.>)
async fn provision_tenant(
    State(app): State<AppState>,
    Json(req): Json<ProvisionRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cred = app
        .directory
        .provision_tenant(&req.tenant_id)
        .map_err(|e| error_body(&e))?;
    Ok(Json(json!({ "tenant_id": req.tenant_id, "token": cred.token })))
}

// GET /tenants (liste)
async fn list_tenants(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.directory.list_tenants())
}

// POST /tenants/:id/rotate (révoque l'ancien token, en émet un neuf)
async fn rotate_tenant(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cred = app.directory.rotate_tenant(&id).map_err(|e| error_body(&e))?;
    Ok(Json(json!({ "tenant_id": id, "token": cred.token })))
}

#[derive(Debug, Deserialize)]
struct ReplayParams {
    since: Option<u64>,
}

// GET /tenants/:id/replay?since=N (relecture du log durable du tenant)
async fn replay_tenant_log(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReplayParams>,
) -> Result<Json<Vec<LogEntry>>, (StatusCode, Json<Value>)> {
    if !app.directory.is_provisioned(&id) {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown tenant '{id}'") })),
        ));
    }
    let entries = app
        .bus
        .replay_since(&app.service_token, &id, params.since.unwrap_or(0))
        .map_err(|e| error_body(&e))?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    device_id: Option<String>,
    tenant: String,
    org: String,
    group: String,
    hostname: Option<String>,
}

// POST /register (handshake d'enregistrement)
async fn register_device(
    State(app): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let membership = Membership { tenant: req.tenant, org: req.org, group: req.group };
    let (device_id, cred) = app
        .registry
        .register_device(req.device_id, membership, req.hostname)
        .await
        .map_err(|e| error_body(&e))?;
    Ok(Json(json!({ "device_id": device_id, "token": cred.token })))
}

// POST /ingest/audit (rapport d'audit complet, schéma fixe)
async fn ingest_audit(
    State(app): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let report = crate::telemetry::AuditReport::validate(&payload).map_err(|e| error_body(&e))?;

    let Some(membership) = app.directory.membership(&report.device_id) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown device '{}'", report.device_id) })),
        ));
    };

    // Sans seq dans le payload, le rang vient du compteur de session du
    // device : un audit reste ordonnable face aux snapshots MQTT.
    let fallback_seq = match report.seq {
        Some(seq) => seq,
        None => app
            .registry
            .allocate_seq(&report.device_id)
            .await
            .map_err(|e| error_body(&e))?,
    };
    let entries = report.into_entries(&membership.tenant, fallback_seq);
    let queued = entries.len();
    for entry in entries {
        app.consolidator.enqueue(entry);
    }
    Ok(Json(json!({ "queued": queued })))
}

// GET /devices (liste)
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    Json(app.registry.list_views().await)
}

// GET /devices/:id (détail avec staleness)
async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    match app.registry.view(&id).await {
        Some(view) => Ok(Json(view)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// GET /devices/:id/scores (scores par catégorie)
async fn get_device_scores(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HashMap<String, i32>>, StatusCode> {
    if app.registry.get(&id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let scores: HashMap<String, i32> = app
        .board
        .device_scores(&id)
        .into_iter()
        .map(|(c, s)| (c.as_str().to_string(), s))
        .collect();
    Ok(Json(scores))
}

// GET /scores/:tenant (hiérarchie complète du tenant)
async fn get_tenant_scores(
    State(app): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<Vec<ScoreView>>, StatusCode> {
    if !app.directory.is_provisioned(&tenant) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(app.board.tenant_view(&tenant)))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command_type: String,
    parameters: Option<Value>,
}

// POST /devices/:id/command (dispatch corrélé, attente bornée)
async fn send_command(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandResponseMsg>, (StatusCode, Json<Value>)> {
    if app.registry.get(&id).await.is_none() {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown device '{id}'") })),
        ));
    }
    let response = app
        .registry
        .send_command(&id, &req.command_type, req.parameters)
        .await
        .map_err(|e| error_body(&e))?;
    Ok(Json(response))
}

// POST /devices/:id/decommission (terminal, révoque les droits bus)
async fn decommission_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match app.registry.decommission(&id).await {
        Ok(()) => Ok(Json(json!({ "status": "decommissioned" }))),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

// GET /commands/:id (trace d'une commande, échecs compris)
async fn get_command(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandRecord>, StatusCode> {
    match app.registry.command(&id) {
        Some(record) => Ok(Json(record)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// POST /commands/:id/retry (re-dispatch avec un correlation id neuf)
async fn retry_command(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponseMsg>, (StatusCode, Json<Value>)> {
    let response = app.registry.retry_command(&id).await.map_err(|e| error_body(&e))?;
    Ok(Json(response))
}

// GET /system/health (auto-santé du kernel)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let devices = app.registry.count().await as u32;
    let scores = app.board.tracked_count() as u32;
    Json(app.tracker.snapshot(devices, scores))
}
