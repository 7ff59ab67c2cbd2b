use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::RunnerSettings;
use crate::error::{AppError, AppResult};
use crate::runner::auth::require_internal_auth;
use crate::runner::monitor::TenantMonitor;
use crate::runner::publisher::EventPublisher;
use crate::runner::reconciler::LastReconcileAt;
use crate::runner::runtime_manager::{validate_image_tag, RuntimeError, RuntimeManager};

/// Runner process context shared by every internal endpoint.
pub struct RunnerContext {
    pub settings: RunnerSettings,
    pub runtime: Arc<RuntimeManager>,
    pub monitor: Arc<TenantMonitor>,
    pub publisher: Arc<EventPublisher>,
    pub last_reconcile_at: LastReconcileAt,
}

#[derive(Deserialize)]
pub struct ProvisionRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub nexus_image: Option<String>,
    #[serde(default)]
    pub runtime_env: BTreeMap<String, String>,
    pub bridge_shared_secret: String,
}

#[derive(Deserialize, Default)]
pub struct StartRequest {
    #[serde(default)]
    pub nexus_image: Option<String>,
}

#[derive(Deserialize)]
pub struct PromptPayload {
    pub name: String,
    pub content: String,
}

#[derive(Deserialize)]
pub struct SkillPayload {
    pub skill_id: String,
    pub content: String,
}

#[derive(Deserialize)]
pub struct ApplyConfigRequest {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub prompts: Vec<PromptPayload>,
    #[serde(default)]
    pub skills: Vec<SkillPayload>,
    #[serde(default)]
    pub config_revision: Option<i32>,
}

#[derive(Deserialize)]
pub struct GoogleConnectRequest {
    pub token_json: Value,
}

#[derive(Serialize)]
pub struct GenericResponse {
    pub tenant_id: String,
    pub ok: bool,
    pub detail: &'static str,
}

impl GenericResponse {
    fn new(tenant_id: &str, detail: &'static str) -> Json<Self> {
        Json(Self {
            tenant_id: tenant_id.to_string(),
            ok: true,
            detail,
        })
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub tenant_id: String,
    pub container_running: bool,
    pub status_text: String,
    pub docker_available: bool,
    pub docker_status: String,
    pub redis_available: bool,
    pub active_monitors: usize,
    pub last_reconcile_at: Option<DateTime<Utc>>,
}

/// Publish the failure onto the tenant event stream, then surface it to the
/// HTTP caller with the mapped status.
async fn fail(ctx: &RunnerContext, tenant_id: &str, err: RuntimeError) -> AppError {
    ctx.publisher
        .publish(
            tenant_id,
            "runtime.error",
            json!({"error": err.code, "message": err.message}),
        )
        .await;
    err.into()
}

pub async fn healthz() -> Json<Value> {
    Json(json!({"ok": true}))
}

pub async fn provision_tenant(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ProvisionRequest>,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "provision")?;
    if body.tenant_id != tenant_id {
        return Err(AppError::bad_request("tenant_id_mismatch", "tenant_id mismatch"));
    }

    let result: Result<(), RuntimeError> = async {
        ctx.runtime.validate_tenant_id(&tenant_id)?;
        let image = match body.nexus_image.as_deref() {
            Some(image) if !image.trim().is_empty() => validate_image_tag(image)?,
            _ => validate_image_tag(&ctx.settings.nexus_image)?,
        };
        ctx.runtime.write_compose(&tenant_id, &image)?;
        let mut runtime_env = body.runtime_env.clone();
        runtime_env.insert("BRIDGE_SHARED_SECRET".to_string(), body.bridge_shared_secret.clone());
        ctx.runtime.write_runtime_env(&tenant_id, &runtime_env)?;
        ctx.runtime
            .write_config_files(&tenant_id, Some(&runtime_env), Some(&[]), Some(&[]))?;
        ctx.runtime.compose_up(&tenant_id, None).await?;
        Ok(())
    }
    .await;
    if let Err(err) = result {
        return Err(fail(&ctx, &tenant_id, err).await);
    }

    ctx.monitor.start(&tenant_id).await;
    ctx.publisher
        .publish(&tenant_id, "runtime.status", json!({"state": "pending_pairing"}))
        .await;
    Ok(GenericResponse::new(&tenant_id, "provisioned"))
}

pub async fn start_tenant(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<StartRequest>>,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "start")?;
    let image = body.and_then(|Json(b)| b.nexus_image);
    if let Err(err) = ctx.runtime.compose_start(&tenant_id, image.as_deref()).await {
        return Err(fail(&ctx, &tenant_id, err).await);
    }
    ctx.monitor.start(&tenant_id).await;
    ctx.publisher
        .publish(&tenant_id, "runtime.status", json!({"state": "running"}))
        .await;
    Ok(GenericResponse::new(&tenant_id, "started"))
}

pub async fn stop_tenant(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "stop")?;
    if let Err(err) = ctx.runtime.compose_stop(&tenant_id).await {
        return Err(fail(&ctx, &tenant_id, err).await);
    }
    ctx.publisher
        .publish(&tenant_id, "runtime.status", json!({"state": "paused"}))
        .await;
    Ok(GenericResponse::new(&tenant_id, "stopped"))
}

pub async fn restart_tenant(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<StartRequest>>,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "restart")?;
    let image = body.and_then(|Json(b)| b.nexus_image);
    if let Err(err) = ctx.runtime.compose_restart(&tenant_id, image.as_deref()).await {
        return Err(fail(&ctx, &tenant_id, err).await);
    }
    ctx.monitor.start(&tenant_id).await;
    ctx.publisher
        .publish(&tenant_id, "runtime.status", json!({"state": "running"}))
        .await;
    Ok(GenericResponse::new(&tenant_id, "restarted"))
}

pub async fn pair_start(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<StartRequest>>,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "pair_start")?;
    let image = body.and_then(|Json(b)| b.nexus_image);
    if let Err(err) = ctx.runtime.compose_start(&tenant_id, image.as_deref()).await {
        return Err(fail(&ctx, &tenant_id, err).await);
    }
    ctx.monitor.start(&tenant_id).await;
    ctx.publisher
        .publish(&tenant_id, "runtime.status", json!({"state": "pending_pairing"}))
        .await;
    Ok(GenericResponse::new(&tenant_id, "pairing_started"))
}

pub async fn apply_config(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ApplyConfigRequest>,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "apply_config")?;

    let prompts: Vec<(String, String)> = body
        .prompts
        .into_iter()
        .map(|p| (p.name, p.content))
        .collect();
    let skills: Vec<(String, String)> = body
        .skills
        .into_iter()
        .map(|s| (s.skill_id, s.content))
        .collect();

    let result: Result<(), RuntimeError> = async {
        ctx.runtime.write_runtime_env(&tenant_id, &body.env)?;
        ctx.runtime
            .write_config_files(&tenant_id, Some(&body.env), Some(&prompts), Some(&skills))?;
        ctx.runtime.compose_restart(&tenant_id, None).await?;
        Ok(())
    }
    .await;
    if let Err(err) = result {
        return Err(fail(&ctx, &tenant_id, err).await);
    }

    ctx.monitor.start(&tenant_id).await;
    ctx.publisher
        .publish(
            &tenant_id,
            "config.applied",
            json!({"config_revision": body.config_revision}),
        )
        .await;
    Ok(GenericResponse::new(&tenant_id, "config_applied"))
}

pub async fn whatsapp_disconnect(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "whatsapp_disconnect")?;

    let result: Result<(), RuntimeError> = async {
        ctx.runtime.clear_session_volume(&tenant_id).await?;
        ctx.runtime.compose_restart(&tenant_id, None).await?;
        Ok(())
    }
    .await;
    if let Err(err) = result {
        return Err(fail(&ctx, &tenant_id, err).await);
    }

    ctx.monitor.start(&tenant_id).await;
    ctx.publisher
        .publish(
            &tenant_id,
            "whatsapp.disconnected",
            json!({"reason": "disconnect_requested"}),
        )
        .await;
    Ok(GenericResponse::new(&tenant_id, "whatsapp_disconnected"))
}

pub async fn google_connect(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<GoogleConnectRequest>,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "google_connect")?;
    if let Err(err) = ctx.runtime.write_google_token(&tenant_id, &body.token_json) {
        return Err(fail(&ctx, &tenant_id, err).await);
    }
    Ok(GenericResponse::new(&tenant_id, "google_connected"))
}

pub async fn google_disconnect(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "google_disconnect")?;
    if let Err(err) = ctx.runtime.clear_google_token(&tenant_id) {
        return Err(fail(&ctx, &tenant_id, err).await);
    }
    Ok(GenericResponse::new(&tenant_id, "google_disconnected"))
}

pub async fn tenant_health(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<HealthResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "health")?;
    let (container_running, status_text) = ctx
        .runtime
        .is_running(&tenant_id)
        .await
        .map_err(AppError::from)?;
    let (docker_available, docker_status) = ctx.runtime.docker_available().await;
    let redis_available = ctx.publisher.is_healthy().await;
    Ok(Json(HealthResponse {
        tenant_id,
        container_running,
        status_text,
        docker_available,
        docker_status,
        redis_available,
        active_monitors: ctx.monitor.active_count().await,
        last_reconcile_at: *ctx.last_reconcile_at.read().await,
    }))
}

pub async fn delete_tenant(
    Extension(ctx): Extension<Arc<RunnerContext>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<GenericResponse>> {
    require_internal_auth(&ctx.settings, &headers, &tenant_id, "delete")?;
    ctx.monitor.stop(&tenant_id).await;

    let result: Result<(), RuntimeError> = async {
        ctx.runtime.compose_down(&tenant_id, true).await?;
        ctx.runtime.delete_tenant_files(&tenant_id)?;
        Ok(())
    }
    .await;
    if let Err(err) = result {
        return Err(fail(&ctx, &tenant_id, err).await);
    }
    Ok(GenericResponse::new(&tenant_id, "deleted"))
}

pub fn internal_routes() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/internal/tenants/:tenant_id/provision", post(provision_tenant))
        .route("/internal/tenants/:tenant_id/start", post(start_tenant))
        .route("/internal/tenants/:tenant_id/stop", post(stop_tenant))
        .route("/internal/tenants/:tenant_id/restart", post(restart_tenant))
        .route("/internal/tenants/:tenant_id/pair/start", post(pair_start))
        .route(
            "/internal/tenants/:tenant_id/apply-config",
            post(apply_config),
        )
        .route(
            "/internal/tenants/:tenant_id/whatsapp/disconnect",
            post(whatsapp_disconnect),
        )
        .route(
            "/internal/tenants/:tenant_id/google/connect",
            post(google_connect),
        )
        .route(
            "/internal/tenants/:tenant_id/google/disconnect",
            post(google_disconnect),
        )
        .route("/internal/tenants/:tenant_id/health", get(tenant_health))
        .route(
            "/internal/tenants/:tenant_id",
            axum::routing::delete(delete_tenant),
        )
}
