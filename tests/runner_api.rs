use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::{Extension, Router};
use nexus_backend::config::{ControlSettings, RunnerSettings};
use nexus_backend::runner::api::{internal_routes, RunnerContext};
use nexus_backend::runner::command::{CommandOutput, CommandRunner};
use nexus_backend::runner::monitor::TenantMonitor;
use nexus_backend::runner::publisher::EventPublisher;
use nexus_backend::runner::runtime_manager::RuntimeManager;
use nexus_backend::security::create_runner_token;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::RwLock;
use tower::ServiceExt;

struct OkEngine;

#[async_trait]
impl CommandRunner for OkEngine {
    async fn run(&self, _args: &[String]) -> std::io::Result<CommandOutput> {
        Ok(CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

fn runner_settings(root: &TempDir) -> RunnerSettings {
    let mut settings = RunnerSettings::from_env();
    settings.runner_shared_secret = "contract-secret".into();
    settings.runner_jwt_alg = "HS256".into();
    settings.redis_url = "redis://127.0.0.1:1/0".into();
    settings.tenant_root = root.path().join("tenants");
    settings.template_compose_path = PathBuf::from("/nonexistent/compose.tmpl");
    settings.template_env_path = PathBuf::from("/nonexistent/env.tmpl");
    settings.nexus_image = "ghcr.io/acme/nexus:1".into();
    settings
}

fn control_settings() -> ControlSettings {
    let mut settings = ControlSettings::from_env();
    settings.runner_shared_secret = "contract-secret".into();
    settings.app_jwt_alg = "HS256".into();
    settings.runner_token_ttl_seconds = 60;
    settings
}

fn app(root: &TempDir) -> (Router, Arc<RunnerContext>) {
    let settings = runner_settings(root);
    let publisher = Arc::new(EventPublisher::new(&settings.redis_url));
    let runtime = Arc::new(RuntimeManager::new(settings.clone(), Arc::new(OkEngine)));
    let monitor = TenantMonitor::new(publisher.clone(), runtime.clone());
    let ctx = Arc::new(RunnerContext {
        settings,
        runtime,
        monitor,
        publisher,
        last_reconcile_at: Arc::new(RwLock::new(None)),
    });
    (internal_routes().layer(Extension(ctx.clone())), ctx)
}

fn bearer_for(tenant_id: &str, action: &str) -> String {
    let token = create_runner_token(&control_settings(), tenant_id, action).unwrap();
    format!("Bearer {token}")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, auth: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn health_requires_bearer_token() {
    let root = TempDir::new().unwrap();
    let (app, _ctx) = app(&root);

    let response = app
        .oneshot(json_request(
            "GET",
            "/internal/tenants/abc123/health",
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["detail"]["error"], json!("missing_bearer_token"));
}

#[tokio::test]
async fn wrong_tenant_scope_is_forbidden() {
    let root = TempDir::new().unwrap();
    let (app, _ctx) = app(&root);

    let response = app
        .oneshot(json_request(
            "GET",
            "/internal/tenants/abc123/health",
            Some(&bearer_for("zzz999", "health")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["detail"]["error"], json!("tenant_scope_mismatch"));
}

#[tokio::test]
async fn wrong_action_scope_is_forbidden() {
    let root = TempDir::new().unwrap();
    let (app, _ctx) = app(&root);

    let response = app
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/stop",
            Some(&bearer_for("abc123", "start")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["detail"]["error"], json!("action_scope_mismatch"));
}

#[tokio::test]
async fn health_reports_engine_and_monitor_state() {
    let root = TempDir::new().unwrap();
    let (app, _ctx) = app(&root);

    let response = app
        .oneshot(json_request(
            "GET",
            "/internal/tenants/abc123/health",
            Some(&bearer_for("abc123", "health")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tenant_id"], json!("abc123"));
    assert_eq!(body["container_running"], json!(false));
    assert_eq!(body["docker_available"], json!(true));
    assert_eq!(body["redis_available"], json!(false));
    assert_eq!(body["active_monitors"], json!(0));
    assert!(body["last_reconcile_at"].is_null());
}

#[tokio::test]
async fn provision_rejects_tenant_id_mismatch() {
    let root = TempDir::new().unwrap();
    let (app, _ctx) = app(&root);

    let response = app
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/provision",
            Some(&bearer_for("abc123", "provision")),
            Some(json!({
                "tenant_id": "other",
                "runtime_env": {},
                "bridge_shared_secret": "secret",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["detail"]["error"], json!("tenant_id_mismatch"));
}

#[tokio::test]
async fn provision_then_apply_config_converges_files() {
    let root = TempDir::new().unwrap();
    let (app, ctx) = app(&root);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/provision",
            Some(&bearer_for("abc123", "provision")),
            Some(json!({
                "tenant_id": "abc123",
                "runtime_env": {"NEXUS_OPENROUTER_API_KEY": "sk-x"},
                "bridge_shared_secret": "bridge-secret",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["detail"], json!("provisioned"));

    let env = ctx.runtime.read_runtime_env("abc123").unwrap();
    assert_eq!(
        env.get("BRIDGE_SHARED_SECRET").map(String::as_str),
        Some("bridge-secret")
    );
    assert_eq!(
        env.get("NEXUS_OPENROUTER_API_KEY").map(String::as_str),
        Some("sk-x")
    );

    let response = app
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/apply-config",
            Some(&bearer_for("abc123", "apply_config")),
            Some(json!({
                "env": {"NEXUS_OPENROUTER_API_KEY": "sk-x", "EXTRA_FLAG": "1"},
                "prompts": [{"name": "system", "content": "prompt body"}],
                "skills": [{"skill_id": "google_workspace", "content": "skill body"}],
                "config_revision": 2,
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["detail"], json!("config_applied"));

    let env = ctx.runtime.read_runtime_env("abc123").unwrap();
    assert_eq!(env.get("EXTRA_FLAG").map(String::as_str), Some("1"));
    // The bridge secret from provisioning survives the rewrite.
    assert_eq!(
        env.get("BRIDGE_SHARED_SECRET").map(String::as_str),
        Some("bridge-secret")
    );
    let prompt = ctx.runtime.prompts_dir("abc123").unwrap().join("system.md");
    assert_eq!(std::fs::read_to_string(prompt).unwrap(), "prompt body");
    let skill = ctx
        .runtime
        .skills_dir("abc123")
        .unwrap()
        .join("google_workspace.md");
    assert_eq!(std::fs::read_to_string(skill).unwrap(), "skill body");
}

#[tokio::test]
async fn invalid_config_item_maps_to_bad_request() {
    let root = TempDir::new().unwrap();
    let (app, _ctx) = app(&root);

    // Provision first so the compose file exists for the restart step.
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/provision",
            Some(&bearer_for("abc123", "provision")),
            Some(json!({
                "tenant_id": "abc123",
                "runtime_env": {},
                "bridge_shared_secret": "secret",
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/apply-config",
            Some(&bearer_for("abc123", "apply_config")),
            Some(json!({
                "env": {},
                "prompts": [{"name": "../escape", "content": "x"}],
                "skills": [],
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["detail"]["error"], json!("invalid_config_item"));
}

#[tokio::test]
async fn google_token_round_trip_through_endpoints() {
    let root = TempDir::new().unwrap();
    let (app, ctx) = app(&root);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/google/connect",
            Some(&bearer_for("abc123", "google_connect")),
            Some(json!({"token_json": {"access_token": "a", "refresh_token": "r"}})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(ctx.runtime.google_token_path("abc123").unwrap().exists());

    let response = app
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/google/disconnect",
            Some(&bearer_for("abc123", "google_disconnect")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!ctx.runtime.google_token_path("abc123").unwrap().exists());
}

#[tokio::test]
async fn missing_compose_maps_to_not_found() {
    let root = TempDir::new().unwrap();
    let (app, _ctx) = app(&root);

    let response = app
        .oneshot(json_request(
            "POST",
            "/internal/tenants/abc123/start",
            Some(&bearer_for("abc123", "start")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["detail"]["error"], json!("tenant_not_found"));
}
