use axum::{
    routing::{get, post, put},
    Router,
};

use crate::{assistant, auth, events_ws, google_oauth, tenants};

pub fn api_routes() -> Router {
    Router::new()
        .route("/v1/auth/signup", post(auth::signup))
        .route("/v1/auth/login", post(auth::login))
        .route("/v1/auth/refresh", post(auth::refresh))
        .route("/v1/tenants/setup", post(tenants::setup_tenant))
        .route("/v1/tenants/:tenant_id/status", get(tenants::tenant_status))
        .route(
            "/v1/tenants/:tenant_id/runtime/start",
            post(tenants::start_runtime),
        )
        .route(
            "/v1/tenants/:tenant_id/runtime/stop",
            post(tenants::stop_runtime),
        )
        .route(
            "/v1/tenants/:tenant_id/runtime/restart",
            post(tenants::restart_runtime),
        )
        .route(
            "/v1/tenants/:tenant_id/whatsapp/pair/start",
            post(tenants::pair_start),
        )
        .route(
            "/v1/tenants/:tenant_id/whatsapp/disconnect",
            post(tenants::whatsapp_disconnect),
        )
        .route(
            "/v1/tenants/:tenant_id/google/connect/start",
            post(google_oauth::connect_start),
        )
        .route(
            "/v1/tenants/:tenant_id/google/status",
            get(google_oauth::google_status),
        )
        .route(
            "/v1/tenants/:tenant_id/google/disconnect",
            post(google_oauth::google_disconnect),
        )
        .route("/v1/oauth/google/callback", get(google_oauth::google_callback))
        .route(
            "/v1/tenants/:tenant_id/assistant/bootstrap",
            post(assistant::bootstrap_assistant),
        )
        .route(
            "/v1/tenants/:tenant_id/config",
            get(tenants::get_config).patch(tenants::patch_config),
        )
        .route("/v1/tenants/:tenant_id/prompts", get(tenants::get_prompts))
        .route(
            "/v1/tenants/:tenant_id/prompts/:name",
            put(tenants::put_prompt),
        )
        .route("/v1/tenants/:tenant_id/skills", get(tenants::get_skills))
        .route(
            "/v1/tenants/:tenant_id/skills/:skill_id",
            put(tenants::put_skill),
        )
        .route(
            "/v1/tenants/:tenant_id/events/recent",
            get(tenants::recent_events),
        )
        .route("/v1/events/ws", get(events_ws::events_ws))
}
