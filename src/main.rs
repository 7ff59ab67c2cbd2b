use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Json, Router};
use axum_prometheus::PrometheusMetricLayer;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{fmt, EnvFilter};

use nexus_backend::config::ControlSettings;
use nexus_backend::crypto::SecretCipher;
use nexus_backend::db;
use nexus_backend::events::EventManager;
use nexus_backend::rate_limit::SignupRateLimiter;
use nexus_backend::routes::api_routes;
use nexus_backend::runner_client::RunnerClient;
use nexus_backend::state::AppContext;

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let settings = ControlSettings::from_env();
    let cipher = SecretCipher::from_settings(&settings)
        .map_err(|e| anyhow::anyhow!("secret cipher init failed: {e}"))?;

    let pool = db::connect(&settings).await?;

    let events = EventManager::new(pool.clone(), &settings.redis_url);
    events.start().await;

    let signup_limiter =
        SignupRateLimiter::new(&settings.redis_url, settings.ratelimit_signup_per_minute);
    signup_limiter.start().await;

    let runner = RunnerClient::new(&settings);
    let ctx = Arc::new(AppContext {
        settings: settings.clone(),
        cipher,
        runner,
        events: events.clone(),
        signup_limiter,
    });

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(CorsLayer::permissive())
        .layer(Extension(pool.clone()))
        .layer(Extension(ctx.clone()));

    let addr: SocketAddr = format!("{}:{}", settings.control_host, settings.control_port).parse()?;
    tracing::info!(%addr, "control plane listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    ctx.events.stop().await;
    ctx.signup_limiter.stop().await;
    Ok(())
}
