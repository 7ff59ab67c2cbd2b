use std::net::SocketAddr;
use std::sync::Arc;

use axum::Extension;
use tokio::sync::RwLock;
use tracing_subscriber::{fmt, EnvFilter};

use nexus_backend::config::RunnerSettings;
use nexus_backend::runner::api::{internal_routes, RunnerContext};
use nexus_backend::runner::command::SystemCommandRunner;
use nexus_backend::runner::monitor::TenantMonitor;
use nexus_backend::runner::publisher::EventPublisher;
use nexus_backend::runner::reconciler::spawn_reconciler;
use nexus_backend::runner::runtime_manager::RuntimeManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();
    dotenvy::dotenv().ok();

    let settings = RunnerSettings::from_env();
    std::fs::create_dir_all(&settings.tenant_root)?;

    let publisher = Arc::new(EventPublisher::new(&settings.redis_url));
    publisher.start().await;

    let runtime = Arc::new(RuntimeManager::new(
        settings.clone(),
        Arc::new(SystemCommandRunner),
    ));
    let monitor = TenantMonitor::new(publisher.clone(), runtime.clone());
    let last_reconcile_at = Arc::new(RwLock::new(None));

    let reconciler = spawn_reconciler(
        runtime.clone(),
        monitor.clone(),
        publisher.clone(),
        last_reconcile_at.clone(),
    );

    let ctx = Arc::new(RunnerContext {
        settings: settings.clone(),
        runtime,
        monitor: monitor.clone(),
        publisher: publisher.clone(),
        last_reconcile_at,
    });

    let app = internal_routes().layer(Extension(ctx));

    let addr: SocketAddr = format!("{}:{}", settings.runner_host, settings.runner_port).parse()?;
    tracing::info!(%addr, "runner listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    reconciler.abort();
    monitor.shutdown().await;
    publisher.stop().await;
    Ok(())
}
