use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::runner::monitor::TenantMonitor;
use crate::runner::publisher::EventSink;
use crate::runner::runtime_manager::RuntimeManager;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

pub type LastReconcileAt = Arc<RwLock<Option<DateTime<Utc>>>>;

/// One sweep over tenant ids present on disk or as running containers:
/// running tenants get a monitor (idempotent) and a running status event,
/// stopped ones a paused status event.
pub async fn reconcile_once(
    runtime: &RuntimeManager,
    monitor: &Arc<TenantMonitor>,
    sink: &Arc<dyn EventSink>,
) {
    let mut tenant_ids: BTreeSet<String> = BTreeSet::new();

    if let Ok(entries) = std::fs::read_dir(&runtime.settings().tenant_root) {
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    tenant_ids.insert(name.to_string());
                }
            }
        }
    }
    if let Ok(running) = runtime.list_running_tenant_ids().await {
        tenant_ids.extend(running);
    }

    for tenant_id in &tenant_ids {
        let (running, status_text) = match runtime.is_running(tenant_id).await {
            Ok(result) => result,
            Err(_) => continue,
        };
        if running {
            monitor.start(tenant_id).await;
            sink.publish(
                tenant_id,
                "runtime.status",
                json!({"state": "running", "status": status_text}),
            )
            .await;
        } else {
            sink.publish(
                tenant_id,
                "runtime.status",
                json!({"state": "paused", "status": status_text}),
            )
            .await;
        }
    }
}

/// Periodic sweep aligning actual container state with the monitored set.
pub fn spawn_reconciler(
    runtime: Arc<RuntimeManager>,
    monitor: Arc<TenantMonitor>,
    sink: Arc<dyn EventSink>,
    last_reconcile_at: LastReconcileAt,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            reconcile_once(&runtime, &monitor, &sink).await;
            *last_reconcile_at.write().await = Some(Utc::now());
            tokio::time::sleep(RECONCILE_INTERVAL).await;
        }
    })
}
