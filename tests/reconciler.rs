use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nexus_backend::config::RunnerSettings;
use nexus_backend::runner::command::{CommandOutput, CommandRunner};
use nexus_backend::runner::monitor::TenantMonitor;
use nexus_backend::runner::publisher::EventSink;
use nexus_backend::runner::reconciler::reconcile_once;
use nexus_backend::runner::runtime_manager::RuntimeManager;
use serde_json::{json, Value};
use tempfile::TempDir;

struct RecordingSink {
    events: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<(String, String, Value)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, tenant_id: &str, event_type: &str, payload: Value) {
        self.events
            .lock()
            .unwrap()
            .push((tenant_id.to_string(), event_type.to_string(), payload));
    }
}

/// `docker ps` reports one running tenant container; everything else is
/// stopped.
struct OneRunningTenant;

#[async_trait]
impl CommandRunner for OneRunningTenant {
    async fn run(&self, args: &[String]) -> std::io::Result<CommandOutput> {
        let stdout = if args.contains(&"--format".to_string())
            && args.contains(&"{{.Names}}".to_string())
        {
            "tenant_abc123_runtime\n".to_string()
        } else if args.contains(&"name=tenant_abc123_runtime".to_string()) {
            "Up 2 minutes".to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            status: 0,
            stdout,
            stderr: String::new(),
        })
    }
}

#[tokio::test]
async fn sweep_publishes_running_and_paused_states() {
    let root = TempDir::new().unwrap();
    let mut settings = RunnerSettings::from_env();
    settings.tenant_root = root.path().join("tenants");
    settings.template_compose_path = PathBuf::from("/nonexistent/compose.tmpl");
    settings.template_env_path = PathBuf::from("/nonexistent/env.tmpl");
    std::fs::create_dir_all(settings.tenant_root.join("zzz999")).unwrap();

    let runtime = Arc::new(RuntimeManager::new(settings, Arc::new(OneRunningTenant)));
    let sink = RecordingSink::new();
    let monitor = TenantMonitor::new(sink.clone(), runtime.clone());

    let dyn_sink: Arc<dyn EventSink> = sink.clone();
    reconcile_once(&runtime, &monitor, &dyn_sink).await;

    let events = sink.events();
    // abc123 comes from the container listing, zzz999 from the on-disk layout.
    let abc: Vec<_> = events.iter().filter(|(t, _, _)| t == "abc123").collect();
    assert_eq!(abc.len(), 1);
    assert_eq!(abc[0].1, "runtime.status");
    assert_eq!(abc[0].2.get("state"), Some(&json!("running")));
    assert_eq!(abc[0].2.get("status"), Some(&json!("Up 2 minutes")));

    let zzz: Vec<_> = events.iter().filter(|(t, _, _)| t == "zzz999").collect();
    assert_eq!(zzz.len(), 1);
    assert_eq!(zzz[0].2.get("state"), Some(&json!("paused")));

    // The running tenant now has a supervisor; the stopped one does not.
    assert_eq!(monitor.monitored_tenant_ids().await, vec!["abc123".to_string()]);

    // A second sweep is idempotent for the monitored set.
    reconcile_once(&runtime, &monitor, &dyn_sink).await;
    assert_eq!(monitor.monitored_tenant_ids().await, vec!["abc123".to_string()]);

    monitor.shutdown().await;
}
