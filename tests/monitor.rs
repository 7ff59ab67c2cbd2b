use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nexus_backend::config::RunnerSettings;
use nexus_backend::runner::command::{CommandOutput, CommandRunner};
use nexus_backend::runner::monitor::{MonitorTuning, TenantMonitor};
use nexus_backend::runner::publisher::EventSink;
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

struct StoppedEngine;

#[async_trait]
impl CommandRunner for StoppedEngine {
    async fn run(&self, _args: &[String]) -> std::io::Result<CommandOutput> {
        Ok(CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

fn runtime(root: &TempDir) -> Arc<RuntimeManager> {
    let mut settings = RunnerSettings::from_env();
    settings.tenant_root = root.path().join("tenants");
    settings.template_compose_path = PathBuf::from("/nonexistent/compose.tmpl");
    settings.template_env_path = PathBuf::from("/nonexistent/env.tmpl");
    Arc::new(RuntimeManager::new(settings, Arc::new(StoppedEngine)))
}

fn monitor(root: &TempDir, sink: Arc<RecordingSink>) -> Arc<TenantMonitor> {
    TenantMonitor::new(sink, runtime(root))
}

#[tokio::test]
async fn qr_frames_republish_as_whatsapp_qr() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message("abc123", r#"{"event":"whatsapp:qr","qr":"qr-token"}"#)
        .await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "whatsapp.qr");
    assert_eq!(events[0].2, json!({"qr": "qr-token"}));
}

#[tokio::test]
async fn qr_payload_prefers_explicit_payload_object() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message(
            "abc123",
            r#"{"event":"bridge.qrcode","payload":{"qr":"from-payload"},"qr":"top-level"}"#,
        )
        .await;

    let events = sink.events();
    assert_eq!(events[0].2, json!({"qr": "from-payload"}));
}

#[tokio::test]
async fn connected_frames_emit_status_running() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message("abc123", r#"{"event":"bridge.connected","payload":{"jid":"x"}}"#)
        .await;

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].1, "whatsapp.connected");
    assert_eq!(events[0].2, json!({"jid": "x"}));
    assert_eq!(events[1].1, "runtime.status");
    assert_eq!(events[1].2, json!({"state": "running"}));
}

#[tokio::test]
async fn disconnected_frames_emit_pending_pairing() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message("abc123", r#"{"event":"bridge.disconnected"}"#)
        .await;

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].1, "whatsapp.disconnected");
    assert_eq!(events[1].1, "runtime.status");
    assert_eq!(events[1].2, json!({"state": "pending_pairing"}));
}

#[tokio::test]
async fn traffic_frames_prove_the_link_is_up() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message("abc123", r#"{"event":"bridge.inbound_message","payload":{"id":"m1"}}"#)
        .await;

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].1, "whatsapp.connected");
    assert_eq!(events[0].2, json!({"source_event": "bridge.inbound_message"}));
    assert_eq!(events[1].2, json!({"state": "running"}));
}

#[tokio::test]
async fn bridge_errors_become_runtime_errors() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message("abc123", r#"{"event":"bridge.error","payload":{"message":"boom"}}"#)
        .await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "runtime.error");
    assert_eq!(events[0].2, json!({"message": "boom"}));
}

#[tokio::test]
async fn ready_frames_report_pending_pairing() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message("abc123", r#"{"event":"bridge_ready_state"}"#)
        .await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "runtime.status");
    assert_eq!(events[0].2, json!({"state": "pending_pairing"}));
}

#[tokio::test]
async fn unknown_qr_like_events_still_surface_the_code() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message("abc123", r#"{"event":"session.qr.refresh","code":"qr-2"}"#)
        .await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "whatsapp.qr");
    assert_eq!(events[0].2, json!({"qr": "qr-2"}));
}

#[tokio::test]
async fn unknown_events_land_in_the_log() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor
        .handle_message("abc123", r#"{"event":"bridge.metrics","payload":{"rss":1}}"#)
        .await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "runtime.log");
    assert_eq!(events[0].2.get("bridge_event"), Some(&json!("bridge.metrics")));
    assert_eq!(events[0].2.get("payload"), Some(&json!({"rss": 1})));
    assert!(events[0].2.get("raw_envelope").is_some());
}

#[tokio::test]
async fn non_json_frames_are_logged_raw() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let monitor = monitor(&root, sink.clone());

    monitor.handle_message("abc123", "plain text frame").await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1, "runtime.log");
    assert_eq!(events[0].2, json!({"raw": "plain text frame"}));
}

#[tokio::test]
async fn monitor_exits_cleanly_when_container_is_gone() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let tuning = MonitorTuning {
        startup_grace: Duration::from_millis(0),
        reconnect_grace: Duration::from_millis(0),
        runtime_error_cooldown: Duration::from_millis(0),
        max_backoff: Duration::from_millis(50),
    };
    let monitor = TenantMonitor::with_tuning(sink.clone(), runtime(&root), tuning);

    monitor.start("abc123").await;
    // Starting again while the task lives must not add a second task.
    monitor.start("abc123").await;
    assert!(monitor.active_count().await <= 1);

    // The bridge host does not resolve and `docker ps` reports the container
    // as stopped, so the supervisor exits instead of emitting runtime.error.
    let mut exited = false;
    for _ in 0..100 {
        if monitor.active_count().await == 0 {
            exited = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(exited, "monitor task should exit once the container is gone");
    assert!(sink
        .events()
        .iter()
        .all(|(_, event_type, _)| event_type != "runtime.error"));
}

#[tokio::test]
async fn stop_cancels_the_monitor_task() {
    let root = TempDir::new().unwrap();
    let sink = RecordingSink::new();
    let tuning = MonitorTuning {
        // Generous grace keeps the task alive while we cancel it.
        startup_grace: Duration::from_secs(60),
        ..MonitorTuning::default()
    };
    let monitor = TenantMonitor::with_tuning(sink, runtime(&root), tuning);

    monitor.start("abc123").await;
    assert_eq!(monitor.active_count().await, 1);
    assert_eq!(monitor.monitored_tenant_ids().await, vec!["abc123".to_string()]);

    monitor.stop("abc123").await;
    assert_eq!(monitor.active_count().await, 0);

    monitor.start("abc123").await;
    monitor.shutdown().await;
    assert_eq!(monitor.active_count().await, 0);
}
