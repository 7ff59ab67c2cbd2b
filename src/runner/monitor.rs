use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::runner::publisher::EventSink;
use crate::runner::runtime_manager::RuntimeManager;

/// Grace and cooldown windows for one monitor. Defaults match production;
/// tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct MonitorTuning {
    pub startup_grace: Duration,
    pub reconnect_grace: Duration,
    pub runtime_error_cooldown: Duration,
    pub max_backoff: Duration,
}

impl Default for MonitorTuning {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(15),
            reconnect_grace: Duration::from_secs(20),
            runtime_error_cooldown: Duration::from_secs(10),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// One supervised bridge-consumer task per tenant. Starting is idempotent;
/// stopping cancels the task.
pub struct TenantMonitor {
    publisher: Arc<dyn EventSink>,
    runtime: Arc<RuntimeManager>,
    tuning: MonitorTuning,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TenantMonitor {
    pub fn new(publisher: Arc<dyn EventSink>, runtime: Arc<RuntimeManager>) -> Arc<Self> {
        Self::with_tuning(publisher, runtime, MonitorTuning::default())
    }

    pub fn with_tuning(
        publisher: Arc<dyn EventSink>,
        runtime: Arc<RuntimeManager>,
        tuning: MonitorTuning,
    ) -> Arc<Self> {
        Arc::new(Self {
            publisher,
            runtime,
            tuning,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn active_count(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.len()
    }

    pub async fn monitored_tenant_ids(&self) -> Vec<String> {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());
        let mut ids: Vec<String> = tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn start(self: &Arc<Self>, tenant_id: &str) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());
        if tasks.contains_key(tenant_id) {
            return;
        }
        let monitor = Arc::clone(self);
        let tenant = tenant_id.to_string();
        let handle = tokio::spawn(async move {
            monitor.run(tenant).await;
        });
        tasks.insert(tenant_id.to_string(), handle);
    }

    pub async fn stop(&self, tenant_id: &str) {
        let handle = self.tasks.lock().await.remove(tenant_id);
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> =
            self.tasks.lock().await.drain().collect();
        for (_, handle) in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn container_running(&self, tenant_id: &str) -> Option<bool> {
        match self.runtime.is_running(tenant_id).await {
            Ok((running, _)) => Some(running),
            Err(_) => None,
        }
    }

    async fn run(self: Arc<Self>, tenant_id: String) {
        let ws_url = match self.runtime.bridge_ws_url(&tenant_id) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(%tenant_id, ?err, "bridge monitor refused tenant id");
                return;
            }
        };

        let mut backoff = Duration::from_secs(1);
        let mut connected_once = false;
        let mut last_connected_at: Option<Instant> = None;
        let startup_grace_until = Instant::now() + self.tuning.startup_grace;
        let mut next_runtime_error_at = Instant::now();

        loop {
            let error = match self
                .connect_and_consume(
                    &tenant_id,
                    &ws_url,
                    &mut connected_once,
                    &mut last_connected_at,
                    &mut backoff,
                )
                .await
            {
                // Clean close: reconnect right away, the peer ended the
                // stream deliberately.
                Ok(()) => continue,
                Err(error) => error,
            };

            let now = Instant::now();
            let err_type = ws_error_type(&error);
            let transient = is_transient_ws_error(&error);
            let container_running = if transient {
                self.container_running(&tenant_id).await
            } else {
                None
            };

            let suppress_for_startup = transient && !connected_once && now < startup_grace_until;
            let suppress_for_reconnect = transient
                && connected_once
                && last_connected_at
                    .map(|at| now < at + self.tuning.reconnect_grace)
                    .unwrap_or(false);

            if transient
                && container_running == Some(false)
                && !(suppress_for_startup || suppress_for_reconnect)
            {
                tracing::info!(
                    %tenant_id,
                    %ws_url,
                    err_type,
                    err = %error,
                    monitor_action = "suppress_not_running",
                    "bridge monitor transient error"
                );
                return;
            }

            if suppress_for_startup || suppress_for_reconnect {
                tracing::info!(
                    %tenant_id,
                    %ws_url,
                    err_type,
                    err = %error,
                    ?container_running,
                    monitor_action = "suppress_grace",
                    grace_scope = if suppress_for_startup { "startup" } else { "reconnect" },
                    retry_in_seconds = backoff.as_secs_f64(),
                    "bridge monitor transient error"
                );
            } else if now >= next_runtime_error_at {
                tracing::warn!(
                    %tenant_id,
                    %ws_url,
                    err_type,
                    err = %error,
                    ?container_running,
                    monitor_action = "emit_runtime_error",
                    retry_in_seconds = backoff.as_secs_f64(),
                    "bridge monitor error"
                );
                self.publisher
                    .publish(
                        &tenant_id,
                        "runtime.error",
                        json!({
                            "message": format!("bridge_monitor_error: {error}"),
                            "retry_in_seconds": backoff.as_secs_f64(),
                        }),
                    )
                    .await;
                next_runtime_error_at = now + self.tuning.runtime_error_cooldown;
            } else {
                tracing::debug!(
                    %tenant_id,
                    %ws_url,
                    err_type,
                    err = %error,
                    monitor_action = "retry",
                    "bridge monitor transient error"
                );
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.tuning.max_backoff);
        }
    }

    async fn connect_and_consume(
        &self,
        tenant_id: &str,
        ws_url: &str,
        connected_once: &mut bool,
        last_connected_at: &mut Option<Instant>,
        backoff: &mut Duration,
    ) -> Result<(), WsError> {
        let mut request = ws_url.into_client_request()?;
        let secret = self.runtime.bridge_ws_secret(tenant_id).unwrap_or(None);
        if let Some(secret) = secret.as_deref() {
            if let Ok(value) = HeaderValue::from_str(secret) {
                request.headers_mut().insert("x-nexus-secret", value);
            }
        }

        let (mut stream, _) = connect_async(request).await?;
        tracing::info!(
            %tenant_id,
            %ws_url,
            auth = if secret.is_some() { "secret_header" } else { "none" },
            "bridge monitor connected"
        );
        *connected_once = true;
        *last_connected_at = Some(Instant::now());
        *backoff = Duration::from_secs(1);
        self.publisher
            .publish(tenant_id, "runtime.status", json!({"state": "pending_pairing"}))
            .await;

        while let Some(frame) = stream.next().await {
            match frame? {
                Message::Text(raw) => self.handle_message(tenant_id, &raw).await,
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Normalize and republish one raw bridge frame.
    pub async fn handle_message(&self, tenant_id: &str, raw: &str) {
        let Ok(envelope) = serde_json::from_str::<Value>(raw) else {
            self.publisher
                .publish(tenant_id, "runtime.log", json!({"raw": raw}))
                .await;
            return;
        };

        let event = normalized_event(&envelope);
        let payload = envelope_payload(&envelope);

        match event.as_deref() {
            Some("bridge.qr") => {
                let qr_payload = if payload.is_empty() {
                    extract_qr_payload(&envelope)
                } else {
                    payload
                };
                let qr_len = qr_payload
                    .get("qr")
                    .and_then(Value::as_str)
                    .map(str::len)
                    .unwrap_or(0);
                tracing::info!(%tenant_id, has_qr = qr_len > 0, qr_length = qr_len, "bridge qr event");
                self.publisher
                    .publish(tenant_id, "whatsapp.qr", Value::Object(qr_payload))
                    .await;
            }
            Some("bridge.connected") => {
                self.publisher
                    .publish(tenant_id, "whatsapp.connected", Value::Object(payload))
                    .await;
                self.publisher
                    .publish(tenant_id, "runtime.status", json!({"state": "running"}))
                    .await;
            }
            Some("bridge.disconnected") => {
                self.publisher
                    .publish(tenant_id, "whatsapp.disconnected", Value::Object(payload))
                    .await;
                self.publisher
                    .publish(tenant_id, "runtime.status", json!({"state": "pending_pairing"}))
                    .await;
            }
            Some(source @ ("bridge.inbound_message" | "bridge.delivery_receipt")) => {
                // Runtimes that never emit bridge.connected still prove the
                // link is up by moving traffic.
                self.publisher
                    .publish(tenant_id, "whatsapp.connected", json!({"source_event": source}))
                    .await;
                self.publisher
                    .publish(tenant_id, "runtime.status", json!({"state": "running"}))
                    .await;
            }
            Some("bridge.error") => {
                self.publisher
                    .publish(tenant_id, "runtime.error", Value::Object(payload))
                    .await;
            }
            Some("bridge.ready") => {
                self.publisher
                    .publish(tenant_id, "runtime.status", json!({"state": "pending_pairing"}))
                    .await;
            }
            other => {
                if let Some(name) = other {
                    if name.contains("qr") {
                        let qr_payload = if payload.is_empty() {
                            extract_qr_payload(&envelope)
                        } else {
                            payload.clone()
                        };
                        if !qr_payload.is_empty() {
                            self.publisher
                                .publish(tenant_id, "whatsapp.qr", Value::Object(qr_payload))
                                .await;
                            return;
                        }
                    }
                }
                self.publisher
                    .publish(
                        tenant_id,
                        "runtime.log",
                        json!({
                            "bridge_event": other,
                            "payload": Value::Object(payload),
                            "raw_envelope": envelope,
                        }),
                    )
                    .await;
            }
        }
    }
}

/// Bridge envelopes use `event`, `type`, or `name`; the first non-empty wins.
/// The raw token is lower-cased with `:`/`_` unified to `.`, then remapped
/// through the alias table.
pub fn normalized_event(envelope: &Value) -> Option<String> {
    let raw = ["event", "type", "name"]
        .iter()
        .filter_map(|key| envelope.get(*key).and_then(Value::as_str))
        .find(|value| !value.is_empty())?;
    let token = raw.trim().to_lowercase().replace([':', '_'], ".");
    let normalized = match token.as_str() {
        "whatsapp.qr" | "bridge.qrcode" | "bridge.qr.code" => "bridge.qr",
        "bridge.ready.state" => "bridge.ready",
        "bridge.inbound.message" => "bridge.inbound_message",
        "bridge.delivery.receipt" => "bridge.delivery_receipt",
        other => other,
    };
    Some(normalized.to_string())
}

/// `payload` when it is an object, else `data`, else empty.
pub fn envelope_payload(envelope: &Value) -> Map<String, Value> {
    if let Some(Value::Object(payload)) = envelope.get("payload") {
        if !payload.is_empty() {
            return payload.clone();
        }
    }
    if let Some(Value::Object(data)) = envelope.get("data") {
        return data.clone();
    }
    Map::new()
}

/// Promote a top-level QR string into `{qr: …}`.
pub fn extract_qr_payload(envelope: &Value) -> Map<String, Value> {
    for key in ["qr", "qr_code", "qrcode", "code"] {
        if let Some(value) = envelope.get(key).and_then(Value::as_str) {
            if !value.is_empty() {
                let mut map = Map::new();
                map.insert("qr".to_string(), Value::String(value.to_string()));
                return map;
            }
        }
    }
    Map::new()
}

fn ws_error_type(error: &WsError) -> &'static str {
    match error {
        WsError::ConnectionClosed => "ConnectionClosed",
        WsError::AlreadyClosed => "AlreadyClosed",
        WsError::Io(_) => "Io",
        WsError::Http(_) => "Http",
        WsError::Tls(_) => "Tls",
        WsError::Protocol(_) => "Protocol",
        WsError::Capacity(_) => "Capacity",
        WsError::Url(_) => "Url",
        WsError::HttpFormat(_) => "HttpFormat",
        _ => "Other",
    }
}

/// OS-level network errors and the closed/handshake-status family retry
/// quietly; anything else is unexpected.
fn is_transient_ws_error(error: &WsError) -> bool {
    matches!(
        error,
        WsError::Io(_) | WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Http(_)
    )
}
