use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::AppResult;
use crate::models::is_runtime_state;

const PUBSUB_PATTERN: &str = "tenant:*:events";
const MAX_SUPERVISOR_BACKOFF: Duration = Duration::from_secs(30);

struct WsSubscriber {
    id: u64,
    sender: UnboundedSender<String>,
}

/// Tenant-scoped event fan-out: publishes envelopes onto the shared bus,
/// persists every delivered envelope into the event log, projects selected
/// events into runtime state, and forwards wire frames to attached
/// WebSocket subscribers.
pub struct EventManager {
    pool: PgPool,
    redis_url: String,
    connections: DashMap<String, Vec<WsSubscriber>>,
    next_subscriber_id: AtomicU64,
    publish_conn: Mutex<Option<MultiplexedConnection>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl EventManager {
    pub fn new(pool: PgPool, redis_url: &str) -> Arc<Self> {
        Arc::new(Self {
            pool,
            redis_url: redis_url.to_string(),
            connections: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
            publish_conn: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    /// Launch the pub/sub consume supervisor.
    pub async fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.consume_supervisor().await;
        });
        *self.supervisor.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }
        *self.publish_conn.lock().await = None;
    }

    /// Attach a WebSocket subscriber for one tenant. Returns the id used to
    /// unregister it.
    pub fn register(&self, tenant_id: &str, sender: UnboundedSender<String>) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .entry(tenant_id.to_string())
            .or_default()
            .push(WsSubscriber { id, sender });
        id
    }

    pub fn unregister(&self, tenant_id: &str, subscriber_id: u64) {
        if let Some(mut subscribers) = self.connections.get_mut(tenant_id) {
            subscribers.retain(|s| s.id != subscriber_id);
        }
    }

    /// Emit one tenant-scoped event. The envelope goes to the shared bus when
    /// it is reachable; otherwise it is persisted and broadcast locally so
    /// delivery survives a bus outage.
    pub async fn emit(&self, tenant_id: &str, event_type: &str, payload: Value) {
        let envelope = json!({
            "tenant_id": tenant_id,
            "type": event_type,
            "payload": payload,
            "created_at": Utc::now().to_rfc3339(),
        });

        match self.publish(tenant_id, &envelope).await {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(
                    %tenant_id,
                    %event_type,
                    ?err,
                    "event publish failed; delivering locally"
                );
                self.persist_and_broadcast(&envelope).await;
            }
        }
    }

    async fn publish(&self, tenant_id: &str, envelope: &Value) -> Result<(), redis::RedisError> {
        let body = envelope.to_string();
        let channel = format!("tenant:{tenant_id}:events");
        let mut guard = self.publish_conn.lock().await;
        if guard.is_none() {
            let client = redis::Client::open(self.redis_url.as_str())?;
            let conn = client.get_multiplexed_async_connection().await?;
            *guard = Some(conn);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| redis::RedisError::from((redis::ErrorKind::IoError, "not connected")))?;
        let result: Result<i64, redis::RedisError> = conn.publish(&channel, &body).await;
        if let Err(err) = result {
            *guard = None;
            return Err(err);
        }
        Ok(())
    }

    async fn consume_supervisor(self: Arc<Self>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.consume_once().await {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                }
                Err(err) => {
                    tracing::warn!(?err, "event bus consume loop error");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_SUPERVISOR_BACKOFF);
        }
    }

    async fn consume_once(&self) -> Result<(), redis::RedisError> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut ping_conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut ping_conn)
            .await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(PUBSUB_PATTERN).await?;
        tracing::info!(pattern = PUBSUB_PATTERN, "event bus subscription established");

        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            let Ok(parsed) = serde_json::from_str::<Value>(&payload) else {
                continue;
            };
            self.persist_and_broadcast(&parsed).await;
        }
        Ok(())
    }

    /// Append the envelope to the event log, project runtime state, then fan
    /// the wire frame out to the tenant's subscribers. Failed sends evict the
    /// subscriber without disturbing the rest.
    pub async fn persist_and_broadcast(&self, envelope: &Value) {
        let tenant_id = envelope
            .get("tenant_id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if tenant_id.is_empty() {
            return;
        }
        let event_type = envelope
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("runtime.log")
            .to_string();
        let payload = match envelope.get("payload") {
            Some(value @ Value::Object(_)) => value.clone(),
            _ => json!({}),
        };

        let wire = match self
            .persist_event(&tenant_id, &event_type, &payload)
            .await
        {
            Ok(wire) => wire,
            Err(err) => {
                tracing::error!(?err, %tenant_id, %event_type, "event persistence failed");
                return;
            }
        };

        self.broadcast(&tenant_id, &wire.to_string());
    }

    async fn persist_event(
        &self,
        tenant_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> AppResult<Value> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO runtime_events (tenant_id, type, payload_json) \
             VALUES ($1, $2, $3) RETURNING id, created_at",
        )
        .bind(tenant_id)
        .bind(event_type)
        .bind(payload)
        .fetch_one(&mut tx)
        .await?;
        let event_id: i64 = row.get("id");
        let created_at: DateTime<Utc> = row.get("created_at");

        project_runtime_state(&mut tx, tenant_id, event_type, payload).await?;
        tx.commit().await?;

        Ok(json!({
            "event_id": event_id,
            "tenant_id": tenant_id,
            "type": event_type,
            "payload": payload,
            "created_at": created_at.to_rfc3339(),
        }))
    }

    fn broadcast(&self, tenant_id: &str, frame: &str) {
        let Some(mut subscribers) = self.connections.get_mut(tenant_id) else {
            return;
        };
        subscribers.retain(|subscriber| subscriber.sender.send(frame.to_string()).is_ok());
    }

    /// Wire frames for the most recent `limit` events, oldest first.
    pub async fn replay_recent(
        &self,
        tenant_id: &str,
        limit: i64,
        after_event_id: Option<i64>,
    ) -> AppResult<Vec<Value>> {
        let limit = limit.clamp(0, 200);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = match after_event_id {
            Some(after) => {
                sqlx::query(
                    "SELECT id, tenant_id, type, payload_json, created_at FROM runtime_events \
                     WHERE tenant_id = $1 AND id > $2 ORDER BY id DESC LIMIT $3",
                )
                .bind(tenant_id)
                .bind(after)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, tenant_id, type, payload_json, created_at FROM runtime_events \
                     WHERE tenant_id = $1 ORDER BY id DESC LIMIT $2",
                )
                .bind(tenant_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut frames: Vec<Value> = rows
            .into_iter()
            .map(|row| {
                let created_at: DateTime<Utc> = row.get("created_at");
                json!({
                    "event_id": row.get::<i64, _>("id"),
                    "tenant_id": row.get::<String, _>("tenant_id"),
                    "type": row.get::<String, _>("type"),
                    "payload": row.get::<Value, _>("payload_json"),
                    "created_at": created_at.to_rfc3339(),
                })
            })
            .collect();
        frames.reverse();
        Ok(frames)
    }
}

/// Project one event into `tenant_runtime` / `tenants.status`. Only the
/// event types below mutate state; everything else is log-only.
pub async fn project_runtime_state(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    event_type: &str,
    payload: &Value,
) -> AppResult<()> {
    let (mapped_state, mapped_error) = match event_type {
        "runtime.status" => {
            let state = payload.get("state").and_then(Value::as_str).unwrap_or("");
            if !is_runtime_state(state) {
                return Ok(());
            }
            let error = if state == "error" {
                Some(payload_error_message(payload))
            } else {
                None
            };
            (state.to_string(), error)
        }
        "runtime.error" => ("error".to_string(), Some(payload_error_message(payload))),
        "whatsapp.connected" => ("running".to_string(), None),
        "whatsapp.disconnected" => ("pending_pairing".to_string(), None),
        _ => return Ok(()),
    };

    let updated = sqlx::query(
        "UPDATE tenant_runtime SET actual_state = $2, last_heartbeat = now(), last_error = $3 \
         WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .bind(&mapped_state)
    .bind(mapped_error.as_deref())
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() > 0 {
        sqlx::query("UPDATE tenants SET status = $2, updated_at = now() WHERE id = $1")
            .bind(tenant_id)
            .bind(&mapped_state)
            .execute(&mut *tx)
            .await?;
    }
    Ok(())
}

fn payload_error_message(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| payload.get("error").and_then(Value::as_str))
        .unwrap_or("runtime_error")
        .to_string()
}
