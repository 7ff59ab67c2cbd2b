use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Query};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::security::decode_app_token;
use crate::state::AppContext;

const POLICY_VIOLATION: u16 = 1008;
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Deserialize)]
pub struct EventsWsParams {
    pub token: Option<String>,
    pub tenant_id: Option<String>,
    pub replay: Option<i64>,
    pub after_event_id: Option<i64>,
}

pub async fn events_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<EventsWsParams>,
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, pool, ctx))
}

async fn reject(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(
    socket: WebSocket,
    params: EventsWsParams,
    pool: PgPool,
    ctx: Arc<AppContext>,
) {
    let Some(token) = params.token.as_deref() else {
        return reject(socket, "missing token").await;
    };
    let claims = match decode_app_token(&ctx.settings, token) {
        Ok(claims) if claims.token_type == "access" => claims,
        _ => return reject(socket, "invalid token").await,
    };
    let Ok(user_id) = claims.sub.parse::<i32>() else {
        return reject(socket, "invalid token").await;
    };

    let tenant = match crate::models::tenant_for_owner_user(&pool, user_id).await {
        Ok(Some(tenant)) => tenant,
        _ => return reject(socket, "no tenant").await,
    };
    if let Some(requested) = params.tenant_id.as_deref() {
        if requested != tenant.id {
            return reject(socket, "foreign tenant").await;
        }
    }
    let tenant_id = tenant.id;

    let (mut sink, mut stream) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let subscriber_id = ctx.events.register(&tenant_id, frame_tx.clone());

    // Single writer task owns the sink; live events, replay, and keepalives
    // all flow through the channel so frame order is preserved.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let ready = json!({"type": "ws.ready", "tenant_id": &tenant_id, "payload": {"status": "ok"}});
    let _ = frame_tx.send(ready.to_string());

    let replay_limit = params.replay.unwrap_or(20).clamp(0, 200);
    match ctx
        .events
        .replay_recent(&tenant_id, replay_limit, params.after_event_id)
        .await
    {
        Ok(frames) => {
            for frame in frames {
                if frame_tx.send(frame.to_string()).is_err() {
                    break;
                }
            }
        }
        Err(err) => {
            tracing::warn!(?err, %tenant_id, "event replay failed");
        }
    }

    loop {
        match tokio::time::timeout(KEEPALIVE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(_))) => continue,
            Err(_) => {
                let keepalive =
                    json!({"type": "ws.keepalive", "tenant_id": &tenant_id, "payload": {}});
                if frame_tx.send(keepalive.to_string()).is_err() {
                    break;
                }
            }
        }
    }

    ctx.events.unregister(&tenant_id, subscriber_id);
    writer.abort();
}
