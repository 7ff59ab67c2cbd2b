use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::HeaderMap;
use axum::response::Html;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use url::Url;

use crate::assistant::{load_secret_blob, store_secret_blob};
use crate::audit::record_admin_action;
use crate::config::ControlSettings;
use crate::crypto::GoogleSecretBlock;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::models::tenant_for_owner;
use crate::security::{create_google_oauth_state, decode_google_oauth_state};
use crate::state::AppContext;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub const GOOGLE_OAUTH_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/calendar.events",
    "https://www.googleapis.com/auth/drive.readonly",
    "https://www.googleapis.com/auth/drive.file",
    "https://www.googleapis.com/auth/contacts.readonly",
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/documents",
];

fn normalize_origin(raw: &str) -> String {
    let candidate = raw.trim();
    if candidate.is_empty() {
        return String::new();
    }
    let Ok(parsed) = Url::parse(candidate) else {
        return String::new();
    };
    let scheme = parsed.scheme().to_lowercase();
    let Some(host) = parsed.host_str() else {
        return String::new();
    };
    match parsed.port() {
        Some(port) => format!("{scheme}://{}:{port}", host.to_lowercase()),
        None => format!("{scheme}://{}", host.to_lowercase()),
    }
}

pub fn parse_allowed_origins(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(normalize_origin)
        .filter(|origin| !origin.is_empty())
        .collect()
}

fn request_origin(headers: &HeaderMap) -> String {
    if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        let normalized = normalize_origin(origin);
        if !normalized.is_empty() {
            return normalized;
        }
    }
    if let Some(referer) = headers.get("referer").and_then(|v| v.to_str().ok()) {
        let normalized = normalize_origin(referer);
        if !normalized.is_empty() {
            return normalized;
        }
    }
    String::new()
}

fn ensure_google_oauth_configured(settings: &ControlSettings) -> AppResult<()> {
    let mut missing = Vec::new();
    if settings.google_oauth_client_id.trim().is_empty() {
        missing.push("GOOGLE_OAUTH_CLIENT_ID");
    }
    if settings.google_oauth_client_secret.trim().is_empty() {
        missing.push("GOOGLE_OAUTH_CLIENT_SECRET");
    }
    if settings.google_oauth_redirect_uri.trim().is_empty() {
        missing.push("GOOGLE_OAUTH_REDIRECT_URI");
    }
    if settings.google_oauth_allowed_origins.trim().is_empty() {
        missing.push("GOOGLE_OAUTH_ALLOWED_ORIGINS");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::bad_request(
            "google_oauth_not_configured",
            format!("Missing Google OAuth config: {}", missing.join(", ")),
        ))
    }
}

fn ensure_origin_allowed(origin: &str, allowed: &HashSet<String>) -> AppResult<()> {
    if origin.is_empty() {
        return Err(AppError::bad_request(
            "google_oauth_origin_missing",
            "Could not resolve request origin",
        ));
    }
    if !allowed.contains(origin) {
        return Err(AppError::forbidden(
            "google_oauth_origin_forbidden",
            format!("Origin not allowed: {origin}"),
        ));
    }
    Ok(())
}

pub fn build_google_consent_url(client_id: &str, redirect_uri: &str, state: &str) -> String {
    let mut url = match Url::parse(GOOGLE_AUTH_URL) {
        Ok(url) => url,
        Err(_) => return GOOGLE_AUTH_URL.to_string(),
    };
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", &GOOGLE_OAUTH_SCOPES.join(" "))
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent")
        .append_pair("include_granted_scopes", "true")
        .append_pair("state", state);
    url.to_string()
}

async fn exchange_code_for_tokens(
    settings: &ControlSettings,
    code: &str,
) -> AppResult<Value> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(20))
        .build()
        .unwrap_or_default();
    let params = [
        ("code", code),
        ("client_id", settings.google_oauth_client_id.as_str()),
        ("client_secret", settings.google_oauth_client_secret.as_str()),
        ("redirect_uri", settings.google_oauth_redirect_uri.as_str()),
        ("grant_type", "authorization_code"),
    ];
    let response = client
        .post(GOOGLE_TOKEN_URL)
        .form(&params)
        .send()
        .await
        .map_err(|e| {
            AppError::bad_request("google_token_exchange_failed", format!("token exchange failed: {e}"))
        })?;
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    if status.as_u16() >= 400 {
        let mut message = text.clone();
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            let err = parsed.get("error").and_then(Value::as_str).unwrap_or("");
            let desc = parsed
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or("");
            let combined = format!("{err}: {desc}");
            let combined = combined.trim_matches([':', ' ']).to_string();
            if !combined.is_empty() {
                message = combined;
            }
        }
        return Err(AppError::bad_request("google_token_exchange_failed", message));
    }
    serde_json::from_str(&text).map_err(|e| {
        AppError::bad_request(
            "google_token_exchange_failed",
            format!("token endpoint returned invalid JSON: {e}"),
        )
    })
}

fn token_scopes(token_payload: &Value) -> Vec<String> {
    match token_payload.get("scope").and_then(Value::as_str) {
        Some(scopes) => scopes.split_whitespace().map(str::to_string).collect(),
        None => GOOGLE_OAUTH_SCOPES.iter().map(|s| s.to_string()).collect(),
    }
}

#[derive(Serialize)]
pub struct ConnectStartOut {
    pub tenant_id: String,
    pub authorize_url: String,
    pub expires_in_seconds: i64,
}

pub async fn connect_start(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Json<ConnectStartOut>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    ensure_google_oauth_configured(&ctx.settings)?;

    let allowed = parse_allowed_origins(&ctx.settings.google_oauth_allowed_origins);
    let origin = request_origin(&headers);
    ensure_origin_allowed(&origin, &allowed)?;

    let (state, ttl) = create_google_oauth_state(&ctx.settings, user.user_id, &tenant_id, &origin)?;
    let authorize_url = build_google_consent_url(
        &ctx.settings.google_oauth_client_id,
        &ctx.settings.google_oauth_redirect_uri,
        &state,
    );
    record_admin_action(
        &pool,
        Some(user.user_id),
        Some(tenant_id.as_str()),
        "google_connect_start",
        json!({"origin": origin}),
    )
    .await;
    Ok(Json(ConnectStartOut {
        tenant_id,
        authorize_url,
        expires_in_seconds: ttl,
    }))
}

#[derive(Serialize)]
pub struct GoogleStatusOut {
    pub tenant_id: String,
    pub connected: bool,
    pub scopes: Vec<String>,
    pub connected_at: Option<String>,
    pub last_error: Option<String>,
}

pub async fn google_status(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<GoogleStatusOut>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    let blob = load_secret_blob(&pool, &ctx, &tenant_id).await?;
    let (connected, scopes, connected_at) = match &blob.google {
        Some(google) => (true, google.scopes.clone(), Some(google.connected_at.clone())),
        None => (false, Vec::new(), None),
    };
    Ok(Json(GoogleStatusOut {
        tenant_id,
        connected,
        scopes,
        connected_at,
        last_error: blob.google_oauth_last_error,
    }))
}

pub async fn google_disconnect(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<Value>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;

    let mut blob = load_secret_blob(&pool, &ctx, &tenant_id).await?;
    blob.google = None;
    blob.google_oauth_last_error = None;
    store_secret_blob(&pool, &ctx, &tenant_id, &blob).await?;

    if let Err(err) = ctx.runner.google_disconnect(&tenant_id).await {
        ctx.events
            .emit(
                &tenant_id,
                "runtime.error",
                json!({"error": err.code, "message": err.message, "action": "google_disconnect"}),
            )
            .await;
        return Err(err.into());
    }

    ctx.events
        .emit(&tenant_id, "google.disconnected", json!({}))
        .await;
    record_admin_action(
        &pool,
        Some(user.user_id),
        Some(tenant_id.as_str()),
        "google_disconnect",
        json!({}),
    )
    .await;
    Ok(Json(json!({"tenant_id": tenant_id, "disconnected": true})))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

/// Popup page posted back to the opening window. The payload is scoped to the
/// origin captured in the state token.
fn popup_page(origin: &str, payload: &Value) -> Html<String> {
    let payload_js = payload.to_string().replace("</", "<\\/");
    let origin_js = serde_json::to_string(origin).unwrap_or_else(|_| "\"*\"".to_string());
    Html(format!(
        r#"<!DOCTYPE html>
<html>
  <head><title>Google Connection</title></head>
  <body>
    <p>You can close this window.</p>
    <script>
      (function () {{
        var payload = {payload_js};
        var origin = {origin_js};
        if (window.opener) {{
          window.opener.postMessage(payload, origin || "*");
        }}
        window.close();
      }})();
    </script>
  </body>
</html>
"#
    ))
}

async fn record_oauth_error(pool: &PgPool, ctx: &AppContext, tenant_id: &str, message: &str) {
    match load_secret_blob(pool, ctx, tenant_id).await {
        Ok(mut blob) => {
            blob.google_oauth_last_error = Some(message.to_string());
            if let Err(err) = store_secret_blob(pool, ctx, tenant_id, &blob).await {
                tracing::warn!(?err, %tenant_id, "failed to record oauth error");
            }
        }
        Err(err) => tracing::warn!(?err, %tenant_id, "failed to load secret for oauth error"),
    }
}

pub async fn google_callback(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    Query(params): Query<CallbackParams>,
) -> Html<String> {
    let Some(state_token) = params.state.as_deref() else {
        return popup_page(
            "",
            &json!({
                "type": "nexus.google.oauth",
                "status": "error",
                "error": "invalid_token",
                "message": "Missing OAuth state",
            }),
        );
    };
    let claims = match decode_google_oauth_state(&ctx.settings, state_token) {
        Ok(claims) => claims,
        Err(_) => {
            return popup_page(
                "",
                &json!({
                    "type": "nexus.google.oauth",
                    "status": "error",
                    "error": "invalid_token",
                    "message": "Invalid OAuth state",
                }),
            );
        }
    };
    let tenant_id = claims.tenant_id.clone();
    let origin = claims.origin.clone();

    let fail = |error: &str, message: String| {
        popup_page(
            &origin,
            &json!({
                "type": "nexus.google.oauth",
                "status": "error",
                "tenant_id": tenant_id,
                "error": error,
                "message": message,
            }),
        )
    };

    if let Some(denied) = params.error.as_deref() {
        let message = format!("Consent was denied: {denied}");
        record_oauth_error(&pool, &ctx, &claims.tenant_id, &message).await;
        return fail("google_oauth_denied", message);
    }
    let Some(code) = params.code.as_deref() else {
        let message = "Callback is missing the authorization code".to_string();
        record_oauth_error(&pool, &ctx, &claims.tenant_id, &message).await;
        return fail("google_oauth_missing_code", message);
    };

    let token_payload = match exchange_code_for_tokens(&ctx.settings, code).await {
        Ok(payload) => payload,
        Err(err) => {
            let message = err.to_string();
            record_oauth_error(&pool, &ctx, &claims.tenant_id, &message).await;
            return fail("google_token_exchange_failed", message);
        }
    };
    if token_payload
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .is_empty()
    {
        let message = "Google did not return a refresh token".to_string();
        record_oauth_error(&pool, &ctx, &claims.tenant_id, &message).await;
        return fail("google_oauth_refresh_token_missing", message);
    }
    if token_payload
        .get("access_token")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .is_empty()
    {
        let message = "Google did not return an access token".to_string();
        record_oauth_error(&pool, &ctx, &claims.tenant_id, &message).await;
        return fail("google_oauth_access_token_missing", message);
    }

    let google_block = GoogleSecretBlock {
        token_json: token_payload.clone(),
        scopes: token_scopes(&token_payload),
        connected_at: Utc::now().to_rfc3339(),
    };
    let store_result = async {
        let mut blob = load_secret_blob(&pool, &ctx, &claims.tenant_id).await?;
        blob.google = Some(google_block.clone());
        blob.google_oauth_last_error = None;
        store_secret_blob(&pool, &ctx, &claims.tenant_id, &blob).await
    }
    .await;
    if let Err(err) = store_result {
        let message = err.to_string();
        record_oauth_error(&pool, &ctx, &claims.tenant_id, &message).await;
        return fail("google_token_exchange_failed", message);
    }

    let runner_payload = json!({"token_json": google_block.token_json});
    if let Err(err) = ctx.runner.google_connect(&claims.tenant_id, &runner_payload).await {
        let message = err.message.clone();
        record_oauth_error(&pool, &ctx, &claims.tenant_id, &message).await;
        ctx.events
            .emit(
                &claims.tenant_id,
                "runtime.error",
                json!({"error": err.code, "message": err.message, "action": "google_connect"}),
            )
            .await;
        return fail("runner_error", message);
    }

    ctx.events
        .emit(
            &claims.tenant_id,
            "google.connected",
            json!({"scopes": google_block.scopes}),
        )
        .await;
    record_admin_action(
        &pool,
        Some(claims.user_id),
        Some(claims.tenant_id.as_str()),
        "google_connect",
        json!({"scopes": google_block.scopes}),
    )
    .await;

    popup_page(
        &origin,
        &json!({
            "type": "nexus.google.oauth",
            "status": "success",
            "tenant_id": claims.tenant_id,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_normalize_to_scheme_and_host() {
        assert_eq!(normalize_origin("https://App.Example.com/path"), "https://app.example.com");
        assert_eq!(
            normalize_origin("http://localhost:3000"),
            "http://localhost:3000"
        );
        assert_eq!(normalize_origin("not a url"), "");
        assert_eq!(normalize_origin(""), "");
    }

    #[test]
    fn allowed_origins_parse_from_csv() {
        let allowed = parse_allowed_origins("https://a.test, http://b.test:8080 ,,bad");
        assert!(allowed.contains("https://a.test"));
        assert!(allowed.contains("http://b.test:8080"));
        assert_eq!(allowed.len(), 2);
    }

    #[test]
    fn consent_url_carries_offline_access_and_state() {
        let url = build_google_consent_url("client-1", "https://cp.test/cb", "state-token");
        assert!(url.starts_with(GOOGLE_AUTH_URL));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=state-token"));
        assert!(url.contains("client_id=client-1"));
    }

    #[test]
    fn scopes_fall_back_to_full_set() {
        let explicit = token_scopes(&json!({"scope": "a b"}));
        assert_eq!(explicit, vec!["a".to_string(), "b".to_string()]);
        let fallback = token_scopes(&json!({}));
        assert_eq!(fallback.len(), GOOGLE_OAUTH_SCOPES.len());
    }
}
