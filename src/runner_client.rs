use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

use crate::config::ControlSettings;
use crate::error::AppError;
use crate::security::create_runner_token;

/// Failure reported by (or while reaching) the runner.
#[derive(Debug)]
pub struct RunnerError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl RunnerError {
    fn transport(message: String) -> Self {
        Self {
            status: 502,
            code: "runner_http_error".into(),
            message,
        }
    }
}

impl From<RunnerError> for AppError {
    fn from(err: RunnerError) -> Self {
        AppError::Runner {
            status: err.status,
            code: err.code,
            message: err.message,
        }
    }
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// HTTP client for the runner's internal API. Every call carries a fresh
/// per-action bearer token scoped to exactly one tenant.
pub struct RunnerClient {
    http: reqwest::Client,
    base_url: String,
    settings: ControlSettings,
}

impl RunnerClient {
    pub fn new(settings: &ControlSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: settings.runner_base_url.trim_end_matches('/').to_string(),
            settings: settings.clone(),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        tenant_id: &str,
        action: &str,
        json_body: Option<&Value>,
    ) -> Result<Value, RunnerError> {
        let token = create_runner_token(&self.settings, tenant_id, action)
            .map_err(|e| RunnerError::transport(format!("runner token issuance failed: {e}")))?;
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = json_body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RunnerError::transport(format!("runner_http_error: {e}")))?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        if status >= 400 {
            let mut code = "runner_error".to_string();
            let mut message = text.clone();
            if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                match parsed.get("detail") {
                    Some(Value::Object(detail)) => {
                        if let Some(err) = detail.get("error").and_then(Value::as_str) {
                            code = err.to_string();
                        }
                        if let Some(msg) = detail.get("message").and_then(Value::as_str) {
                            message = msg.to_string();
                        }
                    }
                    Some(Value::String(detail)) => message = detail.clone(),
                    _ => {}
                }
            }
            return Err(RunnerError {
                status,
                code,
                message,
            });
        }

        if text.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&text)
            .map_err(|e| RunnerError::transport(format!("runner returned invalid JSON: {e}")))
    }

    pub async fn provision(&self, tenant_id: &str, payload: &Value) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/provision"),
            tenant_id,
            "provision",
            Some(payload),
        )
        .await
    }

    pub async fn start(&self, tenant_id: &str, payload: Option<&Value>) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/start"),
            tenant_id,
            "start",
            payload,
        )
        .await
    }

    pub async fn stop(&self, tenant_id: &str) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/stop"),
            tenant_id,
            "stop",
            None,
        )
        .await
    }

    pub async fn restart(&self, tenant_id: &str, payload: Option<&Value>) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/restart"),
            tenant_id,
            "restart",
            payload,
        )
        .await
    }

    pub async fn pair_start(&self, tenant_id: &str, payload: Option<&Value>) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/pair/start"),
            tenant_id,
            "pair_start",
            payload,
        )
        .await
    }

    pub async fn disconnect(&self, tenant_id: &str) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/whatsapp/disconnect"),
            tenant_id,
            "whatsapp_disconnect",
            None,
        )
        .await
    }

    pub async fn apply_config(&self, tenant_id: &str, payload: &Value) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/apply-config"),
            tenant_id,
            "apply_config",
            Some(payload),
        )
        .await
    }

    pub async fn google_connect(&self, tenant_id: &str, payload: &Value) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/google/connect"),
            tenant_id,
            "google_connect",
            Some(payload),
        )
        .await
    }

    pub async fn google_disconnect(&self, tenant_id: &str) -> Result<Value, RunnerError> {
        self.request(
            Method::POST,
            &format!("/internal/tenants/{tenant_id}/google/disconnect"),
            tenant_id,
            "google_disconnect",
            None,
        )
        .await
    }

    pub async fn health(&self, tenant_id: &str) -> Result<Value, RunnerError> {
        self.request(
            Method::GET,
            &format!("/internal/tenants/{tenant_id}/health"),
            tenant_id,
            "health",
            None,
        )
        .await
    }

    pub async fn delete(&self, tenant_id: &str) -> Result<Value, RunnerError> {
        self.request(
            Method::DELETE,
            &format!("/internal/tenants/{tenant_id}"),
            tenant_id,
            "delete",
            None,
        )
        .await
    }
}
