use axum::http::HeaderMap;

use crate::config::RunnerSettings;
use crate::error::{AppError, AppResult};
use crate::security::{verify_runner_token, RunnerClaims};

/// Enforce the per-action bearer token on an internal endpoint. The token
/// must be runner-audience, signed with the shared secret, and scoped to this
/// exact tenant and action.
pub fn require_internal_auth(
    settings: &RunnerSettings,
    headers: &HeaderMap,
    tenant_id: &str,
    action: &str,
) -> AppResult<RunnerClaims> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::unauthorized("missing_bearer_token", "Missing bearer token"))?;
    verify_runner_token(
        &settings.runner_shared_secret,
        &settings.runner_jwt_alg,
        token,
        tenant_id,
        action,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlSettings;
    use crate::security::create_runner_token;
    use axum::http::HeaderValue;

    fn control_settings() -> ControlSettings {
        let mut settings = ControlSettings::from_env();
        settings.runner_shared_secret = "shared-secret".into();
        settings.app_jwt_alg = "HS256".into();
        settings.runner_token_ttl_seconds = 60;
        settings
    }

    fn runner_settings() -> RunnerSettings {
        let mut settings = RunnerSettings::from_env();
        settings.runner_shared_secret = "shared-secret".into();
        settings.runner_jwt_alg = "HS256".into();
        settings
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn missing_header_is_unauthorized() {
        let err =
            require_internal_auth(&runner_settings(), &HeaderMap::new(), "abc123", "start")
                .unwrap_err();
        assert_eq!(err.code(), "missing_bearer_token");
    }

    #[test]
    fn scoped_token_is_accepted() {
        let token = create_runner_token(&control_settings(), "abc123", "start").unwrap();
        let claims =
            require_internal_auth(&runner_settings(), &bearer(&token), "abc123", "start").unwrap();
        assert_eq!(claims.tenant_id, "abc123");
        assert_eq!(claims.action, "start");
    }

    #[test]
    fn wrong_tenant_and_action_fail_with_distinct_codes() {
        let token = create_runner_token(&control_settings(), "abc123", "start").unwrap();
        let err =
            require_internal_auth(&runner_settings(), &bearer(&token), "zzz999", "start").unwrap_err();
        assert_eq!(err.code(), "tenant_scope_mismatch");

        let err =
            require_internal_auth(&runner_settings(), &bearer(&token), "abc123", "stop").unwrap_err();
        assert_eq!(err.code(), "action_scope_mismatch");
    }

    #[test]
    fn garbage_token_is_forbidden() {
        let err = require_internal_auth(&runner_settings(), &bearer("garbage"), "abc123", "start")
            .unwrap_err();
        assert_eq!(err.code(), "invalid_token");
    }
}
