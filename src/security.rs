use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::config::ControlSettings;
use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct AppClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunnerClaims {
    pub sub: String,
    pub tenant_id: String,
    pub action: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GoogleStateClaims {
    #[serde(rename = "type")]
    pub token_type: String,
    pub user_id: i32,
    pub tenant_id: String,
    pub origin: String,
    pub nonce: String,
    pub iat: i64,
    pub exp: i64,
}

fn algorithm(alg: &str) -> Algorithm {
    alg.parse().unwrap_or(Algorithm::HS256)
}

fn encode_token<T: Serialize>(claims: &T, secret: &str, alg: &str) -> AppResult<String> {
    encode(
        &Header::new(algorithm(alg)),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("token encoding failed: {e}")))
}

/// Issue an access token; returns `(token, expires_in_seconds)`.
pub fn create_access_token(
    settings: &ControlSettings,
    user_id: i32,
    email: &str,
) -> AppResult<(String, i64)> {
    let now = Utc::now();
    let lifetime = Duration::minutes(settings.access_token_minutes);
    let claims = AppClaims {
        sub: user_id.to_string(),
        email: Some(email.to_string()),
        token_type: "access".into(),
        iat: now.timestamp(),
        exp: (now + lifetime).timestamp(),
    };
    let token = encode_token(&claims, &settings.app_jwt_secret, &settings.app_jwt_alg)?;
    Ok((token, lifetime.num_seconds()))
}

pub fn create_refresh_token(settings: &ControlSettings, user_id: i32) -> AppResult<String> {
    let now = Utc::now();
    let claims = AppClaims {
        sub: user_id.to_string(),
        email: None,
        token_type: "refresh".into(),
        iat: now.timestamp(),
        exp: (now + Duration::days(settings.refresh_token_days)).timestamp(),
    };
    encode_token(&claims, &settings.app_jwt_secret, &settings.app_jwt_alg)
}

pub fn decode_app_token(settings: &ControlSettings, token: &str) -> AppResult<AppClaims> {
    let mut validation = Validation::new(algorithm(&settings.app_jwt_alg));
    validation.validate_exp = true;
    decode::<AppClaims>(
        token,
        &DecodingKey::from_secret(settings.app_jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::unauthorized("invalid_token", "Invalid token"))
}

/// Issue a short-lived per-action token for one runner call.
pub fn create_runner_token(
    settings: &ControlSettings,
    tenant_id: &str,
    action: &str,
) -> AppResult<String> {
    let now = Utc::now();
    let claims = RunnerClaims {
        sub: format!("tenant:{tenant_id}"),
        tenant_id: tenant_id.to_string(),
        action: action.to_string(),
        aud: "runner".into(),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(settings.runner_token_ttl_seconds)).timestamp(),
    };
    encode_token(&claims, &settings.runner_shared_secret, &settings.app_jwt_alg)
}

/// Verify a runner token against the expected tenant and action. Signature or
/// audience problems report `invalid_token`; scope mismatches report their own
/// codes so operators can tell misrouted calls from forged ones.
pub fn verify_runner_token(
    secret: &str,
    alg: &str,
    token: &str,
    tenant_id: &str,
    action: &str,
) -> AppResult<RunnerClaims> {
    let mut validation = Validation::new(algorithm(alg));
    validation.set_audience(&["runner"]);
    let claims = decode::<RunnerClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::forbidden("invalid_token", "Invalid internal JWT"))?;
    if claims.tenant_id != tenant_id {
        return Err(AppError::forbidden("tenant_scope_mismatch", "tenant_id mismatch"));
    }
    if claims.action != action {
        return Err(AppError::forbidden("action_scope_mismatch", "action mismatch"));
    }
    Ok(claims)
}

/// Issue the OAuth state token; returns `(token, ttl_seconds)`.
pub fn create_google_oauth_state(
    settings: &ControlSettings,
    user_id: i32,
    tenant_id: &str,
    origin: &str,
) -> AppResult<(String, i64)> {
    let now = Utc::now();
    let ttl = settings.google_oauth_state_ttl_seconds;
    let claims = GoogleStateClaims {
        token_type: "google_oauth_state".into(),
        user_id,
        tenant_id: tenant_id.to_string(),
        origin: origin.to_string(),
        nonce: random_urlsafe(16),
        iat: now.timestamp(),
        exp: (now + Duration::seconds(ttl)).timestamp(),
    };
    let token = encode_token(&claims, &settings.app_jwt_secret, &settings.app_jwt_alg)?;
    Ok((token, ttl))
}

pub fn decode_google_oauth_state(
    settings: &ControlSettings,
    token: &str,
) -> AppResult<GoogleStateClaims> {
    let validation = Validation::new(algorithm(&settings.app_jwt_alg));
    let claims = decode::<GoogleStateClaims>(
        token,
        &DecodingKey::from_secret(settings.app_jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::unauthorized("invalid_token", "Invalid OAuth state token"))?;
    if claims.token_type != "google_oauth_state" {
        return Err(AppError::unauthorized("invalid_token", "Invalid OAuth state token"));
    }
    Ok(claims)
}

/// URL-safe random string from `len` bytes of OS entropy.
pub fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Random lower-case hex string over `len` bytes (tenant ids use 8 bytes).
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ControlSettings {
        let mut s = ControlSettings::from_env();
        s.app_jwt_secret = "test-app-secret".into();
        s.app_jwt_alg = "HS256".into();
        s.access_token_minutes = 15;
        s.refresh_token_days = 30;
        s.runner_shared_secret = "test-runner-secret".into();
        s.runner_token_ttl_seconds = 60;
        s
    }

    #[test]
    fn access_token_round_trips() {
        let settings = settings();
        let (token, expires) = create_access_token(&settings, 7, "a@b.test").unwrap();
        assert_eq!(expires, 15 * 60);
        let claims = decode_app_token(&settings, &token).unwrap();
        assert_eq!(claims.sub, "7");
        assert_eq!(claims.token_type, "access");
        assert_eq!(claims.email.as_deref(), Some("a@b.test"));
    }

    #[test]
    fn refresh_token_carries_refresh_type() {
        let settings = settings();
        let token = create_refresh_token(&settings, 7).unwrap();
        let claims = decode_app_token(&settings, &token).unwrap();
        assert_eq!(claims.token_type, "refresh");
    }

    #[test]
    fn runner_token_scopes_are_enforced() {
        let settings = settings();
        let token = create_runner_token(&settings, "abc123", "start").unwrap();
        let secret = settings.runner_shared_secret.as_str();

        let claims = verify_runner_token(secret, "HS256", &token, "abc123", "start").unwrap();
        assert_eq!(claims.aud, "runner");
        assert_eq!(claims.sub, "tenant:abc123");

        let err = verify_runner_token(secret, "HS256", &token, "other", "start").unwrap_err();
        assert_eq!(err.code(), "tenant_scope_mismatch");

        let err = verify_runner_token(secret, "HS256", &token, "abc123", "stop").unwrap_err();
        assert_eq!(err.code(), "action_scope_mismatch");

        let err = verify_runner_token("wrong-secret", "HS256", &token, "abc123", "start").unwrap_err();
        assert_eq!(err.code(), "invalid_token");
    }

    #[test]
    fn google_state_requires_matching_type() {
        let settings = settings();
        let (state, ttl) =
            create_google_oauth_state(&settings, 1, "abc123", "https://app.test").unwrap();
        assert_eq!(ttl, settings.google_oauth_state_ttl_seconds);
        let claims = decode_google_oauth_state(&settings, &state).unwrap();
        assert_eq!(claims.tenant_id, "abc123");
        assert_eq!(claims.origin, "https://app.test");

        let (access, _) = create_access_token(&settings, 1, "a@b.test").unwrap();
        assert!(decode_google_oauth_state(&settings, &access).is_err());
    }

    #[test]
    fn random_identifiers_have_expected_shape() {
        let id = random_hex(8);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(random_urlsafe(24).len() >= 24);
    }
}
