use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::find_user;
use crate::security::decode_app_token;
use crate::state::AppContext;

/// Authenticated caller resolved from a bearer access token.
pub struct AuthUser {
    pub user_id: i32,
    pub email: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = parts
            .extensions
            .get::<Arc<AppContext>>()
            .cloned()
            .ok_or_else(|| AppError::Internal("application context missing".into()))?;
        let pool = parts
            .extensions
            .get::<PgPool>()
            .cloned()
            .ok_or_else(|| AppError::Internal("database pool missing".into()))?;

        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::unauthorized("missing_bearer_token", "Missing bearer token")
            })?;

        let claims = decode_app_token(&ctx.settings, &token)?;
        if claims.token_type != "access" {
            return Err(AppError::unauthorized("invalid_token", "Access token required"));
        }
        let user_id: i32 = claims
            .sub
            .parse()
            .map_err(|_| AppError::unauthorized("invalid_token", "Invalid token subject"))?;
        let user = find_user(&pool, user_id)
            .await?
            .ok_or_else(|| AppError::unauthorized("invalid_token", "User not found"))?;

        Ok(AuthUser {
            user_id: user.id,
            email: user.email,
        })
    }
}
