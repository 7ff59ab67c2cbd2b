use std::net::SocketAddr;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::extract::{ConnectInfo, Extension};
use axum::Json;
use chrono::{DateTime, Utc};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::error;

use crate::error::{AppError, AppResult};
use crate::models::find_user_by_email;
use crate::security::{create_access_token, create_refresh_token, decode_app_token};
use crate::state::AppContext;

#[derive(Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct UserOut {
    pub id: i32,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in_seconds: i64,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub user: UserOut,
    pub tokens: AuthTokens,
}

fn validate_credentials_shape(email: &str, password: &str) -> AppResult<String> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') || email.len() > 320 {
        return Err(AppError::bad_request("invalid_credentials", "Invalid email address"));
    }
    if password.len() < 8 || password.len() > 256 {
        return Err(AppError::bad_request(
            "invalid_credentials",
            "Password must be between 8 and 256 characters",
        ));
    }
    Ok(email)
}

fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))
}

fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(password_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn issue_tokens(ctx: &AppContext, user_id: i32, email: &str) -> AppResult<AuthTokens> {
    let (access_token, expires_in_seconds) = create_access_token(&ctx.settings, user_id, email)?;
    let refresh_token = create_refresh_token(&ctx.settings, user_id)?;
    Ok(AuthTokens {
        access_token,
        refresh_token,
        token_type: "bearer",
        expires_in_seconds,
    })
}

pub async fn signup(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<SignupRequest>,
) -> AppResult<Json<AuthResponse>> {
    ctx.signup_limiter.check(&addr.ip().to_string()).await?;

    let email = validate_credentials_shape(&payload.email, &payload.password)?;
    if find_user_by_email(&pool, &email).await?.is_some() {
        return Err(AppError::conflict(
            "email_already_registered",
            "Email already registered",
        ));
    }

    let password_hash = hash_password(&payload.password)?;
    let inserted = sqlx::query(
        "INSERT INTO users (email, password_hash) VALUES ($1, $2) RETURNING id, created_at",
    )
    .bind(&email)
    .bind(&password_hash)
    .fetch_one(&pool)
    .await;

    let row = match inserted {
        Ok(row) => row,
        Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
            return Err(AppError::conflict(
                "email_already_registered",
                "Email already registered",
            ));
        }
        Err(err) => {
            error!(?err, "signup insert failed");
            return Err(AppError::Db(err));
        }
    };

    let user_id: i32 = row.get("id");
    let created_at: DateTime<Utc> = row.get("created_at");
    let tokens = issue_tokens(&ctx, user_id, &email)?;
    Ok(Json(AuthResponse {
        user: UserOut {
            id: user_id,
            email,
            created_at,
        },
        tokens,
    }))
}

pub async fn login(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let email = payload.email.trim().to_lowercase();
    let user = find_user_by_email(&pool, &email).await?;
    let Some(user) = user else {
        return Err(AppError::unauthorized("invalid_credentials", "Invalid credentials"));
    };
    if !verify_password(&payload.password, &user.password_hash) {
        return Err(AppError::unauthorized("invalid_credentials", "Invalid credentials"));
    }

    let tokens = issue_tokens(&ctx, user.id, &user.email)?;
    Ok(Json(AuthResponse {
        user: UserOut {
            id: user.id,
            email: user.email,
            created_at: user.created_at,
        },
        tokens,
    }))
}

pub async fn refresh(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<AuthTokens>> {
    let claims = decode_app_token(&ctx.settings, &payload.refresh_token)
        .map_err(|_| AppError::unauthorized("invalid_token", "Invalid refresh token"))?;
    if claims.token_type != "refresh" {
        return Err(AppError::unauthorized("invalid_token", "Refresh token required"));
    }
    let user_id: i32 = claims
        .sub
        .parse()
        .map_err(|_| AppError::unauthorized("invalid_token", "Invalid token subject"))?;
    let user = crate::models::find_user(&pool, user_id)
        .await?
        .ok_or_else(|| AppError::unauthorized("invalid_token", "User not found"))?;

    let tokens = issue_tokens(&ctx, user.id, &user.email)?;
    Ok(Json(tokens))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("supersecure123").unwrap();
        assert!(verify_password("supersecure123", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn credential_shape_is_validated() {
        assert!(validate_credentials_shape("user@example.com", "supersecure123").is_ok());
        assert_eq!(
            validate_credentials_shape("User-Repeat@Example.com", "supersecure123").unwrap(),
            "user-repeat@example.com"
        );
        assert!(validate_credentials_shape("not-an-email", "supersecure123").is_err());
        assert!(validate_credentials_shape("user@example.com", "short").is_err());
    }
}
