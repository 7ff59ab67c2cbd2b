use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};

/// Tenant status / runtime actual-state vocabulary.
pub const RUNTIME_STATES: &[&str] = &[
    "provisioning",
    "pending_pairing",
    "running",
    "paused",
    "error",
    "deleted",
];

pub fn is_runtime_state(value: &str) -> bool {
    RUNTIME_STATES.contains(&value)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: i32,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TenantRow {
    pub id: String,
    pub owner_user_id: i32,
    pub status: String,
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantRuntimeRow {
    pub tenant_id: String,
    pub desired_state: String,
    pub actual_state: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuntimeEventRow {
    pub id: i64,
    pub tenant_id: String,
    pub r#type: String,
    pub payload_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub async fn find_user(pool: &PgPool, user_id: i32) -> AppResult<Option<UserRow>> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, email, password_hash, created_at FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn find_user_by_email(pool: &PgPool, email: &str) -> AppResult<Option<UserRow>> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, email, password_hash, created_at FROM users WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn tenant_for_owner_user(pool: &PgPool, owner_user_id: i32) -> AppResult<Option<TenantRow>> {
    let row = sqlx::query_as::<_, TenantRow>(
        "SELECT id, owner_user_id, status, worker_id, created_at, updated_at \
         FROM tenants WHERE owner_user_id = $1",
    )
    .bind(owner_user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Owner-scoped tenant lookup. Foreign tenants look identical to missing
/// tenants from the caller's perspective.
pub async fn tenant_for_owner(
    pool: &PgPool,
    tenant_id: &str,
    owner_user_id: i32,
) -> AppResult<TenantRow> {
    let row = sqlx::query_as::<_, TenantRow>(
        "SELECT id, owner_user_id, status, worker_id, created_at, updated_at \
         FROM tenants WHERE id = $1 AND owner_user_id = $2",
    )
    .bind(tenant_id)
    .bind(owner_user_id)
    .fetch_optional(pool)
    .await?;
    row.ok_or_else(|| AppError::not_found("tenant_not_found", "Tenant not found"))
}

pub async fn runtime_for_tenant(pool: &PgPool, tenant_id: &str) -> AppResult<TenantRuntimeRow> {
    let row = sqlx::query_as::<_, TenantRuntimeRow>(
        "SELECT tenant_id, desired_state, actual_state, last_heartbeat, last_error \
         FROM tenant_runtime WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    row.ok_or_else(|| AppError::not_found("runtime_not_found", "Runtime not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_set_matches_lifecycle_vocabulary() {
        for state in ["provisioning", "pending_pairing", "running", "paused", "error", "deleted"] {
            assert!(is_runtime_state(state));
        }
        assert!(!is_runtime_state("rebooting"));
        assert!(!is_runtime_state(""));
    }
}
