use serde_json::Value;
use sqlx::PgPool;

/// Append an immutable admin-action record. Audit writes never fail the
/// surrounding request.
pub async fn record_admin_action(
    pool: &PgPool,
    actor_user_id: Option<i32>,
    tenant_id: Option<&str>,
    action: &str,
    payload: Value,
) {
    let result = sqlx::query(
        "INSERT INTO admin_actions (actor_user_id, tenant_id, action, payload_json) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(actor_user_id)
    .bind(tenant_id)
    .bind(action)
    .bind(payload)
    .execute(pool)
    .await;
    if let Err(err) = result {
        tracing::warn!(?err, %action, "admin action record failed");
    }
}
