use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::error::{AppError, AppResult};

/// String map used for env revisions. Kept ordered so rendered payloads and
/// comparisons are deterministic.
pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct ActiveConfig {
    pub revision: i32,
    pub env: EnvMap,
}

#[derive(Debug, Clone)]
pub struct PromptRevision {
    pub name: String,
    pub revision: i32,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct SkillRevision {
    pub skill_id: String,
    pub revision: i32,
    pub content: String,
}

fn env_from_json(value: Value) -> EnvMap {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, rendered)
            })
            .collect(),
        _ => EnvMap::new(),
    }
}

pub fn env_to_json(env: &EnvMap) -> Value {
    Value::Object(
        env.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

pub async fn active_config(pool: &PgPool, tenant_id: &str) -> AppResult<Option<ActiveConfig>> {
    let row = sqlx::query(
        "SELECT revision, env_json FROM config_revisions \
         WHERE tenant_id = $1 AND is_active = TRUE",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| ActiveConfig {
        revision: row.get("revision"),
        env: env_from_json(row.get("env_json")),
    }))
}

pub async fn require_active_config(pool: &PgPool, tenant_id: &str) -> AppResult<ActiveConfig> {
    active_config(pool, tenant_id)
        .await?
        .ok_or_else(|| AppError::not_found("config_not_found", "Active config not found"))
}

pub async fn next_config_revision(pool: &PgPool, tenant_id: &str) -> AppResult<i32> {
    let row = sqlx::query("SELECT MAX(revision) AS max FROM config_revisions WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;
    let max: Option<i32> = row.get("max");
    Ok(max.unwrap_or(0) + 1)
}

/// Deactivate every config revision for the tenant and insert the new one as
/// the active revision, in the supplied transaction.
pub async fn activate_config(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    revision: i32,
    env: &EnvMap,
) -> AppResult<()> {
    sqlx::query("UPDATE config_revisions SET is_active = FALSE WHERE tenant_id = $1")
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO config_revisions (tenant_id, revision, env_json, is_active) \
         VALUES ($1, $2, $3, TRUE)",
    )
    .bind(tenant_id)
    .bind(revision)
    .bind(env_to_json(env))
    .execute(&mut *tx)
    .await?;
    Ok(())
}

pub async fn active_prompts(pool: &PgPool, tenant_id: &str) -> AppResult<Vec<PromptRevision>> {
    let rows = sqlx::query(
        "SELECT name, revision, content FROM prompt_revisions \
         WHERE tenant_id = $1 AND is_active = TRUE ORDER BY name ASC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| PromptRevision {
            name: row.get("name"),
            revision: row.get("revision"),
            content: row.get("content"),
        })
        .collect())
}

pub async fn next_prompt_revision(pool: &PgPool, tenant_id: &str, name: &str) -> AppResult<i32> {
    let row = sqlx::query(
        "SELECT MAX(revision) AS max FROM prompt_revisions WHERE tenant_id = $1 AND name = $2",
    )
    .bind(tenant_id)
    .bind(name)
    .fetch_one(pool)
    .await?;
    let max: Option<i32> = row.get("max");
    Ok(max.unwrap_or(0) + 1)
}

/// At most one active revision per (tenant, name): siblings are deactivated
/// and the new revision inserted active in one transaction.
pub async fn activate_prompt(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    name: &str,
    revision: i32,
    content: &str,
) -> AppResult<()> {
    sqlx::query("UPDATE prompt_revisions SET is_active = FALSE WHERE tenant_id = $1 AND name = $2")
        .bind(tenant_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO prompt_revisions (tenant_id, name, revision, content, is_active) \
         VALUES ($1, $2, $3, $4, TRUE)",
    )
    .bind(tenant_id)
    .bind(name)
    .bind(revision)
    .bind(content)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

pub async fn active_skills(pool: &PgPool, tenant_id: &str) -> AppResult<Vec<SkillRevision>> {
    let rows = sqlx::query(
        "SELECT skill_id, revision, content FROM skill_revisions \
         WHERE tenant_id = $1 AND is_active = TRUE ORDER BY skill_id ASC",
    )
    .bind(tenant_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| SkillRevision {
            skill_id: row.get("skill_id"),
            revision: row.get("revision"),
            content: row.get("content"),
        })
        .collect())
}

pub async fn next_skill_revision(pool: &PgPool, tenant_id: &str, skill_id: &str) -> AppResult<i32> {
    let row = sqlx::query(
        "SELECT MAX(revision) AS max FROM skill_revisions \
         WHERE tenant_id = $1 AND skill_id = $2",
    )
    .bind(tenant_id)
    .bind(skill_id)
    .fetch_one(pool)
    .await?;
    let max: Option<i32> = row.get("max");
    Ok(max.unwrap_or(0) + 1)
}

pub async fn activate_skill(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    skill_id: &str,
    revision: i32,
    content: &str,
) -> AppResult<()> {
    sqlx::query(
        "UPDATE skill_revisions SET is_active = FALSE WHERE tenant_id = $1 AND skill_id = $2",
    )
    .bind(tenant_id)
    .bind(skill_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO skill_revisions (tenant_id, skill_id, revision, content, is_active) \
         VALUES ($1, $2, $3, $4, TRUE)",
    )
    .bind(tenant_id)
    .bind(skill_id)
    .bind(revision)
    .bind(content)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn env_json_round_trips_and_stringifies_non_strings() {
        let env = env_from_json(json!({"A": "1", "B": 2, "C": true}));
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.get("B").map(String::as_str), Some("2"));
        assert_eq!(env.get("C").map(String::as_str), Some("true"));

        let round = env_from_json(env_to_json(&env));
        assert_eq!(round, env);
    }
}
