use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};

use crate::assistant_defaults::{
    default_prompt, default_skill, managed_skill_ids, prompt_needs_default, skill_needs_default,
    ASSISTANT_DEFAULTS_VERSION, MANAGED_PROMPT_IDS, PROMPT_DEFAULTS, SKILL_DEFAULTS,
};
use crate::audit::record_admin_action;
use crate::crypto::{EncryptedBlob, TenantSecretBlob};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::models::{runtime_for_tenant, tenant_for_owner};
use crate::revisions::{
    activate_prompt, activate_skill, active_config, active_prompts, active_skills, env_to_json,
};
use crate::state::AppContext;

#[derive(Serialize)]
pub struct BootstrapOut {
    pub tenant_id: String,
    pub applied: bool,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub prompts: Vec<String>,
    pub skills: Vec<String>,
    pub restarted_runtime: bool,
}

pub async fn load_secret_blob(
    pool: &PgPool,
    ctx: &AppContext,
    tenant_id: &str,
) -> AppResult<TenantSecretBlob> {
    let row = sqlx::query("SELECT encrypted_blob FROM tenant_secrets WHERE tenant_id = $1")
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| AppError::not_found("tenant_not_found", "Tenant secret not found"))?;
    let raw: Value = row.get("encrypted_blob");
    let blob: EncryptedBlob = serde_json::from_value(raw)
        .map_err(|e| AppError::Internal(format!("tenant secret blob is malformed: {e}")))?;
    TenantSecretBlob::from_value(ctx.cipher.decrypt(&blob)?)
}

pub async fn store_secret_blob(
    pool: &PgPool,
    ctx: &AppContext,
    tenant_id: &str,
    blob: &TenantSecretBlob,
) -> AppResult<()> {
    let encrypted = ctx.cipher.encrypt(&blob.to_value()?)?;
    sqlx::query(
        "UPDATE tenant_secrets SET encrypted_blob = $2, key_version = $3, updated_at = now() \
         WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .bind(serde_json::to_value(&encrypted).map_err(|e| AppError::Internal(e.to_string()))?)
    .bind(ctx.cipher.key_version())
    .execute(pool)
    .await?;
    Ok(())
}

/// Reconcile built-in prompts and skills. Scaffold content always receives
/// the default; managed entries are additionally overwritten when the
/// defaults version moved, even if the tenant customized them.
pub async fn bootstrap_assistant(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<BootstrapOut>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;

    let mut secret_blob = load_secret_blob(&pool, &ctx, &tenant_id).await?;
    let stored_version = secret_blob
        .assistant_defaults_version
        .clone()
        .unwrap_or_default();
    let version_changed = stored_version != ASSISTANT_DEFAULTS_VERSION;

    let current_prompts = active_prompts(&pool, &tenant_id).await?;
    let current_skills = active_skills(&pool, &tenant_id).await?;

    let mut prompt_updates: Vec<&'static str> = Vec::new();
    for (name, _) in PROMPT_DEFAULTS.iter().copied() {
        let current = current_prompts
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.content.as_str());
        let managed = MANAGED_PROMPT_IDS.contains(&name);
        if prompt_needs_default(name, current) || (version_changed && managed) {
            prompt_updates.push(name);
        }
    }

    let mut skill_updates: Vec<&'static str> = Vec::new();
    for (skill_id, _) in SKILL_DEFAULTS.iter().copied() {
        let current = current_skills
            .iter()
            .find(|s| s.skill_id == skill_id)
            .map(|s| s.content.as_str());
        let managed = managed_skill_ids().any(|id| id == skill_id);
        if skill_needs_default(skill_id, current) || (version_changed && managed) {
            skill_updates.push(skill_id);
        }
    }

    if prompt_updates.is_empty() && skill_updates.is_empty() {
        if version_changed {
            secret_blob.assistant_defaults_version = Some(ASSISTANT_DEFAULTS_VERSION.to_string());
            store_secret_blob(&pool, &ctx, &tenant_id, &secret_blob).await?;
        }
        return Ok(Json(BootstrapOut {
            tenant_id,
            applied: false,
            version: ASSISTANT_DEFAULTS_VERSION.to_string(),
            reason: Some("already_bootstrapped"),
            prompts: Vec::new(),
            skills: Vec::new(),
            restarted_runtime: false,
        }));
    }

    // Merged view the runtime must converge to: active content with the
    // pending defaults substituted in.
    let env = active_config(&pool, &tenant_id)
        .await?
        .map(|c| c.env)
        .unwrap_or_default();
    let mut prompts_view: Vec<(String, String)> = current_prompts
        .iter()
        .filter(|p| !prompt_updates.iter().any(|name| *name == p.name))
        .map(|p| (p.name.clone(), p.content.clone()))
        .collect();
    for name in &prompt_updates {
        if let Some(content) = default_prompt(name) {
            prompts_view.push((name.to_string(), content.to_string()));
        }
    }
    let mut skills_view: Vec<(String, String)> = current_skills
        .iter()
        .filter(|s| !skill_updates.iter().any(|id| *id == s.skill_id))
        .map(|s| (s.skill_id.clone(), s.content.clone()))
        .collect();
    for skill_id in &skill_updates {
        if let Some(content) = default_skill(skill_id) {
            skills_view.push((skill_id.to_string(), content.to_string()));
        }
    }

    let payload = json!({
        "env": env_to_json(&env),
        "prompts": prompts_view
            .iter()
            .map(|(name, content)| json!({"name": name, "content": content}))
            .collect::<Vec<_>>(),
        "skills": skills_view
            .iter()
            .map(|(skill_id, content)| json!({"skill_id": skill_id, "content": content}))
            .collect::<Vec<_>>(),
    });
    match ctx.runner.apply_config(&tenant_id, &payload).await {
        Ok(_) => {}
        Err(err) => {
            ctx.events
                .emit(
                    &tenant_id,
                    "runtime.error",
                    json!({"error": err.code, "message": err.message, "action": "assistant_bootstrap"}),
                )
                .await;
            return Err(err.into());
        }
    }

    // Every proposed revision activates atomically.
    let mut tx = pool.begin().await?;
    for name in &prompt_updates {
        if let Some(content) = default_prompt(name) {
            let next_rev = {
                let row = sqlx::query(
                    "SELECT MAX(revision) AS max FROM prompt_revisions \
                     WHERE tenant_id = $1 AND name = $2",
                )
                .bind(&tenant_id)
                .bind(*name)
                .fetch_one(&mut tx)
                .await?;
                row.get::<Option<i32>, _>("max").unwrap_or(0) + 1
            };
            activate_prompt(&mut tx, &tenant_id, name, next_rev, content).await?;
        }
    }
    for skill_id in &skill_updates {
        if let Some(content) = default_skill(skill_id) {
            let next_rev = {
                let row = sqlx::query(
                    "SELECT MAX(revision) AS max FROM skill_revisions \
                     WHERE tenant_id = $1 AND skill_id = $2",
                )
                .bind(&tenant_id)
                .bind(*skill_id)
                .fetch_one(&mut tx)
                .await?;
                row.get::<Option<i32>, _>("max").unwrap_or(0) + 1
            };
            activate_skill(&mut tx, &tenant_id, skill_id, next_rev, content).await?;
        }
    }
    tx.commit().await?;

    secret_blob.assistant_defaults_version = Some(ASSISTANT_DEFAULTS_VERSION.to_string());
    store_secret_blob(&pool, &ctx, &tenant_id, &secret_blob).await?;

    let runtime = runtime_for_tenant(&pool, &tenant_id).await?;
    let restarted_runtime = matches!(
        runtime.actual_state.as_str(),
        "running" | "pending_pairing" | "provisioning"
    );

    let prompts: Vec<String> = prompt_updates.iter().map(|s| s.to_string()).collect();
    let skills: Vec<String> = skill_updates.iter().map(|s| s.to_string()).collect();
    ctx.events
        .emit(
            &tenant_id,
            "assistant.bootstrap.applied",
            json!({
                "version": ASSISTANT_DEFAULTS_VERSION,
                "restarted_runtime": restarted_runtime,
                "prompts": &prompts,
                "skills": &skills,
            }),
        )
        .await;
    record_admin_action(
        &pool,
        Some(user.user_id),
        Some(tenant_id.as_str()),
        "assistant_bootstrap",
        json!({"version": ASSISTANT_DEFAULTS_VERSION, "prompts": &prompts, "skills": &skills}),
    )
    .await;

    Ok(Json(BootstrapOut {
        tenant_id,
        applied: true,
        version: ASSISTANT_DEFAULTS_VERSION.to_string(),
        reason: None,
        prompts,
        skills,
        restarted_runtime,
    }))
}
