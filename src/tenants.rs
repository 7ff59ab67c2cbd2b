use std::future::Future;
use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::assistant_defaults::{ASSISTANT_DEFAULTS_VERSION, PROMPT_DEFAULTS, SKILL_DEFAULTS};
use crate::audit::record_admin_action;
use crate::crypto::TenantSecretBlob;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::models::{runtime_for_tenant, tenant_for_owner, tenant_for_owner_user, TenantRow};
use crate::revisions::{
    activate_config, activate_prompt, activate_skill, active_config, active_prompts, active_skills,
    env_to_json, next_config_revision, next_prompt_revision, next_skill_revision,
    require_active_config, EnvMap,
};
use crate::runner_client::RunnerError;
use crate::runner::runtime_manager::validate_image_tag;
use crate::state::AppContext;

pub const OPENROUTER_API_KEY: &str = "NEXUS_OPENROUTER_API_KEY";

const SETUP_ATTEMPTS: usize = 3;

#[derive(Deserialize, Default)]
pub struct TenantSetupRequest {
    #[serde(default)]
    pub initial_config: Option<EnvMap>,
}

#[derive(Serialize)]
pub struct TenantStatusOut {
    pub tenant_id: String,
    pub desired_state: String,
    pub actual_state: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Serialize)]
pub struct OperationAccepted {
    pub tenant_id: String,
    pub operation: &'static str,
    pub accepted: bool,
}

impl OperationAccepted {
    fn new(tenant_id: &str, operation: &'static str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            operation,
            accepted: true,
        }
    }
}

#[derive(Serialize)]
pub struct ConfigOut {
    pub tenant_id: String,
    pub revision: i32,
    pub env_json: Value,
}

#[derive(Deserialize)]
pub struct ConfigPatchRequest {
    #[serde(default)]
    pub values: EnvMap,
    #[serde(default)]
    pub remove_keys: Vec<String>,
}

#[derive(Serialize)]
pub struct PromptOut {
    pub name: String,
    pub revision: i32,
    pub content: String,
}

#[derive(Deserialize)]
pub struct PromptPutRequest {
    pub content: String,
}

#[derive(Serialize)]
pub struct SkillOut {
    pub skill_id: String,
    pub revision: i32,
    pub content: String,
}

#[derive(Deserialize)]
pub struct SkillPutRequest {
    pub content: String,
}

fn default_initial_env() -> EnvMap {
    let mut env = EnvMap::new();
    env.insert("NEXUS_CLI_ENABLED".into(), "false".into());
    env.insert("NEXUS_CONFIG_DIR".into(), "/data/config".into());
    env.insert("NEXUS_DATA_DIR".into(), "/data/state".into());
    env.insert("NEXUS_PROMPTS_DIR".into(), "/data/config/prompts".into());
    env.insert("NEXUS_SKILLS_DIR".into(), "/data/config/skills".into());
    env
}

fn has_openrouter_api_key(env: &EnvMap) -> bool {
    env.get(OPENROUTER_API_KEY)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

fn openrouter_key_required() -> AppError {
    AppError::bad_request(
        "openrouter_api_key_required",
        format!("{OPENROUTER_API_KEY} is required before runtime start"),
    )
}

async fn require_openrouter_api_key(pool: &PgPool, tenant_id: &str) -> AppResult<()> {
    match active_config(pool, tenant_id).await? {
        Some(active) if has_openrouter_api_key(&active.env) => Ok(()),
        _ => Err(openrouter_key_required()),
    }
}

fn require_valid_runtime_image(ctx: &AppContext) -> AppResult<String> {
    validate_image_tag(&ctx.settings.nexus_image).map_err(|_| {
        AppError::bad_request(
            "nexus_image_invalid",
            "NEXUS_IMAGE is not set to a valid runtime image tag",
        )
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Call the runner; a `RunnerError` is mirrored onto the event stream before
/// it surfaces to the HTTP caller.
async fn runner_call<F, Fut>(
    ctx: &AppContext,
    tenant_id: &str,
    action: &str,
    call: F,
) -> AppResult<Value>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, RunnerError>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(err) => {
            let payload = json!({
                "error": err.code,
                "message": err.message,
                "action": action,
            });
            ctx.events.emit(tenant_id, "runtime.error", payload).await;
            Err(err.into())
        }
    }
}

fn prompts_payload(prompts: &[(String, String)]) -> Vec<Value> {
    prompts
        .iter()
        .map(|(name, content)| json!({"name": name, "content": content}))
        .collect()
}

fn skills_payload(skills: &[(String, String)]) -> Vec<Value> {
    skills
        .iter()
        .map(|(skill_id, content)| json!({"skill_id": skill_id, "content": content}))
        .collect()
}

/// Idempotent tenant setup: at most one tenant per owner, created together
/// with its runtime row, encrypted secret, and active revision 1 of the env
/// plus every default prompt and skill.
pub async fn setup_tenant(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    body: Option<Json<TenantSetupRequest>>,
) -> AppResult<Json<TenantRow>> {
    if let Some(existing) = tenant_for_owner_user(&pool, user.user_id).await? {
        return Ok(Json(existing));
    }

    let mut initial_env = default_initial_env();
    if let Some(Json(request)) = body {
        if let Some(overrides) = request.initial_config {
            initial_env.extend(overrides);
        }
    }
    if !has_openrouter_api_key(&initial_env) {
        return Err(openrouter_key_required());
    }
    let image = require_valid_runtime_image(&ctx)?;

    let mut created: Option<(String, String)> = None;
    for attempt in 1..=SETUP_ATTEMPTS {
        let tenant_id = crate::security::random_hex(8);
        // Worker identifier is tenant-scoped to tolerate legacy schemas that
        // enforce uniqueness on it.
        let worker_id = format!("worker-{tenant_id}");
        let bridge_secret = crate::security::random_urlsafe(24);

        let blob = TenantSecretBlob {
            bridge_shared_secret: Some(bridge_secret.clone()),
            assistant_defaults_version: Some(ASSISTANT_DEFAULTS_VERSION.to_string()),
            ..Default::default()
        };
        let encrypted = ctx.cipher.encrypt(&blob.to_value()?)?;

        let mut tx = pool.begin().await?;
        // Parent tenant row first so foreign-key-strict engines accept the
        // children in the same transaction.
        let inserted = sqlx::query(
            "INSERT INTO tenants (id, owner_user_id, status, worker_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(&tenant_id)
        .bind(user.user_id)
        .bind("provisioning")
        .bind(&worker_id)
        .execute(&mut tx)
        .await;
        if let Err(err) = inserted {
            drop(tx);
            if !is_unique_violation(&err) {
                return Err(AppError::Db(err));
            }
            tracing::warn!(user_id = user.user_id, attempt, "tenant setup conflict on tenant insert");
            if let Some(existing) = tenant_for_owner_user(&pool, user.user_id).await? {
                return Ok(Json(existing));
            }
            continue;
        }

        sqlx::query(
            "INSERT INTO tenant_runtime (tenant_id, desired_state, actual_state) \
             VALUES ($1, 'stopped', 'provisioning')",
        )
        .bind(&tenant_id)
        .execute(&mut tx)
        .await?;
        sqlx::query(
            "INSERT INTO tenant_secrets (tenant_id, encrypted_blob, key_version) \
             VALUES ($1, $2, $3)",
        )
        .bind(&tenant_id)
        .bind(serde_json::to_value(&encrypted).map_err(|e| AppError::Internal(e.to_string()))?)
        .bind(ctx.cipher.key_version())
        .execute(&mut tx)
        .await?;
        sqlx::query(
            "INSERT INTO config_revisions (tenant_id, revision, env_json, is_active) \
             VALUES ($1, 1, $2, TRUE)",
        )
        .bind(&tenant_id)
        .bind(env_to_json(&initial_env))
        .execute(&mut tx)
        .await?;
        for (name, content) in PROMPT_DEFAULTS.iter().copied() {
            sqlx::query(
                "INSERT INTO prompt_revisions (tenant_id, name, revision, content, is_active) \
                 VALUES ($1, $2, 1, $3, TRUE)",
            )
            .bind(&tenant_id)
            .bind(name)
            .bind(content)
            .execute(&mut tx)
            .await?;
        }
        for (skill_id, content) in SKILL_DEFAULTS.iter().copied() {
            sqlx::query(
                "INSERT INTO skill_revisions (tenant_id, skill_id, revision, content, is_active) \
                 VALUES ($1, $2, 1, $3, TRUE)",
            )
            .bind(&tenant_id)
            .bind(skill_id)
            .bind(content)
            .execute(&mut tx)
            .await?;
        }

        match tx.commit().await {
            Ok(()) => {
                created = Some((tenant_id, bridge_secret));
                break;
            }
            Err(err) => {
                if !is_unique_violation(&err) {
                    return Err(AppError::Db(err));
                }
                tracing::warn!(user_id = user.user_id, attempt, "tenant setup conflict on commit");
                if let Some(existing) = tenant_for_owner_user(&pool, user.user_id).await? {
                    return Ok(Json(existing));
                }
            }
        }
    }

    let Some((tenant_id, bridge_secret)) = created else {
        return Err(AppError::conflict(
            "tenant_setup_conflict",
            "Could not complete tenant setup",
        ));
    };

    record_admin_action(
        &pool,
        Some(user.user_id),
        Some(tenant_id.as_str()),
        "tenant_setup",
        json!({"initial_env_keys": initial_env.keys().collect::<Vec<_>>()}),
    )
    .await;

    let payload = json!({
        "tenant_id": tenant_id,
        "nexus_image": image,
        "runtime_env": env_to_json(&initial_env),
        "bridge_shared_secret": bridge_secret,
    });
    match ctx.runner.provision(&tenant_id, &payload).await {
        Ok(_) => {
            sqlx::query("UPDATE tenants SET status = 'pending_pairing', updated_at = now() WHERE id = $1")
                .bind(&tenant_id)
                .execute(&pool)
                .await?;
            sqlx::query(
                "UPDATE tenant_runtime SET desired_state = 'running', \
                 actual_state = 'pending_pairing', last_heartbeat = now() WHERE tenant_id = $1",
            )
            .bind(&tenant_id)
            .execute(&pool)
            .await?;
            ctx.events
                .emit(&tenant_id, "runtime.status", json!({"state": "pending_pairing"}))
                .await;
        }
        Err(err) => {
            sqlx::query("UPDATE tenants SET status = 'error', updated_at = now() WHERE id = $1")
                .bind(&tenant_id)
                .execute(&pool)
                .await?;
            sqlx::query(
                "UPDATE tenant_runtime SET actual_state = 'error', last_error = $2 \
                 WHERE tenant_id = $1",
            )
            .bind(&tenant_id)
            .bind(format!("{}: {}", err.code, err.message))
            .execute(&pool)
            .await?;
            ctx.events
                .emit(
                    &tenant_id,
                    "runtime.error",
                    json!({"error": err.code, "message": err.message}),
                )
                .await;
        }
    }

    let tenant = tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    Ok(Json(tenant))
}

/// Current runtime status, refreshed by a best-effort runner health probe.
pub async fn tenant_status(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<TenantStatusOut>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    let mut runtime = runtime_for_tenant(&pool, &tenant_id).await?;

    if let Ok(health) = ctx.runner.health(&tenant_id).await {
        let container_running = health
            .get("container_running")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if container_running {
            // Keep event-projected states (for example pending_pairing)
            // instead of forcing running.
            if matches!(runtime.actual_state.as_str(), "provisioning" | "paused")
                && runtime.desired_state == "running"
            {
                runtime.actual_state = "running".into();
            }
        } else if !matches!(
            runtime.actual_state.as_str(),
            "error" | "deleted" | "provisioning"
        ) {
            runtime.actual_state = "paused".into();
        }
        if runtime.actual_state != "error" {
            runtime.last_error = None;
        }
        runtime.last_heartbeat = Some(Utc::now());
        sqlx::query(
            "UPDATE tenant_runtime SET actual_state = $2, last_heartbeat = now(), last_error = $3 \
             WHERE tenant_id = $1",
        )
        .bind(&tenant_id)
        .bind(&runtime.actual_state)
        .bind(runtime.last_error.as_deref())
        .execute(&pool)
        .await?;
    }
    // A runner failure preserves the last known state.

    Ok(Json(TenantStatusOut {
        tenant_id,
        desired_state: runtime.desired_state,
        actual_state: runtime.actual_state,
        last_heartbeat: runtime.last_heartbeat,
        last_error: runtime.last_error,
    }))
}

async fn apply_runtime_transition(
    pool: &PgPool,
    ctx: &AppContext,
    tenant_id: &str,
    desired_state: &str,
    actual_state: &str,
) -> AppResult<()> {
    sqlx::query(
        "UPDATE tenant_runtime SET desired_state = $2, actual_state = $3, last_heartbeat = now() \
         WHERE tenant_id = $1",
    )
    .bind(tenant_id)
    .bind(desired_state)
    .bind(actual_state)
    .execute(pool)
    .await?;
    sqlx::query("UPDATE tenants SET status = $2, updated_at = now() WHERE id = $1")
        .bind(tenant_id)
        .bind(actual_state)
        .execute(pool)
        .await?;
    ctx.events
        .emit(tenant_id, "runtime.status", json!({"state": actual_state}))
        .await;
    Ok(())
}

pub async fn start_runtime(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<OperationAccepted>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    require_openrouter_api_key(&pool, &tenant_id).await?;
    let image = require_valid_runtime_image(&ctx)?;
    let payload = json!({"nexus_image": image});
    runner_call(&ctx, &tenant_id, "start", || {
        ctx.runner.start(&tenant_id, Some(&payload))
    })
    .await?;
    apply_runtime_transition(&pool, &ctx, &tenant_id, "running", "running").await?;
    record_admin_action(&pool, Some(user.user_id), Some(tenant_id.as_str()), "runtime_start", json!({})).await;
    Ok(Json(OperationAccepted::new(&tenant_id, "start")))
}

pub async fn stop_runtime(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<OperationAccepted>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    runner_call(&ctx, &tenant_id, "stop", || ctx.runner.stop(&tenant_id)).await?;
    apply_runtime_transition(&pool, &ctx, &tenant_id, "paused", "paused").await?;
    record_admin_action(&pool, Some(user.user_id), Some(tenant_id.as_str()), "runtime_stop", json!({})).await;
    Ok(Json(OperationAccepted::new(&tenant_id, "stop")))
}

pub async fn restart_runtime(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<OperationAccepted>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    require_openrouter_api_key(&pool, &tenant_id).await?;
    let image = require_valid_runtime_image(&ctx)?;
    let payload = json!({"nexus_image": image});
    runner_call(&ctx, &tenant_id, "restart", || {
        ctx.runner.restart(&tenant_id, Some(&payload))
    })
    .await?;
    apply_runtime_transition(&pool, &ctx, &tenant_id, "running", "running").await?;
    record_admin_action(&pool, Some(user.user_id), Some(tenant_id.as_str()), "runtime_restart", json!({})).await;
    Ok(Json(OperationAccepted::new(&tenant_id, "restart")))
}

pub async fn pair_start(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<OperationAccepted>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    require_openrouter_api_key(&pool, &tenant_id).await?;
    let image = require_valid_runtime_image(&ctx)?;
    let payload = json!({"nexus_image": image});
    runner_call(&ctx, &tenant_id, "pair_start", || {
        ctx.runner.pair_start(&tenant_id, Some(&payload))
    })
    .await?;
    apply_runtime_transition(&pool, &ctx, &tenant_id, "pending_pairing", "pending_pairing").await?;
    record_admin_action(&pool, Some(user.user_id), Some(tenant_id.as_str()), "pair_start", json!({})).await;
    Ok(Json(OperationAccepted::new(&tenant_id, "pair_start")))
}

pub async fn whatsapp_disconnect(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<OperationAccepted>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    runner_call(&ctx, &tenant_id, "whatsapp_disconnect", || {
        ctx.runner.disconnect(&tenant_id)
    })
    .await?;
    ctx.events
        .emit(&tenant_id, "whatsapp.disconnected", json!({"reason": "requested"}))
        .await;
    record_admin_action(
        &pool,
        Some(user.user_id),
        Some(tenant_id.as_str()),
        "whatsapp_disconnect",
        json!({}),
    )
    .await;
    Ok(Json(OperationAccepted::new(&tenant_id, "whatsapp_disconnect")))
}

pub async fn get_config(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<ConfigOut>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    let active = require_active_config(&pool, &tenant_id).await?;
    Ok(Json(ConfigOut {
        tenant_id,
        revision: active.revision,
        env_json: env_to_json(&active.env),
    }))
}

/// Propose → apply → activate. The new revision only becomes visible once the
/// runner has accepted the full converged view.
pub async fn patch_config(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
    Json(body): Json<ConfigPatchRequest>,
) -> AppResult<Json<ConfigOut>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    let active = require_active_config(&pool, &tenant_id).await?;

    let mut merged = active.env.clone();
    merged.extend(body.values);
    for key in &body.remove_keys {
        merged.remove(key);
    }

    if merged == active.env {
        return Ok(Json(ConfigOut {
            tenant_id,
            revision: active.revision,
            env_json: env_to_json(&active.env),
        }));
    }

    let next_rev = next_config_revision(&pool, &tenant_id).await?;
    let prompts: Vec<(String, String)> = active_prompts(&pool, &tenant_id)
        .await?
        .into_iter()
        .map(|p| (p.name, p.content))
        .collect();
    let skills: Vec<(String, String)> = active_skills(&pool, &tenant_id)
        .await?
        .into_iter()
        .map(|s| (s.skill_id, s.content))
        .collect();

    let payload = json!({
        "env": env_to_json(&merged),
        "prompts": prompts_payload(&prompts),
        "skills": skills_payload(&skills),
        "config_revision": next_rev,
    });
    runner_call(&ctx, &tenant_id, "apply_config", || {
        ctx.runner.apply_config(&tenant_id, &payload)
    })
    .await?;

    let mut tx = pool.begin().await?;
    activate_config(&mut tx, &tenant_id, next_rev, &merged).await?;
    tx.commit().await?;

    ctx.events
        .emit(&tenant_id, "config.applied", json!({"revision": next_rev}))
        .await;
    record_admin_action(
        &pool,
        Some(user.user_id),
        Some(tenant_id.as_str()),
        "config_patch",
        json!({"revision": next_rev, "removed_keys": body.remove_keys}),
    )
    .await;

    Ok(Json(ConfigOut {
        tenant_id,
        revision: next_rev,
        env_json: env_to_json(&merged),
    }))
}

pub async fn get_prompts(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<Vec<PromptOut>>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    let rows = active_prompts(&pool, &tenant_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|p| PromptOut {
                name: p.name,
                revision: p.revision,
                content: p.content,
            })
            .collect(),
    ))
}

pub async fn put_prompt(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path((tenant_id, name)): Path<(String, String)>,
    Json(body): Json<PromptPutRequest>,
) -> AppResult<Json<PromptOut>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    let next_rev = next_prompt_revision(&pool, &tenant_id, &name).await?;

    let env = active_config(&pool, &tenant_id)
        .await?
        .map(|c| c.env)
        .unwrap_or_default();
    // The runner sees the eventual state it must converge to, with the
    // pending content already merged in.
    let mut prompts: Vec<(String, String)> = active_prompts(&pool, &tenant_id)
        .await?
        .into_iter()
        .filter(|p| p.name != name)
        .map(|p| (p.name, p.content))
        .collect();
    prompts.push((name.clone(), body.content.clone()));
    let skills: Vec<(String, String)> = active_skills(&pool, &tenant_id)
        .await?
        .into_iter()
        .map(|s| (s.skill_id, s.content))
        .collect();

    let payload = json!({
        "env": env_to_json(&env),
        "prompts": prompts_payload(&prompts),
        "skills": skills_payload(&skills),
    });
    runner_call(&ctx, &tenant_id, "apply_config", || {
        ctx.runner.apply_config(&tenant_id, &payload)
    })
    .await?;

    let mut tx = pool.begin().await?;
    activate_prompt(&mut tx, &tenant_id, &name, next_rev, &body.content).await?;
    tx.commit().await?;

    ctx.events
        .emit(
            &tenant_id,
            "config.applied",
            json!({"prompt": &name, "revision": next_rev}),
        )
        .await;
    record_admin_action(
        &pool,
        Some(user.user_id),
        Some(tenant_id.as_str()),
        "prompt_put",
        json!({"name": &name, "revision": next_rev}),
    )
    .await;

    Ok(Json(PromptOut {
        name,
        revision: next_rev,
        content: body.content,
    }))
}

pub async fn get_skills(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
) -> AppResult<Json<Vec<SkillOut>>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    let rows = active_skills(&pool, &tenant_id).await?;
    Ok(Json(
        rows.into_iter()
            .map(|s| SkillOut {
                skill_id: s.skill_id,
                revision: s.revision,
                content: s.content,
            })
            .collect(),
    ))
}

pub async fn put_skill(
    Extension(pool): Extension<PgPool>,
    Extension(ctx): Extension<Arc<AppContext>>,
    user: AuthUser,
    Path((tenant_id, skill_id)): Path<(String, String)>,
    Json(body): Json<SkillPutRequest>,
) -> AppResult<Json<SkillOut>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;
    let next_rev = next_skill_revision(&pool, &tenant_id, &skill_id).await?;

    let env = active_config(&pool, &tenant_id)
        .await?
        .map(|c| c.env)
        .unwrap_or_default();
    let prompts: Vec<(String, String)> = active_prompts(&pool, &tenant_id)
        .await?
        .into_iter()
        .map(|p| (p.name, p.content))
        .collect();
    let mut skills: Vec<(String, String)> = active_skills(&pool, &tenant_id)
        .await?
        .into_iter()
        .filter(|s| s.skill_id != skill_id)
        .map(|s| (s.skill_id, s.content))
        .collect();
    skills.push((skill_id.clone(), body.content.clone()));

    let payload = json!({
        "env": env_to_json(&env),
        "prompts": prompts_payload(&prompts),
        "skills": skills_payload(&skills),
    });
    runner_call(&ctx, &tenant_id, "apply_config", || {
        ctx.runner.apply_config(&tenant_id, &payload)
    })
    .await?;

    let mut tx = pool.begin().await?;
    activate_skill(&mut tx, &tenant_id, &skill_id, next_rev, &body.content).await?;
    tx.commit().await?;

    ctx.events
        .emit(
            &tenant_id,
            "config.applied",
            json!({"skill_id": &skill_id, "revision": next_rev}),
        )
        .await;
    record_admin_action(
        &pool,
        Some(user.user_id),
        Some(tenant_id.as_str()),
        "skill_put",
        json!({"skill_id": &skill_id, "revision": next_rev}),
    )
    .await;

    Ok(Json(SkillOut {
        skill_id,
        revision: next_rev,
        content: body.content,
    }))
}

#[derive(Deserialize)]
pub struct RecentEventsParams {
    pub limit: Option<i64>,
    pub after_event_id: Option<i64>,
    pub types: Option<String>,
}

pub async fn recent_events(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(tenant_id): Path<String>,
    Query(params): Query<RecentEventsParams>,
) -> AppResult<Json<Vec<Value>>> {
    tenant_for_owner(&pool, &tenant_id, user.user_id).await?;

    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let types: Vec<String> = params
        .types
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let rows = if types.is_empty() {
        match params.after_event_id {
            Some(after) => {
                sqlx::query_as::<_, crate::models::RuntimeEventRow>(
                    "SELECT id, tenant_id, type, payload_json, created_at FROM runtime_events \
                     WHERE tenant_id = $1 AND id > $2 ORDER BY id DESC LIMIT $3",
                )
                .bind(&tenant_id)
                .bind(after)
                .bind(limit)
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, crate::models::RuntimeEventRow>(
                    "SELECT id, tenant_id, type, payload_json, created_at FROM runtime_events \
                     WHERE tenant_id = $1 ORDER BY id DESC LIMIT $2",
                )
                .bind(&tenant_id)
                .bind(limit)
                .fetch_all(&pool)
                .await?
            }
        }
    } else {
        match params.after_event_id {
            Some(after) => {
                sqlx::query_as::<_, crate::models::RuntimeEventRow>(
                    "SELECT id, tenant_id, type, payload_json, created_at FROM runtime_events \
                     WHERE tenant_id = $1 AND id > $2 AND type = ANY($3) \
                     ORDER BY id DESC LIMIT $4",
                )
                .bind(&tenant_id)
                .bind(after)
                .bind(&types)
                .bind(limit)
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, crate::models::RuntimeEventRow>(
                    "SELECT id, tenant_id, type, payload_json, created_at FROM runtime_events \
                     WHERE tenant_id = $1 AND type = ANY($2) ORDER BY id DESC LIMIT $3",
                )
                .bind(&tenant_id)
                .bind(&types)
                .bind(limit)
                .fetch_all(&pool)
                .await?
            }
        }
    };

    let mut out: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "event_id": row.id,
                "tenant_id": row.tenant_id,
                "type": row.r#type,
                "payload": row.payload_json,
                "created_at": row.created_at.to_rfc3339(),
            })
        })
        .collect();
    out.reverse();
    Ok(Json(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_env_applies_values_then_removals() {
        let mut active = EnvMap::new();
        active.insert("A".into(), "1".into());
        active.insert("B".into(), "2".into());

        let mut merged = active.clone();
        let mut values = EnvMap::new();
        values.insert("B".into(), "3".into());
        values.insert("C".into(), "4".into());
        merged.extend(values);
        for key in ["A"] {
            merged.remove(key);
        }

        assert_eq!(merged.get("B").map(String::as_str), Some("3"));
        assert_eq!(merged.get("C").map(String::as_str), Some("4"));
        assert!(!merged.contains_key("A"));
    }

    #[test]
    fn openrouter_key_must_be_non_empty() {
        let mut env = default_initial_env();
        assert!(!has_openrouter_api_key(&env));
        env.insert(OPENROUTER_API_KEY.into(), "  ".into());
        assert!(!has_openrouter_api_key(&env));
        env.insert(OPENROUTER_API_KEY.into(), "sk-x".into());
        assert!(has_openrouter_api_key(&env));
    }
}
