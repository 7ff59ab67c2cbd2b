use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::config::RunnerSettings;
use crate::runner::command::CommandRunner;

static TENANT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{2,63}$").expect("valid regex"));
static CONFIG_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid regex"));
static RUNNING_CONTAINER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^tenant_([a-z0-9_-]+)_runtime$").expect("valid regex"));

const LEGACY_CONFIG_RO_MOUNT: &str = ":/data/config:ro";
const CONFIG_RW_MOUNT: &str = ":/data/config";
const IMAGE_PLACEHOLDERS: &[&str] = &["replace_with", "your-org", "<org>"];
const BRIDGE_SHARED_SECRET_KEY: &str = "BRIDGE_SHARED_SECRET";
const SESSION_MOUNT_DESTINATION: &str = "/data/session";

const DEFAULT_COMPOSE_TEMPLATE: &str = include_str!("../../runtime/templates/tenant-compose.yml.tmpl");
const DEFAULT_ENV_TEMPLATE: &str = include_str!("../../runtime/templates/runtime.env.tmpl");

/// Runtime manager failure carried as a short code plus a human message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub code: &'static str,
    pub message: String,
}

impl RuntimeError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for crate::error::AppError {
    fn from(err: RuntimeError) -> Self {
        crate::error::AppError::Runtime {
            code: err.code,
            message: err.message,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Reject empty images and anything still carrying a template placeholder.
pub fn validate_image_tag(image: &str) -> RuntimeResult<String> {
    let image = image.trim();
    let lowered = image.to_lowercase();
    if image.is_empty() || IMAGE_PLACEHOLDERS.iter().any(|marker| lowered.contains(marker)) {
        return Err(RuntimeError::new(
            "nexus_image_invalid",
            "NEXUS_IMAGE is not set to a valid runtime image tag",
        ));
    }
    Ok(image.to_string())
}

/// `${VAR}` substitution; unknown variables are left in place.
fn render_template(template: &str, values: &BTreeMap<&str, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in values {
        rendered = rendered.replace(&format!("${{{key}}}"), value);
    }
    rendered
}

/// Safe on-disk layout, compose rendering, and container engine invocation
/// for one tenant root directory.
pub struct RuntimeManager {
    settings: RunnerSettings,
    commands: Arc<dyn CommandRunner>,
}

impl RuntimeManager {
    pub fn new(settings: RunnerSettings, commands: Arc<dyn CommandRunner>) -> Self {
        Self { settings, commands }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn validate_tenant_id(&self, tenant_id: &str) -> RuntimeResult<()> {
        if TENANT_ID_RE.is_match(tenant_id) {
            Ok(())
        } else {
            Err(RuntimeError::new(
                "invalid_tenant_id",
                format!("Invalid tenant_id: {tenant_id}"),
            ))
        }
    }

    pub fn tenant_dir(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        self.validate_tenant_id(tenant_id)?;
        let root = match std::fs::canonicalize(&self.settings.tenant_root) {
            Ok(resolved) => resolved,
            Err(_) => self.settings.tenant_root.clone(),
        };
        let tenant = root.join(tenant_id);
        if !tenant.starts_with(&root) {
            return Err(RuntimeError::new(
                "invalid_tenant_path",
                format!("Tenant path escaped root: {}", tenant.display()),
            ));
        }
        Ok(tenant)
    }

    pub fn env_dir(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        Ok(self.tenant_dir(tenant_id)?.join("env"))
    }

    pub fn config_dir(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        Ok(self.tenant_dir(tenant_id)?.join("config"))
    }

    pub fn prompts_dir(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        Ok(self.config_dir(tenant_id)?.join("prompts"))
    }

    pub fn skills_dir(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        Ok(self.config_dir(tenant_id)?.join("skills"))
    }

    pub fn google_dir(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        Ok(self.config_dir(tenant_id)?.join("google"))
    }

    pub fn google_token_path(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        Ok(self.google_dir(tenant_id)?.join("token.json"))
    }

    pub fn compose_file(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        Ok(self.tenant_dir(tenant_id)?.join("docker-compose.yml"))
    }

    pub fn runtime_env_file(&self, tenant_id: &str) -> RuntimeResult<PathBuf> {
        Ok(self.env_dir(tenant_id)?.join("runtime.env"))
    }

    pub fn validate_layout(&self, tenant_id: &str, require_existing: bool) -> RuntimeResult<()> {
        let tenant_path = self.tenant_dir(tenant_id)?;
        if require_existing && !tenant_path.exists() {
            return Err(RuntimeError::new(
                "tenant_not_found",
                format!("Tenant directory not found: {}", tenant_path.display()),
            ));
        }
        let compose_path = self.compose_file(tenant_id)?;
        if require_existing && !compose_path.exists() {
            return Err(RuntimeError::new(
                "compose_missing",
                format!("Compose file not found: {}", compose_path.display()),
            ));
        }
        Ok(())
    }

    pub fn ensure_layout(&self, tenant_id: &str) -> RuntimeResult<()> {
        for dir in [
            self.env_dir(tenant_id)?,
            self.prompts_dir(tenant_id)?,
            self.skills_dir(tenant_id)?,
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                RuntimeError::new(
                    "invalid_tenant_path",
                    format!("Could not create {}: {e}", dir.display()),
                )
            })?;
        }
        Ok(())
    }

    fn load_template(&self, configured: &Path, fallback: &'static str) -> RuntimeResult<String> {
        if configured.exists() {
            return std::fs::read_to_string(configured).map_err(|e| {
                RuntimeError::new(
                    "template_missing",
                    format!("Template unreadable at {}: {e}", configured.display()),
                )
            });
        }
        Ok(fallback.to_string())
    }

    pub fn write_compose(&self, tenant_id: &str, image: &str) -> RuntimeResult<PathBuf> {
        self.ensure_layout(tenant_id)?;
        let template = self.load_template(
            &self.settings.template_compose_path,
            DEFAULT_COMPOSE_TEMPLATE,
        )?;
        let mut values = BTreeMap::new();
        values.insert("TENANT_ID", tenant_id.to_string());
        values.insert("NEXUS_IMAGE", image.to_string());
        values.insert("BRIDGE_PORT", self.settings.bridge_port.to_string());
        values.insert("TENANT_NETWORK", self.settings.tenant_network.clone());
        let rendered = render_template(&template, &values);

        let path = self.compose_file(tenant_id)?;
        write_text(&path, &rendered)?;
        Ok(path)
    }

    /// Write `env/runtime.env` by merging defaults, env-template values, and
    /// caller values in that order. An existing `BRIDGE_SHARED_SECRET` is
    /// preserved when the new values omit it so secrets survive rewrites.
    pub fn write_runtime_env(
        &self,
        tenant_id: &str,
        values: &BTreeMap<String, String>,
    ) -> RuntimeResult<PathBuf> {
        self.ensure_layout(tenant_id)?;
        let mut merged_values = values.clone();
        if !merged_values.contains_key(BRIDGE_SHARED_SECRET_KEY) {
            let existing = self.read_runtime_env(tenant_id)?;
            if let Some(secret) = existing.get(BRIDGE_SHARED_SECRET_KEY) {
                if !secret.trim().is_empty() {
                    merged_values.insert(BRIDGE_SHARED_SECRET_KEY.to_string(), secret.trim().to_string());
                }
            }
        }

        let mut env = self.default_runtime_env(&merged_values)?;
        env.extend(merged_values);

        let mut lines: Vec<String> = Vec::with_capacity(env.len());
        for (key, value) in &env {
            lines.push(format!("{key}={}", value.replace('\n', "\\n")));
        }
        let path = self.runtime_env_file(tenant_id)?;
        write_text(&path, &(lines.join("\n") + "\n"))?;
        Ok(path)
    }

    pub fn read_runtime_env(&self, tenant_id: &str) -> RuntimeResult<BTreeMap<String, String>> {
        let path = self.runtime_env_file(tenant_id)?;
        let mut values = BTreeMap::new();
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Ok(values);
        };
        for raw_line in raw.lines() {
            let mut line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(stripped) = line.strip_prefix("export ") {
                line = stripped.trim();
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let mut value = value.trim();
            if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
                || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
            {
                value = &value[1..value.len() - 1];
            }
            values.insert(key.to_string(), value.replace("\\n", "\n"));
        }
        Ok(values)
    }

    fn default_runtime_env(
        &self,
        values: &BTreeMap<String, String>,
    ) -> RuntimeResult<BTreeMap<String, String>> {
        let mut defaults = BTreeMap::new();
        defaults.insert("NEXUS_CLI_ENABLED".to_string(), "false".to_string());
        defaults.insert("NEXUS_CONFIG_DIR".to_string(), "/data/config".to_string());
        defaults.insert("NEXUS_DATA_DIR".to_string(), "/data/state".to_string());
        defaults.insert("NEXUS_PROMPTS_DIR".to_string(), "/data/config/prompts".to_string());
        defaults.insert("NEXUS_SKILLS_DIR".to_string(), "/data/config/skills".to_string());
        defaults.insert("NEXUS_BRIDGE_WS_URL".to_string(), "ws://0.0.0.0:8765".to_string());
        defaults.insert("NEXUS_BRIDGE_BIND_HOST".to_string(), "0.0.0.0".to_string());
        defaults.insert("BRIDGE_HOST".to_string(), "0.0.0.0".to_string());
        defaults.insert("BRIDGE_PORT".to_string(), self.settings.bridge_port.to_string());
        defaults.insert("BRIDGE_QR_MODE".to_string(), "terminal".to_string());
        defaults.insert("BRIDGE_EXIT_ON_CONNECT".to_string(), "0".to_string());
        defaults.insert("BRIDGE_SESSION_DIR".to_string(), "/data/session".to_string());

        let template = self.load_template(&self.settings.template_env_path, DEFAULT_ENV_TEMPLATE)?;
        let mut template_values = BTreeMap::new();
        template_values.insert(
            "BRIDGE_SHARED_SECRET",
            values.get(BRIDGE_SHARED_SECRET_KEY).cloned().unwrap_or_default(),
        );
        let rendered = render_template(&template, &template_values);
        for raw in rendered.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            defaults.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(defaults)
    }

    fn safe_config_item_name(&self, value: &str, field: &str) -> RuntimeResult<String> {
        let name = value.trim();
        if CONFIG_ITEM_RE.is_match(name) {
            Ok(name.to_string())
        } else {
            Err(RuntimeError::new(
                "invalid_config_item",
                format!("Invalid {field} identifier: {value:?}"),
            ))
        }
    }

    /// Write config/env.json plus prompt/skill markdown files. Files absent
    /// from the new set are removed so the directory converges on it.
    pub fn write_config_files(
        &self,
        tenant_id: &str,
        env: Option<&BTreeMap<String, String>>,
        prompts: Option<&[(String, String)]>,
        skills: Option<&[(String, String)]>,
    ) -> RuntimeResult<()> {
        self.ensure_layout(tenant_id)?;

        if let Some(env) = env {
            let path = self.config_dir(tenant_id)?.join("env.json");
            let body = serde_json::to_string_pretty(env)
                .map_err(|e| RuntimeError::new("invalid_config_item", e.to_string()))?;
            write_text(&path, &body)?;
        }

        if let Some(prompts) = prompts {
            let dir = self.prompts_dir(tenant_id)?;
            self.write_markdown_set(&dir, prompts, "prompt")?;
        }

        if let Some(skills) = skills {
            let dir = self.skills_dir(tenant_id)?;
            self.write_markdown_set(&dir, skills, "skill")?;
        }
        Ok(())
    }

    fn write_markdown_set(
        &self,
        dir: &Path,
        items: &[(String, String)],
        field: &str,
    ) -> RuntimeResult<()> {
        let mut expected: HashSet<PathBuf> = HashSet::new();
        for (name, content) in items {
            let safe = self.safe_config_item_name(name, field)?;
            let target = dir.join(format!("{safe}.md"));
            write_text(&target, content)?;
            expected.insert(target);
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") && !expected.contains(&path) {
                let _ = std::fs::remove_file(&path);
            }
        }
        Ok(())
    }

    pub fn write_google_token(&self, tenant_id: &str, token_json: &Value) -> RuntimeResult<PathBuf> {
        self.ensure_layout(tenant_id)?;
        let dir = self.google_dir(tenant_id)?;
        std::fs::create_dir_all(&dir).map_err(|e| {
            RuntimeError::new(
                "invalid_tenant_path",
                format!("Could not create {}: {e}", dir.display()),
            )
        })?;
        let path = self.google_token_path(tenant_id)?;
        let body = serde_json::to_string_pretty(token_json)
            .map_err(|e| RuntimeError::new("invalid_config_item", e.to_string()))?;
        write_text(&path, &body)?;
        Ok(path)
    }

    pub fn clear_google_token(&self, tenant_id: &str) -> RuntimeResult<()> {
        self.ensure_layout(tenant_id)?;
        let path = self.google_token_path(tenant_id)?;
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        Ok(())
    }

    pub fn bridge_ws_url(&self, tenant_id: &str) -> RuntimeResult<String> {
        self.validate_tenant_id(tenant_id)?;
        Ok(format!(
            "ws://tenant_{tenant_id}_runtime:{}",
            self.settings.bridge_port
        ))
    }

    /// Shared-secret header for the bridge socket, when the tenant env
    /// carries one.
    pub fn bridge_ws_secret(&self, tenant_id: &str) -> RuntimeResult<Option<String>> {
        let env = self.read_runtime_env(tenant_id)?;
        Ok(env
            .get(BRIDGE_SHARED_SECRET_KEY)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    async fn run_checked(&self, args: Vec<String>) -> RuntimeResult<String> {
        let output = self
            .commands
            .run(&args)
            .await
            .map_err(|e| RuntimeError::new("docker_unavailable", format!("command_exec_error args={args:?} error={e}")))?;
        if !output.success() {
            return Err(RuntimeError::new(
                "docker_command_failed",
                format!("command_failed args={args:?} output={}", output.combined()),
            ));
        }
        Ok(output.combined())
    }

    async fn run_unchecked(&self, args: Vec<String>) -> RuntimeResult<String> {
        let output = self
            .commands
            .run(&args)
            .await
            .map_err(|e| RuntimeError::new("docker_unavailable", format!("command_exec_error args={args:?} error={e}")))?;
        Ok(output.combined())
    }

    async fn run_capture(&self, args: Vec<String>) -> RuntimeResult<(i32, String)> {
        let output = self
            .commands
            .run(&args)
            .await
            .map_err(|e| RuntimeError::new("docker_unavailable", format!("command_exec_error args={args:?} error={e}")))?;
        Ok((output.status, output.combined()))
    }

    /// Local image inspect with a manifest fallback. Unknown-manifest output
    /// means the tag does not exist; other failures are engine trouble.
    pub async fn ensure_image_available(&self, image: &str) -> RuntimeResult<()> {
        let inspect = vec![
            "docker".to_string(),
            "image".to_string(),
            "inspect".to_string(),
            image.to_string(),
        ];
        let (inspect_rc, _) = self.run_capture(inspect).await?;
        if inspect_rc == 0 {
            return Ok(());
        }

        let manifest = vec![
            "docker".to_string(),
            "manifest".to_string(),
            "inspect".to_string(),
            image.to_string(),
        ];
        let (manifest_rc, manifest_out) = self.run_capture(manifest.clone()).await?;
        if manifest_rc == 0 {
            return Ok(());
        }

        let lowered = manifest_out.to_lowercase();
        let unknown = [
            "manifest unknown",
            "no such manifest",
            "not found",
            "name unknown",
            "pull access denied",
            "unauthorized",
        ];
        if unknown.iter().any(|token| lowered.contains(token)) {
            return Err(RuntimeError::new(
                "nexus_image_invalid",
                format!("Runtime image is not available: {image}"),
            ));
        }
        Err(RuntimeError::new(
            "docker_command_failed",
            format!("command_failed args={manifest:?} output={manifest_out}"),
        ))
    }

    pub async fn docker_available(&self) -> (bool, String) {
        let args = vec![
            "docker".to_string(),
            "info".to_string(),
            "--format".to_string(),
            "{{.ServerVersion}}".to_string(),
        ];
        match self.run_checked(args).await {
            Ok(out) => {
                let status = if out.is_empty() { "ok".to_string() } else { out };
                (true, status)
            }
            Err(err) => (false, format!("{}: {}", err.code, err.message)),
        }
    }

    pub async fn list_running_tenant_ids(&self) -> RuntimeResult<Vec<String>> {
        let args = vec![
            "docker".to_string(),
            "ps".to_string(),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ];
        let out = self.run_unchecked(args).await?;
        let mut tenant_ids: Vec<String> = out
            .lines()
            .filter_map(|raw| {
                let name = raw.trim();
                RUNNING_CONTAINER_RE
                    .captures(name)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            })
            .filter(|tenant_id| TENANT_ID_RE.is_match(tenant_id))
            .collect();
        tenant_ids.sort();
        tenant_ids.dedup();
        Ok(tenant_ids)
    }

    fn compose_args(&self, tenant_id: &str, verb: &[&str]) -> RuntimeResult<Vec<String>> {
        let compose_file = self.compose_file(tenant_id)?;
        let mut args = vec![
            "docker".to_string(),
            "compose".to_string(),
            "-f".to_string(),
            compose_file.display().to_string(),
        ];
        args.extend(verb.iter().map(|v| v.to_string()));
        Ok(args)
    }

    pub async fn compose_up(&self, tenant_id: &str, nexus_image: Option<&str>) -> RuntimeResult<()> {
        self.validate_layout(tenant_id, false)?;
        if let Some(image) = nexus_image {
            let image = validate_image_tag(image)?;
            self.ensure_image_available(&image).await?;
        }
        self.run_checked(self.compose_args(tenant_id, &["up", "-d"])?).await?;
        Ok(())
    }

    pub async fn compose_start(&self, tenant_id: &str, nexus_image: Option<&str>) -> RuntimeResult<()> {
        self.validate_layout(tenant_id, true)?;
        if self.migrate_legacy_config_mount(tenant_id)? {
            tracing::info!(%tenant_id, "updated legacy compose config mount to read-write");
        }
        if let Some(image) = nexus_image {
            let image = validate_image_tag(image)?;
            self.ensure_image_available(&image).await?;
            if self.migrate_compose_image(tenant_id, &image)? {
                tracing::info!(%tenant_id, %image, "updated tenant compose image");
            }
        }
        self.run_checked(self.compose_args(tenant_id, &["up", "-d"])?).await?;
        Ok(())
    }

    pub async fn compose_stop(&self, tenant_id: &str) -> RuntimeResult<()> {
        self.validate_layout(tenant_id, true)?;
        self.run_checked(self.compose_args(tenant_id, &["stop"])?).await?;
        Ok(())
    }

    pub async fn compose_restart(&self, tenant_id: &str, nexus_image: Option<&str>) -> RuntimeResult<()> {
        self.validate_layout(tenant_id, true)?;
        if let Some(image) = nexus_image {
            let image = validate_image_tag(image)?;
            self.ensure_image_available(&image).await?;
            if self.migrate_compose_image(tenant_id, &image)? {
                tracing::info!(%tenant_id, %image, "updated tenant compose image");
            }
            self.run_checked(self.compose_args(tenant_id, &["up", "-d"])?).await?;
            return Ok(());
        }
        self.run_checked(self.compose_args(tenant_id, &["restart"])?).await?;
        Ok(())
    }

    pub async fn compose_down(&self, tenant_id: &str, remove_volumes: bool) -> RuntimeResult<()> {
        self.validate_layout(tenant_id, true)?;
        let mut verb = vec!["down"];
        if remove_volumes {
            verb.push("-v");
        }
        self.run_checked(self.compose_args(tenant_id, &verb)?).await?;
        Ok(())
    }

    fn session_volume_candidates(&self, tenant_id: &str) -> RuntimeResult<Vec<String>> {
        let legacy = format!("tenant_{tenant_id}_session");
        let compose_project = self
            .compose_file(tenant_id)?
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or(tenant_id)
            .to_string();
        let prefixed = format!("{compose_project}_{legacy}");

        let mut candidates = Vec::new();
        for candidate in [prefixed, legacy] {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    async fn resolve_session_volume_from_mount(
        &self,
        tenant_id: &str,
        container: &str,
    ) -> RuntimeResult<Option<String>> {
        let args = vec![
            "docker".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .Mounts}}".to_string(),
            container.to_string(),
        ];
        let (rc, out) = self.run_capture(args).await?;
        if rc != 0 {
            if out.to_lowercase().contains("no such container") {
                tracing::info!(%tenant_id, %container, "runtime container missing while resolving session volume");
            } else {
                tracing::warn!(%tenant_id, %container, output = %out, "failed to inspect runtime container mounts");
            }
            return Ok(None);
        }

        // The mounts JSON is the last bracketed line; engine warnings may
        // precede it on stderr.
        let mut payload = "";
        for raw_line in out.lines() {
            let line = raw_line.trim();
            if line.starts_with('[') && line.ends_with(']') {
                payload = line;
            }
        }
        if payload.is_empty() {
            payload = out.trim();
        }
        if payload.is_empty() {
            return Ok(None);
        }

        let mounts: Value = match serde_json::from_str(payload) {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(%tenant_id, %container, payload, "failed to parse runtime container mounts");
                return Ok(None);
            }
        };
        let Value::Array(mounts) = mounts else {
            return Ok(None);
        };

        for mount in mounts {
            let mount_type = mount.get("Type").and_then(Value::as_str).unwrap_or("");
            if !mount_type.eq_ignore_ascii_case("volume") {
                continue;
            }
            let destination = mount.get("Destination").and_then(Value::as_str).unwrap_or("");
            if destination != SESSION_MOUNT_DESTINATION {
                continue;
            }
            let volume = mount
                .get("Name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            if !volume.is_empty() {
                tracing::info!(%tenant_id, %volume, source = "container_mount", "resolved tenant session volume");
                return Ok(Some(volume));
            }
        }
        Ok(None)
    }

    async fn resolve_session_volume(
        &self,
        tenant_id: &str,
        container: &str,
    ) -> RuntimeResult<Option<String>> {
        if let Some(volume) = self.resolve_session_volume_from_mount(tenant_id, container).await? {
            return Ok(Some(volume));
        }

        for candidate in self.session_volume_candidates(tenant_id)? {
            let args = vec![
                "docker".to_string(),
                "volume".to_string(),
                "inspect".to_string(),
                candidate.clone(),
            ];
            let (rc, out) = self.run_capture(args.clone()).await?;
            if rc == 0 {
                tracing::info!(%tenant_id, volume = %candidate, source = "fallback", "resolved tenant session volume");
                return Ok(Some(candidate));
            }
            if out.to_lowercase().contains("no such volume") {
                continue;
            }
            return Err(RuntimeError::new(
                "docker_command_failed",
                format!("command_failed args={args:?} output={out}"),
            ));
        }
        Ok(None)
    }

    /// Destroy the in-container session state so the next start re-pairs.
    /// Missing container or volume is treated as already clean.
    pub async fn clear_session_volume(&self, tenant_id: &str) -> RuntimeResult<()> {
        self.validate_layout(tenant_id, true)?;
        let container = format!("tenant_{tenant_id}_runtime");
        let Some(volume) = self.resolve_session_volume(tenant_id, &container).await? else {
            tracing::info!(%tenant_id, "session volume not found; treating as already clean");
            return Ok(());
        };

        tracing::info!(%tenant_id, %volume, "recreating tenant session volume");

        let rm_container = vec![
            "docker".to_string(),
            "rm".to_string(),
            "-f".to_string(),
            container.clone(),
        ];
        let (rc, out) = self.run_capture(rm_container.clone()).await?;
        if rc != 0 {
            if !out.to_lowercase().contains("no such container") {
                return Err(RuntimeError::new(
                    "docker_command_failed",
                    format!("command_failed args={rm_container:?} output={out}"),
                ));
            }
            tracing::info!(%tenant_id, %container, "runtime container already absent before session volume recreation");
        }

        let rm_volume = vec![
            "docker".to_string(),
            "volume".to_string(),
            "rm".to_string(),
            volume.clone(),
        ];
        let (rc, out) = self.run_capture(rm_volume.clone()).await?;
        if rc != 0 {
            if out.to_lowercase().contains("no such volume") {
                tracing::info!(%tenant_id, %volume, "session volume already absent during recreation");
                return Ok(());
            }
            return Err(RuntimeError::new(
                "docker_command_failed",
                format!("command_failed args={rm_volume:?} output={out}"),
            ));
        }

        tracing::info!(%tenant_id, %volume, "recreated tenant session volume");
        Ok(())
    }

    pub async fn is_running(&self, tenant_id: &str) -> RuntimeResult<(bool, String)> {
        self.validate_tenant_id(tenant_id)?;
        let name = format!("tenant_{tenant_id}_runtime");
        let args = vec![
            "docker".to_string(),
            "ps".to_string(),
            "--filter".to_string(),
            format!("name={name}"),
            "--format".to_string(),
            "{{.Status}}".to_string(),
        ];
        let out = self.run_unchecked(args).await?;
        if out.is_empty() {
            Ok((false, "not running".to_string()))
        } else {
            Ok((true, out))
        }
    }

    pub fn delete_tenant_files(&self, tenant_id: &str) -> RuntimeResult<()> {
        let tenant_dir = self.tenant_dir(tenant_id)?;
        if !tenant_dir.exists() {
            return Ok(());
        }
        let rendered = tenant_dir.display().to_string();
        if rendered.trim().is_empty() || rendered.trim() == "/" {
            return Err(RuntimeError::new("unsafe_path", "Refusing to delete unsafe path"));
        }
        std::fs::remove_dir_all(&tenant_dir).map_err(|e| {
            RuntimeError::new(
                "invalid_tenant_path",
                format!("Could not delete {}: {e}", tenant_dir.display()),
            )
        })
    }

    /// Rewrite the legacy read-only config mount in place.
    pub fn migrate_legacy_config_mount(&self, tenant_id: &str) -> RuntimeResult<bool> {
        let compose_path = self.compose_file(tenant_id)?;
        let original = std::fs::read_to_string(&compose_path).map_err(|e| {
            RuntimeError::new(
                "compose_missing",
                format!("Compose file unreadable at {}: {e}", compose_path.display()),
            )
        })?;
        if !original.contains(LEGACY_CONFIG_RO_MOUNT) {
            return Ok(false);
        }
        let updated = original.replace(LEGACY_CONFIG_RO_MOUNT, CONFIG_RW_MOUNT);
        if updated == original {
            return Ok(false);
        }
        write_text(&compose_path, &updated)?;
        Ok(true)
    }

    /// Indentation-preserving rewrite of the `runtime:` service's `image:`
    /// line, without a YAML parser.
    pub fn migrate_compose_image(&self, tenant_id: &str, nexus_image: &str) -> RuntimeResult<bool> {
        let compose_path = self.compose_file(tenant_id)?;
        let original = std::fs::read_to_string(&compose_path).map_err(|e| {
            RuntimeError::new(
                "compose_missing",
                format!("Compose file unreadable at {}: {e}", compose_path.display()),
            )
        })?;
        let lines: Vec<&str> = original.lines().collect();

        let mut in_services = false;
        let mut services_indent: i64 = -1;
        let mut in_runtime = false;
        let mut runtime_indent: i64 = -1;
        let mut image_line_index: Option<usize> = None;
        let mut image_line_indent = 0usize;

        for (idx, line) in lines.iter().enumerate() {
            let stripped = line.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                continue;
            }
            let indent = (line.len() - line.trim_start_matches(' ').len()) as i64;

            if stripped == "services:" {
                in_services = true;
                services_indent = indent;
                in_runtime = false;
                continue;
            }
            if in_services && indent <= services_indent {
                in_services = false;
                in_runtime = false;
            }
            if !in_services {
                continue;
            }
            if stripped == "runtime:" && indent > services_indent {
                in_runtime = true;
                runtime_indent = indent;
                continue;
            }
            if in_runtime && indent <= runtime_indent {
                in_runtime = false;
            }
            if in_runtime && stripped.starts_with("image:") {
                image_line_index = Some(idx);
                image_line_indent = indent as usize;
                break;
            }
        }

        let Some(index) = image_line_index else {
            return Ok(false);
        };
        let desired = format!("{}image: {nexus_image}", " ".repeat(image_line_indent));
        if lines[index] == desired {
            return Ok(false);
        }

        let mut updated_lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        updated_lines[index] = desired;
        let mut updated = updated_lines.join("\n");
        if original.ends_with('\n') {
            updated.push('\n');
        }
        write_text(&compose_path, &updated)?;
        Ok(true)
    }
}

fn write_text(path: &Path, content: &str) -> RuntimeResult<()> {
    std::fs::write(path, content).map_err(|e| {
        RuntimeError::new(
            "invalid_tenant_path",
            format!("Could not write {}: {e}", path.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_placeholders_are_rejected() {
        assert!(validate_image_tag("").is_err());
        assert!(validate_image_tag("  ").is_err());
        assert!(validate_image_tag("ghcr.io/your-org/nexus:latest").is_err());
        assert!(validate_image_tag("ghcr.io/acme/nexus:sha-REPLACE_WITH_COMMIT").is_err());
        assert!(validate_image_tag("ghcr.io/<org>/nexus:1").is_err());
        assert_eq!(
            validate_image_tag(" ghcr.io/acme/nexus:1.2 ").unwrap(),
            "ghcr.io/acme/nexus:1.2"
        );
    }

    #[test]
    fn template_rendering_substitutes_known_variables() {
        let mut values = BTreeMap::new();
        values.insert("TENANT_ID", "abc123".to_string());
        let rendered = render_template("id=${TENANT_ID} other=${UNKNOWN}", &values);
        assert_eq!(rendered, "id=abc123 other=${UNKNOWN}");
    }
}
