use crate::{Result, runtime_dir};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    "node_modules",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub snapshot: SnapshotConfig,
    pub policy: PolicyConfig,
    pub repair: RepairConfig,
    pub verify: VerifyConfig,
    pub publish: PublishConfig,
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    /// Fresh completions requested when model output does not decode.
    pub json_retries: u32,
    pub max_candidate_files: usize,
    pub max_prompt_file_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_seconds: 120,
            max_retries: 3,
            retry_base_ms: 400,
            json_retries: 3,
            max_candidate_files: 300,
            max_prompt_file_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub workspace_root: String,
    pub clone_attempts: u32,
    pub clone_backoff_ms: u64,
    pub max_file_bytes: usize,
    pub skip_dirs: Vec<String>,
    pub keep_working_copy: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            workspace_root: "/tmp/safeagent".to_string(),
            clone_attempts: 3,
            clone_backoff_ms: 1500,
            max_file_bytes: 200_000,
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(|d| d.to_string()).collect(),
            keep_working_copy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub forbidden_prefixes: Vec<String>,
    pub max_deleted_lines: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            forbidden_prefixes: vec![
                ".github/".to_string(),
                "infra/".to_string(),
                "terraform/".to_string(),
            ],
            max_deleted_lines: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub max_cycles: u32,
    /// Use full-file rewrites instead of a repaired diff on the last cycle.
    pub rewrite_fallback: bool,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_cycles: 2,
            rewrite_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub require_tests: bool,
    pub test_command: String,
    pub harness_markers: Vec<String>,
    pub timeout_seconds: u64,
    pub syntax_extensions: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            require_tests: true,
            test_command: "pytest -q".to_string(),
            harness_markers: vec![
                "tests".to_string(),
                "pytest.ini".to_string(),
                "pyproject.toml".to_string(),
            ],
            timeout_seconds: 600,
            syntax_extensions: vec!["py".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub api_base: String,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub base_branch: String,
    pub token: Option<String>,
    pub token_env: String,
    pub branch_prefix: String,
    pub comment_summary: bool,
    pub timeout_seconds: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            owner: None,
            repo: None,
            base_branch: "main".to_string(),
            token: None,
            token_env: "GITHUB_TOKEN".to_string(),
            branch_prefix: "safeagent/".to_string(),
            comment_summary: true,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Defaults to `<runtime_dir>/audit.sqlite`.
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret(self.api_key.as_deref(), &self.api_key_env)
    }
}

impl PublishConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret(self.token.as_deref(), &self.token_env)
    }
}

fn resolve_secret(configured: Option<&str>, env_name: &str) -> Option<String> {
    if let Ok(value) = std::env::var(env_name)
        && !value.trim().is_empty()
    {
        return Some(value);
    }
    configured
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".safeagent/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));
        Self::load_layers(&Self::legacy_toml_path(workspace), &paths)
    }

    fn load_layers(legacy: &Path, json_layers: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        if legacy.exists() {
            let raw = fs::read_to_string(legacy)?;
            let legacy_cfg: AppConfig = toml::from_str(&raw)?;
            merge_json_value(&mut merged, &serde_json::to_value(legacy_cfg)?);
        }

        for path in json_layers {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn audit_db_path(&self, workspace: &Path) -> PathBuf {
        match &self.store.database_path {
            Some(path) => PathBuf::from(path),
            None => runtime_dir(workspace).join("audit.sqlite"),
        }
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
