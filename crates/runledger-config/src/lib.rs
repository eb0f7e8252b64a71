use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RUNLEDGER_DIR_NAME: &str = ".runledger";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_DB_PATH: &str = ".runledger/runs.sqlite";
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_BIND: &str = "127.0.0.1:4020";
pub const DEFAULT_SECRET_ENV: &str = "RUNLEDGER_SECRET";
pub const DEFAULT_KEEP_EXPERIMENTAL: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicyKind {
    #[default]
    KeepBest,
    Tiered,
}

impl RetentionPolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepBest => "keep_best",
            Self::Tiered => "tiered",
        }
    }
}

impl std::str::FromStr for RetentionPolicyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "keep_best" => Ok(Self::KeepBest),
            "tiered" => Ok(Self::Tiered),
            other => Err(format!(
                "invalid retention policy '{other}', expected one of: keep_best, tiered"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunledgerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            secret_env: default_secret_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub policy: RetentionPolicyKind,
    #[serde(default = "default_keep_experimental")]
    pub keep_experimental: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            policy: RetentionPolicyKind::KeepBest,
            keep_experimental: DEFAULT_KEEP_EXPERIMENTAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn runledger_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(RUNLEDGER_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    runledger_dir(workspace_root).join(CONFIG_FILE_NAME)
}

/// Absolute database path; relative `storage.path` values resolve under the workspace.
pub fn database_path(workspace_root: impl AsRef<Path>, config: &RunledgerConfig) -> PathBuf {
    let configured = Path::new(&config.storage.path);
    if configured.is_absolute() {
        return configured.to_path_buf();
    }
    workspace_root.as_ref().join(configured)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<RunledgerConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(RunledgerConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: RunledgerConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<RunledgerConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(runledger_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = RunledgerConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &RunledgerConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.storage.timeout_ms == 0 {
        warnings.push(ConfigWarning {
            code: "storage_timeout_zero",
            message: "storage.timeout_ms is 0; every backend call will time out".to_owned(),
        });
    }

    if config.server.bind.parse::<SocketAddr>().is_err() {
        warnings.push(ConfigWarning {
            code: "server_bind_invalid",
            message: format!(
                "server.bind '{}' is not a socket address; falling back to {DEFAULT_BIND}",
                config.server.bind
            ),
        });
    }

    if config.retention.policy == RetentionPolicyKind::Tiered
        && config.retention.keep_experimental == 0
    {
        warnings.push(ConfigWarning {
            code: "retention_keep_zero",
            message: "retention.keep_experimental is 0; tiered cleanup keeps only baseline and best runs"
                .to_owned(),
        });
    }

    warnings
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_owned()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_bind() -> String {
    DEFAULT_BIND.to_owned()
}

fn default_secret_env() -> String {
    DEFAULT_SECRET_ENV.to_owned()
}

fn default_keep_experimental() -> usize {
    DEFAULT_KEEP_EXPERIMENTAL
}

fn normalize_required(input: &str, default: fn() -> String) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        default()
    } else {
        trimmed.to_owned()
    }
}

fn normalize_config(mut config: RunledgerConfig) -> RunledgerConfig {
    config.storage.path = normalize_required(&config.storage.path, default_db_path);
    config.server.bind = normalize_required(&config.server.bind, default_bind);
    config.server.secret_env = normalize_required(&config.server.secret_env, default_secret_env);
    config
}
