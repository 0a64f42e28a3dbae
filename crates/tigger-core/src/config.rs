use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, loaded from `$DATA_PATH/config.toml` with
/// environment variable overrides applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            queue: QueueConfig::default(),
            auth: AuthConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `$DATA_PATH/config.toml`, falling back to defaults
    /// when the file does not exist, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let path = cfg.paths.data.join("config.toml");
        if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            cfg = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        }
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load from a specific path, without environment overrides.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overlay values from environment variables, matching the variable
    /// names from the external-interfaces surface (`DATA_PATH`,
    /// `DATABASE_URL`, `MODEL_PATH`, `SECRET_KEY`, `ROOT_PASSWORD`,
    /// `MAX_LOADED_PROJECTS`, `N_WORKERS_CPU`, `N_WORKERS_GPU`,
    /// `UPDATE_TIMEOUT`, `JWT_ALGORITHM`, `MAIL_*`).
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DATA_PATH") {
            self.paths.data = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.paths.database_url = v;
        }
        if let Ok(v) = std::env::var("MODEL_PATH") {
            self.paths.models = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SECRET_KEY") {
            self.auth.secret_key = v;
        }
        if let Ok(v) = std::env::var("ROOT_PASSWORD") {
            self.auth.root_password = Some(v);
        }
        if let Ok(v) = parse_env("MAX_LOADED_PROJECTS") {
            self.queue.max_loaded_projects = v;
        }
        if let Ok(v) = parse_env("N_WORKERS_CPU") {
            self.queue.n_workers_cpu = v;
        }
        if let Ok(v) = parse_env("N_WORKERS_GPU") {
            self.queue.n_workers_gpu = v;
        }
        if let Ok(v) = parse_env("UPDATE_TIMEOUT") {
            self.queue.update_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("JWT_ALGORITHM") {
            self.auth.jwt_algorithm = v;
        }
        if let Ok(v) = std::env::var("MAIL_FROM") {
            self.mail.from = Some(v);
        }
        if let Ok(v) = std::env::var("MAIL_SERVER") {
            self.mail.server = Some(v);
        }
        if let Ok(v) = parse_env("MAIL_PORT") {
            self.mail.port = Some(v);
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<T, ()> {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).ok_or(())
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_path")]
    pub data: PathBuf,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_model_path")]
    pub models: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data: default_data_path(),
            database_url: default_database_url(),
            models: default_model_path(),
        }
    }
}

fn default_data_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".activetigger")
}
fn default_database_url() -> String {
    "activetigger.db".into()
}
fn default_model_path() -> PathBuf {
    default_data_path().join("models")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_loaded_projects")]
    pub max_loaded_projects: usize,
    #[serde(default = "default_n_workers_cpu")]
    pub n_workers_cpu: usize,
    #[serde(default = "default_n_workers_gpu")]
    pub n_workers_gpu: usize,
    #[serde(default = "default_update_timeout")]
    pub update_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_loaded_projects: default_max_loaded_projects(),
            n_workers_cpu: default_n_workers_cpu(),
            n_workers_gpu: default_n_workers_gpu(),
            update_timeout_secs: default_update_timeout(),
        }
    }
}

fn default_max_loaded_projects() -> usize {
    10
}
fn default_n_workers_cpu() -> usize {
    5
}
fn default_n_workers_gpu() -> usize {
    1
}
fn default_update_timeout() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
    #[serde(default)]
    pub root_password: Option<String>,
    #[serde(default = "default_jwt_algorithm")]
    pub jwt_algorithm: String,
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_mins: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: default_secret_key(),
            root_password: None,
            jwt_algorithm: default_jwt_algorithm(),
            token_lifetime_mins: default_token_lifetime(),
        }
    }
}

fn default_secret_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
fn default_jwt_algorithm() -> String {
    "HS256".into()
}
fn default_token_lifetime() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            from: None,
            server: None,
            port: None,
        }
    }
}

mod hex {
    pub fn encode(bytes: [u8; 32]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
