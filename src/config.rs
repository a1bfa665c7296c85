//! Configuration loader and validator for the notification dispatcher.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub chat: Chat,
    pub mail: Mail,
    pub storage: Storage,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub http_bind: String,
}

/// Chat workspace credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub api_token: String,
    /// Override for the chat API endpoint (tests point this at a local server).
    pub base_url: Option<String>,
}

/// Mail (SMTP) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub default_from: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
}

/// Filesystem settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Storage {
    /// Attachments may only be read from below this directory.
    pub media_root: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.http_bind.trim().is_empty() {
        return Err(ConfigError::Invalid("app.http_bind must be non-empty"));
    }

    if cfg.chat.api_token.trim().is_empty() {
        return Err(ConfigError::Invalid("chat.api_token must be non-empty"));
    }

    if cfg.mail.default_from.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.default_from must be non-empty"));
    }
    if cfg.mail.smtp_host.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.smtp_host must be non-empty"));
    }
    if cfg.mail.smtp_port == 0 {
        return Err(ConfigError::Invalid("mail.smtp_port must be > 0"));
    }

    if cfg.storage.media_root.trim().is_empty() {
        return Err(ConfigError::Invalid("storage.media_root must be non-empty"));
    }

    Ok(())
}

/// Canonical example configuration, also used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 1000
  http_bind: "127.0.0.1:8350"

chat:
  api_token: "YOUR_CHAT_APP_TOKEN"

mail:
  default_from: "notifications@example.com"
  smtp_host: "localhost"
  smtp_port: 587

storage:
  media_root: "./media"
"#
}
