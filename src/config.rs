use crate::error::ConfigError;
use crate::follows::{command, http, UserId};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Accounts to watch, checked in this order every pass.
    pub targets: Vec<UserId>,
    /// Seconds between passes, before jitter.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// Flat form used by older `config.json` files.
    #[serde(default)]
    discord_webhook_url: Option<String>,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifierConfig {
    pub discord_webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    Http {
        base_url: String,
        #[serde(default = "default_page_size")]
        page_size: usize,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Command {
        #[serde(default = "default_program")]
        program: String,
        #[serde(default)]
        args_prefix: Vec<String>,
        #[serde(default = "default_command_timeout_secs")]
        timeout_secs: u64,
    },
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Command {
            program: default_program(),
            args_prefix: Vec::new(),
            timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_page_size() -> usize {
    http::DEFAULT_PAGE_SIZE
}

fn default_timeout_secs() -> u64 {
    http::DEFAULT_TIMEOUT_SECS
}

fn default_program() -> String {
    command::DEFAULT_PROGRAM.to_string()
}

fn default_command_timeout_secs() -> u64 {
    command::DEFAULT_TIMEOUT_SECS
}

impl Config {
    /// Read and validate a config file. `.json` files are parsed as JSON,
    /// anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
        .map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;

        config.validate()?;
        Ok(config)
    }

    fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    fn from_json(content: &str) -> Result<Self, String> {
        serde_json::from_str(content).map_err(|e| e.to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("no targets configured".to_string()));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.as_str().is_empty() {
                return Err(ConfigError::Invalid("empty target id".to_string()));
            }
            if !seen.insert(target) {
                return Err(ConfigError::Invalid(format!("duplicate target {}", target)));
            }
        }

        if self.poll_interval == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval must be at least 1 second".to_string(),
            ));
        }

        if let Some(url) = self.webhook_url() {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(ConfigError::Invalid(format!(
                    "discord_webhook_url is not an http(s) URL: {}",
                    url
                )));
            }
        }

        match &self.provider {
            ProviderConfig::Http {
                base_url,
                page_size,
                ..
            } => {
                if base_url.trim().is_empty() {
                    return Err(ConfigError::Invalid("provider.base_url is empty".to_string()));
                }
                if *page_size == 0 {
                    return Err(ConfigError::Invalid(
                        "provider.page_size must be positive".to_string(),
                    ));
                }
            }
            ProviderConfig::Command {
                program,
                timeout_secs,
                ..
            } => {
                if program.trim().is_empty() {
                    return Err(ConfigError::Invalid("provider.program is empty".to_string()));
                }
                if *timeout_secs == 0 {
                    return Err(ConfigError::Invalid(
                        "provider.timeout_secs must be positive".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn webhook_url(&self) -> Option<&str> {
        self.notifier
            .discord_webhook_url
            .as_deref()
            .or(self.discord_webhook_url.as_deref())
            .filter(|url| !url.trim().is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("followwatch").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

pub fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("followwatch").join("state.json"))
        .unwrap_or_else(|| PathBuf::from("state.json"))
}
