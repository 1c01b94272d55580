//! Runtime settings: defaults, then `embudo.toml`, then `EMBUDO_*` variables, then
//! explicit overrides. Everything is validated once at the end.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Files probed, in order, when no explicit path is given.
pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["embudo.toml", "config/embudo.toml"];

/// Dotted setting path and the environment variable that overrides it.
pub const ENV_BINDINGS: &[(&str, &str)] = &[
    ("database.url", "EMBUDO_DATABASE_URL"),
    ("database.max_connections", "EMBUDO_DATABASE_MAX_CONNECTIONS"),
    ("database.timeout_secs", "EMBUDO_DATABASE_TIMEOUT_SECS"),
    ("server.bind_address", "EMBUDO_SERVER_BIND_ADDRESS"),
    ("server.port", "EMBUDO_SERVER_PORT"),
    ("server.graceful_shutdown_secs", "EMBUDO_SERVER_GRACEFUL_SHUTDOWN_SECS"),
    ("scheduler.enabled", "EMBUDO_SCHEDULER_ENABLED"),
    ("scheduler.interval_secs", "EMBUDO_SCHEDULER_INTERVAL_SECS"),
    ("scheduler.batch_limit", "EMBUDO_SCHEDULER_BATCH_LIMIT"),
    ("messaging.enabled", "EMBUDO_MESSAGING_ENABLED"),
    ("messaging.base_url", "EMBUDO_MESSAGING_BASE_URL"),
    ("messaging.service_secret", "EMBUDO_MESSAGING_SERVICE_SECRET"),
    ("messaging.timeout_secs", "EMBUDO_MESSAGING_TIMEOUT_SECS"),
    ("logging.level", "EMBUDO_LOGGING_LEVEL"),
    ("logging.format", "EMBUDO_LOGGING_FORMAT"),
];

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub messaging: MessagingConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://embudo.db".to_string(), max_connections: 5, timeout_secs: 30 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: "127.0.0.1".to_string(), port: 8080, graceful_shutdown_secs: 15 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Page size for candidate reads and the cap on commits attempted per tick.
    pub batch_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 300, batch_limit: 500 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MessagingConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    #[serde(deserialize_with = "optional_secret")]
    pub service_secret: Option<SecretString>,
    pub timeout_secs: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self { enabled: false, base_url: None, service_secret: None, timeout_secs: 10 }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Compact }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unsupported log format `{other}`")),
        }
    }
}

/// Values that beat both the file and the environment. Used by tests and tooling.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub scheduler_enabled: Option<bool>,
    pub messaging_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    /// Explicit file; when absent the candidates are probed.
    pub config_path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("config file references unset variable `${{{0}}}`")]
    UnsetVariable(String),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = match locate_file(options.config_path.as_deref()) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.apply_overrides(options.overrides);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
        let expanded = expand_variables(&raw)?;
        toml::from_str(&expanded)
            .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        for (path, var) in ENV_BINDINGS {
            let Some(raw) = env::var(var).ok().filter(|value| !value.trim().is_empty()) else {
                continue;
            };
            if self.set(path, raw.trim()).is_none() {
                return Err(ConfigError::InvalidEnvOverride { key: var.to_string(), value: raw });
            }
        }
        Ok(())
    }

    /// Assigns one setting from its textual form. `None` when the text does not parse.
    fn set(&mut self, path: &str, raw: &str) -> Option<()> {
        match path {
            "database.url" => self.database.url = raw.to_string(),
            "database.max_connections" => self.database.max_connections = raw.parse().ok()?,
            "database.timeout_secs" => self.database.timeout_secs = raw.parse().ok()?,
            "server.bind_address" => self.server.bind_address = raw.to_string(),
            "server.port" => self.server.port = raw.parse().ok()?,
            "server.graceful_shutdown_secs" => {
                self.server.graceful_shutdown_secs = raw.parse().ok()?
            }
            "scheduler.enabled" => self.scheduler.enabled = parse_flag(raw)?,
            "scheduler.interval_secs" => self.scheduler.interval_secs = raw.parse().ok()?,
            "scheduler.batch_limit" => self.scheduler.batch_limit = raw.parse().ok()?,
            "messaging.enabled" => self.messaging.enabled = parse_flag(raw)?,
            "messaging.base_url" => self.messaging.base_url = Some(raw.to_string()),
            "messaging.service_secret" => {
                self.messaging.service_secret = Some(SecretString::from(raw.to_string()))
            }
            "messaging.timeout_secs" => self.messaging.timeout_secs = raw.parse().ok()?,
            "logging.level" => self.logging.level = raw.to_ascii_lowercase(),
            "logging.format" => self.logging.format = raw.parse().ok()?,
            _ => return None,
        }
        Some(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.database_url {
            self.database.url = url;
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler.enabled = enabled;
        }
        if let Some(enabled) = overrides.messaging_enabled {
            self.messaging.enabled = enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.database.url.trim();
        let messaging = &self.messaging;
        let has_secret = messaging
            .service_secret
            .as_ref()
            .is_some_and(|secret| !secret.expose_secret().trim().is_empty());
        let base_url_ok = messaging
            .base_url
            .as_deref()
            .map_or(true, |base| base.starts_with("http://") || base.starts_with("https://"));

        let rules = [
            (
                url.starts_with("sqlite:") || url == ":memory:",
                "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...` or `:memory:`)",
            ),
            (self.database.max_connections > 0, "database.max_connections must be at least 1"),
            (
                (1..=300).contains(&self.database.timeout_secs),
                "database.timeout_secs must be in range 1..=300",
            ),
            (!self.server.bind_address.trim().is_empty(), "server.bind_address must not be empty"),
            (
                self.server.graceful_shutdown_secs > 0,
                "server.graceful_shutdown_secs must be at least 1",
            ),
            (self.scheduler.interval_secs > 0, "scheduler.interval_secs must be at least 1"),
            (self.scheduler.batch_limit > 0, "scheduler.batch_limit must be at least 1"),
            (
                (1..=120).contains(&messaging.timeout_secs),
                "messaging.timeout_secs must be in range 1..=120",
            ),
            (base_url_ok, "messaging.base_url must start with http:// or https://"),
            (
                !messaging.enabled || (messaging.base_url.is_some() && has_secret),
                "messaging.enabled needs both messaging.base_url and messaging.service_secret",
            ),
            (
                matches!(
                    self.logging.level.trim().to_ascii_lowercase().as_str(),
                    "trace" | "debug" | "info" | "warn" | "error"
                ),
                "logging.level must be one of trace|debug|info|warn|error",
            ),
        ];

        match rules.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(ConfigError::Validation((*message).to_string())),
            None => Ok(()),
        }
    }
}

/// The explicit path when it exists, else the first candidate found on disk.
pub fn locate_file(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => path.exists().then(|| path.to_path_buf()),
        None => CONFIG_FILE_CANDIDATES.iter().map(PathBuf::from).find(|path| path.exists()),
    }
}

/// Replaces each `${NAME}` with the variable's value. A `$` not followed by `{` is kept.
fn expand_variables(raw: &str) -> Result<String, ConfigError> {
    let mut expanded = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::Validation("unterminated `${` in config file".into()))?;
        let name = &after[..end];
        let value = env::var(name).map_err(|_| ConfigError::UnsetVariable(name.to_string()))?;
        expanded.push_str(&value);
        rest = &after[end + 1..];
    }
    expanded.push_str(rest);
    Ok(expanded)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}
