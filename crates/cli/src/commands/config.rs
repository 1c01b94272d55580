use std::env;
use std::fs;
use std::path::Path;

use embudo_core::config::{locate_file, AppConfig, LoadOptions, ENV_BINDINGS};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = locate_file(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_key) in ENV_BINDINGS {
        let source = field_source(
            key_path,
            Some(*env_key),
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(key_path, &rendered_value(&config, key_path), source));
    }

    lines.join("\n")
}

fn rendered_value(config: &AppConfig, key_path: &str) -> String {
    let unset = || "<unset>".to_string();
    match key_path {
        "database.url" => config.database.url.clone(),
        "database.max_connections" => config.database.max_connections.to_string(),
        "database.timeout_secs" => config.database.timeout_secs.to_string(),
        "server.bind_address" => config.server.bind_address.clone(),
        "server.port" => config.server.port.to_string(),
        "server.graceful_shutdown_secs" => config.server.graceful_shutdown_secs.to_string(),
        "scheduler.enabled" => config.scheduler.enabled.to_string(),
        "scheduler.interval_secs" => config.scheduler.interval_secs.to_string(),
        "scheduler.batch_limit" => config.scheduler.batch_limit.to_string(),
        "messaging.enabled" => config.messaging.enabled.to_string(),
        "messaging.base_url" => config.messaging.base_url.clone().unwrap_or_else(unset),
        "messaging.service_secret" => config
            .messaging
            .service_secret
            .as_ref()
            .map(|secret| redact_secret(secret.expose_secret()))
            .unwrap_or_else(unset),
        "messaging.timeout_secs" => config.messaging.timeout_secs.to_string(),
        "logging.level" => config.logging.level.clone(),
        "logging.format" => format!("{:?}", config.logging.format),
        _ => unset(),
    }
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps the first two characters so operators can tell secrets apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    let prefix: String = trimmed.chars().take(2).collect();
    format!("{prefix}***")
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use embudo_core::config::{AppConfig, ENV_BINDINGS};

    use super::{contains_path, redact_secret, rendered_value};

    #[test]
    fn secrets_are_never_rendered_in_full() {
        assert_eq!(redact_secret("wa-secret-value"), "wa***");
        assert_eq!(redact_secret("   "), "<empty>");
    }

    #[test]
    fn every_bound_setting_has_a_rendering() {
        let config = AppConfig::default();
        for (key_path, _) in ENV_BINDINGS {
            let value = rendered_value(&config, key_path);
            assert!(!value.is_empty(), "{key_path} rendered empty");
        }
        assert_eq!(rendered_value(&config, "scheduler.batch_limit"), "500");
        assert_eq!(rendered_value(&config, "messaging.service_secret"), "<unset>");
    }

    #[test]
    fn nested_keys_are_found_in_the_file_document() {
        let doc = "[scheduler]\ninterval_secs = 60\n".parse::<Value>().expect("toml");
        assert!(contains_path(&doc, "scheduler.interval_secs"));
        assert!(!contains_path(&doc, "scheduler.batch_limit"));
    }
}
