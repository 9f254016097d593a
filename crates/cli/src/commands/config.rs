use std::env;
use std::fs;
use std::path::Path;

use repairhub_core::config::{resolve_config_path, AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

/// Config keys in display order with their primary and alias environment variables.
const FIELDS: &[(&str, &[&str])] = &[
    ("database.url", &["REPAIRHUB_DATABASE_URL"]),
    ("database.max_connections", &["REPAIRHUB_DATABASE_MAX_CONNECTIONS"]),
    ("database.timeout_secs", &["REPAIRHUB_DATABASE_TIMEOUT_SECS"]),
    ("server.bind_address", &["REPAIRHUB_SERVER_BIND_ADDRESS"]),
    ("server.port", &["REPAIRHUB_SERVER_PORT"]),
    ("server.graceful_shutdown_secs", &["REPAIRHUB_SERVER_GRACEFUL_SHUTDOWN_SECS"]),
    ("server.gateway_secret", &["REPAIRHUB_SERVER_GATEWAY_SECRET"]),
    ("notifications.enabled", &["REPAIRHUB_NOTIFICATIONS_ENABLED"]),
    ("notifications.queue_capacity", &["REPAIRHUB_NOTIFICATIONS_QUEUE_CAPACITY"]),
    ("logging.level", &["REPAIRHUB_LOGGING_LEVEL", "REPAIRHUB_LOG_LEVEL"]),
    ("logging.format", &["REPAIRHUB_LOGGING_FORMAT", "REPAIRHUB_LOG_FORMAT"]),
];

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = resolve_config_path(None);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_keys) in FIELDS {
        let value = display_value(&config, key_path);
        let source =
            field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn display_value(config: &AppConfig, key_path: &str) -> String {
    match key_path {
        "database.url" => redact_url(&config.database.url),
        "database.max_connections" => config.database.max_connections.to_string(),
        "database.timeout_secs" => config.database.timeout_secs.to_string(),
        "server.bind_address" => config.server.bind_address.clone(),
        "server.port" => config.server.port.to_string(),
        "server.graceful_shutdown_secs" => config.server.graceful_shutdown_secs.to_string(),
        "server.gateway_secret" => match &config.server.gateway_secret {
            Some(secret) => redact_secret(secret.expose_secret()),
            None => "<unset>".to_string(),
        },
        "notifications.enabled" => config.notifications.enabled.to_string(),
        "notifications.queue_capacity" => config.notifications.queue_capacity.to_string(),
        "logging.level" => config.logging.level.clone(),
        "logging.format" => config.logging.format.as_str().to_string(),
        _ => "<unknown>".to_string(),
    }
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(*key).is_some()) {
        return format!("env ({env_key})");
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

    let visible: String = trimmed.chars().take(2).collect();
    format!("{visible}***")
}

/// Hides any password embedded in a connection URL.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.split_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
        None => url.to_string(),
    }
}
