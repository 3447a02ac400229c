use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use renewdesk_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

/// One reported setting: dotted key, rendered value, and the env var that can override it.
struct Setting {
    key: &'static str,
    value: String,
    env_key: &'static str,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for setting in settings(&config) {
        let source = field_source(
            setting.key,
            setting.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(setting.key, &setting.value, source));
    }

    lines.join("\n")
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "<unset>".to_string());
    let staff_tokens = if config.auth.staff_tokens.is_empty() {
        "<none>".to_string()
    } else {
        config
            .auth
            .staff_tokens
            .iter()
            .map(|entry| format!("{}={}", entry.staff_id, redact_token(entry.token.expose_secret())))
            .collect::<Vec<_>>()
            .join(", ")
    };

    vec![
        Setting {
            key: "database.url",
            value: config.database.url.clone(),
            env_key: "RENEWDESK_DATABASE_URL",
        },
        Setting {
            key: "database.max_connections",
            value: config.database.max_connections.to_string(),
            env_key: "RENEWDESK_DATABASE_MAX_CONNECTIONS",
        },
        Setting {
            key: "database.timeout_secs",
            value: config.database.timeout_secs.to_string(),
            env_key: "RENEWDESK_DATABASE_TIMEOUT_SECS",
        },
        Setting {
            key: "store.backend",
            value: format!("{:?}", config.store.backend),
            env_key: "RENEWDESK_STORE_BACKEND",
        },
        Setting {
            key: "store.session_ttl_secs",
            value: config.store.session_ttl_secs.to_string(),
            env_key: "RENEWDESK_STORE_SESSION_TTL_SECS",
        },
        Setting {
            key: "server.bind_address",
            value: config.server.bind_address.clone(),
            env_key: "RENEWDESK_SERVER_BIND_ADDRESS",
        },
        Setting {
            key: "server.port",
            value: config.server.port.to_string(),
            env_key: "RENEWDESK_SERVER_PORT",
        },
        Setting {
            key: "server.health_check_port",
            value: config.server.health_check_port.to_string(),
            env_key: "RENEWDESK_SERVER_HEALTH_CHECK_PORT",
        },
        Setting {
            key: "providers.mode",
            value: format!("{:?}", config.providers.mode),
            env_key: "RENEWDESK_PROVIDERS_MODE",
        },
        Setting {
            key: "providers.crm_base_url",
            value: optional(&config.providers.crm_base_url),
            env_key: "RENEWDESK_PROVIDERS_CRM_BASE_URL",
        },
        Setting {
            key: "providers.pos_base_url",
            value: optional(&config.providers.pos_base_url),
            env_key: "RENEWDESK_PROVIDERS_POS_BASE_URL",
        },
        Setting {
            key: "providers.promotion_base_url",
            value: optional(&config.providers.promotion_base_url),
            env_key: "RENEWDESK_PROVIDERS_PROMOTION_BASE_URL",
        },
        Setting {
            key: "providers.timeout_secs",
            value: config.providers.timeout_secs.to_string(),
            env_key: "RENEWDESK_PROVIDERS_TIMEOUT_SECS",
        },
        Setting {
            key: "providers.default_store_id",
            value: config.providers.default_store_id.clone(),
            env_key: "RENEWDESK_PROVIDERS_DEFAULT_STORE_ID",
        },
        Setting {
            key: "auth.staff",
            value: staff_tokens,
            env_key: "RENEWDESK_AUTH_STAFF_TOKENS",
        },
        Setting {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_key: "RENEWDESK_LOGGING_LEVEL",
        },
        Setting {
            key: "logging.format",
            value: format!("{:?}", config.logging.format),
            env_key: "RENEWDESK_LOGGING_FORMAT",
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["renewdesk.toml", "config/renewdesk.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
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

/// Keeps at most the first four characters of a bearer token.
pub fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if trimmed.chars().count() <= 8 {
        return "<redacted>".to_string();
    }
    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}***")
}
