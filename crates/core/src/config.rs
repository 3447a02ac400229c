use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub session_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ProvidersConfig {
    pub mode: ProviderMode,
    pub crm_base_url: Option<String>,
    pub pos_base_url: Option<String>,
    pub promotion_base_url: Option<String>,
    pub timeout_secs: u64,
    pub default_store_id: String,
}

/// Bearer tokens accepted by the HTTP surface, each bound to one employee.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    pub staff_tokens: Vec<StaffToken>,
}

#[derive(Clone, Debug)]
pub struct StaffToken {
    pub token: SecretString,
    pub staff_id: String,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    Simulated,
    Http,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub store_backend: Option<StoreBackend>,
    pub session_ttl_secs: Option<u64>,
    pub provider_mode: Option<ProviderMode>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://renewdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            store: StoreConfig { backend: StoreBackend::Memory, session_ttl_secs: 3600 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8000,
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            providers: ProvidersConfig {
                mode: ProviderMode::Simulated,
                crm_base_url: None,
                pos_base_url: None,
                promotion_base_url: None,
                timeout_secs: 10,
                default_store_id: "STORE001".to_string(),
            },
            auth: AuthConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AuthConfig {
    /// Resolves a presented bearer token to the employee it was issued for.
    pub fn staff_for_token(&self, presented: &str) -> Option<&str> {
        self.staff_tokens
            .iter()
            .find(|entry| entry.token.expose_secret() == presented)
            .map(|entry| entry.staff_id.as_str())
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::Validation(format!(
                "unsupported store backend `{other}` (expected memory|sqlite)"
            ))),
        }
    }
}

impl std::str::FromStr for ProviderMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulated" => Ok(Self::Simulated),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::Validation(format!(
                "unsupported provider mode `{other}` (expected simulated|http)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("renewdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(store) = patch.store {
            if let Some(backend) = store.backend {
                self.store.backend = backend;
            }
            if let Some(session_ttl_secs) = store.session_ttl_secs {
                self.store.session_ttl_secs = session_ttl_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(providers) = patch.providers {
            if let Some(mode) = providers.mode {
                self.providers.mode = mode;
            }
            if let Some(crm_base_url) = providers.crm_base_url {
                self.providers.crm_base_url = Some(crm_base_url);
            }
            if let Some(pos_base_url) = providers.pos_base_url {
                self.providers.pos_base_url = Some(pos_base_url);
            }
            if let Some(promotion_base_url) = providers.promotion_base_url {
                self.providers.promotion_base_url = Some(promotion_base_url);
            }
            if let Some(timeout_secs) = providers.timeout_secs {
                self.providers.timeout_secs = timeout_secs;
            }
            if let Some(default_store_id) = providers.default_store_id {
                self.providers.default_store_id = default_store_id;
            }
        }

        if let Some(auth) = patch.auth {
            if let Some(staff) = auth.staff {
                self.auth.staff_tokens = staff
                    .into_iter()
                    .map(|entry| StaffToken {
                        token: secret_value(entry.token),
                        staff_id: entry.staff_id,
                    })
                    .collect();
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("RENEWDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("RENEWDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("RENEWDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("RENEWDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("RENEWDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RENEWDESK_STORE_BACKEND") {
            self.store.backend = value.parse()?;
        }
        if let Some(value) = read_env("RENEWDESK_STORE_SESSION_TTL_SECS") {
            self.store.session_ttl_secs = parse_u64("RENEWDESK_STORE_SESSION_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("RENEWDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("RENEWDESK_SERVER_PORT") {
            self.server.port = parse_u16("RENEWDESK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("RENEWDESK_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("RENEWDESK_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("RENEWDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("RENEWDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("RENEWDESK_PROVIDERS_MODE") {
            self.providers.mode = value.parse()?;
        }
        if let Some(value) = read_env("RENEWDESK_PROVIDERS_CRM_BASE_URL") {
            self.providers.crm_base_url = Some(value);
        }
        if let Some(value) = read_env("RENEWDESK_PROVIDERS_POS_BASE_URL") {
            self.providers.pos_base_url = Some(value);
        }
        if let Some(value) = read_env("RENEWDESK_PROVIDERS_PROMOTION_BASE_URL") {
            self.providers.promotion_base_url = Some(value);
        }
        if let Some(value) = read_env("RENEWDESK_PROVIDERS_TIMEOUT_SECS") {
            self.providers.timeout_secs = parse_u64("RENEWDESK_PROVIDERS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RENEWDESK_PROVIDERS_DEFAULT_STORE_ID") {
            self.providers.default_store_id = value;
        }

        if let Some(value) = read_env("RENEWDESK_AUTH_STAFF_TOKENS") {
            self.auth.staff_tokens = parse_staff_tokens("RENEWDESK_AUTH_STAFF_TOKENS", &value)?;
        }

        let log_level =
            read_env("RENEWDESK_LOGGING_LEVEL").or_else(|| read_env("RENEWDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("RENEWDESK_LOGGING_FORMAT").or_else(|| read_env("RENEWDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(store_backend) = overrides.store_backend {
            self.store.backend = store_backend;
        }
        if let Some(session_ttl_secs) = overrides.session_ttl_secs {
            self.store.session_ttl_secs = session_ttl_secs;
        }
        if let Some(provider_mode) = overrides.provider_mode {
            self.providers.mode = provider_mode;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_store(&self.store)?;
        validate_server(&self.server)?;
        validate_providers(&self.providers)?;
        validate_auth(&self.auth)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("renewdesk.toml"), PathBuf::from("config/renewdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    if store.session_ttl_secs == 0 || store.session_ttl_secs > 86_400 {
        return Err(ConfigError::Validation(
            "store.session_ttl_secs must be in range 1..=86400".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.port == server.health_check_port {
        return Err(ConfigError::Validation(
            "server.port and server.health_check_port must differ".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_providers(providers: &ProvidersConfig) -> Result<(), ConfigError> {
    if providers.timeout_secs == 0 || providers.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "providers.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if providers.default_store_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "providers.default_store_id must not be empty".to_string(),
        ));
    }

    if providers.mode == ProviderMode::Http {
        let urls = [
            ("providers.crm_base_url", &providers.crm_base_url),
            ("providers.pos_base_url", &providers.pos_base_url),
            ("providers.promotion_base_url", &providers.promotion_base_url),
        ];
        for (key, url) in urls {
            match url.as_deref().map(str::trim) {
                None | Some("") => {
                    return Err(ConfigError::Validation(format!(
                        "{key} is required when providers.mode is http"
                    )));
                }
                Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                    return Err(ConfigError::Validation(format!(
                        "{key} must start with http:// or https://"
                    )));
                }
                Some(_) => {}
            }
        }
    }

    Ok(())
}

fn validate_auth(auth: &AuthConfig) -> Result<(), ConfigError> {
    for (index, entry) in auth.staff_tokens.iter().enumerate() {
        if entry.staff_id.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "auth.staff[{index}].staff_id must not be empty"
            )));
        }
        if entry.token.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "auth.staff[{index}].token must not be empty"
            )));
        }
        let duplicate = auth.staff_tokens[..index]
            .iter()
            .any(|other| other.token.expose_secret() == entry.token.expose_secret());
        if duplicate {
            return Err(ConfigError::Validation(format!(
                "auth.staff[{index}].token is assigned to more than one employee"
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parses `token:staff_id` pairs separated by commas.
fn parse_staff_tokens(key: &str, value: &str) -> Result<Vec<StaffToken>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((token, staff_id)) if !token.is_empty() && !staff_id.is_empty() => {
                Ok(StaffToken {
                    token: secret_value(token.to_string()),
                    staff_id: staff_id.to_string(),
                })
            }
            _ => Err(ConfigError::InvalidEnvOverride {
                key: key.to_string(),
                value: "<redacted>".to_string(),
            }),
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    store: Option<StorePatch>,
    server: Option<ServerPatch>,
    providers: Option<ProvidersPatch>,
    auth: Option<AuthPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    backend: Option<StoreBackend>,
    session_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersPatch {
    mode: Option<ProviderMode>,
    crm_base_url: Option<String>,
    pos_base_url: Option<String>,
    promotion_base_url: Option<String>,
    timeout_secs: Option<u64>,
    default_store_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthPatch {
    staff: Option<Vec<StaffTokenPatch>>,
}

#[derive(Debug, Deserialize)]
struct StaffTokenPatch {
    token: String,
    staff_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
