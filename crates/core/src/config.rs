use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::organization::PlanTier;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub generation: GenerationConfig,
    pub worker: WorkerConfig,
    pub progress: ProgressConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub anthropic: AnthropicConfig,
    pub bedrock: BedrockConfig,
    pub timeout_secs: u64,
    /// Lowest plan tier allowed to run on the cloud-hosted runtime.
    pub premium_min_tier: PlanTier,
    /// When an organization lookup fails, fall back to the default provider
    /// instead of failing the generation.
    pub fail_open_on_lookup_error: bool,
}

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub max_context_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct BedrockConfig {
    pub region: Option<String>,
    pub access_key_id: Option<SecretString>,
    pub secret_access_key: Option<SecretString>,
    pub session_token: Option<SecretString>,
    pub model_id: String,
    pub endpoint_url: Option<String>,
    pub max_context_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_slides: u32,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub concurrency: u32,
    pub poll_interval_ms: u64,
    pub claim_timeout_secs: u64,
    pub progress_retention_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ProgressConfig {
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
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
    pub anthropic_api_key: Option<String>,
    pub bedrock_region: Option<String>,
    pub premium_min_tier: Option<PlanTier>,
    pub worker_enabled: Option<bool>,
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
                url: "sqlite://deckhand.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                anthropic: AnthropicConfig {
                    api_key: None,
                    base_url: "https://api.anthropic.com".to_string(),
                    model: "claude-sonnet-4-20250514".to_string(),
                    max_context_tokens: 200_000,
                },
                bedrock: BedrockConfig {
                    region: None,
                    access_key_id: None,
                    secret_access_key: None,
                    session_token: None,
                    model_id: "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string(),
                    endpoint_url: None,
                    max_context_tokens: 200_000,
                },
                timeout_secs: 120,
                premium_min_tier: PlanTier::Enterprise,
                fail_open_on_lookup_error: true,
            },
            generation: GenerationConfig {
                max_attempts: 3,
                retry_base_delay_ms: 1_000,
                retry_max_delay_ms: 30_000,
                max_slides: 12,
                max_tokens: 4_096,
                temperature: 0.7,
            },
            worker: WorkerConfig {
                enabled: true,
                concurrency: 2,
                poll_interval_ms: 500,
                claim_timeout_secs: 900,
                progress_retention_secs: 300,
            },
            progress: ProgressConfig { poll_interval_ms: 1_000, max_wait_secs: 120 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
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
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("deckhand.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
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

        if let Some(llm) = patch.llm {
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(tier) = llm.premium_min_tier {
                self.llm.premium_min_tier = parse_tier("llm.premium_min_tier", &tier)?;
            }
            if let Some(fail_open) = llm.fail_open_on_lookup_error {
                self.llm.fail_open_on_lookup_error = fail_open;
            }

            if let Some(anthropic) = llm.anthropic {
                if let Some(api_key_value) = anthropic.api_key {
                    self.llm.anthropic.api_key = Some(secret_value(api_key_value));
                }
                if let Some(base_url) = anthropic.base_url {
                    self.llm.anthropic.base_url = base_url;
                }
                if let Some(model) = anthropic.model {
                    self.llm.anthropic.model = model;
                }
                if let Some(max_context_tokens) = anthropic.max_context_tokens {
                    self.llm.anthropic.max_context_tokens = max_context_tokens;
                }
            }

            if let Some(bedrock) = llm.bedrock {
                if let Some(region) = bedrock.region {
                    self.llm.bedrock.region = Some(region);
                }
                if let Some(access_key_id) = bedrock.access_key_id {
                    self.llm.bedrock.access_key_id = Some(secret_value(access_key_id));
                }
                if let Some(secret_access_key) = bedrock.secret_access_key {
                    self.llm.bedrock.secret_access_key = Some(secret_value(secret_access_key));
                }
                if let Some(session_token) = bedrock.session_token {
                    self.llm.bedrock.session_token = Some(secret_value(session_token));
                }
                if let Some(model_id) = bedrock.model_id {
                    self.llm.bedrock.model_id = model_id;
                }
                if let Some(endpoint_url) = bedrock.endpoint_url {
                    self.llm.bedrock.endpoint_url = Some(endpoint_url);
                }
                if let Some(max_context_tokens) = bedrock.max_context_tokens {
                    self.llm.bedrock.max_context_tokens = max_context_tokens;
                }
            }
        }

        if let Some(generation) = patch.generation {
            if let Some(max_attempts) = generation.max_attempts {
                self.generation.max_attempts = max_attempts;
            }
            if let Some(retry_base_delay_ms) = generation.retry_base_delay_ms {
                self.generation.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_max_delay_ms) = generation.retry_max_delay_ms {
                self.generation.retry_max_delay_ms = retry_max_delay_ms;
            }
            if let Some(max_slides) = generation.max_slides {
                self.generation.max_slides = max_slides;
            }
            if let Some(max_tokens) = generation.max_tokens {
                self.generation.max_tokens = max_tokens;
            }
            if let Some(temperature) = generation.temperature {
                self.generation.temperature = temperature;
            }
        }

        if let Some(worker) = patch.worker {
            if let Some(enabled) = worker.enabled {
                self.worker.enabled = enabled;
            }
            if let Some(concurrency) = worker.concurrency {
                self.worker.concurrency = concurrency;
            }
            if let Some(poll_interval_ms) = worker.poll_interval_ms {
                self.worker.poll_interval_ms = poll_interval_ms;
            }
            if let Some(claim_timeout_secs) = worker.claim_timeout_secs {
                self.worker.claim_timeout_secs = claim_timeout_secs;
            }
            if let Some(progress_retention_secs) = worker.progress_retention_secs {
                self.worker.progress_retention_secs = progress_retention_secs;
            }
        }

        if let Some(progress) = patch.progress {
            if let Some(poll_interval_ms) = progress.poll_interval_ms {
                self.progress.poll_interval_ms = poll_interval_ms;
            }
            if let Some(max_wait_secs) = progress.max_wait_secs {
                self.progress.max_wait_secs = max_wait_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
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

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("DECKHAND_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("DECKHAND_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("DECKHAND_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("DECKHAND_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("DECKHAND_DATABASE_TIMEOUT_SECS", &value)?;
        }

        // Vendor-standard variables first so the prefixed ones win.
        if let Some(value) = read_env("ANTHROPIC_API_KEY") {
            self.llm.anthropic.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("DECKHAND_ANTHROPIC_API_KEY") {
            self.llm.anthropic.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("DECKHAND_ANTHROPIC_BASE_URL") {
            self.llm.anthropic.base_url = value;
        }
        if let Some(value) = read_env("DECKHAND_ANTHROPIC_MODEL") {
            self.llm.anthropic.model = value;
        }

        if let Some(value) = read_env("AWS_REGION") {
            self.llm.bedrock.region = Some(value);
        }
        if let Some(value) = read_env("AWS_ACCESS_KEY_ID") {
            self.llm.bedrock.access_key_id = Some(secret_value(value));
        }
        if let Some(value) = read_env("AWS_SECRET_ACCESS_KEY") {
            self.llm.bedrock.secret_access_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("AWS_SESSION_TOKEN") {
            self.llm.bedrock.session_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("DECKHAND_BEDROCK_REGION") {
            self.llm.bedrock.region = Some(value);
        }
        if let Some(value) = read_env("DECKHAND_BEDROCK_ACCESS_KEY_ID") {
            self.llm.bedrock.access_key_id = Some(secret_value(value));
        }
        if let Some(value) = read_env("DECKHAND_BEDROCK_SECRET_ACCESS_KEY") {
            self.llm.bedrock.secret_access_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("DECKHAND_BEDROCK_MODEL_ID") {
            self.llm.bedrock.model_id = value;
        }
        if let Some(value) = read_env("DECKHAND_BEDROCK_ENDPOINT_URL") {
            self.llm.bedrock.endpoint_url = Some(value);
        }

        if let Some(value) = read_env("DECKHAND_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("DECKHAND_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("DECKHAND_LLM_PREMIUM_MIN_TIER") {
            self.llm.premium_min_tier = parse_tier("DECKHAND_LLM_PREMIUM_MIN_TIER", &value)?;
        }
        if let Some(value) = read_env("DECKHAND_LLM_FAIL_OPEN_ON_LOOKUP_ERROR") {
            self.llm.fail_open_on_lookup_error =
                parse_bool("DECKHAND_LLM_FAIL_OPEN_ON_LOOKUP_ERROR", &value)?;
        }

        if let Some(value) = read_env("DECKHAND_GENERATION_MAX_ATTEMPTS") {
            self.generation.max_attempts = parse_u32("DECKHAND_GENERATION_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("DECKHAND_GENERATION_MAX_SLIDES") {
            self.generation.max_slides = parse_u32("DECKHAND_GENERATION_MAX_SLIDES", &value)?;
        }

        if let Some(value) = read_env("DECKHAND_WORKER_ENABLED") {
            self.worker.enabled = parse_bool("DECKHAND_WORKER_ENABLED", &value)?;
        }
        if let Some(value) = read_env("DECKHAND_WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_u32("DECKHAND_WORKER_CONCURRENCY", &value)?;
        }

        if let Some(value) = read_env("DECKHAND_PROGRESS_MAX_WAIT_SECS") {
            self.progress.max_wait_secs = parse_u64("DECKHAND_PROGRESS_MAX_WAIT_SECS", &value)?;
        }

        if let Some(value) = read_env("DECKHAND_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("DECKHAND_SERVER_PORT") {
            self.server.port = parse_u16("DECKHAND_SERVER_PORT", &value)?;
        }

        let log_level =
            read_env("DECKHAND_LOGGING_LEVEL").or_else(|| read_env("DECKHAND_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("DECKHAND_LOGGING_FORMAT").or_else(|| read_env("DECKHAND_LOG_FORMAT"));
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
        if let Some(api_key) = overrides.anthropic_api_key {
            self.llm.anthropic.api_key = Some(secret_value(api_key));
        }
        if let Some(region) = overrides.bedrock_region {
            self.llm.bedrock.region = Some(region);
        }
        if let Some(tier) = overrides.premium_min_tier {
            self.llm.premium_min_tier = tier;
        }
        if let Some(enabled) = overrides.worker_enabled {
            self.worker.enabled = enabled;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_generation(&self.generation)?;
        validate_worker(&self.worker)?;
        validate_progress(&self.progress)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

impl AnthropicConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_ref().is_some_and(|key| !key.expose_secret().trim().is_empty())
    }
}

impl BedrockConfig {
    pub fn has_credentials(&self) -> bool {
        let present = |value: &Option<SecretString>| {
            value.as_ref().is_some_and(|secret| !secret.expose_secret().trim().is_empty())
        };
        self.region.as_ref().is_some_and(|region| !region.trim().is_empty())
            && present(&self.access_key_id)
            && present(&self.secret_access_key)
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("deckhand.toml"), PathBuf::from("config/deckhand.toml")]
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

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 900 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=900".to_string(),
        ));
    }

    let base_url = llm.anthropic.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.anthropic.base_url must start with http:// or https://".to_string(),
        ));
    }
    if llm.anthropic.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.anthropic.model must not be empty".to_string()));
    }
    if llm.bedrock.model_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "llm.bedrock.model_id must not be empty".to_string(),
        ));
    }
    if let Some(endpoint_url) = &llm.bedrock.endpoint_url {
        if !endpoint_url.starts_with("http://") && !endpoint_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.bedrock.endpoint_url must start with http:// or https://".to_string(),
            ));
        }
    }

    for (key, tokens) in [
        ("llm.anthropic.max_context_tokens", llm.anthropic.max_context_tokens),
        ("llm.bedrock.max_context_tokens", llm.bedrock.max_context_tokens),
    ] {
        if tokens < 8_192 {
            return Err(ConfigError::Validation(format!("{key} must be at least 8192")));
        }
    }

    Ok(())
}

fn validate_generation(generation: &GenerationConfig) -> Result<(), ConfigError> {
    if generation.max_attempts == 0 || generation.max_attempts > 10 {
        return Err(ConfigError::Validation(
            "generation.max_attempts must be in range 1..=10".to_string(),
        ));
    }
    if generation.retry_base_delay_ms > generation.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "generation.retry_base_delay_ms must not exceed generation.retry_max_delay_ms"
                .to_string(),
        ));
    }
    if generation.max_slides == 0 || generation.max_slides > 40 {
        return Err(ConfigError::Validation(
            "generation.max_slides must be in range 1..=40".to_string(),
        ));
    }
    if generation.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "generation.max_tokens must be greater than zero".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&generation.temperature) {
        return Err(ConfigError::Validation(
            "generation.temperature must be in range 0.0..=1.0".to_string(),
        ));
    }
    Ok(())
}

fn validate_worker(worker: &WorkerConfig) -> Result<(), ConfigError> {
    if worker.concurrency == 0 || worker.concurrency > 32 {
        return Err(ConfigError::Validation(
            "worker.concurrency must be in range 1..=32".to_string(),
        ));
    }
    if worker.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "worker.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if worker.claim_timeout_secs < 60 {
        return Err(ConfigError::Validation(
            "worker.claim_timeout_secs must be at least 60".to_string(),
        ));
    }
    Ok(())
}

fn validate_progress(progress: &ProgressConfig) -> Result<(), ConfigError> {
    if progress.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "progress.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if progress.max_wait_secs == 0 || progress.max_wait_secs > 3_600 {
        return Err(ConfigError::Validation(
            "progress.max_wait_secs must be in range 1..=3600".to_string(),
        ));
    }
    if progress.poll_interval_ms > progress.max_wait_secs * 1_000 {
        return Err(ConfigError::Validation(
            "progress.poll_interval_ms must not exceed progress.max_wait_secs".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
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

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_tier(key: &str, value: &str) -> Result<PlanTier, ConfigError> {
    PlanTier::parse(value).ok_or_else(|| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    generation: Option<GenerationPatch>,
    worker: Option<WorkerPatch>,
    progress: Option<ProgressPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    timeout_secs: Option<u64>,
    premium_min_tier: Option<String>,
    fail_open_on_lookup_error: Option<bool>,
    anthropic: Option<AnthropicPatch>,
    bedrock: Option<BedrockPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_context_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct BedrockPatch {
    region: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
    model_id: Option<String>,
    endpoint_url: Option<String>,
    max_context_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerationPatch {
    max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    max_slides: Option<u32>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    enabled: Option<bool>,
    concurrency: Option<u32>,
    poll_interval_ms: Option<u64>,
    claim_timeout_secs: Option<u64>,
    progress_retention_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProgressPatch {
    poll_interval_ms: Option<u64>,
    max_wait_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
