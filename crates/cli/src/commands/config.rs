use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use deckhand_core::config::AppConfig;
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

use crate::commands::{load_options, CommandResult};

/// One reported key. `env_keys` is ordered by precedence, highest first.
struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

impl Field {
    fn new(key: &'static str, value: impl Into<String>, env_keys: &'static [&'static str]) -> Self {
        Self { key, value: value.into(), env_keys }
    }
}

pub fn run(config_path: Option<&Path>) -> CommandResult {
    let config = match AppConfig::load(load_options(config_path)) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_path = detect_config_path(config_path);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    CommandResult { exit_code: 0, output: lines.join("\n") }
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let llm = &config.llm;
    vec![
        Field::new("database.url", &config.database.url, &["DECKHAND_DATABASE_URL"]),
        Field::new(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["DECKHAND_DATABASE_MAX_CONNECTIONS"],
        ),
        Field::new(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["DECKHAND_DATABASE_TIMEOUT_SECS"],
        ),
        Field::new(
            "llm.anthropic.api_key",
            redact_secret(llm.anthropic.api_key.as_ref()),
            &["DECKHAND_ANTHROPIC_API_KEY", "ANTHROPIC_API_KEY"],
        ),
        Field::new(
            "llm.anthropic.base_url",
            &llm.anthropic.base_url,
            &["DECKHAND_ANTHROPIC_BASE_URL"],
        ),
        Field::new("llm.anthropic.model", &llm.anthropic.model, &["DECKHAND_ANTHROPIC_MODEL"]),
        Field::new(
            "llm.bedrock.region",
            llm.bedrock.region.as_deref().unwrap_or("<unset>"),
            &["DECKHAND_BEDROCK_REGION", "AWS_REGION"],
        ),
        Field::new(
            "llm.bedrock.access_key_id",
            redact_secret(llm.bedrock.access_key_id.as_ref()),
            &["DECKHAND_BEDROCK_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID"],
        ),
        Field::new(
            "llm.bedrock.secret_access_key",
            redact_secret(llm.bedrock.secret_access_key.as_ref()),
            &["DECKHAND_BEDROCK_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY"],
        ),
        Field::new(
            "llm.bedrock.session_token",
            redact_secret(llm.bedrock.session_token.as_ref()),
            &["AWS_SESSION_TOKEN"],
        ),
        Field::new("llm.bedrock.model_id", &llm.bedrock.model_id, &["DECKHAND_BEDROCK_MODEL_ID"]),
        Field::new(
            "llm.bedrock.endpoint_url",
            llm.bedrock.endpoint_url.as_deref().unwrap_or("<unset>"),
            &["DECKHAND_BEDROCK_ENDPOINT_URL"],
        ),
        Field::new("llm.timeout_secs", llm.timeout_secs.to_string(), &["DECKHAND_LLM_TIMEOUT_SECS"]),
        Field::new(
            "llm.premium_min_tier",
            llm.premium_min_tier.as_str(),
            &["DECKHAND_LLM_PREMIUM_MIN_TIER"],
        ),
        Field::new(
            "llm.fail_open_on_lookup_error",
            llm.fail_open_on_lookup_error.to_string(),
            &["DECKHAND_LLM_FAIL_OPEN_ON_LOOKUP_ERROR"],
        ),
        Field::new(
            "generation.max_attempts",
            config.generation.max_attempts.to_string(),
            &["DECKHAND_GENERATION_MAX_ATTEMPTS"],
        ),
        Field::new(
            "generation.max_slides",
            config.generation.max_slides.to_string(),
            &["DECKHAND_GENERATION_MAX_SLIDES"],
        ),
        Field::new(
            "worker.enabled",
            config.worker.enabled.to_string(),
            &["DECKHAND_WORKER_ENABLED"],
        ),
        Field::new(
            "worker.concurrency",
            config.worker.concurrency.to_string(),
            &["DECKHAND_WORKER_CONCURRENCY"],
        ),
        Field::new("worker.claim_timeout_secs", config.worker.claim_timeout_secs.to_string(), &[]),
        Field::new(
            "progress.max_wait_secs",
            config.progress.max_wait_secs.to_string(),
            &["DECKHAND_PROGRESS_MAX_WAIT_SECS"],
        ),
        Field::new(
            "server.bind_address",
            &config.server.bind_address,
            &["DECKHAND_SERVER_BIND_ADDRESS"],
        ),
        Field::new("server.port", config.server.port.to_string(), &["DECKHAND_SERVER_PORT"]),
        Field::new(
            "logging.level",
            &config.logging.level,
            &["DECKHAND_LOGGING_LEVEL", "DECKHAND_LOG_LEVEL"],
        ),
        Field::new(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["DECKHAND_LOGGING_FORMAT", "DECKHAND_LOG_FORMAT"],
        ),
    ]
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    [PathBuf::from("deckhand.toml"), PathBuf::from("config/deckhand.toml")]
        .into_iter()
        .find(|path| path.exists())
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
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
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

fn redact_secret(secret: Option<&SecretString>) -> String {
    match secret {
        Some(secret) => redact_token(secret.expose_secret()),
        None => "<unset>".to_string(),
    }
}

/// Keeps a recognizable vendor prefix such as `sk-`. Everything else is hidden.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        if prefix.len() <= 4 {
            return format!("{prefix}-***");
        }
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_token};

    #[test]
    fn redaction_keeps_only_short_vendor_prefixes() {
        assert_eq!(redact_token("sk-ant-api03-secret"), "sk-***");
        assert_eq!(redact_token("AKIAEXAMPLE"), "<redacted>");
        assert_eq!(redact_token("verylongprefix-secret"), "<redacted>");
        assert_eq!(redact_token("  "), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_toml_documents() {
        let doc: toml::Value =
            "[llm.bedrock]\nregion = \"us-east-1\"\n".parse().expect("toml should parse");

        assert!(contains_path(&doc, "llm.bedrock.region"));
        assert!(!contains_path(&doc, "llm.anthropic.model"));
    }
}
