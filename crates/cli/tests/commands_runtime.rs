use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use deckhand_cli::commands::{config, doctor, migrate};
use serde_json::Value;

#[test]
fn migrate_applies_schema_then_reports_up_to_date() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(dir.path());

    with_env(&[("DECKHAND_DATABASE_URL", url.as_str())], || {
        let first = migrate::run(None);
        assert_eq!(first.exit_code, 0, "expected successful migrate run: {}", first.output);
        let payload = parse_payload(&first.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
        assert!(payload["message"].as_str().unwrap_or("").starts_with("applied 1 pending"));

        let second = migrate::run(None);
        assert_eq!(second.exit_code, 0);
        let payload = parse_payload(&second.output);
        assert_eq!(payload["message"], "schema already up to date");
    });
}

#[test]
fn migrate_returns_config_failure_for_non_sqlite_url() {
    with_env(&[("DECKHAND_DATABASE_URL", "postgres://localhost/deckhand")], || {
        let result = migrate::run(None);
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
        assert!(payload["message"].as_str().unwrap_or("").contains("database.url"));
    });
}

#[test]
fn doctor_flags_pending_migrations_and_missing_default_credentials() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(dir.path());

    with_env(&[("DECKHAND_DATABASE_URL", url.as_str())], || {
        let result = doctor::run(None, true);
        assert_eq!(result.exit_code, 1);

        let report = parse_payload(&result.output);
        assert_eq!(report["overall_status"], "fail");
        assert_eq!(check_status(&report, "config_validation"), "pass");
        assert_eq!(check_status(&report, "database_connectivity"), "pass");
        assert_eq!(check_status(&report, "schema_migrations"), "fail");
        assert_eq!(check_status(&report, "provider_anthropic"), "fail");
        assert_eq!(check_status(&report, "provider_bedrock"), "skipped");
    });
}

#[test]
fn doctor_passes_once_migrated_with_default_provider_configured() {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = database_url(dir.path());

    with_env(
        &[
            ("DECKHAND_DATABASE_URL", url.as_str()),
            ("DECKHAND_ANTHROPIC_API_KEY", "sk-ant-doctor-test"),
        ],
        || {
            assert_eq!(migrate::run(None).exit_code, 0);

            let result = doctor::run(None, true);
            assert_eq!(result.exit_code, 0, "{}", result.output);
            let report = parse_payload(&result.output);
            assert_eq!(report["overall_status"], "pass");
            assert_eq!(check_status(&report, "schema_migrations"), "pass");
            assert_eq!(check_status(&report, "provider_anthropic"), "pass");
            assert_eq!(check_status(&report, "provider_bedrock"), "skipped");
            assert!(!result.output.contains("sk-ant-doctor-test"));

            let human = doctor::run(None, false);
            assert!(human.output.starts_with("doctor: all readiness checks passed"));
            assert!(human.output.contains("- [skip] provider_bedrock:"));
        },
    );
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_env(&[("DECKHAND_WORKER_CONCURRENCY", "zero")], || {
        let result = doctor::run(None, true);
        assert_eq!(result.exit_code, 1);

        let report = parse_payload(&result.output);
        assert_eq!(check_status(&report, "config_validation"), "fail");
        assert_eq!(check_status(&report, "database_connectivity"), "skipped");
        assert_eq!(check_status(&report, "provider_anthropic"), "skipped");
    });
}

#[test]
fn config_attributes_sources_and_redacts_secrets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("deckhand.toml");
    fs::write(
        &path,
        "[server]\nport = 9090\n\n[llm.bedrock]\nregion = \"eu-west-1\"\nsecret_access_key = \"wJalrXUtnFEMI\"\n",
    )
    .expect("write config file");

    with_env(&[("ANTHROPIC_API_KEY", "sk-ant-super-secret")], || {
        let result = config::run(Some(path.as_path()));
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let output = result.output;
        let file_source = format!("(source: file ({}))", path.display());
        assert!(output.contains("- llm.anthropic.api_key = sk-*** (source: env (ANTHROPIC_API_KEY))"));
        assert!(output.contains(&format!("- server.port = 9090 {file_source}")));
        assert!(output.contains(&format!("- llm.bedrock.region = eu-west-1 {file_source}")));
        assert!(output
            .contains(&format!("- llm.bedrock.secret_access_key = <redacted> {file_source}")));
        assert!(output.contains("- llm.premium_min_tier = enterprise (source: default)"));
        assert!(!output.contains("super-secret"));
        assert!(!output.contains("wJalrXUtnFEMI"));
    });
}

#[test]
fn config_reports_missing_explicit_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("absent.toml");

    with_env(&[], || {
        let result = config::run(Some(missing.as_path()));
        assert_eq!(result.exit_code, 2);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "config");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

fn database_url(dir: &Path) -> String {
    format!("sqlite://{}", dir.join("deckhand.db").display())
}

fn check_status(report: &Value, name: &str) -> String {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .and_then(|check| check["status"].as_str())
        .unwrap_or("missing")
        .to_string()
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "DECKHAND_DATABASE_URL",
        "DECKHAND_DATABASE_MAX_CONNECTIONS",
        "DECKHAND_DATABASE_TIMEOUT_SECS",
        "DECKHAND_ANTHROPIC_API_KEY",
        "DECKHAND_ANTHROPIC_BASE_URL",
        "DECKHAND_ANTHROPIC_MODEL",
        "ANTHROPIC_API_KEY",
        "DECKHAND_BEDROCK_REGION",
        "DECKHAND_BEDROCK_ACCESS_KEY_ID",
        "DECKHAND_BEDROCK_SECRET_ACCESS_KEY",
        "DECKHAND_BEDROCK_MODEL_ID",
        "DECKHAND_BEDROCK_ENDPOINT_URL",
        "AWS_REGION",
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_SESSION_TOKEN",
        "DECKHAND_LLM_TIMEOUT_SECS",
        "DECKHAND_LLM_PREMIUM_MIN_TIER",
        "DECKHAND_LLM_FAIL_OPEN_ON_LOOKUP_ERROR",
        "DECKHAND_GENERATION_MAX_ATTEMPTS",
        "DECKHAND_GENERATION_MAX_SLIDES",
        "DECKHAND_WORKER_ENABLED",
        "DECKHAND_WORKER_CONCURRENCY",
        "DECKHAND_PROGRESS_MAX_WAIT_SECS",
        "DECKHAND_SERVER_BIND_ADDRESS",
        "DECKHAND_SERVER_PORT",
        "DECKHAND_LOGGING_LEVEL",
        "DECKHAND_LOGGING_FORMAT",
        "DECKHAND_LOG_LEVEL",
        "DECKHAND_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
