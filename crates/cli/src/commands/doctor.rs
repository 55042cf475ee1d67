use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use deckhand_agent::llm::factory::{ConfiguredProviderFactory, ProviderFactory};
use deckhand_agent::llm::LlmProvider;
use deckhand_core::config::AppConfig;
use deckhand_core::domain::organization::ProviderId;
use deckhand_db::connect_with_settings;
use serde::Serialize;

use crate::commands::{load_options, migrate, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skipped, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 4] =
    ["database_connectivity", "schema_migrations", "provider_anthropic", "provider_bedrock"];

/// Exit code 0 when nothing failed. A skipped premium backend is not a failure.
pub fn run(config_path: Option<&Path>, json_output: bool) -> CommandResult {
    let report = build_report(config_path);
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report(config_path: Option<&Path>) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(load_options(config_path)) {
        Ok(config) => {
            checks.push(DoctorCheck::pass(
                "config_validation",
                "configuration loaded and validated",
            ));
            checks.extend(check_database(&config));
            checks.extend(check_providers(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            checks.extend(DEPENDENT_CHECKS.iter().map(|&name| {
                DoctorCheck::skipped(name, "skipped because configuration did not load")
            }));
        }
    }

    let failed = checks.iter().filter(|check| check.status == CheckStatus::Fail).count();
    let overall_status = if failed == 0 { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if failed == 0 {
        "doctor: all readiness checks passed".to_string()
    } else {
        format!("doctor: {failed} readiness check(s) failed")
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck::fail(
                    "database_connectivity",
                    format!("failed to initialize async runtime: {error}"),
                ),
                DoctorCheck::skipped("schema_migrations", "skipped because runtime did not start"),
            ];
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .context("failed to connect to database")?;

        let pending = migrate::pending_versions(&pool)
            .await
            .context("failed to read migration state");
        pool.close().await;
        anyhow::Ok(pending)
    });

    match result {
        Ok(pending) => {
            let connectivity = DoctorCheck::pass(
                "database_connectivity",
                format!("connected using `{}`", config.database.url),
            );
            let schema = match pending {
                Ok(pending) if pending.is_empty() => {
                    DoctorCheck::pass("schema_migrations", "all migrations applied")
                }
                Ok(pending) => DoctorCheck::fail(
                    "schema_migrations",
                    format!("{} pending migration(s); run `deckhand migrate`", pending.len()),
                ),
                Err(error) => DoctorCheck::fail("schema_migrations", format!("{error:#}")),
            };
            vec![connectivity, schema]
        }
        Err(error) => vec![
            DoctorCheck::fail("database_connectivity", format!("{error:#}")),
            DoctorCheck::skipped("schema_migrations", "skipped because the database is unreachable"),
        ],
    }
}

fn check_providers(config: &AppConfig) -> Vec<DoctorCheck> {
    let factory = match ConfiguredProviderFactory::new(config.llm.clone()) {
        Ok(factory) => factory,
        Err(error) => {
            let details = format!("provider HTTP client could not be built: {error}");
            return vec![
                DoctorCheck::fail("provider_anthropic", details.clone()),
                DoctorCheck::fail("provider_bedrock", details),
            ];
        }
    };

    let anthropic = factory.create(ProviderId::Anthropic);
    let anthropic_check = if anthropic.is_available() {
        DoctorCheck::pass("provider_anthropic", describe(anthropic.as_ref()))
    } else {
        DoctorCheck::fail(
            "provider_anthropic",
            "default provider has no API key (set DECKHAND_ANTHROPIC_API_KEY or ANTHROPIC_API_KEY)",
        )
    };

    let bedrock: Arc<dyn LlmProvider> = factory.create(ProviderId::Bedrock);
    let bedrock_check = if bedrock.is_available() {
        DoctorCheck::pass("provider_bedrock", describe(bedrock.as_ref()))
    } else {
        DoctorCheck::skipped(
            "provider_bedrock",
            format!(
                "premium runtime not configured; {} tier organizations use anthropic",
                config.llm.premium_min_tier.as_str()
            ),
        )
    };

    vec![anthropic_check, bedrock_check]
}

fn describe(provider: &dyn LlmProvider) -> String {
    let metadata = provider.metadata();
    match metadata.region {
        Some(region) => format!("credentials present for `{}` in {region}", metadata.model),
        None => format!("credentials present for `{}`", metadata.model),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
