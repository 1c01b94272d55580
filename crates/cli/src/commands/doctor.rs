use std::sync::Arc;

use embudo_core::config::{AppConfig, LoadOptions};
use embudo_core::funnel::catalog::order_collisions;
use embudo_core::CatalogSnapshot;
use embudo_db::{connect_with_settings, SqlFunnelStore};
use embudo_engine::FunnelService;
use serde::Serialize;

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

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["database_connectivity", "funnel_catalog"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "funnel_catalog",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let connectivity = DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        };
        let service = FunnelService::new(Arc::new(SqlFunnelStore::new(pool.clone())));
        let catalog = match service.catalog_snapshot().await {
            Ok(snapshot) => catalog_check(&snapshot),
            Err(error) => DoctorCheck {
                name: "funnel_catalog",
                status: CheckStatus::Fail,
                details: format!("catalog could not be read (run `embudo migrate`?): {error}"),
            },
        };
        pool.close().await;
        vec![connectivity, catalog]
    })
}

fn catalog_check(snapshot: &CatalogSnapshot) -> DoctorCheck {
    let findings = catalog_findings(snapshot);
    if findings.is_empty() {
        let stages = snapshot.active_stages().count();
        return DoctorCheck {
            name: "funnel_catalog",
            status: CheckStatus::Pass,
            details: format!("{stages} active stages, every timed stage has a default"),
        };
    }
    DoctorCheck { name: "funnel_catalog", status: CheckStatus::Fail, details: findings.join("; ") }
}

/// Problems that would make escalation skip items or intake fail.
fn catalog_findings(snapshot: &CatalogSnapshot) -> Vec<String> {
    let mut findings = Vec::new();
    if snapshot.first_active_stage().is_none() {
        findings.push("no active stages; run `embudo seed`".to_string());
    }
    for (left, right) in order_collisions(&snapshot.stages) {
        findings.push(format!("stages {left} and {right} share an order"));
    }
    for stage in snapshot.active_stages().filter(|stage| stage.idle_timeout().is_some()) {
        let has_default = snapshot
            .default_transition(stage.id)
            .is_some_and(|transition| transition.active);
        if !has_default {
            findings.push(format!("timed stage `{}` has no active default transition", stage.name));
        }
    }
    findings
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
