use std::env;
use std::sync::{Mutex, OnceLock};

use embudo_cli::commands::{config, doctor, migrate, seed, sweep};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("EMBUDO_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_invalid_override() {
    with_env(
        &[("EMBUDO_DATABASE_URL", "sqlite::memory:"), ("EMBUDO_SCHEDULER_BATCH_LIMIT", "lots")],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "migrate");
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
        },
    );
}

#[test]
fn seed_loads_the_default_funnel() {
    with_env(&[("EMBUDO_DATABASE_URL", "sqlite::memory:")], || {
        let result = seed::run();
        assert_eq!(result.exit_code, 0, "expected seed success");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "seed");
        assert_eq!(payload["status"], "ok");
        assert_eq!(
            payload["message"],
            "default funnel loaded: 9 stages, 18 transitions, 4 field rules"
        );
    });
}

#[test]
fn sweep_on_an_empty_funnel_is_quiet() {
    with_env(&[("EMBUDO_DATABASE_URL", "sqlite::memory:")], || {
        let result = sweep::run();
        assert_eq!(result.exit_code, 0, "expected sweep success");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "sweep");
        assert_eq!(payload["status"], "ok");
        assert_eq!(
            payload["message"],
            "sweep complete: scanned=0 escalated=0 skipped=0 conflicts=0"
        );
    });
}

#[test]
fn sweep_refuses_messaging_without_endpoint() {
    with_env(
        &[("EMBUDO_DATABASE_URL", "sqlite::memory:"), ("EMBUDO_MESSAGING_ENABLED", "true")],
        || {
            let result = sweep::run();
            assert_eq!(result.exit_code, 2);

            let payload = parse_payload(&result.output);
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
        },
    );
}

#[test]
fn config_redacts_the_messaging_secret() {
    with_env(
        &[
            ("EMBUDO_DATABASE_URL", "sqlite::memory:"),
            ("EMBUDO_MESSAGING_SERVICE_SECRET", "wa-secret-value"),
        ],
        || {
            let output = config::run();
            assert!(output.contains(
                "- messaging.service_secret = wa*** (source: env (EMBUDO_MESSAGING_SERVICE_SECRET))"
            ));
            assert!(!output.contains("wa-secret-value"));
            assert!(output.contains("- database.url = sqlite::memory: (source: env"));
        },
    );
}

#[test]
fn doctor_flags_an_unseeded_catalog() {
    with_env(&[("EMBUDO_DATABASE_URL", "sqlite::memory:")], || {
        let report: Value =
            serde_json::from_str(&doctor::run(true)).expect("doctor output should be JSON");
        assert_eq!(report["overall_status"], "fail");

        let checks = report["checks"].as_array().expect("checks");
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("funnel_catalog"), "fail");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "EMBUDO_DATABASE_URL",
        "EMBUDO_DATABASE_MAX_CONNECTIONS",
        "EMBUDO_DATABASE_TIMEOUT_SECS",
        "EMBUDO_SERVER_BIND_ADDRESS",
        "EMBUDO_SERVER_PORT",
        "EMBUDO_SERVER_GRACEFUL_SHUTDOWN_SECS",
        "EMBUDO_SCHEDULER_ENABLED",
        "EMBUDO_SCHEDULER_INTERVAL_SECS",
        "EMBUDO_SCHEDULER_BATCH_LIMIT",
        "EMBUDO_MESSAGING_ENABLED",
        "EMBUDO_MESSAGING_BASE_URL",
        "EMBUDO_MESSAGING_SERVICE_SECRET",
        "EMBUDO_MESSAGING_TIMEOUT_SECS",
        "EMBUDO_LOGGING_LEVEL",
        "EMBUDO_LOGGING_FORMAT",
        "EMBUDO_LOG_LEVEL",
        "EMBUDO_LOG_FORMAT",
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
