use std::sync::Arc;

use chrono::Utc;
use embudo_core::SweepReport;
use embudo_db::SqlFunnelStore;
use embudo_engine::{notifier_from_config, EscalationScheduler, FunnelService};

use crate::commands::{load_config, migrated_pool, runtime, CommandResult, StepFailure};

/// Runs a single escalation sweep against the configured database and exits.
pub fn run() -> CommandResult {
    let config = match load_config("sweep") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("sweep") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let notifier = notifier_from_config(&config.messaging)
            .map_err(|error| ("messaging", error.to_string(), 2u8))?;
        let pool = migrated_pool(&config).await?;
        let store = Arc::new(SqlFunnelStore::new(pool.clone()));
        let service = Arc::new(FunnelService::new(store).with_notifier(notifier));
        let scheduler = EscalationScheduler::from_config(service, &config.scheduler);

        let report = scheduler
            .sweep_once(Utc::now())
            .await
            .map_err(|error| ("sweep_execution", error.to_string(), 6u8));
        pool.close().await;
        Ok::<SweepReport, StepFailure>(report?)
    });

    match result {
        Ok(report) => CommandResult::success("sweep", summarize(&report)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("sweep", error_class, message, exit_code)
        }
    }
}

fn summarize(report: &SweepReport) -> String {
    let mut summary = format!(
        "sweep complete: scanned={} escalated={} skipped={} conflicts={}",
        report.scanned,
        report.escalated.len(),
        report.skipped.len(),
        report.conflicts.len()
    );
    for skip in &report.skipped {
        summary.push_str(&format!("\n  - {}: {}", skip.opportunity_id, skip.reason.as_str()));
    }
    summary
}
