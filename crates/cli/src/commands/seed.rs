use embudo_db::{DefaultFunnel, SeedResult, SqlFunnelStore};

use crate::commands::{load_config, migrated_pool, runtime, CommandResult, StepFailure};

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;
        let store = SqlFunnelStore::new(pool.clone());
        let seeded = DefaultFunnel::load(&store)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8));
        pool.close().await;
        Ok::<SeedResult, StepFailure>(seeded?)
    });

    match result {
        Ok(seeded) => CommandResult::success("seed", summarize(&seeded)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn summarize(seeded: &SeedResult) -> String {
    if seeded.skipped {
        return "funnel catalog already present; nothing written".to_string();
    }
    format!(
        "default funnel loaded: {} stages, {} transitions, {} field rules",
        seeded.stages_created, seeded.transitions_created, seeded.field_rules_upserted
    )
}

#[cfg(test)]
mod tests {
    use embudo_db::SeedResult;

    use super::summarize;

    #[test]
    fn summary_counts_written_rows() {
        let seeded = SeedResult {
            stages_created: 9,
            transitions_created: 18,
            field_rules_upserted: 4,
            skipped: false,
        };
        assert_eq!(
            summarize(&seeded),
            "default funnel loaded: 9 stages, 18 transitions, 4 field rules"
        );
    }

    #[test]
    fn summary_reports_skipped_seed() {
        let seeded = SeedResult { skipped: true, ..SeedResult::default() };
        assert_eq!(summarize(&seeded), "funnel catalog already present; nothing written");
    }
}
