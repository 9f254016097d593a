use crate::commands::{build_runtime, load_config, open_migrated, CommandResult, StepFailure};
use repairhub_db::{DemoDataset, ScenarioSeedInfo};

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("seed") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated(&config).await?;

        let outcome = async {
            let seeded = DemoDataset::load(&pool)
                .await
                .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

            let verification = DemoDataset::verify(&pool)
                .await
                .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

            if verification.all_present {
                Ok::<_, StepFailure>(seeded.scenarios_seeded)
            } else {
                let failed = verification
                    .checks
                    .iter()
                    .filter_map(|(check, passed)| (!passed).then_some(*check))
                    .collect::<Vec<_>>();
                Err(("seed_verification", verification_failure_message(&failed), 6u8))
            }
        }
        .await;

        pool.close().await;
        outcome
    });

    match result {
        Ok(scenarios) => CommandResult::success("seed", seeded_message(&scenarios)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn seeded_message(scenarios: &[ScenarioSeedInfo]) -> String {
    let lines = scenarios
        .iter()
        .map(|info| format!("  - {}: {} ({})", info.scenario, info.request_id, info.description))
        .collect::<Vec<_>>();
    format!("demo dataset loaded with {} repair scenarios:\n{}", scenarios.len(), lines.join("\n"))
}

fn verification_failure_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "some demo data failed to load".to_string()
    } else {
        format!("demo data verification failed for checks: {}", failed_checks.join(", "))
    }
}
