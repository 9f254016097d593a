use crate::commands::{build_runtime, load_config, open_migrated, CommandResult};
use repairhub_db::migrations;

pub fn run() -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated(&config).await?;
        let status = migrations::status(&pool).await;
        pool.close().await;
        status.map_err(|error| ("migration", error.to_string(), 5u8))
    });

    match result {
        Ok(status) => CommandResult::success(
            "migrate",
            format!(
                "database schema is current ({} of {} migrations applied)",
                status.applied, status.known
            ),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
