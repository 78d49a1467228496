use crate::commands::{load_config, runtime, CommandResult};
use prechat_db::{connect_from_config, migrations};
use serde_json::json;

pub fn run(status_only: bool) -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        let pending = migrations::pending_versions(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        if !status_only {
            migrations::run_pending(&pool)
                .await
                .map_err(|error| ("migration", error.to_string(), 5u8))?;
        }
        pool.close().await;
        Ok::<Vec<i64>, (&'static str, String, u8)>(pending)
    });

    match result {
        Ok(pending) if status_only => CommandResult::success_with_data(
            "migrate",
            format!("{} pending migration(s)", pending.len()),
            json!({ "pending_versions": pending }),
        ),
        Ok(pending) => CommandResult::success_with_data(
            "migrate",
            format!("applied {} pending migration(s)", pending.len()),
            json!({ "applied_versions": pending }),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
