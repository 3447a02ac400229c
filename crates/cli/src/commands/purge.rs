use renewdesk_core::config::StoreBackend;
use renewdesk_core::SessionStore;
use renewdesk_db::{connect_with_settings, migrations, SqlSessionStore};
use serde_json::json;

use crate::commands::{current_thread_runtime, load_config, CommandResult};

/// Sweeps expired rows. Reads already ignore them; this only reclaims space.
pub fn run() -> CommandResult {
    let config = match load_config("purge") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    if config.store.backend == StoreBackend::Memory {
        return CommandResult::success(
            "purge",
            "store.backend is memory; the running server sweeps its own expired sessions",
        );
    }
    let runtime = match current_thread_runtime("purge") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        let removed = SqlSessionStore::new(pool.clone())
            .purge_expired()
            .await
            .map_err(|error| ("purge", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<u64, (&'static str, String, u8)>(removed)
    });

    match result {
        Ok(removed) => CommandResult::success_with_detail(
            "purge",
            format!("removed {removed} expired rows"),
            Some(json!({ "removed": removed })),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("purge", error_class, message, exit_code)
        }
    }
}
