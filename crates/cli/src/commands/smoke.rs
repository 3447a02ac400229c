use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use renewdesk_core::config::{AppConfig, LoadOptions, ProviderMode, StoreBackend};
use renewdesk_core::providers::{
    SimulatedCustomerProvider, SimulatedInventoryProvider, SimulatedPromotionProvider,
};
use renewdesk_core::workflow::InMemorySessionStore;
use renewdesk_core::{RenewalWorkflow, SessionStore, WorkflowSessionManager, WorkflowStep};
use renewdesk_db::{connect_with_settings, migrations, DbPool, SqlSessionStore};
use serde::Serialize;

use crate::commands::CommandResult;

const SMOKE_STAFF_ID: &str = "smoke-check";
const SMOKE_ID_NUMBER: &str = "A123456789";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            checks.push(skipped("session_store"));
            checks.push(skipped("workflow_roundtrip"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(SmokeCheck {
                name: "session_store",
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            checks.push(skipped("workflow_roundtrip"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let store_started = Instant::now();
    let store_result = runtime.block_on(open_store(&config));
    let (store, pool) = match store_result {
        Ok((store, pool, message)) => {
            checks.push(SmokeCheck {
                name: "session_store",
                status: SmokeStatus::Pass,
                elapsed_ms: store_started.elapsed().as_millis() as u64,
                message,
            });
            (store, pool)
        }
        Err(error) => {
            checks.push(SmokeCheck {
                name: "session_store",
                status: SmokeStatus::Fail,
                elapsed_ms: store_started.elapsed().as_millis() as u64,
                message: format!("{error:#}"),
            });
            checks.push(skipped("workflow_roundtrip"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    if config.providers.mode == ProviderMode::Http {
        checks.push(SmokeCheck {
            name: "workflow_roundtrip",
            status: SmokeStatus::Skipped,
            elapsed_ms: 0,
            message: "providers.mode is http; round trip only runs against simulated providers"
                .to_string(),
        });
    } else {
        let roundtrip_started = Instant::now();
        let ttl = Duration::from_secs(config.store.session_ttl_secs);
        let outcome = runtime.block_on(workflow_roundtrip(store, ttl, &config.providers.default_store_id));
        checks.push(match outcome {
            Ok(message) => SmokeCheck {
                name: "workflow_roundtrip",
                status: SmokeStatus::Pass,
                elapsed_ms: roundtrip_started.elapsed().as_millis() as u64,
                message,
            },
            Err(error) => SmokeCheck {
                name: "workflow_roundtrip",
                status: SmokeStatus::Fail,
                elapsed_ms: roundtrip_started.elapsed().as_millis() as u64,
                message: format!("{error:#}"),
            },
        });
    }

    if let Some(pool) = pool {
        runtime.block_on(async {
            pool.close().await;
        });
    }

    finalize_report(checks, started.elapsed().as_millis() as u64)
}

async fn open_store(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn SessionStore>, Option<DbPool>, String)> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
            Ok((store, None, "in-memory session store ready".to_string()))
        }
        StoreBackend::Sqlite => {
            let pool = connect_with_settings(
                &config.database.url,
                config.database.max_connections,
                config.database.timeout_secs,
            )
            .await
            .with_context(|| format!("failed to connect to `{}`", config.database.url))?;
            migrations::run_pending(&pool).await.context("migration execution failed")?;
            let store: Arc<dyn SessionStore> = Arc::new(SqlSessionStore::new(pool.clone()));
            store.ping().await.context("session store ping failed")?;
            Ok((store, Some(pool), format!("sqlite session store ready at `{}`", config.database.url)))
        }
    }
}

/// Starts a session, attaches the demo customer, reads it back and deletes it.
async fn workflow_roundtrip(
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    default_store_id: &str,
) -> anyhow::Result<String> {
    let workflow = RenewalWorkflow::new(
        Arc::new(WorkflowSessionManager::new(store, ttl)),
        Arc::new(SimulatedCustomerProvider::new()),
        Arc::new(SimulatedInventoryProvider),
        Arc::new(SimulatedPromotionProvider),
        default_store_id,
    );

    let started = workflow.start(SMOKE_STAFF_ID).await.context("start session")?;
    let session_id = started.session_id;
    workflow
        .query_customer(SMOKE_STAFF_ID, &session_id, SMOKE_ID_NUMBER)
        .await
        .context("query demo customer")?;
    let session = workflow.session(SMOKE_STAFF_ID, &session_id).await.context("read session")?;
    ensure!(
        session.current_step == WorkflowStep::ListPhones,
        "expected session at list_phones, found {}",
        session.current_step
    );
    workflow.delete(SMOKE_STAFF_ID, &session_id).await.context("delete session")?;

    Ok(format!("session {session_id} reached {} and was deleted", session.current_step))
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((started.elapsed().as_millis() as u64, value)),
        Err(error) => Err((started.elapsed().as_millis() as u64, error)),
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serde_json::to_string(&report).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"smoke\",\"status\":\"fail\",\"summary\":\"serialization failed\",\"error\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    });

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
