use std::sync::Arc;
use std::time::Duration;

use renewdesk_core::config::{AppConfig, ConfigError, ProviderMode, StoreBackend};
use renewdesk_core::providers::{
    CustomerProvider, InventoryProvider, PromotionProvider, SimulatedCustomerProvider,
    SimulatedInventoryProvider, SimulatedPromotionProvider,
};
use renewdesk_core::workflow::InMemorySessionStore;
use renewdesk_core::{RenewalWorkflow, SessionStore, WorkflowSessionManager};
use renewdesk_db::{connect_with_settings, migrations, SqlSessionStore};
use thiserror::Error;
use tracing::info;

use crate::providers::{HttpCustomerProvider, HttpInventoryProvider, HttpPromotionProvider, ToolClient};

pub struct Application {
    pub config: AppConfig,
    pub workflow: Arc<RenewalWorkflow>,
    pub store: Arc<dyn SessionStore>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("provider client setup failed: {0}")]
    Providers(String),
}

struct ProviderSet {
    customers: Arc<dyn CustomerProvider>,
    inventory: Arc<dyn InventoryProvider>,
    promotions: Arc<dyn PromotionProvider>,
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        store_backend = ?config.store.backend,
        provider_mode = ?config.providers.mode,
        "starting application bootstrap"
    );

    let store = session_store(&config).await?;
    let providers = provider_set(&config)?;

    let manager = WorkflowSessionManager::new(
        store.clone(),
        Duration::from_secs(config.store.session_ttl_secs),
    );
    let workflow = RenewalWorkflow::new(
        Arc::new(manager),
        providers.customers,
        providers.inventory,
        providers.promotions,
        config.providers.default_store_id.clone(),
    );

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        session_ttl_secs = config.store.session_ttl_secs,
        "renewal workflow assembled"
    );

    Ok(Application { config, workflow: Arc::new(workflow), store })
}

async fn session_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>, BootstrapError> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemorySessionStore::new())),
        StoreBackend::Sqlite => {
            let db_pool = connect_with_settings(
                &config.database.url,
                config.database.max_connections,
                config.database.timeout_secs,
            )
            .await
            .map_err(BootstrapError::DatabaseConnect)?;
            info!(
                event_name = "system.bootstrap.database_connected",
                correlation_id = "bootstrap",
                "database connection established"
            );

            migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
            info!(
                event_name = "system.bootstrap.migrations_applied",
                correlation_id = "bootstrap",
                "database migrations applied"
            );

            Ok(Arc::new(SqlSessionStore::new(db_pool)))
        }
    }
}

fn provider_set(config: &AppConfig) -> Result<ProviderSet, BootstrapError> {
    let providers = &config.providers;
    match providers.mode {
        ProviderMode::Simulated => Ok(ProviderSet {
            customers: Arc::new(SimulatedCustomerProvider::new()),
            inventory: Arc::new(SimulatedInventoryProvider),
            promotions: Arc::new(SimulatedPromotionProvider),
        }),
        ProviderMode::Http => {
            let timeout = Duration::from_secs(providers.timeout_secs);
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|error| BootstrapError::Providers(error.to_string()))?;
            let tools = |base_url: &Option<String>, provider: &'static str| {
                base_url
                    .as_deref()
                    .map(|url| ToolClient::new(client.clone(), url, provider, timeout))
                    .ok_or_else(|| {
                        BootstrapError::Providers(format!(
                            "providers.{provider}_base_url is required in http mode"
                        ))
                    })
            };

            Ok(ProviderSet {
                customers: Arc::new(HttpCustomerProvider::new(tools(&providers.crm_base_url, "crm")?)),
                inventory: Arc::new(HttpInventoryProvider::new(tools(&providers.pos_base_url, "pos")?)),
                promotions: Arc::new(HttpPromotionProvider::new(tools(
                    &providers.promotion_base_url,
                    "promotion",
                )?)),
            })
        }
    }
}
