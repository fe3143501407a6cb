//! Service assembly.
//!
//! Builds every component from configuration, sharing one SQLite pool
//! between the deployment store and the credential vault.

use std::sync::Arc;

use strata_vault::{CredentialVault, SqliteCredentials};
use tracing::info;

use crate::accounts::AccountRegistry;
use crate::config::{ControlConfig, DatabaseConfig};
use crate::cost::create_estimator;
use crate::deployment::{DeploymentOrchestrator, OrchestratorConfig, RecoveryReport};
use crate::engine::create_engine;
use crate::error::ControlResult;
use crate::store::SqliteStore;
use crate::templates::TemplateRegistry;

/// The assembled control plane.
pub struct ControlService {
    config: ControlConfig,
    vault: Arc<CredentialVault>,
    templates: TemplateRegistry,
    accounts: AccountRegistry,
    orchestrator: DeploymentOrchestrator,
}

impl ControlService {
    /// Open the database, load the master key and build every component.
    ///
    /// Does not run recovery; call [`startup`](Self::startup) before
    /// starting operations.
    pub async fn connect(config: ControlConfig) -> ControlResult<Self> {
        let store = Arc::new(open_store(&config.database).await?);
        info!(url = %config.database.url, "database opened");

        let keyring = config.vault.keyring()?;
        let credentials = SqliteCredentials::from_pool(store.pool()).await?;
        let vault = Arc::new(CredentialVault::new(
            Arc::new(keyring),
            Arc::new(credentials),
        ));
        info!(
            key_version = vault.active_key_version().await,
            "credential vault ready"
        );

        let engine = create_engine(&config.engine)?;
        info!(engine = engine.name(), "provisioning engine configured");

        let estimator = create_estimator(&config.cost);
        info!(cost = ?config.cost.kind, "cost estimator configured");

        let templates = TemplateRegistry::new(store.clone());
        let accounts = AccountRegistry::new(store.clone(), store.clone(), Arc::clone(&vault));
        let orchestrator = DeploymentOrchestrator::new(
            store,
            templates.clone(),
            accounts.clone(),
            engine,
            estimator,
            OrchestratorConfig::from_config(&config.engine, &config.cost),
        );

        Ok(Self {
            config,
            vault,
            templates,
            accounts,
            orchestrator,
        })
    }

    /// Resolve deployments a previous process left mid-operation.
    pub async fn startup(&self) -> ControlResult<RecoveryReport> {
        self.orchestrator.recover().await
    }

    /// The loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// The credential vault.
    #[must_use]
    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// The template catalogue.
    #[must_use]
    pub const fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// The account registry.
    #[must_use]
    pub const fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    /// The deployment orchestrator.
    #[must_use]
    pub const fn orchestrator(&self) -> &DeploymentOrchestrator {
        &self.orchestrator
    }
}

impl std::fmt::Debug for ControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlService")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

async fn open_store(config: &DatabaseConfig) -> ControlResult<SqliteStore> {
    match config.path() {
        Some(path) => {
            SqliteStore::open_with(path, config.max_connections, config.busy_timeout()).await
        }
        None => SqliteStore::connect(&config.url).await,
    }
}
