//! Common test utilities for orchestrator integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use strata_control::{
    AccountRegistry, AccountStore, CostEstimator, DeploymentOrchestrator, DeploymentStore,
    MemoryStore, MockEngine, OrchestratorConfig, ProvisioningEngine, TemplateRegistry,
    TemplateStore,
};
use strata_vault::{CredentialStore, CredentialVault, Keyring, MasterKey, MemoryCredentials};

/// Complete control plane wired to the mock engine.
///
/// When the builder is given another engine, the orchestrator drives that
/// one and `engine` is left idle.
pub struct TestControl {
    pub engine: Arc<MockEngine>,
    pub templates: TemplateRegistry,
    pub accounts: AccountRegistry,
    pub orchestrator: DeploymentOrchestrator,
    pub deployments: Arc<dyn DeploymentStore>,
}

impl TestControl {
    /// In-memory stores, no cost estimator.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// In-memory stores with the given estimator.
    pub fn with_estimator(estimator: impl CostEstimator + 'static) -> Self {
        Self::builder().estimator(Arc::new(estimator)).build()
    }

    pub fn builder() -> TestControlBuilder {
        TestControlBuilder::default()
    }
}

/// Builder for [`TestControl`] with shared or persistent backends.
pub struct TestControlBuilder {
    store: Option<Backend>,
    credentials: Option<Arc<dyn CredentialStore>>,
    master_key: MasterKey,
    estimator: Option<Arc<dyn CostEstimator>>,
    engine: Option<Arc<dyn ProvisioningEngine>>,
    config: OrchestratorConfig,
}

struct Backend {
    deployments: Arc<dyn DeploymentStore>,
    templates: Arc<dyn TemplateStore>,
    accounts: Arc<dyn AccountStore>,
}

impl Default for TestControlBuilder {
    fn default() -> Self {
        Self {
            store: None,
            credentials: None,
            master_key: MasterKey::generate(),
            estimator: None,
            engine: None,
            config: fast_config(),
        }
    }
}

impl TestControlBuilder {
    /// Use `store` for deployments, templates and accounts.
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: DeploymentStore + TemplateStore + AccountStore + 'static,
    {
        self.store = Some(Backend {
            deployments: store.clone(),
            templates: store.clone(),
            accounts: store,
        });
        self
    }

    /// Use `credentials` as the vault backend.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Seal credentials with `key`.
    pub fn master_key(mut self, key: MasterKey) -> Self {
        self.master_key = key;
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Drive `engine` instead of the mock.
    pub fn engine(mut self, engine: Arc<dyn ProvisioningEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> TestControl {
        let backend = self.store.unwrap_or_else(|| {
            let store = Arc::new(MemoryStore::new());
            Backend {
                deployments: store.clone(),
                templates: store.clone(),
                accounts: store,
            }
        });
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(MemoryCredentials::new()) as Arc<dyn CredentialStore>);

        let vault = Arc::new(CredentialVault::new(
            Arc::new(Keyring::new(1, self.master_key)),
            credentials,
        ));
        let engine = Arc::new(MockEngine::new());
        let templates = TemplateRegistry::new(backend.templates);
        let accounts = AccountRegistry::new(backend.accounts, backend.deployments.clone(), vault);
        let orchestrator = DeploymentOrchestrator::new(
            backend.deployments.clone(),
            templates.clone(),
            accounts.clone(),
            self.engine
                .unwrap_or_else(|| engine.clone() as Arc<dyn ProvisioningEngine>),
            self.estimator,
            self.config,
        );

        TestControl {
            engine,
            templates,
            accounts,
            orchestrator,
            deployments: backend.deployments,
        }
    }
}

/// Timings short enough that cancellation tests finish quickly.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        operation_timeout: Duration::from_secs(30),
        cancel_grace: Duration::from_millis(200),
        cost_timeout: Duration::from_secs(1),
    }
}
