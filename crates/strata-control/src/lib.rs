//! Strata Control Plane
//!
//! This crate drives infrastructure-as-code templates through a
//! plan/apply/destroy lifecycle against registered cloud accounts.
//!
//! # Architecture
//!
//! - **Templates**: versioned, immutable definitions with a typed variable
//!   schema ([`TemplateRegistry`])
//! - **Accounts**: cloud accounts whose credentials are sealed in the
//!   [`strata_vault::CredentialVault`] ([`AccountRegistry`])
//! - **Orchestration**: one in-flight operation per deployment, progress
//!   persisted while the engine runs, crash recovery at startup
//!   ([`DeploymentOrchestrator`])
//! - **Capabilities**: the [`ProvisioningEngine`] that touches real
//!   infrastructure and the [`CostEstimator`] that prices it
//!
//! # State Machine
//!
//! Deployments follow a strict state machine enforced at compile time using
//! the typestate pattern:
//!
//! ```text
//! planning ──▶ planned ──▶ applying ──▶ applied ──▶ destroying ──▶ destroyed
//!     │                       │                         │
//!     └───────────────────────┴────────▶ error ◀────────┘
//! ```
//!
//! An errored deployment may only retry the operation that failed.
//!
//! # Example
//!
//! ```ignore
//! use strata_control::{DeploymentRequest, ControlService, ControlConfig};
//!
//! let service = ControlService::connect(ControlConfig::load()?).await?;
//! service.startup().await?;
//!
//! let orchestrator = service.orchestrator();
//! let planned = orchestrator
//!     .plan_new(DeploymentRequest::new(template_id, account_id, variables))
//!     .await?;
//! let applied = orchestrator.apply(&planned.data.id).await?;
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod accounts;
pub mod config;
pub mod cost;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod service;
pub mod state;
pub mod store;
pub mod templates;
pub mod types;

// Re-export commonly used types at the crate root
pub use accounts::{AccountRegistry, ProviderCredentials};
pub use config::ControlConfig;
pub use cost::{CostEstimator, CostSubject, FixedEstimator, StaticPriceEstimator};
pub use deployment::{
    DeploymentOrchestrator, LockTable, OperationOptions, OrchestratorConfig, RecoveryReport,
};
pub use engine::{MockEngine, ProvisioningEngine, TerraformEngine};
pub use error::{ControlError, ControlResult};
pub use service::ControlService;
pub use state::{
    AnyDeployment, Applied, Applying, Deployment, DeploymentState, Destroyed, Destroying,
    Errored, Planned, Planning,
};
pub use store::{
    AccountFilter, AccountStore, DeploymentFilter, DeploymentStore, MemoryStore, SqliteStore,
    TemplateFilter, TemplateStore,
};
pub use templates::{RenderedTemplate, TemplateRegistry};
pub use types::{
    Account, AccountId, CloudProvider, CostEstimate, DeploymentData, DeploymentId,
    DeploymentRecord, DeploymentRequest, DeploymentStatus, NewAccount, NewTemplate, StateBlob,
    Template, TemplateId, Variables,
};
