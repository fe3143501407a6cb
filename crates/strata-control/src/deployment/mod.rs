//! Deployment orchestration.
//!
//! The [`DeploymentOrchestrator`] runs plan, apply and destroy against a
//! [`ProvisioningEngine`](crate::engine::ProvisioningEngine), holding a
//! per-deployment lock from load until the final status is persisted.

mod locks;
mod orchestrator;

pub use locks::{LockGuard, LockTable};
pub use orchestrator::{
    DeploymentOrchestrator, OperationOptions, OrchestratorConfig, RecoveryReport,
};
