//! Error types for strata-control.

use std::time::Duration;

use strata_vault::VaultError;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Credential vault error.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// Template (or template version) not found.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// Cloud account not found.
    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// A record with the same identifier already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// Another operation holds the deployment, or the stored record moved
    /// on underneath the caller.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Supplied variables or account data failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A template's variable schema or body is malformed.
    #[error("invalid template schema: {0}")]
    Schema(String),

    /// Variables changed since the last plan; re-plan before applying.
    #[error("plan for deployment {0} is stale; re-plan before applying")]
    StalePlan(String),

    /// The provisioning engine exited non-zero.
    #[error("provisioning failed with exit code {exit_code}")]
    Provisioning {
        /// Engine exit code.
        exit_code: i32,
        /// Captured engine output.
        output: String,
    },

    /// The engine exited cleanly but left resources behind on destroy.
    #[error("teardown incomplete: {remaining} resource(s) still exist")]
    IncompleteTeardown {
        /// Number of resources the engine reported as still present.
        remaining: usize,
    },

    /// The operation was cancelled on request.
    #[error("operation cancelled for deployment {0}")]
    Cancelled(String),

    /// The operation exceeded its deadline and was cancelled.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    /// No operation is in flight for the deployment.
    #[error("no operation in flight for deployment {0}")]
    NotInFlight(String),

    /// The account still has deployments referencing it.
    #[error("account {account_id} is referenced by {deployments} deployment(s)")]
    AccountInUse {
        /// The account that could not be removed.
        account_id: String,
        /// Number of deployments that reference it.
        deployments: usize,
    },

    /// Cost estimation failed.
    #[error("cost estimation failed: {0}")]
    Estimation(String),

    /// The provisioning engine could not be run at all.
    #[error("engine error: {0}")]
    Engine(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a schema error.
    #[must_use]
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an engine error.
    #[must_use]
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialisation(e.to_string())
    }
}
