//! Storage backends for deployments, templates and accounts.
//!
//! Deployment records are written whole: every [`DeploymentStore::persist`]
//! atomically replaces the stored record (status, state blob, history and
//! all) and bumps its revision. A write carrying a stale revision is
//! rejected, so two writers can never interleave partial updates.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{
    Account, AccountId, AccountStatus, CloudProvider, DeploymentId, DeploymentRecord,
    DeploymentStatus, Template, TemplateId,
};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Filter by account.
    pub account_id: Option<AccountId>,
    /// Filter by template.
    pub template_id: Option<TemplateId>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: None,
            account_id: None,
            template_id: None,
            limit: None,
            offset: None,
        }
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by account.
    #[must_use]
    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Filter by template.
    #[must_use]
    pub fn with_template(mut self, template_id: TemplateId) -> Self {
        self.template_id = Some(template_id);
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub(crate) fn matches(&self, record: &DeploymentRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self
                .account_id
                .as_ref()
                .map_or(true, |a| &record.data.account_id == a)
            && self
                .template_id
                .as_ref()
                .map_or(true, |t| &record.data.template_id == t)
    }
}

/// Filter criteria for listing templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    /// Filter by provider.
    pub provider: Option<CloudProvider>,
    /// Filter by service category.
    pub service_type: Option<String>,
}

impl TemplateFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            provider: None,
            service_type: None,
        }
    }

    /// Filter by provider.
    #[must_use]
    pub const fn with_provider(mut self, provider: CloudProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Filter by service category.
    #[must_use]
    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    pub(crate) fn matches(&self, template: &Template) -> bool {
        self.provider.map_or(true, |p| template.provider == p)
            && self
                .service_type
                .as_deref()
                .map_or(true, |s| template.service_type == s)
    }
}

/// Filter criteria for listing accounts.
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    /// Filter by provider.
    pub provider: Option<CloudProvider>,
    /// Filter by status.
    pub status: Option<AccountStatus>,
}

impl AccountFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            provider: None,
            status: None,
        }
    }

    /// Filter by provider.
    #[must_use]
    pub const fn with_provider(mut self, provider: CloudProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn matches(&self, account: &Account) -> bool {
        self.provider.map_or(true, |p| account.provider == p)
            && self.status.map_or(true, |s| account.status == s)
    }
}

/// Backend for storing deployment records.
///
/// Implementations must make every write atomic and durable before
/// returning: the orchestrator persists each state transition before
/// proceeding, and relies on that for crash recovery.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a new deployment record at revision 0.
    ///
    /// Returns [`AlreadyExists`](crate::ControlError::AlreadyExists) if the
    /// ID is taken.
    async fn insert(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Get a deployment by ID.
    ///
    /// Returns `None` if the deployment does not exist.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// Replace the stored record.
    ///
    /// Succeeds only if the stored revision equals `record.revision`, and
    /// returns the new revision. A mismatch returns
    /// [`Conflict`](crate::ControlError::Conflict).
    async fn persist(&self, record: &DeploymentRecord) -> ControlResult<u64>;

    /// List deployments matching the filter criteria.
    ///
    /// Results are ordered by `created_at` descending (newest first).
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// IDs of deployments left in planning, applying or destroying.
    async fn recover_incomplete(&self) -> ControlResult<Vec<DeploymentId>>;

    /// Number of deployments that reference an account, destroyed ones
    /// included.
    async fn count_for_account(&self, account_id: &AccountId) -> ControlResult<usize>;
}

/// Backend for storing template versions.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Insert a template version.
    ///
    /// Returns [`AlreadyExists`](crate::ControlError::AlreadyExists) if the
    /// (id, version) pair is taken.
    async fn insert_template(&self, template: &Template) -> ControlResult<()>;

    /// Get a template version, or the latest version when `version` is `None`.
    async fn get_template(
        &self,
        id: &TemplateId,
        version: Option<u32>,
    ) -> ControlResult<Option<Template>>;

    /// Latest version of each template matching the filter, ordered by id.
    async fn list_templates(&self, filter: &TemplateFilter) -> ControlResult<Vec<Template>>;

    /// All versions of a template, ascending.
    async fn template_versions(&self, id: &TemplateId) -> ControlResult<Vec<u32>>;
}

/// Backend for storing account metadata.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account.
    async fn insert_account(&self, account: &Account) -> ControlResult<()>;

    /// Get an account by ID.
    async fn get_account(&self, id: &AccountId) -> ControlResult<Option<Account>>;

    /// Replace an existing account.
    async fn update_account(&self, account: &Account) -> ControlResult<()>;

    /// List accounts matching the filter, ordered by creation time.
    async fn list_accounts(&self, filter: &AccountFilter) -> ControlResult<Vec<Account>>;

    /// Delete an account. Returns true if it existed.
    async fn delete_account(&self, id: &AccountId) -> ControlResult<bool>;
}
