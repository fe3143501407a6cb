//! Core types for strata-control.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strata_vault::CredentialType;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an ID from an existing string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new unique ID using ULID.
            #[must_use]
            pub fn generate() -> Self {
                Self(ulid::Ulid::new().to_string().to_lowercase())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a deployment.
    DeploymentId
);

string_id!(
    /// Identifier for a template. Shared by every version of the template.
    TemplateId
);

string_id!(
    /// Identifier for a registered cloud account.
    AccountId
);

/// Variable values supplied to a template, keyed by variable name.
///
/// A `BTreeMap` keeps iteration order stable, which the plan digest relies
/// on.
pub type Variables = BTreeMap<String, serde_json::Value>;

// =============================================================================
// Cloud providers and accounts
// =============================================================================

/// Supported cloud providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services.
    Aws,
    /// Microsoft Azure.
    Azure,
    /// Google Cloud Platform.
    Gcp,
}

impl CloudProvider {
    /// Get the provider name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        }
    }

    /// The credential type accounts on this provider carry.
    #[must_use]
    pub const fn credential_type(&self) -> CredentialType {
        match self {
            Self::Aws => CredentialType::AwsAccessKey,
            Self::Azure => CredentialType::AzureServicePrincipal,
            Self::Gcp => CredentialType::GcpServiceAccount,
        }
    }

    /// JSON fields a credential document for this provider must contain.
    #[must_use]
    pub const fn required_credential_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Aws => &["access_key_id", "secret_access_key"],
            Self::Azure => &["client_id", "client_secret", "tenant_id", "subscription_id"],
            Self::Gcp => &["type", "project_id", "private_key", "client_email"],
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CloudProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            _ => Err(format!("unknown cloud provider: {s}")),
        }
    }
}

/// Whether an account may be used for new operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Usable.
    Active,
    /// Disabled by an operator.
    Inactive,
    /// Credentials failed validation or were rejected by the provider.
    Error,
}

impl AccountStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown account status: {s}")),
        }
    }
}

/// A registered cloud account. Its credential lives in the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Human-readable name.
    pub name: String,
    /// Cloud provider.
    pub provider: CloudProvider,
    /// Provider-side identifier (AWS account number, Azure subscription, GCP project).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Regions this account is used in.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Current status.
    pub status: AccountStatus,
    /// Why the account is in its current status, if not active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// When the account was registered.
    pub created_at: DateTime<Utc>,
    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Input for registering an account.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAccount {
    /// Explicit identifier; generated when absent.
    #[serde(default)]
    pub id: Option<AccountId>,
    /// Human-readable name.
    pub name: String,
    /// Cloud provider.
    pub provider: CloudProvider,
    /// Provider-side identifier.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Regions this account is used in.
    #[serde(default)]
    pub regions: Vec<String>,
}

// =============================================================================
// Templates
// =============================================================================

/// Type of a template variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Bool,
    /// JSON array.
    List,
    /// JSON object.
    Map,
}

impl VariableType {
    /// Get the type name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
        }
    }

    /// Returns true if `value` has this type.
    #[must_use]
    pub const fn matches(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        matches!(
            (self, value),
            (Self::String, Value::String(_))
                | (Self::Number, Value::Number(_))
                | (Self::Bool, Value::Bool(_))
                | (Self::List, Value::Array(_))
                | (Self::Map, Value::Object(_))
        )
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declaration of one template variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Variable name, referenced in the body as `var.<name>`.
    pub name: String,
    /// Expected value type.
    #[serde(rename = "type")]
    pub var_type: VariableType,
    /// Whether a value must be supplied when there is no default.
    #[serde(default)]
    pub required: bool,
    /// Value used when none is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An immutable, versioned infrastructure template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Template identifier, shared across versions.
    pub id: TemplateId,
    /// Version number, starting at 1.
    pub version: u32,
    /// Display name.
    pub name: String,
    /// Provider the template targets.
    pub provider: CloudProvider,
    /// Service category (e.g. "compute", "database", "storage").
    pub service_type: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declarative infrastructure definition.
    pub body: String,
    /// Variable schema.
    pub variables: Vec<VariableSpec>,
    /// When this version was registered.
    pub created_at: DateTime<Utc>,
}

impl Template {
    /// Returns the reference to this exact version.
    #[must_use]
    pub fn reference(&self) -> TemplateRef {
        TemplateRef {
            id: self.id.clone(),
            version: self.version,
        }
    }
}

/// Points at one version of a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateRef {
    /// Template identifier.
    pub id: TemplateId,
    /// Template version.
    pub version: u32,
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Input for registering a template or a new version of one.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    /// Existing identifier to add a version to; generated when absent.
    #[serde(default)]
    pub id: Option<TemplateId>,
    /// Display name.
    pub name: String,
    /// Provider the template targets.
    pub provider: CloudProvider,
    /// Service category.
    pub service_type: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Declarative infrastructure definition.
    pub body: String,
    /// Variable schema.
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
}

// =============================================================================
// Provisioning state and plans
// =============================================================================

/// Opaque provisioning state owned by the engine.
///
/// The orchestrator never looks inside `payload`; it only stores it,
/// forwards it to the next engine call, and clears it after a complete
/// teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBlob {
    /// Engine-defined format version of `payload`.
    pub schema_version: u32,
    /// Engine-defined state document.
    pub payload: serde_json::Value,
}

impl StateBlob {
    /// A blob representing "nothing provisioned".
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            schema_version: 0,
            payload: serde_json::Value::Null,
        }
    }

    /// Wraps an engine state document.
    #[must_use]
    pub fn new(schema_version: u32, payload: serde_json::Value) -> Self {
        Self {
            schema_version,
            payload,
        }
    }

    /// Returns true if no state is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_null()
    }

    /// Hex SHA-256 of the payload, for logging and change detection.
    #[must_use]
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        hex_digest(&bytes)
    }
}

impl Default for StateBlob {
    fn default() -> Self {
        Self::empty()
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    hash.iter().fold(String::with_capacity(64), |mut out, b| {
        use fmt::Write as _;
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// What a plan intends to do to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Resource will be created.
    Create,
    /// Resource will be modified in place.
    Update,
    /// Resource will be destroyed and recreated.
    Replace,
    /// Resource will be destroyed.
    Delete,
}

/// A single planned resource change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Engine address, e.g. `aws_instance.web`.
    pub address: String,
    /// Resource type, e.g. `aws_instance`.
    pub resource_type: String,
    /// Planned action.
    pub action: ChangeAction,
    /// Attributes after the change (empty for deletes).
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// The changes a plan proposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDiff {
    /// Resources to create (replacements count here too).
    pub add: usize,
    /// Resources to update in place.
    pub change: usize,
    /// Resources to destroy (replacements count here too).
    pub destroy: usize,
    /// Per-resource detail.
    pub changes: Vec<ResourceChange>,
}

impl PlanDiff {
    /// Builds a diff and its counts from per-resource changes.
    #[must_use]
    pub fn from_changes(changes: Vec<ResourceChange>) -> Self {
        let mut diff = Self::default();
        for change in &changes {
            match change.action {
                ChangeAction::Create => diff.add += 1,
                ChangeAction::Update => diff.change += 1,
                ChangeAction::Delete => diff.destroy += 1,
                ChangeAction::Replace => {
                    diff.add += 1;
                    diff.destroy += 1;
                }
            }
        }
        diff.changes = changes;
        diff
    }

    /// Returns true if applying would do nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.add == 0 && self.change == 0 && self.destroy == 0
    }

    /// Count-only view of the diff.
    #[must_use]
    pub const fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            add: self.add,
            change: self.change,
            destroy: self.destroy,
        }
    }
}

/// Resource counts touched by an operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Resources created.
    pub add: usize,
    /// Resources changed.
    pub change: usize,
    /// Resources destroyed.
    pub destroy: usize,
}

/// A provisioned resource as reported by the engine after apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Engine address.
    pub address: String,
    /// Resource type.
    pub resource_type: String,
    /// Current attributes.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

/// The plan an apply will execute, frozen at plan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    /// Template version the plan was rendered from.
    pub template_version: u32,
    /// Digest of template id, version and resolved variables.
    pub inputs_digest: String,
    /// Proposed changes.
    pub diff: PlanDiff,
    /// State the engine expects to produce.
    pub proposed_state: StateBlob,
    /// When the plan completed.
    pub planned_at: DateTime<Utc>,
}

// =============================================================================
// Costs
// =============================================================================

/// Whether a cost figure is a forecast or derived from live resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostBasis {
    /// Derived from a plan diff.
    Projected,
    /// Derived from provisioned resources.
    Realized,
}

/// Monthly cost estimate attached to a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Total monthly cost.
    pub total_cost: f64,
    /// ISO currency code.
    pub currency: String,
    /// Monthly cost per cloud service.
    pub cost_by_service: BTreeMap<String, f64>,
    /// Forecast or realised.
    pub basis: CostBasis,
    /// When the estimate was produced.
    pub estimated_at: DateTime<Utc>,
}

// =============================================================================
// Deployments
// =============================================================================

/// Persisted deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Plan in progress.
    Planning,
    /// Plan complete, ready to apply.
    Planned,
    /// Apply in progress.
    Applying,
    /// Resources provisioned.
    Applied,
    /// Destroy in progress.
    Destroying,
    /// Resources torn down. Terminal.
    Destroyed,
    /// Last operation failed or was interrupted.
    Error,
}

impl DeploymentStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Planning,
        Self::Planned,
        Self::Applying,
        Self::Applied,
        Self::Destroying,
        Self::Destroyed,
        Self::Error,
    ];

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Error => "error",
        }
    }

    /// Returns true for the in-progress statuses a crash can leave behind.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Planning | Self::Applying | Self::Destroying)
    }

    /// Returns true if no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "planned" => Ok(Self::Planned),
            "applying" => Ok(Self::Applying),
            "applied" => Ok(Self::Applied),
            "destroying" => Ok(Self::Destroying),
            "destroyed" => Ok(Self::Destroyed),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

/// A lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Dry run producing a diff.
    Plan,
    /// Provision resources.
    Apply,
    /// Tear resources down.
    Destroy,
}

impl Operation {
    /// Get the operation name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an operation ended (or that it has not yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Still running.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Engine reported failure.
    Failed,
    /// Cancelled on request.
    Cancelled,
    /// Exceeded its deadline.
    TimedOut,
    /// The process stopped while the operation was running.
    Interrupted,
}

/// The most recent operation run against a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Which operation.
    pub operation: Operation,
    /// How it ended.
    pub status: OperationStatus,
    /// When it started.
    pub started_at: DateTime<Utc>,
    /// When it finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Resource counts, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ChangeSummary>,
    /// Engine exit code, when the engine ran to completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Why a deployment is in the error status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// The operation that failed. Only this operation may be retried.
    pub operation: Operation,
    /// Human-readable cause.
    pub message: String,
    /// Engine exit code, if the engine ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// True if the process stopped mid-operation.
    #[serde(default)]
    pub interrupted: bool,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

/// One status transition in a deployment's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Previous status; `None` for creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DeploymentStatus>,
    /// New status.
    pub to: DeploymentStatus,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Failure message for transitions into error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Common data shared across all deployment states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentData {
    /// Unique deployment identifier.
    pub id: DeploymentId,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Template this deployment instantiates.
    pub template_id: TemplateId,
    /// Template version pinned at creation.
    pub template_version: u32,
    /// Account the resources live in.
    pub account_id: AccountId,
    /// Supplied variable values (before defaults are applied).
    #[serde(default)]
    pub variables: Variables,
    /// Engine-owned provisioning state.
    #[serde(default)]
    pub state_blob: StateBlob,
    /// Most recent successful plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSnapshot>,
    /// Resources reported by the last successful apply.
    #[serde(default)]
    pub resources: Vec<ResourceSummary>,
    /// Outputs reported by the last successful apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Captured engine output from the last operation.
    #[serde(default)]
    pub last_output: String,
    /// Latest cost estimate; may be stale if estimation later failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<CostEstimate>,
    /// Most recent operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<OperationRecord>,
    /// Present while the deployment is in the error status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Every status transition, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// When the deployment was last updated.
    pub updated_at: DateTime<Utc>,
}

impl DeploymentData {
    /// Create new deployment data from a request and the resolved template
    /// version.
    #[must_use]
    pub fn new(id: DeploymentId, request: &DeploymentRequest, template_version: u32) -> Self {
        let now = Utc::now();
        Self {
            name: request.name.clone().unwrap_or_else(|| id.to_string()),
            id,
            description: request.description.clone(),
            template_id: request.template_id.clone(),
            template_version,
            account_id: request.account_id.clone(),
            variables: request.variables.clone(),
            state_blob: StateBlob::empty(),
            plan: None,
            resources: Vec::new(),
            outputs: BTreeMap::new(),
            last_output: String::new(),
            cost_estimate: None,
            last_operation: None,
            failure: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A deployment record as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// The deployment data.
    #[serde(flatten)]
    pub data: DeploymentData,
    /// Current status.
    pub status: DeploymentStatus,
    /// Optimistic concurrency counter, bumped on every write.
    pub revision: u64,
}

/// Input for creating and planning a deployment.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentRequest {
    /// Explicit identifier; generated when absent.
    #[serde(default)]
    pub id: Option<DeploymentId>,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Template to instantiate.
    pub template_id: TemplateId,
    /// Template version; latest when absent.
    #[serde(default)]
    pub template_version: Option<u32>,
    /// Account to deploy into.
    pub account_id: AccountId,
    /// Variable values.
    #[serde(default)]
    pub variables: Variables,
}

impl DeploymentRequest {
    /// Creates a request for the latest version of `template_id`.
    #[must_use]
    pub fn new(template_id: TemplateId, account_id: AccountId, variables: Variables) -> Self {
        Self {
            id: None,
            name: None,
            description: None,
            template_id,
            template_version: None,
            account_id,
            variables,
        }
    }

    /// Sets an explicit deployment id.
    #[must_use]
    pub fn with_id(mut self, id: DeploymentId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pins a template version.
    #[must_use]
    pub const fn with_template_version(mut self, version: u32) -> Self {
        self.template_version = Some(version);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trip() {
        for status in DeploymentStatus::ALL {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
        }
        assert!("pending".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn transient_statuses() {
        let transient: Vec<_> = DeploymentStatus::ALL
            .into_iter()
            .filter(DeploymentStatus::is_transient)
            .collect();
        assert_eq!(
            transient,
            vec![
                DeploymentStatus::Planning,
                DeploymentStatus::Applying,
                DeploymentStatus::Destroying
            ]
        );
    }

    #[test]
    fn variable_type_matching() {
        assert!(VariableType::String.matches(&json!("t3.micro")));
        assert!(VariableType::Number.matches(&json!(20)));
        assert!(VariableType::Bool.matches(&json!(true)));
        assert!(VariableType::List.matches(&json!(["a"])));
        assert!(VariableType::Map.matches(&json!({"k": "v"})));
        assert!(!VariableType::String.matches(&json!(1)));
        assert!(!VariableType::Number.matches(&json!("1")));
    }

    #[test]
    fn plan_diff_counts_replacements_twice() {
        let change = |action| ResourceChange {
            address: "aws_instance.web".to_owned(),
            resource_type: "aws_instance".to_owned(),
            action,
            attributes: serde_json::Value::Null,
        };
        let diff = PlanDiff::from_changes(vec![
            change(ChangeAction::Create),
            change(ChangeAction::Update),
            change(ChangeAction::Replace),
        ]);
        assert_eq!(diff.add, 2);
        assert_eq!(diff.change, 1);
        assert_eq!(diff.destroy, 1);
        assert!(!diff.is_empty());
        assert!(PlanDiff::default().is_empty());
    }

    #[test]
    fn empty_state_blob() {
        let blob = StateBlob::empty();
        assert!(blob.is_empty());
        assert!(!StateBlob::new(1, json!({"resources": []})).is_empty());
        assert_eq!(blob.digest().len(), 64);
        assert_ne!(blob.digest(), StateBlob::new(1, json!({})).digest());
    }

    #[test]
    fn deployment_record_layout() {
        let request = DeploymentRequest::new(
            TemplateId::new("t1"),
            AccountId::new("a1"),
            Variables::from([("instance_type".to_owned(), json!("t3.micro"))]),
        );
        let data = DeploymentData::new(DeploymentId::new("d1"), &request, 1);
        let record = DeploymentRecord {
            data,
            status: DeploymentStatus::Planning,
            revision: 0,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "d1");
        assert_eq!(value["templateId"], "t1");
        assert_eq!(value["templateVersion"], 1);
        assert_eq!(value["accountId"], "a1");
        assert_eq!(value["status"], "planning");
        assert_eq!(value["variables"]["instance_type"], "t3.micro");
        assert!(value["stateBlob"]["payload"].is_null());

        let back: DeploymentRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn provider_credential_types() {
        assert_eq!(
            CloudProvider::Aws.credential_type(),
            CredentialType::AwsAccessKey
        );
        assert_eq!("gcp".parse::<CloudProvider>().unwrap(), CloudProvider::Gcp);
        assert!("oracle".parse::<CloudProvider>().is_err());
    }
}
