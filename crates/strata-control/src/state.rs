//! Typestate pattern for the deployment lifecycle.
//!
//! Deployment states are encoded in the type system, so an apply can only be
//! started from a `Deployment<Planned>` (or an errored apply being retried)
//! and a destroy only from a `Deployment<Applied>`.
//!
//! ```text
//!                 +-----------+   +---------+   +----------+   +---------+
//!  create ------> | planning  |-->| planned |-->| applying |-->| applied |
//!                 +-----------+   +---------+   +----------+   +---------+
//!                   ^   |           |  ^            |               |
//!                   |   |   replan  |  |            |               v
//!                   |   |     +-----+  |            |         +------------+   +-----------+
//!                   |   |     v        |            |         | destroying |-->| destroyed |
//!                   |   +--> error <---+------------+---------+------------+   +-----------+
//!                   |          |  retry (same operation only)
//!                   +----------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! let planning = Deployment::<Planning>::create(data);
//! let planned = planning.planned(snapshot, output);
//! let applying = planned.start_apply();
//! // applying.start_destroy() would not compile - invalid transition
//! ```

use std::collections::BTreeMap;
use std::marker::PhantomData;

use chrono::Utc;

use crate::error::{ControlError, ControlResult};
use crate::types::{
    ChangeSummary, CostEstimate, DeploymentData, DeploymentId, DeploymentRecord,
    DeploymentStatus, Failure, HistoryEntry, Operation, OperationRecord, OperationStatus,
    PlanSnapshot, ResourceSummary, StateBlob, Variables,
};

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Get the persisted status representation.
    fn status() -> DeploymentStatus;

    /// Get the state name for error messages.
    fn name() -> &'static str {
        Self::status().as_str()
    }
}

/// States in which an engine operation is running.
///
/// A crash while a record is in one of these states leaves it stranded;
/// recovery moves it to error with the interrupted flag set.
pub trait InFlight: DeploymentState {
    /// The operation running in this state.
    const OPERATION: Operation;
}

mod private {
    pub trait Sealed {}
}

/// Plan in progress.
#[derive(Debug, Clone, Copy)]
pub struct Planning;

/// Plan complete; ready to apply.
#[derive(Debug, Clone, Copy)]
pub struct Planned;

/// Apply in progress.
#[derive(Debug, Clone, Copy)]
pub struct Applying;

/// Resources provisioned.
#[derive(Debug, Clone, Copy)]
pub struct Applied;

/// Destroy in progress.
#[derive(Debug, Clone, Copy)]
pub struct Destroying;

/// Resources torn down. Terminal.
#[derive(Debug, Clone, Copy)]
pub struct Destroyed;

/// The last operation failed or was interrupted.
#[derive(Debug, Clone, Copy)]
pub struct Errored;

impl private::Sealed for Planning {}
impl private::Sealed for Planned {}
impl private::Sealed for Applying {}
impl private::Sealed for Applied {}
impl private::Sealed for Destroying {}
impl private::Sealed for Destroyed {}
impl private::Sealed for Errored {}

impl DeploymentState for Planning {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Planning
    }
}

impl DeploymentState for Planned {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Planned
    }
}

impl DeploymentState for Applying {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Applying
    }
}

impl DeploymentState for Applied {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Applied
    }
}

impl DeploymentState for Destroying {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Destroying
    }
}

impl DeploymentState for Destroyed {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Destroyed
    }
}

impl DeploymentState for Errored {
    fn status() -> DeploymentStatus {
        DeploymentStatus::Error
    }
}

impl InFlight for Planning {
    const OPERATION: Operation = Operation::Plan;
}

impl InFlight for Applying {
    const OPERATION: Operation = Operation::Apply;
}

impl InFlight for Destroying {
    const OPERATION: Operation = Operation::Destroy;
}

// =============================================================================
// Deployment struct parameterised by state
// =============================================================================

/// A deployment in a specific state.
///
/// The state parameter `S` determines which transitions are available.
/// Every transition appends to the deployment's history.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    /// The underlying deployment data.
    data: DeploymentData,
    /// Revision of the stored record this value was loaded from or last
    /// written as.
    revision: u64,
    /// Zero-sized state marker.
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::status()
    }

    /// Get the state name.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        S::name()
    }

    /// Revision of the stored record.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Record the revision assigned by the store after a write.
    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Attach a cost estimate.
    pub fn set_cost_estimate(&mut self, estimate: CostEstimate) {
        self.data.cost_estimate = Some(estimate);
        self.data.updated_at = Utc::now();
    }

    /// Snapshot as a storable record.
    #[must_use]
    pub fn to_record(&self) -> DeploymentRecord {
        DeploymentRecord {
            data: self.data.clone(),
            status: S::status(),
            revision: self.revision,
        }
    }

    /// Convert into a storable record (consuming the deployment).
    #[must_use]
    pub fn into_record(self) -> DeploymentRecord {
        DeploymentRecord {
            data: self.data,
            status: S::status(),
            revision: self.revision,
        }
    }

    /// Convert into the underlying data (consuming the deployment).
    #[must_use]
    pub fn into_data(self) -> DeploymentData {
        self.data
    }

    /// Internal helper to transition to a new state, recording history.
    fn transition<T: DeploymentState>(mut self, note: Option<String>) -> Deployment<T> {
        let now = Utc::now();
        self.data.history.push(HistoryEntry {
            from: Some(S::status()),
            to: T::status(),
            at: now,
            note,
        });
        self.data.updated_at = now;
        Deployment {
            data: self.data,
            revision: self.revision,
            _state: PhantomData,
        }
    }

    /// Internal helper to transition with data modification.
    fn transition_with<T: DeploymentState>(
        mut self,
        note: Option<String>,
        f: impl FnOnce(&mut DeploymentData),
    ) -> Deployment<T> {
        f(&mut self.data);
        self.transition(note)
    }

    /// Enter an in-flight state: clears any previous failure and opens a new
    /// operation record.
    fn begin<T: InFlight>(self) -> Deployment<T> {
        self.transition_with(None, |data| {
            data.failure = None;
            data.last_operation = Some(OperationRecord {
                operation: T::OPERATION,
                status: OperationStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                summary: None,
                exit_code: None,
            });
        })
    }
}

fn finish_operation(
    data: &mut DeploymentData,
    status: OperationStatus,
    exit_code: Option<i32>,
    summary: Option<ChangeSummary>,
) {
    if let Some(op) = data.last_operation.as_mut() {
        op.status = status;
        op.completed_at = Some(Utc::now());
        op.exit_code = exit_code;
        if summary.is_some() {
            op.summary = summary;
        }
    }
}

// =============================================================================
// In-flight behaviour shared by planning, applying and destroying
// =============================================================================

impl<S: InFlight> Deployment<S> {
    /// The operation this deployment is running.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        S::OPERATION
    }

    /// Record an intermediate state snapshot reported by the engine.
    pub fn record_state(&mut self, state: StateBlob) {
        self.data.state_blob = state;
        self.data.updated_at = Utc::now();
    }

    /// Record engine output without changing state.
    pub fn record_output(&mut self, output: String) {
        self.data.last_output = output;
    }

    /// Transition to the error state.
    ///
    /// `status` says how the operation ended (failed, cancelled, timed out).
    /// The current state blob is kept as-is so partial progress survives.
    #[must_use]
    pub fn fail(
        self,
        status: OperationStatus,
        message: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Deployment<Errored> {
        let message = message.into();
        let note = message.clone();
        self.transition_with(Some(note), |data| {
            finish_operation(data, status, exit_code, None);
            data.failure = Some(Failure {
                operation: S::OPERATION,
                message,
                exit_code,
                interrupted: false,
                at: Utc::now(),
            });
        })
    }

    /// Transition to the error state after the process stopped mid-operation.
    #[must_use]
    pub fn interrupt(self) -> Deployment<Errored> {
        let message = format!("{} interrupted by process restart", S::OPERATION);
        let note = message.clone();
        self.transition_with(Some(note), |data| {
            finish_operation(data, OperationStatus::Interrupted, None, None);
            data.failure = Some(Failure {
                operation: S::OPERATION,
                message,
                exit_code: None,
                interrupted: true,
                at: Utc::now(),
            });
        })
    }
}

// =============================================================================
// State transitions
// =============================================================================

impl Deployment<Planning> {
    /// Create a new deployment in the planning state.
    #[must_use]
    pub fn create(mut data: DeploymentData) -> Self {
        let now = Utc::now();
        data.history.push(HistoryEntry {
            from: None,
            to: DeploymentStatus::Planning,
            at: now,
            note: None,
        });
        data.last_operation = Some(OperationRecord {
            operation: Operation::Plan,
            status: OperationStatus::Running,
            started_at: now,
            completed_at: None,
            summary: None,
            exit_code: None,
        });
        Self {
            data,
            revision: 0,
            _state: PhantomData,
        }
    }

    /// Transition to the planned state with the frozen plan.
    #[must_use]
    pub fn planned(self, snapshot: PlanSnapshot, output: String) -> Deployment<Planned> {
        self.transition_with(None, |data| {
            finish_operation(
                data,
                OperationStatus::Succeeded,
                Some(0),
                Some(snapshot.diff.summary()),
            );
            data.template_version = snapshot.template_version;
            data.plan = Some(snapshot);
            data.last_output = output;
        })
    }
}

impl Deployment<Planned> {
    /// Transition to the applying state.
    #[must_use]
    pub fn start_apply(self) -> Deployment<Applying> {
        self.begin()
    }

    /// Discard the current plan and plan again.
    #[must_use]
    pub fn replan(self) -> Deployment<Planning> {
        self.begin()
    }

    /// Replace the supplied variables. The existing plan becomes stale.
    pub fn set_variables(&mut self, variables: Variables) {
        self.data.variables = variables;
        self.data.updated_at = Utc::now();
    }
}

impl Deployment<Applying> {
    /// Transition to the applied state.
    #[must_use]
    pub fn applied(
        self,
        state: StateBlob,
        resources: Vec<ResourceSummary>,
        outputs: BTreeMap<String, serde_json::Value>,
        output: String,
    ) -> Deployment<Applied> {
        self.transition_with(None, |data| {
            let summary = data.plan.as_ref().map(|p| p.diff.summary());
            finish_operation(data, OperationStatus::Succeeded, Some(0), summary);
            data.state_blob = state;
            data.resources = resources;
            data.outputs = outputs;
            data.last_output = output;
        })
    }
}

impl Deployment<Applied> {
    /// Transition to the destroying state.
    #[must_use]
    pub fn start_destroy(self) -> Deployment<Destroying> {
        self.begin()
    }
}

impl Deployment<Destroying> {
    /// Transition to the destroyed state. The state blob is cleared.
    #[must_use]
    pub fn destroyed(self, output: String) -> Deployment<Destroyed> {
        self.transition_with(None, |data| {
            let summary = ChangeSummary {
                destroy: data.resources.len(),
                ..ChangeSummary::default()
            };
            finish_operation(data, OperationStatus::Succeeded, Some(0), Some(summary));
            data.state_blob = StateBlob::empty();
            data.resources.clear();
            data.outputs.clear();
            data.last_output = output;
        })
    }
}

impl Deployment<Errored> {
    /// Why the deployment is in error.
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        self.data.failure.as_ref()
    }

    /// The operation that failed.
    #[must_use]
    pub fn failed_operation(&self) -> Option<Operation> {
        self.data.failure.as_ref().map(|f| f.operation)
    }

    fn check_retry(&self, operation: Operation, to: &'static str) -> ControlResult<()> {
        if self.failed_operation() == Some(operation) {
            Ok(())
        } else {
            Err(ControlError::InvalidStateTransition {
                from: Errored::name(),
                to,
            })
        }
    }

    /// Retry a failed plan.
    pub fn retry_plan(self) -> ControlResult<Deployment<Planning>> {
        self.check_retry(Operation::Plan, Planning::name())?;
        Ok(self.begin())
    }

    /// Retry a failed apply from the recorded partial state.
    pub fn retry_apply(self) -> ControlResult<Deployment<Applying>> {
        self.check_retry(Operation::Apply, Applying::name())?;
        Ok(self.begin())
    }

    /// Retry a failed destroy from the recorded remaining state.
    pub fn retry_destroy(self) -> ControlResult<Deployment<Destroying>> {
        self.check_retry(Operation::Destroy, Destroying::name())?;
        Ok(self.begin())
    }

    /// Replace the supplied variables. Only allowed after a failed plan.
    pub fn set_variables(&mut self, variables: Variables) -> ControlResult<()> {
        self.check_retry(Operation::Plan, Planned::name())?;
        self.data.variables = variables;
        self.data.updated_at = Utc::now();
        Ok(())
    }
}

// =============================================================================
// Loading from persisted state
// =============================================================================

/// A type-erased deployment that can be in any state.
///
/// This is used when loading from storage where the state is not known at
/// compile time.
#[derive(Debug)]
pub enum AnyDeployment {
    /// Deployment in planning state.
    Planning(Deployment<Planning>),
    /// Deployment in planned state.
    Planned(Deployment<Planned>),
    /// Deployment in applying state.
    Applying(Deployment<Applying>),
    /// Deployment in applied state.
    Applied(Deployment<Applied>),
    /// Deployment in destroying state.
    Destroying(Deployment<Destroying>),
    /// Deployment in destroyed state.
    Destroyed(Deployment<Destroyed>),
    /// Deployment in error state.
    Errored(Deployment<Errored>),
}

impl AnyDeployment {
    /// Create an `AnyDeployment` from a stored record.
    #[must_use]
    pub fn from_record(record: DeploymentRecord) -> Self {
        let DeploymentRecord {
            data,
            status,
            revision,
        } = record;

        fn wrap<S: DeploymentState>(data: DeploymentData, revision: u64) -> Deployment<S> {
            Deployment {
                data,
                revision,
                _state: PhantomData,
            }
        }

        match status {
            DeploymentStatus::Planning => Self::Planning(wrap(data, revision)),
            DeploymentStatus::Planned => Self::Planned(wrap(data, revision)),
            DeploymentStatus::Applying => Self::Applying(wrap(data, revision)),
            DeploymentStatus::Applied => Self::Applied(wrap(data, revision)),
            DeploymentStatus::Destroying => Self::Destroying(wrap(data, revision)),
            DeploymentStatus::Destroyed => Self::Destroyed(wrap(data, revision)),
            DeploymentStatus::Error => Self::Errored(wrap(data, revision)),
        }
    }

    /// Get a reference to the deployment data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        match self {
            Self::Planning(d) => d.data(),
            Self::Planned(d) => d.data(),
            Self::Applying(d) => d.data(),
            Self::Applied(d) => d.data(),
            Self::Destroying(d) => d.data(),
            Self::Destroyed(d) => d.data(),
            Self::Errored(d) => d.data(),
        }
    }

    /// Get the deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data().id
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> DeploymentStatus {
        match self {
            Self::Planning(_) => DeploymentStatus::Planning,
            Self::Planned(_) => DeploymentStatus::Planned,
            Self::Applying(_) => DeploymentStatus::Applying,
            Self::Applied(_) => DeploymentStatus::Applied,
            Self::Destroying(_) => DeploymentStatus::Destroying,
            Self::Destroyed(_) => DeploymentStatus::Destroyed,
            Self::Errored(_) => DeploymentStatus::Error,
        }
    }

    /// Convert back into a storable record.
    #[must_use]
    pub fn into_record(self) -> DeploymentRecord {
        match self {
            Self::Planning(d) => d.into_record(),
            Self::Planned(d) => d.into_record(),
            Self::Applying(d) => d.into_record(),
            Self::Applied(d) => d.into_record(),
            Self::Destroying(d) => d.into_record(),
            Self::Destroyed(d) => d.into_record(),
            Self::Errored(d) => d.into_record(),
        }
    }

    fn invalid(&self, to: &'static str) -> ControlError {
        ControlError::InvalidStateTransition {
            from: self.status().as_str(),
            to,
        }
    }

    /// Try to extract a planned deployment.
    pub fn try_into_planned(self) -> ControlResult<Deployment<Planned>> {
        match self {
            Self::Planned(d) => Ok(d),
            other => Err(other.invalid(Planned::name())),
        }
    }

    /// Try to extract an applied deployment.
    pub fn try_into_applied(self) -> ControlResult<Deployment<Applied>> {
        match self {
            Self::Applied(d) => Ok(d),
            other => Err(other.invalid(Applied::name())),
        }
    }

    /// Try to extract an errored deployment.
    pub fn try_into_errored(self) -> ControlResult<Deployment<Errored>> {
        match self {
            Self::Errored(d) => Ok(d),
            other => Err(other.invalid(Errored::name())),
        }
    }

    /// Start a plan: re-plan from planned, or retry a failed plan.
    pub fn begin_plan(self) -> ControlResult<Deployment<Planning>> {
        match self {
            Self::Planned(d) => Ok(d.replan()),
            Self::Errored(d) => d.retry_plan(),
            other => Err(other.invalid(Planning::name())),
        }
    }

    /// Start an apply: from planned, or retry a failed apply.
    pub fn begin_apply(self) -> ControlResult<Deployment<Applying>> {
        match self {
            Self::Planned(d) => Ok(d.start_apply()),
            Self::Errored(d) => d.retry_apply(),
            other => Err(other.invalid(Applying::name())),
        }
    }

    /// Start a destroy: from applied, or retry a failed destroy.
    pub fn begin_destroy(self) -> ControlResult<Deployment<Destroying>> {
        match self {
            Self::Applied(d) => Ok(d.start_destroy()),
            Self::Errored(d) => d.retry_destroy(),
            other => Err(other.invalid(Destroying::name())),
        }
    }

    /// Move a stranded in-flight deployment to error.
    ///
    /// Returns `None` if the deployment is not in an in-flight state.
    #[must_use]
    pub fn interrupt(self) -> Option<Deployment<Errored>> {
        match self {
            Self::Planning(d) => Some(d.interrupt()),
            Self::Applying(d) => Some(d.interrupt()),
            Self::Destroying(d) => Some(d.interrupt()),
            _ => None,
        }
    }

    /// Check if the deployment is in a terminal state (cannot transition further).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, DeploymentRequest, PlanDiff, TemplateId};
    use serde_json::json;

    fn test_data() -> DeploymentData {
        let request = DeploymentRequest::new(
            TemplateId::new("t1"),
            AccountId::new("a1"),
            Variables::from([("instance_type".to_owned(), json!("t3.micro"))]),
        );
        DeploymentData::new(DeploymentId::new("d1"), &request, 1)
    }

    fn snapshot() -> PlanSnapshot {
        PlanSnapshot {
            template_version: 1,
            inputs_digest: "abc".to_owned(),
            diff: PlanDiff::default(),
            proposed_state: StateBlob::empty(),
            planned_at: Utc::now(),
        }
    }

    fn resource_blob(n: usize) -> StateBlob {
        StateBlob::new(1, json!({ "resources": vec![json!({}); n] }))
    }

    #[test]
    fn happy_path_transitions() {
        let planning = Deployment::<Planning>::create(test_data());
        assert_eq!(planning.status(), DeploymentStatus::Planning);

        let planned = planning.planned(snapshot(), "plan ok".to_owned());
        assert_eq!(planned.status(), DeploymentStatus::Planned);
        assert!(planned.data().plan.is_some());

        let applying = planned.start_apply();
        assert_eq!(applying.status(), DeploymentStatus::Applying);

        let applied = applying.applied(
            resource_blob(1),
            vec![],
            BTreeMap::new(),
            "apply ok".to_owned(),
        );
        assert_eq!(applied.status(), DeploymentStatus::Applied);
        assert!(!applied.data().state_blob.is_empty());

        let destroyed = applied.start_destroy().destroyed("gone".to_owned());
        assert_eq!(destroyed.status(), DeploymentStatus::Destroyed);
        assert!(destroyed.data().state_blob.is_empty());

        let statuses: Vec<_> = destroyed.data().history.iter().map(|h| h.to).collect();
        assert_eq!(
            statuses,
            vec![
                DeploymentStatus::Planning,
                DeploymentStatus::Planned,
                DeploymentStatus::Applying,
                DeploymentStatus::Applied,
                DeploymentStatus::Destroying,
                DeploymentStatus::Destroyed,
            ]
        );
    }

    #[test]
    fn failed_apply_keeps_partial_state() {
        let mut applying = Deployment::<Planning>::create(test_data())
            .planned(snapshot(), String::new())
            .start_apply();
        applying.record_state(resource_blob(1));

        let errored = applying.fail(OperationStatus::Failed, "quota exceeded", Some(1));
        assert_eq!(errored.status(), DeploymentStatus::Error);
        assert_eq!(errored.failed_operation(), Some(Operation::Apply));
        assert_eq!(errored.data().state_blob, resource_blob(1));

        let failure = errored.failure().unwrap();
        assert_eq!(failure.exit_code, Some(1));
        assert!(!failure.interrupted);

        let op = errored.data().last_operation.as_ref().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn retry_only_for_failed_operation() {
        let errored = Deployment::<Planning>::create(test_data())
            .planned(snapshot(), String::new())
            .start_apply()
            .fail(OperationStatus::Failed, "boom", Some(1));

        let record = errored.into_record();

        let err = AnyDeployment::from_record(record.clone())
            .begin_destroy()
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidStateTransition {
                from: "error",
                to: "destroying"
            }
        ));
        assert!(AnyDeployment::from_record(record.clone())
            .begin_plan()
            .is_err());

        let applying = AnyDeployment::from_record(record).begin_apply().unwrap();
        assert_eq!(applying.status(), DeploymentStatus::Applying);
        assert!(applying.data().failure.is_none());
    }

    #[test]
    fn interrupt_sets_flag() {
        let applying = Deployment::<Planning>::create(test_data())
            .planned(snapshot(), String::new())
            .start_apply();
        let record = applying.into_record();

        let errored = AnyDeployment::from_record(record).interrupt().unwrap();
        let failure = errored.failure().unwrap();
        assert!(failure.interrupted);
        assert_eq!(failure.operation, Operation::Apply);
        assert_eq!(
            errored.data().last_operation.as_ref().unwrap().status,
            OperationStatus::Interrupted
        );
    }

    #[test]
    fn interrupt_ignores_settled_states() {
        let planned = Deployment::<Planning>::create(test_data()).planned(snapshot(), String::new());
        assert!(AnyDeployment::from_record(planned.into_record())
            .interrupt()
            .is_none());
    }

    #[test]
    fn applied_cannot_start_apply_or_plan() {
        let applied = Deployment::<Planning>::create(test_data())
            .planned(snapshot(), String::new())
            .start_apply()
            .applied(StateBlob::empty(), vec![], BTreeMap::new(), String::new());
        let record = applied.into_record();

        assert!(AnyDeployment::from_record(record.clone())
            .begin_apply()
            .is_err());
        assert!(AnyDeployment::from_record(record).begin_plan().is_err());
    }

    #[test]
    fn destroyed_is_terminal() {
        let destroyed = Deployment::<Planning>::create(test_data())
            .planned(snapshot(), String::new())
            .start_apply()
            .applied(resource_blob(1), vec![], BTreeMap::new(), String::new())
            .start_destroy()
            .destroyed(String::new());
        let any = AnyDeployment::from_record(destroyed.into_record());
        assert!(any.is_terminal());
        assert!(any.begin_destroy().is_err());
    }

    #[test]
    fn set_variables_after_failed_plan_only() {
        let mut errored = Deployment::<Planning>::create(test_data()).fail(
            OperationStatus::Failed,
            "missing variable",
            None,
        );
        errored
            .set_variables(Variables::from([("instance_type".to_owned(), json!("t3.small"))]))
            .unwrap();
        assert_eq!(errored.data().variables["instance_type"], "t3.small");

        let mut apply_failed = Deployment::<Planning>::create(test_data())
            .planned(snapshot(), String::new())
            .start_apply()
            .fail(OperationStatus::Failed, "boom", Some(1));
        assert!(apply_failed.set_variables(Variables::new()).is_err());
    }

    #[test]
    fn record_round_trip_preserves_revision() {
        let mut planning = Deployment::<Planning>::create(test_data());
        planning.set_revision(7);

        let any = AnyDeployment::from_record(planning.into_record());
        assert_eq!(any.status(), DeploymentStatus::Planning);
        assert_eq!(any.into_record().revision, 7);
    }
}
