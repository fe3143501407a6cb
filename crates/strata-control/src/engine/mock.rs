//! Scriptable in-process engine for tests and dry runs.
//!
//! Resources are the `resource "<type>" "<name>"` blocks of the template
//! body; each one's attributes are the resolved variables. State is kept as
//! `{"resources": [{"address", "type", "attributes"}]}` and only resources
//! missing from the incoming state are created, so a retried apply picks up
//! where the failed one stopped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::types::{ChangeAction, PlanDiff, ResourceChange, ResourceSummary, StateBlob};

use super::{
    ApplyOutcome, DestroyOutcome, EngineRequest, PlanOutcome, ProgressSink, ProvisioningEngine,
};

/// State schema version written by this engine.
pub const MOCK_STATE_SCHEMA: u32 = 1;

static RESOURCE_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"resource\s+"([^"]+)"\s+"([^"]+)""#).ok());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MockResource {
    address: String,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    attributes: Value,
}

impl MockResource {
    fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            address: self.address.clone(),
            resource_type: self.resource_type.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MockState {
    #[serde(default)]
    resources: Vec<MockResource>,
}

impl MockState {
    fn from_blob(blob: &StateBlob) -> ControlResult<Self> {
        if blob.is_empty() {
            return Ok(Self::default());
        }
        if blob.schema_version != MOCK_STATE_SCHEMA {
            return Err(ControlError::engine(format!(
                "unsupported state schema version {}",
                blob.schema_version
            )));
        }
        serde_json::from_value(blob.payload.clone())
            .map_err(|e| ControlError::engine(format!("malformed state: {e}")))
    }

    fn to_blob(&self) -> StateBlob {
        StateBlob::new(MOCK_STATE_SCHEMA, json!({ "resources": self.resources }))
    }

    fn find(&self, address: &str) -> Option<&MockResource> {
        self.resources.iter().find(|r| r.address == address)
    }
}

#[derive(Debug, Default)]
struct Script {
    plan_exit_code: i32,
    fail_apply_after: Option<usize>,
    fail_destroy_after: Option<usize>,
    hold_after: Option<usize>,
}

/// Scriptable engine that provisions nothing real.
///
/// Failure and hold points are set through `&self`, so a test can change the
/// script between an operation and its retry.
#[derive(Debug, Default)]
pub struct MockEngine {
    script: Mutex<Script>,
    created: Mutex<Vec<String>>,
    release: Notify,
    held: Notify,
    plan_calls: AtomicUsize,
    apply_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
}

impl MockEngine {
    /// Create an engine that succeeds at everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> ControlResult<MutexGuard<'_, Script>> {
        self.script
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    /// Make plans exit with `code` (0 restores success).
    pub fn set_plan_exit_code(&self, code: i32) -> ControlResult<()> {
        self.script()?.plan_exit_code = code;
        Ok(())
    }

    /// Make applies exit 1 after creating `count` resources.
    pub fn fail_apply_after(&self, count: Option<usize>) -> ControlResult<()> {
        self.script()?.fail_apply_after = count;
        Ok(())
    }

    /// Make destroys exit 1 after removing `count` resources.
    pub fn fail_destroy_after(&self, count: Option<usize>) -> ControlResult<()> {
        self.script()?.fail_destroy_after = count;
        Ok(())
    }

    /// Make applies and destroys stop after `count` resources until
    /// [`release`](Self::release) is called or the operation is cancelled.
    pub fn hold_after(&self, count: Option<usize>) -> ControlResult<()> {
        self.script()?.hold_after = count;
        Ok(())
    }

    /// Let a held operation continue.
    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Wait until an operation reaches its hold point.
    pub async fn wait_until_held(&self) {
        self.held.notified().await;
    }

    /// Addresses created across every apply, in order.
    pub fn created(&self) -> ControlResult<Vec<String>> {
        self.created
            .lock()
            .map(|c| c.clone())
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    /// Number of plan calls.
    #[must_use]
    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    /// Number of apply calls.
    #[must_use]
    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Number of destroy calls.
    #[must_use]
    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    fn desired(request: &EngineRequest) -> ControlResult<Vec<MockResource>> {
        let pattern = RESOURCE_BLOCK
            .as_ref()
            .ok_or_else(|| ControlError::internal("resource pattern failed to compile"))?;

        let attributes = Value::Object(
            request
                .rendered
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        Ok(pattern
            .captures_iter(&request.rendered.body)
            .map(|c| MockResource {
                address: format!("{}.{}", &c[1], &c[2]),
                resource_type: c[1].to_owned(),
                attributes: attributes.clone(),
            })
            .collect())
    }

    /// Block at the hold point if one is set for `done`.
    async fn maybe_hold(
        &self,
        done: usize,
        request: &EngineRequest,
        cancel: &CancellationToken,
    ) -> ControlResult<()> {
        if self.script()?.hold_after != Some(done) {
            return Ok(());
        }

        debug!(deployment_id = %request.deployment_id, done, "mock engine holding");
        self.held.notify_one();
        tokio::select! {
            () = self.release.notified() => Ok(()),
            () = cancel.cancelled() => {
                Err(ControlError::Cancelled(request.deployment_id.to_string()))
            }
        }
    }
}

#[async_trait]
impl ProvisioningEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn plan(
        &self,
        request: EngineRequest,
        cancel: CancellationToken,
    ) -> ControlResult<PlanOutcome> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(ControlError::Cancelled(request.deployment_id.to_string()));
        }

        let exit_code = self.script()?.plan_exit_code;
        if exit_code != 0 {
            return Ok(PlanOutcome {
                diff: PlanDiff::default(),
                proposed_state: request.state,
                exit_code,
                output: "Error: mock plan failure".to_owned(),
            });
        }

        let current = MockState::from_blob(&request.state)?;
        let desired = Self::desired(&request)?;

        let mut changes = Vec::new();
        for resource in &desired {
            let action = match current.find(&resource.address) {
                None => Some(ChangeAction::Create),
                Some(existing) if existing.attributes != resource.attributes => {
                    Some(ChangeAction::Update)
                }
                Some(_) => None,
            };
            if let Some(action) = action {
                changes.push(ResourceChange {
                    address: resource.address.clone(),
                    resource_type: resource.resource_type.clone(),
                    action,
                    attributes: resource.attributes.clone(),
                });
            }
        }
        for resource in &current.resources {
            if !desired.iter().any(|d| d.address == resource.address) {
                changes.push(ResourceChange {
                    address: resource.address.clone(),
                    resource_type: resource.resource_type.clone(),
                    action: ChangeAction::Delete,
                    attributes: Value::Null,
                });
            }
        }

        let diff = PlanDiff::from_changes(changes);
        let output = format!(
            "Plan: {} to add, {} to change, {} to destroy.",
            diff.add, diff.change, diff.destroy
        );
        let proposed_state = MockState { resources: desired }.to_blob();

        Ok(PlanOutcome {
            diff,
            proposed_state,
            exit_code: 0,
            output,
        })
    }

    async fn apply(
        &self,
        request: EngineRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> ControlResult<ApplyOutcome> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = MockState::from_blob(&request.state)?;
        let desired = Self::desired(&request)?;
        let fail_after = self.script()?.fail_apply_after;

        let mut log = Vec::new();
        let mut done = 0;

        for resource in &desired {
            if state.find(&resource.address) == Some(resource) {
                continue;
            }

            self.maybe_hold(done, &request, &cancel).await?;
            if cancel.is_cancelled() {
                return Err(ControlError::Cancelled(request.deployment_id.to_string()));
            }

            if fail_after == Some(done) {
                log.push(format!("{}: Creating...", resource.address));
                log.push(format!(
                    "Error: creating {}: mock provider failure",
                    resource.address
                ));
                return Ok(ApplyOutcome {
                    resources: state.resources.iter().map(MockResource::summary).collect(),
                    state: state.to_blob(),
                    outputs: BTreeMap::new(),
                    exit_code: 1,
                    output: log.join("\n"),
                });
            }

            state.resources.retain(|r| r.address != resource.address);
            state.resources.push(resource.clone());
            self.created
                .lock()
                .map_err(|_| ControlError::internal("lock poisoned"))?
                .push(resource.address.clone());
            done += 1;

            let line = format!("{}: Creation complete", resource.address);
            progress.report(state.to_blob(), line.clone()).await;
            log.push(line);
        }

        let before = state.resources.len();
        state
            .resources
            .retain(|r| desired.iter().any(|d| d.address == r.address));
        let removed = before - state.resources.len();
        if removed > 0 {
            progress
                .report(state.to_blob(), format!("{removed} resource(s) removed"))
                .await;
        }

        log.push(format!(
            "Apply complete! Resources: {done} added, 0 changed, {removed} destroyed."
        ));

        let outputs = BTreeMap::from([(
            "resource_addresses".to_owned(),
            json!(state
                .resources
                .iter()
                .map(|r| r.address.as_str())
                .collect::<Vec<_>>()),
        )]);

        Ok(ApplyOutcome {
            resources: state.resources.iter().map(MockResource::summary).collect(),
            state: state.to_blob(),
            outputs,
            exit_code: 0,
            output: log.join("\n"),
        })
    }

    async fn destroy(
        &self,
        request: EngineRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> ControlResult<DestroyOutcome> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = MockState::from_blob(&request.state)?;
        let fail_after = self.script()?.fail_destroy_after;

        let mut log = Vec::new();
        let mut done = 0;

        while let Some(resource) = state.resources.last().cloned() {
            self.maybe_hold(done, &request, &cancel).await?;
            if cancel.is_cancelled() {
                return Err(ControlError::Cancelled(request.deployment_id.to_string()));
            }

            if fail_after == Some(done) {
                log.push(format!(
                    "Error: deleting {}: mock provider failure",
                    resource.address
                ));
                return Ok(DestroyOutcome {
                    remaining_resources: state.resources.len(),
                    remaining_state: state.to_blob(),
                    exit_code: 1,
                    output: log.join("\n"),
                });
            }

            state.resources.pop();
            done += 1;

            let line = format!("{}: Destruction complete", resource.address);
            progress.report(state.to_blob(), line.clone()).await;
            log.push(line);
        }

        log.push(format!("Destroy complete! Resources: {done} destroyed."));

        Ok(DestroyOutcome {
            remaining_state: StateBlob::empty(),
            remaining_resources: 0,
            exit_code: 0,
            output: log.join("\n"),
        })
    }
}
