//! Provisioning engines.
//!
//! An engine converges real infrastructure towards a rendered template. The
//! orchestrator treats the engine's state as an opaque [`StateBlob`]: it
//! hands back whatever the engine produced last time and persists whatever
//! the engine reports, including intermediate snapshots sent through a
//! [`ProgressSink`] while an apply or destroy is running.
//!
//! A non-zero exit code is reported in the outcome rather than as an error.
//! `Err` is reserved for the engine not running at all, or for cancellation.

mod mock;
mod terraform;

pub use mock::MockEngine;
pub use terraform::TerraformEngine;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::accounts::ProviderCredentials;
use crate::config::{EngineConfig, EngineKind};
use crate::error::ControlResult;
use crate::templates::RenderedTemplate;
use crate::types::{DeploymentId, PlanDiff, ResourceSummary, StateBlob};

/// Engine output kept on a deployment record is capped at this many bytes.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Everything an engine needs for one operation.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Deployment being operated on.
    pub deployment_id: DeploymentId,
    /// Template bound to validated variables.
    pub rendered: RenderedTemplate,
    /// Decrypted account credentials.
    pub credentials: ProviderCredentials,
    /// State from the previous operation (empty for a new deployment).
    pub state: StateBlob,
}

/// Result of a dry run.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Proposed changes.
    pub diff: PlanDiff,
    /// State the engine expects to hold after applying.
    pub proposed_state: StateBlob,
    /// Engine exit code.
    pub exit_code: i32,
    /// Captured engine output.
    pub output: String,
}

/// Result of an apply.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// State after the apply, partial if the engine failed.
    pub state: StateBlob,
    /// Resources the state describes.
    pub resources: Vec<ResourceSummary>,
    /// Named outputs.
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Engine exit code.
    pub exit_code: i32,
    /// Captured engine output.
    pub output: String,
}

/// Result of a destroy.
#[derive(Debug, Clone)]
pub struct DestroyOutcome {
    /// State describing whatever was not torn down.
    pub remaining_state: StateBlob,
    /// Number of resources still present.
    pub remaining_resources: usize,
    /// Engine exit code.
    pub exit_code: i32,
    /// Captured engine output.
    pub output: String,
}

/// An intermediate state snapshot reported while an operation runs.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// State as of this point.
    pub state: StateBlob,
    /// Short description, e.g. the resource just created.
    pub message: String,
}

/// Channel an engine reports progress through.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressSink {
    /// Create a sink and the receiver the orchestrator drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Report a state snapshot.
    ///
    /// Waits for the receiver to accept it, so a snapshot is never dropped
    /// while the orchestrator is still listening.
    pub async fn report(&self, state: StateBlob, message: impl Into<String>) {
        let update = ProgressUpdate {
            state,
            message: message.into(),
        };
        if self.tx.send(update).await.is_err() {
            debug!("progress receiver closed; update dropped");
        }
    }
}

/// An infrastructure-as-code executor.
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Compute the changes applying would make, without side effects.
    async fn plan(
        &self,
        request: EngineRequest,
        cancel: CancellationToken,
    ) -> ControlResult<PlanOutcome>;

    /// Converge infrastructure to the rendered template.
    async fn apply(
        &self,
        request: EngineRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> ControlResult<ApplyOutcome>;

    /// Tear down everything recorded in the request's state.
    async fn destroy(
        &self,
        request: EngineRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> ControlResult<DestroyOutcome>;
}

/// Create an engine from configuration.
pub fn create_engine(config: &EngineConfig) -> ControlResult<Arc<dyn ProvisioningEngine>> {
    match config.kind {
        EngineKind::Terraform => Ok(Arc::new(TerraformEngine::new(config)?)),
        EngineKind::Mock => Ok(Arc::new(MockEngine::new())),
    }
}

/// Keep the last `max` bytes of engine output.
///
/// Failures are reported at the end of the output, so the tail is the part
/// worth keeping.
#[must_use]
pub fn truncate_output(output: String, max: usize) -> String {
    if output.len() <= max {
        return output;
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("[... output truncated ...]\n{}", &output[start..])
}
