//! Integration tests for failed, cancelled and timed out operations.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::fixtures::{request, state_resources, INSTANCE_AND_BUCKET, SINGLE_INSTANCE};
use common::TestControl;
use strata_control::engine::{
    ApplyOutcome, DestroyOutcome, EngineRequest, PlanOutcome, ProgressSink,
};
use strata_control::types::{Operation, OperationStatus};
use strata_control::{
    ControlError, ControlResult, DeploymentId, DeploymentStatus, MockEngine, OperationOptions,
    ProvisioningEngine,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

async fn planned(control: &TestControl) -> DeploymentId {
    control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap()
        .data
        .id
}

#[tokio::test]
async fn failed_plan_is_recorded_and_retryable() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;
    control.engine.set_plan_exit_code(1).unwrap();

    let id = DeploymentId::new("d1");
    let err = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro").with_id(id.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Provisioning { exit_code: 1, .. }));

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Error);
    assert!(record.data.last_output.contains("mock plan failure"));
    let failure = record.data.failure.unwrap();
    assert_eq!(failure.operation, Operation::Plan);
    assert_eq!(failure.exit_code, Some(1));

    // Only the failed operation can be retried.
    let err = control.orchestrator.apply(&id).await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidStateTransition { .. }));

    control.engine.set_plan_exit_code(0).unwrap();
    let retried = control.orchestrator.plan(&id).await.unwrap();
    assert_eq!(retried.status, DeploymentStatus::Planned);
    assert!(retried.data.failure.is_none());
}

#[tokio::test]
async fn partial_apply_keeps_created_resources_and_retry_resumes() {
    let control = TestControl::new();
    control.seed(INSTANCE_AND_BUCKET).await;
    let id = planned(&control).await;

    control.engine.fail_apply_after(Some(1)).unwrap();
    let err = control.orchestrator.apply(&id).await.unwrap_err();
    assert!(matches!(err, ControlError::Provisioning { exit_code: 1, .. }));

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Error);
    assert_eq!(state_resources(&record.data.state_blob), 1);
    assert!(record.data.last_output.contains("mock provider failure"));
    let op = record.data.last_operation.unwrap();
    assert_eq!(op.operation, Operation::Apply);
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.exit_code, Some(1));

    // The retry starts from the recorded state and only creates what is
    // missing.
    control.engine.fail_apply_after(None).unwrap();
    let applied = control.orchestrator.apply(&id).await.unwrap();
    assert_eq!(applied.status, DeploymentStatus::Applied);
    assert_eq!(applied.data.resources.len(), 2);
    assert_eq!(
        control.engine.created().unwrap(),
        vec!["aws_instance.web", "aws_s3_bucket.assets"]
    );
}

#[tokio::test]
async fn partial_destroy_keeps_remaining_resources() {
    let control = TestControl::new();
    control.seed(INSTANCE_AND_BUCKET).await;
    let id = planned(&control).await;
    control.orchestrator.apply(&id).await.unwrap();

    control.engine.fail_destroy_after(Some(1)).unwrap();
    let err = control.orchestrator.destroy(&id).await.unwrap_err();
    assert!(matches!(err, ControlError::Provisioning { .. }));

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Error);
    assert_eq!(state_resources(&record.data.state_blob), 1);
    assert_eq!(record.data.failure.unwrap().operation, Operation::Destroy);

    let err = control.orchestrator.apply(&id).await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidStateTransition { .. }));

    control.engine.fail_destroy_after(None).unwrap();
    let destroyed = control.orchestrator.destroy(&id).await.unwrap();
    assert_eq!(destroyed.status, DeploymentStatus::Destroyed);
    assert!(destroyed.data.state_blob.is_empty());
    assert_eq!(control.engine.destroy_calls(), 2);
}

#[tokio::test]
async fn cancel_stops_apply_and_keeps_progress() {
    let control = TestControl::new();
    control.seed(INSTANCE_AND_BUCKET).await;
    let id = planned(&control).await;

    control.engine.hold_after(Some(1)).unwrap();
    let task = {
        let orchestrator = control.orchestrator.clone();
        let id = id.clone();
        tokio::spawn(async move { orchestrator.apply(&id).await })
    };

    control.engine.wait_until_held().await;
    control.orchestrator.cancel(&id).unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ControlError::Cancelled(_)));

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Error);
    assert_eq!(state_resources(&record.data.state_blob), 1);
    assert_eq!(
        record.data.last_operation.unwrap().status,
        OperationStatus::Cancelled
    );
    assert!(!control.orchestrator.locks().is_locked(&id));

    control.engine.hold_after(None).unwrap();
    let applied = control.orchestrator.apply(&id).await.unwrap();
    assert_eq!(applied.data.resources.len(), 2);
    assert_eq!(
        control.engine.created().unwrap(),
        vec!["aws_instance.web", "aws_s3_bucket.assets"]
    );
}

#[tokio::test]
async fn cancel_without_an_operation_in_flight() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;
    let id = planned(&control).await;

    let err = control.orchestrator.cancel(&id).unwrap_err();
    assert!(matches!(err, ControlError::NotInFlight(_)));
}

#[tokio::test]
async fn deadline_cancels_a_stuck_apply() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;
    let id = planned(&control).await;

    control.engine.hold_after(Some(0)).unwrap();
    let err = control
        .orchestrator
        .apply_with(&id, OperationOptions::with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::TimedOut(_)));

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Error);
    assert_eq!(
        record.data.last_operation.unwrap().status,
        OperationStatus::TimedOut
    );
    assert!(record.data.state_blob.is_empty());
}

#[tokio::test]
async fn dropping_the_caller_does_not_strand_the_deployment() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;
    let id = planned(&control).await;

    control.engine.hold_after(Some(0)).unwrap();
    let caller = {
        let orchestrator = control.orchestrator.clone();
        let id = id.clone();
        tokio::spawn(async move { orchestrator.apply(&id).await })
    };
    control.engine.wait_until_held().await;
    caller.abort();

    control.engine.release();
    tokio::time::timeout(Duration::from_secs(5), async {
        while control.orchestrator.locks().is_locked(&id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Applied);
}

/// Plans like the mock, but never returns from apply or destroy and never
/// looks at its cancellation token.
#[derive(Default)]
struct UnresponsiveEngine {
    planner: MockEngine,
    started: Notify,
    dropped: Arc<AtomicBool>,
}

/// Flags the in-flight call as gone when its future is dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl UnresponsiveEngine {
    async fn hang<T>(&self) -> ControlResult<T> {
        let _flag = DropFlag(self.dropped.clone());
        self.started.notify_one();
        std::future::pending().await
    }

    /// Wait until the orchestrator has let go of the deployment and the
    /// engine call has been torn down.
    async fn wait_released(&self, control: &TestControl, id: &DeploymentId) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while control.orchestrator.locks().is_locked(id)
                || !self.dropped.load(Ordering::SeqCst)
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl ProvisioningEngine for UnresponsiveEngine {
    fn name(&self) -> &'static str {
        "unresponsive"
    }

    async fn plan(
        &self,
        request: EngineRequest,
        cancel: CancellationToken,
    ) -> ControlResult<PlanOutcome> {
        self.planner.plan(request, cancel).await
    }

    async fn apply(
        &self,
        _request: EngineRequest,
        _progress: ProgressSink,
        _cancel: CancellationToken,
    ) -> ControlResult<ApplyOutcome> {
        self.hang().await
    }

    async fn destroy(
        &self,
        _request: EngineRequest,
        _progress: ProgressSink,
        _cancel: CancellationToken,
    ) -> ControlResult<DestroyOutcome> {
        self.hang().await
    }
}

fn with_unresponsive_engine() -> (TestControl, Arc<UnresponsiveEngine>) {
    let engine = Arc::new(UnresponsiveEngine::default());
    let control = TestControl::builder()
        .engine(engine.clone() as Arc<dyn ProvisioningEngine>)
        .build();
    (control, engine)
}

#[tokio::test]
async fn engine_ignoring_the_deadline_is_aborted() {
    let (control, engine) = with_unresponsive_engine();
    control.seed(SINGLE_INSTANCE).await;
    let id = planned(&control).await;

    // fast_config gives a 200ms grace period after the deadline.
    let started = tokio::time::Instant::now();
    let err = control
        .orchestrator
        .apply_with(&id, OperationOptions::with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::TimedOut(_)));
    assert!(started.elapsed() < Duration::from_secs(5));

    engine.wait_released(&control, &id).await;

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Error);
    let op = record.data.last_operation.unwrap();
    assert_eq!(op.operation, Operation::Apply);
    assert_eq!(op.status, OperationStatus::TimedOut);
}

#[tokio::test]
async fn engine_ignoring_cancel_is_aborted() {
    let (control, engine) = with_unresponsive_engine();
    control.seed(SINGLE_INSTANCE).await;
    let id = planned(&control).await;

    let task = {
        let orchestrator = control.orchestrator.clone();
        let id = id.clone();
        tokio::spawn(async move { orchestrator.apply(&id).await })
    };
    engine.started.notified().await;
    control.orchestrator.cancel(&id).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ControlError::Cancelled(_)));
    engine.wait_released(&control, &id).await;

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Error);
    assert_eq!(
        record.data.last_operation.unwrap().status,
        OperationStatus::Cancelled
    );
}
