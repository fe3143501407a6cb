//! Core deployment orchestration logic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::accounts::{AccountRegistry, ProviderCredentials};
use crate::config::{CostConfig, EngineConfig};
use crate::cost::{CostEstimator, CostSubject};
use crate::engine::{
    truncate_output, EngineRequest, ProgressSink, ProgressUpdate, ProvisioningEngine,
    MAX_OUTPUT_BYTES,
};
use crate::error::{ControlError, ControlResult};
use crate::state::{AnyDeployment, Applied, Deployment, DeploymentState, InFlight, Planning};
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::templates::{render, resolve_variables, RenderedTemplate, TemplateRegistry};
use crate::types::{
    AccountId, CostEstimate, DeploymentData, DeploymentId, DeploymentRecord, DeploymentRequest,
    Operation, OperationStatus, PlanSnapshot, Template, Variables,
};

use super::locks::{LockGuard, LockTable};

/// Progress snapshots buffered between an engine and the orchestrator.
const PROGRESS_BUFFER: usize = 16;

/// Timing policy for engine calls.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Default deadline for one plan, apply or destroy.
    pub operation_timeout: Duration,
    /// How long a cancelled engine call may take to stop before its task is
    /// aborted.
    pub cancel_grace: Duration,
    /// Upper bound on one cost estimate.
    pub cost_timeout: Duration,
}

impl OrchestratorConfig {
    /// Build from the engine and cost configuration sections.
    #[must_use]
    pub const fn from_config(engine: &EngineConfig, cost: &CostConfig) -> Self {
        Self {
            operation_timeout: Duration::from_secs(engine.timeout_secs),
            cancel_grace: Duration::from_secs(engine.cancel_grace_secs),
            cost_timeout: Duration::from_secs(cost.timeout_secs),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default(), &CostConfig::default())
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationOptions {
    /// Deadline for this call instead of the configured default.
    pub timeout: Option<Duration>,
}

impl OperationOptions {
    /// Use `timeout` as the deadline.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// What the startup recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Deployments moved from a transient status to error.
    pub interrupted: Vec<DeploymentId>,
    /// Deployments left alone because an operation in this process holds
    /// them.
    pub skipped: Vec<DeploymentId>,
}

/// Drives deployments through plan, apply and destroy.
///
/// Every operation takes the deployment's lock before loading it and keeps
/// it until the final status is persisted. The engine call runs on its own
/// task; the operation itself runs detached from the caller, so dropping the
/// returned future never strands a deployment mid-transition.
#[derive(Clone)]
pub struct DeploymentOrchestrator {
    store: Arc<dyn DeploymentStore>,
    templates: TemplateRegistry,
    accounts: AccountRegistry,
    engine: Arc<dyn ProvisioningEngine>,
    estimator: Option<Arc<dyn CostEstimator>>,
    locks: LockTable,
    config: OrchestratorConfig,
}

impl DeploymentOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        templates: TemplateRegistry,
        accounts: AccountRegistry,
        engine: Arc<dyn ProvisioningEngine>,
        estimator: Option<Arc<dyn CostEstimator>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            templates,
            accounts,
            engine,
            estimator,
            locks: LockTable::new(),
            config,
        }
    }

    /// The lock table, for inspecting in-flight operations.
    #[must_use]
    pub const fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Create a deployment and run its first plan.
    pub async fn plan_new(&self, request: DeploymentRequest) -> ControlResult<DeploymentRecord> {
        self.plan_new_with(request, OperationOptions::default())
            .await
    }

    /// [`plan_new`](Self::plan_new) with per-call options.
    #[instrument(skip_all, fields(template_id = %request.template_id, account_id = %request.account_id))]
    pub async fn plan_new_with(
        &self,
        request: DeploymentRequest,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        let id = request.id.clone().unwrap_or_else(DeploymentId::generate);
        let guard = self.locks.try_lock(&id, Operation::Plan.as_str())?;
        let this = self.clone();
        detached(async move { this.create_and_plan(guard, request, options).await }).await
    }

    /// Plan an existing deployment again: from planned, or after a failed
    /// plan.
    pub async fn plan(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.plan_with(id, OperationOptions::default()).await
    }

    /// [`plan`](Self::plan) with per-call options.
    #[instrument(skip_all, fields(deployment_id = %id))]
    pub async fn plan_with(
        &self,
        id: &DeploymentId,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        let guard = self.locks.try_lock(id, Operation::Plan.as_str())?;
        let this = self.clone();
        detached(async move { this.replan(guard, options).await }).await
    }

    /// Apply the stored plan: from planned, or after a failed apply.
    ///
    /// On an applied deployment whose inputs match the plan this is a no-op.
    pub async fn apply(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.apply_with(id, OperationOptions::default()).await
    }

    /// [`apply`](Self::apply) with per-call options.
    #[instrument(skip_all, fields(deployment_id = %id))]
    pub async fn apply_with(
        &self,
        id: &DeploymentId,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        let guard = self.locks.try_lock(id, Operation::Apply.as_str())?;
        let this = self.clone();
        detached(async move { this.run_apply(guard, options).await }).await
    }

    /// Tear down a deployment: from applied, or after a failed destroy.
    pub async fn destroy(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.destroy_with(id, OperationOptions::default()).await
    }

    /// [`destroy`](Self::destroy) with per-call options.
    #[instrument(skip_all, fields(deployment_id = %id))]
    pub async fn destroy_with(
        &self,
        id: &DeploymentId,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        let guard = self.locks.try_lock(id, Operation::Destroy.as_str())?;
        let this = self.clone();
        detached(async move { this.run_destroy(guard, options).await }).await
    }

    /// Replace a deployment's variables.
    ///
    /// Allowed on planned deployments and after a failed plan. A planned
    /// deployment's plan becomes stale and must be re-planned before apply.
    #[instrument(skip_all, fields(deployment_id = %id))]
    pub async fn update_variables(
        &self,
        id: &DeploymentId,
        variables: Variables,
    ) -> ControlResult<DeploymentRecord> {
        let _guard = self.locks.try_lock(id, "variable update")?;

        let record = match self.load(id).await? {
            AnyDeployment::Planned(mut planned) => {
                self.validate_variables(planned.data(), &variables).await?;
                planned.set_variables(variables);
                self.save(&mut planned).await?;
                planned.into_record()
            }
            AnyDeployment::Errored(mut errored) => {
                self.validate_variables(errored.data(), &variables).await?;
                errored.set_variables(variables)?;
                self.save(&mut errored).await?;
                errored.into_record()
            }
            other => {
                return Err(ControlError::InvalidStateTransition {
                    from: other.status().as_str(),
                    to: "planned",
                })
            }
        };

        info!(deployment_id = %id, "variables updated");
        Ok(record)
    }

    /// Ask the in-flight operation on `id` to stop.
    ///
    /// The operation persists whatever state the engine reported, then moves
    /// the deployment to error.
    pub fn cancel(&self, id: &DeploymentId) -> ControlResult<()> {
        if self.locks.cancel(id) {
            info!(deployment_id = %id, "cancellation requested");
            Ok(())
        } else {
            Err(ControlError::NotInFlight(id.to_string()))
        }
    }

    /// Move deployments a previous process left in a transient status to
    /// error, keeping their state blobs.
    ///
    /// Run once at startup, before accepting operations.
    pub async fn recover(&self) -> ControlResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for id in self.store.recover_incomplete().await? {
            let Ok(_guard) = self.locks.try_lock(&id, "recovery") else {
                report.skipped.push(id);
                continue;
            };

            // The status may have moved on since the listing.
            let Some(mut errored) = self.load(&id).await?.interrupt() else {
                continue;
            };
            self.save(&mut errored).await?;

            warn!(
                deployment_id = %id,
                operation = ?errored.failed_operation(),
                state_digest = %errored.data().state_blob.digest(),
                "marked interrupted deployment as error"
            );
            report.interrupted.push(id);
        }

        info!(
            interrupted = report.interrupted.len(),
            skipped = report.skipped.len(),
            "recovery pass complete"
        );
        Ok(report)
    }

    /// Get a deployment.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))
    }

    /// List deployments, newest first.
    pub async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        self.store.list(filter).await
    }

    // -------------------------------------------------------------------------
    // Operations (run with the lock held, on a detached task)
    // -------------------------------------------------------------------------

    async fn create_and_plan(
        &self,
        guard: LockGuard,
        request: DeploymentRequest,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        let template = self
            .templates
            .get(&request.template_id, request.template_version)
            .await?;
        let credentials = self.credentials_for(&request.account_id).await?;

        let data = DeploymentData::new(guard.id().clone(), &request, template.version);
        let planning = Deployment::<Planning>::create(data);
        self.store.insert(&planning.to_record()).await?;

        info!(
            deployment_id = %planning.id(),
            template = %template.reference(),
            account_id = %request.account_id,
            "deployment created"
        );

        self.plan_rendered(planning, &template, credentials, &guard, options)
            .await
    }

    async fn replan(
        &self,
        guard: LockGuard,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        let mut planning = self.load(guard.id()).await?.begin_plan()?;
        let template = self.template_for(planning.data()).await?;
        let credentials = self.credentials_for(&planning.data().account_id).await?;

        self.save(&mut planning).await?;
        self.plan_rendered(planning, &template, credentials, &guard, options)
            .await
    }

    async fn plan_rendered(
        &self,
        mut planning: Deployment<Planning>,
        template: &Template,
        credentials: ProviderCredentials,
        guard: &LockGuard,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        // Bad variables are recorded as a failed plan; the engine never runs.
        let rendered = match render(template, &planning.data().variables) {
            Ok(rendered) => rendered,
            Err(e) => return self.fail(planning, e).await,
        };
        let inputs_digest = rendered.inputs_digest();
        let template_version = rendered.template_version;

        info!(deployment_id = %planning.id(), engine = self.engine.name(), "plan started");

        let request = engine_request(planning.data(), rendered, credentials);
        let engine = Arc::clone(&self.engine);
        let token = guard.token().clone();
        let worker = tokio::spawn(async move { engine.plan(request, token).await });

        let outcome = match self
            .drive(&mut planning, worker, None, guard.token(), self.timeout(options))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(planning, e).await,
        };

        let output = truncate_output(outcome.output, MAX_OUTPUT_BYTES);
        if outcome.exit_code != 0 {
            planning.record_output(output.clone());
            let error = ControlError::Provisioning {
                exit_code: outcome.exit_code,
                output,
            };
            return self.fail(planning, error).await;
        }

        let snapshot = PlanSnapshot {
            template_version,
            inputs_digest,
            diff: outcome.diff,
            proposed_state: outcome.proposed_state,
            planned_at: Utc::now(),
        };
        let mut planned = planning.planned(snapshot, output);
        self.save(&mut planned).await?;

        let summary = planned
            .data()
            .plan
            .as_ref()
            .map(|p| p.diff.summary())
            .unwrap_or_default();
        info!(
            deployment_id = %planned.id(),
            add = summary.add,
            change = summary.change,
            destroy = summary.destroy,
            "plan complete"
        );

        let estimate = match planned.data().plan.as_ref() {
            Some(plan) => {
                self.estimate(planned.id(), CostSubject::Plan(&plan.diff))
                    .await
            }
            None => None,
        };
        if let Some(estimate) = estimate {
            planned.set_cost_estimate(estimate);
            self.save(&mut planned).await?;
        }

        Ok(planned.into_record())
    }

    async fn run_apply(
        &self,
        guard: LockGuard,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        let mut applying = match self.load(guard.id()).await? {
            AnyDeployment::Applied(applied) => return self.reconfirm(applied).await,
            other => other.begin_apply()?,
        };

        let template = self.template_for(applying.data()).await?;
        let rendered = render(&template, &applying.data().variables)?;
        ensure_plan_current(applying.data(), &rendered)?;
        let credentials = self.credentials_for(&applying.data().account_id).await?;

        self.save(&mut applying).await?;
        info!(
            deployment_id = %applying.id(),
            engine = self.engine.name(),
            resuming = !applying.data().state_blob.is_empty(),
            "apply started"
        );

        let request = engine_request(applying.data(), rendered, credentials);
        let (sink, progress) = ProgressSink::channel(PROGRESS_BUFFER);
        let engine = Arc::clone(&self.engine);
        let token = guard.token().clone();
        let worker = tokio::spawn(async move { engine.apply(request, sink, token).await });

        let outcome = match self
            .drive(
                &mut applying,
                worker,
                Some(progress),
                guard.token(),
                self.timeout(options),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(applying, e).await,
        };

        let output = truncate_output(outcome.output, MAX_OUTPUT_BYTES);
        if outcome.exit_code != 0 {
            // Whatever the engine managed to create stays on record.
            applying.record_state(outcome.state);
            applying.record_output(output.clone());
            let error = ControlError::Provisioning {
                exit_code: outcome.exit_code,
                output,
            };
            return self.fail(applying, error).await;
        }

        let mut applied =
            applying.applied(outcome.state, outcome.resources, outcome.outputs, output);
        self.save(&mut applied).await?;

        info!(
            deployment_id = %applied.id(),
            resources = applied.data().resources.len(),
            state_digest = %applied.data().state_blob.digest(),
            "apply complete"
        );

        let data = applied.data();
        let estimate = self
            .estimate(
                &data.id,
                CostSubject::State {
                    state: &data.state_blob,
                    resources: &data.resources,
                },
            )
            .await;
        if let Some(estimate) = estimate {
            applied.set_cost_estimate(estimate);
            self.save(&mut applied).await?;
        }

        Ok(applied.into_record())
    }

    /// Re-apply on an applied deployment: nothing to do unless the inputs
    /// moved.
    async fn reconfirm(&self, applied: Deployment<Applied>) -> ControlResult<DeploymentRecord> {
        let template = self.template_for(applied.data()).await?;
        let rendered = render(&template, &applied.data().variables)?;
        ensure_plan_current(applied.data(), &rendered)?;

        info!(
            deployment_id = %applied.id(),
            state_digest = %applied.data().state_blob.digest(),
            "already applied with unchanged inputs"
        );
        Ok(applied.into_record())
    }

    async fn run_destroy(
        &self,
        guard: LockGuard,
        options: OperationOptions,
    ) -> ControlResult<DeploymentRecord> {
        let mut destroying = self.load(guard.id()).await?.begin_destroy()?;

        let template = self.template_for(destroying.data()).await?;
        let rendered = render(&template, &destroying.data().variables)?;
        let credentials = self.credentials_for(&destroying.data().account_id).await?;

        self.save(&mut destroying).await?;
        info!(
            deployment_id = %destroying.id(),
            engine = self.engine.name(),
            resources = destroying.data().resources.len(),
            "destroy started"
        );

        let request = engine_request(destroying.data(), rendered, credentials);
        let (sink, progress) = ProgressSink::channel(PROGRESS_BUFFER);
        let engine = Arc::clone(&self.engine);
        let token = guard.token().clone();
        let worker = tokio::spawn(async move { engine.destroy(request, sink, token).await });

        let outcome = match self
            .drive(
                &mut destroying,
                worker,
                Some(progress),
                guard.token(),
                self.timeout(options),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(destroying, e).await,
        };

        let output = truncate_output(outcome.output, MAX_OUTPUT_BYTES);
        if outcome.exit_code != 0 || outcome.remaining_resources > 0 {
            destroying.record_state(outcome.remaining_state);
            destroying.record_output(output.clone());
            let error = if outcome.exit_code == 0 {
                ControlError::IncompleteTeardown {
                    remaining: outcome.remaining_resources,
                }
            } else {
                ControlError::Provisioning {
                    exit_code: outcome.exit_code,
                    output,
                }
            };
            return self.fail(destroying, error).await;
        }

        let mut destroyed = destroying.destroyed(output);
        self.save(&mut destroyed).await?;

        info!(deployment_id = %destroyed.id(), "destroy complete");
        Ok(destroyed.into_record())
    }

    // -------------------------------------------------------------------------
    // Engine supervision
    // -------------------------------------------------------------------------

    /// Wait for an engine call, persisting each progress snapshot as it
    /// arrives.
    ///
    /// At the deadline the call is cancelled. A cancelled call that has not
    /// returned within the grace period is aborted, which drops (and kills)
    /// any child process it owns.
    async fn drive<S: InFlight, T: Send + 'static>(
        &self,
        deployment: &mut Deployment<S>,
        mut worker: JoinHandle<ControlResult<T>>,
        mut progress: Option<mpsc::Receiver<ProgressUpdate>>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> ControlResult<T> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;
        let mut abort_at: Option<Instant> = None;

        let joined = loop {
            tokio::select! {
                biased;

                update = next_update(&mut progress), if progress.is_some() => match update {
                    Some(update) => self.record_progress(deployment, update).await,
                    None => progress = None,
                },
                joined = &mut worker => break Some(joined),
                () = &mut deadline, if !timed_out => {
                    timed_out = true;
                    warn!(
                        deployment_id = %deployment.id(),
                        operation = %deployment.operation(),
                        ?timeout,
                        "deadline reached, cancelling"
                    );
                    cancel.cancel();
                }
                () = cancel.cancelled(), if abort_at.is_none() => {
                    debug!(deployment_id = %deployment.id(), "waiting for engine to stop");
                    abort_at = Some(Instant::now() + self.config.cancel_grace);
                }
                () = tokio::time::sleep_until(abort_at.unwrap_or_else(Instant::now)),
                    if abort_at.is_some() =>
                {
                    warn!(
                        deployment_id = %deployment.id(),
                        grace = ?self.config.cancel_grace,
                        "engine did not stop in time, aborting"
                    );
                    worker.abort();
                    break None;
                }
            }
        };

        // Snapshots sent just before the engine returned.
        if let Some(rx) = progress.as_mut() {
            while let Ok(update) = rx.try_recv() {
                self.record_progress(deployment, update).await;
            }
        }

        match joined {
            None | Some(Ok(Err(ControlError::Cancelled(_)))) => Err(if timed_out {
                ControlError::TimedOut(timeout)
            } else {
                ControlError::Cancelled(deployment.id().to_string())
            }),
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(ControlError::engine(format!("engine task failed: {e}"))),
        }
    }

    async fn record_progress<S: InFlight>(
        &self,
        deployment: &mut Deployment<S>,
        update: ProgressUpdate,
    ) {
        deployment.record_state(update.state);
        match self.save(deployment).await {
            Ok(()) => debug!(
                deployment_id = %deployment.id(),
                revision = deployment.revision(),
                progress = %update.message,
                "progress persisted"
            ),
            Err(e) => error!(
                deployment_id = %deployment.id(),
                error = %e,
                "failed to persist progress"
            ),
        }
    }

    /// Record a failed operation and hand the error back.
    async fn fail<S: InFlight, T>(
        &self,
        deployment: Deployment<S>,
        error: ControlError,
    ) -> ControlResult<T> {
        let (status, exit_code) = match &error {
            ControlError::Cancelled(_) => (OperationStatus::Cancelled, None),
            ControlError::TimedOut(_) => (OperationStatus::TimedOut, None),
            ControlError::Provisioning { exit_code, .. } => {
                (OperationStatus::Failed, Some(*exit_code))
            }
            ControlError::IncompleteTeardown { .. } => (OperationStatus::Failed, Some(0)),
            _ => (OperationStatus::Failed, None),
        };
        let operation = deployment.operation();

        let mut errored = deployment.fail(status, error.to_string(), exit_code);
        if let Err(e) = self.save(&mut errored).await {
            error!(
                deployment_id = %errored.id(),
                %operation,
                cause = %error,
                error = %e,
                "failed to record operation failure"
            );
            return Err(e);
        }

        warn!(
            deployment_id = %errored.id(),
            %operation,
            ?exit_code,
            error = %error,
            "operation failed"
        );
        Err(error)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn load(&self, id: &DeploymentId) -> ControlResult<AnyDeployment> {
        Ok(AnyDeployment::from_record(self.get(id).await?))
    }

    /// Write the whole record and adopt the new revision.
    async fn save<S: DeploymentState>(&self, deployment: &mut Deployment<S>) -> ControlResult<()> {
        let revision = self.store.persist(&deployment.to_record()).await?;
        deployment.set_revision(revision);
        Ok(())
    }

    async fn template_for(&self, data: &DeploymentData) -> ControlResult<Template> {
        self.templates
            .get(&data.template_id, Some(data.template_version))
            .await
    }

    async fn validate_variables(
        &self,
        data: &DeploymentData,
        variables: &Variables,
    ) -> ControlResult<()> {
        let template = self.template_for(data).await?;
        resolve_variables(&template.variables, variables).map(|_| ())
    }

    async fn credentials_for(&self, account_id: &AccountId) -> ControlResult<ProviderCredentials> {
        let account = self.accounts.get(account_id).await?;
        self.accounts.credentials(&account).await
    }

    /// Run the estimator, if any. Failures are logged and yield `None`.
    async fn estimate(
        &self,
        id: &DeploymentId,
        subject: CostSubject<'_>,
    ) -> Option<CostEstimate> {
        let estimator = self.estimator.as_ref()?;

        match tokio::time::timeout(self.config.cost_timeout, estimator.estimate(subject)).await {
            Ok(Ok(estimate)) => {
                debug!(
                    deployment_id = %id,
                    total_cost = estimate.total_cost,
                    currency = %estimate.currency,
                    "cost estimated"
                );
                Some(estimate)
            }
            Ok(Err(e)) => {
                warn!(deployment_id = %id, error = %e, "cost estimation failed; keeping previous estimate");
                None
            }
            Err(_) => {
                warn!(
                    deployment_id = %id,
                    timeout = ?self.config.cost_timeout,
                    "cost estimation timed out; keeping previous estimate"
                );
                None
            }
        }
    }

    fn timeout(&self, options: OperationOptions) -> Duration {
        options.timeout.unwrap_or(self.config.operation_timeout)
    }
}

impl std::fmt::Debug for DeploymentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentOrchestrator")
            .field("engine", &self.engine.name())
            .field("estimator", &self.estimator.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Run an operation on its own task and wait for it.
async fn detached<T: Send + 'static>(
    operation: impl Future<Output = ControlResult<T>> + Send + 'static,
) -> ControlResult<T> {
    tokio::spawn(operation)
        .await
        .map_err(|e| ControlError::internal(format!("operation task failed: {e}")))?
}

async fn next_update(rx: &mut Option<mpsc::Receiver<ProgressUpdate>>) -> Option<ProgressUpdate> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

fn engine_request(
    data: &DeploymentData,
    rendered: RenderedTemplate,
    credentials: ProviderCredentials,
) -> EngineRequest {
    EngineRequest {
        deployment_id: data.id.clone(),
        rendered,
        credentials,
        state: data.state_blob.clone(),
    }
}

/// Fail with `StalePlan` unless the stored plan was made from these inputs.
fn ensure_plan_current(data: &DeploymentData, rendered: &RenderedTemplate) -> ControlResult<()> {
    match &data.plan {
        Some(plan) if plan.inputs_digest == rendered.inputs_digest() => Ok(()),
        _ => Err(ControlError::StalePlan(data.id.to_string())),
    }
}
