//! Integration tests for the plan, apply and destroy lifecycle.

mod common;

use std::collections::BTreeMap;

use common::fixtures::{
    instance_type, request, state_resources, INSTANCE_AND_BUCKET, SINGLE_INSTANCE,
};
use common::TestControl;
use strata_control::types::{AccountId, CostBasis, Operation, OperationStatus};
use strata_control::{ControlError, DeploymentFilter, DeploymentId, DeploymentStatus, FixedEstimator};

fn ec2_estimator() -> FixedEstimator {
    FixedEstimator::new(BTreeMap::from([("EC2".to_owned(), 7.50)]))
}

#[tokio::test]
async fn deployment_goes_from_plan_through_destroy() {
    let control = TestControl::with_estimator(ec2_estimator());
    control.seed(SINGLE_INSTANCE).await;

    // Plan
    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    assert_eq!(planned.status, DeploymentStatus::Planned);
    let plan = planned.data.plan.as_ref().unwrap();
    assert_eq!(plan.diff.add, 1);
    assert_eq!(plan.template_version, 1);
    assert!(planned.data.state_blob.is_empty());
    let estimate = planned.data.cost_estimate.as_ref().unwrap();
    assert_eq!(estimate.basis, CostBasis::Projected);

    // Apply
    let id = planned.data.id.clone();
    let applied = control.orchestrator.apply(&id).await.unwrap();
    assert_eq!(applied.status, DeploymentStatus::Applied);
    assert_eq!(applied.data.resources.len(), 1);
    assert_eq!(applied.data.resources[0].address, "aws_instance.web");
    assert_eq!(state_resources(&applied.data.state_blob), 1);

    let estimate = applied.data.cost_estimate.as_ref().unwrap();
    assert!((estimate.total_cost - 7.50).abs() < f64::EPSILON);
    assert_eq!(estimate.cost_by_service["EC2"], 7.50);
    assert_eq!(estimate.basis, CostBasis::Realized);

    // Destroy
    let destroyed = control.orchestrator.destroy(&id).await.unwrap();
    assert_eq!(destroyed.status, DeploymentStatus::Destroyed);
    assert!(destroyed.data.state_blob.is_empty());
    assert!(destroyed.data.resources.is_empty());

    let statuses: Vec<_> = destroyed.data.history.iter().map(|h| h.to).collect();
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

#[tokio::test]
async fn every_transition_is_persisted() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    let id = planned.data.id.clone();
    control.orchestrator.apply(&id).await.unwrap();

    let stored = control.deployments.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Applied);
    assert_eq!(state_resources(&stored.data.state_blob), 1);

    let op = stored.data.last_operation.unwrap();
    assert_eq!(op.operation, Operation::Apply);
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(op.exit_code, Some(0));
}

#[tokio::test]
async fn reapply_with_unchanged_inputs_is_a_noop() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    let id = planned.data.id.clone();
    let applied = control.orchestrator.apply(&id).await.unwrap();
    assert_eq!(control.engine.apply_calls(), 1);

    let again = control.orchestrator.apply(&id).await.unwrap();
    assert_eq!(again.status, DeploymentStatus::Applied);
    assert_eq!(again.revision, applied.revision);
    assert_eq!(
        again.data.state_blob.digest(),
        applied.data.state_blob.digest()
    );
    assert_eq!(control.engine.apply_calls(), 1);
}

#[tokio::test]
async fn changed_variables_make_the_plan_stale() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    let id = planned.data.id.clone();

    control
        .orchestrator
        .update_variables(&id, instance_type("t3.large"))
        .await
        .unwrap();

    let err = control.orchestrator.apply(&id).await.unwrap_err();
    assert!(matches!(err, ControlError::StalePlan(_)));
    assert_eq!(control.engine.apply_calls(), 0);

    // A stale plan is refused before anything changes.
    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Planned);

    let replanned = control.orchestrator.plan(&id).await.unwrap();
    let change = &replanned.data.plan.as_ref().unwrap().diff.changes[0];
    assert_eq!(change.attributes["instance_type"], "t3.large");

    let applied = control.orchestrator.apply(&id).await.unwrap();
    assert_eq!(
        applied.data.resources[0].attributes["instance_type"],
        "t3.large"
    );
}

#[tokio::test]
async fn invalid_variables_are_rejected_without_running_the_engine() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();

    let err = control
        .orchestrator
        .update_variables(&planned.data.id, Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Validation(_)));
    assert_eq!(control.engine.plan_calls(), 1);
}

#[tokio::test]
async fn out_of_order_operations_are_rejected() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    let id = planned.data.id.clone();

    let err = control.orchestrator.destroy(&id).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::InvalidStateTransition {
            from: "planned",
            to: "destroying"
        }
    ));

    control.orchestrator.apply(&id).await.unwrap();
    control.orchestrator.destroy(&id).await.unwrap();

    let err = control.orchestrator.apply(&id).await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidStateTransition { .. }));
    let err = control.orchestrator.plan(&id).await.unwrap_err();
    assert!(matches!(err, ControlError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn unknown_references_fail_before_creating_a_deployment() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let err = control
        .orchestrator
        .plan_new(request("missing", "a1", "t3.micro"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::TemplateNotFound(_)));

    let err = control
        .orchestrator
        .plan_new(request("t1", "missing", "t3.micro"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::AccountNotFound(_)));

    let all = control
        .orchestrator
        .list(&DeploymentFilter::new())
        .await
        .unwrap();
    assert!(all.is_empty());

    let err = control
        .orchestrator
        .get(&DeploymentId::new("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::DeploymentNotFound(_)));
}

#[tokio::test]
async fn missing_required_variable_records_a_failed_plan() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let mut req = request("t1", "a1", "t3.micro");
    req.variables.clear();
    let id = DeploymentId::new("d-bad-vars");
    let err = control
        .orchestrator
        .plan_new(req.with_id(id.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::Validation(_)));
    assert_eq!(control.engine.plan_calls(), 0);

    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Error);
    assert_eq!(record.data.failure.unwrap().operation, Operation::Plan);

    // Fix the variables and plan again.
    control
        .orchestrator
        .update_variables(&id, instance_type("t3.micro"))
        .await
        .unwrap();
    let planned = control.orchestrator.plan(&id).await.unwrap();
    assert_eq!(planned.status, DeploymentStatus::Planned);
}

#[tokio::test]
async fn plans_pin_the_template_version() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    let id = planned.data.id.clone();

    // A newer version of the template does not affect the existing
    // deployment.
    let v2 = control
        .templates
        .register(
            common::fixtures::TemplateBuilder::new("t1")
                .with_body(INSTANCE_AND_BUCKET)
                .build(),
        )
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let applied = control.orchestrator.apply(&id).await.unwrap();
    assert_eq!(applied.data.template_version, 1);
    assert_eq!(applied.data.resources.len(), 1);

    let fresh = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    assert_eq!(fresh.data.template_version, 2);
    assert_eq!(fresh.data.plan.unwrap().diff.add, 2);
}

#[tokio::test]
async fn failing_estimator_does_not_fail_the_operation() {
    let control = TestControl::with_estimator(FixedEstimator::failing());
    control.seed(SINGLE_INSTANCE).await;

    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    assert_eq!(planned.status, DeploymentStatus::Planned);
    assert!(planned.data.cost_estimate.is_none());

    let applied = control.orchestrator.apply(&planned.data.id).await.unwrap();
    assert_eq!(applied.status, DeploymentStatus::Applied);
    assert!(applied.data.cost_estimate.is_none());
}

#[tokio::test]
async fn listing_filters_by_status_and_account() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let first = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    let second = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.small"))
        .await
        .unwrap();
    control.orchestrator.apply(&second.data.id).await.unwrap();

    let applied = control
        .orchestrator
        .list(&DeploymentFilter::new().with_status(DeploymentStatus::Applied))
        .await
        .unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].data.id, second.data.id);

    let all = control
        .orchestrator
        .list(&DeploymentFilter::new().with_account(first.data.account_id.clone()))
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn destroyed_deployment_keeps_its_account() {
    let control = TestControl::new();
    control.seed(SINGLE_INSTANCE).await;

    let planned = control
        .orchestrator
        .plan_new(request("t1", "a1", "t3.micro"))
        .await
        .unwrap();
    let id = planned.data.id.clone();
    control.orchestrator.apply(&id).await.unwrap();
    control.orchestrator.destroy(&id).await.unwrap();

    let account = AccountId::new("a1");
    let err = control.accounts.delete(&account).await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::AccountInUse { deployments: 1, .. }
    ));

    // The retained record still resolves to its account.
    let record = control.orchestrator.get(&id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Destroyed);
    let owner = control.accounts.get(&record.data.account_id).await.unwrap();
    assert_eq!(owner.id, account);
}
