//! Cost estimation.
//!
//! Estimation is advisory. The orchestrator runs it after a successful plan
//! or apply and only logs a failure, leaving the previous estimate on the
//! deployment.

mod static_pricing;

pub use static_pricing::StaticPriceEstimator;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::{CostConfig, CostKind};
use crate::error::{ControlError, ControlResult};
use crate::types::{CostBasis, CostEstimate, PlanDiff, ResourceSummary, StateBlob};

/// What to price.
#[derive(Debug, Clone, Copy)]
pub enum CostSubject<'a> {
    /// A plan that has not been applied yet.
    Plan(&'a PlanDiff),
    /// Provisioned resources.
    State {
        /// The engine state they came from.
        state: &'a StateBlob,
        /// Resources the engine reported.
        resources: &'a [ResourceSummary],
    },
}

impl CostSubject<'_> {
    /// Forecast or realised, depending on the subject.
    #[must_use]
    pub const fn basis(&self) -> CostBasis {
        match self {
            Self::Plan(_) => CostBasis::Projected,
            Self::State { .. } => CostBasis::Realized,
        }
    }
}

/// Produces monthly cost figures for a plan or a set of resources.
#[async_trait]
pub trait CostEstimator: Send + Sync {
    /// Estimate the monthly cost of the subject.
    async fn estimate(&self, subject: CostSubject<'_>) -> ControlResult<CostEstimate>;
}

/// Create an estimator from configuration, or `None` when disabled.
#[must_use]
pub fn create_estimator(config: &CostConfig) -> Option<Arc<dyn CostEstimator>> {
    match config.kind {
        CostKind::Static => Some(Arc::new(StaticPriceEstimator::new(&config.currency))),
        CostKind::Disabled => None,
    }
}

/// Estimator that returns the same breakdown every time, or always fails.
#[derive(Debug, Clone)]
pub struct FixedEstimator {
    cost_by_service: BTreeMap<String, f64>,
    currency: String,
    fail: bool,
}

impl FixedEstimator {
    /// Always report the given per-service costs.
    #[must_use]
    pub fn new(cost_by_service: BTreeMap<String, f64>) -> Self {
        Self {
            cost_by_service,
            currency: "USD".to_owned(),
            fail: false,
        }
    }

    /// Always fail.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            cost_by_service: BTreeMap::new(),
            currency: "USD".to_owned(),
            fail: true,
        }
    }
}

#[async_trait]
impl CostEstimator for FixedEstimator {
    async fn estimate(&self, subject: CostSubject<'_>) -> ControlResult<CostEstimate> {
        if self.fail {
            return Err(ControlError::Estimation("pricing source unavailable".to_owned()));
        }
        Ok(CostEstimate {
            total_cost: self.cost_by_service.values().sum(),
            currency: self.currency.clone(),
            cost_by_service: self.cost_by_service.clone(),
            basis: subject.basis(),
            estimated_at: Utc::now(),
        })
    }
}
