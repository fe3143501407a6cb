//! Static monthly price table.
//!
//! Prices are rough on-demand list prices per month. Anything the table
//! does not know is charged a flat default so unfamiliar resources still
//! show up in the total.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::ControlResult;
use crate::types::{ChangeAction, CostEstimate};

use super::{CostEstimator, CostSubject};

/// Monthly price for resource types the table does not list.
const DEFAULT_RESOURCE_PRICE: f64 = 10.0;

/// Storage price per GB-month for managed databases.
const DB_STORAGE_PER_GB: f64 = 0.10;

const EC2_PRICES: &[(&str, f64)] = &[
    ("t3.nano", 3.80),
    ("t3.micro", 7.50),
    ("t3.small", 15.00),
    ("t3.medium", 30.00),
    ("t3.large", 60.00),
    ("m5.large", 70.00),
    ("m5.xlarge", 140.00),
];

const RDS_PRICES: &[(&str, f64)] = &[
    ("db.t3.micro", 12.50),
    ("db.t3.small", 25.00),
    ("db.t3.medium", 50.00),
    ("db.m5.large", 125.00),
];

const AZURE_VM_PRICES: &[(&str, f64)] = &[
    ("Standard_B1s", 8.76),
    ("Standard_B2s", 30.37),
    ("Standard_D2s_v3", 70.08),
];

const GCE_PRICES: &[(&str, f64)] = &[
    ("e2-micro", 7.60),
    ("e2-small", 15.20),
    ("e2-medium", 30.40),
    ("n1-standard-1", 34.70),
];

fn lookup(table: &[(&str, f64)], key: Option<&str>, default: f64) -> f64 {
    key.and_then(|k| table.iter().find(|(name, _)| *name == k))
        .map_or(default, |(_, price)| *price)
}

fn string_attr<'a>(attributes: &'a Value, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| attributes.get(*name).and_then(Value::as_str))
}

/// Estimator backed by a built-in per-resource price table.
#[derive(Debug, Clone)]
pub struct StaticPriceEstimator {
    currency: String,
}

impl StaticPriceEstimator {
    /// Create an estimator reporting in `currency`.
    #[must_use]
    pub fn new(currency: &str) -> Self {
        Self {
            currency: currency.to_owned(),
        }
    }

    /// Service name and monthly price for one resource.
    fn price(resource_type: &str, attributes: &Value) -> (&'static str, f64) {
        match resource_type {
            "aws_instance" => (
                "EC2",
                lookup(EC2_PRICES, string_attr(attributes, &["instance_type"]), 30.0),
            ),
            "aws_db_instance" => {
                let class = string_attr(attributes, &["instance_class", "instance_type"]);
                let storage = attributes
                    .get("allocated_storage")
                    .and_then(Value::as_f64)
                    .unwrap_or(20.0);
                (
                    "RDS",
                    lookup(RDS_PRICES, class, 50.0) + storage * DB_STORAGE_PER_GB,
                )
            }
            "aws_s3_bucket" => ("S3", 5.0),
            "azurerm_virtual_machine" | "azurerm_linux_virtual_machine" => (
                "Virtual Machines",
                lookup(
                    AZURE_VM_PRICES,
                    string_attr(attributes, &["vm_size", "size"]),
                    40.0,
                ),
            ),
            "google_compute_instance" => (
                "Compute Engine",
                lookup(GCE_PRICES, string_attr(attributes, &["machine_type"]), 30.0),
            ),
            _ => ("Other", DEFAULT_RESOURCE_PRICE),
        }
    }
}

#[async_trait]
impl CostEstimator for StaticPriceEstimator {
    async fn estimate(&self, subject: CostSubject<'_>) -> ControlResult<CostEstimate> {
        let mut cost_by_service: BTreeMap<String, f64> = BTreeMap::new();
        let mut add = |resource_type: &str, attributes: &Value| {
            let (service, price) = Self::price(resource_type, attributes);
            *cost_by_service.entry(service.to_owned()).or_default() += price;
        };

        match subject {
            // A projection is what the deployment will cost once applied, so
            // everything that exists afterwards counts.
            CostSubject::Plan(diff) => {
                for change in diff
                    .changes
                    .iter()
                    .filter(|c| c.action != ChangeAction::Delete)
                {
                    add(&change.resource_type, &change.attributes);
                }
            }
            CostSubject::State { resources, .. } => {
                for resource in resources {
                    add(&resource.resource_type, &resource.attributes);
                }
            }
        }

        let basis = subject.basis();
        let total_cost = cost_by_service.values().sum();
        Ok(CostEstimate {
            total_cost,
            currency: self.currency.clone(),
            cost_by_service,
            basis,
            estimated_at: Utc::now(),
        })
    }
}
