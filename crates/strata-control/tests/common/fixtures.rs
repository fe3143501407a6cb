//! Templates, accounts and requests shared by the integration tests.

use serde_json::json;
use strata_control::types::{VariableSpec, VariableType};
use strata_control::{
    AccountId, CloudProvider, DeploymentRequest, NewAccount, NewTemplate, TemplateId, Variables,
};
use strata_vault::SecretValue;

use super::TestControl;

pub const AWS_CREDENTIAL: &str =
    r#"{"access_key_id":"AKIAEXAMPLE","secret_access_key":"wJalrXUtnFEMI/K7MDENG"}"#;

/// One EC2 instance.
pub const SINGLE_INSTANCE: &str = r#"
resource "aws_instance" "web" {
  instance_type = var.instance_type
}
"#;

/// An EC2 instance and a bucket, so partial progress is observable.
pub const INSTANCE_AND_BUCKET: &str = r#"
resource "aws_instance" "web" {
  instance_type = var.instance_type
}

resource "aws_s3_bucket" "assets" {}
"#;

/// Builder for test templates.
pub struct TemplateBuilder {
    id: String,
    body: String,
}

impl TemplateBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            body: SINGLE_INSTANCE.to_owned(),
        }
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_owned();
        self
    }

    pub fn build(self) -> NewTemplate {
        NewTemplate {
            id: Some(TemplateId::new(self.id)),
            name: "web server".to_owned(),
            provider: CloudProvider::Aws,
            service_type: "compute".to_owned(),
            description: None,
            body: self.body,
            variables: vec![VariableSpec {
                name: "instance_type".to_owned(),
                var_type: VariableType::String,
                required: true,
                default: None,
                description: None,
            }],
        }
    }
}

pub fn aws_account(id: &str) -> NewAccount {
    NewAccount {
        id: Some(AccountId::new(id)),
        name: format!("{id} account"),
        provider: CloudProvider::Aws,
        external_id: Some("123456789012".to_owned()),
        regions: vec!["eu-west-1".to_owned()],
    }
}

pub fn instance_type(value: &str) -> Variables {
    Variables::from([("instance_type".to_owned(), json!(value))])
}

pub fn request(template: &str, account: &str, instance: &str) -> DeploymentRequest {
    DeploymentRequest::new(
        TemplateId::new(template),
        AccountId::new(account),
        instance_type(instance),
    )
}

/// Number of resources recorded in a mock engine state blob.
pub fn state_resources(state: &strata_control::StateBlob) -> usize {
    state.payload["resources"]
        .as_array()
        .map_or(0, Vec::len)
}

impl TestControl {
    /// Register template `t1` with `body` and AWS account `a1`.
    pub async fn seed(&self, body: &str) {
        self.templates
            .register(TemplateBuilder::new("t1").with_body(body).build())
            .await
            .unwrap();
        self.accounts
            .register(aws_account("a1"), &SecretValue::new(AWS_CREDENTIAL))
            .await
            .unwrap();
    }
}
