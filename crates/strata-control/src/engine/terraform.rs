//! Terraform CLI engine.
//!
//! Each deployment gets its own working directory holding `main.tf`,
//! `terraform.tfvars.json` and the local `terraform.tfstate`. The state file
//! is written from the deployment's state blob before every command and read
//! back afterwards, so the database stays the source of truth.
//!
//! Credentials reach the child only through provider environment variables;
//! the rest of the parent environment is not inherited.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::accounts::ProviderCredentials;
use crate::config::EngineConfig;
use crate::error::{ControlError, ControlResult};
use crate::types::{
    ChangeAction, CloudProvider, DeploymentId, PlanDiff, ResourceChange, ResourceSummary,
    StateBlob,
};

use super::{
    ApplyOutcome, DestroyOutcome, EngineRequest, PlanOutcome, ProgressSink, ProvisioningEngine,
};

/// Terraform's state file format version; used as the blob schema version.
pub const TERRAFORM_STATE_SCHEMA: u32 = 4;

const MAIN_FILE: &str = "main.tf";
const VARS_FILE: &str = "terraform.tfvars.json";
const STATE_FILE: &str = "terraform.tfstate";
const PLAN_FILE: &str = "tfplan";

/// Engine that shells out to the `terraform` binary.
#[derive(Debug, Clone)]
pub struct TerraformEngine {
    binary: PathBuf,
    work_dir: PathBuf,
}

/// Exit status and captured output of one command.
#[derive(Debug)]
struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// A spawned terraform process whose stdout is read line by line.
struct RunningCommand {
    child: Child,
    lines: Option<Lines<BufReader<ChildStdout>>>,
    stdout: Vec<String>,
    stderr_task: JoinHandle<Vec<String>>,
}

impl RunningCommand {
    /// Next stdout line, or `None` at end of output.
    async fn next_line(
        &mut self,
        deployment_id: &DeploymentId,
        cancel: &CancellationToken,
    ) -> ControlResult<Option<String>> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(None);
        };

        tokio::select! {
            () = cancel.cancelled() => {
                warn!(deployment_id = %deployment_id, "terraform cancelled; killing process");
                self.child.kill().await.ok();
                Err(ControlError::Cancelled(deployment_id.to_string()))
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    self.stdout.push(line.clone());
                    Ok(Some(line))
                }
                Ok(None) | Err(_) => {
                    self.lines = None;
                    Ok(None)
                }
            }
        }
    }

    /// Drain remaining output and wait for the exit status.
    async fn finish(
        mut self,
        deployment_id: &DeploymentId,
        cancel: &CancellationToken,
    ) -> ControlResult<CommandOutput> {
        while self.next_line(deployment_id, cancel).await?.is_some() {}

        let status = tokio::select! {
            () = cancel.cancelled() => {
                self.child.kill().await.ok();
                return Err(ControlError::Cancelled(deployment_id.to_string()));
            }
            status = self.child.wait() => {
                status.map_err(|e| ControlError::engine(format!("terraform process error: {e}")))?
            }
        };

        let stderr = self.stderr_task.await.unwrap_or_default();
        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: self.stdout.join("\n"),
            stderr: stderr.join("\n"),
        })
    }
}

impl TerraformEngine {
    /// Create an engine from configuration.
    pub fn new(config: &EngineConfig) -> ControlResult<Self> {
        std::fs::create_dir_all(&config.work_dir).map_err(|e| {
            ControlError::Config(format!(
                "failed to create engine work dir {}: {e}",
                config.work_dir.display()
            ))
        })?;
        Ok(Self {
            binary: config.terraform_bin.clone(),
            work_dir: config.work_dir.clone(),
        })
    }

    fn deployment_dir(&self, id: &DeploymentId) -> PathBuf {
        self.work_dir.join(id.as_str())
    }

    /// Write the template, variables and state into the working directory.
    async fn prepare(&self, request: &EngineRequest) -> ControlResult<PathBuf> {
        let dir = self.deployment_dir(&request.deployment_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ControlError::engine(format!("failed to create {}: {e}", dir.display())))?;

        write_private(&dir.join(MAIN_FILE), request.rendered.body.as_bytes()).await?;
        write_private(
            &dir.join(VARS_FILE),
            &serde_json::to_vec_pretty(&request.rendered.variables)?,
        )
        .await?;

        let state_path = dir.join(STATE_FILE);
        if request.state.is_empty() {
            match fs::remove_file(&state_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ControlError::engine(format!(
                        "failed to clear stale state file: {e}"
                    )))
                }
            }
        } else {
            if request.state.schema_version != TERRAFORM_STATE_SCHEMA {
                return Err(ControlError::engine(format!(
                    "unsupported state schema version {}",
                    request.state.schema_version
                )));
            }
            write_private(&state_path, &serde_json::to_vec(&request.state.payload)?).await?;
        }

        Ok(dir)
    }

    fn spawn(
        &self,
        dir: &Path,
        args: &[&str],
        credentials: &ProviderCredentials,
    ) -> ControlResult<RunningCommand> {
        let mut cmd = TokioCommand::new(&self.binary);
        cmd.args(args)
            .current_dir(dir)
            .env_clear()
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for var in ["PATH", "HOME", "TMPDIR", "TF_PLUGIN_CACHE_DIR"] {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        for (key, value) in provider_env(credentials)? {
            cmd.env(key, value);
        }

        debug!(args = ?args, dir = %dir.display(), "spawning terraform");
        let mut child = cmd
            .spawn()
            .map_err(|e| ControlError::engine(format!("failed to spawn terraform: {e}")))?;

        let lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut lines = Vec::new();
            if let Some(stderr) = stderr {
                let mut reader_lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader_lines.next_line().await {
                    lines.push(line);
                }
            }
            lines
        });

        Ok(RunningCommand {
            child,
            lines,
            stdout: Vec::new(),
            stderr_task,
        })
    }

    async fn run(
        &self,
        dir: &Path,
        args: &[&str],
        request: &EngineRequest,
        cancel: &CancellationToken,
    ) -> ControlResult<CommandOutput> {
        self.spawn(dir, args, &request.credentials)?
            .finish(&request.deployment_id, cancel)
            .await
    }

    async fn init(
        &self,
        dir: &Path,
        request: &EngineRequest,
        cancel: &CancellationToken,
    ) -> ControlResult<Option<CommandOutput>> {
        let output = self
            .run(dir, &["init", "-input=false", "-no-color"], request, cancel)
            .await?;
        Ok((output.exit_code != 0).then_some(output))
    }

    /// Read back the state file terraform left behind.
    async fn read_state(dir: &Path) -> ControlResult<StateBlob> {
        let bytes = match fs::read(dir.join(STATE_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StateBlob::empty()),
            Err(e) => {
                return Err(ControlError::engine(format!(
                    "failed to read state file: {e}"
                )))
            }
        };
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|e| ControlError::engine(format!("malformed state file: {e}")))?;
        Ok(StateBlob::new(TERRAFORM_STATE_SCHEMA, payload))
    }

    /// Stream a `-json` apply or destroy, reporting a state snapshot after
    /// every completed resource. On cancellation the last state on disk is
    /// reported before the error is returned.
    async fn run_streaming(
        &self,
        dir: &Path,
        args: &[&str],
        request: &EngineRequest,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> ControlResult<CommandOutput> {
        let mut running = self.spawn(dir, args, &request.credentials)?;
        let mut messages = Vec::new();

        loop {
            match running.next_line(&request.deployment_id, cancel).await {
                Ok(Some(line)) => {
                    if let Some(message) = completion_message(&line) {
                        if let Ok(state) = Self::read_state(dir).await {
                            progress.report(state, message.clone()).await;
                        }
                        messages.push(message);
                    } else if let Some(message) = diagnostic_message(&line) {
                        messages.push(message);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if let Ok(state) = Self::read_state(dir).await {
                        progress.report(state, "cancelled").await;
                    }
                    return Err(e);
                }
            }
        }

        let mut output = running.finish(&request.deployment_id, cancel).await?;
        // Keep the readable messages rather than the raw JSON event stream.
        output.stdout = messages.join("\n");
        Ok(output)
    }
}

#[async_trait]
impl ProvisioningEngine for TerraformEngine {
    fn name(&self) -> &'static str {
        "terraform"
    }

    #[instrument(skip_all, fields(deployment_id = %request.deployment_id))]
    async fn plan(
        &self,
        request: EngineRequest,
        cancel: CancellationToken,
    ) -> ControlResult<PlanOutcome> {
        let dir = self.prepare(&request).await?;

        if let Some(failed) = self.init(&dir, &request, &cancel).await? {
            return Ok(PlanOutcome {
                diff: PlanDiff::default(),
                proposed_state: request.state.clone(),
                exit_code: failed.exit_code,
                output: failed.combined(),
            });
        }

        let plan_out = format!("-out={PLAN_FILE}");
        let var_file = format!("-var-file={VARS_FILE}");
        let planned = self
            .run(
                &dir,
                &["plan", "-input=false", "-no-color", &plan_out, &var_file],
                &request,
                &cancel,
            )
            .await?;
        if planned.exit_code != 0 {
            return Ok(PlanOutcome {
                diff: PlanDiff::default(),
                proposed_state: request.state.clone(),
                exit_code: planned.exit_code,
                output: planned.combined(),
            });
        }

        let shown = self
            .run(&dir, &["show", "-json", PLAN_FILE], &request, &cancel)
            .await?;
        if shown.exit_code != 0 {
            return Ok(PlanOutcome {
                diff: PlanDiff::default(),
                proposed_state: request.state.clone(),
                exit_code: shown.exit_code,
                output: shown.combined(),
            });
        }

        let plan_json: Value = serde_json::from_str(&shown.stdout)
            .map_err(|e| ControlError::engine(format!("malformed plan JSON: {e}")))?;
        let diff = parse_plan_changes(&plan_json);
        let proposed_state = StateBlob::new(
            TERRAFORM_STATE_SCHEMA,
            plan_json.get("planned_values").cloned().unwrap_or(Value::Null),
        );

        info!(add = diff.add, change = diff.change, destroy = diff.destroy, "terraform plan complete");
        Ok(PlanOutcome {
            diff,
            proposed_state,
            exit_code: 0,
            output: planned.combined(),
        })
    }

    #[instrument(skip_all, fields(deployment_id = %request.deployment_id))]
    async fn apply(
        &self,
        request: EngineRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> ControlResult<ApplyOutcome> {
        let dir = self.prepare(&request).await?;

        if let Some(failed) = self.init(&dir, &request, &cancel).await? {
            return Ok(ApplyOutcome {
                resources: state_resources(&request.state.payload),
                state: request.state.clone(),
                outputs: BTreeMap::new(),
                exit_code: failed.exit_code,
                output: failed.combined(),
            });
        }

        let var_file = format!("-var-file={VARS_FILE}");
        let applied = self
            .run_streaming(
                &dir,
                &["apply", "-input=false", "-no-color", "-auto-approve", "-json", &var_file],
                &request,
                &progress,
                &cancel,
            )
            .await?;

        let state = Self::read_state(&dir).await?;
        let resources = state_resources(&state.payload);

        let outputs = if applied.exit_code == 0 {
            let shown = self
                .run(&dir, &["output", "-json"], &request, &cancel)
                .await?;
            if shown.exit_code == 0 {
                parse_outputs(&shown.stdout)?
            } else {
                warn!(exit_code = shown.exit_code, "terraform output failed");
                BTreeMap::new()
            }
        } else {
            BTreeMap::new()
        };

        info!(exit_code = applied.exit_code, resources = resources.len(), "terraform apply finished");
        Ok(ApplyOutcome {
            state,
            resources,
            outputs,
            exit_code: applied.exit_code,
            output: applied.combined(),
        })
    }

    #[instrument(skip_all, fields(deployment_id = %request.deployment_id))]
    async fn destroy(
        &self,
        request: EngineRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> ControlResult<DestroyOutcome> {
        let dir = self.prepare(&request).await?;

        if let Some(failed) = self.init(&dir, &request, &cancel).await? {
            return Ok(DestroyOutcome {
                remaining_resources: state_resources(&request.state.payload).len(),
                remaining_state: request.state.clone(),
                exit_code: failed.exit_code,
                output: failed.combined(),
            });
        }

        let var_file = format!("-var-file={VARS_FILE}");
        let destroyed = self
            .run_streaming(
                &dir,
                &["destroy", "-input=false", "-no-color", "-auto-approve", "-json", &var_file],
                &request,
                &progress,
                &cancel,
            )
            .await?;

        let state = Self::read_state(&dir).await?;
        let remaining = state_resources(&state.payload).len();

        if destroyed.exit_code == 0 && remaining == 0 {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                warn!(error = %e, "failed to remove terraform work dir");
            }
            return Ok(DestroyOutcome {
                remaining_state: StateBlob::empty(),
                remaining_resources: 0,
                exit_code: 0,
                output: destroyed.combined(),
            });
        }

        info!(exit_code = destroyed.exit_code, remaining, "terraform destroy incomplete");
        Ok(DestroyOutcome {
            remaining_state: state,
            remaining_resources: remaining,
            exit_code: destroyed.exit_code,
            output: destroyed.combined(),
        })
    }
}

/// Write a file readable only by the owner. State and tfvars may hold secrets.
async fn write_private(path: &Path, contents: &[u8]) -> ControlResult<()> {
    let failed = |e: std::io::Error| {
        ControlError::engine(format!("failed to write {}: {e}", path.display()))
    };

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await.map_err(failed)?;
    file.write_all(contents).await.map_err(failed)?;
    file.flush().await.map_err(failed)
}

/// Map a credential document to the provider's environment variables.
fn provider_env(credentials: &ProviderCredentials) -> ControlResult<Vec<(&'static str, String)>> {
    let document = credentials.document()?;
    let field = |name: &str| {
        document
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    let mut env = Vec::new();
    let mut push = |key: &'static str, value: Option<String>| {
        if let Some(value) = value {
            env.push((key, value));
        }
    };

    match credentials.provider {
        CloudProvider::Aws => {
            push("AWS_ACCESS_KEY_ID", field("access_key_id"));
            push("AWS_SECRET_ACCESS_KEY", field("secret_access_key"));
            push("AWS_SESSION_TOKEN", field("session_token"));
            push("AWS_REGION", field("region"));
        }
        CloudProvider::Azure => {
            push("ARM_CLIENT_ID", field("client_id"));
            push("ARM_CLIENT_SECRET", field("client_secret"));
            push("ARM_TENANT_ID", field("tenant_id"));
            push("ARM_SUBSCRIPTION_ID", field("subscription_id"));
        }
        CloudProvider::Gcp => {
            push(
                "GOOGLE_CREDENTIALS",
                Some(credentials.secret().expose().to_owned()),
            );
            push("GOOGLE_PROJECT", field("project_id"));
        }
    }
    Ok(env)
}

/// Human-readable message for an `apply_complete` event.
fn completion_message(line: &str) -> Option<String> {
    let event: Value = serde_json::from_str(line).ok()?;
    if event.get("type")?.as_str()? != "apply_complete" {
        return None;
    }
    event
        .get("@message")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Message text of a `diagnostic` event (errors and warnings).
fn diagnostic_message(line: &str) -> Option<String> {
    let event: Value = serde_json::from_str(line).ok()?;
    if event.get("type")?.as_str()? != "diagnostic" {
        return None;
    }
    let diagnostic = event.get("diagnostic")?;
    let severity = diagnostic.get("severity").and_then(Value::as_str).unwrap_or("error");
    let summary = diagnostic.get("summary").and_then(Value::as_str).unwrap_or("");
    let detail = diagnostic.get("detail").and_then(Value::as_str).unwrap_or("");
    Some(format!("{severity}: {summary} {detail}").trim_end().to_owned())
}

/// Build a diff from `terraform show -json` plan output.
fn parse_plan_changes(plan: &Value) -> PlanDiff {
    let changes = plan
        .get("resource_changes")
        .and_then(Value::as_array)
        .map(|changes| {
            changes
                .iter()
                .filter_map(|rc| {
                    let change = rc.get("change")?;
                    let actions: Vec<&str> = change
                        .get("actions")?
                        .as_array()?
                        .iter()
                        .filter_map(Value::as_str)
                        .collect();
                    let action = match actions.as_slice() {
                        ["create"] => ChangeAction::Create,
                        ["update"] => ChangeAction::Update,
                        ["delete"] => ChangeAction::Delete,
                        ["delete", "create"] | ["create", "delete"] => ChangeAction::Replace,
                        _ => return None,
                    };
                    Some(ResourceChange {
                        address: rc.get("address")?.as_str()?.to_owned(),
                        resource_type: rc.get("type")?.as_str()?.to_owned(),
                        action,
                        attributes: change.get("after").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    PlanDiff::from_changes(changes)
}

/// Managed resources recorded in a terraform state document.
fn state_resources(state: &Value) -> Vec<ResourceSummary> {
    let Some(resources) = state.get("resources").and_then(Value::as_array) else {
        return Vec::new();
    };

    resources
        .iter()
        .filter(|r| r.get("mode").and_then(Value::as_str) == Some("managed"))
        .filter_map(|r| {
            let resource_type = r.get("type")?.as_str()?;
            let name = r.get("name")?.as_str()?;
            let instances = r.get("instances")?.as_array()?;
            let first = instances.first()?;
            let address = match r.get("module").and_then(Value::as_str) {
                Some(module) => format!("{module}.{resource_type}.{name}"),
                None => format!("{resource_type}.{name}"),
            };
            Some(ResourceSummary {
                address,
                resource_type: resource_type.to_owned(),
                attributes: first.get("attributes").cloned().unwrap_or(Value::Null),
            })
        })
        .collect()
}

/// Flatten `terraform output -json` to name → value.
fn parse_outputs(raw: &str) -> ControlResult<BTreeMap<String, Value>> {
    let outputs: Map<String, Value> = serde_json::from_str(raw)
        .map_err(|e| ControlError::engine(format!("malformed output JSON: {e}")))?;

    Ok(outputs
        .into_iter()
        .map(|(name, output)| {
            let sensitive = output
                .get("sensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let value = if sensitive {
                Value::String("[REDACTED]".to_owned())
            } else {
                output.get("value").cloned().unwrap_or(Value::Null)
            };
            (name, value)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_vault::SecretValue;

    #[test]
    fn parses_plan_changes() {
        let plan = json!({
            "resource_changes": [
                {"address": "aws_instance.web", "type": "aws_instance",
                 "change": {"actions": ["create"], "after": {"instance_type": "t3.micro"}}},
                {"address": "aws_s3_bucket.logs", "type": "aws_s3_bucket",
                 "change": {"actions": ["no-op"], "after": {}}},
                {"address": "aws_db_instance.main", "type": "aws_db_instance",
                 "change": {"actions": ["delete", "create"], "after": {}}}
            ]
        });

        let diff = parse_plan_changes(&plan);
        assert_eq!(diff.add, 2);
        assert_eq!(diff.destroy, 1);
        assert_eq!(diff.changes.len(), 2);
        assert_eq!(diff.changes[0].attributes["instance_type"], "t3.micro");
        assert_eq!(diff.changes[1].action, ChangeAction::Replace);
    }

    #[test]
    fn reads_managed_resources_from_state() {
        let state = json!({
            "version": 4,
            "resources": [
                {"mode": "managed", "type": "aws_instance", "name": "web",
                 "instances": [{"attributes": {"id": "i-123"}}]},
                {"mode": "data", "type": "aws_ami", "name": "ubuntu",
                 "instances": [{"attributes": {}}]},
                {"mode": "managed", "type": "aws_s3_bucket", "name": "gone", "instances": []}
            ]
        });

        let resources = state_resources(&state);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].address, "aws_instance.web");
        assert_eq!(resources[0].attributes["id"], "i-123");
    }

    #[test]
    fn redacts_sensitive_outputs() {
        let raw = r#"{
            "ip": {"sensitive": false, "type": "string", "value": "10.0.0.1"},
            "password": {"sensitive": true, "type": "string", "value": "hunter2"}
        }"#;
        let outputs = parse_outputs(raw).unwrap();
        assert_eq!(outputs["ip"], "10.0.0.1");
        assert_eq!(outputs["password"], "[REDACTED]");
    }

    #[test]
    fn extracts_event_messages() {
        let complete = r#"{"@message":"aws_instance.web: Creation complete after 31s","type":"apply_complete","hook":{}}"#;
        assert_eq!(
            completion_message(complete).as_deref(),
            Some("aws_instance.web: Creation complete after 31s")
        );
        assert!(completion_message(r#"{"type":"apply_start"}"#).is_none());
        assert!(completion_message("not json").is_none());

        let diagnostic = r#"{"type":"diagnostic","diagnostic":{"severity":"error","summary":"quota exceeded","detail":""}}"#;
        assert_eq!(
            diagnostic_message(diagnostic).as_deref(),
            Some("error: quota exceeded")
        );
    }

    #[test]
    fn maps_credentials_to_environment() {
        let creds = ProviderCredentials::new(
            CloudProvider::Azure,
            SecretValue::new(
                r#"{"client_id":"c","client_secret":"s","tenant_id":"t","subscription_id":"sub"}"#,
            ),
        );
        let env = provider_env(&creds).unwrap();
        assert!(env.contains(&("ARM_CLIENT_ID", "c".to_owned())));
        assert!(env.contains(&("ARM_SUBSCRIPTION_ID", "sub".to_owned())));
        assert_eq!(env.len(), 4);
    }

    #[tokio::test]
    async fn prepare_writes_private_files() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TerraformEngine {
            binary: PathBuf::from("terraform"),
            work_dir: dir.path().to_path_buf(),
        };
        let request = EngineRequest {
            deployment_id: DeploymentId::new("d1"),
            rendered: crate::templates::RenderedTemplate {
                template_id: crate::types::TemplateId::new("t1"),
                template_version: 1,
                provider: CloudProvider::Aws,
                body: "resource \"aws_s3_bucket\" \"b\" {}".to_owned(),
                variables: crate::types::Variables::new(),
            },
            credentials: ProviderCredentials::new(CloudProvider::Aws, SecretValue::new("{}")),
            state: StateBlob::new(TERRAFORM_STATE_SCHEMA, json!({"version": 4, "resources": []})),
        };

        let path = engine.prepare(&request).await.unwrap();
        assert!(path.join(MAIN_FILE).exists());
        assert!(path.join(VARS_FILE).exists());

        let state = TerraformEngine::read_state(&path).await.unwrap();
        assert_eq!(state.payload["version"], 4);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path.join(STATE_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // An empty state clears the file left by an earlier run.
        let request = EngineRequest {
            state: StateBlob::empty(),
            ..request
        };
        engine.prepare(&request).await.unwrap();
        assert!(!path.join(STATE_FILE).exists());
        assert!(TerraformEngine::read_state(&path).await.unwrap().is_empty());
    }
}
