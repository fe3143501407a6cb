//! Strata control binary.
//!
//! Operator CLI for templates, accounts and deployments.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strata_control::{
    AccountFilter, AccountId, CloudProvider, ControlConfig, ControlResult, ControlService,
    DeploymentFilter, DeploymentId, DeploymentOrchestrator, DeploymentRecord, DeploymentRequest,
    DeploymentStatus, NewAccount, NewTemplate, OperationOptions, TemplateFilter, TemplateId,
    Variables,
};
use strata_vault::{MasterKey, SecretValue, VaultConfig};

#[derive(Parser)]
#[command(name = "strata-control")]
#[command(about = "Deploy infrastructure templates to cloud accounts")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./strata.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mark deployments left mid-operation by a stopped process as errored
    Recover,

    /// Manage templates
    #[command(subcommand)]
    Template(TemplateCommand),

    /// Manage cloud accounts
    #[command(subcommand)]
    Account(AccountCommand),

    /// Manage deployments
    #[command(subcommand)]
    Deploy(DeployCommand),

    /// Manage the credential master key
    #[command(subcommand)]
    Vault(VaultCommand),
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Register a template (or a new version) from a JSON file
    Register {
        /// Template definition
        file: PathBuf,
    },

    /// List the latest version of each template
    List {
        /// Only templates for this provider
        #[arg(long)]
        provider: Option<CloudProvider>,

        /// Only templates of this service type
        #[arg(long)]
        service_type: Option<String>,
    },

    /// Show a template
    Show {
        /// Template id
        id: String,

        /// Version (latest if omitted)
        #[arg(long)]
        version: Option<u32>,
    },
}

#[derive(Subcommand)]
enum AccountCommand {
    /// Register an account from a JSON file
    Register {
        /// Account definition
        file: PathBuf,

        /// JSON credential document for the account's provider
        #[arg(long)]
        credential_file: PathBuf,
    },

    /// List accounts
    List {
        /// Only accounts for this provider
        #[arg(long)]
        provider: Option<CloudProvider>,
    },
}

#[derive(Subcommand)]
enum DeployCommand {
    /// Create a deployment and plan it
    Create {
        /// Template id
        #[arg(long)]
        template: String,

        /// Template version (latest if omitted)
        #[arg(long)]
        template_version: Option<u32>,

        /// Account id
        #[arg(long)]
        account: String,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        vars: VarArgs,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Plan a deployment again
    Plan {
        /// Deployment id
        id: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Apply a deployment's plan
    Apply {
        /// Deployment id
        id: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Destroy a deployment's resources
    Destroy {
        /// Deployment id
        id: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Replace a deployment's variables (re-plan afterwards)
    SetVars {
        /// Deployment id
        id: String,

        #[command(flatten)]
        vars: VarArgs,
    },

    /// Show a deployment
    Show {
        /// Deployment id
        id: String,
    },

    /// List deployments, newest first
    List {
        /// Only deployments with this status
        #[arg(long)]
        status: Option<DeploymentStatus>,

        /// Only deployments in this account
        #[arg(long)]
        account: Option<String>,

        /// Maximum number of results
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum VaultCommand {
    /// Write a new random master key (mode 0600)
    GenerateKey {
        /// Destination file; must not exist
        path: PathBuf,
    },

    /// Re-encrypt every credential under a freshly generated key
    RotateKey {
        /// Where to write the new key; must not exist
        #[arg(long)]
        new_key_file: PathBuf,
    },
}

#[derive(Args)]
struct VarArgs {
    /// Variable as name=value; values that parse as JSON are used as JSON
    #[arg(long = "var", value_name = "NAME=VALUE")]
    vars: Vec<String>,

    /// JSON object of variables
    #[arg(long)]
    vars_file: Option<PathBuf>,
}

impl VarArgs {
    async fn variables(&self) -> anyhow::Result<Variables> {
        let mut variables = match &self.vars_file {
            Some(path) => read_json::<Variables>(path).await?,
            None => Variables::new(),
        };
        for pair in &self.vars {
            let (name, raw) = pair
                .split_once('=')
                .with_context(|| format!("expected NAME=VALUE, got {pair:?}"))?;
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_owned()));
            variables.insert(name.to_owned(), value);
        }
        Ok(variables)
    }
}

#[derive(Args)]
struct RunArgs {
    /// Deadline for the engine call, overriding engine.timeout_secs
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl RunArgs {
    fn options(&self) -> OperationOptions {
        self.timeout_secs
            .map(|secs| OperationOptions::with_timeout(Duration::from_secs(secs)))
            .unwrap_or_default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("strata_control=info".parse()?)
                .add_directive("strata::audit=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ControlConfig::from_file(path)?,
        None => ControlConfig::load()?,
    };

    match cli.command {
        Command::Recover => {
            let service = ControlService::connect(config).await?;
            let report = service.startup().await?;
            for id in &report.skipped {
                warn!(deployment_id = %id, "skipped: operation in progress");
            }
            print_json(&report.interrupted)?;
        }
        Command::Template(command) => {
            template_command(&ControlService::connect(config).await?, command).await?;
        }
        Command::Account(command) => {
            account_command(&ControlService::connect(config).await?, command).await?;
        }
        Command::Deploy(command) => {
            deploy_command(&ControlService::connect(config).await?, command).await?;
        }
        Command::Vault(command) => vault_command(config, command).await?,
    }

    Ok(())
}

async fn template_command(service: &ControlService, command: TemplateCommand) -> anyhow::Result<()> {
    let templates = service.templates();
    match command {
        TemplateCommand::Register { file } => {
            let template: NewTemplate = read_json(&file).await?;
            let reference = templates.register(template).await?;
            println!("{reference}");
        }
        TemplateCommand::List {
            provider,
            service_type,
        } => {
            let filter = TemplateFilter {
                provider,
                service_type,
            };
            print_json(&templates.list(&filter).await?)?;
        }
        TemplateCommand::Show { id, version } => {
            print_json(&templates.get(&TemplateId::new(id), version).await?)?;
        }
    }
    Ok(())
}

async fn account_command(service: &ControlService, command: AccountCommand) -> anyhow::Result<()> {
    let accounts = service.accounts();
    match command {
        AccountCommand::Register {
            file,
            credential_file,
        } => {
            let account: NewAccount = read_json(&file).await?;
            let credential = tokio::fs::read_to_string(&credential_file)
                .await
                .with_context(|| format!("failed to read {}", credential_file.display()))?;
            let account = accounts
                .register(account, &SecretValue::new(credential))
                .await?;
            println!("{}", account.id);
        }
        AccountCommand::List { provider } => {
            let filter = AccountFilter {
                provider,
                ..AccountFilter::default()
            };
            print_json(&accounts.list(&filter).await?)?;
        }
    }
    Ok(())
}

async fn deploy_command(service: &ControlService, command: DeployCommand) -> anyhow::Result<()> {
    let orchestrator = service.orchestrator();
    match command {
        DeployCommand::Create {
            template,
            template_version,
            account,
            name,
            vars,
            run,
        } => {
            let id = DeploymentId::generate();
            let mut request = DeploymentRequest::new(
                TemplateId::new(template),
                AccountId::new(account),
                vars.variables().await?,
            )
            .with_id(id.clone());
            request.name = name;
            request.template_version = template_version;

            info!(deployment_id = %id, "creating deployment");
            let record = interruptible(
                orchestrator,
                &id,
                orchestrator.plan_new_with(request, run.options()),
            )
            .await?;
            print_json(&record)?;
        }
        DeployCommand::Plan { id, run } => {
            let id = DeploymentId::new(id);
            let record =
                interruptible(orchestrator, &id, orchestrator.plan_with(&id, run.options())).await?;
            print_json(&record)?;
        }
        DeployCommand::Apply { id, run } => {
            let id = DeploymentId::new(id);
            let record =
                interruptible(orchestrator, &id, orchestrator.apply_with(&id, run.options()))
                    .await?;
            print_json(&record)?;
        }
        DeployCommand::Destroy { id, run } => {
            let id = DeploymentId::new(id);
            let record = interruptible(
                orchestrator,
                &id,
                orchestrator.destroy_with(&id, run.options()),
            )
            .await?;
            print_json(&record)?;
        }
        DeployCommand::SetVars { id, vars } => {
            let record = orchestrator
                .update_variables(&DeploymentId::new(id), vars.variables().await?)
                .await?;
            print_json(&record)?;
        }
        DeployCommand::Show { id } => {
            print_json(&orchestrator.get(&DeploymentId::new(id)).await?)?;
        }
        DeployCommand::List {
            status,
            account,
            limit,
        } => {
            let filter = DeploymentFilter {
                status,
                account_id: account.map(AccountId::new),
                ..DeploymentFilter::new()
            }
            .with_limit(limit);
            print_json(&orchestrator.list(&filter).await?)?;
        }
    }
    Ok(())
}

async fn vault_command(config: ControlConfig, command: VaultCommand) -> anyhow::Result<()> {
    match command {
        // Needs no database or existing key.
        VaultCommand::GenerateKey { path } => {
            MasterKey::generate().write_new(&path)?;
            println!("wrote new master key to {}", path.display());
            Ok(())
        }
        VaultCommand::RotateKey { new_key_file } => {
            let old_key = configured_key(&config.vault)?;
            let service = ControlService::connect(config).await?;
            let new_key = MasterKey::generate();
            new_key.write_new(&new_key_file)?;

            let report = service.vault().rotate_key(&old_key, new_key).await?;
            println!(
                "re-encrypted {} credential(s); set vault.key_file = {:?} and vault.key_version = {}",
                report.reencrypted,
                new_key_file.display().to_string(),
                report.active_version
            );
            Ok(())
        }
    }
}

/// Run a deployment operation, cancelling it on Ctrl-C.
///
/// The operation still runs to completion after cancellation so the state
/// reported so far is persisted before the process exits.
async fn interruptible(
    orchestrator: &DeploymentOrchestrator,
    id: &DeploymentId,
    operation: impl Future<Output = ControlResult<DeploymentRecord>>,
) -> ControlResult<DeploymentRecord> {
    tokio::pin!(operation);
    tokio::select! {
        result = &mut operation => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for Ctrl-C");
            } else {
                warn!(deployment_id = %id, "interrupt received, cancelling");
                if let Err(e) = orchestrator.cancel(id) {
                    warn!(error = %e, "nothing to cancel");
                }
            }
            operation.await
        }
    }
}

fn configured_key(config: &VaultConfig) -> anyhow::Result<MasterKey> {
    match (&config.key_file, &config.master_key) {
        (Some(path), None) => Ok(MasterKey::load(path)?),
        (None, Some(encoded)) => Ok(MasterKey::from_base64(encoded)?),
        _ => bail!("rotation needs exactly one of vault.key_file or vault.master_key"),
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
