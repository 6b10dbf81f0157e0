use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

use ai_employee::approval::ApprovalGate;
use ai_employee::breaker::HealthRegistry;
use ai_employee::config::{PlatformCredentials, SmtpConfig, VaultConfig};
use ai_employee::error::UnitError;
use ai_employee::pipeline::Classifier;
use ai_employee::posting::{PostingWorker, default_posters};
use ai_employee::producer::{InboxIngest, spawn_inbox_watcher};
use ai_employee::runner::{spawn_classifier_loop, spawn_posting_loop};
use ai_employee::vault::{ClaimManager, Stage, UnitFile, Vault, read_unit};

#[derive(Parser, Debug)]
#[command(name = "ai-employee", version, about = "Folder-queue workflow engine")]
struct Cli {
    /// Vault root directory
    #[arg(long, env = "VAULT_PATH", global = true)]
    vault: Option<PathBuf>,

    /// Agent name used for In_Progress/<agent>
    #[arg(long, env = "VAULT_AGENT", global = true)]
    agent: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the vault directory layout
    Init,

    /// Show file counts per stage
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List units in a stage (default Needs_Action; "pending" for all approval buckets)
    List { stage: Option<String> },

    /// Claim a unit into In_Progress/<agent>
    Claim { file: PathBuf },

    /// Move a unit into a stage
    Release { file: PathBuf, stage: String },

    /// Create a new unit
    New {
        kind: String,

        /// Header field as key=value (repeatable)
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,

        #[arg(long, default_value = "")]
        body: String,

        #[arg(long, default_value = "Needs_Action")]
        stage: String,
    },

    /// Approve a pending unit
    Approve {
        file: PathBuf,
        #[arg(long)]
        by: String,
    },

    /// Reject a pending unit
    Reject {
        file: PathBuf,
        #[arg(long)]
        by: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Run one classifier pass over Needs_Action
    Classify,

    /// Run one posting pass over Approved
    Post,

    /// Run one inbox ingest pass
    Ingest,

    /// Show integration health
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Run the inbox watcher, classifier and posting loops until Ctrl-C
    Run,
}

/// Exit status of `claim` when another agent took the file first.
const NOT_CLAIMED: u8 = 2;

fn parse_field(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() || key.contains(':') {
        return Err(format!("invalid field name {key:?}"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut config = VaultConfig::from_env()?;
    if let Some(vault) = cli.vault {
        config.vault_path = vault;
    }
    if let Some(agent) = cli.agent {
        config.agent = agent;
    }

    let vault = Vault::new(&config.vault_path);
    let _log_guard = init_tracing(&vault);

    match cli.command {
        Command::Init => {
            vault.ensure_layout().await?;
            println!("Vault ready at {}", vault.root().display());
        }
        Command::Status { json } => print_status(&vault, json).await?,
        Command::List { stage } => {
            let files = match stage.as_deref() {
                Some("pending") => vault.list_pending().await?,
                Some(stage) => vault.list(&parse_stage(stage)?).await?,
                None => vault.list(&Stage::NeedsAction).await?,
            };
            for (file, unit) in read_listed(files).await? {
                println!(
                    "{}  [{}]",
                    relative(&vault, &file).display(),
                    unit.get_nonempty("status").unwrap_or("-")
                );
            }
        }
        Command::Claim { file } => {
            let file = vault.locate(&file).await?;
            let code = claim_unit(&ClaimManager::new(vault.clone()), &file, &config.agent).await?;
            return Ok(ExitCode::from(code));
        }
        Command::Release { file, stage } => {
            let file = vault.locate(&file).await?;
            let dest = ClaimManager::new(vault.clone())
                .release(&file, &parse_stage(&stage)?)
                .await?;
            println!("Moved to {}", dest.display());
        }
        Command::New {
            kind,
            fields,
            body,
            stage,
        } => {
            let path = vault.create_unit(&parse_stage(&stage)?, &kind, fields, body).await?;
            println!("{}", path.display());
        }
        Command::Approve { file, by } => {
            let file = vault.locate(&file).await?;
            let dest = ApprovalGate::new(vault.clone(), config.approvers.clone())
                .approve(&file, &by)
                .await?;
            println!("Approved: {}", dest.display());
        }
        Command::Reject { file, by, reason } => {
            let file = vault.locate(&file).await?;
            let dest = ApprovalGate::new(vault.clone(), config.approvers.clone())
                .reject(&file, &by, reason.as_deref())
                .await?;
            println!("Rejected: {}", dest.display());
        }
        Command::Classify => {
            let stats = Classifier::new(&config).run_once().await?;
            println!("{stats:#?}");
        }
        Command::Post => {
            let stats = posting_worker(&config, &vault).await.run_once().await?;
            println!("{stats:#?}");
        }
        Command::Ingest => {
            let stats = InboxIngest::new(vault.clone(), &config.agent).ingest_once().await?;
            println!(
                "Ingested {} file(s), {} failed, {} recovered",
                stats.ingested, stats.failed, stats.recovered
            );
        }
        Command::Health { json } => {
            let report = HealthRegistry::load(&vault, config.breaker).await.report().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Overall: {:?}", report.overall);
                for (name, health) in &report.components {
                    println!("  {name:<12} {:<10} failures={}", health.state, health.failures);
                }
            }
        }
        Command::Run => run(&config, &vault).await?,
    }

    Ok(ExitCode::SUCCESS)
}

/// Console logging filtered by `RUST_LOG` (default `info`), plus a daily file
/// in `<vault>/Logs` once the vault exists.
fn init_tracing(vault: &Vault) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let logs_dir = vault.logs_dir();
    if !logs_dir.is_dir() {
        tracing_subscriber::registry().with(filter).with(console).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&logs_dir, "ai-employee.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Some(guard)
}

async fn claim_unit(claims: &ClaimManager, file: &Path, agent: &str) -> anyhow::Result<u8> {
    match claims.claim(file, agent).await? {
        Some(path) => {
            println!("Claimed: {}", path.display());
            Ok(0)
        }
        None => {
            println!("Not claimed: {} was taken by another agent", file.display());
            Ok(NOT_CLAIMED)
        }
    }
}

/// Read listed units, skipping files moved away since the listing.
async fn read_listed(files: Vec<PathBuf>) -> Result<Vec<(PathBuf, UnitFile)>, UnitError> {
    let mut units = Vec::with_capacity(files.len());
    for file in files {
        match read_unit(&file).await {
            Ok(unit) => units.push((file, unit)),
            Err(UnitError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(units)
}

fn parse_stage(raw: &str) -> anyhow::Result<Stage> {
    raw.parse::<Stage>()
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("invalid stage {raw:?}"))
}

async fn posting_worker(config: &VaultConfig, vault: &Vault) -> PostingWorker {
    let health = Arc::new(HealthRegistry::load(vault, config.breaker).await);
    let posters = default_posters(config.live, SmtpConfig::from_env(), &PlatformCredentials::from_env());
    PostingWorker::new(config, posters, health)
}

async fn print_status(vault: &Vault, json: bool) -> anyhow::Result<()> {
    let status = vault.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Vault: {}", status.root.display());
    for (stage, count) in &status.stages {
        println!("  {stage:<20} {count}");
    }
    println!("Pending approval: {}", status.pending_total);
    for (platform, count) in &status.pending_by_platform {
        println!("  {platform:<20} {count}");
    }
    println!("In progress: {}", status.in_progress_total);
    for (agent, count) in &status.in_progress_by_agent {
        println!("  {agent:<20} {count}");
    }
    Ok(())
}

async fn run(config: &VaultConfig, vault: &Vault) -> anyhow::Result<()> {
    vault.ensure_layout().await?;
    tracing::info!(
        vault = %vault.root().display(),
        agent = %config.agent,
        live = config.live,
        "AI Employee starting"
    );
    if !config.live {
        tracing::warn!("Dry-run mode: posters will not contact external services (set VAULT_LIVE=true)");
    }

    let (inbox_handle, inbox_stop) = spawn_inbox_watcher(
        InboxIngest::new(vault.clone(), &config.agent),
        config.inbox_rescan_interval,
    )?;
    let (classify_handle, classify_stop) =
        spawn_classifier_loop(Classifier::new(config), config.classify_interval);
    let (post_handle, post_stop) =
        spawn_posting_loop(posting_worker(config, vault).await, config.post_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    for stop in [&inbox_stop, &classify_stop, &post_stop] {
        stop.store(true, Ordering::Relaxed);
    }
    for handle in [inbox_handle, classify_handle, post_handle] {
        handle.await.ok();
    }
    tracing::info!("AI Employee stopped");
    Ok(())
}

fn relative<'a>(vault: &Vault, path: &'a Path) -> &'a Path {
    path.strip_prefix(vault.root()).unwrap_or(path)
}
