use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warden::anchor::Anchor;
use warden::approval::{
    server, ApprovalGateway, ApprovalStore, LogNotifier, Mailbox, Notifier, WebhookNotifier,
};
use warden::config::{StateLayout, WardenConfig};
use warden::error::{SessionExit, WardenError, WardenResult};
use warden::evidence::{EvidenceExporter, EvidenceStore, EvidenceStoreConfig};
use warden::governance::{GateDecision, GovernanceGate, ProtectedPaths};
use warden::lock::{RunLockManager, SystemProbe};
use warden::metrics::{format_metrics, SessionMetricsStore};
use warden::queue::{FileMoveApplier, PendingActionQueue, QueueItem, QueueStatus};
use warden::supervisor::{CommandBuildExecutor, Supervisor, SupervisorConfig};
use warden::workspace::{IsolationLevel, WorkspaceIsolationManager};

#[derive(Parser)]
#[command(name = "warden", version, about = "Autonomy supervisor for long-running build agents")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Extra configuration file, layered over warden.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise one or more runs under an anchor
    Supervise {
        /// Run identifiers
        #[arg(required_unless_present = "resume_due")]
        runs: Vec<String>,

        /// Anchor file (TOML or JSON)
        #[arg(long, default_value = "anchor.toml")]
        anchor: PathBuf,

        /// Requested worker count
        #[arg(short, long, default_value_t = 1)]
        workers: u32,

        /// Give every run its own storage directory
        #[arg(long)]
        isolated_storage: bool,

        /// Also dispatch deferred runs whose retry is due
        #[arg(long)]
        resume_due: bool,

        /// Print the session report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List workspace leases and run locks
    ListLeases {
        #[arg(long)]
        json: bool,
    },

    /// Reclaim dead locks and leases, purge old queue items and evidence
    Cleanup,

    /// Inspect or process the pending action queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Export a session's evidence as JSON (latest session by default)
    Report {
        session: Option<String>,

        /// Print the run metrics as a readable summary instead
        #[arg(long)]
        summary: bool,
    },

    /// Print the anchor JSON schema
    Schema,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Apply due file moves
    Process {
        /// Anchor whose protected paths guard move destinations
        #[arg(long, default_value = "anchor.toml")]
        anchor: PathBuf,
    },
    /// List queue items
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long)]
        json: bool,
    },
    /// List items that need a human
    NeedsManual {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Succeeded,
    Abandoned,
    NeedsManual,
}

impl From<StatusArg> for QueueStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => QueueStatus::Pending,
            StatusArg::Succeeded => QueueStatus::Succeeded,
            StatusArg::Abandoned => QueueStatus::Abandoned,
            StatusArg::NeedsManual => QueueStatus::NeedsManual,
        }
    }
}

struct Context {
    project_root: PathBuf,
    config: WardenConfig,
    layout: StateLayout,
}

impl Context {
    fn load(cli: &Cli) -> WardenResult<Self> {
        let project_root = match &cli.project {
            Some(path) => path.clone(),
            None => std::env::current_dir()?,
        };
        let config = WardenConfig::load(&project_root, cli.config.as_deref())?;
        let layout = StateLayout::new(config.state_dir(&project_root));
        Ok(Self {
            project_root,
            config,
            layout,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    fn queue(&self) -> PendingActionQueue {
        PendingActionQueue::new(self.layout.queue_path(), self.config.retry_engine())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(exit) => exit.into(),
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            err.exit_code().into()
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "warden=debug" } else { "warden=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> WardenResult<SessionExit> {
    if let Commands::Schema = cli.command {
        let schema = serde_json::to_string_pretty(&Anchor::schema())
            .map_err(|e| WardenError::Other(e.to_string()))?;
        println!("{}", schema);
        return Ok(SessionExit::Success);
    }

    let ctx = Context::load(&cli)?;
    match cli.command {
        Commands::Supervise {
            runs,
            anchor,
            workers,
            isolated_storage,
            resume_due,
            json,
        } => cmd_supervise(&ctx, runs, &anchor, workers, isolated_storage, resume_due, json).await,
        Commands::ListLeases { json } => cmd_list_leases(&ctx, json),
        Commands::Cleanup => cmd_cleanup(&ctx).await,
        Commands::Queue { action } => match action {
            QueueAction::Process { anchor } => cmd_queue_process(&ctx, &anchor).await,
            QueueAction::List { status, json } => {
                let queue = ctx.queue();
                let items = match status {
                    Some(status) => queue.list_by_status(status.into())?,
                    None => queue.list()?,
                };
                print_items(&items, json)
            }
            QueueAction::NeedsManual { json } => print_items(&ctx.queue().needs_manual()?, json),
        },
        Commands::Report { session, summary } => cmd_report(&ctx, session.as_deref(), summary),
        Commands::Schema => Ok(SessionExit::Success),
    }
}

async fn cmd_supervise(
    ctx: &Context,
    runs: Vec<String>,
    anchor_path: &Path,
    workers: u32,
    isolated_storage: bool,
    resume_due: bool,
    json: bool,
) -> WardenResult<SessionExit> {
    let anchor = Anchor::load(&ctx.resolve(anchor_path))?;
    // Refuse before any executor or callback setup can fail.
    if let GateDecision::Deny(reason) = GovernanceGate.check(&anchor.anchor, workers) {
        warn!(reason = %reason, "Governance gate denied session");
        return Err(WardenError::GovernanceDenied(reason));
    }

    let settings = &ctx.config;
    let command = settings.executor.command.clone().ok_or_else(|| {
        WardenError::Other(
            "no executor command configured (set executor.command or WARDEN_EXECUTOR__COMMAND)"
                .to_string(),
        )
    })?;
    let timeouts = settings.timeouts();
    let executor = CommandBuildExecutor::new(command)
        .with_args(settings.executor.args.clone())
        .with_timeout(timeouts.executor_timeout);

    let notifier: Arc<dyn Notifier> = match &settings.approval.webhook_url {
        Some(url) => {
            let mut webhook = WebhookNotifier::new(url.clone());
            if let Some(bind) = &settings.approval.callback_bind {
                webhook = webhook.with_callback_base(format!("http://{}", bind));
            }
            Arc::new(webhook)
        }
        None => Arc::new(LogNotifier),
    };
    let gateway = Arc::new(
        ApprovalGateway::new(
            ApprovalStore::new(ctx.layout.approvals_path()),
            Mailbox::new(ctx.layout.mailbox_dir()),
            notifier,
        )
        .with_timeout(timeouts.approval_timeout),
    );

    let (server_stop_tx, server_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = match &settings.approval.callback_bind {
        Some(bind) => {
            let listener = tokio::net::TcpListener::bind(bind.as_str()).await?;
            let router = server::router(gateway.clone(), settings.approval.callback_secret.clone());
            Some(tokio::spawn(server::serve(listener, router, async move {
                let _ = server_stop_rx.await;
            })))
        }
        None => None,
    };

    let config = SupervisorConfig::new(&ctx.project_root, ctx.layout.root())
        .with_workers(workers)
        .with_per_run_storage(isolated_storage)
        .with_resume_due(resume_due)
        .with_inline_backoff_ceiling(settings.inline_backoff_ceiling())
        .with_timeouts(timeouts)
        .with_base_branch(settings.workspace.base_branch.clone())
        .with_branch_prefix(settings.workspace.branch_prefix.clone())
        .with_evidence_config(EvidenceStoreConfig::new(settings.evidence.retention_days));
    let supervisor = Supervisor::new(
        config,
        Arc::new(executor),
        gateway,
        settings.retry_engine(),
        Arc::new(SystemProbe),
    );

    let stop = supervisor.stop_handle();
    if let Err(err) = ctrlc::set_handler(move || {
        eprintln!("Stopping: no new runs will start; in-flight runs will finish");
        stop.stop();
    }) {
        warn!(error = %err, "Failed to install Ctrl-C handler");
    }

    let result = supervisor.run(&runs, &anchor).await;

    let _ = server_stop_tx.send(());
    if let Some(handle) = server {
        match handle.await {
            Ok(Err(err)) => warn!(error = %err, "Callback server failed"),
            Err(err) => warn!(error = %err, "Callback server task failed"),
            Ok(Ok(())) => {}
        }
    }

    let report = result?;
    if json {
        let out = serde_json::to_string_pretty(&report).map_err(|e| WardenError::Other(e.to_string()))?;
        println!("{}", out);
    } else {
        println!("{}", report);
    }
    Ok(report.exit())
}

fn cmd_list_leases(ctx: &Context, json: bool) -> WardenResult<SessionExit> {
    let probe = Arc::new(SystemProbe);
    let workspaces = WorkspaceIsolationManager::new(
        &ctx.project_root,
        ctx.layout.root(),
        IsolationLevel::None,
        probe.clone(),
    );
    let leases = workspaces.list_leases()?;
    let locks = RunLockManager::new(ctx.layout.locks_dir(), probe).list_locks()?;

    if json {
        let out = serde_json::json!({ "leases": leases, "locks": locks });
        println!("{}", serde_json::to_string_pretty(&out).map_err(|e| WardenError::Other(e.to_string()))?);
        return Ok(SessionExit::Success);
    }

    println!("{}", "Leases".bold());
    if leases.is_empty() {
        println!("  (none)");
    }
    for lease in &leases {
        let state = if workspaces.is_orphaned(lease) {
            "orphaned".red().to_string()
        } else {
            "live".green().to_string()
        };
        println!(
            "  {:<24} {:<9} {:<8} pid={} {}",
            lease.run_id,
            lease.isolation.to_string(),
            state,
            lease.leased_by.pid,
            lease.workspace_path.display()
        );
    }

    println!("{}", "Locks".bold());
    if locks.is_empty() {
        println!("  (none)");
    }
    for lock in &locks {
        let state = if lock.holder_alive {
            "live".green().to_string()
        } else {
            "stale".red().to_string()
        };
        println!(
            "  {:<24} {:<8} pid={} host={} since {}",
            lock.run_id,
            state,
            lock.holder.pid,
            lock.holder.hostname,
            lock.holder.acquired_at.to_rfc3339()
        );
    }
    Ok(SessionExit::Success)
}

async fn cmd_cleanup(ctx: &Context) -> WardenResult<SessionExit> {
    let probe = Arc::new(SystemProbe);
    let settings = &ctx.config;

    let unlocked = RunLockManager::new(ctx.layout.locks_dir(), probe.clone()).reclaim_stale()?;
    let workspaces = WorkspaceIsolationManager::new(
        &ctx.project_root,
        ctx.layout.root(),
        IsolationLevel::Worktree,
        probe,
    )
    .with_git_timeout(Duration::from_secs(settings.workspace.git_timeout_secs));
    let leases = workspaces.cleanup_all().await?;

    let max_age = Duration::from_secs(settings.queue.retention_days.saturating_mul(86_400));
    let purged = ctx
        .queue()
        .cleanup_old_items(max_age, &[QueueStatus::Succeeded, QueueStatus::Abandoned])?;

    let evidence = EvidenceStore::new(
        ctx.layout.root(),
        EvidenceStoreConfig::new(settings.evidence.retention_days),
    )?;
    let pruned = evidence.enforce_retention()?;
    let metrics = SessionMetricsStore::new(ctx.layout.root());
    for session_id in &pruned {
        if let Err(err) = metrics.delete(session_id) {
            warn!(session_id = %session_id, error = %err, "Failed to delete session metrics");
        }
    }

    info!(
        locks = unlocked.len(),
        leases = leases.reclaimed_leases.len(),
        worktrees = leases.orphaned_worktrees.len(),
        queue_items = purged,
        sessions = pruned.len(),
        "Cleanup finished"
    );
    println!("{}", "Cleanup".bold());
    println!("  stale locks removed:     {}", unlocked.len());
    println!("  orphaned leases:         {}", leases.reclaimed_leases.len());
    println!("  orphaned worktrees:      {}", leases.orphaned_worktrees.len());
    println!("  live leases kept:        {}", leases.live_leases.len());
    println!("  queue items purged:      {}", purged);
    println!("  evidence sessions pruned: {}", pruned.len());
    Ok(SessionExit::Success)
}

async fn cmd_queue_process(ctx: &Context, anchor_path: &Path) -> WardenResult<SessionExit> {
    let anchor_path = ctx.resolve(anchor_path);
    let protected = if anchor_path.exists() {
        ProtectedPaths::from_anchor(&Anchor::load(&anchor_path)?.anchor)
    } else {
        ProtectedPaths::default()
    };
    let applier = FileMoveApplier::new(&ctx.project_root).with_protected_paths(protected);

    let report = ctx.queue().process_due(&applier, Utc::now()).await?;
    println!(
        "processed: {} succeeded, {} rescheduled, {} needs manual, {} abandoned",
        report.succeeded.green(),
        report.rescheduled.yellow(),
        report.needs_manual.red(),
        report.abandoned
    );
    Ok(SessionExit::Success)
}

fn cmd_report(ctx: &Context, session: Option<&str>, summary: bool) -> WardenResult<SessionExit> {
    let exporter = EvidenceExporter::new(ctx.layout.root())?;
    let export = match session {
        Some(id) => exporter.export_session(id)?,
        None => match exporter.export_latest()? {
            Some(export) => export,
            None => {
                eprintln!("no sessions recorded");
                return Ok(SessionExit::Success);
            }
        },
    };
    if summary {
        match &export.metrics {
            Some(metrics) => println!("{}", format_metrics(metrics)),
            None => eprintln!("no metrics recorded for {}", export.session_id),
        }
        return Ok(SessionExit::Success);
    }
    let out = serde_json::to_string_pretty(&export).map_err(|e| WardenError::Other(e.to_string()))?;
    println!("{}", out);
    Ok(SessionExit::Success)
}

fn print_items(items: &[QueueItem], json: bool) -> WardenResult<SessionExit> {
    if json {
        let out = serde_json::to_string_pretty(items).map_err(|e| WardenError::Other(e.to_string()))?;
        println!("{}", out);
        return Ok(SessionExit::Success);
    }
    if items.is_empty() {
        println!("no queue items");
    }
    for item in items {
        let status = match item.status {
            QueueStatus::Pending => item.status.yellow().to_string(),
            QueueStatus::Succeeded => item.status.green().to_string(),
            QueueStatus::NeedsManual => item.status.red().bold().to_string(),
            QueueStatus::Abandoned => item.status.dimmed().to_string(),
        };
        let next = item
            .next_retry_at
            .map(|t| format!(" next={}", t.to_rfc3339()))
            .unwrap_or_default();
        println!(
            "{:<22} {:<12} {:<24} reason={} attempts={}{}",
            item.id, status, item.source, item.reason, item.attempt_count, next
        );
    }
    Ok(SessionExit::Success)
}
