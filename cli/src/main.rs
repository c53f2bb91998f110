//! `wardenctl`: operator console for a running or finished warden session.
//!
//! Decisions are dropped into the state directory's mailbox; the supervisor
//! that owns the request picks them up on its next poll.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;

use warden::approval::{ApprovalRequest, ApprovalStatus, ApprovalStore, Decision, Mailbox};
use warden::config::{StateLayout, WardenConfig};
use warden::lock::{RunLockManager, SystemProbe};
use warden::queue::{PendingActionQueue, QueueItem};
use warden::workspace::{IsolationLevel, WorkspaceIsolationManager};

#[derive(Parser)]
#[command(name = "wardenctl", version, about = "Approve, reject and inspect warden sessions")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Extra configuration file, layered over warden.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List approval requests still waiting for a decision
    Approvals {
        /// Include decided and timed-out requests
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Approve a pending request
    Approve {
        id: String,
        /// Recorded as the responder
        #[arg(long)]
        by: Option<String>,
    },
    /// Reject a pending request
    Reject {
        id: String,
        #[arg(long)]
        by: Option<String>,
    },
    /// List queue items escalated for manual handling
    NeedsManual {
        #[arg(long)]
        json: bool,
    },
    /// Show workspace leases and run locks with holder liveness
    Leases,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_root = match cli.project {
        Some(path) => path,
        None => env::current_dir().context("reading current directory")?,
    };
    let config = WardenConfig::load(&project_root, cli.config.as_deref())
        .context("loading warden configuration")?;
    let layout = StateLayout::new(config.state_dir(&project_root));

    match cli.command {
        Commands::Approvals { all, json } => list_approvals(&layout, all, json),
        Commands::Approve { id, by } => decide(&layout, &id, Decision::Approve, by),
        Commands::Reject { id, by } => decide(&layout, &id, Decision::Reject, by),
        Commands::NeedsManual { json } => needs_manual(&layout, &config, json),
        Commands::Leases => leases(&project_root, &layout),
    }
}

fn list_approvals(layout: &StateLayout, all: bool, json: bool) -> Result<()> {
    let store = ApprovalStore::new(layout.approvals_path());
    let requests = if all {
        store.list()?
    } else {
        store.list_pending()?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }
    if requests.is_empty() {
        println!("No approval requests.");
        return Ok(());
    }
    for request in &requests {
        print_request(request);
    }
    Ok(())
}

fn print_request(request: &ApprovalRequest) {
    let label = request.status.as_str();
    let status = match request.status {
        ApprovalStatus::Pending => label.yellow(),
        ApprovalStatus::Approved => label.green(),
        ApprovalStatus::Rejected | ApprovalStatus::Timeout => label.red(),
    };
    let remaining = request.expires_at.signed_duration_since(Utc::now()).num_seconds();
    println!(
        "{} {} run={} type={}",
        request.id.bold(),
        status,
        request.run_id,
        request.action_type
    );
    if request.status.is_terminal() {
        if let Some(at) = request.responded_at {
            println!("    responded {}", at.to_rfc3339());
        }
    } else if remaining > 0 {
        println!("    expires in {}s", remaining);
    } else {
        println!("    {}", "expired, awaiting sweep".dimmed());
    }
    if !request.decision_info.is_null() {
        println!("    {}", request.decision_info);
    }
}

fn decide(layout: &StateLayout, id: &str, decision: Decision, by: Option<String>) -> Result<()> {
    let store = ApprovalStore::new(layout.approvals_path());
    let Some(request) = store.get(id)? else {
        bail!("no approval request with id {}", id);
    };
    if request.status.is_terminal() {
        println!(
            "{} is already {}; nothing to do",
            request.id,
            request.status.as_str().bold()
        );
        return Ok(());
    }

    let by = by.or_else(|| env::var("USER").ok());
    let path = Mailbox::new(layout.mailbox_dir()).submit(id, decision, by)?;
    let verb = match decision {
        Decision::Approve => "approve".green(),
        Decision::Reject => "reject".red(),
    };
    println!("Submitted {} for {} ({})", verb, id.bold(), path.display());
    Ok(())
}

fn needs_manual(layout: &StateLayout, config: &WardenConfig, json: bool) -> Result<()> {
    let queue = PendingActionQueue::new(layout.queue_path(), config.retry_engine());
    let items = queue.needs_manual()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    if items.is_empty() {
        println!("Nothing needs manual attention.");
        return Ok(());
    }
    for item in &items {
        print_item(item);
    }
    Ok(())
}

fn print_item(item: &QueueItem) {
    let kind = serde_json::to_value(item.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    println!(
        "{} {} {} reason={} attempts={}",
        item.id.bold(),
        kind,
        item.source,
        item.reason.yellow(),
        item.attempt_count
    );
    if let Some(destination) = &item.destination {
        println!("    -> {}", destination);
    }
    if let Some(error) = &item.last_error {
        println!("    {}", error.dimmed());
    }
}

fn leases(project_root: &Path, layout: &StateLayout) -> Result<()> {
    let probe = Arc::new(SystemProbe);
    let workspaces =
        WorkspaceIsolationManager::new(project_root, layout.root(), IsolationLevel::None, probe.clone());
    let leases = workspaces.list_leases()?;
    let locks = RunLockManager::new(layout.locks_dir(), probe).list_locks()?;

    if leases.is_empty() && locks.is_empty() {
        println!("No leases or locks.");
        return Ok(());
    }
    for lease in &leases {
        let state = if workspaces.is_orphaned(lease) {
            "orphaned".red()
        } else {
            "live".green()
        };
        println!(
            "lease {} {} pid={} {}",
            lease.run_id.bold(),
            state,
            lease.leased_by.pid,
            lease.workspace_path.display()
        );
    }
    for lock in &locks {
        let state = if lock.holder_alive {
            "live".green()
        } else {
            "stale".red()
        };
        println!(
            "lock  {} {} pid={} host={}",
            lock.run_id.bold(),
            state,
            lock.holder.pid,
            lock.holder.hostname
        );
    }
    Ok(())
}
