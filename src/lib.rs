//! Autonomy supervisor for long-running build agents.
//!
//! `warden` schedules isolated execution runs under a declared [`anchor`],
//! keeps two processes from ever working on the same run ([`lock`]) or
//! workspace ([`workspace`]), retries failures per failure reason
//! ([`retry`], [`queue`]), and stops risky or parallel work at a policy gate
//! ([`governance`]) or a human ([`approval`]). The [`supervisor`] ties them
//! together.

pub mod anchor;
pub mod approval;
pub mod config;
pub mod error;
pub mod evidence;
pub mod fsutil;
pub mod governance;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod supervisor;
pub mod timeout;
pub mod workspace;

pub use anchor::{Anchor, AnchorError, LoadedAnchor};
pub use config::{StateLayout, WardenConfig};
pub use error::{SessionExit, WardenError, WardenResult};
pub use supervisor::{
    BuildExecutor, CommandBuildExecutor, ExecutionReport, RunOutcome, SessionReport, StopHandle,
    Supervisor, SupervisorConfig, WorkItem,
};
