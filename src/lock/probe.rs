//! Process liveness checks.
//!
//! Lock and lease reclamation only ever removes state whose recorded holder
//! is verified dead. That verification is a capability so the core logic does
//! not depend on a particular platform's process model.

use std::fmt::Debug;

/// Capability to answer whether a process recorded in a lock is still running.
pub trait ProcessProbe: Send + Sync + Debug {
    /// Whether `pid` refers to a live process on this host.
    fn is_process_alive(&self, pid: u32) -> bool;

    /// Name of the host this process runs on.
    fn hostname(&self) -> String;

    /// Whether a holder recorded as `(pid, hostname)` must be treated as alive.
    ///
    /// Holders on another host cannot be verified and are always reported alive.
    fn holder_alive(&self, pid: u32, hostname: &str) -> bool {
        if hostname != self.hostname() {
            return true;
        }
        self.is_process_alive(pid)
    }
}

/// Liveness probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_process_alive(&self, pid: u32) -> bool {
        is_process_running(pid)
    }

    fn hostname(&self) -> String {
        current_hostname()
    }
}

/// Hostname of the current machine.
pub fn current_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            let name = name.to_string_lossy().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: exists but belongs to another user.
        Err(_) => true,
    }
}

#[cfg(windows)]
fn is_process_running(pid: u32) -> bool {
    use std::process::Command;
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|o| {
            let out = String::from_utf8_lossy(&o.stdout);
            o.status.success() && !out.contains("INFO:") && out.contains(&pid.to_string())
        })
        .unwrap_or(true)
}

#[cfg(not(any(unix, windows)))]
fn is_process_running(_pid: u32) -> bool {
    true
}

/// Probe with fixed answers, for tests.
#[derive(Debug, Clone)]
pub struct FixedProbe {
    alive: bool,
    hostname: String,
}

impl FixedProbe {
    /// Probe that reports every local process as alive.
    pub fn alive() -> Self {
        Self {
            alive: true,
            hostname: current_hostname(),
        }
    }

    /// Probe that reports every local process as dead.
    pub fn dead() -> Self {
        Self {
            alive: false,
            hostname: current_hostname(),
        }
    }
}

impl ProcessProbe for FixedProbe {
    fn is_process_alive(&self, _pid: u32) -> bool {
        self.alive
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }
}
