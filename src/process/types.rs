use crate::config::ProcessSpec;
use crate::error::{DroverError, Result};
use crate::process::restart::RestartTracker;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

/// Unique identifier for one launch of a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Starting,
    Running,
    Exited,
    Restarting,
    Stopped,
}

impl InstanceState {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Starting, Running) => true,
            (Running, Exited) => true,
            (Exited, Restarting) => true,
            (Restarting, Starting) => true,
            _ => false,
        }
    }

    /// An OS process may exist for this instance
    pub fn is_live(self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Exited => write!(f, "exited"),
            InstanceState::Restarting => write!(f, "restarting"),
            InstanceState::Stopped => write!(f, "stopped"),
        }
    }
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Killed after ignoring the terminate signal for the whole grace period
    pub forced: bool,
    pub at: SystemTime,
}

impl ExitRecord {
    pub fn from_status(status: std::process::ExitStatus, forced: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            forced,
            at: SystemTime::now(),
        }
    }

    /// Exit status could not be collected
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            forced: false,
            at: SystemTime::now(),
        }
    }
}

impl std::fmt::Display for ExitRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code)?,
            (None, Some(signal)) => write!(f, "signal {}", signal)?,
            (None, None) => write!(f, "unknown")?,
        }
        if self.forced {
            write!(f, " (killed)")?;
        }
        Ok(())
    }
}

/// Why the core asked an instance to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MemoryExceeded,
    UserRequest,
    Shutdown,
}

/// Request sent from the core to an instance's watcher task
#[derive(Debug, Clone, Copy)]
pub struct StopRequest {
    pub grace: Duration,
}

/// One launch of a spec. Owned and mutated only by the supervisor core.
#[derive(Debug)]
pub struct ProcessInstance {
    pub id: InstanceId,
    pub spec: Arc<ProcessSpec>,
    pub pid: Option<u32>,
    pub state: InstanceState,
    pub started_at: SystemTime,
    pub restart_count: u32,
    pub last_exit: Option<ExitRecord>,
    pub memory_bytes: u64,
    pub last_error: Option<String>,
    pub log_degraded: Option<String>,
    /// Went to `Stopped` because spawning failed during supervisor startup
    pub startup_failure: bool,
    /// Set once a stop has been requested; a second request is not sent
    pub stop_reason: Option<StopReason>,
    pub tracker: RestartTracker,
    pub(crate) stopper: Option<mpsc::Sender<StopRequest>>,
}

impl ProcessInstance {
    pub fn new(id: InstanceId, spec: Arc<ProcessSpec>, restart_count: u32, tracker: RestartTracker) -> Self {
        Self {
            id,
            spec,
            pid: None,
            state: InstanceState::Starting,
            started_at: SystemTime::now(),
            restart_count,
            last_exit: None,
            memory_bytes: 0,
            last_error: None,
            log_degraded: None,
            startup_failure: false,
            stop_reason: None,
            tracker,
            stopper: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.started_at)
            .unwrap_or(Duration::from_secs(0))
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, next: InstanceState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DroverError::InvalidTransition {
                name: self.spec.name.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        self.state = next;
        if !next.is_live() {
            self.pid = None;
            self.memory_bytes = 0;
            self.stopper = None;
        }
        Ok(())
    }

    pub fn mark_running(&mut self, pid: u32) -> Result<()> {
        self.transition(InstanceState::Running)?;
        self.pid = Some(pid);
        self.started_at = SystemTime::now();
        Ok(())
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            name: self.spec.name.clone(),
            instance: self.id,
            pid: self.pid,
            state: self.state,
            restart_count: self.restart_count,
            uptime: if self.state.is_live() {
                self.uptime()
            } else {
                Duration::from_secs(0)
            },
            memory_bytes: self.memory_bytes,
            memory_ceiling: self.spec.memory_ceiling,
            last_exit: self.last_exit.clone(),
            last_error: self.last_error.clone(),
            log_degraded: self.log_degraded.clone(),
            startup_failure: self.startup_failure,
        }
    }
}

/// Read-only view of an instance, published after every table change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub instance: InstanceId,
    pub pid: Option<u32>,
    pub state: InstanceState,
    pub restart_count: u32,
    pub uptime: Duration,
    pub memory_bytes: u64,
    pub memory_ceiling: Option<u64>,
    pub last_exit: Option<ExitRecord>,
    pub last_error: Option<String>,
    pub log_degraded: Option<String>,
    pub startup_failure: bool,
}
