use crate::config::Settings;
use crate::process::types::{InstanceState, ProcessInstance, StopReason};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Decides what happens to an instance after it exits or breaches its
/// memory ceiling. The supervisor core carries out the decision.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Floor between two starts of the same spec, guarding against crash loops
    pub min_restart_interval: Duration,
}

/// Outcome of [`RestartPolicy::on_exit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Relaunch after `delay`
    Restart { delay: Duration },
    /// Move to `Stopped` for good
    Retire(RetireReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    Shutdown,
    StopRequested,
    AutorestartDisabled,
}

impl std::fmt::Display for RetireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetireReason::Shutdown => write!(f, "supervisor shutting down"),
            RetireReason::StopRequested => write!(f, "stop requested"),
            RetireReason::AutorestartDisabled => write!(f, "autorestart disabled"),
        }
    }
}

/// Outcome of [`RestartPolicy::on_memory_exceeded`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryVerdict {
    Terminate { grace: Duration },
    Ignore,
}

impl RestartPolicy {
    pub fn new(min_restart_interval: Duration) -> Self {
        Self {
            min_restart_interval,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.min_restart_interval())
    }

    /// Exited → Restarting or Exited → Stopped.
    ///
    /// Every exit is restart-eligible when autorestart is on, whatever the
    /// exit code, including memory-triggered kills. Shutdown wins over restart.
    pub fn on_exit(&self, instance: &ProcessInstance, shutting_down: bool) -> ExitDecision {
        if shutting_down || instance.stop_reason == Some(StopReason::Shutdown) {
            return ExitDecision::Retire(RetireReason::Shutdown);
        }

        if instance.stop_reason == Some(StopReason::UserRequest) {
            return ExitDecision::Retire(RetireReason::StopRequested);
        }

        if !instance.spec.autorestart {
            return ExitDecision::Retire(RetireReason::AutorestartDisabled);
        }

        ExitDecision::Restart {
            delay: self.restart_delay(instance.uptime()),
        }
    }

    /// Time left before the floor since the previous start has passed
    pub fn restart_delay(&self, uptime: Duration) -> Duration {
        self.min_restart_interval.saturating_sub(uptime)
    }

    /// Terminate a running instance whose sample is above its ceiling,
    /// unless a stop is already under way
    pub fn on_memory_exceeded(&self, instance: &ProcessInstance, bytes: u64) -> MemoryVerdict {
        let over = instance
            .spec
            .memory_ceiling
            .is_some_and(|ceiling| bytes > ceiling);

        if over && instance.state == InstanceState::Running && instance.stop_reason.is_none() {
            MemoryVerdict::Terminate {
                grace: instance.spec.kill_timeout,
            }
        } else {
            MemoryVerdict::Ignore
        }
    }

    /// Restarting → Starting, re-checked when the delay elapses
    pub fn may_relaunch(&self, instance: &ProcessInstance, shutting_down: bool) -> bool {
        !shutting_down
            && instance.state == InstanceState::Restarting
            && instance.stop_reason != Some(StopReason::UserRequest)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// How long restart timestamps are remembered
pub const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Tracks recent restarts of a spec across its instances
#[derive(Debug, Clone)]
pub struct RestartTracker {
    /// Restart times within `window`, oldest first
    restart_times: VecDeque<Instant>,
    window: Duration,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::with_window(RESTART_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            restart_times: VecDeque::new(),
            window,
        }
    }

    /// Record a restart now and forget the ones that fell out of the window
    pub fn record_restart(&mut self) {
        let now = Instant::now();
        while let Some(&oldest) = self.restart_times.front() {
            if now.duration_since(oldest) < self.window {
                break;
            }
            self.restart_times.pop_front();
        }
        self.restart_times.push_back(now);
    }

    /// Count restarts within `window`, capped by the tracker's own window
    pub fn count_recent_restarts(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.restart_times
            .iter()
            .filter(|&&time| now.duration_since(time) < window)
            .count()
    }
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogTarget, ProcessSpec};
    use crate::process::types::InstanceId;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    fn instance(autorestart: bool, ceiling: Option<u64>) -> ProcessInstance {
        let spec = Arc::new(ProcessSpec {
            name: "w".to_string(),
            script: PathBuf::from("/bin/sleep"),
            interpreter: None,
            args: vec![],
            env: BTreeMap::new(),
            cwd: PathBuf::from("/tmp"),
            memory_ceiling: ceiling,
            log: LogTarget {
                out_file: PathBuf::from("/tmp/w.log"),
                error_file: PathBuf::from("/tmp/w.log"),
                merge: true,
                rotate: true,
                max_size: 1024,
                date_format: None,
            },
            autorestart,
            kill_timeout: Duration::from_millis(500),
            enabled: true,
        });
        let mut instance = ProcessInstance::new(InstanceId::new(1), spec, 0, RestartTracker::new());
        instance.mark_running(100).unwrap();
        instance
    }

    #[test]
    fn test_exit_restarts_when_autorestart() {
        let policy = RestartPolicy::new(Duration::from_secs(1));
        let mut inst = instance(true, None);
        inst.transition(InstanceState::Exited).unwrap();

        match policy.on_exit(&inst, false) {
            ExitDecision::Restart { delay } => assert!(delay <= Duration::from_secs(1)),
            other => panic!("Expected restart, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_retires_without_autorestart() {
        let policy = RestartPolicy::default();
        let inst = instance(false, None);
        assert_eq!(
            policy.on_exit(&inst, false),
            ExitDecision::Retire(RetireReason::AutorestartDisabled)
        );
    }

    #[test]
    fn test_shutdown_takes_precedence() {
        let policy = RestartPolicy::default();
        let inst = instance(true, None);
        assert_eq!(
            policy.on_exit(&inst, true),
            ExitDecision::Retire(RetireReason::Shutdown)
        );
    }

    #[test]
    fn test_user_stop_is_not_restarted() {
        let policy = RestartPolicy::default();
        let mut inst = instance(true, None);
        inst.stop_reason = Some(StopReason::UserRequest);
        assert_eq!(
            policy.on_exit(&inst, false),
            ExitDecision::Retire(RetireReason::StopRequested)
        );
    }

    #[test]
    fn test_memory_kill_is_restart_eligible() {
        let policy = RestartPolicy::new(Duration::ZERO);
        let mut inst = instance(true, Some(100));
        inst.stop_reason = Some(StopReason::MemoryExceeded);
        assert_eq!(
            policy.on_exit(&inst, false),
            ExitDecision::Restart {
                delay: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_restart_delay_floor() {
        let policy = RestartPolicy::new(Duration::from_secs(1));
        assert_eq!(
            policy.restart_delay(Duration::from_millis(300)),
            Duration::from_millis(700)
        );
        assert_eq!(policy.restart_delay(Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn test_memory_verdict() {
        let policy = RestartPolicy::default();
        let mut inst = instance(true, Some(100_000_000));

        assert_eq!(policy.on_memory_exceeded(&inst, 50_000_000), MemoryVerdict::Ignore);
        assert_eq!(
            policy.on_memory_exceeded(&inst, 150_000_000),
            MemoryVerdict::Terminate {
                grace: Duration::from_millis(500)
            }
        );

        // A second breach while the first kill is pending is ignored
        inst.stop_reason = Some(StopReason::MemoryExceeded);
        assert_eq!(policy.on_memory_exceeded(&inst, 150_000_000), MemoryVerdict::Ignore);
    }

    #[test]
    fn test_memory_verdict_without_ceiling() {
        let policy = RestartPolicy::default();
        let inst = instance(true, None);
        assert_eq!(policy.on_memory_exceeded(&inst, u64::MAX), MemoryVerdict::Ignore);
    }

    #[test]
    fn test_may_relaunch() {
        let policy = RestartPolicy::default();
        let mut inst = instance(true, None);
        assert!(!policy.may_relaunch(&inst, false));

        inst.transition(InstanceState::Exited).unwrap();
        inst.transition(InstanceState::Restarting).unwrap();
        assert!(policy.may_relaunch(&inst, false));
        assert!(!policy.may_relaunch(&inst, true));
    }

    #[test]
    fn test_restart_tracker_forgets_old_restarts() {
        let mut tracker = RestartTracker::with_window(Duration::from_millis(50));
        tracker.record_restart();
        tracker.record_restart();
        assert_eq!(tracker.count_recent_restarts(Duration::from_secs(10)), 2);

        thread::sleep(Duration::from_millis(80));
        tracker.record_restart();
        assert_eq!(tracker.count_recent_restarts(Duration::from_secs(10)), 1);
        assert_eq!(tracker.restart_times.len(), 1);
    }

    #[test]
    fn test_restart_tracker_count_recent() {
        let mut tracker = RestartTracker::new();

        tracker.record_restart();
        thread::sleep(Duration::from_millis(50));
        tracker.record_restart();

        assert_eq!(tracker.count_recent_restarts(Duration::from_secs(10)), 2);
        assert_eq!(tracker.count_recent_restarts(Duration::ZERO), 0);
    }
}
