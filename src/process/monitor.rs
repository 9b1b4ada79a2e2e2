use crate::error::{DroverError, Result};
use crate::process::event::{Event, EventSender};
use crate::process::types::{InstanceId, InstanceSnapshot, InstanceState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Source of resident memory readings
pub trait MemorySampler: Send {
    /// Refresh the process list once per tick, before any reads
    fn refresh(&mut self);

    /// Resident bytes for `pid` and its direct children
    fn resident_memory(&self, pid: u32) -> Result<u64>;
}

/// [`MemorySampler`] backed by sysinfo
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemSampler {
    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_memory(),
        );
    }

    fn resident_memory(&self, pid: u32) -> Result<u64> {
        let sys_pid = Pid::from_u32(pid);
        let process = self
            .system
            .process(sys_pid)
            .ok_or_else(|| DroverError::MonitorSample(format!("PID {} not found", pid)))?;

        // Interpreters and shells often fork the real worker. On Linux the
        // process list also holds every thread as an entry parented to its
        // process, each reporting the whole process RSS; those are skipped.
        let threads = process.tasks();
        let children: u64 = self
            .system
            .processes()
            .values()
            .filter(|p| p.parent() == Some(sys_pid) && p.thread_kind().is_none())
            .filter(|p| threads.map_or(true, |tasks| !tasks.contains(&p.pid())))
            .map(|p| p.memory())
            .sum();

        Ok(process.memory() + children)
    }
}

/// Periodically samples resident memory of running instances.
///
/// Reads the published snapshot and reports through events only; it never
/// signals a process or touches the process table.
pub struct ResourceMonitor {
    sampler: Box<dyn MemorySampler>,
    interval: Duration,
    failure_threshold: u32,
    /// Consecutive failed samples per instance
    failures: HashMap<InstanceId, u32>,
}

impl ResourceMonitor {
    pub fn new(sampler: Box<dyn MemorySampler>, interval: Duration, failure_threshold: u32) -> Self {
        Self {
            sampler,
            interval,
            failure_threshold: failure_threshold.max(1),
            failures: HashMap::new(),
        }
    }

    /// Tick until the supervisor core goes away
    pub async fn run(
        mut self,
        snapshots: watch::Receiver<Arc<Vec<InstanceSnapshot>>>,
        events: EventSender,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(interval_ms = self.interval.as_millis() as u64, "Resource monitor started");

        loop {
            ticker.tick().await;
            if events.is_closed() {
                break;
            }

            let current = snapshots.borrow().clone();
            self.sample_once(&current, &events);
        }

        debug!("Resource monitor stopped");
    }

    /// Sample every running instance in `snapshot` once
    pub fn sample_once(&mut self, snapshot: &[InstanceSnapshot], events: &EventSender) {
        self.sampler.refresh();

        let running: Vec<&InstanceSnapshot> = snapshot
            .iter()
            .filter(|s| s.state == InstanceState::Running)
            .collect();

        self.failures
            .retain(|id, _| running.iter().any(|s| s.instance == *id));

        for entry in running {
            let Some(pid) = entry.pid else { continue };

            match self.sampler.resident_memory(pid) {
                Ok(bytes) => {
                    self.failures.remove(&entry.instance);

                    let _ = events.send(Event::MemorySampled {
                        name: entry.name.clone(),
                        instance: entry.instance,
                        bytes,
                    });

                    if entry.memory_ceiling.is_some_and(|ceiling| bytes > ceiling) {
                        let _ = events.send(Event::MemoryExceeded {
                            name: entry.name.clone(),
                            instance: entry.instance,
                            bytes,
                        });
                    }
                }
                Err(e) => {
                    let count = self.failures.entry(entry.instance).or_insert(0);
                    *count += 1;

                    if *count == self.failure_threshold {
                        warn!(
                            process = %entry.name,
                            pid,
                            failures = *count,
                            error = %e,
                            "Memory sampling keeps failing"
                        );
                        let _ = events.send(Event::SampleFailing {
                            name: entry.name.clone(),
                            instance: entry.instance,
                            failures: *count,
                            error: e.to_string(),
                        });
                    } else {
                        debug!(process = %entry.name, pid, error = %e, "Memory sample failed");
                    }
                }
            }
        }
    }

    /// Current failure streak for an instance
    pub fn failure_count(&self, instance: InstanceId) -> u32 {
        self.failures.get(&instance).copied().unwrap_or(0)
    }
}
