use crate::config::{ProcessSpec, Registry};
use crate::error::{DroverError, Result};
use crate::logs::LogSink;
use crate::process::event::{event_channel, Event, EventReceiver, EventSender};
use crate::process::monitor::{MemorySampler, ResourceMonitor, SystemSampler};
use crate::process::restart::{
    ExitDecision, MemoryVerdict, RestartPolicy, RestartTracker, RESTART_WINDOW,
};
use crate::process::signal::watch_instance;
use crate::process::spawner::spawn_instance;
use crate::process::types::{
    ExitRecord, InstanceId, InstanceSnapshot, InstanceState, ProcessInstance, StopReason,
    StopRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Extra time the caller of [`SupervisorHandle::shutdown`] waits beyond the
/// grace period, covering SIGKILL delivery and log flushing
pub const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

/// Which instances a stop applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopTarget {
    Name(String),
    All,
}

/// Pending stop requests per instance; a shutdown may follow an earlier stop
const STOP_QUEUE: usize = 4;

type Snapshot = Arc<Vec<InstanceSnapshot>>;

/// Messages from handles to the core
enum Control {
    Stop {
        target: StopTarget,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

/// Entry point for running a registry under supervision
pub struct Supervisor;

impl Supervisor {
    /// Launch every enabled spec and start the core, sampling memory with sysinfo
    pub async fn start(registry: &Registry) -> Result<SupervisorHandle> {
        Self::start_with_sampler(registry, Box::new(SystemSampler::new())).await
    }

    /// Launch every enabled spec and start the core
    ///
    /// Returns once every instance is `Running` or `Stopped`. A spawn failure
    /// does not abort startup; it leaves that instance `Stopped` and is
    /// reported by [`SupervisorHandle::startup_failed`].
    ///
    /// # Arguments
    /// * `registry` - Validated process specs and settings
    /// * `sampler` - Memory source for the resource monitor
    pub async fn start_with_sampler(
        registry: &Registry,
        sampler: Box<dyn MemorySampler>,
    ) -> Result<SupervisorHandle> {
        let settings = registry.settings();
        let (events_tx, events_rx) = event_channel();
        let (control_tx, control_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());

        let mut core = Core {
            order: Vec::with_capacity(registry.len()),
            table: HashMap::with_capacity(registry.len()),
            next_id: 0,
            sink: LogSink::new(events_tx.clone()),
            events_tx: events_tx.clone(),
            events_rx,
            control_rx,
            control_open: true,
            snapshots: snapshot_tx,
            policy: RestartPolicy::from_settings(settings),
            shutdown_timeout: settings.shutdown_timeout(),
            shutting_down: false,
            stop_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
            monitor: None,
        };

        let mut startup_failed = false;
        for spec in registry.specs() {
            core.order.push(spec.name.clone());

            if !spec.enabled {
                info!(process = %spec.name, "Process disabled, not starting");
                core.insert_disabled(Arc::clone(spec));
                continue;
            }

            if !core.launch(Arc::clone(spec), 0, RestartTracker::new()).await {
                startup_failed = true;
                if let Some(instance) = core.table.get_mut(&spec.name) {
                    instance.startup_failure = true;
                }
            }
        }
        core.publish();

        let monitor = ResourceMonitor::new(
            sampler,
            settings.monitor_interval(),
            settings.sample_failure_threshold,
        );
        core.monitor = Some(tokio::spawn(monitor.run(snapshot_rx.clone(), events_tx)));

        info!(
            processes = registry.len(),
            startup_failed,
            "Supervisor started"
        );

        tokio::spawn(core.run());

        Ok(SupervisorHandle {
            control: control_tx,
            snapshots: snapshot_rx,
            startup_failed,
        })
    }
}

/// Cheap, cloneable handle for querying and commanding the core
#[derive(Clone)]
pub struct SupervisorHandle {
    control: mpsc::Sender<Control>,
    snapshots: watch::Receiver<Snapshot>,
    startup_failed: bool,
}

impl SupervisorHandle {
    /// Latest published view of every instance, in registry order
    pub fn status(&self) -> Vec<InstanceSnapshot> {
        self.snapshots.borrow().as_ref().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<InstanceSnapshot>>> {
        self.snapshots.clone()
    }

    /// Whether any instance failed to spawn during startup
    pub fn startup_failed(&self) -> bool {
        self.startup_failed
    }

    /// Stop without restarting
    ///
    /// # Returns
    /// * `Ok(names)` - once every targeted instance is `Stopped`
    /// * `Err(DroverError::ProcessNotFound)` - unknown name
    pub async fn stop(&self, target: StopTarget) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Stop { target, reply })
            .await
            .map_err(|_| DroverError::SupervisorUnavailable)?;

        rx.await.map_err(|_| DroverError::SupervisorUnavailable)?
    }

    /// Stop everything and flush logs
    ///
    /// Each live instance gets SIGTERM and `timeout` to exit before SIGKILL.
    /// Waits at most `timeout` plus [`SHUTDOWN_SLACK`].
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .control
            .send(Control::Shutdown {
                grace: timeout,
                reply,
            })
            .await;

        if sent.is_err() {
            return self.finished();
        }

        match tokio::time::timeout(timeout + SHUTDOWN_SLACK, rx).await {
            Ok(Ok(())) => Ok(()),
            // Core finished a previous shutdown before reading this one
            Ok(Err(_)) => self.finished(),
            Err(_) => Err(DroverError::Timeout(format!(
                "shutdown did not complete within {:?}",
                timeout + SHUTDOWN_SLACK
            ))),
        }
    }

    /// Outcome for a shutdown the core can no longer receive
    fn finished(&self) -> Result<()> {
        let all_stopped = self
            .snapshots
            .borrow()
            .iter()
            .all(|s| s.state == InstanceState::Stopped);

        if all_stopped {
            Ok(())
        } else {
            Err(DroverError::SupervisorUnavailable)
        }
    }
}

/// The single writer of the process table
struct Core {
    /// Spec names in registry order
    order: Vec<String>,
    table: HashMap<String, ProcessInstance>,
    next_id: u64,
    sink: LogSink,
    events_tx: EventSender,
    events_rx: EventReceiver,
    control_rx: mpsc::Receiver<Control>,
    control_open: bool,
    snapshots: watch::Sender<Snapshot>,
    policy: RestartPolicy,
    shutdown_timeout: Duration,
    shutting_down: bool,
    stop_waiters: Vec<(Vec<String>, oneshot::Sender<Result<Vec<String>>>)>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl Core {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                control = self.control_rx.recv(), if self.control_open => match control {
                    Some(control) => self.handle_control(control),
                    None => {
                        // Every handle is gone; nobody can ask for shutdown any more
                        self.control_open = false;
                        if !self.shutting_down {
                            warn!("All supervisor handles dropped, shutting down");
                            self.begin_shutdown(self.shutdown_timeout);
                        }
                    }
                },
                else => break,
            }

            self.settle_stop_waiters();
            if self.shutting_down && self.all_stopped() {
                break;
            }
        }

        self.sink.close_all().await;
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.publish();

        info!("Supervisor stopped");
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn next_instance_id(&mut self) -> InstanceId {
        self.next_id += 1;
        InstanceId::new(self.next_id)
    }

    fn insert_disabled(&mut self, spec: Arc<ProcessSpec>) {
        let id = self.next_instance_id();
        let mut instance = ProcessInstance::new(id, spec, 0, RestartTracker::new());
        if let Err(e) = instance.transition(InstanceState::Stopped) {
            error!(error = %e, "Failed to retire disabled process");
        }
        self.table.insert(instance.spec.name.clone(), instance);
    }

    /// Start a new instance of `spec`, replacing any previous table entry.
    /// Returns false when the spawn failed and the instance is `Stopped`.
    async fn launch(
        &mut self,
        spec: Arc<ProcessSpec>,
        restart_count: u32,
        tracker: RestartTracker,
    ) -> bool {
        let id = self.next_instance_id();
        let mut instance = ProcessInstance::new(id, Arc::clone(&spec), restart_count, tracker);

        let started = match spawn_instance(&spec) {
            Ok(mut spawned) => {
                self.sink.attach(&spec, &mut spawned.child).await;

                let (stop_tx, stop_rx) = mpsc::channel(STOP_QUEUE);
                if let Err(e) = instance.mark_running(spawned.pid) {
                    error!(process = %spec.name, error = %e, "Failed to mark process running");
                }
                instance.stopper = Some(stop_tx);

                tokio::spawn(watch_instance(
                    spawned.child,
                    spawned.pid,
                    spawned.name,
                    id,
                    stop_rx,
                    self.events_tx.clone(),
                ));

                info!(
                    process = %spec.name,
                    pid = spawned.pid,
                    instance = %id,
                    restart_count,
                    "Process started"
                );
                true
            }
            Err(e) => {
                error!(process = %spec.name, error = %e, "Failed to start process");
                instance.last_error = Some(e.to_string());
                if let Err(e) = instance.transition(InstanceState::Stopped) {
                    error!(process = %spec.name, error = %e, "Failed to retire process");
                }
                false
            }
        };

        instance.log_degraded = self.degraded_log(&spec).await;
        self.table.insert(spec.name.clone(), instance);
        started
    }

    /// Carry a failing log channel's state over to a new instance
    async fn degraded_log(&self, spec: &ProcessSpec) -> Option<String> {
        for path in spec.log.paths() {
            if let Some(channel) = self.sink.channel(path) {
                if channel.lock().await.is_degraded() {
                    return Some(format!("log file {} unavailable", path.display()));
                }
            }
        }
        None
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Stop { target, reply } => {
                let names = match target {
                    StopTarget::All => self.order.clone(),
                    StopTarget::Name(name) => {
                        if !self.table.contains_key(&name) {
                            let _ = reply.send(Err(DroverError::ProcessNotFound(name)));
                            return;
                        }
                        vec![name]
                    }
                };

                for name in &names {
                    self.request_stop(name, StopReason::UserRequest, None);
                }
                self.publish();
                self.stop_waiters.push((names, reply));
            }
            Control::Shutdown { grace, reply } => {
                self.shutdown_waiters.push(reply);
                if !self.shutting_down {
                    self.begin_shutdown(grace);
                }
            }
        }
    }

    fn begin_shutdown(&mut self, grace: Duration) {
        info!(grace_ms = grace.as_millis() as u64, "Shutting down all processes");
        self.shutting_down = true;

        for name in self.order.clone() {
            self.request_stop(&name, StopReason::Shutdown, Some(grace));
        }
        self.publish();
    }

    /// Ask an instance to stop. Live instances are signalled through their
    /// watcher; waiting ones move straight to `Stopped`.
    fn request_stop(&mut self, name: &str, reason: StopReason, grace: Option<Duration>) {
        let Some(instance) = self.table.get_mut(name) else {
            return;
        };

        match instance.state {
            InstanceState::Starting | InstanceState::Running => {
                let already_requested = instance.stop_reason.is_some();
                instance.stop_reason = Some(reason);
                // A repeat only matters when it may bring the deadline closer
                if already_requested && grace.is_none() {
                    return;
                }

                let request = StopRequest {
                    grace: grace.unwrap_or(instance.spec.kill_timeout),
                };
                if let Some(stopper) = instance.stopper.as_ref() {
                    if let Err(e) = stopper.try_send(request) {
                        warn!(process = %name, error = %e, "Failed to deliver stop request");
                    }
                }
            }
            InstanceState::Exited | InstanceState::Restarting => {
                instance.stop_reason = Some(reason);
                if let Err(e) = instance.transition(InstanceState::Stopped) {
                    error!(process = %name, error = %e, "Failed to stop process");
                }
                info!(process = %name, "Pending restart cancelled");
            }
            InstanceState::Stopped => {}
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Exited {
                name,
                instance,
                exit,
            } => self.on_exited(&name, instance, exit),
            Event::RestartDue { name, instance } => self.on_restart_due(&name, instance).await,
            Event::MemorySampled {
                name,
                instance,
                bytes,
            } => {
                if let Some(entry) = self.current(&name, instance) {
                    if entry.state == InstanceState::Running {
                        entry.memory_bytes = bytes;
                    }
                }
            }
            Event::MemoryExceeded {
                name,
                instance,
                bytes,
            } => self.on_memory_exceeded(&name, instance, bytes),
            Event::SampleFailing {
                name,
                instance,
                failures,
                error,
            } => {
                if let Some(entry) = self.current(&name, instance) {
                    entry.last_error = Some(format!(
                        "memory sampling failed {} times: {}",
                        failures, error
                    ));
                }
            }
            Event::LogDegraded { path, error } => self.mark_log(&path, Some(error)),
            Event::LogRecovered { path } => {
                info!(log = %path.display(), "Logging recovered");
                self.mark_log(&path, None);
            }
        }
        self.publish();
    }

    /// The table entry for `name` if it is still the instance `id`
    fn current(&mut self, name: &str, id: InstanceId) -> Option<&mut ProcessInstance> {
        self.table.get_mut(name).filter(|entry| entry.id == id)
    }

    fn on_exited(&mut self, name: &str, id: InstanceId, exit: ExitRecord) {
        let shutting_down = self.shutting_down;
        let policy = self.policy.clone();
        let events = self.events_tx.clone();
        let Some(instance) = self.current(name, id) else {
            debug!(process = %name, instance = %id, "Exit of a replaced instance ignored");
            return;
        };

        if instance.stop_reason.is_some() {
            info!(process = %name, instance = %id, exit = %exit, "Process stopped");
        } else {
            warn!(process = %name, instance = %id, exit = %exit, "Process exited");
        }

        instance.last_exit = Some(exit);
        if let Err(e) = instance.transition(InstanceState::Exited) {
            error!(process = %name, error = %e, "Unexpected exit transition");
            return;
        }

        match policy.on_exit(instance, shutting_down) {
            ExitDecision::Restart { delay } => {
                if let Err(e) = instance.transition(InstanceState::Restarting) {
                    error!(process = %name, error = %e, "Failed to schedule restart");
                    return;
                }
                debug!(process = %name, delay_ms = delay.as_millis() as u64, "Restart scheduled");

                let name = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::RestartDue { name, instance: id });
                });
            }
            ExitDecision::Retire(reason) => {
                if let Err(e) = instance.transition(InstanceState::Stopped) {
                    error!(process = %name, error = %e, "Failed to retire process");
                }
                info!(process = %name, %reason, "Process will not be restarted");
            }
        }
    }

    async fn on_restart_due(&mut self, name: &str, id: InstanceId) {
        let shutting_down = self.shutting_down;
        let policy = self.policy.clone();
        let Some(previous) = self.current(name, id) else {
            return;
        };
        if !policy.may_relaunch(previous, shutting_down) {
            return;
        }

        let spec = Arc::clone(&previous.spec);
        let restart_count = previous.restart_count + 1;
        let last_exit = previous.last_exit.clone();
        let mut tracker = std::mem::take(&mut previous.tracker);
        tracker.record_restart();

        info!(
            process = %name,
            restart_count,
            recent_restarts = tracker.count_recent_restarts(RESTART_WINDOW),
            "Restarting process"
        );

        self.launch(spec, restart_count, tracker).await;
        if let Some(instance) = self.table.get_mut(name) {
            instance.last_exit = last_exit;
        }
    }

    fn on_memory_exceeded(&mut self, name: &str, id: InstanceId, bytes: u64) {
        let policy = self.policy.clone();
        let Some(instance) = self.current(name, id) else {
            return;
        };

        instance.memory_bytes = bytes;
        if let MemoryVerdict::Terminate { grace } = policy.on_memory_exceeded(instance, bytes) {
            warn!(
                process = %name,
                instance = %id,
                memory = bytes,
                ceiling = instance.spec.memory_ceiling.unwrap_or_default(),
                "Memory ceiling exceeded, restarting"
            );
            instance.stop_reason = Some(StopReason::MemoryExceeded);
            if let Some(stopper) = instance.stopper.as_ref() {
                if let Err(e) = stopper.try_send(StopRequest { grace }) {
                    warn!(process = %name, error = %e, "Failed to deliver stop request");
                }
            }
        }
    }

    fn mark_log(&mut self, path: &Path, error: Option<String>) {
        for instance in self.table.values_mut() {
            if instance.spec.log.paths().contains(&path) {
                instance.log_degraded = error.clone();
            }
        }
    }

    fn settle_stop_waiters(&mut self) {
        let waiters = std::mem::take(&mut self.stop_waiters);
        for (names, reply) in waiters {
            let done = names.iter().all(|name| {
                self.table
                    .get(name)
                    .map_or(true, |i| i.state == InstanceState::Stopped)
            });
            if done {
                let _ = reply.send(Ok(names));
            } else {
                self.stop_waiters.push((names, reply));
            }
        }
    }

    fn all_stopped(&self) -> bool {
        self.table
            .values()
            .all(|i| i.state == InstanceState::Stopped)
    }

    fn publish(&self) {
        let snapshot: Vec<InstanceSnapshot> = self
            .order
            .iter()
            .filter_map(|name| self.table.get(name))
            .map(ProcessInstance::snapshot)
            .collect();
        self.snapshots.send_replace(Arc::new(snapshot));
    }
}
