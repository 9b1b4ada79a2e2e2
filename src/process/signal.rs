use crate::error::{DroverError, Result};
use crate::process::event::{Event, EventSender};
use crate::process::types::{ExitRecord, InstanceId, StopRequest};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Send `sig` to every process in the group led by `pgid`.
///
/// A group that is already gone is not an error.
#[cfg(unix)]
pub fn signal_group(pgid: u32, sig: Signal) -> Result<()> {
    let group = Pid::from_raw(pgid as i32);
    match signal::killpg(group, sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(DroverError::Signal(format!(
            "Failed to send {} to process group {}: {}",
            sig, pgid, e
        ))),
    }
}

/// Graceful-then-forceful termination of one instance
///
/// # Arguments
/// * `child` - Handle of the group leader
/// * `pid` - Leader PID, equal to the process group ID
/// * `name` - Spec name, for logging
/// * `grace` - How long to wait after SIGTERM before SIGKILL
///
/// # Returns
/// The exit record, with `forced` set when SIGKILL was needed
pub async fn terminate(child: &mut Child, pid: u32, name: &str, grace: Duration) -> ExitRecord {
    terminate_with(child, pid, name, grace, None).await
}

/// [`terminate`], shortening the deadline when a later request on
/// `requests` carries a shorter grace
async fn terminate_with(
    child: &mut Child,
    pid: u32,
    name: &str,
    grace: Duration,
    mut requests: Option<&mut mpsc::Receiver<StopRequest>>,
) -> ExitRecord {
    info!(process = %name, pid, grace_ms = grace.as_millis() as u64, "Stopping process");

    #[cfg(unix)]
    if let Err(e) = signal_group(pid, Signal::SIGTERM) {
        warn!(process = %name, pid, error = %e, "Failed to deliver SIGTERM");
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    let mut deadline = Instant::now() + grace;
    loop {
        tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    debug!(process = %name, pid, ?status, "Process exited after SIGTERM");
                    return ExitRecord::from_status(status, false);
                }
                Err(e) => {
                    warn!(process = %name, pid, error = %e, "Wait failed during stop");
                    return ExitRecord::unknown();
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                warn!(process = %name, pid, "Process ignored SIGTERM, sending SIGKILL");
                break;
            }
            Some(request) = next_request(&mut requests) => {
                let sooner = Instant::now() + request.grace;
                if sooner < deadline {
                    debug!(
                        process = %name,
                        pid,
                        grace_ms = request.grace.as_millis() as u64,
                        "Stop deadline shortened"
                    );
                    deadline = sooner;
                }
            }
        }
    }

    #[cfg(unix)]
    if let Err(e) = signal_group(pid, Signal::SIGKILL) {
        warn!(process = %name, pid, error = %e, "Failed to deliver SIGKILL");
    }
    let _ = child.start_kill();

    match child.wait().await {
        Ok(status) => ExitRecord::from_status(status, true),
        Err(e) => {
            warn!(process = %name, pid, error = %e, "Wait failed after SIGKILL");
            let mut record = ExitRecord::unknown();
            record.forced = true;
            record
        }
    }
}

async fn next_request(requests: &mut Option<&mut mpsc::Receiver<StopRequest>>) -> Option<StopRequest> {
    match requests {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Own a child until it exits, carrying out stop requests.
///
/// The first request starts termination; later ones can only bring the
/// SIGKILL deadline closer. Runs as a task per instance and reports the exit
/// to the supervisor core as [`Event::Exited`].
pub async fn watch_instance(
    mut child: Child,
    pid: u32,
    name: String,
    instance: InstanceId,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    events: EventSender,
) {
    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ExitRecord::from_status(status, false),
            Err(e) => {
                warn!(process = %name, pid, error = %e, "Failed to wait on process");
                ExitRecord::unknown()
            }
        },
        Some(request) = stop_rx.recv() => {
            terminate_with(&mut child, pid, &name, request.grace, Some(&mut stop_rx)).await
        }
    };

    debug!(process = %name, pid, %instance, exit = %exit, "Process exited");

    let _ = events.send(Event::Exited {
        name,
        instance,
        exit,
    });
}
