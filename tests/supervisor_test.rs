// Integration tests for the supervisor core: launch, restart, memory ceiling and stop

use drover::config::{ConfigFormat, Registry};
use drover::error::{DroverError, Result};
use drover::process::{
    InstanceSnapshot, InstanceState, MemorySampler, StopTarget, Supervisor, SupervisorHandle,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const SETTINGS: &str = r#"
    [settings]
    monitor_interval_ms = 50
    min_restart_interval_ms = 100
    grace_period_ms = 1000
    log_dir = "logs"
"#;

fn registry(temp_dir: &TempDir, apps: &str) -> Registry {
    let contents = format!("{}\n{}", SETTINGS, apps);
    Registry::parse(&contents, ConfigFormat::Toml, temp_dir.path()).unwrap()
}

/// Poll the published status until `pred` holds
async fn wait_for<F>(handle: &SupervisorHandle, timeout: Duration, mut pred: F) -> Vec<InstanceSnapshot>
where
    F: FnMut(&[InstanceSnapshot]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let status = handle.status();
        if pred(&status) {
            return status;
        }
        if Instant::now() > deadline {
            panic!("Condition not met within {:?}, last status: {:#?}", timeout, status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Reports 150MB for the first PID it is asked about and 10MB for any other
struct FirstPidHeavy {
    first: Mutex<Option<u32>>,
}

impl MemorySampler for FirstPidHeavy {
    fn refresh(&mut self) {}

    fn resident_memory(&self, pid: u32) -> Result<u64> {
        let mut first = self.first.lock().unwrap();
        let first = *first.get_or_insert(pid);
        Ok(if pid == first { 150_000_000 } else { 10_000_000 })
    }
}

/// Always fails, like a PID that vanished between listing and reading
struct FailingSampler;

impl MemorySampler for FailingSampler {
    fn refresh(&mut self) {}

    fn resident_memory(&self, pid: u32) -> Result<u64> {
        Err(DroverError::MonitorSample(format!("PID {} not found", pid)))
    }
}

#[tokio::test]
async fn test_every_spec_gets_an_instance() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "a"
        script = "/bin/sleep"
        args = ["30"]

        [[apps]]
        name = "b"
        script = "/bin/sleep"
        args = ["30"]

        [[apps]]
        name = "c"
        script = "/bin/sleep"
        args = ["30"]
        enabled = false
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();
    let status = handle.status();

    assert_eq!(status.len(), 3);
    let names: Vec<&str> = status.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(status[0].state, InstanceState::Running);
    assert_eq!(status[1].state, InstanceState::Running);
    assert!(status[0].pid.is_some());
    assert_ne!(status[0].pid, status[1].pid);
    assert_eq!(status[2].state, InstanceState::Stopped);
    assert_eq!(status[2].pid, None);
    assert!(!handle.startup_failed());

    handle.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_crashing_process_is_restarted() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "crasher"
        script = "/bin/sh"
        args = ["-c", "echo run; exit 1"]
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();

    let status = wait_for(&handle, Duration::from_secs(10), |s| s[0].restart_count >= 2).await;
    let exit = status[0].last_exit.as_ref().unwrap();
    assert_eq!(exit.code, Some(1));

    handle.shutdown(Duration::from_secs(2)).await.unwrap();

    // Every run appended to the same channel
    let out = std::fs::read_to_string(temp_dir.path().join("logs/crasher-out.log")).unwrap();
    assert!(out.lines().filter(|l| *l == "run").count() >= 3);
}

#[tokio::test]
async fn test_restart_respects_minimum_interval() {
    let temp_dir = TempDir::new().unwrap();
    let contents = r#"
        [settings]
        min_restart_interval_ms = 400

        [[apps]]
        name = "crasher"
        script = "/bin/sh"
        args = ["-c", "exit 0"]
    "#;
    let registry = Registry::parse(contents, ConfigFormat::Toml, temp_dir.path()).unwrap();

    let started = Instant::now();
    let handle = Supervisor::start(&registry).await.unwrap();
    wait_for(&handle, Duration::from_secs(10), |s| s[0].restart_count >= 2).await;

    // Three starts need at least two full intervals between them
    assert!(started.elapsed() >= Duration::from_millis(800));

    handle.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_no_restart_without_autorestart() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "oneshot"
        script = "/bin/sh"
        args = ["-c", "exit 4"]
        autorestart = false
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();
    let status = wait_for(&handle, Duration::from_secs(5), |s| {
        s[0].state == InstanceState::Stopped
    })
    .await;

    assert_eq!(status[0].restart_count, 0);
    assert_eq!(status[0].last_exit.as_ref().unwrap().code, Some(4));

    // Still stopped well after the restart interval
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.status()[0].state, InstanceState::Stopped);

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_memory_ceiling_restarts_instance() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "w"
        script = "/bin/sleep"
        args = ["30"]
        max_memory_restart = 100000000
        kill_timeout = 1000
    "#,
    );
    let sampler = FirstPidHeavy {
        first: Mutex::new(None),
    };

    let handle = Supervisor::start_with_sampler(&registry, Box::new(sampler))
        .await
        .unwrap();
    let first_pid = handle.status()[0].pid.unwrap();

    let status = wait_for(&handle, Duration::from_secs(10), |s| {
        s[0].restart_count == 1 && s[0].state == InstanceState::Running && s[0].memory_bytes > 0
    })
    .await;

    assert_ne!(status[0].pid, Some(first_pid));
    assert_eq!(status[0].memory_bytes, 10_000_000);
    assert_eq!(status[0].memory_ceiling, Some(100_000_000));
    // Terminated by SIGTERM, not forced
    let exit = status[0].last_exit.as_ref().unwrap();
    assert_eq!(exit.signal, Some(15));
    assert!(!exit.forced);

    // The new instance stays under its ceiling and is not restarted again
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(handle.status()[0].restart_count, 1);

    handle.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_sampling_failures_are_reported_not_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "w"
        script = "/bin/sleep"
        args = ["30"]
        max_memory_restart = "1M"
    "#,
    );

    let handle = Supervisor::start_with_sampler(&registry, Box::new(FailingSampler))
        .await
        .unwrap();

    let status = wait_for(&handle, Duration::from_secs(5), |s| s[0].last_error.is_some()).await;
    assert!(status[0]
        .last_error
        .as_ref()
        .unwrap()
        .contains("memory sampling failed"));
    assert_eq!(status[0].state, InstanceState::Running);
    assert_eq!(status[0].restart_count, 0);

    handle.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_leaves_instance_stopped() {
    let temp_dir = TempDir::new().unwrap();
    let script = temp_dir.path().join("not-executable.sh");
    std::fs::write(&script, "echo never\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();
    }

    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "broken"
        script = "not-executable.sh"

        [[apps]]
        name = "fine"
        script = "/bin/sleep"
        args = ["30"]
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();
    let status = handle.status();

    assert!(handle.startup_failed());
    assert_eq!(status[0].state, InstanceState::Stopped);
    assert!(status[0].startup_failure);
    assert!(status[0].last_error.is_some());
    assert_eq!(status[1].state, InstanceState::Running);
    assert!(!status[1].startup_failure);

    handle.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_stop_by_name_does_not_restart() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "a"
        script = "/bin/sleep"
        args = ["30"]

        [[apps]]
        name = "b"
        script = "/bin/sleep"
        args = ["30"]
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();

    let stopped = handle.stop(StopTarget::Name("a".to_string())).await.unwrap();
    assert_eq!(stopped, vec!["a".to_string()]);

    let status = handle.status();
    assert_eq!(status[0].state, InstanceState::Stopped);
    assert_eq!(status[1].state, InstanceState::Running);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = handle.status();
    assert_eq!(status[0].state, InstanceState::Stopped);
    assert_eq!(status[0].restart_count, 0);

    // Stopping again is a no-op
    let stopped = handle.stop(StopTarget::Name("a".to_string())).await.unwrap();
    assert_eq!(stopped, vec!["a".to_string()]);

    let stopped = handle.stop(StopTarget::All).await.unwrap();
    assert_eq!(stopped, vec!["a".to_string(), "b".to_string()]);
    assert!(handle
        .status()
        .iter()
        .all(|s| s.state == InstanceState::Stopped));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_stop_unknown_name() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "a"
        script = "/bin/sleep"
        args = ["30"]
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();

    let result = handle.stop(StopTarget::Name("ghost".to_string())).await;
    assert!(matches!(result, Err(DroverError::ProcessNotFound(name)) if name == "ghost"));

    handle.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_output_is_captured_per_stream() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "talker"
        script = "/bin/sh"
        args = ["-c", "echo to-out; echo to-err >&2; sleep 30"]
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();

    let out_path = temp_dir.path().join("logs/talker-out.log");
    let err_path = temp_dir.path().join("logs/talker-error.log");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let out = std::fs::read_to_string(&out_path).unwrap_or_default();
        let err = std::fs::read_to_string(&err_path).unwrap_or_default();
        if out == "to-out\n" && err == "to-err\n" {
            break;
        }
        assert!(Instant::now() < deadline, "out={:?} err={:?}", out, err);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.shutdown(Duration::from_secs(2)).await.unwrap();
    let snapshot: Arc<Vec<InstanceSnapshot>> = handle.subscribe().borrow().clone();
    assert_eq!(snapshot[0].state, InstanceState::Stopped);
}

#[tokio::test]
async fn test_merged_logs_collect_both_streams() {
    let temp_dir = TempDir::new().unwrap();
    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "merged"
        script = "/bin/sh"
        args = ["-c", "echo out-1; echo err-1 >&2; echo out-2; echo err-2 >&2; sleep 30"]
        merge_logs = true
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();

    let out_path = temp_dir.path().join("logs/merged-out.log");
    let deadline = Instant::now() + Duration::from_secs(5);
    let content = loop {
        let content = std::fs::read_to_string(&out_path).unwrap_or_default();
        if content.lines().count() == 4 {
            break content;
        }
        assert!(Instant::now() < deadline, "merged log: {:?}", content);
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    handle.shutdown(Duration::from_secs(2)).await.unwrap();

    // Order across streams is best-effort; order within a stream is kept
    let lines: Vec<&str> = content.lines().collect();
    let outs: Vec<&str> = lines.iter().copied().filter(|l| l.starts_with("out")).collect();
    let errs: Vec<&str> = lines.iter().copied().filter(|l| l.starts_with("err")).collect();
    assert_eq!(outs, vec!["out-1", "out-2"]);
    assert_eq!(errs, vec!["err-1", "err-2"]);
    assert!(!temp_dir.path().join("logs/merged-error.log").exists());
}

#[tokio::test]
async fn test_unwritable_log_degrades_without_stopping_process() {
    let temp_dir = TempDir::new().unwrap();
    // A regular file where the log directory should be
    std::fs::write(temp_dir.path().join("blocker"), "not a directory").unwrap();

    let registry = registry(
        &temp_dir,
        r#"
        [[apps]]
        name = "chatty"
        script = "/bin/sh"
        args = ["-c", "while true; do echo tick; sleep 0.05; done"]
        out_file = "blocker/chatty.log"
    "#,
    );

    let handle = Supervisor::start(&registry).await.unwrap();
    assert!(!handle.startup_failed());

    let status = wait_for(&handle, Duration::from_secs(5), |s| s[0].log_degraded.is_some()).await;
    assert_eq!(status[0].state, InstanceState::Running);
    assert!(status[0]
        .log_degraded
        .as_deref()
        .unwrap()
        .contains("blocker"));

    // Still alive and never restarted after more output has been dropped
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = handle.status();
    assert_eq!(status[0].state, InstanceState::Running);
    assert_eq!(status[0].restart_count, 0);
    assert!(status[0].log_degraded.is_some());

    handle.shutdown(Duration::from_secs(2)).await.unwrap();
}
