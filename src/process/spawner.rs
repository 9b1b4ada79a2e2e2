use crate::config::ProcessSpec;
use crate::error::{DroverError, Result};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Metadata returned when spawning a process
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle
    pub child: Child,

    /// Process ID assigned by the OS, also the process group ID
    pub pid: u32,

    /// Spec name
    pub name: String,
}

/// Spawn the OS process for a spec
///
/// The child is placed in its own process group so that terminate signals
/// reach anything it forks. stdout and stderr are piped for the log sink.
///
/// # Arguments
/// * `spec` - Validated launch parameters
///
/// # Returns
/// * `Ok(SpawnedProcess)` - Successfully spawned process with metadata
/// * `Err(DroverError::Spawn)` - Missing script, bad cwd, or exec failure
pub fn spawn_instance(spec: &ProcessSpec) -> Result<SpawnedProcess> {
    if !spec.script.exists() {
        return Err(DroverError::Spawn(format!(
            "Script does not exist: {}",
            spec.script.display()
        )));
    }

    let mut command = Command::new(spec.program());
    command
        .args(spec.argv())
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    let child = command.spawn().map_err(|e| {
        DroverError::Spawn(format!("Failed to spawn process '{}': {}", spec.name, e))
    })?;

    let pid = child.id().ok_or_else(|| {
        DroverError::Spawn(format!("Failed to get PID for process '{}'", spec.name))
    })?;

    Ok(SpawnedProcess {
        child,
        pid,
        name: spec.name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogTarget;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn create_test_spec(name: &str, script: PathBuf) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            script,
            interpreter: None,
            args: vec![],
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
            memory_ceiling: None,
            log: LogTarget {
                out_file: PathBuf::from("/tmp/spawner-test.log"),
                error_file: PathBuf::from("/tmp/spawner-test.log"),
                merge: true,
                rotate: false,
                max_size: 1024,
                date_format: None,
            },
            autorestart: false,
            kill_timeout: Duration::from_secs(1),
            enabled: true,
        }
    }

    async fn read_stdout(mut spawned: SpawnedProcess) -> String {
        let mut out = String::new();
        if let Some(mut stdout) = spawned.child.stdout.take() {
            stdout.read_to_string(&mut out).await.unwrap();
        }
        spawned.child.wait().await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let spec = create_test_spec("test-echo", PathBuf::from("/bin/echo"));

        let spawned = spawn_instance(&spec).unwrap();
        assert_eq!(spawned.name, "test-echo");
        assert!(spawned.pid > 0);
    }

    #[tokio::test]
    async fn test_spawn_with_args() {
        let mut spec = create_test_spec("test-echo-args", PathBuf::from("/bin/echo"));
        spec.args = vec!["hello".to_string(), "world".to_string()];

        let spawned = spawn_instance(&spec).unwrap();
        assert_eq!(read_stdout(spawned).await, "hello world\n");
    }

    #[tokio::test]
    async fn test_spawn_with_interpreter() {
        let temp_dir = TempDir::new().unwrap();
        let script = temp_dir.path().join("hello.sh");
        std::fs::write(&script, "echo \"from script $1\"\n").unwrap();

        let mut spec = create_test_spec("test-interp", script);
        spec.interpreter = Some(PathBuf::from("/bin/sh"));
        spec.args = vec!["arg".to_string()];

        let spawned = spawn_instance(&spec).unwrap();
        assert_eq!(read_stdout(spawned).await, "from script arg\n");
    }

    #[tokio::test]
    async fn test_spawn_with_working_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut spec = create_test_spec("test-pwd", PathBuf::from("/bin/pwd"));
        spec.cwd = temp_dir.path().canonicalize().unwrap();

        let spawned = spawn_instance(&spec).unwrap();
        let out = read_stdout(spawned).await;
        assert_eq!(PathBuf::from(out.trim()), spec.cwd);
    }

    #[tokio::test]
    async fn test_spawn_with_env_vars() {
        let mut spec = create_test_spec("test-env", PathBuf::from("/bin/sh"));
        spec.args = vec!["-c".to_string(), "echo $TEST_VAR".to_string()];
        spec.env
            .insert("TEST_VAR".to_string(), "test_value".to_string());

        let spawned = spawn_instance(&spec).unwrap();
        assert_eq!(read_stdout(spawned).await, "test_value\n");
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_script() {
        let spec = create_test_spec("test-nonexistent", PathBuf::from("/nonexistent/script"));

        match spawn_instance(&spec) {
            Err(DroverError::Spawn(msg)) => {
                assert!(msg.contains("does not exist"));
            }
            other => panic!("Expected Spawn error, got {:?}", other.map(|s| s.pid)),
        }
    }

    #[tokio::test]
    async fn test_spawn_captures_stdout_stderr() {
        let spec = create_test_spec("test-output", PathBuf::from("/bin/echo"));

        let spawned = spawn_instance(&spec).unwrap();
        assert!(spawned.child.stdout.is_some());
        assert!(spawned.child.stderr.is_some());
    }

    #[tokio::test]
    async fn test_spawn_invalid_working_directory() {
        let mut spec = create_test_spec("test-invalid-cwd", PathBuf::from("/bin/echo"));
        spec.cwd = PathBuf::from("/nonexistent/directory");

        assert!(matches!(spawn_instance(&spec), Err(DroverError::Spawn(_))));
    }
}
