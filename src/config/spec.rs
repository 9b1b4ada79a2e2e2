use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Validated, immutable launch parameters for one worker.
///
/// Built by [`crate::config::Registry`] and shared as `Arc<ProcessSpec>`;
/// nothing mutates a spec after load.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    /// Unique name across the registry
    pub name: String,

    /// Absolute path to the script or executable
    pub script: PathBuf,

    /// Resolved interpreter used to run `script`, if any
    pub interpreter: Option<PathBuf>,

    /// Arguments passed after the script
    pub args: Vec<String>,

    /// Environment overrides applied on top of the inherited environment
    pub env: BTreeMap<String, String>,

    /// Working directory
    pub cwd: PathBuf,

    /// Resident memory ceiling in bytes; exceeding it triggers a restart
    pub memory_ceiling: Option<u64>,

    /// Where and how output is logged
    pub log: LogTarget,

    /// Relaunch after every exit
    pub autorestart: bool,

    /// Grace period between the terminate signal and a forced kill
    pub kill_timeout: Duration,

    /// Disabled specs stay registered but are never launched
    pub enabled: bool,
}

impl ProcessSpec {
    /// The program handed to the OS: the interpreter when set, else the script
    pub fn program(&self) -> &Path {
        self.interpreter.as_deref().unwrap_or(&self.script)
    }

    /// Argument vector following [`ProcessSpec::program`]
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        if self.interpreter.is_some() {
            argv.push(self.script.clone().into_os_string());
        }
        argv.extend(self.args.iter().map(OsString::from));
        argv
    }
}

/// Output routing and rotation policy for one spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub out_file: PathBuf,
    /// Equal to `out_file` when stdout and stderr are merged
    pub error_file: PathBuf,
    pub merge: bool,
    pub rotate: bool,
    /// Rotation threshold in bytes
    pub max_size: u64,
    /// chrono strftime pattern prefixed to every line
    pub date_format: Option<String>,
}

impl LogTarget {
    /// Distinct files this target writes to
    pub fn paths(&self) -> Vec<&Path> {
        if self.out_file == self.error_file {
            vec![self.out_file.as_path()]
        } else {
            vec![self.out_file.as_path(), self.error_file.as_path()]
        }
    }

    /// Two targets may share a file only when they would write it the same way
    pub fn same_policy(&self, other: &LogTarget) -> bool {
        self.rotate == other.rotate
            && self.max_size == other.max_size
            && self.date_format == other.date_format
    }
}
