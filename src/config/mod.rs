use crate::error::{DroverError, Result};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

mod size;
mod spec;

pub use size::{parse_size, SizeValue};
pub use spec::{LogTarget, ProcessSpec};

/// Supervisor-wide settings (the optional `[settings]` table)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// How often the resource monitor samples memory
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,

    /// Minimum time between two starts of the same worker
    #[serde(default = "default_min_restart_interval")]
    pub min_restart_interval_ms: u64,

    /// Default grace period before a forced kill
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    /// Deadline for stopping everything on supervisor shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Consecutive failed samples before a warning is raised
    #[serde(default = "default_sample_failure_threshold")]
    pub sample_failure_threshold: u32,

    /// Directory for log files of entries that do not name their own
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Base environment applied to every worker before its own `env`
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Memory ceiling for entries that do not set `max_memory_restart`
    #[serde(default)]
    pub max_memory_restart: Option<SizeValue>,
}

fn default_monitor_interval() -> u64 {
    2000
}

fn default_min_restart_interval() -> u64 {
    1000
}

fn default_grace_period() -> u64 {
    1600
}

fn default_shutdown_timeout() -> u64 {
    10_000
}

fn default_sample_failure_threshold() -> u32 {
    3
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval(),
            min_restart_interval_ms: default_min_restart_interval(),
            grace_period_ms: default_grace_period(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            sample_failure_threshold: default_sample_failure_threshold(),
            log_dir: default_log_dir(),
            env: BTreeMap::new(),
            max_memory_restart: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("monitor_interval_ms", self.monitor_interval_ms),
            ("grace_period_ms", self.grace_period_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            (
                "sample_failure_threshold",
                u64::from(self.sample_failure_threshold),
            ),
        ];

        for (field, value) in positive {
            if value == 0 {
                return Err(DroverError::ConfigValidation(format!(
                    "{} must be greater than zero",
                    field
                )));
            }
        }

        if let Some(ref ceiling) = self.max_memory_restart {
            ceiling.to_bytes()?;
        }

        validate_env_keys(&self.env)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn min_restart_interval(&self) -> Duration {
        Duration::from_millis(self.min_restart_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// One worker entry as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Process name (unique identifier)
    pub name: String,

    /// Path to the script or executable to run
    pub script: PathBuf,

    /// Program used to run the script, e.g. "python3"
    #[serde(default)]
    pub interpreter: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Restart on file changes; rejected, kept so such configs fail loudly
    #[serde(default)]
    pub watch: bool,

    #[serde(default)]
    pub max_memory_restart: Option<SizeValue>,

    /// Log rotation threshold
    #[serde(default = "default_max_size")]
    pub max_size: SizeValue,

    #[serde(default = "default_rotate_logs")]
    pub rotate_logs: bool,

    /// Send stderr to `out_file`
    #[serde(default)]
    pub merge_logs: bool,

    #[serde(default)]
    pub out_file: Option<PathBuf>,

    #[serde(default)]
    pub error_file: Option<PathBuf>,

    /// Moment-style timestamp prefix, e.g. "YYYY-MM-DD HH:mm:ss Z"
    #[serde(default)]
    pub log_date_format: Option<String>,

    /// Grace period in milliseconds (overrides `settings.grace_period_ms`)
    #[serde(default)]
    pub kill_timeout: Option<u64>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_autorestart() -> bool {
    true
}

fn default_max_size() -> SizeValue {
    SizeValue::Text("10M".to_string())
}

fn default_rotate_logs() -> bool {
    true
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Checks that need no filesystem access
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DroverError::MissingConfigField("name".to_string()));
        }

        if self.script.as_os_str().is_empty() {
            return Err(DroverError::MissingConfigField(format!(
                "script (process '{}')",
                self.name
            )));
        }

        if self.watch {
            return Err(DroverError::ConfigValidation(format!(
                "process '{}': watch is not supported, restart the supervisor to pick up changes",
                self.name
            )));
        }

        if self.kill_timeout == Some(0) {
            return Err(DroverError::ConfigValidation(format!(
                "process '{}': kill_timeout must be greater than zero",
                self.name
            )));
        }

        validate_env_keys(&self.env)
    }

    /// Expand `$VAR` and `${VAR}` references from the supervisor's environment
    fn expand_env_vars(&mut self) {
        self.script = expand_env_in_path(&self.script);

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(expand_env_in_path(cwd));
        }

        self.args = self
            .args
            .iter()
            .map(|arg| expand_env_in_string(arg))
            .collect();

        for value in self.env.values_mut() {
            *value = expand_env_in_string(value);
        }

        if let Some(ref out) = self.out_file {
            self.out_file = Some(expand_env_in_path(out));
        }

        if let Some(ref err) = self.error_file {
            self.error_file = Some(expand_env_in_path(err));
        }
    }
}

/// Top-level layout of a configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default, alias = "processes")]
    pub apps: Vec<AppConfig>,
}

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        match extension {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(DroverError::InvalidConfig(format!(
                "Unsupported file format: {}. Use .toml or .json",
                extension
            ))),
        }
    }

    pub fn parse(self, contents: &str) -> Result<ConfigFile> {
        match self {
            ConfigFormat::Toml => toml::from_str(contents)
                .map_err(|e| DroverError::InvalidConfig(format!("Failed to parse TOML: {}", e))),
            ConfigFormat::Json => serde_json::from_str(contents)
                .map_err(|e| DroverError::InvalidConfig(format!("Failed to parse JSON: {}", e))),
        }
    }
}

/// The validated, ordered set of process specs. Read once at startup and
/// never modified afterwards.
#[derive(Debug, Clone)]
pub struct Registry {
    settings: Settings,
    specs: Vec<Arc<ProcessSpec>>,
}

impl Registry {
    /// Load and validate a single configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DroverError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let format = ConfigFormat::from_path(path)?;
        let base_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let base_dir = if base_dir.is_absolute() {
            base_dir
        } else {
            std::env::current_dir()?.join(base_dir)
        };

        let registry = Self::parse(&contents, format, &base_dir)?;
        tracing::info!(
            config = %path.display(),
            processes = registry.len(),
            "Loaded process registry"
        );
        Ok(registry)
    }

    /// Parse configuration text; relative paths resolve against `base_dir`
    pub fn parse(contents: &str, format: ConfigFormat, base_dir: &Path) -> Result<Self> {
        let file = format.parse(contents)?;
        Self::from_config(file, base_dir)
    }

    pub fn from_config(file: ConfigFile, base_dir: &Path) -> Result<Self> {
        let ConfigFile { settings, apps } = file;
        settings.validate()?;

        if apps.is_empty() {
            return Err(DroverError::InvalidConfig(
                "No process configuration found in file".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(apps.len());

        for mut app in apps {
            app.expand_env_vars();
            app.validate()?;

            if !seen.insert(app.name.clone()) {
                return Err(DroverError::DuplicateProcess(app.name));
            }

            specs.push(Arc::new(build_spec(app, &settings, base_dir)?));
        }

        check_shared_log_paths(&specs)?;

        Ok(Self { settings, specs })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Specs in configuration order
    pub fn specs(&self) -> &[Arc<ProcessSpec>] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProcessSpec>> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

fn build_spec(app: AppConfig, settings: &Settings, base_dir: &Path) -> Result<ProcessSpec> {
    let cwd = resolve(base_dir, app.cwd.as_deref().unwrap_or(Path::new(".")));
    if !cwd.is_dir() {
        return Err(DroverError::ConfigValidation(format!(
            "process '{}': working directory does not exist: {}",
            app.name,
            cwd.display()
        )));
    }

    let script = resolve(&cwd, &app.script);
    if !script.exists() {
        return Err(DroverError::ConfigValidation(format!(
            "process '{}': script does not exist: {}",
            app.name,
            script.display()
        )));
    }

    let interpreter = match app.interpreter.as_deref() {
        Some(name) => Some(resolve_interpreter(&app.name, name, &cwd)?),
        None => None,
    };

    let mut env = settings.env.clone();
    env.extend(app.env);

    let memory_ceiling = app
        .max_memory_restart
        .as_ref()
        .or(settings.max_memory_restart.as_ref())
        .map(SizeValue::to_bytes)
        .transpose()?;

    let log_dir = resolve(base_dir, &settings.log_dir);
    let out_file = match app.out_file {
        Some(ref path) => resolve(&cwd, path),
        None => log_dir.join(format!("{}-out.log", app.name)),
    };
    let error_file = if app.merge_logs {
        out_file.clone()
    } else {
        match app.error_file {
            Some(ref path) => resolve(&cwd, path),
            None => log_dir.join(format!("{}-error.log", app.name)),
        }
    };

    let date_format = app
        .log_date_format
        .as_deref()
        .map(moment_to_strftime)
        .transpose()?;

    Ok(ProcessSpec {
        log: LogTarget {
            out_file,
            error_file,
            merge: app.merge_logs,
            rotate: app.rotate_logs,
            max_size: app.max_size.to_bytes()?,
            date_format,
        },
        kill_timeout: Duration::from_millis(app.kill_timeout.unwrap_or(settings.grace_period_ms)),
        name: app.name,
        script,
        interpreter,
        args: app.args,
        env,
        cwd,
        memory_ceiling,
        autorestart: app.autorestart,
        enabled: app.enabled,
    })
}

/// Reject two specs writing the same file with different rotation settings
fn check_shared_log_paths(specs: &[Arc<ProcessSpec>]) -> Result<()> {
    let mut owners: HashMap<&Path, &ProcessSpec> = HashMap::new();

    for spec in specs {
        for path in spec.log.paths() {
            match owners.get(path) {
                Some(owner) if owner.name != spec.name && !owner.log.same_policy(&spec.log) => {
                    return Err(DroverError::ConfigValidation(format!(
                        "processes '{}' and '{}' share log file {} with different log settings",
                        owner.name,
                        spec.name,
                        path.display()
                    )));
                }
                Some(_) => {}
                None => {
                    owners.insert(path, spec);
                }
            }
        }
    }

    Ok(())
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Interpreters given as bare names are looked up on PATH
fn resolve_interpreter(process: &str, name: &str, cwd: &Path) -> Result<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = resolve(cwd, Path::new(name));
        if path.is_file() {
            return Ok(path);
        }
        return Err(DroverError::ConfigValidation(format!(
            "process '{}': interpreter does not exist: {}",
            process,
            path.display()
        )));
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(name))
                .find(|candidate| candidate.is_file())
        })
        .ok_or_else(|| {
            DroverError::ConfigValidation(format!(
                "process '{}': interpreter not found on PATH: {}",
                process, name
            ))
        })
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_env_keys(env: &BTreeMap<String, String>) -> Result<()> {
    match env.keys().find(|key| !is_valid_env_key(key)) {
        Some(key) => Err(DroverError::ConfigValidation(format!(
            "Invalid environment variable name: '{}'",
            key
        ))),
        None => Ok(()),
    }
}

/// Expand `$VAR` and `${VAR}`; unset variables are left untouched
fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(inner) = after.strip_prefix('{') {
            if let Some(end) = inner.find('}') {
                let key = &inner[..end];
                match std::env::var(key) {
                    Ok(value) if is_valid_env_key(key) => result.push_str(&value),
                    _ => result.push_str(&rest[pos..pos + end + 3]),
                }
                rest = &inner[end + 1..];
                continue;
            }
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            let key = &after[..len];
            if is_valid_env_key(key) {
                match std::env::var(key) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push('$');
                        result.push_str(key);
                    }
                }
                rest = &after[len..];
                continue;
            }
        }

        result.push('$');
        rest = after;
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

/// Translate a moment-style date format into a chrono strftime pattern
pub fn moment_to_strftime(format: &str) -> Result<String> {
    const TOKENS: [(&str, &str); 10] = [
        ("YYYY", "%Y"),
        ("SSS", "%3f"),
        ("YY", "%y"),
        ("MM", "%m"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("ZZ", "%z"),
        ("Z", "%:z"),
    ];

    let mut out = String::with_capacity(format.len() * 2);
    let mut rest = format;

    'scan: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
                continue 'scan;
            }
        }

        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }

    if StrftimeItems::new(&out).any(|item| matches!(item, Item::Error)) {
        return Err(DroverError::ConfigValidation(format!(
            "Invalid log_date_format: '{}'",
            format
        )));
    }

    Ok(out)
}
