use thiserror::Error;

/// Main error type for the drover supervisor
#[derive(Debug, Error)]
pub enum DroverError {
    // Configuration errors (fatal at load time)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Missing required configuration field: {0}")]
    MissingConfigField(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Invalid size '{0}': expected a byte count such as 512, 64K, 120M or 2G")]
    InvalidSize(String),

    #[error("Duplicate process name: {0}")]
    DuplicateProcess(String),

    // Process-related errors
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Process {name} cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Supervisor is not accepting commands")]
    SupervisorUnavailable,

    // Log-related errors (never fatal to the owning process)
    #[error("Log I/O error: {0}")]
    LogIo(String),

    #[error("Log rotation failed: {0}")]
    LogRotation(String),

    // Resource sampling
    #[error("Memory sample failed: {0}")]
    MonitorSample(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Failed to connect to supervisor: {0}")]
    Connection(String),

    #[error("IPC protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Reload is not supported while running (file watching is disabled); restart the supervisor to apply configuration changes")]
    ReloadUnsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DroverError {
    /// Whether this error belongs to the configuration class that aborts startup
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            DroverError::Config(_)
                | DroverError::InvalidConfig(_)
                | DroverError::MissingConfigField(_)
                | DroverError::ConfigValidation(_)
                | DroverError::InvalidSize(_)
                | DroverError::DuplicateProcess(_)
        )
    }
}

/// Result type alias for drover operations
pub type Result<T> = std::result::Result<T, DroverError>;
