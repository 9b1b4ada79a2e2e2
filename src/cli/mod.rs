// CLI module - User-facing command-line interface

mod output;

use crate::config::Registry;
use crate::error::{DroverError, Result};
use crate::ipc::{Command, IpcClient, IpcServer, ResponseData, DEFAULT_SOCKET_PATH};
use crate::process::{StopTarget, Supervisor, SupervisorHandle};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when a process could not be spawned at startup
const EXIT_STARTUP_FAILURE: u8 = 2;

/// drover - run a fixed set of worker processes and keep them alive
#[derive(Parser, Debug)]
#[command(name = "drover")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Control socket of the running supervisor
    #[arg(long, global = true, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Load a configuration file and supervise its processes until interrupted
    Start {
        /// Configuration file (TOML or JSON)
        #[arg(short, long, default_value = "drover.toml")]
        config: PathBuf,
    },

    /// Show every supervised process
    Status,

    /// Stop a process without restarting it
    Stop {
        /// Process name
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        name: Option<String>,

        /// Stop every process
        #[arg(long)]
        all: bool,
    },

    /// Re-read the configuration (not supported while running)
    Reload,
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<ExitCode> {
        let cli = Cli::parse();
        cli.execute()
    }

    fn execute(self) -> Result<ExitCode> {
        let command = match self.command {
            Commands::Start { ref config } => return run_supervisor(config, &self.socket),
            Commands::Status => Command::Status,
            Commands::Stop { all: true, .. } => Command::Stop(StopTarget::All),
            Commands::Stop { name: Some(name), .. } => Command::Stop(StopTarget::Name(name)),
            Commands::Stop { name: None, .. } => {
                return Err(DroverError::Internal(
                    "stop needs a process name or --all".to_string(),
                ))
            }
            Commands::Reload => Command::Reload,
        };

        let client = IpcClient::with_socket_path(&self.socket);
        let response = client.send_command(command)?;

        match response.result {
            Ok(data) => {
                output::print_success(&data);
                Ok(ExitCode::SUCCESS)
            }
            Err(error_msg) => {
                output::print_error(&error_msg);
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// Install the fmt subscriber; `RUST_LOG` overrides the default `info` level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// `drover start`: load, supervise, serve IPC, shut down on SIGINT/SIGTERM
fn run_supervisor(config: &Path, socket: &Path) -> Result<ExitCode> {
    init_tracing();

    let registry = Registry::load(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(supervise(registry, socket))
}

async fn supervise(registry: Registry, socket: &Path) -> Result<ExitCode> {
    let handle = Supervisor::start(&registry).await?;
    let shutdown_timeout = registry.settings().shutdown_timeout();

    let mut server = IpcServer::with_socket_path(socket);
    if let Err(e) = server.start() {
        error!(socket = %socket.display(), error = %e, "Failed to open control socket");
        if let Err(e) = handle.shutdown(shutdown_timeout).await {
            warn!(error = %e, "Shutdown incomplete");
        }
        return Err(e);
    }

    output::print_info(&format!(
        "Supervising {} process(es), control socket {}",
        registry.len(),
        socket.display()
    ));

    let ipc_handle = handle.clone();
    tokio::select! {
        result = server.serve(move |command| handle_command(ipc_handle.clone(), command)) => {
            if let Err(e) = result {
                error!(error = %e, "IPC server stopped");
            }
        }
        signal = shutdown_signal() => {
            info!(signal, "Received shutdown signal");
        }
    }

    if let Err(e) = server.stop() {
        warn!(error = %e, "Failed to remove control socket");
    }

    if let Err(e) = handle.shutdown(shutdown_timeout).await {
        warn!(error = %e, "Shutdown incomplete");
    }

    if handle.startup_failed() {
        Ok(ExitCode::from(EXIT_STARTUP_FAILURE))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Answer one IPC command from the supervisor handle
async fn handle_command(handle: SupervisorHandle, command: Command) -> Result<ResponseData> {
    match command {
        Command::Status => Ok(ResponseData::Status(handle.status())),
        Command::Stop(target) => handle.stop(target).await.map(ResponseData::Stopped),
        Command::Reload => Err(DroverError::ReloadUnsupported),
    }
}

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT will stop the supervisor");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
