// Output formatting and display for CLI

use crate::ipc::ResponseData;
use crate::process::{InstanceSnapshot, InstanceState};
use chrono::{DateTime, Local};
use colored::*;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a success response to stdout
pub fn print_success(data: &ResponseData) {
    match data {
        ResponseData::Status(instances) => {
            if instances.is_empty() {
                println!("{}", "No processes are registered".yellow());
            } else {
                print_status_table(instances);
                print_problems(instances);
            }
        }

        ResponseData::Stopped(names) => {
            for name in names {
                println!(
                    "{}",
                    format!("✓ Process {} stopped", name).green().bold()
                );
            }
        }
    }
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a formatted table of instances
fn print_status_table(instances: &[InstanceSnapshot]) {
    #[derive(Tabled)]
    struct StatusRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Last exit")]
        last_exit: String,
    }

    let rows: Vec<StatusRow> = instances
        .iter()
        .map(|s| StatusRow {
            name: truncate(&s.name, 20),
            state: format_state_colored(s.state),
            pid: s
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            restarts: s.restart_count.to_string(),
            memory: match s.memory_ceiling {
                Some(ceiling) => format!(
                    "{} / {}",
                    format_memory(s.memory_bytes),
                    format_memory(ceiling)
                ),
                None => format_memory(s.memory_bytes),
            },
            uptime: if s.state == InstanceState::Running {
                format_duration(&s.uptime)
            } else {
                "-".to_string()
            },
            last_exit: s
                .last_exit
                .as_ref()
                .map(|exit| {
                    let at: DateTime<Local> = exit.at.into();
                    format!("{} at {}", exit, at.format("%H:%M:%S"))
                })
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} process(es)", instances.len())
            .dimmed()
            .italic()
    );
}

/// Spawn failures, sampling problems and degraded logging, one line each
fn print_problems(instances: &[InstanceSnapshot]) {
    for s in instances {
        if let Some(ref error) = s.last_error {
            let label = if s.startup_failure {
                "failed to start:"
            } else {
                "error:"
            };
            println!("  {} {} {}", s.name.cyan(), label.red(), error);
        }
        if let Some(ref reason) = s.log_degraded {
            println!("  {} {} {}", s.name.cyan(), "logging degraded:".yellow(), reason);
        }
    }
}

/// Format an instance state with color coding
fn format_state_colored(state: InstanceState) -> String {
    match state {
        InstanceState::Running => state.to_string().green().to_string(),
        InstanceState::Starting => state.to_string().yellow().to_string(),
        InstanceState::Restarting => state.to_string().yellow().to_string(),
        InstanceState::Exited => state.to_string().red().to_string(),
        InstanceState::Stopped => state.to_string().bright_black().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
