use drover::cli::Cli;
use std::process::ExitCode;

fn main() -> ExitCode {
    match Cli::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("✗ Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
