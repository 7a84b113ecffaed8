//! The `ordodb` binary: a line-oriented shell over the storage engine.
//!
//! Reads one command per line from stdin and writes responses to stdout.
//! Diagnostics go to stderr via `tracing` (filtered by `RUST_LOG`), keeping
//! stdout a clean protocol channel. The only argument is the optional log
//! file path; exit code is 0 on clean EOF.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ordodb::engine::Engine;
use ordodb::repl;

/// Embedded ordered key-value store with TTLs and transactions.
#[derive(Debug, Parser)]
#[command(name = "ordodb", version, about)]
struct Args {
    /// Path of the append-only log file.
    #[arg(default_value = "data.db")]
    log_path: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let mut engine = match Engine::open(&args.log_path) {
        Ok(engine) => engine,
        Err(e) => {
            error!(path = %args.log_path.display(), error = %e, "failed to open engine");
            return ExitCode::FAILURE;
        }
    };

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();

    match repl::run(&mut engine, stdin, stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command loop failed");
            ExitCode::FAILURE
        }
    }
}
