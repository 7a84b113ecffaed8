use crate::engine::Engine;
use crate::ttl::ManualClock;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Log file path inside a test directory.
pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("data.db")
}

/// Open an engine on the system clock.
pub fn open(path: &Path) -> Engine {
    init_tracing();
    Engine::open(path).expect("open")
}

/// Open an engine driven by a shared manual clock, so tests control expiry
/// deterministically.
pub fn open_with(path: &Path, clock: &ManualClock) -> Engine {
    init_tracing();
    Engine::open_with_clock(path, Box::new(clock.clone())).expect("open")
}
