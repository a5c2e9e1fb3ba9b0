//! Structured logging for conductor.
//!
//! Every component logs through `tracing`. The binary installs a subscriber
//! that writes to `~/.conductor/conductor.log`:
//! - ERROR: failures that leave an execution or task in a degraded state
//! - WARN: recoverable oddities (no-op control calls, kill on a finished run)
//! - INFO: lifecycle notifications (start, promote, complete, retry, sweep)
//! - DEBUG: admission decisions, dependency resolution, stream bookkeeping
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `RUST_LOG` overrides both when set.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable that switches on debug logging.
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Log file name inside the conductor directory.
pub const LOG_FILE: &str = "conductor.log";

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() -> Option<WorkerGuard> {
    init_with_debug(false)
}

/// Initialize logging with explicit debug mode setting.
///
/// Returns the appender guard; dropping it flushes and stops the writer, so
/// the caller keeps it alive for the lifetime of the process. Returns `None`
/// when no home directory is available, in which case nothing is logged.
pub fn init_with_debug(debug: bool) -> Option<WorkerGuard> {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let dir = Config::conductor_dir().ok()?;
    init_in_dir(&dir, debug_enabled)
}

/// Install the subscriber writing into `dir`, truncating any previous log.
pub fn init_in_dir(dir: &Path, debug: bool) -> Option<WorkerGuard> {
    std::fs::create_dir_all(dir).ok()?;
    // Truncate file on startup
    std::fs::write(dir.join(LOG_FILE), "").ok()?;

    let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter_for(debug))
        .with(layer)
        .try_init()
        .ok();

    Some(guard)
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn filter_for(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}
