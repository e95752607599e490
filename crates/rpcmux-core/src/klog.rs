//! stderr backend for the `log` facade
//!
//! Library code logs through `log::{error, warn, info, debug, trace}`.
//! Binaries and tests that want to see that output call [`init`] once.
//!
//! # Environment Variables
//!
//! - `RPCMUX_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace or 0..=5
//! - `RPCMUX_FLUSH_LOG=1` - flush stderr after every line (useful when a
//!   test aborts mid-run)

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record};

use crate::env::{env_get_bool, env_get_opt};

static LOGGER: StderrLogger = StderrLogger;
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Parse a level from its name or its number (0 = off .. 5 = trace).
pub fn parse_level(raw: &str) -> Option<LevelFilter> {
    let level = match raw.trim().to_ascii_lowercase().as_str() {
        "off" | "0" => LevelFilter::Off,
        "error" | "1" => LevelFilter::Error,
        "warn" | "2" => LevelFilter::Warn,
        "info" | "3" => LevelFilter::Info,
        "debug" | "4" => LevelFilter::Debug,
        "trace" | "5" => LevelFilter::Trace,
        _ => return None,
    };
    Some(level)
}

/// Install the stderr logger.
///
/// Idempotent. If another logger was installed first, that one stays and
/// only the level filter is applied.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    FLUSH_ENABLED.store(env_get_bool("RPCMUX_FLUSH_LOG", false), Ordering::Relaxed);

    let level = env_get_opt::<String>("RPCMUX_LOG_LEVEL")
        .and_then(|raw| parse_level(&raw))
        .unwrap_or(LevelFilter::Info);

    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Override the level chosen by the environment.
pub fn set_log_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Override per-line flushing.
pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // One locked write per line so concurrent threads never interleave.
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = writeln!(
            handle,
            "[{:<5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
        if FLUSH_ENABLED.load(Ordering::Relaxed) {
            let _ = handle.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
