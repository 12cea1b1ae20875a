//! Structured logging for washmap.
//!
//! Log levels:
//! - ERROR: Failures that abort a command
//! - WARN: Recoverable conditions (failed transfers, tasks left in flight)
//! - INFO: Campaign lifecycle (planned, funded, paused, finished)
//! - DEBUG: Per-task dispatch and store traces
//! - TRACE: Very detailed traces
//!
//! Output goes to `~/.washmap/washmap.log`. Debug mode can be enabled with
//! the `--debug` flag or `WASHMAP_DEBUG=1`; `WASHMAP_LOG` accepts a level
//! or a full filter directive such as `washmap=trace`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Log levels accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

/// Path of the log file.
pub fn log_path() -> Option<PathBuf> {
    Config::washmap_dir().ok().map(|dir| dir.join("washmap.log"))
}

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// The log file is truncated on startup. Without a home directory the
/// subscriber writes to stderr instead.
pub fn init_with_debug(debug: bool) {
    let env_debug = std::env::var("WASHMAP_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = filter_for(debug_enabled, std::env::var("WASHMAP_LOG").ok().as_deref());

    let file = log_path().and_then(|path| {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        File::create(&path).ok()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false);
    // try_init fails only if a subscriber is already installed.
    let _ = match file {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Build the filter from the debug flag and an optional `WASHMAP_LOG`
/// value. An explicit value wins over the flag.
fn filter_for(debug: bool, env_value: Option<&str>) -> EnvFilter {
    if let Some(value) = env_value.map(str::trim).filter(|v| !v.is_empty()) {
        let directive = LogLevel::parse(value)
            .map(|level| level.as_str().to_string())
            .unwrap_or_else(|| value.to_string());
        if let Ok(filter) = EnvFilter::try_new(directive) {
            return filter;
        }
    }
    let level = if debug { LogLevel::Debug } else { LogLevel::Info };
    EnvFilter::new(level.as_str())
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}
