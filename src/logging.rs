//! Tracing initialization for the backup tools.
//!
//! Console output is pretty by default or JSON for log shippers. An optional
//! plain-text file layer mirrors everything to the backup log file.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Default)]
pub struct LogConfig {
    /// Output logs as JSON
    pub json: bool,
    /// Default level DEBUG instead of INFO
    pub verbose: bool,
    /// Also append logs to this file
    pub file: Option<PathBuf>,
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// A log file that cannot be opened is reported on stderr and skipped.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "citadel_backup={}",
            default_level.as_str().to_lowercase()
        ))
    });

    let file_layer = config.file.as_deref().and_then(open_log_file).map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(Arc::new(file))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Open `path` for appending, creating its directory. Failures are reported
/// on stderr since the subscriber is not installed yet.
fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("Cannot create log directory {}: {}", parent.display(), e);
            return None;
        }
    }

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Cannot open log file {}: {}", path.display(), e);
            None
        }
    }
}

/// Rate limiter for repetitive log lines, such as a poll loop's
/// "still waiting" message.
pub struct LogThrottle {
    interval_ms: u64,
    /// Last log time in ms since `start`, or NEVER_LOGGED
    last_log_ms: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            start: Instant::now(),
        }
    }

    /// True on the first call and whenever `interval` has passed since the
    /// last true. Safe to share between tasks.
    pub fn should_log(&self) -> bool {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);

        let due = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        // Losing the race means another caller just logged
        due && self
            .last_log_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
