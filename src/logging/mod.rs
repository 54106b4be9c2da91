//! Logging infrastructure - structured tracing throughout the bridge
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Per-concern targets under the crate: `astbridge::native`, `astbridge::lock`,
//!   `astbridge::lifecycle` and `astbridge::callback`
//! - Zero-cost when disabled
//! - Span-based performance tracking
//! - Console or file output (file output through a non-blocking appender)

use crate::config::{LogFormat, LoggingSection};
use crate::native::{NativeHandle, StatusCode};
use once_cell::sync::OnceCell;
use std::io;
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Keeps the file appender's worker alive for the life of the process
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File { directory: PathBuf, prefix: String },
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Show span events (enter/exit)
    pub span_events: bool,
    /// Explicit filter directives; overrides `level` when set
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            span_events: false,
            filter: None,
        }
    }
}

fn parse_level(value: &str) -> Level {
    match value.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn parse_format(value: &str) -> LogFormat {
    match value.to_lowercase().as_str() {
        "pretty" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        _ => LogFormat::Compact,
    }
}

fn file_output(path: &str) -> LogOutput {
    let path = PathBuf::from(path);
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let prefix = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "astbridge.log".to_string());
    LogOutput::File { directory, prefix }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // ASTBRIDGE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level) = std::env::var("ASTBRIDGE_LOG_LEVEL") {
            config.level = parse_level(&level);
        }

        // ASTBRIDGE_LOG_FORMAT: pretty, compact, json
        if let Ok(format) = std::env::var("ASTBRIDGE_LOG_FORMAT") {
            config.format = parse_format(&format);
        }

        // ASTBRIDGE_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("ASTBRIDGE_LOG_FILE") {
            config.output = file_output(&path);
        }

        // ASTBRIDGE_LOG_SPANS: show span events
        config.span_events = std::env::var("ASTBRIDGE_LOG_SPANS").is_ok();

        config
    }

    /// Config described by the `[logging]` section of a bridge config file
    pub fn from_section(section: &LoggingSection) -> Self {
        Self {
            level: parse_level(&section.level),
            format: section.format,
            output: section
                .file
                .as_deref()
                .map(file_output)
                .unwrap_or(LogOutput::Stderr),
            span_events: section.spans,
            filter: None,
        }
    }

    /// Create high-performance config (minimal logging)
    pub fn performance() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Create debug config (verbose logging)
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            format: LogFormat::Pretty,
            output: file_output("astbridge.log"),
            span_events: true,
            filter: None,
        }
    }

    pub fn with_filter(mut self, directives: impl Into<String>) -> Self {
        self.filter = Some(directives.into());
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }
}

/// Initialize logging with default configuration
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(config.filter.clone().unwrap_or_else(|| default_directive(config.level)))
        });

        let span_events = if config.span_events {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let writer = match &config.output {
            LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
            LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
            LogOutput::File { directory, prefix } => {
                let appender = tracing_appender::rolling::never(directory, prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);
                BoxMakeWriter::new(writer)
            }
        };

        let base = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions))
            .with_line_number(cfg!(debug_assertions));
        let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Json => base.json().boxed(),
        };

        // Another subscriber may already be installed (test harnesses)
        let _ = tracing_subscriber::registry()
            .with(layer)
            .with(env_filter)
            .try_init();
    });
}

/// Filter used when neither `RUST_LOG` nor a configured filter is set;
/// covers every target the bridge logs under
pub fn default_directive(level: Level) -> String {
    format!("astbridge={}", level.as_str().to_lowercase())
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Bridge-specific logging functions
// ============================================================================

/// Log entry to a guarded native call
#[inline]
pub fn log_native_call(op: &str, locks: usize, nested: bool) {
    use tracing::trace;
    trace!(
        target: "astbridge::native",
        event = "native_call",
        op = op,
        locks = locks,
        nested = nested,
        "Guarded native call"
    );
}

/// Log a guarded call that finished cleanly
#[inline]
pub fn log_native_return(op: &str) {
    use tracing::trace;
    trace!(
        target: "astbridge::native",
        event = "native_return",
        op = op,
        "Guarded native call returned"
    );
}

/// Log a native failure status
pub fn log_native_error(op: &str, status: StatusCode, message: &str) {
    use tracing::debug;
    debug!(
        target: "astbridge::native",
        event = "native_error",
        op = op,
        status = %status,
        message = message,
        "Native call reported failure"
    );
}

/// Log per-object lock acquisition
#[inline]
pub fn log_lock_acquire(handle: NativeHandle, wait: bool) {
    use tracing::trace;
    trace!(
        target: "astbridge::lock",
        event = "lock_acquire",
        handle = ?handle,
        wait = wait,
        "Object lock acquired"
    );
}

/// Log per-object lock release
#[inline]
pub fn log_lock_release(handle: NativeHandle) {
    use tracing::trace;
    trace!(
        target: "astbridge::lock",
        event = "lock_release",
        handle = ?handle,
        "Object lock released"
    );
}

/// Log a failed lock primitive
pub fn log_lock_failure(handle: NativeHandle, action: &str, message: &str) {
    use tracing::error;
    error!(
        target: "astbridge::lock",
        event = "lock_failure",
        handle = ?handle,
        action = action,
        message = message,
        "Object lock primitive failed"
    );
}

/// Log a native release; `how` is explicit, implicit or deferred
pub fn log_dispose(handle: NativeHandle, how: &str) {
    use tracing::debug;
    debug!(
        target: "astbridge::lifecycle",
        event = "dispose",
        handle = ?handle,
        how = how,
        "Native handle released"
    );
}

/// Log a release postponed until the next outermost guarded call
pub fn log_release_deferred(handle: NativeHandle, pending: u64) {
    use tracing::debug;
    debug!(
        target: "astbridge::lifecycle",
        event = "release_deferred",
        handle = ?handle,
        pending = pending,
        "Native release deferred"
    );
}

/// Log a release failure nobody is present to observe
pub fn log_release_failure(handle: NativeHandle, error: &str, loud: bool) {
    use tracing::{debug, warn};
    if loud {
        warn!(
            target: "astbridge::lifecycle",
            event = "release_failure",
            handle = ?handle,
            error = error,
            "Implicit release failed"
        );
    } else {
        debug!(
            target: "astbridge::lifecycle",
            event = "release_failure",
            handle = ?handle,
            error = error,
            "Implicit release failed"
        );
    }
}

/// Log a managed callback that raised an error or panicked
pub fn log_callback_failure(kind: &str, error: &str) {
    use tracing::debug;
    debug!(
        target: "astbridge::callback",
        event = "callback_failure",
        kind = kind,
        error = error,
        "Callback failed; failure deferred to the guarded call"
    );
}

/// Log a broken bridge invariant
pub fn log_fatal(context: &str, message: &str) {
    use tracing::error;
    error!(
        event = "bridge_fatal",
        context = context,
        message = message,
        "Bridge invariant violated"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            debug!(
                target: "astbridge::native",
                operation = self.operation,
                duration_us = elapsed.as_micros() as u64,
                "operation completed"
            );
        }
    }
}
