//! Tracing setup for the supervisor.
//!
//! Three sinks share one registry:
//!
//! - `warden.log`, JSON lines rotated daily, for everything the level filter
//!   lets through
//! - `lifecycle.log`, JSON lines holding only worker lifecycle events
//!   (target [`LIFECYCLE_TARGET`]) regardless of the level filter
//! - stderr, compact and human readable, tagged with the emitting thread so
//!   `warden-worker-<generation>` output stands apart from the runtime
//!
//! ```no_run
//! let _guard = warden_core::init_logging(None, 1)?;
//! warden_core::log_worker_event!(1u64, "started");
//! # Ok::<(), warden_core::WardenError>(())
//! ```

use std::path::PathBuf;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, MakeWriter, format::FmtSpan};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Result, WardenError};

pub const LOG_FILE_NAME: &str = "warden.log";
pub const LIFECYCLE_LOG_FILE_NAME: &str = "lifecycle.log";

/// Target used by [`log_worker_event!`](crate::log_worker_event).
pub const LIFECYCLE_TARGET: &str = "warden::lifecycle";

/// Overrides the default log directory when `--log-dir` is absent.
pub const LOG_DIR_ENV: &str = "WARDEN_LOG_DIR";

/// Flushes the file writers when dropped. Hold it for the life of the process.
pub struct LogGuard {
    _guards: Vec<WorkerGuard>,
}

/// Level for the `warden` crates given the number of `-v` flags.
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn level_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("warden={}", level_for(verbosity))))
}

/// JSON layer that only passes worker lifecycle events.
pub fn lifecycle_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_filter(filter_fn(|meta| meta.target() == LIFECYCLE_TARGET))
}

/// Install the global subscriber.
///
/// `RUST_LOG` replaces the verbosity-derived filter on the main file and on
/// stderr. The lifecycle file ignores both.
pub fn init_logging(log_dir: Option<PathBuf>, verbosity: u8) -> Result<LogGuard> {
    let log_dir = resolve_log_dir(log_dir)?;
    std::fs::create_dir_all(&log_dir).map_err(|e| WardenError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let (main_writer, main_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME));
    let (lifecycle_writer, lifecycle_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, LIFECYCLE_LOG_FILE_NAME));

    let main_layer = fmt::layer()
        .with_writer(main_writer)
        .with_ansi(false)
        .with_thread_names(true)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(level_filter(verbosity));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_file(verbosity > 1)
        .with_line_number(verbosity > 1)
        .compact()
        .with_filter(level_filter(verbosity));

    tracing_subscriber::registry()
        .with(main_layer)
        .with(console_layer)
        .with(lifecycle_layer(lifecycle_writer))
        .try_init()
        .map_err(|e| WardenError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(log_dir = %log_dir.display(), level = level_for(verbosity), "Logging initialized");

    Ok(LogGuard {
        _guards: vec![main_guard, lifecycle_guard],
    })
}

/// Console logging for unit tests. Safe to call from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}

/// `explicit`, else `$WARDEN_LOG_DIR`, else `~/.warden/logs`.
pub fn resolve_log_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    if let Some(dir) = std::env::var_os(LOG_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME").ok_or_else(|| WardenError::internal("HOME environment variable not set"))?;
    Ok(PathBuf::from(home).join(".warden").join("logs"))
}

/// Record a worker lifecycle transition for `generation`.
///
/// ```ignore
/// log_worker_event!(generation, "started");
/// log_worker_event!(generation, "crashed", reason = %reason);
/// ```
#[macro_export]
macro_rules! log_worker_event {
    ($generation:expr, $event:expr) => {
        tracing::info!(
            target: "warden::lifecycle",
            generation = $generation,
            event = $event,
            "worker lifecycle"
        )
    };
    ($generation:expr, $event:expr, $($field:tt)*) => {
        tracing::info!(
            target: "warden::lifecycle",
            generation = $generation,
            event = $event,
            $($field)*,
            "worker lifecycle"
        )
    };
}
