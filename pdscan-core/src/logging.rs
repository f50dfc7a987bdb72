//! Shared logging setup for pdscan binaries.
//!
//! Logs always go to stderr; stdout is reserved for the report.

use crate::Result;
use tracing_subscriber::EnvFilter;

/// Output format for log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Maps CLI verbosity onto a level.
///
/// `quiet` wins over `verbose`; 0 is INFO, 1 DEBUG, 2+ TRACE.
pub fn level_for(verbose: u8, quiet: bool) -> tracing::Level {
    match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    }
}

/// Initializes structured logging based on verbosity level.
///
/// `RUST_LOG`, when set, overrides the level derived from the flags.
///
/// # Example
/// ```rust,no_run
/// use pdscan_core::logging::init_logging;
///
/// // Initialize at DEBUG level
/// init_logging(1, false).expect("Failed to initialize logging");
/// ```
pub fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    init_logging_with_format(verbose, quiet, LogFormat::Text)
}

/// Like [`init_logging`] with an explicit output format.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_logging_with_format(verbose: u8, quiet: bool, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbose, quiet).as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    installed.map_err(|e| {
        crate::error::ScanError::configuration(format!("Failed to initialize logging: {}", e))
    })
}
