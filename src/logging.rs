//! Logging setup for the catalog binary.
//!
//! Log lines go to systemd's journal on Linux when it is reachable, and to a
//! daily rolling file under the data directory otherwise. Standard output is
//! left free for command output.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "PHOTOCAT_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Where [`init`] sent the log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Journald,
    File(PathBuf),
}

/// Filter from a directive such as `debug` or `photocat::db=trace`. Missing
/// or unparsable directives fall back to `info`.
pub fn filter_from(directive: Option<&str>) -> EnvFilter {
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber. `log_dir` is only used when journald is
/// unavailable.
pub fn init(log_dir: &Path) -> Result<LogTarget> {
    let directive = std::env::var(LOG_ENV).ok();
    let env_filter = filter_from(directive.as_deref());

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .try_init()?;
            return Ok(LogTarget::Journald);
        }
    }

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "photocat.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Flushes on drop, so it has to live as long as the process.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    Ok(LogTarget::File(log_dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults_to_info() {
        assert_eq!(filter_from(None).to_string(), "info");
    }

    #[test]
    fn test_filter_keeps_module_directive() {
        assert_eq!(filter_from(Some("photocat=debug")).to_string(), "photocat=debug");
    }
}
