//! Subscriber setup for the `media-vault` binary.
//!
//! The terminal only shows what the user asked for with `-v`; the log file
//! always keeps debug output of the media-vault crates so a failed import or
//! proxy run can be looked at afterwards.

use std::env;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Overrides the terminal filter, in `EnvFilter` directive syntax.
const LOG_ENV: &str = "MEDIA_VAULT_LOG";
const LOG_FILE_ENV: &str = "MEDIA_VAULT_LOG_FILE";
const DEFAULT_LOG_FILE: &str = "logs/media-vault.log";

const FILE_DIRECTIVES: &str = "info,media_vault=debug,media_vault_core=debug";

/// Terminal directives for a `-v` count. Dependencies stay at `warn` until
/// the count goes past two.
fn terminal_directives(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn,media_vault=info,media_vault_core=info",
        1 => "warn,media_vault=debug,media_vault_core=debug",
        2 => "warn,media_vault=trace,media_vault_core=trace",
        _ => "debug,media_vault=trace,media_vault_core=trace",
    }
}

fn log_file_path() -> PathBuf {
    env::var_os(LOG_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
}

/// Split a log path into the directory and the file name prefix the daily
/// roller expects.
fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "media-vault.log".to_string());
    (dir, file_name)
}

/// Install the global subscriber. Keep the guard alive until exit or buffered
/// file lines are lost.
pub fn init_logger(verbose: u8) -> WorkerGuard {
    let terminal_filter = env::var(LOG_ENV)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(terminal_directives(verbose)));

    let log_path = log_file_path();
    let (log_dir, file_name) = split_log_path(&log_path);
    let file_appender = tracing_appender::rolling::daily(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_writer(io::stderr)
                .with_target(verbose > 0)
                .without_time()
                .with_filter(terminal_filter),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(EnvFilter::new(FILE_DIRECTIVES)),
        )
        .init();

    debug!("Logging to {}", log_path.display());
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_raises_only_own_crates_first() {
        assert!(terminal_directives(0).starts_with("warn,"));
        assert!(terminal_directives(1).contains("media_vault_core=debug"));
        assert!(terminal_directives(2).starts_with("warn,"));
        assert!(terminal_directives(7).starts_with("debug,"));
    }

    #[test]
    fn test_split_log_path() {
        assert_eq!(
            split_log_path(Path::new("logs/media-vault.log")),
            (PathBuf::from("logs"), "media-vault.log".to_string())
        );
        assert_eq!(
            split_log_path(Path::new("vault.log")),
            (PathBuf::from("."), "vault.log".to_string())
        );
    }
}
