//! Log filter selection and the rolling log file used by the CLI.
//!
//! Subscriber assembly stays in the binary. This module only picks the filter
//! strings and opens the file appender.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";

/// `ort` reports every session build at info level.
const ORT_NOISE_DIRECTIVE: &str = "ort=error";
/// Per-tile events are debug level.
const TILE_DETAIL_DIRECTIVE: &str = "tilerestore_core=debug";

const LOG_DIR_NAME: &str = "logs";
const LOG_FILE_PREFIX: &str = "tilerestore";
const LOG_FILE_SUFFIX: &str = "log";
const LOG_RETENTION_FILES: usize = 14;

/// `EnvFilter` directives for the stderr and file sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogFilters {
    /// Precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
    /// [`DEFAULT_LOG_FILTER`].
    ///
    /// A filter chosen on the command line is used as given by both sinks.
    /// Otherwise `ort` is muted below error and the file also keeps per-tile
    /// detail.
    pub fn select(cli_filter: Option<&str>, verbose: u8, rust_log: Option<&str>) -> Self {
        let explicit = match (cli_filter, verbose) {
            (Some(filter), _) => Some(filter),
            (None, 0) => None,
            (None, 1) => Some("debug"),
            (None, _) => Some("trace"),
        };
        if let Some(filter) = explicit {
            return Self {
                console: filter.to_string(),
                file: filter.to_string(),
            };
        }

        let base = rust_log
            .map(str::trim)
            .filter(|filter| !filter.is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER);
        let console = format!("{ORT_NOISE_DIRECTIVE},{base}");
        let file = format!("{console},{TILE_DETAIL_DIRECTIVE}");
        Self { console, file }
    }
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOG_DIR_NAME)
}

/// Daily-rotated `<data_dir>/logs/tilerestore.<date>.log`, two weeks kept.
pub fn open_log_file(data_dir: &Path) -> Result<RollingFileAppender> {
    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_RETENTION_FILES)
        .build(&dir)
        .with_context(|| format!("failed to open rolling log file in {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_filter_overrides_verbose_and_env() {
        let filters = LogFilters::select(Some("tilerestore_core=trace"), 2, Some("error"));
        assert_eq!(filters.console, "tilerestore_core=trace");
        assert_eq!(filters.file, "tilerestore_core=trace");
    }

    #[test]
    fn verbose_flags_beat_rust_log() {
        assert_eq!(LogFilters::select(None, 1, Some("warn")).console, "debug");
        assert_eq!(LogFilters::select(None, 3, None).file, "trace");
    }

    #[test]
    fn rust_log_is_used_with_noise_muted() {
        let filters = LogFilters::select(None, 0, Some("warn,my_crate=debug"));
        assert_eq!(filters.console, "ort=error,warn,my_crate=debug");
        assert_eq!(
            filters.file,
            "ort=error,warn,my_crate=debug,tilerestore_core=debug"
        );
    }

    #[test]
    fn blank_rust_log_falls_back_to_default() {
        let filters = LogFilters::select(None, 0, Some("  "));
        assert_eq!(filters.console, "ort=error,info");
        assert_eq!(filters.file, "ort=error,info,tilerestore_core=debug");
    }

    #[test]
    fn log_file_is_opened_under_data_dir() {
        let data_dir = tempdir().expect("tempdir");
        open_log_file(data_dir.path()).expect("log file should open");
        assert!(log_dir(data_dir.path()).is_dir());
    }

    #[test]
    fn log_file_error_names_the_directory() {
        let not_a_dir = NamedTempFile::new().expect("named temp file");
        let err = open_log_file(not_a_dir.path()).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("failed to create log directory"), "{message}");
        assert!(message.contains(LOG_DIR_NAME), "{message}");
    }
}
