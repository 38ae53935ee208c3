//! bletrack-feeder: device and stream bindings for the BLE capture link.
//!
//! Provides the concrete `Transport` and `GpsSource` implementations used by
//! both the `bletrack-feeder` binary and the `bletrack` server CLI, plus the
//! shared tracing setup.

pub mod gps_source;
pub mod transport;

pub use gps_source::{open_gps_source, ReaderGpsSource};
pub use transport::{open_transport, ChannelTransport, Endpoint, ReaderTransport};

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bletrack_core::config::LogLevel;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Open a new `bletrack_YYYYmmdd_HHMMSS.log` in `dir`, creating the directory.
pub fn open_log_file(dir: &Path) -> io::Result<(File, PathBuf)> {
    fs::create_dir_all(dir)?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.join(format!("bletrack_{stamp}.log"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((file, path))
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
///
/// Events always go to stderr. With `log_dir`, they are also written without
/// ANSI colours to a timestamped file there, whose path is returned.
pub fn init_tracing(level: LogLevel, log_dir: Option<&Path>) -> io::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.name()));

    let (file_layer, log_path) = match log_dir {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            let layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(file_layer)
        .try_init();
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_log_file_names_and_creates() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let (_file, path) = open_log_file(&logs).unwrap();

        assert!(path.exists());
        assert_eq!(path.parent(), Some(logs.as_path()));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("bletrack_"));
        assert!(name.ends_with(".log"));
        // bletrack_ + YYYYmmdd_HHMMSS + .log
        assert_eq!(name.len(), "bletrack_".len() + 15 + ".log".len());
    }

    #[test]
    fn test_open_log_file_rejects_file_as_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("taken");
        fs::write(&blocker, b"x").unwrap();
        assert!(open_log_file(&blocker).is_err());
    }

    #[test]
    fn test_init_tracing_writes_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = init_tracing(LogLevel::Info, Some(dir.path()))
            .unwrap()
            .unwrap();

        tracing::info!(sequence = 7, "log file check");
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("log file check"));
        assert!(text.contains("sequence=7"));
        assert!(!text.contains('\u{1b}'));
    }
}
