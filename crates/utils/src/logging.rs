//! provides logging helpers

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("log file path `{0}` has no file name")]
    NoFileName(PathBuf),

    #[error("failed to create rolling file appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),
}

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
pub fn init() {
    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    registry().with(fmt_layer).init();
}

/// initiate the global tracing subscriber, additionally writing to a daily
/// rolling file next to `log_file`
pub fn init_with_file(log_file: &Path) -> Result<WorkerGuard, LoggingError> {
    let (dir, prefix) = split_log_path(log_file)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());
    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(env_filter());

    registry().with(stderr_layer).with(file_layer).init();
    Ok(file_guard)
}

fn split_log_path(log_file: &Path) -> Result<(&Path, String), LoggingError> {
    let prefix = log_file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| LoggingError::NoFileName(log_file.to_path_buf()))?;
    let dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((dir, prefix))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn split_log_path_uses_parent_and_file_name() {
        let (dir, prefix) = split_log_path(Path::new("/logs/device-plugin.log")).unwrap();
        assert_eq!(dir, Path::new("/logs"));
        assert_eq!(prefix, "device-plugin.log");
    }

    #[test]
    fn split_log_path_defaults_to_current_dir() {
        let (dir, prefix) = split_log_path(Path::new("plugin.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(prefix, "plugin.log");
    }

    #[test]
    fn split_log_path_rejects_root() {
        assert!(matches!(
            split_log_path(Path::new("/")),
            Err(LoggingError::NoFileName(_))
        ));
    }
}
