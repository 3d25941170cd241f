//! Subscriber setup for the binaries

use crate::config::{ConfigError, LoggingConfig};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber described by `config`.
///
/// `level` overrides `config.level` (command line). Output goes to stderr
/// unless a log file is configured, which is appended to.
pub fn init(config: &LoggingConfig, level: Option<&str>) -> Result<(), ConfigError> {
    let level = level.unwrap_or(&config.level);
    let filter = EnvFilter::try_new(level).map_err(|e| ConfigError::Logging(e.to_string()))?;

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    installed.map_err(|e| ConfigError::Logging(e.to_string()))
}
