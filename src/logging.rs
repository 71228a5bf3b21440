//! Tracing subscriber setup.
//!
//! Logs go to stderr by default so stdout stays free for the streamed
//! answer. With `logging.file: true` they go to a rotated, line-flushed
//! `toolrelay.log` in the data directory instead.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor `logging.level` is set.
const DEFAULT_FILTER: &str = "toolrelay=info,warn";

/// Rotated log files kept next to the current one.
const KEEP_LOG_FILES: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// The `logging` config section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `toolrelay=debug`. `RUST_LOG` wins.
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Write to `<data_dir>/toolrelay.log` instead of stderr.
    #[serde(default)]
    pub file: bool,
}

/// Install the global subscriber. Returns the log file path when logging
/// to a file.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(config.level.as_deref().unwrap_or(DEFAULT_FILTER))
    })?;

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    if !config.file {
        let builder = builder.with_writer(std::io::stderr);
        match config.format {
            LogFormat::Text => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        }
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;
        return Ok(None);
    }

    let log_dir = crate::data_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path = log_dir.join("toolrelay.log");
    rotate_log_file(&log_path, KEEP_LOG_FILES);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let builder = builder.with_writer(FlushingWriter::new(log_file)).with_ansi(false);
    match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolrelay starting ==="
    );
    Ok(Some(log_path))
}

/// Rotate log files: `toolrelay.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
