//! Logging init: append-only file under the service data dir.
//!
//! File setup can fail (read-only data dir, missing mount); callers fall back
//! to [`init_logging_stderr`] so a node never refuses to start over its log.

use anyhow::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "frameshift.log";

/// Per-event writer over the shared log file. The mutex keeps concurrent
/// tasks' lines from interleaving mid-record.
struct LogWriter(Arc<Mutex<File>>);

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,frameshift=debug"))
}

/// Initialize structured logging to `<data_dir>/frameshift.log`.
/// Returns Err when the data dir or file is unwritable; nothing is installed
/// in that case, so the caller can still pick the stderr variant.
pub fn init_logging(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)?;
    let path = data_dir.join(LOG_FILE);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let sink = Arc::new(Mutex::new(file));

    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(move || LogWriter(Arc::clone(&sink)))
        .with_ansi(false)
        .init();

    tracing::info!("frameshift logging initialized at {}", path.display());
    Ok(())
}

/// Log to stderr only; used when [`init_logging`] fails.
pub fn init_logging_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(io::stderr)
        .init();
}
