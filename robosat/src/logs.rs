//! Human-readable run log.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::error::{RoboSatError, RoboSatResult};

/// Receives the per-run banner and per-epoch summaries.
pub trait LogSink {
    fn log(&mut self, line: &str);
}

/// Collects lines in memory.
impl LogSink for Vec<String> {
    fn log(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

/// Appends lines to `<out>/log` and mirrors them to `tracing`.
pub struct Logs {
    path: PathBuf,
    file: File,
}

impl Logs {
    /// Opens, or creates, the log file in `out`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory or file cannot be created.
    pub fn new(out: &Path) -> RoboSatResult<Self> {
        fs::create_dir_all(out).map_err(|e| RoboSatError::io(out, e))?;
        let path = out.join("log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RoboSatError::io(&path, e))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for Logs {
    fn log(&mut self, line: &str) {
        tracing::info!("{line}");
        if let Err(e) = writeln!(self.file, "{line}") {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to append to log");
        }
    }
}
