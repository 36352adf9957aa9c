use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::env::StepInfo;

/// Buffered CSV telemetry log, one row per environment step.
///
/// Format (consumed by the external plotting tooling):
/// `step,speed,offroad,pos_x,pos_z,action,reason`. Rows are buffered and
/// flushed every `flush_every` records and on drop. A failed flush keeps
/// the buffered rows and retries on the next flush instead of dropping
/// them.
pub struct TelemetryLogger {
    path: PathBuf,
    rows: Vec<String>,
    flush_every: usize,
}

const HEADER: &str = "step,speed,offroad,pos_x,pos_z,action,reason";

impl TelemetryLogger {
    /// Open (or append to) the log at `path`. The header is written only
    /// when the file does not exist yet.
    pub fn create<P: AsRef<Path>>(path: P, flush_every: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to create telemetry log {}", path.display()))?;
            writeln!(file, "{HEADER}")?;
        }
        Ok(Self {
            path,
            rows: Vec::new(),
            flush_every: flush_every.max(1),
        })
    }

    /// Buffer one step's telemetry. `reason` is empty except on a
    /// terminating step.
    pub fn record(&mut self, step: u64, info: &StepInfo) {
        let reason = info
            .terminal_reason
            .map(|r| r.as_str())
            .unwrap_or_default();
        self.rows.push(format!(
            "{},{},{},{},{},{},{}",
            step, info.speed, info.offroad, info.pos_x, info.pos_z, info.action, reason
        ));
        if self.rows.len() >= self.flush_every {
            self.flush();
        }
    }

    pub fn pending(&self) -> usize {
        self.rows.len()
    }

    /// Append all buffered rows. On a transient I/O failure the rows stay
    /// buffered for the next attempt.
    pub fn flush(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        match self.try_flush() {
            Ok(()) => self.rows.clear(),
            Err(e) => warn!(
                rows = self.rows.len(),
                "telemetry flush failed, retaining buffered rows: {e:#}"
            ),
        }
    }

    fn try_flush(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open telemetry log {}", self.path.display()))?;
        for row in &self.rows {
            writeln!(file, "{row}")?;
        }
        file.flush()?;
        Ok(())
    }
}

impl Drop for TelemetryLogger {
    fn drop(&mut self) {
        self.flush();
    }
}
