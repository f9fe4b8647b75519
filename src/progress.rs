//! Console progress reporting for the step loops.
//!
//! The sinks only render; counting lives in the step code. Tests use
//! [`SilentProgress`] so assertions never depend on terminal output.

use std::io::{self, Write};

pub trait ProgressSink {
    /// Rewrite the transient counter line in place.
    fn update(&mut self, line: &str);
    /// Emit a durable line, finishing any transient line first.
    fn println(&mut self, line: &str);
}

/// Writes transient lines with a carriage return so the counters tick in
/// place, the way the long-running upload loop is meant to be watched.
#[derive(Default)]
pub struct ConsoleProgress {
    transient_len: usize,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for ConsoleProgress {
    fn update(&mut self, line: &str) {
        let mut stdout = io::stdout().lock();
        // Pad with spaces so a shorter line fully covers the previous one.
        let padding = self.transient_len.saturating_sub(line.len());
        let _ = write!(stdout, "\r{line}{}", " ".repeat(padding));
        let _ = stdout.flush();
        self.transient_len = line.len();
    }

    fn println(&mut self, line: &str) {
        let mut stdout = io::stdout().lock();
        if self.transient_len > 0 {
            let _ = writeln!(stdout);
            self.transient_len = 0;
        }
        let _ = writeln!(stdout, "{line}");
    }
}

/// No-op sink for tests and quiet runs.
#[derive(Default)]
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn update(&mut self, _line: &str) {}
    fn println(&mut self, _line: &str) {}
}

/// Counters for one pass of the asset upload pipeline.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssetCounts {
    /// Freshly uploaded this pass.
    pub created: u64,
    /// Found on the server via the device id check.
    pub duplicates: u64,
    /// Already present in the checkpoint map.
    pub tracked: u64,
    /// Marked trashed in the export; never uploaded.
    pub trashed: u64,
    /// Skipped because they sit in the problem set from an earlier run.
    pub problems: u64,
}

impl AssetCounts {
    pub fn record_created(&mut self) {
        self.created += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates += 1;
    }

    pub fn record_tracked(&mut self) {
        self.tracked += 1;
    }

    pub fn record_trashed(&mut self) {
        self.trashed += 1;
    }

    pub fn record_problem_skip(&mut self) {
        self.problems += 1;
    }

    /// Assets resolved one way or another. Problem skips are deliberately
    /// excluded: they keep the step from completing.
    pub fn accounted(&self) -> u64 {
        self.created + self.duplicates + self.tracked + self.trashed
    }

    pub fn progress_line(&self, total: usize) -> String {
        format!(
            "Assets created: {} / {}; Duplicates per server: {}; Uploaded per tracker: {}; Trashed assets: {}",
            self.created, total, self.duplicates, self.tracked, self.trashed
        )
    }
}
