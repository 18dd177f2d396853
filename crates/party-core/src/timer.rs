//! Per-analysis wall-clock durations, appended to a per-party log file. A
//! missing `start` on `end` is a logged no-op, not an error — timing is
//! diagnostic, never load-bearing.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use parking_lot::Mutex;

pub struct AnalysisTimer {
    log_path: PathBuf,
    start_times: Mutex<HashMap<String, Instant>>,
}

impl AnalysisTimer {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            start_times: Mutex::new(HashMap::new()),
        }
    }

    /// Overwrites any existing entry, logging a warning when it does.
    pub fn start(&self, analysis_id: &str) {
        let mut starts = self.start_times.lock();
        if starts.contains_key(analysis_id) {
            tracing::warn!(analysis_id, "overwriting existing start time");
        }
        starts.insert(analysis_id.to_string(), Instant::now());
    }

    /// Computes the duration and appends `"Analysis ID: <id>, Duration: <sec>
    /// seconds\n"` to the log file. No-op (with a warning) if `start` was
    /// never called.
    pub fn end(&self, analysis_id: &str) {
        let started_at = self.start_times.lock().remove(analysis_id);
        let Some(started_at) = started_at else {
            tracing::warn!(analysis_id, "no existing start time, cannot calculate duration");
            return;
        };
        let duration = started_at.elapsed().as_secs_f64();
        if let Err(err) = self.append_line(analysis_id, duration) {
            tracing::warn!(analysis_id, %err, "failed to append analysis timing log");
        }
    }

    fn append_line(&self, analysis_id: &str, duration_secs: f64) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "Analysis ID: {analysis_id}, Duration: {duration_secs:.2} seconds")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_end_appends_log_line() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("analysis_times_0.log");
        let timer = AnalysisTimer::new(log_path.clone());
        timer.start("a1");
        timer.end("a1");
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.starts_with("Analysis ID: a1, Duration: "));
    }

    #[test]
    fn end_without_start_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("analysis_times_0.log");
        let timer = AnalysisTimer::new(log_path.clone());
        timer.end("missing");
        assert!(!log_path.exists());
    }

    #[test]
    fn restart_overwrites_previous_start() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("analysis_times_0.log");
        let timer = AnalysisTimer::new(log_path.clone());
        timer.start("a1");
        timer.start("a1");
        timer.end("a1");
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
