use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;

/// One failure recorded against a file. `record` is the span index when the
/// failure concerns a single record rather than the whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub record: Option<usize>,
    pub error: String,
}

/// Per-run accumulator of file outcomes.
///
/// Each worker may own one and [`merge`](Self::merge) it into the run's stats.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub started_at: DateTime<Local>,
    succeeded: BTreeMap<String, usize>,
    failed: BTreeMap<String, Vec<FileFailure>>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            started_at: Local::now(),
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    pub fn record_success(&mut self, file_name: &str, events: usize) {
        self.succeeded.insert(file_name.to_string(), events);
    }

    pub fn record_failure(&mut self, file_name: &str, record: Option<usize>, error: impl Into<String>) {
        self.failed
            .entry(file_name.to_string())
            .or_default()
            .push(FileFailure { record, error: error.into() });
    }

    pub fn merge(&mut self, other: RunStats) {
        self.started_at = self.started_at.min(other.started_at);
        self.succeeded.extend(other.succeeded);
        for (file, failures) in other.failed {
            self.failed.entry(file).or_default().extend(failures);
        }
    }

    pub fn files_succeeded(&self) -> usize {
        self.succeeded.len()
    }

    /// Total failures across files, records and whole files alike.
    pub fn failure_count(&self) -> usize {
        self.failed.values().map(Vec::len).sum()
    }

    pub fn events_for(&self, file_name: &str) -> Option<usize> {
        self.succeeded.get(file_name).copied()
    }

    pub fn failures_for(&self, file_name: &str) -> &[FileFailure] {
        self.failed.get(file_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn summary(&self) -> RunSummary<'_> {
        RunSummary {
            stats: self,
            finished_at: Local::now(),
        }
    }
}

/// Final report printed at shutdown.
pub struct RunSummary<'a> {
    stats: &'a RunStats,
    pub finished_at: DateTime<Local>,
}

impl fmt::Display for RunSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats;
        let elapsed = self.finished_at.signed_duration_since(stats.started_at);

        writeln!(f, "\n📊 Run summary")?;
        writeln!(f, "   Start time: {}", stats.started_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(f, "   End time: {}", self.finished_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(
            f,
            "   Elapsed: {}.{:03}s",
            elapsed.num_seconds(),
            elapsed.num_milliseconds().rem_euclid(1000)
        )?;
        writeln!(f, "   Files successfully ingested: {}", stats.files_succeeded())?;
        writeln!(f, "   Failures during ingestion: {}", stats.failure_count())?;

        if !stats.succeeded.is_empty() {
            writeln!(f, "\n✅ Successful files and log counts:")?;
            for (file, events) in &stats.succeeded {
                writeln!(f, "   - {}: {}", file, events)?;
            }
        }
        if !stats.failed.is_empty() {
            writeln!(f, "\n⚠️  Failed files:")?;
            for (file, failures) in &stats.failed {
                let last = failures.last().map(|fl| fl.error.as_str()).unwrap_or("");
                writeln!(f, "   - {}: {} failures (last: {})", file, failures.len(), last)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_combines_workers() {
        let mut run = RunStats::new();
        run.record_success("a.xml", 10);
        run.record_failure("a.xml", Some(3), "bad markup");

        let mut worker = RunStats::new();
        worker.record_success("b.xml", 4);
        worker.record_failure("a.xml", Some(7), "bad markup again");
        worker.record_failure("c.xml", None, "permission denied");

        run.merge(worker);
        assert_eq!(run.files_succeeded(), 2);
        assert_eq!(run.failure_count(), 3);
        assert_eq!(run.events_for("b.xml"), Some(4));
        assert_eq!(run.failures_for("a.xml").len(), 2);
        assert!(run.failures_for("missing.xml").is_empty());
    }

    #[test]
    fn test_summary_lists_files() {
        let mut stats = RunStats::new();
        stats.record_success("System.xml", 42);
        stats.record_failure("Security.xml", None, "unreadable");
        let text = stats.summary().to_string();
        assert!(text.contains("Files successfully ingested: 1"));
        assert!(text.contains("System.xml: 42"));
        assert!(text.contains("Security.xml: 1 failures (last: unreadable)"));
    }
}
