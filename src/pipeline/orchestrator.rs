use crate::config::{RetryPolicy, Settings};
use crate::constants::{ALL_FILES, EXPORT_EXTENSION};
use crate::error::{ExcavatorError, Result};
use crate::metrics::PipelineMetrics;
use crate::pipeline::assembler::{RecordSpan, RecordSpans};
use crate::pipeline::crash_dump::CrashDump;
use crate::pipeline::dispatcher::BatchDispatcher;
use crate::pipeline::normalize::{EventLogNormalizer, Normalizer};
use crate::pipeline::parser::parse_record;
use crate::pipeline::stats::RunStats;
use crate::sink::BulkSink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::BufReader;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Where a file is in its trip through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Open,
    Assembling,
    Parsed,
    ParseFailed,
    Normalized,
    Dispatched,
    Done,
    Aborted,
}

/// Outcome of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub file_name: String,
    pub state: FileState,
    pub events: usize,
    pub failures: usize,
    pub discarded_trailing: bool,
}

impl FileReport {
    fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            state: FileState::Open,
            events: 0,
            failures: 0,
            discarded_trailing: false,
        }
    }

    fn transition(&mut self, next: FileState) {
        debug!(file = %self.file_name, from = ?self.state, to = ?next, "state");
        self.state = next;
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub index: String,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub crash_dir: PathBuf,
}

impl From<&Settings> for PipelineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            index: settings.index.clone(),
            batch_size: settings.batch_size,
            retry: settings.retry,
            crash_dir: settings.crash_dir.clone(),
        }
    }
}

/// Drives export files through assemble, parse, normalize and dispatch.
#[derive(Clone)]
pub struct Orchestrator {
    sink: Arc<dyn BulkSink>,
    normalizer: Arc<dyn Normalizer>,
    crash_dump: Arc<CrashDump>,
    options: Arc<PipelineOptions>,
    cancel: CancellationToken,
    run_started: Instant,
}

impl Orchestrator {
    pub fn new(sink: Arc<dyn BulkSink>, options: PipelineOptions, cancel: CancellationToken) -> Self {
        let crash_dump = CrashDump::new(options.crash_dir.clone(), &options.index);
        Self {
            sink,
            normalizer: Arc::new(EventLogNormalizer::default()),
            crash_dump: Arc::new(crash_dump),
            options: Arc::new(options),
            cancel,
            run_started: Instant::now(),
        }
    }

    pub fn crash_dump(&self) -> &CrashDump {
        &self.crash_dump
    }

    /// Process files, `jobs` at a time, recording outcomes into `stats`.
    /// With one job, files run strictly in the given order. Once the run is
    /// cancelled, files not yet started are recorded as failures without
    /// being opened.
    pub async fn run(&self, files: Vec<PathBuf>, jobs: usize, stats: &mut RunStats) -> Vec<FileReport> {
        let mut reports = Vec::with_capacity(files.len());
        if jobs <= 1 {
            for path in files {
                if let Some(report) = self.run_one(&path, stats).await {
                    reports.push(report);
                }
            }
            return reports;
        }

        let permits = Arc::new(Semaphore::new(jobs));
        let mut workers = JoinSet::new();
        for path in files {
            let orchestrator = self.clone();
            let permits = permits.clone();
            workers.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let mut local = RunStats::new();
                let report = orchestrator.run_one(&path, &mut local).await;
                (report, local)
            });
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((report, local)) => {
                    stats.merge(local);
                    reports.extend(report);
                }
                Err(e) => error!("File worker panicked: {}", e),
            }
        }
        reports
    }

    async fn run_one(&self, path: &Path, stats: &mut RunStats) -> Option<FileReport> {
        match self.process_file(path, stats).await {
            Ok(report) => Some(report),
            Err(e) => {
                let file_name = file_name_of(path);
                error!("Processing {} stopped: {}", file_name, e);
                stats.record_failure(&file_name, None, e.to_string());
                None
            }
        }
    }

    /// Run one file to `Done` (or `Aborted` when it cannot be opened).
    ///
    /// Record-level parse failures are counted and dumped but never stop the
    /// file. An `Err` means the file could not be finished: a read error, a
    /// cancelled run, or a flush that gave up.
    #[instrument(skip(self, stats), fields(file = %path.display()))]
    pub async fn process_file(&self, path: &Path, stats: &mut RunStats) -> Result<FileReport> {
        let file_name = file_name_of(path);
        let mut report = FileReport::new(&file_name);
        self.ensure_running(|| format!("waiting to open {file_name}"))?;

        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => {
                error!("Unable to open {}: {}", path.display(), e);
                report.transition(FileState::Aborted);
                stats.record_failure(&file_name, None, format!("unable to open: {e}"));
                return Ok(report);
            }
        };
        info!("Processing {}", file_name);
        report.transition(FileState::Assembling);

        let mut spans = RecordSpans::new(BufReader::new(file));
        let mut dispatcher = BatchDispatcher::new(
            self.sink.clone(),
            self.options.batch_size,
            self.options.retry,
            self.cancel.clone(),
        )
        .for_stream(&file_name, self.run_started);

        while let Some(span) = spans.next_span().await {
            let span = span?;
            self.ensure_running(|| format!("reading record {} of {file_name}", span.index))?;
            self.handle_span(span, &mut report, &mut dispatcher, stats).await?;
        }
        report.discarded_trailing = spans.discarded().is_some();

        info!(
            "Elapsed Time: {:?} -- Sending remaining logs from {} ({} records)",
            self.run_started.elapsed(),
            file_name,
            report.events
        );
        dispatcher.flush().await?;

        report.transition(FileState::Done);
        stats.record_success(&file_name, report.events);
        PipelineMetrics::record_file_done();
        info!(
            "Finished {}: {} records, {} failures",
            file_name, report.events, report.failures
        );
        Ok(report)
    }

    fn ensure_running(&self, doing: impl FnOnce() -> String) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ExcavatorError::Cancelled(doing()));
        }
        Ok(())
    }

    async fn handle_span(
        &self,
        span: RecordSpan,
        report: &mut FileReport,
        dispatcher: &mut BatchDispatcher,
        stats: &mut RunStats,
    ) -> Result<()> {
        let record = match parse_record(&span.text) {
            Ok(record) => record,
            Err(e) => {
                report.transition(FileState::ParseFailed);
                report.failures += 1;
                PipelineMetrics::record_parse_failure();
                error!("Record {} of {} could not be parsed: {}", span.index, report.file_name, e);
                stats.record_failure(&report.file_name, Some(span.index), e.to_string());
                match self.crash_dump.record(&report.file_name, &span).await {
                    Ok(path) => debug!("Raw record written to {}", path.display()),
                    Err(dump_err) => warn!("Could not write crash dump: {}", dump_err),
                }
                report.transition(FileState::Assembling);
                return Ok(());
            }
        };
        report.transition(FileState::Parsed);
        PipelineMetrics::record_parsed();

        let document = self.normalizer.normalize(record, &report.file_name);
        report.transition(FileState::Normalized);
        PipelineMetrics::record_anomalies(document.anomalies.len());
        for anomaly in &document.anomalies {
            debug!("Record {} of {}: {}", span.index, report.file_name, anomaly);
        }

        report.events += 1;
        dispatcher.add(document, &self.options.index).await?;
        report.transition(FileState::Dispatched);
        report.transition(FileState::Assembling);
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Export files selected by `selector`: every `.xml` file in `dir` for `*`
/// (sorted by name), otherwise the one named file when it is an `.xml` export.
pub fn select_files(dir: &Path, selector: &str) -> Result<Vec<PathBuf>> {
    if selector != ALL_FILES {
        if selector.ends_with(EXPORT_EXTENSION) {
            return Ok(vec![dir.join(selector)]);
        }
        warn!("Skipping {}: not an {} export", selector, EXPORT_EXTENSION);
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| {
        ExcavatorError::InputUnavailable(format!("cannot list {}: {}", dir.display(), e))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_export = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(EXPORT_EXTENSION))
            .unwrap_or(false);
        if is_export && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
