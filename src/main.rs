use anyhow::Context;
use clap::Parser;
use excavator::config::{Cli, Mode, Settings};
use excavator::convert::{convert_exports, export_name};
use excavator::pipeline::{select_files, CancellationToken, Orchestrator, PipelineOptions, RunStats};
use excavator::sink::{BulkSink, ElasticsearchSink, PrintSink};
use excavator::{logging, metrics};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut stats = RunStats::new();
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::resolve(cli)?;
    settings.validate()?;
    settings.check_input()?;

    let _log_guard = logging::init_logging("info");
    metrics::init_metrics();
    info!("Time of start: {}", stats.started_at);

    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, stopping before the next record; press Ctrl-C again to exit now");
        trip.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Second interrupt received, exiting");
            std::process::exit(130);
        }
    });

    if settings.mode.converts() {
        if settings.mode == Mode::Auto {
            println!("⚠️  AUTO only works with Windows!");
        }
        let exports = convert_exports(&settings.path, &settings.file)
            .await
            .context("converting .evtx files")?;
        println!("✅ Converted {} file(s)", exports.len());
    }

    if settings.mode.processes() {
        let selector = if settings.mode == Mode::Auto && !settings.all_files() {
            export_name(&settings.file)
        } else {
            settings.file.clone()
        };
        let files = select_files(&settings.path, &selector)?;
        info!("Selected {} export file(s) in {}", files.len(), settings.path.display());

        let sink: Arc<dyn BulkSink> = if settings.mode.delivers() {
            Arc::new(ElasticsearchSink::new(&settings.sink)?)
        } else {
            Arc::new(PrintSink)
        };
        info!("Delivering to {}", sink.describe());

        let orchestrator = Orchestrator::new(sink, PipelineOptions::from(&settings), cancel);
        let reports = orchestrator.run(files, settings.jobs, &mut stats).await;
        info!("Finished {} file(s)", reports.len());
    }

    println!("{}", stats.summary());
    Ok(())
}
