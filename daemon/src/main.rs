mod metrics;
mod uploader;

use anyhow::Context;
use clap::Parser;
use common::Config;
use jobmon_spool::SpoolManager;
use metrics::UploadMetrics;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use uploader::{ResultSink, Uploader};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (.yaml, .yml or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Log level, overrides the level in the config file
    #[arg(short = 'v', long)]
    log_level: Option<String>,
    /// Flush the spool once and exit
    #[arg(short = 'r', long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_or_default(std::path::Path::new(common::DEFAULT_CONFIG_PATH))?,
    };
    setup_logging(&config, args.log_level.as_deref())?;
    log::info!("Starting jobmon-daemon, spool {:?}", config.spool.dir);

    let spool = Arc::new(SpoolManager::from_config(&config.spool));
    let sink = ResultSink::open(config.upload.output.as_deref()).with_context(|| {
        format!("Failed to open results output {:?}", config.upload.output)
    })?;
    let metrics = UploadMetrics::new();
    let mut uploader = Uploader::new(spool, sink, metrics.clone());

    if args.once {
        flush(uploader, &metrics, &config).await?;
        return Ok(());
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut interval = tokio::time::interval(Duration::from_secs(config.upload.interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                uploader = flush(uploader, &metrics, &config).await?;
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
        }
    }

    log::info!("Shutting down jobmon-daemon");
    Ok(())
}

/// Runs one cycle off the async runtime, since lock acquisition sleeps.
async fn flush(mut uploader: Uploader, metrics: &UploadMetrics, config: &Config) -> anyhow::Result<Uploader> {
    let (uploader, result) = tokio::task::spawn_blocking(move || {
        let result = uploader.flush();
        (uploader, result)
    })
    .await?;

    match result {
        Ok(report) if report.pending > 0 => {
            log::debug!("Flushed {} of {} finished jobs", report.delivered, report.pending)
        }
        Ok(_) => {}
        Err(e) => log::error!("Spool flush failed: {:#}", e),
    }

    if let Some(path) = &config.upload.metrics_file {
        if let Err(e) = std::fs::write(path, metrics.export()) {
            log::error!("Failed to write metrics to {:?}: {}", path, e);
        }
    }
    Ok(uploader)
}

fn setup_logging(config: &Config, level_override: Option<&str>) -> anyhow::Result<()> {
    let level_name = level_override.unwrap_or(&config.logging.level);
    let level: log::LevelFilter = level_name
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid log level: {}", level_name))?;

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);

    // Keep stdout clean when it doubles as the results sink
    dispatch = match config.upload.output {
        Some(_) => dispatch.chain(std::io::stdout()),
        None => dispatch.chain(std::io::stderr()),
    };

    if let Some(path) = &config.logging.output {
        dispatch = dispatch.chain(
            fern::log_file(path).with_context(|| format!("Failed to open log file {:?}", path))?,
        );
    }

    dispatch.apply()?;
    Ok(())
}
