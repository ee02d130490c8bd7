mod runner;

use anyhow::Context;
use clap::{Parser, Subcommand};
use comfy_table::Table;
use common::Config;
use jobmon_spool::SpoolManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path (.yaml, .yml or .toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Spool directory, overrides the config file
    #[arg(long, global = true)]
    spool_dir: Option<PathBuf>,
    /// More output (repeat for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command as a monitored job
    Run {
        /// Job ID, stable across runs of the same job
        #[arg(long)]
        id: String,
        /// Remove running entries of this job instead of reporting a duplicate
        #[arg(short, long)]
        force: bool,
        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// List finished runs waiting for upload
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show running entries of a job
    Running {
        id: String,
    },
    /// Remove spooled runs
    Remove {
        #[arg(required = true)]
        uniq_ids: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load_or_default(Path::new(common::DEFAULT_CONFIG_PATH))?,
    };
    if let Some(dir) = cli.spool_dir {
        config.spool.dir = dir;
    }
    let spool = Arc::new(SpoolManager::from_config(&config.spool));

    match cli.command {
        Commands::Run { id, force, mut command } => {
            let program = command.remove(0);
            let outcome = runner::run_job(spool, id, force, program, command).await?;
            match &outcome {
                runner::Outcome::Skipped { uniq_id } => {
                    eprintln!("Job is already running, recorded as {}", uniq_id)
                }
                runner::Outcome::Finished { uniq_id, .. } => log::info!("Finished {}", uniq_id),
            }
            std::process::exit(outcome.exit_code());
        }
        Commands::List { json } => {
            let entries = spool.finished_jobs().context("Failed to list finished jobs")?;
            if json {
                let docs: Vec<_> = entries
                    .iter()
                    .map(|e| serde_json::json!({ "uniq_id": e.uniq_id, "run": e.run }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&docs)?);
            } else {
                let mut table = Table::new();
                table.set_header(vec!["Uniq ID", "Job ID", "Started At", "Errors"]);
                for entry in &entries {
                    table.add_row(vec![
                        entry.uniq_id.clone(),
                        entry.run.id.clone(),
                        entry.run.started_at.to_rfc3339(),
                        entry.run.errors().join("; "),
                    ]);
                }
                println!("{}", table);
            }
        }
        Commands::Running { id } => {
            for uniq_id in spool.running_jobs(&id)? {
                println!("{}", uniq_id);
            }
        }
        Commands::Remove { uniq_ids } => {
            spool.remove_jobs(&uniq_ids)?;
            println!("Removed {} entries", uniq_ids.len());
        }
    }

    Ok(())
}

fn setup_logging(verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}
