use anyhow::{Context, Result};
use chrono::Utc;
use common::JobRun;
use jobmon_spool::SpoolManager;
use std::process::Stdio;
use std::sync::Arc;

/// Only the end of each captured stream is kept.
pub const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Another run of the job was in progress; the command was not started.
    Skipped { uniq_id: String },
    Finished { uniq_id: String, exit_code: Option<i32> },
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Skipped { .. } => 1,
            Outcome::Finished { exit_code, .. } => exit_code.unwrap_or(1),
        }
    }
}

/// Registers the run, executes the command and records its result.
pub async fn run_job(
    spool: Arc<SpoolManager>,
    job_id: String,
    forced: bool,
    command: String,
    args: Vec<String>,
) -> Result<Outcome> {
    let mut run = JobRun::start(job_id);
    run.set_result("Command", command_line(&command, &args));

    let create = spool.clone();
    let (mut run, created) = tokio::task::spawn_blocking(move || {
        let created = create.new_job(&mut run, forced);
        (run, created)
    })
    .await?;

    let uniq_id = match created {
        Ok(uniq_id) => uniq_id,
        Err(e) if e.is_already_running() => {
            log::warn!("{}", e);
            return Ok(Outcome::Skipped {
                uniq_id: e.uniq_id().unwrap_or_default().to_string(),
            });
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to register job {}", run.id)),
    };
    log::info!("Job {} registered as {}", run.id, uniq_id);

    let exit_code = execute(&mut run, &command, &args).await;
    run.set_result("EndedAt", Utc::now().timestamp());

    let finish_id = uniq_id.clone();
    tokio::task::spawn_blocking(move || spool.finish_job(&finish_id, &run))
        .await?
        .with_context(|| format!("Failed to finish job run {}", uniq_id))?;

    Ok(Outcome::Finished { uniq_id, exit_code })
}

async fn execute(run: &mut JobRun, command: &str, args: &[String]) -> Option<i32> {
    let output = tokio::process::Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => {
            let code = output.status.code();
            run.set_result("ExitCode", code);
            run.set_result("StdOut", tail(&output.stdout));
            run.set_result("StdErr", tail(&output.stderr));
            if !output.status.success() {
                run.add_error(format!("command {}", output.status));
            }
            code
        }
        Err(e) => {
            log::error!("Failed to spawn {}: {}", command, e);
            run.add_error(format!("failed to spawn {}: {}", command, e));
            None
        }
    }
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

fn command_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
