use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use conveyor_service::{JobStatus, RunReport};

/// Summarize a saved run report
#[derive(Args, Debug)]
pub struct ReportArgs {
    /// Path to report.json or to its run directory
    pub report: PathBuf,

    /// Also print the captured output tail of every job
    #[arg(long)]
    pub output: bool,
}

pub fn execute(args: ReportArgs) -> Result<()> {
    if !args.report.exists() {
        color_eyre::eyre::bail!("Report not found: {}", args.report.display());
    }
    let report = RunReport::load(&args.report)?;

    output::header(&format!(
        "Run {} of '{}': {}",
        report.run_id, report.workflow, report.status
    ));
    output::dim(&format!(
        "  started {}, took {:.2}s{}",
        report.started_at.to_rfc3339(),
        report.duration().as_secs_f64(),
        if report.cancelled { ", cancelled" } else { "" }
    ));
    println!();

    for job in &report.jobs {
        let duration = job
            .duration()
            .map(|d| format!(" ({:.2}s)", d.as_secs_f64()))
            .unwrap_or_default();
        let reason = job
            .failure
            .as_ref()
            .map(|f| format!(": {}", f))
            .unwrap_or_default();
        let attempts = if job.attempts > 1 {
            format!(" after {} attempts", job.attempts)
        } else {
            String::new()
        };
        let line = format!("{} {}{}{}{}", job.job_id, job.status, attempts, duration, reason);

        match job.status {
            JobStatus::Succeeded => output::check(&line),
            JobStatus::Failed => output::failure(&line),
            _ => output::warning(&line),
        }

        if args.output || job.status == JobStatus::Failed {
            for tail in &job.output_tail {
                output::dim(&format!("        | {}", tail));
            }
        }
        if let Some(path) = &job.log_path {
            output::dim(&format!("        log: {}", path.display()));
        }
    }

    if !report.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for artifact in &report.artifacts {
            println!(
                "  {}.{} = {}",
                artifact.producer, artifact.key, artifact.value
            );
        }
    }

    println!();
    output::info(&format!(
        "{} succeeded, {} failed, {} skipped",
        report.count(JobStatus::Succeeded),
        report.count(JobStatus::Failed),
        report.count(JobStatus::Skipped)
    ));

    Ok(())
}
