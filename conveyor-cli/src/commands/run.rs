use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use conveyor_service::execution::events::{progress_channel, LogLevel};
use conveyor_service::execution::report::default_report_dir;
use conveyor_service::utils::resolve_working_dir;
use conveyor_service::{
    EnvSecretSource, ExecutionEvent, ExecutionGraph, FileSecretSource, JobStatus, RunReport,
    RunnerRegistry, SchedulerConfig, SecretsProvider, WorkflowScheduler, WorkflowStatus,
};

/// Run a workflow locally
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Maximum jobs running at once (0 = unlimited; overrides the workflow)
    #[arg(long, short = 'j', value_name = "N", env = "CONVEYOR_MAX_PARALLEL")]
    pub max_parallel: Option<usize>,

    /// Base working directory for jobs (default: repository root or current directory)
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Where run reports and job logs are written
    #[arg(long, value_name = "DIR", env = "CONVEYOR_REPORT_DIR")]
    pub report_dir: Option<PathBuf>,

    /// Do not write a report or job logs
    #[arg(long)]
    pub no_report: bool,

    /// YAML or JSON file of secret values, consulted before the environment
    #[arg(long, value_name = "FILE", env = "CONVEYOR_SECRETS_FILE")]
    pub secrets_file: Option<PathBuf>,

    /// Prefix for secrets read from the environment (KUBE_TOKEN -> <PREFIX>KUBE_TOKEN)
    #[arg(long, value_name = "PREFIX", env = "CONVEYOR_SECRET_PREFIX", default_value = "")]
    pub secret_prefix: String,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    output::status("Parsing", &format!("{}", args.workflow.display()));
    let workflow = super::load_workflow(&args.workflow)?;
    let graph = ExecutionGraph::resolve(&workflow)?;

    let commands: usize = workflow.jobs.iter().map(|j| j.commands.len()).sum();
    output::info(&format!(
        "Workflow '{}': {} jobs, {} commands",
        graph.name,
        graph.len(),
        commands
    ));

    for (job, err) in RunnerRegistry::new().check_graph(&graph) {
        output::warning(&format!("Job '{}': {}", job, err));
    }

    let report_dir = if args.no_report {
        None
    } else {
        let dir = args.report_dir.clone().or_else(default_report_dir);
        if dir.is_none() {
            output::warning("No report directory available; the run report will not be saved");
        }
        dir
    };

    let mut config = SchedulerConfig::default()
        .with_working_dir(args.working_dir.clone().unwrap_or_else(resolve_working_dir));
    if let Some(limit) = args.max_parallel {
        config = config.with_max_parallel(limit);
    }
    if let Some(dir) = &report_dir {
        config = config.with_log_dir(dir);
    }

    let mut secrets = SecretsProvider::new();
    if let Some(path) = &args.secrets_file {
        let source = FileSecretSource::load(path)?;
        output::dim(&format!(
            "  Loaded {} secrets from {}",
            source.len(),
            path.display()
        ));
        secrets = secrets.with_source(source);
    }
    secrets = secrets.with_source(EnvSecretSource::new(args.secret_prefix.clone()));

    let (tx, rx) = progress_channel();
    let scheduler = WorkflowScheduler::new(graph)
        .with_config(config)
        .with_secrets(secrets)
        .with_progress(tx);

    let cancel = scheduler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted; cancelling running jobs");
            cancel.cancel();
        }
    });

    // Run in the background, render progress in the foreground
    let run_handle = tokio::spawn(scheduler.run());

    let mut events = UnboundedReceiverStream::new(rx);
    while let Some(event) = events.next().await {
        render_event(&event);
    }

    let report = run_handle.await?;

    print_failures(&report);

    if let Some(dir) = &report_dir {
        match report.save(dir) {
            Ok(path) => output::info(&format!("Report saved to {}", path.display())),
            Err(e) => output::warning(&format!("Failed to save report: {}", e)),
        }
    }

    if !report.succeeded() {
        std::process::exit(report.exit_code());
    }

    Ok(())
}

fn render_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted {
            workflow_name,
            run_id,
            total_jobs,
        } => {
            println!();
            output::header(&format!(
                "Workflow '{}' ({} jobs)",
                workflow_name, total_jobs
            ));
            output::dim(&format!("  run {}", run_id));
        }

        ExecutionEvent::WorkflowCompleted {
            status, duration, ..
        } => {
            println!();
            if *status == WorkflowStatus::Succeeded {
                output::success(&format!(
                    "Workflow completed successfully in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "Workflow failed after {:.2}s",
                    duration.as_secs_f64()
                ));
            }
        }

        ExecutionEvent::JobStarted {
            job_id,
            attempt,
            total_commands,
        } => {
            if *attempt > 1 {
                println!(
                    "    Job '{}' attempt {} ({} commands)",
                    job_id, attempt, total_commands
                );
            } else {
                println!("    Job '{}' ({} commands)", job_id, total_commands);
            }
        }

        ExecutionEvent::CommandStarted {
            job_id,
            index,
            label,
        } => {
            println!("      [{}] [Command {}] {}", job_id, index + 1, label);
        }

        ExecutionEvent::JobOutput {
            job_id,
            line,
            is_error,
        } => {
            if *is_error {
                output::job_error(job_id, line);
            } else {
                output::job_output(job_id, line);
            }
        }

        ExecutionEvent::CommandCompleted {
            job_id,
            index,
            exit_code,
            duration,
        } => match exit_code {
            Some(0) => output::dim_success(&format!(
                "      [{}] [Command {}] OK ({:.2}s)",
                job_id,
                index + 1,
                duration.as_secs_f64()
            )),
            Some(code) => output::dim_failure(&format!(
                "      [{}] [Command {}] FAIL ({:.2}s, exit code: {})",
                job_id,
                index + 1,
                duration.as_secs_f64(),
                code
            )),
            None => output::dim_failure(&format!(
                "      [{}] [Command {}] KILLED ({:.2}s)",
                job_id,
                index + 1,
                duration.as_secs_f64()
            )),
        },

        ExecutionEvent::JobRetrying {
            job_id,
            next_attempt,
            delay,
            reason,
        } => {
            output::warning(&format!(
                "    Job '{}' {}; retrying in {}s (attempt {})",
                job_id,
                reason,
                delay.as_secs(),
                next_attempt
            ));
        }

        ExecutionEvent::JobCompleted {
            job_id,
            status,
            duration,
            failure,
        } => {
            if *status == JobStatus::Succeeded {
                output::dim_success(&format!(
                    "    Job '{}' OK ({:.2}s)",
                    job_id,
                    duration.as_secs_f64()
                ));
            } else {
                let reason = failure
                    .as_ref()
                    .map(|f| format!(": {}", f))
                    .unwrap_or_default();
                output::dim_failure(&format!(
                    "    Job '{}' FAIL ({:.2}s){}",
                    job_id,
                    duration.as_secs_f64(),
                    reason
                ));
            }
        }

        ExecutionEvent::JobSkipped { job_id, reason } => {
            output::warning(&format!("    Job '{}' skipped: {}", job_id, reason));
        }

        ExecutionEvent::ArtifactPublished { job_id, key } => {
            output::dim(&format!("      [artifact] {}.{}", job_id, key));
        }

        ExecutionEvent::Log {
            level,
            message,
            job_id,
        } => {
            let message = match job_id {
                Some(job_id) => format!("    [{}] {}", job_id, message),
                None => format!("    {}", message),
            };
            match level {
                LogLevel::Error => output::error(&message),
                LogLevel::Warning => output::warning(&message),
                LogLevel::Info => output::info(&message),
            }
        }
    }
}

/// Show the output tail of every failed job so the cause is visible without opening logs
fn print_failures(report: &RunReport) {
    for job in report.jobs.iter().filter(|j| j.status == JobStatus::Failed) {
        println!();
        output::failure(&format!(
            "Job '{}' failed{}",
            job.job_id,
            job.failure
                .as_ref()
                .map(|f| format!(": {}", f))
                .unwrap_or_default()
        ));
        for line in &job.output_tail {
            output::dim(&format!("        | {}", line));
        }
        if let Some(path) = &job.log_path {
            output::dim(&format!("        full log: {}", path.display()));
        }
    }
}
