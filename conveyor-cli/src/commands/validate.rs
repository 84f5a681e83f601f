use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use conveyor_service::{ExecutionGraph, RunnerRegistry};

/// Validate a workflow YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,

    /// Also check that the shells and container CLI the jobs need are installed
    #[arg(long)]
    pub check_tools: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::status("Validating", &format!("{}", args.workflow.display()));

    // Parsing, field checks and graph resolution; exits on the first definition error
    let workflow = super::load_workflow(&args.workflow)?;
    output::check("YAML syntax valid");

    let commands: usize = workflow.jobs.iter().map(|j| j.commands.len()).sum();
    let secrets: usize = workflow.jobs.iter().map(|j| j.secrets.len()).sum();
    output::check(&format!(
        "Structure: {} jobs, {} commands, {} secret references",
        workflow.jobs.len(),
        commands,
        secrets
    ));

    let graph = ExecutionGraph::resolve(&workflow)?;
    output::check(&format!(
        "Dependency graph resolved: {} parallel levels, no cycles",
        graph.parallel_levels().len()
    ));

    if args.check_tools {
        output::status("Checking", "required tools...");
        let missing = RunnerRegistry::new().check_graph(&graph);
        if !missing.is_empty() {
            for (job, err) in &missing {
                output::error(&format!("  - job '{}': {}", job, err));
            }
            std::process::exit(1);
        }
        output::check("Required tools available");
    }

    println!();
    output::success("Workflow is valid");

    Ok(())
}
