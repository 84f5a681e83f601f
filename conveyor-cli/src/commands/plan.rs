use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use conveyor_service::ExecutionGraph;

/// Show the order a workflow would run in
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the workflow YAML file
    pub workflow: PathBuf,
}

pub fn execute(args: PlanArgs) -> Result<()> {
    let workflow = super::load_workflow(&args.workflow)?;
    let graph = ExecutionGraph::resolve(&workflow)?;

    output::header(&format!("Workflow '{}' ({} jobs)", graph.name, graph.len()));
    match graph.max_parallel {
        Some(limit) if limit > 0 => output::dim(&format!("  max_parallel: {}", limit)),
        _ => output::dim("  max_parallel: unlimited"),
    }

    println!();
    println!("Execution order:");
    for (position, node) in graph.topological_order().into_iter().enumerate() {
        let job = &node.job;
        let runs_on = match job.environment.image() {
            Some(image) => format!("container {}", image),
            None => format!("host {}", job.environment.shell()),
        };
        let requires = job.requires();
        let requires = if requires.is_empty() {
            String::new()
        } else {
            format!(" <- {}", requires.join(", "))
        };
        println!(
            "  {:>3}. {}{} [{}, {} commands]",
            position + 1,
            node.id(),
            requires,
            runs_on,
            job.commands.len()
        );
    }

    println!();
    println!("Parallel levels:");
    for (level, nodes) in graph.parallel_levels().iter().enumerate() {
        let ids: Vec<&str> = nodes.iter().map(|n| n.id()).collect();
        println!("  {:>3}: {}", level + 1, ids.join(", "));
    }

    Ok(())
}
