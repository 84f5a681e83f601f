pub mod plan;
pub mod report;
pub mod run;
pub mod validate;

use crate::output;

use std::path::Path;

use color_eyre::Result;

use conveyor_service::{DefinitionError, ServiceError, Workflow, WorkflowParser};

/// Read and validate a workflow file, printing definition errors and exiting on failure
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    if !path.exists() {
        color_eyre::eyre::bail!("Workflow file not found: {}", path.display());
    }

    let workflow = match WorkflowParser::from_file(path) {
        Ok(workflow) => workflow,
        Err(ServiceError::Definition(e)) => report_definition_error(&e),
        Err(e) => return Err(e.into()),
    };

    if let Err(e) = WorkflowParser::validate(&workflow) {
        report_definition_error(&e);
    }

    Ok(workflow)
}

fn report_definition_error(err: &DefinitionError) -> ! {
    match err {
        // Parse errors render their own "error:" prefix and source context
        DefinitionError::Parse(parse) => eprint!("{}", parse),
        other => output::error(&format!("[{}] {}", other.kind(), other)),
    }
    std::process::exit(1);
}
