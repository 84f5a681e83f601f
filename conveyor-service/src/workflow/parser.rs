use crate::error::{DefinitionError, ServiceResult};
use crate::execution::graph::ExecutionGraph;
use crate::workflow::error::ParseError;
use crate::workflow::models::Workflow;

use std::fs;
use std::path::Path;

/// Upper bound on `retry.attempts`, to keep a typo from looping for hours
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Parser for workflow YAML documents.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow from a file path.
    ///
    /// When the document has no `name`, the file stem is used.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ServiceResult<Workflow> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut workflow = Self::parse(&content)?;
        if workflow.name.is_none() {
            workflow.name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(|stem| stem.to_string());
        }
        Ok(workflow)
    }

    /// Parse a workflow from a YAML string.
    pub fn parse(content: &str) -> Result<Workflow, DefinitionError> {
        serde_yaml::from_str(content)
            .map_err(|e| DefinitionError::Parse(ParseError::from_yaml_error(&e, content)))
    }

    /// Parse and validate a workflow from a YAML string.
    pub fn parse_and_validate(content: &str) -> Result<Workflow, DefinitionError> {
        let workflow = Self::parse(content)?;
        Self::validate(&workflow)?;
        Ok(workflow)
    }

    /// Validate a parsed workflow for semantic correctness.
    ///
    /// Field-level checks run first; the dependency graph (unknown jobs,
    /// cycles, artifact references) is checked last.
    pub fn validate(workflow: &Workflow) -> Result<(), DefinitionError> {
        for job in &workflow.jobs {
            if !is_valid_identifier(&job.id) {
                return Err(DefinitionError::InvalidJob {
                    job: job.id.clone(),
                    message: "job ids may only contain letters, digits, '-' and '_'"
                        .to_string(),
                });
            }

            if job.commands.is_empty() {
                return Err(DefinitionError::InvalidJob {
                    job: job.id.clone(),
                    message: "job has no commands".to_string(),
                });
            }

            for (idx, command) in job.commands.iter().enumerate() {
                if command.run.trim().is_empty() {
                    return Err(DefinitionError::InvalidJob {
                        job: job.id.clone(),
                        message: format!("command {} is empty", idx + 1),
                    });
                }
            }

            for name in job.secrets.iter().chain(job.env.keys()) {
                if !is_valid_env_name(name) {
                    return Err(DefinitionError::InvalidJob {
                        job: job.id.clone(),
                        message: format!("'{}' is not a valid environment variable name", name),
                    });
                }
            }

            if let Some(name) = job.secrets.iter().find(|s| job.env.contains_key(*s)) {
                return Err(DefinitionError::InvalidJob {
                    job: job.id.clone(),
                    message: format!("'{}' is declared both as a secret and in env", name),
                });
            }

            if job.timeout_seconds == Some(0) {
                return Err(DefinitionError::InvalidJob {
                    job: job.id.clone(),
                    message: "timeout_seconds must be greater than zero".to_string(),
                });
            }

            if let Some(retry) = &job.retry {
                if retry.attempts > MAX_RETRY_ATTEMPTS {
                    return Err(DefinitionError::InvalidJob {
                        job: job.id.clone(),
                        message: format!(
                            "retry.attempts may be at most {} (got {})",
                            MAX_RETRY_ATTEMPTS, retry.attempts
                        ),
                    });
                }
                if retry.delay_seconds == 0 {
                    return Err(DefinitionError::InvalidJob {
                        job: job.id.clone(),
                        message: "retry.delay_seconds must be greater than zero".to_string(),
                    });
                }
            }

            if let Some(image) = job.environment.image() {
                if image.trim().is_empty() {
                    return Err(DefinitionError::InvalidJob {
                        job: job.id.clone(),
                        message: "environment.image is empty".to_string(),
                    });
                }
            }
        }

        ExecutionGraph::resolve(workflow).map(|_| ())
    }
}

fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
