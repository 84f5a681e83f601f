// Service Error Types
// Error taxonomy for workflow definition, loading and reporting

use crate::workflow::error::ParseError;

use thiserror::Error;

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Top-level error returned by the service API
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The workflow definition is invalid; nothing was executed
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Fatal errors detected before a workflow starts
#[derive(Debug, Clone, Error)]
pub enum DefinitionError {
    /// Malformed document (YAML syntax, unknown or mistyped field)
    #[error("{0}")]
    Parse(ParseError),

    /// The `requires` edges form a cycle; `jobs` lists it in path order
    #[error("circular dependency detected: {}", format_cycle(.jobs))]
    CycleDetected { jobs: Vec<String> },

    #[error("job '{job}' requires unknown job '{missing}'")]
    UnknownDependency { job: String, missing: String },

    #[error("job '{job}' is declared more than once")]
    DuplicateJob { job: String },

    #[error("job '{job}': {message}")]
    InvalidJob { job: String, message: String },

    /// A command interpolates an artifact from a job outside its dependency chain
    #[error("job '{job}' references artifacts of '{producer}', which is not one of its dependencies")]
    InvalidArtifactReference { job: String, producer: String },
}

impl From<ParseError> for DefinitionError {
    fn from(err: ParseError) -> Self {
        DefinitionError::Parse(err)
    }
}

impl DefinitionError {
    /// Short machine-friendly label for the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DefinitionError::Parse(_) => "parse",
            DefinitionError::CycleDetected { .. } => "cycle",
            DefinitionError::UnknownDependency { .. } => "unknown-dependency",
            DefinitionError::DuplicateJob { .. } => "duplicate-job",
            DefinitionError::InvalidJob { .. } => "invalid-job",
            DefinitionError::InvalidArtifactReference { .. } => "invalid-artifact-reference",
        }
    }
}

fn format_cycle(jobs: &[String]) -> String {
    match jobs.first() {
        Some(first) => format!("{} -> {}", jobs.join(" -> "), first),
        None => String::new(),
    }
}
