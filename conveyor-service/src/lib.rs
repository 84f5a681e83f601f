// Conveyor Service Library
// Workflow orchestration core: DAG resolution, job execution, artifacts and secrets

pub mod artifacts;
pub mod error;
pub mod execution;
pub mod runners;
pub mod secrets;
pub mod utils;
pub mod workflow;

// Re-export commonly used types
pub use error::{DefinitionError, ServiceError, ServiceResult};

// Re-export workflow types
pub use workflow::{Job, ParseError, Workflow, WorkflowParser};

// Re-export execution types
pub use execution::{
    ExecutionContext, ExecutionEvent, ExecutionGraph, FailureReason, JobExecutor, JobStatus,
    ProgressSender, RunReport, RunResult, SchedulerConfig, WorkflowScheduler, WorkflowStatus,
};

// Re-export artifact, runner and secret types
pub use artifacts::{Artifact, ArtifactError, ArtifactStore};
pub use runners::{CommandRunner, ContainerRunner, RunnerRegistry, ShellRunner};
pub use secrets::{
    EnvSecretSource, FileSecretSource, MemorySecretSource, SecretError, SecretSource,
    SecretValue, SecretsProvider,
};
