// Execution Engine Module
// Dependency resolution, job execution, scheduling and run reports

pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
pub mod output;
pub mod report;
pub mod scheduler;

// Re-export key types
pub use context::ExecutionContext;
pub use events::{progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressSender};
pub use executor::{JobExecutor, JobOutcome};
pub use graph::{ExecutionGraph, JobNode};
pub use report::{FailureReason, JobStatus, RunReport, RunResult, WorkflowStatus};
pub use scheduler::{SchedulerConfig, WorkflowScheduler};
