// Execution Events
// Progress reporting for workflow runs

use crate::execution::report::{FailureReason, JobStatus, WorkflowStatus};

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a workflow run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    WorkflowStarted {
        workflow_name: String,
        run_id: Uuid,
        total_jobs: usize,
    },

    WorkflowCompleted {
        workflow_name: String,
        status: WorkflowStatus,
        duration: Duration,
    },

    /// A job attempt started (attempts are 1-based)
    JobStarted {
        job_id: String,
        attempt: u32,
        total_commands: usize,
    },

    /// One line of (redacted) command output
    JobOutput {
        job_id: String,
        line: String,
        is_error: bool,
    },

    CommandStarted {
        job_id: String,
        index: usize,
        label: String,
    },

    CommandCompleted {
        job_id: String,
        index: usize,
        exit_code: Option<i32>,
        duration: Duration,
    },

    /// A failed attempt will be retried after `delay`
    JobRetrying {
        job_id: String,
        next_attempt: u32,
        delay: Duration,
        reason: FailureReason,
    },

    JobCompleted {
        job_id: String,
        status: JobStatus,
        duration: Duration,
        failure: Option<FailureReason>,
    },

    /// The job never ran
    JobSkipped {
        job_id: String,
        reason: FailureReason,
    },

    ArtifactPublished {
        job_id: String,
        key: String,
    },

    Log {
        level: LogLevel,
        message: String,
        job_id: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    pub fn workflow_started(name: impl Into<String>, run_id: Uuid, total_jobs: usize) -> Self {
        Self::WorkflowStarted {
            workflow_name: name.into(),
            run_id,
            total_jobs,
        }
    }

    pub fn workflow_completed(
        name: impl Into<String>,
        status: WorkflowStatus,
        duration: Duration,
    ) -> Self {
        Self::WorkflowCompleted {
            workflow_name: name.into(),
            status,
            duration,
        }
    }

    pub fn job_started(job_id: impl Into<String>, attempt: u32, total_commands: usize) -> Self {
        Self::JobStarted {
            job_id: job_id.into(),
            attempt,
            total_commands,
        }
    }

    pub fn job_output(job_id: impl Into<String>, line: impl Into<String>, is_error: bool) -> Self {
        Self::JobOutput {
            job_id: job_id.into(),
            line: line.into(),
            is_error,
        }
    }

    pub fn job_completed(
        job_id: impl Into<String>,
        status: JobStatus,
        duration: Duration,
        failure: Option<FailureReason>,
    ) -> Self {
        Self::JobCompleted {
            job_id: job_id.into(),
            status,
            duration,
            failure,
        }
    }

    pub fn job_skipped(job_id: impl Into<String>, reason: FailureReason) -> Self {
        Self::JobSkipped {
            job_id: job_id.into(),
            reason,
        }
    }

    pub fn info(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_id,
        }
    }

    pub fn warning(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_id,
        }
    }

    pub fn error(message: impl Into<String>, job_id: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            job_id,
        }
    }

    /// Job the event belongs to, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::WorkflowStarted { .. } | Self::WorkflowCompleted { .. } => None,
            Self::JobStarted { job_id, .. }
            | Self::JobOutput { job_id, .. }
            | Self::CommandStarted { job_id, .. }
            | Self::CommandCompleted { job_id, .. }
            | Self::JobRetrying { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobSkipped { job_id, .. }
            | Self::ArtifactPublished { job_id, .. } => Some(job_id),
            Self::Log { job_id, .. } => job_id.as_deref(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
