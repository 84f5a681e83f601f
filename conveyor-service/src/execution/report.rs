// Run Results
// Per-job status records and the persisted per-run report

use crate::artifacts::Artifact;
use crate::error::{ServiceError, ServiceResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// File name of the report inside a run directory
pub const REPORT_FILE: &str = "report.json";

/// Job status.
///
/// `pending -> running -> {succeeded, failed}` or `pending -> skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Skipped)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a job failed or was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A command exited non-zero (or was killed by a signal)
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
    },
    /// A declared secret could not be resolved; no command ran
    SecretNotFound { name: String },
    /// A secret source failed while resolving the job's secrets
    SecretUnavailable { message: String },
    /// The job exceeded its time limit
    Timeout { limit_seconds: u64 },
    /// The workflow was cancelled
    Cancelled,
    /// The command could not be started
    SpawnFailed { message: String },
    /// An interpolated artifact could not be read
    ArtifactUnavailable { message: String },
    /// An upstream job did not succeed
    DependencyFailed { dependency: String },
}

impl FailureReason {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::CommandFailed { .. } | FailureReason::SpawnFailed { .. }
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CommandFailed {
                command,
                exit_code: Some(code),
            } => write!(f, "command '{}' exited with code {}", command, code),
            FailureReason::CommandFailed {
                command,
                exit_code: None,
            } => write!(f, "command '{}' was terminated by a signal", command),
            FailureReason::SecretNotFound { name } => write!(f, "secret '{}' not found", name),
            FailureReason::SecretUnavailable { message } => {
                write!(f, "secrets unavailable: {}", message)
            }
            FailureReason::Timeout { limit_seconds } => {
                write!(f, "timed out after {}s", limit_seconds)
            }
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::SpawnFailed { message } => write!(f, "failed to start: {}", message),
            FailureReason::ArtifactUnavailable { message } => {
                write!(f, "artifact unavailable: {}", message)
            }
            FailureReason::DependencyFailed { dependency } => {
                write!(f, "dependency '{}' did not succeed", dependency)
            }
        }
    }
}

/// One entry in a job's status history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}

/// Final record for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub job_id: String,
    pub status: JobStatus,
    /// Every status the job went through, starting with `pending`
    pub history: Vec<StatusChange>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Attempts made (0 for skipped jobs)
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    /// Full (redacted) output of the job
    pub log_path: Option<PathBuf>,
    /// Last lines of output, kept for the report
    #[serde(default)]
    pub output_tail: Vec<String>,
}

impl RunResult {
    pub fn pending(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            history: vec![StatusChange {
                status: JobStatus::Pending,
                at: Utc::now(),
            }],
            started_at: None,
            finished_at: None,
            attempts: 0,
            exit_code: None,
            failure: None,
            log_path: None,
            output_tail: Vec::new(),
        }
    }

    /// Move to `next`, recording timestamps. Illegal transitions are rejected.
    pub fn transition(&mut self, next: JobStatus) -> ServiceResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ServiceError::InvalidInput(format!(
                "job '{}' cannot move from {} to {}",
                self.job_id, self.status, next
            )));
        }

        let now = Utc::now();
        match next {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.history.push(StatusChange {
            status: next,
            at: now,
        });
        Ok(())
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.history.iter().map(|change| change.status).collect()
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Overall workflow result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Succeeded => f.write_str("succeeded"),
            WorkflowStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Per-run report: every job's final status plus the published artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: WorkflowStatus,
    /// Whether the run was cancelled before it finished
    #[serde(default)]
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Jobs in declaration order
    pub jobs: Vec<RunResult>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }

    /// Process exit status for the run
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn job(&self, id: &str) -> Option<&RunResult> {
        self.jobs.iter().find(|job| job.job_id == id)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|job| job.status == status).count()
    }

    /// Write `<dir>/<run_id>/report.json` and return its path
    pub fn save(&self, dir: &Path) -> ServiceResult<PathBuf> {
        let run_dir = run_dir(dir, &self.run_id);
        fs::create_dir_all(&run_dir)?;
        let path = run_dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        tracing::debug!(path = %path.display(), "run report saved");
        Ok(path)
    }

    /// Read a report written by [`RunReport::save`]. Accepts either the file or its run directory.
    pub fn load(path: &Path) -> ServiceResult<Self> {
        let path = if path.is_dir() {
            path.join(REPORT_FILE)
        } else {
            path.to_path_buf()
        };
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Directory holding one run's report and logs
pub fn run_dir(base: &Path, run_id: &Uuid) -> PathBuf {
    base.join(run_id.to_string())
}

/// Default location for run reports: `<data-local-dir>/conveyor/runs`
pub fn default_report_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("conveyor").join("runs"))
}
