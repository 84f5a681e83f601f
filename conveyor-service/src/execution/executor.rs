// Job Executor
// Runs one job's command sequence with retries, a job-wide timeout and cancellation

use crate::artifacts::{interpolate, references, ArtifactStore};
use crate::execution::context::ExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::output::OutputCapture;
use crate::execution::report::{FailureReason, JobStatus};
use crate::runners::{output_channel, CommandRequest, CommandRunner, RunnerRegistry};
use crate::workflow::models::Job;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Retry delays never exceed this unless configured otherwise
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Output lines kept in memory for the report
pub const DEFAULT_TAIL_LINES: usize = 50;

/// What happened to one job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// `Succeeded` or `Failed`
    pub status: JobStatus,
    pub attempts: u32,
    /// Exit code of the last command that ran
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub log_path: Option<PathBuf>,
    pub output_tail: Vec<String>,
    pub duration: Duration,
    /// Artifact keys committed to the store
    pub published: Vec<String>,
}

impl JobOutcome {
    /// A job that failed before its first command, e.g. on a missing secret
    pub fn not_started(failure: FailureReason) -> Self {
        Self {
            status: JobStatus::Failed,
            attempts: 0,
            exit_code: None,
            failure: Some(failure),
            log_path: None,
            output_tail: Vec::new(),
            duration: Duration::ZERO,
            published: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// Result of the attempt loop
struct Attempts {
    count: u32,
    exit_code: Option<i32>,
    failure: Option<FailureReason>,
}

type AttemptFailure = (FailureReason, Option<i32>);

/// Runs a single job in its execution context
pub struct JobExecutor {
    runners: Arc<RunnerRegistry>,
    artifacts: Arc<ArtifactStore>,
    progress: Option<ProgressSender>,
    tail_lines: usize,
    max_retry_delay: Duration,
}

impl JobExecutor {
    pub fn new(runners: Arc<RunnerRegistry>, artifacts: Arc<ArtifactStore>) -> Self {
        Self {
            runners,
            artifacts,
            progress: None,
            tail_lines: DEFAULT_TAIL_LINES,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressSender>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    /// Execute `job` to completion.
    ///
    /// Commands run in order and the first failure ends the attempt. Failed
    /// attempts are retried per the job's retry policy. The context is
    /// released before this returns, whatever the outcome.
    pub async fn execute(
        &self,
        job: &Job,
        mut context: ExecutionContext,
        log_path: Option<PathBuf>,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let start = Instant::now();
        let mut capture = self.open_capture(job, log_path).await;
        let job_token = cancel.child_token();

        let mut attempts = {
            let run = self.run_attempts(job, &context, &mut capture, &job_token);
            tokio::pin!(run);

            match job.timeout() {
                Some(limit) => match tokio::time::timeout(limit, &mut run).await {
                    Ok(attempts) => attempts,
                    Err(_) => {
                        tracing::warn!(job = %job.id, ?limit, "job timed out");
                        job_token.cancel();
                        let mut attempts = run.await;
                        attempts.failure = Some(FailureReason::Timeout {
                            limit_seconds: limit.as_secs(),
                        });
                        attempts
                    }
                },
                None => run.await,
            }
        };
        context.release();

        let mut published = Vec::new();
        if attempts.failure.is_none() {
            for (key, value) in capture.take_staged() {
                match self.artifacts.publish(&job.id, &key, value).await {
                    Ok(_) => {
                        tracing::info!(job = %job.id, key = %key, "artifact committed");
                        self.progress.send_event(ExecutionEvent::ArtifactPublished {
                            job_id: job.id.clone(),
                            key: key.clone(),
                        });
                        published.push(key);
                    }
                    Err(e) => {
                        tracing::warn!(job = %job.id, error = %e, "artifact not committed");
                        self.warn(&job.id, format!("artifact '{}' not committed: {}", key, e));
                    }
                }
            }
        } else {
            capture.discard_staged();
        }

        if let Some(reason) = &attempts.failure {
            let _ = capture.note(&format!("job failed: {}", reason)).await;
        }

        let (log_path, output_tail) = match capture.finish().await {
            Ok(finished) => finished,
            Err(e) => {
                tracing::warn!(job = %job.id, error = %e, "failed to flush job log");
                self.warn(&job.id, format!("failed to flush job log: {}", e));
                (None, Vec::new())
            }
        };

        let status = if attempts.failure.is_none() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        tracing::info!(job = %job.id, %status, attempts = attempts.count, "job finished");

        JobOutcome {
            status,
            attempts: attempts.count,
            exit_code: attempts.exit_code,
            failure: attempts.failure.take(),
            log_path,
            output_tail,
            duration: start.elapsed(),
            published,
        }
    }

    async fn open_capture(&self, job: &Job, log_path: Option<PathBuf>) -> OutputCapture {
        if log_path.is_some() {
            match OutputCapture::open(&job.id, log_path, self.tail_lines, self.progress.clone())
                .await
            {
                Ok(capture) => return capture,
                Err(e) => {
                    tracing::warn!(job = %job.id, error = %e, "cannot open job log; keeping output in memory");
                    self.warn(
                        &job.id,
                        format!("cannot open job log ({}); keeping output in memory", e),
                    );
                }
            }
        }
        OutputCapture::in_memory(&job.id, self.tail_lines, self.progress.clone())
    }

    async fn run_attempts(
        &self,
        job: &Job,
        context: &ExecutionContext,
        capture: &mut OutputCapture,
        token: &CancellationToken,
    ) -> Attempts {
        let max_attempts = job.max_attempts();
        let runner = self.runners.for_environment(&job.environment);
        let mut attempt = 0;

        loop {
            attempt += 1;
            capture.discard_staged();
            self.progress.send_event(ExecutionEvent::job_started(
                &job.id,
                attempt,
                job.commands.len(),
            ));
            let _ = capture
                .note(&format!("attempt {}/{}", attempt, max_attempts))
                .await;

            let (reason, exit_code) = match self
                .run_commands(job, context, capture, runner.as_ref(), attempt, token)
                .await
            {
                Ok(()) => {
                    return Attempts {
                        count: attempt,
                        exit_code: Some(0),
                        failure: None,
                    }
                }
                Err(failure) => failure,
            };

            if token.is_cancelled() || !reason.is_retryable() || attempt >= max_attempts {
                return Attempts {
                    count: attempt,
                    exit_code,
                    failure: Some(reason),
                };
            }

            let delay = job
                .retry
                .as_ref()
                .map(|policy| policy.delay_for(attempt, self.max_retry_delay))
                .unwrap_or_default();
            tracing::info!(job = %job.id, attempt, ?delay, reason = %reason, "retrying job");
            let _ = capture
                .note(&format!("attempt {} failed: {}", attempt, reason))
                .await;
            self.progress.send_event(ExecutionEvent::JobRetrying {
                job_id: job.id.clone(),
                next_attempt: attempt + 1,
                delay,
                reason,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {
                    return Attempts {
                        count: attempt,
                        exit_code,
                        failure: Some(FailureReason::Cancelled),
                    };
                }
            }
        }
    }

    async fn run_commands(
        &self,
        job: &Job,
        context: &ExecutionContext,
        capture: &mut OutputCapture,
        runner: &dyn CommandRunner,
        attempt: u32,
        token: &CancellationToken,
    ) -> Result<(), AttemptFailure> {
        for (index, command) in job.commands.iter().enumerate() {
            if token.is_cancelled() {
                return Err((FailureReason::Cancelled, None));
            }

            let text = self
                .interpolate(&job.id, &command.run)
                .await
                .map_err(|message| (FailureReason::ArtifactUnavailable { message }, None))?;

            self.progress.send_event(ExecutionEvent::CommandStarted {
                job_id: job.id.clone(),
                index,
                label: command.label().to_string(),
            });

            let request = CommandRequest {
                job_id: &job.id,
                attempt,
                index,
                command: &text,
                environment: &job.environment,
                context,
            };

            let (tx, mut rx) = output_channel();
            let run = async move {
                let result = runner.run(request, &tx, token).await;
                drop(tx);
                result
            };
            let drain = async {
                let mut log_failed = false;
                while let Some(line) = rx.recv().await {
                    let redacted = context.redact(&line.text);
                    if let Err(e) = capture.record(&redacted, line.is_error).await {
                        if !log_failed {
                            tracing::warn!(job = %job.id, error = %e, "failed to write job log");
                            self.warn(&job.id, format!("failed to write job log: {}", e));
                            log_failed = true;
                        }
                    }
                }
            };
            let (result, ()) = tokio::join!(run, drain);

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = context.redact(&e.to_string());
                    tracing::warn!(job = %job.id, index, error = %message, "command could not run");
                    return Err((FailureReason::SpawnFailed { message }, None));
                }
            };

            if outcome.cancelled {
                return Err((FailureReason::Cancelled, None));
            }

            self.progress.send_event(ExecutionEvent::CommandCompleted {
                job_id: job.id.clone(),
                index,
                exit_code: outcome.exit_code,
                duration: outcome.duration,
            });

            if !outcome.success() {
                return Err((
                    FailureReason::CommandFailed {
                        command: command.label().to_string(),
                        exit_code: outcome.exit_code,
                    },
                    outcome.exit_code,
                ));
            }
        }

        Ok(())
    }

    fn warn(&self, job_id: &str, message: String) {
        self.progress
            .send_event(ExecutionEvent::warning(message, Some(job_id.to_string())));
    }

    /// Substitute `${{ artifacts.<job>.<key> }}` placeholders for `reader`
    async fn interpolate(&self, reader: &str, text: &str) -> Result<String, String> {
        let refs = references(text)?;
        if refs.is_empty() {
            return Ok(text.to_string());
        }

        let mut values = HashMap::with_capacity(refs.len());
        for reference in refs {
            let value = self
                .artifacts
                .resolve(reader, &reference.producer, &reference.key)
                .await
                .map_err(|e| e.to_string())?;
            values.insert(reference, value);
        }

        interpolate(text, |reference| {
            values
                .get(reference)
                .cloned()
                .ok_or_else(|| format!("unresolved reference '{}'", reference))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;
    use crate::execution::graph::ExecutionGraph;
    use crate::secrets::SecretValue;
    use crate::workflow::models::{RetryPolicy, Workflow};
    use uuid::Uuid;

    struct Fixture {
        executor: JobExecutor,
        artifacts: Arc<ArtifactStore>,
        dir: tempfile::TempDir,
    }

    fn fixture(jobs: Vec<Job>) -> Fixture {
        let workflow = Workflow {
            jobs,
            ..Default::default()
        };
        let graph = Arc::new(ExecutionGraph::resolve(&workflow).unwrap());
        let artifacts = Arc::new(ArtifactStore::new(graph));
        let executor = JobExecutor::new(Arc::new(RunnerRegistry::new()), artifacts.clone())
            .with_max_retry_delay(Duration::from_millis(20));
        Fixture {
            executor,
            artifacts,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn context(fixture: &Fixture, job: &str) -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), "test", job, fixture.dir.path().to_path_buf())
            .with_host_env(&["PATH"])
    }

    #[tokio::test]
    async fn test_commands_run_in_order_and_stop_on_failure() {
        let job = Job::new(
            "build",
            &["echo one >> trace", "exit 4", "echo three >> trace"],
        );
        let f = fixture(vec![job.clone()]);

        let outcome = f
            .executor
            .execute(&job, context(&f, "build"), None, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.exit_code, Some(4));
        assert_eq!(
            outcome.failure,
            Some(FailureReason::CommandFailed {
                command: "exit 4".to_string(),
                exit_code: Some(4)
            })
        );
        let trace = std::fs::read_to_string(f.dir.path().join("trace")).unwrap();
        assert_eq!(trace, "one\n");
    }

    #[tokio::test]
    async fn test_success_commits_published_artifacts() {
        let job = Job::new(
            "build",
            &["echo '##conveyor[publish key=image]gcr.io/demo/iris:42'"],
        );
        let deploy = Job::new("deploy", &["true"]).requiring(&["build"]);
        let f = fixture(vec![job.clone(), deploy]);

        let outcome = f
            .executor
            .execute(&job, context(&f, "build"), None, &CancellationToken::new())
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.published, vec!["image"]);
        assert_eq!(
            f.artifacts.resolve("deploy", "build", "image").await.unwrap(),
            "gcr.io/demo/iris:42"
        );
    }

    #[tokio::test]
    async fn test_failed_job_publishes_nothing() {
        let job = Job::new(
            "build",
            &["echo '##conveyor[publish key=image]partial'", "false"],
        );
        let f = fixture(vec![job.clone()]);

        let outcome = f
            .executor
            .execute(&job, context(&f, "build"), None, &CancellationToken::new())
            .await;

        assert!(!outcome.succeeded());
        assert!(f.artifacts.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_interpolates_upstream_artifact() {
        let build = Job::new("build", &["true"]);
        let deploy = Job::new(
            "deploy",
            &["echo deploying ${{ artifacts.build.image }} > deployed"],
        )
        .requiring(&["build"]);
        let f = fixture(vec![build, deploy.clone()]);
        f.artifacts.publish("build", "image", "iris:7").await.unwrap();

        let outcome = f
            .executor
            .execute(&deploy, context(&f, "deploy"), None, &CancellationToken::new())
            .await;

        assert!(outcome.succeeded());
        let deployed = std::fs::read_to_string(f.dir.path().join("deployed")).unwrap();
        assert_eq!(deployed.trim(), "deploying iris:7");
    }

    #[tokio::test]
    async fn test_missing_upstream_artifact_fails_job() {
        let build = Job::new("build", &["true"]);
        let deploy =
            Job::new("deploy", &["echo ${{ artifacts.build.image }}"]).requiring(&["build"]);
        let f = fixture(vec![build, deploy.clone()]);

        let outcome = f
            .executor
            .execute(&deploy, context(&f, "deploy"), None, &CancellationToken::new())
            .await;

        assert!(matches!(
            outcome.failure,
            Some(FailureReason::ArtifactUnavailable { .. })
        ));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        // Fails on the first two attempts, succeeds on the third
        let mut job = Job::new(
            "flaky",
            &["echo x >> attempts; test $(wc -l < attempts) -ge 3"],
        );
        job.retry = Some(RetryPolicy {
            attempts: 3,
            delay_seconds: 1,
        });
        let f = fixture(vec![job.clone()]);

        let outcome = f
            .executor
            .execute(&job, context(&f, "flaky"), None, &CancellationToken::new())
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut job = Job::new("broken", &["echo x >> attempts; false"]);
        job.retry = Some(RetryPolicy {
            attempts: 2,
            delay_seconds: 1,
        });
        let f = fixture(vec![job.clone()]);

        let outcome = f
            .executor
            .execute(&job, context(&f, "broken"), None, &CancellationToken::new())
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        let lines = std::fs::read_to_string(f.dir.path().join("attempts")).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_timeout_covers_whole_job() {
        let mut job = Job::new("slow", &["sleep 30"]);
        job.timeout_seconds = Some(1);
        job.retry = Some(RetryPolicy {
            attempts: 5,
            delay_seconds: 1,
        });
        let f = fixture(vec![job.clone()]);

        let start = Instant::now();
        let outcome = f
            .executor
            .execute(&job, context(&f, "slow"), None, &CancellationToken::new())
            .await;

        assert_eq!(
            outcome.failure,
            Some(FailureReason::Timeout { limit_seconds: 1 })
        );
        assert_eq!(outcome.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_timeout_is_not_held_up_by_background_process() {
        let mut job = Job::new("forward", &["sleep 8 & echo started"]);
        job.timeout_seconds = Some(1);
        let f = fixture(vec![job.clone()]);

        let start = Instant::now();
        let outcome = f
            .executor
            .execute(&job, context(&f, "forward"), None, &CancellationToken::new())
            .await;

        assert_eq!(
            outcome.failure,
            Some(FailureReason::Timeout { limit_seconds: 1 })
        );
        assert!(start.elapsed() < Duration::from_secs(5), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let job = Job::new("slow", &["sleep 30", "touch should-not-exist"]);
        let f = fixture(vec![job.clone()]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let outcome = f
            .executor
            .execute(&job, context(&f, "slow"), None, &cancel)
            .await;

        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
        assert!(!f.dir.path().join("should-not-exist").exists());
    }

    #[tokio::test]
    async fn test_secrets_are_redacted_from_output_and_log() {
        let job = Job::new("deploy", &["echo token=$API_TOKEN"]);
        let f = fixture(vec![job.clone()]);
        let (tx, mut rx) = progress_channel();
        let executor = JobExecutor::new(Arc::new(RunnerRegistry::new()), f.artifacts.clone())
            .with_progress(Some(tx));

        let mut ctx = context(&f, "deploy");
        ctx.insert_secret("API_TOKEN", SecretValue::new("hunter2-abc"));
        let log = f.dir.path().join("logs").join("deploy.log");

        let outcome = executor
            .execute(&job, ctx, Some(log.clone()), &CancellationToken::new())
            .await;
        drop(executor);

        assert!(outcome.succeeded());
        assert_eq!(outcome.output_tail, vec!["token=***"]);
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("token=***"));
        assert!(!content.contains("hunter2-abc"));

        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::JobOutput { line, .. } = event {
                assert!(!line.contains("hunter2-abc"));
            }
        }
    }

    #[tokio::test]
    async fn test_unwritable_log_falls_back_to_memory_with_warning() {
        let job = Job::new("build", &["echo built"]);
        let f = fixture(vec![job.clone()]);
        std::fs::write(f.dir.path().join("blocker"), "").unwrap();
        let (tx, mut rx) = progress_channel();
        let executor = JobExecutor::new(Arc::new(RunnerRegistry::new()), f.artifacts.clone())
            .with_progress(Some(tx));

        let log = f.dir.path().join("blocker").join("build.log");
        let outcome = executor
            .execute(&job, context(&f, "build"), Some(log), &CancellationToken::new())
            .await;
        drop(executor);

        assert!(outcome.succeeded());
        assert_eq!(outcome.output_tail, vec!["built"]);
        assert!(outcome.log_path.is_none());

        let mut warnings = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::Log { message, job_id, .. } = event {
                assert_eq!(job_id.as_deref(), Some("build"));
                warnings.push(message);
            }
        }
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("cannot open job log"));
    }

    #[tokio::test]
    async fn test_multiline_secret_is_redacted_from_output() {
        let job = Job::new("build", &["printf '%s\\n' \"$GCLOUD_SERVICE_KEY\""]);
        let f = fixture(vec![job.clone()]);

        let mut ctx = context(&f, "build");
        ctx.insert_secret(
            "GCLOUD_SERVICE_KEY",
            SecretValue::new("{\n\"private_key\": \"SUPERSECRETMATERIAL\"\n}"),
        );
        let log = f.dir.path().join("logs").join("build.log");

        let outcome = f
            .executor
            .execute(&job, ctx, Some(log.clone()), &CancellationToken::new())
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.output_tail, vec!["***", "***", "***"]);
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(!content.contains("SUPERSECRETMATERIAL"));
    }
}
