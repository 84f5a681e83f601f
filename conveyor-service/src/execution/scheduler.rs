// Workflow Scheduler
// Dispatches ready jobs concurrently and propagates failures to their dependents

use crate::artifacts::ArtifactStore;
use crate::error::DefinitionError;
use crate::execution::context::{ExecutionContext, DEFAULT_PASSTHROUGH};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::{
    JobExecutor, JobOutcome, DEFAULT_MAX_RETRY_DELAY, DEFAULT_TAIL_LINES,
};
use crate::execution::graph::ExecutionGraph;
use crate::execution::report::{
    run_dir, FailureReason, JobStatus, RunReport, RunResult, WorkflowStatus,
};
use crate::runners::RunnerRegistry;
use crate::secrets::{SecretError, SecretsProvider};
use crate::utils::{file_stem_for, job_working_dir, resolve_working_dir};
use crate::workflow::models::{Job, Workflow};

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Configuration for a workflow run
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently running jobs (0 = unlimited). Overrides the workflow's own limit.
    pub max_parallel: Option<usize>,
    /// Base directory that job working directories are resolved against
    pub working_dir: PathBuf,
    /// Where per-job logs are written (`<log_dir>/<run_id>/logs`); `None` keeps output in memory
    pub log_dir: Option<PathBuf>,
    /// Host variables passed through to every job
    pub inherit_env: Vec<String>,
    /// Output lines kept per job for the report
    pub output_tail_lines: usize,
    /// Upper bound for retry back-off
    pub max_retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            working_dir: resolve_working_dir(),
            log_dir: None,
            inherit_env: DEFAULT_PASSTHROUGH.iter().map(|s| s.to_string()).collect(),
            output_tail_lines: DEFAULT_TAIL_LINES,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_inherit_env<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.inherit_env = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_tail_lines(mut self, lines: usize) -> Self {
        self.output_tail_lines = lines;
        self
    }

    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }
}

/// Everything a spawned job task needs
#[derive(Clone)]
struct Dispatch {
    executor: Arc<JobExecutor>,
    secrets: Arc<SecretsProvider>,
    artifacts: Arc<ArtifactStore>,
    progress: Option<ProgressSender>,
    cancel: CancellationToken,
}

impl Dispatch {
    async fn run(self, job: Job, context: ExecutionContext, log_path: Option<PathBuf>) -> JobOutcome {
        let mut context = context;
        for artifact in self.artifacts.visible_to(&job.id).await {
            context = context.with_artifact(&artifact.producer, &artifact.key, artifact.value);
        }
        for name in context.ambiguous_artifact_vars() {
            self.progress.send_event(ExecutionEvent::warning(
                format!("{} is claimed by more than one artifact and is left unset", name),
                Some(job.id.clone()),
            ));
        }

        let context = match self.secrets.materialize(&job, context).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(job = %job.id, error = %e, "secrets could not be materialized");
                let message = format!("secrets could not be materialized: {}", e);
                let (event, reason) = match e {
                    SecretError::NotFound { name } => (
                        ExecutionEvent::warning(message, Some(job.id.clone())),
                        FailureReason::SecretNotFound { name },
                    ),
                    other => (
                        ExecutionEvent::error(message, Some(job.id.clone())),
                        FailureReason::SecretUnavailable {
                            message: other.to_string(),
                        },
                    ),
                };
                self.progress.send_event(event);
                return JobOutcome::not_started(reason);
            }
        };

        self.executor
            .execute(&job, context, log_path, &self.cancel)
            .await
    }
}

/// Runs one workflow to completion.
///
/// A scheduler owns the state of a single run; build a new one per run.
pub struct WorkflowScheduler {
    graph: Arc<ExecutionGraph>,
    config: SchedulerConfig,
    runners: Arc<RunnerRegistry>,
    secrets: Arc<SecretsProvider>,
    artifacts: Arc<ArtifactStore>,
    progress: Option<ProgressSender>,
    cancel: CancellationToken,
    run_id: Uuid,
}

impl WorkflowScheduler {
    pub fn new(graph: ExecutionGraph) -> Self {
        let graph = Arc::new(graph);
        Self {
            artifacts: Arc::new(ArtifactStore::new(graph.clone())),
            graph,
            config: SchedulerConfig::default(),
            runners: Arc::new(RunnerRegistry::new()),
            secrets: Arc::new(SecretsProvider::new()),
            progress: None,
            cancel: CancellationToken::new(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Resolve `workflow` and create a scheduler for it
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, DefinitionError> {
        Ok(Self::new(ExecutionGraph::resolve(workflow)?))
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = Arc::new(runners);
        self
    }

    pub fn with_secrets(mut self, secrets: SecretsProvider) -> Self {
        self.secrets = Arc::new(secrets);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Use an externally owned token; cancelling it cancels the run
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn artifacts(&self) -> Arc<ArtifactStore> {
        self.artifacts.clone()
    }

    fn parallel_limit(&self) -> usize {
        match self.config.max_parallel.or(self.graph.max_parallel) {
            None | Some(0) => usize::MAX,
            Some(limit) => limit,
        }
    }

    fn log_path(&self, job_id: &str) -> Option<PathBuf> {
        self.config.log_dir.as_ref().map(|dir| {
            run_dir(dir, &self.run_id)
                .join("logs")
                .join(format!("{}.log", file_stem_for(job_id)))
        })
    }

    fn base_context(&self, job: &Job) -> ExecutionContext {
        let working_dir =
            job_working_dir(&self.config.working_dir, job.working_directory.as_deref());
        ExecutionContext::new(self.run_id, &self.graph.name, &job.id, working_dir)
            .with_host_env(&self.config.inherit_env)
            .with_env(self.graph.env.clone())
            .with_env(job.env.clone())
    }

    /// Execute the workflow and return its report
    pub async fn run(self) -> RunReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let graph = self.graph.clone();

        tracing::info!(
            workflow = %graph.name,
            run_id = %self.run_id,
            jobs = graph.len(),
            "workflow started"
        );
        self.progress.send_event(ExecutionEvent::workflow_started(
            &graph.name,
            self.run_id,
            graph.len(),
        ));

        let executor = JobExecutor::new(self.runners.clone(), self.artifacts.clone())
            .with_progress(self.progress.clone())
            .with_tail_lines(self.config.output_tail_lines)
            .with_max_retry_delay(self.config.max_retry_delay);
        let dispatch = Dispatch {
            executor: Arc::new(executor),
            secrets: self.secrets.clone(),
            artifacts: self.artifacts.clone(),
            progress: self.progress.clone(),
            cancel: self.cancel.clone(),
        };

        let mut state = RunState::new(&graph);
        let mut running: JoinSet<(usize, JobOutcome)> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, usize> = HashMap::new();
        let limit = self.parallel_limit();

        loop {
            if self.cancel.is_cancelled() && !state.ready.is_empty() {
                tracing::info!(workflow = %graph.name, "run cancelled; skipping pending jobs");
                self.progress.send_event(ExecutionEvent::info(
                    "run cancelled; skipping pending jobs",
                    None,
                ));
                for index in std::mem::take(&mut state.ready) {
                    self.skip(&mut state, index, FailureReason::Cancelled);
                }
            }

            while running.len() < limit {
                let Some(index) = state.ready.pop_first() else {
                    break;
                };
                let node = graph.node(index);
                if let Err(e) = state.results[index].transition(JobStatus::Running) {
                    tracing::error!(job = node.id(), error = %e, "cannot start job");
                    continue;
                }
                tracing::info!(job = node.id(), "dispatching job");

                let context = self.base_context(&node.job);
                let log_path = self.log_path(node.id());
                let job = node.job.clone();
                let task = dispatch.clone();
                let handle = running.spawn(async move {
                    let outcome = task.run(job, context, log_path).await;
                    (index, outcome)
                });
                in_flight.insert(handle.id(), index);
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (index, outcome) = match joined {
                Ok((id, result)) => {
                    in_flight.remove(&id);
                    result
                }
                Err(e) => {
                    let Some(index) = in_flight.remove(&e.id()) else {
                        tracing::error!(error = %e, "lost track of a job task");
                        continue;
                    };
                    tracing::error!(job = graph.node(index).id(), error = %e, "job task aborted");
                    let outcome = JobOutcome::not_started(FailureReason::SpawnFailed {
                        message: e.to_string(),
                    });
                    (index, outcome)
                }
            };
            self.complete(&mut state, index, outcome);
        }

        // Anything still pending was cut off by cancellation
        for index in 0..graph.len() {
            if state.results[index].status == JobStatus::Pending {
                self.skip(&mut state, index, FailureReason::Cancelled);
            }
        }

        let status = if state
            .results
            .iter()
            .all(|result| result.status == JobStatus::Succeeded)
        {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Failed
        };
        let duration = start.elapsed();

        tracing::info!(workflow = %graph.name, %status, ?duration, "workflow finished");
        self.progress.send_event(ExecutionEvent::workflow_completed(
            &graph.name,
            status,
            duration,
        ));

        RunReport {
            run_id: self.run_id,
            workflow: graph.name.clone(),
            status,
            cancelled: self.cancel.is_cancelled(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            jobs: state.results,
            artifacts: self.artifacts.snapshot().await,
        }
    }

    /// Record a finished job and release or skip its dependents
    fn complete(&self, state: &mut RunState, index: usize, outcome: JobOutcome) {
        let node = self.graph.node(index);
        let result = &mut state.results[index];
        if let Err(e) = result.transition(outcome.status) {
            tracing::error!(job = node.id(), error = %e, "invalid job status change");
        }
        result.attempts = outcome.attempts;
        result.exit_code = outcome.exit_code;
        result.failure = outcome.failure.clone();
        result.log_path = outcome.log_path;
        result.output_tail = outcome.output_tail;

        self.progress.send_event(ExecutionEvent::job_completed(
            node.id(),
            outcome.status,
            outcome.duration,
            outcome.failure.clone(),
        ));

        if outcome.status == JobStatus::Succeeded {
            for &dependent in &node.dependents {
                state.unmet[dependent] -= 1;
                if state.unmet[dependent] == 0
                    && state.results[dependent].status == JobStatus::Pending
                {
                    state.ready.insert(dependent);
                }
            }
            return;
        }

        if let Some(reason) = &outcome.failure {
            tracing::warn!(job = node.id(), reason = %reason, "job failed");
        }

        // Transitively skip everything downstream that has not started
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            let upstream = self.graph.node(current);
            for &dependent in &upstream.dependents {
                if state.results[dependent].status != JobStatus::Pending {
                    continue;
                }
                let reason = if self.cancel.is_cancelled() {
                    FailureReason::Cancelled
                } else {
                    FailureReason::DependencyFailed {
                        dependency: upstream.id().to_string(),
                    }
                };
                self.skip(state, dependent, reason);
                stack.push(dependent);
            }
        }
    }

    fn skip(&self, state: &mut RunState, index: usize, reason: FailureReason) {
        let node = self.graph.node(index);
        let result = &mut state.results[index];
        if let Err(e) = result.transition(JobStatus::Skipped) {
            tracing::error!(job = node.id(), error = %e, "cannot skip job");
            return;
        }
        state.ready.remove(&index);
        tracing::info!(job = node.id(), reason = %reason, "job skipped");
        result.failure = Some(reason.clone());
        self.progress
            .send_event(ExecutionEvent::job_skipped(node.id(), reason));
    }
}

/// Scheduler-owned status table
struct RunState {
    /// Per-job results in declaration order
    results: Vec<RunResult>,
    /// Dependencies of each job that have not succeeded yet
    unmet: Vec<usize>,
    /// Jobs whose dependencies all succeeded, by declaration index
    ready: BTreeSet<usize>,
}

impl RunState {
    fn new(graph: &ExecutionGraph) -> Self {
        let results = graph
            .nodes()
            .iter()
            .map(|node| RunResult::pending(node.id()))
            .collect();
        let unmet: Vec<usize> = graph
            .nodes()
            .iter()
            .map(|node| node.dependencies.len())
            .collect();
        let ready = unmet
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| index)
            .collect();
        Self {
            results,
            unmet,
            ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::{progress_channel, LogLevel};
    use crate::runners::{
        CommandOutcome, CommandRequest, CommandRunner, OutputLine, OutputSender, RunnerError,
    };
    use crate::secrets::MemorySecretSource;
    use crate::workflow::parser::WorkflowParser;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic stand-in for external tools.
    ///
    /// `fail` exits 1, `slow` runs until cancelled, `wait` sleeps briefly,
    /// `say:<text>` prints `<text>`, anything else exits 0.
    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<(String, String)>>,
        artifact_env: Mutex<Vec<(String, Option<String>)>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedRunner {
        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn jobs_run(&self) -> Vec<String> {
            let mut jobs: Vec<String> = Vec::new();
            for (job, _) in self.calls() {
                if !jobs.contains(&job) {
                    jobs.push(job);
                }
            }
            jobs
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for ScriptedRunner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(
            &self,
            request: CommandRequest<'_>,
            output: &OutputSender,
            cancel: &CancellationToken,
        ) -> Result<CommandOutcome, RunnerError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.job_id.to_string(), request.command.to_string()));
            self.artifact_env.lock().unwrap().push((
                request.job_id.to_string(),
                request
                    .context
                    .env_var("CONVEYOR_ARTIFACT_BUILD_IMAGE")
                    .map(str::to_string),
            ));

            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);

            let mut outcome = CommandOutcome {
                exit_code: Some(0),
                duration: Duration::from_millis(1),
                cancelled: false,
            };
            match request.command {
                "fail" => outcome.exit_code = Some(1),
                "wait" => tokio::time::sleep(Duration::from_millis(100)).await,
                "slow" => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                        _ = cancel.cancelled() => {
                            outcome.exit_code = None;
                            outcome.cancelled = true;
                        }
                    }
                }
                other => {
                    if let Some(text) = other.strip_prefix("say:") {
                        let _ = output.send(OutputLine {
                            text: text.to_string(),
                            is_error: false,
                        });
                    }
                }
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(outcome)
        }
    }

    fn scheduler(workflow: &Workflow, runner: Arc<ScriptedRunner>) -> WorkflowScheduler {
        let dir = std::env::temp_dir();
        WorkflowScheduler::from_workflow(workflow)
            .unwrap()
            .with_config(SchedulerConfig::default().with_working_dir(dir))
            .with_runners(RunnerRegistry::uniform(runner))
    }

    fn pipeline(build: &str) -> Workflow {
        Workflow {
            name: Some("iris".to_string()),
            jobs: vec![
                Job::new("checkout", &["ok"]),
                Job::new("build", &[build]).requiring(&["checkout"]),
                Job::new("deploy", &["ok"]).requiring(&["build"]),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_linear_workflow_succeeds() {
        let runner = Arc::new(ScriptedRunner::default());
        let report = scheduler(&pipeline("ok"), runner.clone()).run().await;

        assert!(report.succeeded());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(runner.jobs_run(), vec!["checkout", "build", "deploy"]);
        for job in &report.jobs {
            assert_eq!(
                job.statuses(),
                vec![JobStatus::Pending, JobStatus::Running, JobStatus::Succeeded]
            );
            assert_eq!(job.attempts, 1);
        }
    }

    #[tokio::test]
    async fn test_failed_build_skips_deploy() {
        let runner = Arc::new(ScriptedRunner::default());
        let report = scheduler(&pipeline("fail"), runner.clone()).run().await;

        assert_eq!(report.status, WorkflowStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.job("checkout").unwrap().status, JobStatus::Succeeded);
        assert_eq!(report.job("build").unwrap().status, JobStatus::Failed);
        assert_eq!(report.job("build").unwrap().exit_code, Some(1));

        let deploy = report.job("deploy").unwrap();
        assert_eq!(deploy.status, JobStatus::Skipped);
        assert_eq!(deploy.statuses(), vec![JobStatus::Pending, JobStatus::Skipped]);
        assert_eq!(
            deploy.failure,
            Some(FailureReason::DependencyFailed {
                dependency: "build".to_string()
            })
        );
        assert!(!runner.jobs_run().contains(&"deploy".to_string()));
    }

    #[tokio::test]
    async fn test_skips_are_transitive_and_siblings_unaffected() {
        let workflow = Workflow {
            jobs: vec![
                Job::new("a", &["fail"]),
                Job::new("b", &["ok"]).requiring(&["a"]),
                Job::new("c", &["ok"]).requiring(&["b"]),
                Job::new("d", &["wait"]),
            ],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default());
        let report = scheduler(&workflow, runner).run().await;

        assert_eq!(report.job("a").unwrap().status, JobStatus::Failed);
        assert_eq!(report.job("b").unwrap().status, JobStatus::Skipped);
        assert_eq!(
            report.job("c").unwrap().failure,
            Some(FailureReason::DependencyFailed {
                dependency: "b".to_string()
            })
        );
        assert_eq!(report.job("d").unwrap().status, JobStatus::Succeeded);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_empty_workflow_succeeds() {
        let report = WorkflowScheduler::from_workflow(&Workflow::default())
            .unwrap()
            .run()
            .await;
        assert!(report.succeeded());
        assert!(report.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_reruns_are_independent() {
        let workflow = pipeline("ok");
        let first = scheduler(&workflow, Arc::new(ScriptedRunner::default()))
            .run()
            .await;
        let second = scheduler(&workflow, Arc::new(ScriptedRunner::default()))
            .run()
            .await;

        assert_ne!(first.run_id, second.run_id);
        let histories = |report: &RunReport| -> Vec<Vec<JobStatus>> {
            report.jobs.iter().map(RunResult::statuses).collect()
        };
        assert_eq!(histories(&first), histories(&second));
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_running() {
        let workflow = Workflow {
            jobs: vec![
                Job::new("A", &["ok"]).requiring(&["B"]),
                Job::new("B", &["ok"]).requiring(&["A"]),
            ],
            ..Default::default()
        };
        let err = WorkflowScheduler::from_workflow(&workflow)
            .err()
            .expect("cycle must be rejected");
        match err {
            DefinitionError::CycleDetected { jobs } => assert_eq!(jobs, vec!["A", "B"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_parallel_limit() {
        let jobs = (0..4)
            .map(|i| Job::new(format!("job{}", i), &["wait"]))
            .collect::<Vec<_>>();
        let workflow = Workflow {
            jobs,
            ..Default::default()
        };

        let limited = Arc::new(ScriptedRunner::default());
        let report = scheduler(&workflow, limited.clone())
            .with_config(
                SchedulerConfig::default()
                    .with_working_dir(std::env::temp_dir())
                    .with_max_parallel(2),
            )
            .run()
            .await;
        assert!(report.succeeded());
        assert!(limited.peak.load(Ordering::SeqCst) <= 2);

        let unlimited = Arc::new(ScriptedRunner::default());
        scheduler(&workflow, unlimited.clone()).run().await;
        assert_eq!(unlimited.peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_workflow_max_parallel_applies() {
        let workflow = Workflow {
            max_parallel: Some(1),
            jobs: vec![Job::new("x", &["wait"]), Job::new("y", &["wait"])],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default());
        scheduler(&workflow, runner.clone()).run().await;
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        // Declaration order breaks ties
        assert_eq!(runner.jobs_run(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_commands() {
        let mut deploy = Job::new("deploy", &["ok"]);
        deploy.secrets = vec!["KUBE_TOKEN".to_string()];
        let workflow = Workflow {
            jobs: vec![deploy, Job::new("notify", &["ok"]).requiring(&["deploy"])],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default());
        let report = scheduler(&workflow, runner.clone())
            .with_secrets(SecretsProvider::new().with_source(MemorySecretSource::new()))
            .run()
            .await;

        let deploy = report.job("deploy").unwrap();
        assert_eq!(deploy.status, JobStatus::Failed);
        assert_eq!(deploy.attempts, 0);
        assert_eq!(
            deploy.failure,
            Some(FailureReason::SecretNotFound {
                name: "KUBE_TOKEN".to_string()
            })
        );
        assert_eq!(report.job("notify").unwrap().status, JobStatus::Skipped);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_secret_is_reported_as_log_event() {
        let mut deploy = Job::new("deploy", &["ok"]);
        deploy.secrets = vec!["KUBE_TOKEN".to_string()];
        let workflow = Workflow {
            jobs: vec![deploy],
            ..Default::default()
        };
        let (tx, mut rx) = progress_channel();
        let report = scheduler(&workflow, Arc::new(ScriptedRunner::default()))
            .with_secrets(SecretsProvider::new().with_source(MemorySecretSource::new()))
            .with_progress(tx)
            .run()
            .await;
        assert!(!report.succeeded());

        let mut warned = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::Log {
                level,
                message,
                job_id,
            } = event
            {
                assert_eq!(level, LogLevel::Warning);
                assert_eq!(job_id.as_deref(), Some("deploy"));
                assert!(message.contains("KUBE_TOKEN"), "{}", message);
                warned = true;
            }
        }
        assert!(warned);
    }

    #[tokio::test]
    async fn test_secret_is_injected_and_redacted() {
        let mut deploy = Job::new("deploy", &["say:token is hunter2"]);
        deploy.secrets = vec!["KUBE_TOKEN".to_string()];
        let workflow = Workflow {
            jobs: vec![deploy],
            ..Default::default()
        };
        let report = scheduler(&workflow, Arc::new(ScriptedRunner::default()))
            .with_secrets(
                SecretsProvider::new()
                    .with_source(MemorySecretSource::new().with_secret("KUBE_TOKEN", "hunter2")),
            )
            .run()
            .await;

        assert!(report.succeeded());
        assert_eq!(report.job("deploy").unwrap().output_tail, vec!["token is ***"]);
    }

    #[tokio::test]
    async fn test_artifacts_flow_to_dependents() {
        let workflow = Workflow {
            jobs: vec![
                Job::new("build", &["say:##conveyor[publish key=image]iris:7"]),
                Job::new("deploy", &["kubectl set image ${{ artifacts.build.image }}"])
                    .requiring(&["build"]),
            ],
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::default());
        let report = scheduler(&workflow, runner.clone()).run().await;

        assert!(report.succeeded());
        assert!(runner
            .calls()
            .contains(&("deploy".to_string(), "kubectl set image iris:7".to_string())));
        assert!(runner
            .artifact_env
            .lock()
            .unwrap()
            .contains(&("deploy".to_string(), Some("iris:7".to_string()))));
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.artifacts[0].value, "iris:7");
    }

    #[tokio::test]
    async fn test_colliding_artifact_variables_are_reported() {
        let workflow = Workflow {
            jobs: vec![
                Job::new("build-image", &["say:##conveyor[publish key=tag]v1"]),
                Job::new("build", &["say:##conveyor[publish key=image-tag]v2"]),
                Job::new("deploy", &["ok"]).requiring(&["build-image", "build"]),
            ],
            ..Default::default()
        };
        let (tx, mut rx) = progress_channel();
        let report = scheduler(&workflow, Arc::new(ScriptedRunner::default()))
            .with_progress(tx)
            .run()
            .await;
        assert!(report.succeeded());
        assert_eq!(report.artifacts.len(), 2);

        let mut warnings = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::Log {
                level: LogLevel::Warning,
                message,
                job_id,
            } = event
            {
                assert_eq!(job_id.as_deref(), Some("deploy"));
                warnings.push(message);
            }
        }
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("CONVEYOR_ARTIFACT_BUILD_IMAGE_TAG"));
    }

    #[tokio::test]
    async fn test_cancellation_fails_running_and_skips_pending() {
        let workflow = Workflow {
            jobs: vec![
                Job::new("build", &["slow"]),
                Job::new("deploy", &["ok"]).requiring(&["build"]),
            ],
            ..Default::default()
        };
        let (tx, mut rx) = progress_channel();
        let scheduler = scheduler(&workflow, Arc::new(ScriptedRunner::default())).with_progress(tx);
        let cancel = scheduler.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let report = scheduler.run().await;

        assert!(report.cancelled);
        assert_eq!(report.status, WorkflowStatus::Failed);
        let build = report.job("build").unwrap();
        assert_eq!(build.status, JobStatus::Failed);
        assert_eq!(build.failure, Some(FailureReason::Cancelled));
        let deploy = report.job("deploy").unwrap();
        assert_eq!(deploy.status, JobStatus::Skipped);
        assert_eq!(deploy.failure, Some(FailureReason::Cancelled));

        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::WorkflowCompleted { status, .. } = event {
                assert_eq!(status, WorkflowStatus::Failed);
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let runner = Arc::new(ScriptedRunner::default());
        let scheduler = scheduler(&pipeline("ok"), runner.clone());
        scheduler.cancellation_token().cancel();

        let report = scheduler.run().await;
        assert_eq!(report.count(JobStatus::Skipped), 3);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_logs_written_under_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = WorkflowParser::parse_and_validate(
            r#"
name: logs
jobs:
  build:
    commands: ["say:hello"]
"#,
        )
        .unwrap();
        let scheduler = WorkflowScheduler::from_workflow(&workflow)
            .unwrap()
            .with_config(
                SchedulerConfig::default()
                    .with_working_dir(dir.path())
                    .with_log_dir(dir.path().join("runs")),
            )
            .with_runners(RunnerRegistry::uniform(Arc::new(ScriptedRunner::default())));
        let run_id = scheduler.run_id();

        let report = scheduler.run().await;
        let log = report.job("build").unwrap().log_path.clone().unwrap();
        assert_eq!(
            log,
            dir.path()
                .join("runs")
                .join(run_id.to_string())
                .join("logs")
                .join("build.log")
        );
        assert!(std::fs::read_to_string(log).unwrap().contains("hello"));
    }
}
