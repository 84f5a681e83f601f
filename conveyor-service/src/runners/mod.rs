// Runners Module
// Narrow "run a command line in a context" interface over host shells and containers

pub mod container;
mod process;
pub mod shell;

pub use container::ContainerRunner;
pub use shell::ShellRunner;

use crate::execution::context::ExecutionContext;
use crate::execution::graph::ExecutionGraph;
use crate::workflow::models::EnvironmentSpec;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One line of raw process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub is_error: bool,
}

pub type OutputSender = mpsc::UnboundedSender<OutputLine>;
pub type OutputReceiver = mpsc::UnboundedReceiver<OutputLine>;

pub fn output_channel() -> (OutputSender, OutputReceiver) {
    mpsc::unbounded_channel()
}

/// A single command invocation
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    pub job_id: &'a str,
    pub attempt: u32,
    /// Position of the command within the job (0-based)
    pub index: usize,
    /// Command text with artifact placeholders already substituted
    pub command: &'a str,
    pub environment: &'a EnvironmentSpec,
    pub context: &'a ExecutionContext,
}

/// How a command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code; `None` when killed by a signal or cancelled
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub cancelled: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("required tool '{tool}' was not found on PATH")]
    ToolMissing { tool: String },
}

/// Executes one command line for a job.
///
/// Output lines go to `output` as they are produced. When `cancel` fires the
/// runner stops the command and returns an outcome with `cancelled` set.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn run(
        &self,
        request: CommandRequest<'_>,
        output: &OutputSender,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, RunnerError>;

    /// Executables that must be on PATH for `environment`
    fn required_tools(&self, _environment: &EnvironmentSpec) -> Vec<String> {
        Vec::new()
    }
}

/// Picks a runner from a job's environment descriptor
#[derive(Clone)]
pub struct RunnerRegistry {
    host: Arc<dyn CommandRunner>,
    container: Arc<dyn CommandRunner>,
}

impl RunnerRegistry {
    /// Host shell runner plus the docker-backed container runner
    pub fn new() -> Self {
        Self {
            host: Arc::new(ShellRunner::new()),
            container: Arc::new(ContainerRunner::new()),
        }
    }

    /// Route every job to the same runner
    pub fn uniform(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            host: runner.clone(),
            container: runner,
        }
    }

    pub fn with_host_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.host = runner;
        self
    }

    pub fn with_container_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.container = runner;
        self
    }

    pub fn for_environment(&self, environment: &EnvironmentSpec) -> Arc<dyn CommandRunner> {
        match environment.image() {
            Some(_) => self.container.clone(),
            None => self.host.clone(),
        }
    }

    /// Verify the tools an environment needs are installed
    pub fn check_environment(&self, environment: &EnvironmentSpec) -> Result<(), RunnerError> {
        for tool in self.for_environment(environment).required_tools(environment) {
            if which::which(&tool).is_err() {
                return Err(RunnerError::ToolMissing { tool });
            }
        }
        Ok(())
    }

    /// `(job, error)` for every job whose tools are missing
    pub fn check_graph(&self, graph: &ExecutionGraph) -> Vec<(String, RunnerError)> {
        graph
            .nodes()
            .iter()
            .filter_map(|node| {
                self.check_environment(&node.job.environment)
                    .err()
                    .map(|err| (node.job.id.clone(), err))
            })
            .collect()
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("host", &self.host.name())
            .field("container", &self.container.name())
            .finish()
    }
}
