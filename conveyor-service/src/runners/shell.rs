// Shell Runner
// Runs commands through a host shell with an isolated environment

use super::process::{resolve_program, run_streaming};
use super::{CommandOutcome, CommandRequest, CommandRunner, OutputSender, RunnerError};
use crate::workflow::models::EnvironmentSpec;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Arguments that make `shell` run a single command string
pub(crate) fn shell_args(shell: &str) -> &'static [&'static str] {
    let name = std::path::Path::new(shell)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(shell);
    match name {
        "pwsh" | "powershell" => &["-NoLogo", "-NoProfile", "-Command"],
        "cmd" => &["/C"],
        _ => &["-c"],
    }
}

/// Host shell runner.
///
/// The child environment is cleared and rebuilt from the execution context,
/// so nothing leaks in from the orchestrator's own environment.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    fn name(&self) -> &str {
        "host"
    }

    async fn run(
        &self,
        request: CommandRequest<'_>,
        output: &OutputSender,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, RunnerError> {
        let shell = request.environment.shell();

        let mut cmd = Command::new(resolve_program(shell));
        cmd.args(shell_args(shell))
            .arg(request.command)
            .current_dir(&request.context.working_dir)
            .env_clear()
            .envs(request.context.command_env());

        tracing::debug!(
            job = request.job_id,
            index = request.index,
            shell,
            "running host command"
        );
        run_streaming(cmd, shell, output, cancel).await
    }

    fn required_tools(&self, environment: &EnvironmentSpec) -> Vec<String> {
        vec![environment.shell().to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ExecutionContext;
    use crate::runners::{output_channel, OutputLine};
    use crate::secrets::SecretValue;
    use std::time::Duration;
    use uuid::Uuid;

    fn context(dir: &std::path::Path) -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), "test", "job", dir.to_path_buf())
            .with_host_env(&["PATH"])
    }

    async fn run(
        command: &str,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> (CommandOutcome, Vec<OutputLine>) {
        let (tx, mut rx) = output_channel();
        let environment = EnvironmentSpec::default();
        let request = CommandRequest {
            job_id: "job",
            attempt: 1,
            index: 0,
            command,
            environment: &environment,
            context: ctx,
        };
        let outcome = ShellRunner::new().run(request, &tx, cancel).await.unwrap();
        drop(tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        (outcome, lines)
    }

    #[tokio::test]
    async fn test_echo_streams_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (outcome, lines) = run(
            "echo hello; echo oops >&2",
            &ctx,
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.success());
        assert!(lines.contains(&OutputLine {
            text: "hello".to_string(),
            is_error: false
        }));
        assert!(lines.contains(&OutputLine {
            text: "oops".to_string(),
            is_error: true
        }));
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (outcome, _) = run("exit 3", &ctx, &CancellationToken::new()).await;
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_environment_is_isolated() {
        std::env::set_var("CONVEYOR_TEST_SHOULD_NOT_LEAK", "leaked");
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path()).with_env([("GREETING", "hi")]);
        ctx.insert_secret("TOKEN", SecretValue::new("t0k3n"));

        let (outcome, lines) = run(
            r#"echo "${CONVEYOR_TEST_SHOULD_NOT_LEAK:-unset} $GREETING $TOKEN $CONVEYOR_JOB""#,
            &ctx,
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.success());
        assert_eq!(lines[0].text, "unset hi t0k3n job");
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let (outcome, _) = run("touch marker", &ctx, &CancellationToken::new()).await;
        assert!(outcome.success());
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_cancel_stops_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let (outcome, _) = run("sleep 30", &ctx, &cancel).await;
        assert!(outcome.cancelled);
        assert!(outcome.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_background_processes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        // The backgrounded sleep keeps stdout open after the shell exits
        let (outcome, lines) = run(
            "(sleep 8; touch survived) & echo started",
            &ctx,
            &cancel,
        )
        .await;
        assert!(outcome.cancelled);
        assert!(outcome.duration < Duration::from_secs(5));
        assert_eq!(lines[0].text, "started");

        // The whole process group went down with the cancellation
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(!dir.path().join("survived").exists());
    }

    #[tokio::test]
    async fn test_missing_working_dir_is_spawn_error() {
        let ctx = ExecutionContext::new(
            Uuid::new_v4(),
            "test",
            "job",
            "/nonexistent/conveyor/dir".into(),
        );
        let (tx, _rx) = output_channel();
        let environment = EnvironmentSpec::default();
        let request = CommandRequest {
            job_id: "job",
            attempt: 1,
            index: 0,
            command: "true",
            environment: &environment,
            context: &ctx,
        };
        let err = ShellRunner::new()
            .run(request, &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[test]
    fn test_shell_args() {
        assert_eq!(shell_args("sh"), &["-c"]);
        assert_eq!(shell_args("/bin/bash"), &["-c"]);
        assert_eq!(shell_args("pwsh"), &["-NoLogo", "-NoProfile", "-Command"]);
    }
}
