// Container Runner
// Runs each command in a throwaway Docker container

use super::process::{resolve_program, run_streaming};
use super::shell::shell_args;
use super::{CommandOutcome, CommandRequest, CommandRunner, OutputSender, RunnerError};
use crate::utils::file_stem_for;
use crate::workflow::models::EnvironmentSpec;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Mount point of the run working directory inside the container
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Docker CLI based runner.
///
/// Each command becomes `docker run --rm` with the job working directory
/// mounted at `/workspace`. Variables are forwarded by name (`-e NAME`) so
/// values, secrets included, never appear on the docker command line.
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    program: String,
}

impl ContainerRunner {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    /// Use a docker-compatible CLI such as `podman`
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn container_name(request: &CommandRequest<'_>) -> String {
        let run = request.context.run_id.simple().to_string();
        format!(
            "conveyor-{}-{}-{}-{}",
            &run[..8],
            file_stem_for(request.job_id),
            request.attempt,
            request.index
        )
    }

    /// Arguments for `docker run`; `image` must be set on the environment
    fn run_args(&self, request: &CommandRequest<'_>, image: &str, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-w".to_string(),
            CONTAINER_WORKSPACE.to_string(),
            "-v".to_string(),
            format!(
                "{}:{}",
                request.context.working_dir.display(),
                CONTAINER_WORKSPACE
            ),
        ];

        for key in request.context.job_env_names() {
            args.push("-e".to_string());
            args.push(key.to_string());
        }

        let shell = request.environment.shell();
        args.push(image.to_string());
        args.push(shell.to_string());
        args.extend(shell_args(shell).iter().map(|a| a.to_string()));
        args.push(request.command.to_string());
        args
    }

    async fn kill(&self, name: &str) {
        let result = Command::new(resolve_program(&self.program))
            .args(["kill", name])
            .output()
            .await;
        if let Err(e) = result {
            tracing::warn!(container = name, error = %e, "failed to kill container");
        }
    }
}

impl Default for ContainerRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ContainerRunner {
    fn name(&self) -> &str {
        "container"
    }

    async fn run(
        &self,
        request: CommandRequest<'_>,
        output: &OutputSender,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, RunnerError> {
        let Some(image) = request.environment.image() else {
            return Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("job '{}' has no container image", request.job_id),
            )));
        };

        let name = Self::container_name(&request);
        let mut cmd = Command::new(resolve_program(&self.program));
        cmd.args(self.run_args(&request, image, &name))
            .env_clear()
            .envs(request.context.command_env());

        tracing::debug!(job = request.job_id, container = %name, image, "running container command");
        let outcome = run_streaming(cmd, &self.program, output, cancel).await?;

        if outcome.cancelled {
            self.kill(&name).await;
        }
        Ok(outcome)
    }

    fn required_tools(&self, _environment: &EnvironmentSpec) -> Vec<String> {
        vec![self.program.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::ExecutionContext;
    use crate::secrets::SecretValue;
    use std::path::PathBuf;
    use uuid::Uuid;

    #[test]
    fn test_run_args_forward_names_not_values() {
        let mut ctx = ExecutionContext::new(
            Uuid::nil(),
            "iris",
            "build",
            PathBuf::from("/src/iris"),
        )
        .with_env([("IMAGE", "gcr.io/demo/iris")]);
        ctx.insert_secret("GCLOUD_KEY", SecretValue::new("super-secret"));

        let environment = EnvironmentSpec {
            image: Some("google/cloud-sdk:slim".to_string()),
            shell: None,
        };
        let request = CommandRequest {
            job_id: "build",
            attempt: 2,
            index: 1,
            command: "docker build .",
            environment: &environment,
            context: &ctx,
        };

        let runner = ContainerRunner::new();
        let name = ContainerRunner::container_name(&request);
        assert_eq!(name, "conveyor-00000000-build-2-1");

        let args = runner.run_args(&request, "google/cloud-sdk:slim", &name);
        assert!(args.windows(2).any(|w| w == ["-v", "/src/iris:/workspace"]));
        assert!(args.windows(2).any(|w| w == ["-e", "IMAGE"]));
        assert!(args.windows(2).any(|w| w == ["-e", "GCLOUD_KEY"]));
        assert!(!args.iter().any(|a| a.contains("super-secret")));
        assert_eq!(
            &args[args.len() - 4..],
            &["google/cloud-sdk:slim", "sh", "-c", "docker build ."]
        );
    }

    #[test]
    fn test_requires_docker() {
        let runner = ContainerRunner::new();
        assert_eq!(
            runner.required_tools(&EnvironmentSpec::default()),
            vec!["docker".to_string()]
        );
    }
}
