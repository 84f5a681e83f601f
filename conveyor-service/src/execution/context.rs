// Job Execution Context
// Per-job environment, working directory and secrets; secrets are wiped on release

use crate::secrets::SecretValue;
use crate::utils::env_key;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Replacement for secret values in captured output
pub const REDACTED: &str = "***";

/// Host variables copied into every job environment unless configured otherwise
pub const DEFAULT_PASSTHROUGH: &[&str] = &["PATH", "HOME", "USER", "LANG", "TMPDIR"];

/// Isolated environment for one job run.
///
/// Owned by the executor for the duration of the job. Secret material is
/// wiped by [`ExecutionContext::release`] or, failing that, on drop.
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow: String,
    pub job_id: String,
    pub working_dir: PathBuf,
    env: BTreeMap<String, String>,
    /// Keys copied from the host and not overridden since
    host_keys: BTreeSet<String>,
    /// Artifact variable name to the (producer, key) it was derived from
    artifact_vars: BTreeMap<String, (String, String)>,
    /// Artifact variable names claimed by more than one artifact
    ambiguous: BTreeSet<String>,
    secrets: Vec<(String, SecretValue)>,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        workflow: impl Into<String>,
        job_id: impl Into<String>,
        working_dir: PathBuf,
    ) -> Self {
        let workflow = workflow.into();
        let job_id = job_id.into();

        let mut env = BTreeMap::new();
        env.insert("CONVEYOR_RUN_ID".to_string(), run_id.to_string());
        env.insert("CONVEYOR_WORKFLOW".to_string(), workflow.clone());
        env.insert("CONVEYOR_JOB".to_string(), job_id.clone());

        Self {
            run_id,
            workflow,
            job_id,
            working_dir,
            env,
            host_keys: BTreeSet::new(),
            artifact_vars: BTreeMap::new(),
            ambiguous: BTreeSet::new(),
            secrets: Vec::new(),
        }
    }

    /// Copy the named variables from the orchestrator's environment
    pub fn with_host_env<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for name in names {
            if let Ok(value) = std::env::var(name.as_ref()) {
                self.env.insert(name.as_ref().to_string(), value);
                self.host_keys.insert(name.as_ref().to_string());
            }
        }
        self
    }

    /// Add variables; later values override earlier ones
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let key = key.into();
            self.host_keys.remove(&key);
            self.env.insert(key, value.into());
        }
        self
    }

    /// Expose an upstream artifact as `CONVEYOR_ARTIFACT_<JOB>_<KEY>`.
    ///
    /// When two artifacts map to the same name (`build-image.tag` and
    /// `build.image-tag`), neither is exported under it.
    pub fn with_artifact(mut self, producer: &str, key: &str, value: impl Into<String>) -> Self {
        let name = artifact_env_name(producer, key);
        if self.ambiguous.contains(&name) {
            return self;
        }
        if let Some((other_producer, other_key)) = self.artifact_vars.get(&name) {
            if other_producer != producer || other_key != key {
                tracing::warn!(
                    job = %self.job_id,
                    variable = %name,
                    "artifact variable is ambiguous; not exported"
                );
                self.env.remove(&name);
                self.artifact_vars.remove(&name);
                self.ambiguous.insert(name);
                return self;
            }
        }

        self.host_keys.remove(&name);
        self.env.insert(name.clone(), value.into());
        self.artifact_vars
            .insert(name, (producer.to_string(), key.to_string()));
        self
    }

    /// Artifact variable names left unset because several artifacts map to them
    pub fn ambiguous_artifact_vars(&self) -> impl Iterator<Item = &str> + '_ {
        self.ambiguous.iter().map(String::as_str)
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// Non-secret variables
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Secrets shadow plain variables of the same name
    pub fn insert_secret(&mut self, name: impl Into<String>, value: SecretValue) {
        let name = name.into();
        self.env.remove(&name);
        self.host_keys.remove(&name);
        self.secrets.retain(|(existing, _)| *existing != name);
        self.secrets.push((name, value));
    }

    pub fn secret_names(&self) -> Vec<&str> {
        self.secrets.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Full child-process environment, secrets included. Borrowed, never copied.
    pub fn command_env(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(self.secrets.iter().map(|(k, v)| (k.as_str(), v.expose())))
    }

    /// Variable names that belong to the job rather than the host: everything
    /// except untouched host passthrough variables
    pub fn job_env_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.env
            .keys()
            .filter(|k| !self.host_keys.contains(*k))
            .map(String::as_str)
            .chain(self.secrets.iter().map(|(k, _)| k.as_str()))
    }

    /// Replace every secret value occurring in `text` with `***`.
    ///
    /// Output is redacted a line at a time, so each non-empty line of a
    /// multi-line secret is also matched on its own.
    pub fn redact(&self, text: &str) -> String {
        let mut values: Vec<&str> = Vec::new();
        for (_, secret) in &self.secrets {
            let value = secret.expose();
            if value.is_empty() {
                continue;
            }
            values.push(value);
            if value.contains(['\n', '\r']) {
                values.extend(
                    value
                        .split(['\n', '\r'])
                        .map(str::trim)
                        .filter(|fragment| !fragment.is_empty()),
                );
            }
        }
        // Longest first so a secret containing another is replaced whole
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        let mut redacted = text.to_string();
        for value in values {
            if redacted.contains(value) {
                redacted = redacted.replace(value, REDACTED);
            }
        }
        redacted
    }

    /// Wipe all secret material. Idempotent.
    pub fn release(&mut self) {
        if !self.secrets.is_empty() {
            tracing::debug!(job = %self.job_id, count = self.secrets.len(), "releasing secrets");
        }
        self.secrets.clear();
    }

    pub fn is_released(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("job_id", &self.job_id)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env)
            .field("secrets", &self.secret_names())
            .finish()
    }
}

/// Environment variable under which an artifact is exposed to dependents
pub fn artifact_env_name(producer: &str, key: &str) -> String {
    format!("CONVEYOR_ARTIFACT_{}_{}", env_key(producer), env_key(key))
}
