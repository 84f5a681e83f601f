// Secrets Provider
// Resolves job-declared secret names against pluggable sources

mod sources;

pub use sources::{EnvSecretSource, FileSecretSource, MemorySecretSource};

use crate::execution::context::ExecutionContext;
use crate::workflow::models::Job;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{compiler_fence, Ordering};
use thiserror::Error;

/// An opaque secret string. Never printed; zeroed when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Callers must not copy it into long-lived buffers.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

/// Overwrite a string's bytes before its buffer is freed
pub(crate) fn wipe(value: &mut String) {
    let mut bytes = std::mem::take(value).into_bytes();
    bytes.iter_mut().for_each(|b| *b = 0);
    std::hint::black_box(&bytes);
    compiler_fence(Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret '{name}' not found")]
    NotFound { name: String },

    #[error("secret source '{source_name}' failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },

    #[error("failed to read secrets file: {0}")]
    Io(#[from] std::io::Error),
}

/// A backing key-value store for secrets
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &str;

    /// Look up `name`; `Ok(None)` lets the next source try
    async fn fetch(&self, name: &str) -> Result<Option<SecretValue>, SecretError>;
}

/// Queries its sources in order; the first hit wins
#[derive(Clone, Default)]
pub struct SecretsProvider {
    sources: Vec<Arc<dyn SecretSource>>,
}

impl SecretsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl SecretSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Resolve a single secret
    pub async fn fetch(&self, name: &str) -> Result<SecretValue, SecretError> {
        for source in &self.sources {
            if let Some(value) = source.fetch(name).await? {
                tracing::debug!(secret = name, source = source.name(), "secret resolved");
                return Ok(value);
            }
        }
        Err(SecretError::NotFound {
            name: name.to_string(),
        })
    }

    /// Inject every secret `job` declares into `context`.
    ///
    /// On error the context is dropped, wiping whatever was already fetched.
    pub async fn materialize(
        &self,
        job: &Job,
        mut context: ExecutionContext,
    ) -> Result<ExecutionContext, SecretError> {
        for name in &job.secrets {
            let value = self.fetch(name).await?;
            context.insert_secret(name.clone(), value);
        }
        Ok(context)
    }
}

impl fmt::Debug for SecretsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsProvider")
            .field("sources", &self.source_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn context(job: &str) -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), "iris", job, PathBuf::from("."))
    }

    #[test]
    fn test_secret_value_is_not_printed() {
        let value = SecretValue::new("hunter2");
        assert_eq!(format!("{:?}", value), "SecretValue(***)");
        assert_eq!(value.expose(), "hunter2");
    }

    #[test]
    fn test_wipe_clears_string() {
        let mut s = String::from("hunter2");
        wipe(&mut s);
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn test_first_source_wins() {
        let provider = SecretsProvider::new()
            .with_source(MemorySecretSource::new().with_secret("TOKEN", "from-memory"))
            .with_source(MemorySecretSource::new().with_secret("TOKEN", "shadowed"));

        assert_eq!(provider.fetch("TOKEN").await.unwrap().expose(), "from-memory");
    }

    #[tokio::test]
    async fn test_materialize_injects_declared_secrets() {
        let provider = SecretsProvider::new()
            .with_source(MemorySecretSource::new().with_secret("GCLOUD_KEY", "k3y"));
        let mut job = Job::new("build", &["true"]);
        job.secrets = vec!["GCLOUD_KEY".to_string()];

        let ctx = provider.materialize(&job, context("build")).await.unwrap();
        assert_eq!(ctx.secret_names(), vec!["GCLOUD_KEY"]);
        assert!(ctx.command_env().any(|(k, v)| k == "GCLOUD_KEY" && v == "k3y"));
    }

    #[tokio::test]
    async fn test_materialize_missing_secret() {
        let provider = SecretsProvider::new().with_source(MemorySecretSource::new());
        let mut job = Job::new("deploy", &["true"]);
        job.secrets = vec!["KUBE_TOKEN".to_string()];

        let err = provider.materialize(&job, context("deploy")).await.unwrap_err();
        assert!(matches!(err, SecretError::NotFound { ref name } if name == "KUBE_TOKEN"));
    }
}
