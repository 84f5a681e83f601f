use super::{wipe, SecretError, SecretSource, SecretValue};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// Reads `<prefix><NAME>` from the orchestrator's own environment
#[derive(Debug, Clone, Default)]
pub struct EnvSecretSource {
    prefix: String,
}

impl EnvSecretSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SecretSource for EnvSecretSource {
    fn name(&self) -> &str {
        "env"
    }

    async fn fetch(&self, name: &str) -> Result<Option<SecretValue>, SecretError> {
        Ok(std::env::var(format!("{}{}", self.prefix, name))
            .ok()
            .map(SecretValue::new))
    }
}

/// A YAML or JSON mapping of names to values, loaded once
#[derive(Debug, Default)]
pub struct FileSecretSource {
    values: HashMap<String, SecretValue>,
}

impl FileSecretSource {
    pub fn load(path: &Path) -> Result<Self, SecretError> {
        let mut content = std::fs::read_to_string(path)?;
        let parsed: Result<HashMap<String, String>, _> = serde_yaml::from_str(&content);
        wipe(&mut content);

        let values = parsed
            .map_err(|e| SecretError::Source {
                source_name: path.display().to_string(),
                // serde_yaml messages can quote values; keep only the location
                message: match e.location() {
                    Some(loc) => format!(
                        "expected a mapping of names to strings (line {})",
                        loc.line()
                    ),
                    None => "expected a mapping of names to strings".to_string(),
                },
            })?
            .into_iter()
            .map(|(name, mut value)| {
                let secret = SecretValue::new(value.clone());
                wipe(&mut value);
                (name, secret)
            })
            .collect();

        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl SecretSource for FileSecretSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch(&self, name: &str) -> Result<Option<SecretValue>, SecretError> {
        Ok(self.values.get(name).cloned())
    }
}

/// In-memory source, mostly for tests and embedding
#[derive(Debug, Default)]
pub struct MemorySecretSource {
    values: HashMap<String, SecretValue>,
}

impl MemorySecretSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), SecretValue::new(value));
        self
    }
}

#[async_trait]
impl SecretSource for MemorySecretSource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, name: &str) -> Result<Option<SecretValue>, SecretError> {
        Ok(self.values.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_source_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yml");
        std::fs::write(&path, "REGISTRY_TOKEN: abc\nKUBE_TOKEN: \"def\"\n").unwrap();

        let source = FileSecretSource::load(&path).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(
            source.fetch("KUBE_TOKEN").await.unwrap().unwrap().expose(),
            "def"
        );
        assert!(source.fetch("MISSING").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_source_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, r#"{"TOKEN": "s3cr3t"}"#).unwrap();

        let source = FileSecretSource::load(&path).unwrap();
        assert_eq!(source.fetch("TOKEN").await.unwrap().unwrap().expose(), "s3cr3t");
    }

    #[test]
    fn test_file_source_error_does_not_echo_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yml");
        std::fs::write(&path, "- hunter2\n").unwrap();

        let err = FileSecretSource::load(&path).unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_env_source_prefix() {
        std::env::set_var("CONVEYOR_TEST_SECRET_ENV_SOURCE", "from-env");
        let source = EnvSecretSource::new("CONVEYOR_TEST_SECRET_");
        assert_eq!(
            source.fetch("ENV_SOURCE").await.unwrap().unwrap().expose(),
            "from-env"
        );
        assert!(source.fetch("NOPE").await.unwrap().is_none());
    }
}
