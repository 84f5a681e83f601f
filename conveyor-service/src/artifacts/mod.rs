// Artifact Store
// Run-scoped, immutable values handed from producing jobs to their dependents

pub mod template;

pub use template::{interpolate, is_valid_key, references, ArtifactRef};

use crate::execution::graph::ExecutionGraph;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// A value published by one job for its dependents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub producer: String,
    pub key: String,
    pub value: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    /// The reader does not depend, directly or transitively, on the producer
    #[error("artifact '{key}' of job '{producer}' is not visible to job '{reader}'")]
    NotVisible {
        reader: String,
        producer: String,
        key: String,
    },

    #[error("job '{producer}' did not publish artifact '{key}'")]
    NotFound { producer: String, key: String },

    #[error("artifact '{key}' of job '{producer}' is already published")]
    AlreadyPublished { producer: String, key: String },

    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("invalid artifact key '{0}'")]
    InvalidKey(String),
}

/// Append-only store shared by all jobs of one run.
///
/// Visibility follows the dependency graph: a job can read its own artifacts
/// and those of its ancestors, nothing else.
#[derive(Debug)]
pub struct ArtifactStore {
    graph: Arc<ExecutionGraph>,
    entries: RwLock<BTreeMap<(String, String), Artifact>>,
}

impl ArtifactStore {
    pub fn new(graph: Arc<ExecutionGraph>) -> Self {
        Self {
            graph,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store `value` under `(producer, key)`. Values are immutable once published.
    pub async fn publish(
        &self,
        producer: &str,
        key: &str,
        value: impl Into<String>,
    ) -> Result<Artifact, ArtifactError> {
        if self.graph.job(producer).is_none() {
            return Err(ArtifactError::UnknownJob(producer.to_string()));
        }
        if !is_valid_key(key) {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }

        let mut entries = self.entries.write().await;
        let slot = (producer.to_string(), key.to_string());
        if entries.contains_key(&slot) {
            return Err(ArtifactError::AlreadyPublished {
                producer: producer.to_string(),
                key: key.to_string(),
            });
        }

        let artifact = Artifact {
            producer: producer.to_string(),
            key: key.to_string(),
            value: value.into(),
            published_at: Utc::now(),
        };
        entries.insert(slot, artifact.clone());
        tracing::debug!(job = producer, key, "artifact published");
        Ok(artifact)
    }

    /// Read an artifact on behalf of `reader`
    pub async fn resolve(
        &self,
        reader: &str,
        producer: &str,
        key: &str,
    ) -> Result<String, ArtifactError> {
        if self.graph.job(reader).is_none() {
            return Err(ArtifactError::UnknownJob(reader.to_string()));
        }
        if reader != producer && !self.graph.is_ancestor(producer, reader) {
            return Err(ArtifactError::NotVisible {
                reader: reader.to_string(),
                producer: producer.to_string(),
                key: key.to_string(),
            });
        }

        self.entries
            .read()
            .await
            .get(&(producer.to_string(), key.to_string()))
            .map(|artifact| artifact.value.clone())
            .ok_or_else(|| ArtifactError::NotFound {
                producer: producer.to_string(),
                key: key.to_string(),
            })
    }

    /// All artifacts `reader` may see, ordered by producer then key
    pub async fn visible_to(&self, reader: &str) -> Vec<Artifact> {
        self.entries
            .read()
            .await
            .values()
            .filter(|a| a.producer == reader || self.graph.is_ancestor(&a.producer, reader))
            .cloned()
            .collect()
    }

    /// Every artifact published so far
    pub async fn snapshot(&self) -> Vec<Artifact> {
        self.entries.read().await.values().cloned().collect()
    }
}
