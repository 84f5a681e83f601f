use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Shell used for host execution when a job does not name one
pub const DEFAULT_SHELL: &str = "sh";

/// A workflow definition: a named DAG of jobs.
///
/// Jobs keep the order in which they are declared in the document; that order
/// breaks ties between jobs that become ready at the same time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Workflow name (the CLI falls back to the file stem)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Default concurrency limit for this workflow (0 = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,

    /// Environment variables visible to every job
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Jobs in declaration order
    #[serde(
        deserialize_with = "deserialize_jobs",
        serialize_with = "serialize_jobs"
    )]
    pub jobs: Vec<Job>,
}

impl Workflow {
    /// Name used in events and reports
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("workflow")
    }

    /// Look up a job by id
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// A unit of work: an ordered command sequence plus its dependencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    /// Unique identifier, taken from the key under `jobs:`
    #[serde(skip)]
    pub id: String,

    /// Jobs that must succeed before this one runs
    #[serde(default, skip_serializing_if = "Requires::is_empty")]
    pub requires: Requires,

    /// Where the commands run (host shell or container image)
    #[serde(default)]
    pub environment: EnvironmentSpec,

    /// Job-level environment variables
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Names of secrets to inject as environment variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,

    /// Working directory, relative to the run working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,

    /// Maximum duration of the whole job, retries included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Bounded retry of the full command sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Commands run in order; the first failure stops the job
    pub commands: Vec<Command>,
}

impl Job {
    /// Create a job with the given id and command lines
    pub fn new(id: impl Into<String>, commands: &[&str]) -> Self {
        Self {
            id: id.into(),
            commands: commands.iter().map(|c| Command::new(*c)).collect(),
            ..Default::default()
        }
    }

    /// Builder helper for declaring dependencies
    pub fn requiring(mut self, deps: &[&str]) -> Self {
        self.requires = Requires::Multiple(deps.iter().map(|d| d.to_string()).collect());
        self
    }

    /// Dependency ids in declaration order
    pub fn requires(&self) -> Vec<String> {
        self.requires.to_vec()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Total number of attempts the executor may make
    pub fn max_attempts(&self) -> u32 {
        1 + self.retry.as_ref().map(|r| r.attempts).unwrap_or(0)
    }
}

/// Dependency list - a single job id or a list of ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Requires {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl Requires {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Requires::None => vec![],
            Requires::Single(s) => vec![s.clone()],
            Requires::Multiple(v) => v.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Requires::None => true,
            Requires::Single(_) => false,
            Requires::Multiple(v) => v.is_empty(),
        }
    }
}

/// Execution environment descriptor for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSpec {
    /// Container image; when absent the job runs on the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Shell used to interpret each command (default `sh`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

impl EnvironmentSpec {
    pub fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or(DEFAULT_SHELL)
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }
}

/// Retry policy: re-run the full command sequence up to `attempts` more times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub attempts: u32,

    /// Base delay before the first retry; doubles on each subsequent retry
    #[serde(default = "default_retry_delay")]
    pub delay_seconds: u64,
}

/// Base retry delay when a policy names none
pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 1;

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECONDS
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), capped at `max`
    pub fn delay_for(&self, retry: u32, max: Duration) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        let delay = Duration::from_secs(self.delay_seconds.saturating_mul(factor));
        delay.min(max)
    }
}

/// A single command line, optionally with a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CommandDef")]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub run: String,
}

impl Command {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            name: None,
            run: run.into(),
        }
    }

    /// Label for progress output: the name, or the first line of the command
    pub fn label(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self.run.lines().next().unwrap_or_default(),
        }
    }
}

/// Accepted document forms: `- make build` or `- { name: Build, run: make build }`
#[derive(Deserialize)]
#[serde(untagged)]
enum CommandDef {
    Line(String),
    Named {
        #[serde(default)]
        name: Option<String>,
        run: String,
    },
}

impl From<CommandDef> for Command {
    fn from(def: CommandDef) -> Self {
        match def {
            CommandDef::Line(run) => Command { name: None, run },
            CommandDef::Named { name, run } => Command { name, run },
        }
    }
}

fn deserialize_jobs<'de, D>(deserializer: D) -> Result<Vec<Job>, D::Error>
where
    D: Deserializer<'de>,
{
    struct JobsVisitor;

    impl<'de> Visitor<'de> for JobsVisitor {
        type Value = Vec<Job>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of job ids to job definitions")
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut jobs: Vec<Job> = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((id, mut job)) = map.next_entry::<String, Job>()? {
                if jobs.iter().any(|existing| existing.id == id) {
                    return Err(de::Error::custom(format_args!(
                        "job '{}' is declared more than once",
                        id
                    )));
                }
                job.id = id;
                jobs.push(job);
            }
            Ok(jobs)
        }
    }

    deserializer.deserialize_map(JobsVisitor)
}

fn serialize_jobs<S>(jobs: &[Job], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_map(jobs.iter().map(|job| (&job.id, job)))
}
