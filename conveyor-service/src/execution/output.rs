// Job Output Capture
// Streams redacted output to a log file, keeps a bounded tail and stages published artifacts

use crate::artifacts::is_valid_key;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};

use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

const PUBLISH_PREFIX: &str = "##conveyor[publish key=";

/// Parse `##conveyor[publish key=<key>]<value>` into `(key, value)`
pub fn parse_publish_command(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start().strip_prefix(PUBLISH_PREFIX)?;
    let (key, value) = rest.split_once(']')?;
    let key = key.trim();
    if is_valid_key(key) {
        Some((key, value.trim_end()))
    } else {
        None
    }
}

/// Sink for one job's output across all of its attempts
pub struct OutputCapture {
    job_id: String,
    log: Option<BufWriter<File>>,
    log_path: Option<PathBuf>,
    tail: VecDeque<String>,
    tail_limit: usize,
    staged: Vec<(String, String)>,
    progress: Option<ProgressSender>,
}

impl OutputCapture {
    /// Create a capture; when `log_path` is given its parent directory is created
    pub async fn open(
        job_id: impl Into<String>,
        log_path: Option<PathBuf>,
        tail_limit: usize,
        progress: Option<ProgressSender>,
    ) -> std::io::Result<Self> {
        let log = match &log_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                Some(BufWriter::new(File::create(path).await?))
            }
            None => None,
        };

        Ok(Self {
            job_id: job_id.into(),
            log,
            log_path,
            tail: VecDeque::with_capacity(tail_limit),
            tail_limit,
            staged: Vec::new(),
            progress,
        })
    }

    /// Capture without a log file
    pub fn in_memory(
        job_id: impl Into<String>,
        tail_limit: usize,
        progress: Option<ProgressSender>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            log: None,
            log_path: None,
            tail: VecDeque::with_capacity(tail_limit),
            tail_limit,
            staged: Vec::new(),
            progress,
        }
    }

    /// Record one already-redacted output line
    ///
    /// The tail, progress event and artifact staging are updated even when the
    /// log write fails.
    pub async fn record(&mut self, line: &str, is_error: bool) -> std::io::Result<()> {
        if self.tail_limit > 0 {
            if self.tail.len() == self.tail_limit {
                self.tail.pop_front();
            }
            self.tail.push_back(line.to_string());
        }

        self.progress
            .send_event(ExecutionEvent::job_output(&self.job_id, line, is_error));

        if !is_error {
            if let Some((key, value)) = parse_publish_command(line) {
                self.stage(key, value);
            }
        }

        self.write_log(line).await
    }

    /// Write a marker line (attempt boundaries, failures) to the log only
    pub async fn note(&mut self, text: &str) -> std::io::Result<()> {
        self.write_log(&format!("##[conveyor] {}", text)).await
    }

    async fn write_log(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;
        }
        Ok(())
    }

    fn stage(&mut self, key: &str, value: &str) {
        if self.staged.iter().any(|(k, _)| k == key) {
            tracing::warn!(
                job = %self.job_id,
                key,
                "artifact published more than once in one attempt; keeping the first value"
            );
            return;
        }
        self.staged.push((key.to_string(), value.to_string()));
    }

    /// Artifacts staged by the current attempt
    pub fn staged(&self) -> &[(String, String)] {
        &self.staged
    }

    /// Drop values staged by a failed attempt
    pub fn discard_staged(&mut self) {
        self.staged.clear();
    }

    pub fn take_staged(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.staged)
    }

    /// Flush the log and return its path together with the output tail
    pub async fn finish(mut self) -> std::io::Result<(Option<PathBuf>, Vec<String>)> {
        if let Some(log) = self.log.as_mut() {
            log.flush().await?;
        }
        Ok((self.log_path, self.tail.into_iter().collect()))
    }
}
