// Child process plumbing shared by the runners

use super::{CommandOutcome, OutputLine, OutputSender, RunnerError};

use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest output segment forwarded as one line; longer runs are split
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Resolve `program` on PATH, keeping the bare name when it cannot be found
pub(crate) fn resolve_program(program: &str) -> std::path::PathBuf {
    which::which(program).unwrap_or_else(|_| program.into())
}

/// Spawn `cmd`, forward its stdout/stderr line by line and wait for it to exit
/// or for `cancel` to fire, whichever comes first.
///
/// The child leads its own process group. Cancellation kills the whole group,
/// so background processes started by the command go down with it.
pub(crate) async fn run_streaming(
    mut cmd: Command,
    program: &str,
    output: &OutputSender,
    cancel: &CancellationToken,
) -> Result<CommandOutcome, RunnerError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        program: program.to_string(),
        source,
    })?;
    let group = child.id();

    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(stdout, false, output.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(stderr, true, output.clone())));
    }

    let (exit_code, mut cancelled) = tokio::select! {
        status = child.wait() => (status?.code(), false),
        _ = cancel.cancelled() => {
            kill_group(group, program).await;
            if let Err(e) = child.kill().await {
                tracing::warn!(program, error = %e, "failed to kill cancelled command");
            }
            (None, true)
        }
    };

    if !cancelled {
        // Background processes may still hold the pipes open after the child exits
        let drain = async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        };
        tokio::select! {
            _ = drain => {}
            _ = cancel.cancelled() => {
                kill_group(group, program).await;
                cancelled = true;
            }
        }
    }
    for reader in &readers {
        reader.abort();
    }

    Ok(CommandOutcome {
        exit_code,
        duration: start.elapsed(),
        cancelled,
    })
}

/// Send SIGKILL to every process in the group led by `group`
#[cfg(unix)]
async fn kill_group(group: Option<u32>, program: &str) {
    let Some(pgid) = group else { return };
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{}", pgid)])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            tracing::debug!(program, pgid, "killed process group")
        }
        // The group may already be gone
        Ok(status) => tracing::debug!(program, pgid, %status, "process group kill had no effect"),
        Err(e) => tracing::warn!(program, pgid, error = %e, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
async fn kill_group(_group: Option<u32>, _program: &str) {}

/// Forward output split on `\n` or `\r`, flushing segments longer than
/// [`MAX_LINE_BYTES`]. Lines are decoded lossily so that binary output cannot
/// stall the reader.
async fn forward_lines<R>(reader: R, is_error: bool, output: OutputSender)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut segment: Vec<u8> = Vec::new();
    let mut after_cr = false;

    loop {
        let buf = match reader.fill_buf().await {
            Ok(buf) if !buf.is_empty() => buf,
            _ => break,
        };

        let (consumed, flush) = match buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
            Some(end) => {
                let terminator = buf[end];
                // `\r\n` ends one line, not two
                let crlf_tail = terminator == b'\n' && end == 0 && segment.is_empty() && after_cr;
                segment.extend_from_slice(&buf[..end]);
                after_cr = terminator == b'\r';
                (end + 1, !crlf_tail)
            }
            None => {
                let take = buf.len().min(MAX_LINE_BYTES - segment.len());
                segment.extend_from_slice(&buf[..take]);
                after_cr = false;
                (take, segment.len() >= MAX_LINE_BYTES)
            }
        };
        reader.consume(consumed);

        if flush && !send_line(&output, &mut segment, is_error) {
            return;
        }
    }

    if !segment.is_empty() {
        send_line(&output, &mut segment, is_error);
    }
}

fn send_line(output: &OutputSender, segment: &mut Vec<u8>, is_error: bool) -> bool {
    let line = OutputLine {
        text: String::from_utf8_lossy(segment).into_owned(),
        is_error,
    };
    segment.clear();
    output.send(line).is_ok()
}
