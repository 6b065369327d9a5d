//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            out.push_str(&format!(
                "\n[stdout truncated {} bytes]",
                self.stdout_truncated
            ));
        }
        out
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Turn a timeout, cancellation or non-zero exit into an error naming `label`.
    pub fn ensure_success(&self, label: &str) -> Result<()> {
        if self.timed_out {
            return Err(anyhow!("{label} timed out"));
        }
        if self.cancelled {
            return Err(anyhow!("{label} cancelled"));
        }
        if !self.status.success() {
            let stderr = self.stderr_lossy();
            return Err(match self.status.code() {
                Some(code) if stderr.is_empty() => anyhow!("{label} exited with code {code}"),
                Some(code) => anyhow!("{label} exited with code {code}: {stderr}"),
                None => anyhow!("{label} terminated by signal"),
            });
        }
        Ok(())
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and output is read concurrently while the child runs.
/// `output_limit_bytes` bounds the amount of stdout/stderr stored in memory (bytes beyond this
/// are discarded while still draining the pipe). The child is killed when `timeout` elapses or
/// when `cancel` fires.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&CancellationToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                // A child that exits without reading stdin yields a broken pipe; not an error here.
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "stdin write ended early");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = match cancel {
            Some(_) => remaining.min(CANCEL_POLL_INTERVAL),
            None => remaining,
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            warn!("command cancelled, killing");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        child.kill().context("kill command")?;
        break child.wait().context("wait command after kill")?;
    };

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
