//! Spawns child processes for tool calls and settles their output. The
//! subtle part is settlement: a subshell can fork a long-lived child that
//! keeps the stdio pipes open after the command itself exits, so the runner
//! finalises either when both streams reach EOF or when a short grace window
//! after exit expires.

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Notify;

use crate::error::LoafErr;
use crate::error::Result;
use crate::ring::RingBuffer;

/// Per-stream capture cap, in characters. Older output is dropped from the
/// front and flagged as truncated.
pub const MAX_CAPTURE_CHARS: usize = 300_000;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(1200);

/// How long to keep draining the pipes after the child has exited before
/// giving up on a `close`.
const EXIT_CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Delay between the polite SIGTERM and the SIGKILL follow-up.
const KILL_ESCALATION_DELAY: Duration = Duration::from_millis(1500);

/// Notified when the caller wants the child gone.
pub type CancelSignal = Arc<Notify>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinPolicy {
    /// No stdin descriptor at all; commands that probe stdin see EOF rather
    /// than hanging (foreground tool calls).
    Ignore,
    /// Keep a pipe open for later writes (background pipe sessions).
    Pipe,
}

#[derive(Debug, Clone)]
pub struct ProcessRunRequest {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    /// Overlay on top of the parent environment.
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CapturedStream {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug)]
pub struct ProcessRunResult {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub duration: Duration,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub timed_out: bool,
    pub aborted: bool,
}

/// Build a `tokio::process::Command` honoring the cwd, env overlay, and
/// stdio policy.
pub(crate) fn build_command(
    command: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    stdin: StdinPolicy,
) -> Result<Command> {
    let Some(program) = command.first() else {
        return Err(LoafErr::InvalidInput("command args are empty".to_string()));
    };
    let mut cmd = Command::new(program);
    cmd.args(&command[1..]);
    cmd.current_dir(cwd);

    // Overlay rather than env_clear(): the child keeps the parent environment
    // except where the caller overrides a value.
    let mut remaining_overrides = env.clone();
    for (key, current_val) in std::env::vars() {
        if let Some(desired_val) = remaining_overrides.remove(&key)
            && desired_val != current_val
        {
            cmd.env(&key, desired_val);
        }
    }
    for (key, val) in remaining_overrides {
        cmd.env(key, val);
    }

    match stdin {
        StdinPolicy::Ignore => {
            cmd.stdin(Stdio::null());
        }
        StdinPolicy::Pipe => {
            cmd.stdin(Stdio::piped());
        }
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    Ok(cmd)
}

/// Run a child to completion, capturing both streams into bounded rings.
///
/// On timeout or cancellation the child is sent SIGTERM immediately and
/// SIGKILL after 1.5 s; the result is flagged accordingly rather than turned
/// into an error, so callers always get whatever output was produced.
pub async fn run_process(
    request: ProcessRunRequest,
    cancel: Option<CancelSignal>,
) -> Result<ProcessRunResult> {
    let start = Instant::now();
    let mut cmd = build_command(&request.command, &request.cwd, &request.env, StdinPolicy::Ignore)?;
    let mut child = cmd.kill_on_drop(true).spawn()?;

    let stdout_reader = child.stdout.take().ok_or(LoafErr::Spawn)?;
    let stderr_reader = child.stderr.take().ok_or(LoafErr::Spawn)?;

    let stdout_ring = Arc::new(StdMutex::new(RingBuffer::new(MAX_CAPTURE_CHARS)));
    let stderr_ring = Arc::new(StdMutex::new(RingBuffer::new(MAX_CAPTURE_CHARS)));
    let stdout_task = tokio::spawn(drain_into_ring(stdout_reader, Arc::clone(&stdout_ring)));
    let stderr_task = tokio::spawn(drain_into_ring(stderr_reader, Arc::clone(&stderr_ring)));

    let timeout = request
        .timeout
        .unwrap_or(DEFAULT_TIMEOUT)
        .min(MAX_TIMEOUT);

    let mut timed_out = false;
    let mut aborted = false;
    let exit_status = tokio::select! {
        status = child.wait() => status?,
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            terminate_child(&mut child).await?
        }
        _ = cancelled(cancel.as_ref()) => {
            aborted = true;
            terminate_child(&mut child).await?
        }
    };

    // `exit` observed; give `close` a short grace window so a forked child
    // holding the pipes open cannot hang the settle.
    let drain_both = async {
        let _ = stdout_task.await;
        let _ = stderr_task.await;
    };
    let _ = tokio::time::timeout(EXIT_CLOSE_GRACE, drain_both).await;

    let stdout = snapshot(&stdout_ring);
    let stderr = snapshot(&stderr_ring);

    #[cfg(unix)]
    let signal = exit_status.signal();
    #[cfg(not(unix))]
    let signal = None;

    Ok(ProcessRunResult {
        exit_code: exit_status.code().unwrap_or(-1),
        signal,
        duration: start.elapsed(),
        stdout,
        stderr,
        timed_out,
        aborted,
    })
}

async fn cancelled(cancel: Option<&CancelSignal>) {
    match cancel {
        Some(cancel) => cancel.notified().await,
        None => std::future::pending().await,
    }
}

/// SIGTERM now, SIGKILL after the escalation delay, then reap.
async fn terminate_child(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    send_sigterm(child);
    match tokio::time::timeout(KILL_ESCALATION_DELAY, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            child.start_kill()?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
pub(crate) fn send_sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        // Best effort; the SIGKILL escalation covers a missed delivery.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn send_sigterm(child: &Child) {
    // No SIGTERM equivalent; the escalation path does the termination.
    let _ = child;
}

async fn drain_into_ring<R: AsyncRead + Unpin>(mut reader: R, ring: Arc<StdMutex<RingBuffer>>) {
    let mut buf = [0u8; 8192];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = crate::background::stream::decode_lossy_chunk(&mut carry, &buf[..n]);
                if let Ok(mut guard) = ring.lock() {
                    guard.append(&text);
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "stream reader stopped");
                break;
            }
        }
    }
    if !carry.is_empty() {
        let text = String::from_utf8_lossy(&carry).into_owned();
        if let Ok(mut guard) = ring.lock() {
            guard.append(&text);
        }
    }
}

fn snapshot(ring: &Arc<StdMutex<RingBuffer>>) -> CapturedStream {
    match ring.lock() {
        Ok(guard) => CapturedStream {
            text: guard.tail().to_string(),
            truncated: guard.is_truncated(),
        },
        Err(_) => CapturedStream {
            text: String::new(),
            truncated: false,
        },
    }
}
