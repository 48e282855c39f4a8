//! Registry of long-lived background shell sessions: start/read/write/
//! resize/stop/list, plus process-exit cleanup. Sessions outlive individual
//! tool calls; reads are incremental and cursor-based.

pub mod keys;
pub mod sanitize;
pub mod session;
pub mod stream;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::background::keys::key_sequence;
use crate::background::session::BackgroundSession;
use crate::background::session::KillMode;
use crate::background::session::SessionId;
use crate::background::session::SessionStatus;
use crate::background::session::Transport;
use crate::background::stream::StreamRead;
use crate::error::LoafErr;
use crate::error::Result;
use crate::shell::ShellTag;
use crate::shell::resolve_shell;

pub const DEFAULT_TERMINAL_COLS: u16 = 120;
pub const DEFAULT_TERMINAL_ROWS: u16 = 36;
pub const MIN_TERMINAL_COLS: u16 = 40;
pub const MAX_TERMINAL_COLS: u16 = 400;
pub const MIN_TERMINAL_ROWS: u16 = 10;
pub const MAX_TERMINAL_ROWS: u16 = 200;

pub const DEFAULT_READ_CHARS: usize = 8_000;
pub const MAX_READ_CHARS: usize = 120_000;

pub const MAX_KEY_REPEAT: u32 = 100;

const STOP_GRACE: Duration = Duration::from_millis(120);
const STOP_GRACE_FORCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub command: String,
    pub session_name: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Allocate a pseudo-terminal (the default for background sessions).
    pub full_terminal: bool,
    pub terminal_cols: Option<u16>,
    pub terminal_rows: Option<u16>,
    /// Hand back an existing running session that matches name, cwd, and
    /// full-terminal flag instead of spawning a new one.
    pub reuse_session: bool,
    pub shell: Option<ShellTag>,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            command: String::new(),
            session_name: None,
            cwd: None,
            env: HashMap::new(),
            full_terminal: true,
            terminal_cols: None,
            terminal_rows: None,
            reuse_session: false,
            shell: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSelector {
    Both,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub stream: StreamSelector,
    pub max_chars: Option<usize>,
    pub peek: bool,
}

impl Default for ReadRequest {
    fn default() -> Self {
        Self {
            stream: StreamSelector::Both,
            max_chars: None,
            peek: false,
        }
    }
}

#[derive(Debug)]
pub struct ReadResponse {
    pub id: SessionId,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Option<StreamRead>,
    pub stderr: Option<StreamRead>,
}

#[derive(Debug, Clone, Default)]
pub struct WriteRequest {
    pub input: Option<String>,
    pub append_newline: bool,
    pub key: Option<String>,
    /// Repeat count for a key sequence, 1..=100.
    pub repeat: Option<u32>,
}

/// Serializable snapshot of a session for listings and tool output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: u32,
    pub name: Option<String>,
    pub created_at_iso: String,
    pub last_activity_iso: String,
    pub cwd: PathBuf,
    pub shell: ShellTag,
    pub command: String,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub transport: Transport,
    pub full_terminal: bool,
    pub cols: u16,
    pub rows: u16,
    pub stdout_unread: u64,
    pub stderr_unread: u64,
}

#[derive(Debug)]
pub struct StartOutcome {
    pub session: SessionSummary,
    pub reused: bool,
}

#[derive(Default)]
pub struct SessionManager {
    next_session_id: AtomicU32,
    sessions: StdMutex<HashMap<u32, Arc<BackgroundSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome> {
        if request.command.trim().is_empty() {
            return Err(LoafErr::InvalidInput(
                "command must be a non-empty string".to_string(),
            ));
        }
        let cwd = match &request.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir()?,
        };

        if request.reuse_session
            && let Some(name) = &request.session_name
            && let Some(existing) = self.find_reusable(name, &cwd, request.full_terminal)
        {
            return Ok(StartOutcome {
                session: summarize(&existing),
                reused: true,
            });
        }

        let shell = resolve_shell(request.shell)?;
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::SeqCst));
        let cols = clamp_cols(request.terminal_cols.unwrap_or(DEFAULT_TERMINAL_COLS));
        let rows = clamp_rows(request.terminal_rows.unwrap_or(DEFAULT_TERMINAL_ROWS));

        let session = if request.full_terminal {
            BackgroundSession::spawn_pty(
                id,
                request.session_name.clone(),
                &shell,
                &request.command,
                cwd,
                request.env.clone(),
                cols,
                rows,
            )?
        } else {
            BackgroundSession::spawn_pipe(
                id,
                request.session_name.clone(),
                &shell,
                &request.command,
                cwd,
                request.env.clone(),
            )?
        };

        tracing::debug!(id = %id, command = %request.command, pty = request.full_terminal, "background session started");
        let summary = summarize(&session);
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(id.0, session);
        }
        Ok(StartOutcome {
            session: summary,
            reused: false,
        })
    }

    /// A mismatched full-terminal flag forces a new session: the transport of
    /// an existing session can never change.
    fn find_reusable(
        &self,
        name: &str,
        cwd: &Path,
        full_terminal: bool,
    ) -> Option<Arc<BackgroundSession>> {
        let sessions = self.sessions.lock().ok()?;
        sessions
            .values()
            .find(|session| {
                session.name.as_deref() == Some(name)
                    && session.cwd == *cwd
                    && session.full_terminal == full_terminal
                    && session.status() == SessionStatus::Running
            })
            .cloned()
    }

    fn get(&self, id: SessionId) -> Result<Arc<BackgroundSession>> {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(&id.0).cloned())
            .ok_or_else(|| LoafErr::NotFound(format!("unknown session id {id}")))
    }

    pub fn read(&self, id: SessionId, request: ReadRequest) -> Result<ReadResponse> {
        let session = self.get(id)?;
        let max_chars = request
            .max_chars
            .unwrap_or(DEFAULT_READ_CHARS)
            .min(MAX_READ_CHARS);

        let mut guard = session
            .inner
            .lock()
            .map_err(|_| std::io::Error::other("session state poisoned"))?;
        let want_stdout = matches!(request.stream, StreamSelector::Both | StreamSelector::Stdout);
        let want_stderr = matches!(request.stream, StreamSelector::Both | StreamSelector::Stderr);
        let stdout = want_stdout.then(|| guard.stdout.read(max_chars, request.peek));
        let stderr = want_stderr.then(|| guard.stderr.read(max_chars, request.peek));

        Ok(ReadResponse {
            id,
            status: guard.status,
            exit_code: guard.exit_code,
            signal: guard.signal,
            stdout,
            stderr,
        })
    }

    pub async fn write(&self, id: SessionId, request: WriteRequest) -> Result<()> {
        let session = self.get(id)?;
        let bytes = resolve_write_bytes(&request)?;
        session.write_bytes(bytes).await
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<(u16, u16)> {
        let session = self.get(id)?;
        session.resize(clamp_cols(cols), clamp_rows(rows))
    }

    /// Signal the session and give it a short grace period; the exit itself
    /// is recorded asynchronously by the session's wait task.
    pub async fn stop(&self, id: SessionId, force: bool) -> Result<()> {
        let session = self.get(id)?;
        if force {
            session.deliver_kill(KillMode::Force);
            tokio::time::sleep(STOP_GRACE_FORCE).await;
        } else {
            session.deliver_kill(KillMode::Graceful);
            tokio::time::sleep(STOP_GRACE).await;
        }
        Ok(())
    }

    /// Drop an exited session from the registry. Running sessions must be
    /// stopped first.
    pub fn prune(&self, id: SessionId) -> Result<()> {
        let session = self.get(id)?;
        if session.status() == SessionStatus::Running {
            return Err(LoafErr::InvalidInput(format!(
                "session {id} is still running; stop it before pruning"
            )));
        }
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(&id.0);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let Ok(sessions) = self.sessions.lock() else {
            return Vec::new();
        };
        let mut summaries: Vec<SessionSummary> = sessions.values().map(|s| summarize(s)).collect();
        summaries.sort_by_key(|summary| summary.id);
        summaries
    }

    /// Best-effort SIGTERM of every running session; called on process exit.
    pub fn shutdown_all(&self) {
        let Ok(sessions) = self.sessions.lock() else {
            return;
        };
        for session in sessions.values() {
            if session.status() == SessionStatus::Running {
                session.deliver_kill(KillMode::Graceful);
            }
        }
    }
}

fn clamp_cols(cols: u16) -> u16 {
    cols.clamp(MIN_TERMINAL_COLS, MAX_TERMINAL_COLS)
}

fn clamp_rows(rows: u16) -> u16 {
    rows.clamp(MIN_TERMINAL_ROWS, MAX_TERMINAL_ROWS)
}

fn resolve_write_bytes(request: &WriteRequest) -> Result<Vec<u8>> {
    if let Some(key) = &request.key {
        let sequence = key_sequence(key).ok_or_else(|| {
            LoafErr::Unsupported(format!("unknown special key '{key}'"))
        })?;
        let repeat = request.repeat.unwrap_or(1);
        if repeat == 0 || repeat > MAX_KEY_REPEAT {
            return Err(LoafErr::InvalidInput(format!(
                "repeat must be between 1 and {MAX_KEY_REPEAT}"
            )));
        }
        return Ok(sequence.repeat(repeat as usize).into_bytes());
    }
    if let Some(input) = &request.input {
        let mut text = input.clone();
        if request.append_newline {
            text.push('\n');
        }
        return Ok(text.into_bytes());
    }
    Err(LoafErr::InvalidInput(
        "write requires either input text or a key name".to_string(),
    ))
}

fn summarize(session: &Arc<BackgroundSession>) -> SessionSummary {
    let (
        status,
        exit_code,
        signal,
        last_activity_iso,
        cols,
        rows,
        stdout_unread,
        stderr_unread,
    ) = match session.inner.lock() {
        Ok(guard) => (
            guard.status,
            guard.exit_code,
            guard.signal,
            guard.last_activity_iso.clone(),
            guard.cols,
            guard.rows,
            guard.stdout.unread_chars(),
            guard.stderr.unread_chars(),
        ),
        Err(_) => (SessionStatus::Exited, None, None, String::new(), 0, 0, 0, 0),
    };
    SessionSummary {
        id: session.id.0,
        name: session.name.clone(),
        created_at_iso: session.created_at_iso.clone(),
        last_activity_iso,
        cwd: session.cwd.clone(),
        shell: session.shell_tag,
        command: session.command.clone(),
        pid: session.pid,
        status,
        exit_code,
        signal,
        transport: session.transport,
        full_terminal: session.full_terminal,
        cols,
        rows,
        stdout_unread,
        stderr_unread,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn pipe_request(command: &str) -> StartRequest {
        StartRequest {
            command: command.to_string(),
            full_terminal: false,
            ..StartRequest::default()
        }
    }

    async fn read_until<F>(manager: &SessionManager, id: SessionId, mut predicate: F) -> String
    where
        F: FnMut(&str) -> bool,
    {
        let mut collected = String::new();
        for _ in 0..100 {
            let response = manager
                .read(
                    id,
                    ReadRequest {
                        stream: StreamSelector::Stdout,
                        ..ReadRequest::default()
                    },
                )
                .unwrap();
            if let Some(read) = response.stdout {
                collected.push_str(&read.text);
            }
            if predicate(&collected) {
                return collected;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        collected
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipe_session_streams_output_incrementally() {
        let manager = SessionManager::new();
        let outcome = manager
            .start(pipe_request("printf 'first\\n'; sleep 0.2; printf 'second\\n'"))
            .await
            .unwrap();
        assert!(!outcome.reused);
        assert_eq!(outcome.session.transport, Transport::Pipe);

        let id = SessionId(outcome.session.id);
        let collected = read_until(&manager, id, |text| text.contains("second")).await;
        assert_eq!(collected, "first\nsecond\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_peek_reads_advance_and_concatenate() {
        let manager = SessionManager::new();
        let outcome = manager
            .start(pipe_request("printf 'abcdefghij'"))
            .await
            .unwrap();
        let id = SessionId(outcome.session.id);

        // Wait for output to arrive.
        read_until(&manager, id, |text| text.len() >= 10).await;
        // Everything was consumed by the helper; re-start for a cursor test.
        let outcome = manager
            .start(pipe_request("printf 'abcdefghij'"))
            .await
            .unwrap();
        let id = SessionId(outcome.session.id);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let peek = manager
            .read(
                id,
                ReadRequest {
                    stream: StreamSelector::Stdout,
                    max_chars: Some(4),
                    peek: true,
                },
            )
            .unwrap();
        assert_eq!(peek.stdout.unwrap().text, "abcd");

        let first = manager
            .read(
                id,
                ReadRequest {
                    stream: StreamSelector::Stdout,
                    max_chars: Some(4),
                    peek: false,
                },
            )
            .unwrap();
        let second = manager
            .read(
                id,
                ReadRequest {
                    stream: StreamSelector::Stdout,
                    max_chars: Some(100),
                    peek: false,
                },
            )
            .unwrap();
        let first = first.stdout.unwrap();
        let second = second.stdout.unwrap();
        assert_eq!(first.text, "abcd");
        assert!(first.has_more);
        assert_eq!(second.text, "efghij");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stderr_is_captured_separately_for_pipe_sessions() {
        let manager = SessionManager::new();
        let outcome = manager
            .start(pipe_request("printf 'out'; printf 'err' >&2"))
            .await
            .unwrap();
        let id = SessionId(outcome.session.id);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let response = manager.read(id, ReadRequest::default()).unwrap();
        assert_eq!(response.stdout.unwrap().text, "out");
        assert_eq!(response.stderr.unwrap().text, "err");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_is_observed_and_buffers_stay_readable() {
        let manager = SessionManager::new();
        let outcome = manager
            .start(pipe_request("printf 'gone'; exit 5"))
            .await
            .unwrap();
        let id = SessionId(outcome.session.id);

        for _ in 0..100 {
            let response = manager
                .read(
                    id,
                    ReadRequest {
                        stream: StreamSelector::Stdout,
                        peek: true,
                        ..ReadRequest::default()
                    },
                )
                .unwrap();
            if response.status == SessionStatus::Exited {
                assert_eq!(response.exit_code, Some(5));
                // Output is still there after exit.
                let read = manager
                    .read(
                        id,
                        ReadRequest {
                            stream: StreamSelector::Stdout,
                            ..ReadRequest::default()
                        },
                    )
                    .unwrap();
                assert_eq!(read.stdout.unwrap().text, "gone");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session never exited");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pipe_write_reaches_child_stdin() {
        let manager = SessionManager::new();
        let outcome = manager
            .start(pipe_request("read line; printf 'got:%s' \"$line\""))
            .await
            .unwrap();
        let id = SessionId(outcome.session.id);

        manager
            .write(
                id,
                WriteRequest {
                    input: Some("ping".to_string()),
                    append_newline: true,
                    ..WriteRequest::default()
                },
            )
            .await
            .unwrap();

        let collected = read_until(&manager, id, |text| text.contains("got:ping")).await;
        assert!(collected.contains("got:ping"), "collected: {collected:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resize_on_pipe_session_is_unsupported() {
        let manager = SessionManager::new();
        let outcome = manager.start(pipe_request("sleep 5")).await.unwrap();
        let id = SessionId(outcome.session.id);
        let err = manager.resize(id, 100, 30).unwrap_err();
        assert!(matches!(err, LoafErr::Unsupported(_)));
        manager.stop(id, true).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_session_is_not_found() {
        let manager = SessionManager::new();
        let err = manager
            .read(SessionId(999), ReadRequest::default())
            .unwrap_err();
        assert!(matches!(err, LoafErr::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_key_is_unsupported_and_repeat_is_bounded() {
        let err = resolve_write_bytes(&WriteRequest {
            key: Some("warp".to_string()),
            ..WriteRequest::default()
        })
        .unwrap_err();
        assert!(matches!(err, LoafErr::Unsupported(_)));

        let err = resolve_write_bytes(&WriteRequest {
            key: Some("enter".to_string()),
            repeat: Some(101),
            ..WriteRequest::default()
        })
        .unwrap_err();
        assert!(matches!(err, LoafErr::InvalidInput(_)));

        let bytes = resolve_write_bytes(&WriteRequest {
            key: Some("enter".to_string()),
            repeat: Some(3),
            ..WriteRequest::default()
        })
        .unwrap();
        assert_eq!(bytes, b"\r\r\r");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_terminates_a_running_session() {
        let manager = SessionManager::new();
        let outcome = manager.start(pipe_request("sleep 30")).await.unwrap();
        let id = SessionId(outcome.session.id);
        manager.stop(id, false).await.unwrap();

        for _ in 0..100 {
            let response = manager
                .read(
                    id,
                    ReadRequest {
                        peek: true,
                        ..ReadRequest::default()
                    },
                )
                .unwrap();
            if response.status == SessionStatus::Exited {
                manager.prune(id).unwrap();
                assert!(manager.list().is_empty());
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("session did not stop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reuse_matches_name_cwd_and_terminal_flag() {
        let manager = SessionManager::new();
        let mut request = pipe_request("sleep 10");
        request.session_name = Some("worker".to_string());
        let first = manager.start(request.clone()).await.unwrap();

        request.reuse_session = true;
        let second = manager.start(request.clone()).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.session.id, first.session.id);

        // A different full-terminal flag must not match. (PTY allocation can
        // be unavailable in restricted sandboxes, so accept either a fresh
        // session or a spawn error; a reuse hit would be a bug.)
        request.full_terminal = true;
        match manager.start(request).await {
            Ok(outcome) => assert!(!outcome.reused),
            Err(err) => tracing::debug!(%err, "pty unavailable in sandbox"),
        }

        manager.stop(SessionId(first.session.id), true).await.unwrap();
        manager.shutdown_all();
    }

    /// PTY-backed end-to-end: write a line plus the enter key, observe the
    /// echoed value. Skips when the sandbox denies PTY allocation.
    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pty_session_round_trips_input() {
        let manager = SessionManager::new();
        let outcome = manager
            .start(StartRequest {
                command: "read V; printf 'value:%s\\n' \"$V\"".to_string(),
                full_terminal: true,
                ..StartRequest::default()
            })
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                eprintln!("skipping PTY test, allocation failed: {err}");
                return;
            }
        };
        assert_eq!(outcome.session.transport, Transport::Pty);
        assert_eq!(outcome.session.cols, DEFAULT_TERMINAL_COLS);
        assert_eq!(outcome.session.rows, DEFAULT_TERMINAL_ROWS);
        let id = SessionId(outcome.session.id);

        manager
            .write(
                id,
                WriteRequest {
                    input: Some("loaf-pty".to_string()),
                    append_newline: false,
                    ..WriteRequest::default()
                },
            )
            .await
            .unwrap();
        manager
            .write(
                id,
                WriteRequest {
                    key: Some("enter".to_string()),
                    ..WriteRequest::default()
                },
            )
            .await
            .unwrap();

        let collected = read_until(&manager, id, |text| text.contains("value:loaf-pty")).await;
        assert!(
            collected.contains("value:loaf-pty"),
            "collected: {collected:?}"
        );

        // PTY sessions multiplex everything onto stdout; stderr stays empty.
        let response = manager.read(id, ReadRequest::default()).unwrap();
        assert_eq!(response.stderr.unwrap().text, "");
    }
}
