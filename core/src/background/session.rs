//! A single long-lived background shell session. The transport (PTY or
//! plain pipes) is fixed at creation; output is pumped into the session's
//! stream states by reader tasks, and the exit transition is observed by a
//! dedicated wait task.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::background::sanitize::PtySanitizer;
use crate::background::stream::StreamState;
use crate::background::stream::decode_lossy_chunk;
use crate::error::LoafErr;
use crate::error::Result;
use crate::exec::StdinPolicy;
use crate::shell::ResolvedShell;
use crate::shell::ShellTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Pipe,
    Pty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

#[derive(Debug, Clone, Copy)]
pub enum KillMode {
    /// SIGTERM (or the closest platform equivalent).
    Graceful,
    /// SIGKILL.
    Force,
}

/// Mutable session state, touched by reader/wait tasks and by reads.
pub(crate) struct SessionInner {
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub last_activity_iso: String,
    pub cols: u16,
    pub rows: u16,
    pub stdout: StreamState,
    pub stderr: StreamState,
}

enum TransportHandle {
    Pty {
        writer_tx: mpsc::Sender<Vec<u8>>,
        master: StdMutex<Box<dyn portable_pty::MasterPty + Send>>,
        killer: StdMutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>,
    },
    Pipe {
        stdin_tx: mpsc::Sender<Vec<u8>>,
        kill_tx: mpsc::Sender<KillMode>,
    },
}

pub struct BackgroundSession {
    pub id: SessionId,
    pub name: Option<String>,
    pub created_at_iso: String,
    pub cwd: PathBuf,
    pub shell_tag: ShellTag,
    pub shell_program: PathBuf,
    pub command: String,
    pub pid: Option<u32>,
    pub transport: Transport,
    pub full_terminal: bool,
    pub(crate) inner: Arc<StdMutex<SessionInner>>,
    handle: TransportHandle,
}

fn now_iso() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn new_inner(cols: u16, rows: u16) -> Arc<StdMutex<SessionInner>> {
    Arc::new(StdMutex::new(SessionInner {
        status: SessionStatus::Running,
        exit_code: None,
        signal: None,
        last_activity_iso: now_iso(),
        cols,
        rows,
        stdout: StreamState::new(),
        stderr: StreamState::new(),
    }))
}

fn mark_exited(inner: &Arc<StdMutex<SessionInner>>, exit_code: Option<i32>, signal: Option<i32>) {
    if let Ok(mut guard) = inner.lock() {
        guard.status = SessionStatus::Exited;
        guard.exit_code = exit_code;
        guard.signal = signal;
        guard.last_activity_iso = now_iso();
    }
}

/// On Windows a PTY child spawned with a scrubbed environment cannot find
/// system binaries; keep `Path`, `SystemRoot`, and `ComSpec` from the parent
/// when the caller's overrides dropped them.
#[cfg(windows)]
fn rehydrate_windows_env(env: &mut HashMap<String, String>) {
    for variants in [["Path", "PATH"], ["SystemRoot", "SYSTEMROOT"], ["ComSpec", "COMSPEC"]] {
        let present = variants
            .iter()
            .any(|name| env.keys().any(|k| k.eq_ignore_ascii_case(name)));
        if present {
            continue;
        }
        for name in variants {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.to_string(), value);
                break;
            }
        }
    }
}

impl BackgroundSession {
    /// Spawn a PTY-backed session running `command` under the resolved shell.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn_pty(
        id: SessionId,
        name: Option<String>,
        shell: &ResolvedShell,
        command: &str,
        cwd: PathBuf,
        env: HashMap<String, String>,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Self>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| std::io::Error::other(err.to_string()))?;

        let argv = shell.command_argv(command);
        let mut builder = CommandBuilder::new(&argv[0]);
        for arg in &argv[1..] {
            builder.arg(arg);
        }
        builder.cwd(&cwd);
        #[cfg(windows)]
        let env = {
            let mut env = env;
            rehydrate_windows_env(&mut env);
            env
        };
        for (key, value) in &env {
            builder.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        let killer = child.clone_killer();
        let pid = child.process_id();

        let inner = new_inner(cols, rows);

        // Reader: drain the PTY on a blocking thread, sanitize, append.
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        let reader_inner = Arc::clone(&inner);
        tokio::task::spawn_blocking(move || {
            let mut sanitizer = PtySanitizer::new();
            let mut carry: Vec<u8> = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let decoded = decode_lossy_chunk(&mut carry, &buf[..n]);
                        let clean = sanitizer.feed(&decoded);
                        if clean.is_empty() {
                            continue;
                        }
                        if let Ok(mut guard) = reader_inner.lock() {
                            guard.stdout.append(&clean);
                            guard.last_activity_iso = now_iso();
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                        continue;
                    }
                    Err(_) => break,
                }
            }
        });

        // Writer: apply stdin writes to the PTY master.
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
        let writer = Arc::new(StdMutex::new(writer));
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = Arc::clone(&writer);
                let _ = tokio::task::spawn_blocking(move || {
                    if let Ok(mut guard) = writer.lock() {
                        use std::io::Write;
                        let _ = guard.write_all(&bytes);
                        let _ = guard.flush();
                    }
                })
                .await;
            }
        });

        // Wait: observe the exit transition.
        let wait_inner = Arc::clone(&inner);
        tokio::task::spawn_blocking(move || {
            let exit_code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(_) => None,
            };
            mark_exited(&wait_inner, exit_code, None);
        });

        Ok(Arc::new(Self {
            id,
            name,
            created_at_iso: now_iso(),
            cwd,
            shell_tag: shell.tag,
            shell_program: shell.program.clone(),
            command: command.to_string(),
            pid,
            transport: Transport::Pty,
            full_terminal: true,
            inner,
            handle: TransportHandle::Pty {
                writer_tx,
                master: StdMutex::new(pair.master),
                killer: StdMutex::new(killer),
            },
        }))
    }

    /// Spawn a pipe-backed session with separate stdout/stderr capture.
    pub(crate) fn spawn_pipe(
        id: SessionId,
        name: Option<String>,
        shell: &ResolvedShell,
        command: &str,
        cwd: PathBuf,
        env: HashMap<String, String>,
    ) -> Result<Arc<Self>> {
        let argv = shell.command_argv(command);
        let mut cmd = crate::exec::build_command(&argv, &cwd, &env, StdinPolicy::Pipe)?;
        let mut child = cmd.kill_on_drop(true).spawn()?;
        let pid = child.id();

        let inner = new_inner(0, 0);

        let stdout = child.stdout.take().ok_or(LoafErr::Spawn)?;
        let stderr = child.stderr.take().ok_or(LoafErr::Spawn)?;
        spawn_pipe_reader(stdout, Arc::clone(&inner), true);
        spawn_pipe_reader(stderr, Arc::clone(&inner), false);

        let mut stdin = child.stdin.take().ok_or(LoafErr::Spawn)?;
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(128);
        tokio::spawn(async move {
            while let Some(bytes) = stdin_rx.recv().await {
                if stdin.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        // Wait task doubling as the kill executor, so `Child` stays single-owner.
        let (kill_tx, mut kill_rx) = mpsc::channel::<KillMode>(4);
        let wait_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => {
                                #[cfg(unix)]
                                let signal = {
                                    use std::os::unix::process::ExitStatusExt;
                                    status.signal()
                                };
                                #[cfg(not(unix))]
                                let signal = None;
                                mark_exited(&wait_inner, status.code(), signal);
                            }
                            Err(_) => mark_exited(&wait_inner, None, None),
                        }
                        break;
                    }
                    Some(mode) = kill_rx.recv() => {
                        match mode {
                            KillMode::Graceful => {
                                #[cfg(unix)]
                                if let Some(pid) = child.id() {
                                    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM); }
                                }
                                #[cfg(not(unix))]
                                let _ = child.start_kill();
                            }
                            KillMode::Force => {
                                let _ = child.start_kill();
                            }
                        }
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            id,
            name,
            created_at_iso: now_iso(),
            cwd,
            shell_tag: shell.tag,
            shell_program: shell.program.clone(),
            command: command.to_string(),
            pid,
            transport: Transport::Pipe,
            full_terminal: false,
            inner,
            handle: TransportHandle::Pipe { stdin_tx, kill_tx },
        }))
    }

    pub fn status(&self) -> SessionStatus {
        self.inner
            .lock()
            .map(|guard| guard.status)
            .unwrap_or(SessionStatus::Exited)
    }

    /// Queue input bytes for the child (PTY master or pipe stdin).
    pub(crate) async fn write_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        let sender = match &self.handle {
            TransportHandle::Pty { writer_tx, .. } => writer_tx,
            TransportHandle::Pipe { stdin_tx, .. } => stdin_tx,
        };
        sender
            .send(bytes)
            .await
            .map_err(|_| LoafErr::NotFound(format!("session {} is no longer writable", self.id)))?;
        if let Ok(mut guard) = self.inner.lock() {
            guard.last_activity_iso = now_iso();
        }
        Ok(())
    }

    /// Resize the terminal. Pipe sessions have no terminal to resize.
    pub(crate) fn resize(&self, cols: u16, rows: u16) -> Result<(u16, u16)> {
        let TransportHandle::Pty { master, .. } = &self.handle else {
            return Err(LoafErr::Unsupported(
                "resize is only supported for full_terminal sessions".to_string(),
            ));
        };
        let master = master
            .lock()
            .map_err(|_| std::io::Error::other("pty master poisoned"))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        if let Ok(mut guard) = self.inner.lock() {
            guard.cols = cols;
            guard.rows = rows;
            guard.last_activity_iso = now_iso();
        }
        Ok((cols, rows))
    }

    /// Deliver a termination signal. The exit transition itself is observed
    /// asynchronously by the wait task.
    pub(crate) fn deliver_kill(&self, mode: KillMode) {
        match &self.handle {
            TransportHandle::Pty { killer, .. } => {
                match mode {
                    KillMode::Graceful => {
                        #[cfg(unix)]
                        if let Some(pid) = self.pid {
                            unsafe {
                                libc::kill(pid as libc::pid_t, libc::SIGTERM);
                            }
                            return;
                        }
                        if let Ok(mut killer) = killer.lock() {
                            let _ = killer.kill();
                        }
                    }
                    KillMode::Force => {
                        #[cfg(unix)]
                        if let Some(pid) = self.pid {
                            unsafe {
                                libc::kill(pid as libc::pid_t, libc::SIGKILL);
                            }
                            return;
                        }
                        if let Ok(mut killer) = killer.lock() {
                            let _ = killer.kill();
                        }
                    }
                }
            }
            TransportHandle::Pipe { kill_tx, .. } => {
                let _ = kill_tx.try_send(mode);
            }
        }
    }
}

fn spawn_pipe_reader<R>(mut reader: R, inner: Arc<StdMutex<SessionInner>>, is_stdout: bool)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut carry: Vec<u8> = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let decoded = decode_lossy_chunk(&mut carry, &buf[..n]);
                    if decoded.is_empty() {
                        continue;
                    }
                    if let Ok(mut guard) = inner.lock() {
                        let stream = if is_stdout {
                            &mut guard.stdout
                        } else {
                            &mut guard.stderr
                        };
                        stream.append(&decoded);
                        guard.last_activity_iso = now_iso();
                    }
                }
                Err(_) => break,
            }
        }
    });
}
