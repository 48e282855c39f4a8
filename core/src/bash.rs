//! One-shot shell execution with a persistent cwd/env baseline. Every command
//! is wrapped so that, after it exits, the shell prints bracketed snapshots of
//! the working directory and environment; the parser lifts those out of
//! stdout and advances the baseline for the next call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use rand::Rng;

use crate::error::LoafErr;
use crate::error::Result;
use crate::exec::CancelSignal;
use crate::exec::MAX_TIMEOUT;
use crate::exec::ProcessRunRequest;
use crate::exec::run_process;
use crate::shell::ResolvedShell;
use crate::shell::ShellTag;
use crate::shell::resolve_shell;

const CWD_START: &str = "CWD_START";
const CWD_END: &str = "CWD_END";
const ENV_START: &str = "ENV_START";
const ENV_END: &str = "ENV_END";

#[derive(Debug, Clone, Default)]
pub struct BashRequest {
    pub command: String,
    pub timeout_secs: Option<u64>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub reset_session: bool,
}

#[derive(Debug)]
pub struct BashResult {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub duration: Duration,
    /// Stdout with the state-capture block removed.
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub cwd_before: PathBuf,
    pub cwd_after: PathBuf,
    /// Whether the marker block was found and the baseline replaced.
    pub captured_state: bool,
    pub timed_out: bool,
    pub aborted: bool,
}

/// The cwd/env baseline carried between foreground commands. One instance per
/// logical bash session (today: one per runtime); concurrent calls on the
/// same session must be serialized by the owner.
#[derive(Debug)]
pub struct BashSession {
    shell: ResolvedShell,
    cwd: PathBuf,
    env: HashMap<String, String>,
}

impl BashSession {
    pub fn new() -> Result<Self> {
        let shell = resolve_shell(None)?;
        let mut session = Self {
            shell,
            cwd: PathBuf::new(),
            env: HashMap::new(),
        };
        session.reset()?;
        Ok(session)
    }

    /// Restore the OS defaults: the process cwd and environment.
    pub fn reset(&mut self) -> Result<()> {
        self.cwd = std::env::current_dir()?;
        self.env = std::env::vars().collect();
        Ok(())
    }

    pub fn cwd(&self) -> &PathBuf {
        &self.cwd
    }

    pub fn shell_tag(&self) -> ShellTag {
        self.shell.tag
    }

    pub async fn run(&mut self, request: BashRequest, cancel: Option<CancelSignal>) -> Result<BashResult> {
        if request.command.trim().is_empty() {
            return Err(LoafErr::InvalidInput("command must be a non-empty string".to_string()));
        }
        if request.reset_session {
            self.reset()?;
        }

        let cwd_override = request.cwd.clone();
        let cwd_before = cwd_override.clone().unwrap_or_else(|| self.cwd.clone());
        let mut env = self.env.clone();
        if let Some(delta) = &request.env {
            env.extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let token = marker_token();
        let script = wrap_command(self.shell.tag, &request.command, &token);
        let timeout = request
            .timeout_secs
            .map(Duration::from_secs)
            .map(|t| t.min(MAX_TIMEOUT));

        let run = run_process(
            ProcessRunRequest {
                command: self.shell.command_argv(&script),
                cwd: cwd_before.clone(),
                env,
                timeout,
            },
            cancel,
        )
        .await?;

        let parsed = parse_captured_state(&run.stdout.text, &token);
        let captured_state = parsed.is_some();
        let (stdout, cwd_after) = match parsed {
            Some(state) => {
                // A clean capture replaces the whole baseline.
                self.cwd = state.cwd.clone();
                self.env = state.env;
                (state.cleaned_stdout, state.cwd)
            }
            None => {
                // Shell crash or `exec`: the env rolls back to the pre-call
                // snapshot, but an explicit cwd override sticks.
                if let Some(cwd) = cwd_override {
                    self.cwd = cwd;
                }
                (run.stdout.text.clone(), self.cwd.clone())
            }
        };

        Ok(BashResult {
            exit_code: run.exit_code,
            signal: run.signal,
            duration: run.duration,
            stdout,
            stderr: run.stderr.text,
            stdout_truncated: run.stdout.truncated,
            stderr_truncated: run.stderr.truncated,
            cwd_before,
            cwd_after,
            captured_state,
            timed_out: run.timed_out,
            aborted: run.aborted,
        })
    }
}

/// `__LOAF_BASH_<epoch-ms>_<hex>__` — unique per invocation so user output
/// cannot collide with the marker lines.
fn marker_token() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let nonce: u32 = rand::rng().random();
    format!("__LOAF_BASH_{millis}_{nonce:08x}__")
}

fn wrap_command(tag: ShellTag, command: &str, token: &str) -> String {
    match tag {
        ShellTag::Zsh | ShellTag::Bash | ShellTag::Sh => format!(
            "set +e\n{command}\n__LOAF_RC=$?\nprintf '\\n%s\\n' '{token}{CWD_START}'\npwd\nprintf '%s\\n' '{token}{CWD_END}'\nprintf '%s\\n' '{token}{ENV_START}'\nenv\nprintf '%s\\n' '{token}{ENV_END}'\nexit $__LOAF_RC\n"
        ),
        ShellTag::Powershell => format!(
            "$ErrorActionPreference = 'Continue'\n{command}\n$__LOAF_RC = $LASTEXITCODE\nif ($null -eq $__LOAF_RC) {{ $__LOAF_RC = 0 }}\nWrite-Output ''\nWrite-Output '{token}{CWD_START}'\n(Get-Location).Path\nWrite-Output '{token}{CWD_END}'\nWrite-Output '{token}{ENV_START}'\nGet-ChildItem Env: | ForEach-Object {{ \"$($_.Name)=$($_.Value)\" }}\nWrite-Output '{token}{ENV_END}'\nexit $__LOAF_RC\n"
        ),
        ShellTag::Cmd => format!(
            "{command}\r\nset __LOAF_RC=%ERRORLEVEL%\r\necho.\r\necho {token}{CWD_START}\r\ncd\r\necho {token}{CWD_END}\r\necho {token}{ENV_START}\r\nset\r\necho {token}{ENV_END}\r\nexit /b %__LOAF_RC%\r\n"
        ),
    }
}

struct CapturedState {
    cleaned_stdout: String,
    cwd: PathBuf,
    env: HashMap<String, String>,
}

/// Pull the marker block out of stdout. Returns `None` when any of the four
/// marker lines is missing, in which case the caller must treat the state as
/// uncaptured.
fn parse_captured_state(stdout: &str, token: &str) -> Option<CapturedState> {
    let cwd_start = format!("{token}{CWD_START}");
    let cwd_end = format!("{token}{CWD_END}");
    let env_start = format!("{token}{ENV_START}");
    let env_end = format!("{token}{ENV_END}");

    let lines: Vec<&str> = stdout.split('\n').collect();
    let find = |marker: &str, from: usize| -> Option<usize> {
        lines[from..]
            .iter()
            .position(|line| line.trim_end_matches('\r') == marker)
            .map(|offset| from + offset)
    };

    let cwd_start_idx = find(&cwd_start, 0)?;
    let cwd_end_idx = find(&cwd_end, cwd_start_idx + 1)?;
    let env_start_idx = find(&env_start, cwd_end_idx + 1)?;
    let env_end_idx = find(&env_end, env_start_idx + 1)?;

    let cwd_line = lines[cwd_start_idx + 1..cwd_end_idx]
        .iter()
        .map(|line| line.trim_end_matches('\r'))
        .find(|line| !line.is_empty())?;

    let mut env = HashMap::new();
    for line in &lines[env_start_idx + 1..env_end_idx] {
        let line = line.trim_end_matches('\r');
        if let Some((key, value)) = line.split_once('=')
            && !key.is_empty()
        {
            env.insert(key.to_string(), value.to_string());
        }
    }

    // Everything before the marker block is the user's stdout. The newline
    // the wrapper injected ahead of the block is the separator preceding the
    // marker line, so a plain join reconstructs the output byte-for-byte.
    let cleaned: String = lines[..cwd_start_idx].join("\n");

    Some(CapturedState {
        cleaned_stdout: cleaned,
        cwd: PathBuf::from(cwd_line),
        env,
    })
}
