//! Resolves which shell to run tool commands under. Candidates are probed at
//! most once per process and the verdict is cached, so repeated tool calls do
//! not re-stat the filesystem.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::sync::Mutex as StdMutex;

use serde::Deserialize;
use serde::Serialize;

use crate::error::LoafErr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellTag {
    Zsh,
    Bash,
    Sh,
    Powershell,
    Cmd,
}

impl ShellTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShellTag::Zsh => "zsh",
            ShellTag::Bash => "bash",
            ShellTag::Sh => "sh",
            ShellTag::Powershell => "powershell",
            ShellTag::Cmd => "cmd",
        }
    }

    fn executable_names(&self) -> &'static [&'static str] {
        match self {
            ShellTag::Zsh => &["zsh"],
            ShellTag::Bash => &["bash"],
            ShellTag::Sh => &["sh"],
            ShellTag::Powershell => &["pwsh.exe", "powershell.exe", "pwsh"],
            ShellTag::Cmd => &["cmd.exe"],
        }
    }
}

#[cfg(not(windows))]
const CANDIDATES: &[ShellTag] = &[ShellTag::Zsh, ShellTag::Bash, ShellTag::Sh];

#[cfg(windows)]
const CANDIDATES: &[ShellTag] = &[ShellTag::Powershell, ShellTag::Cmd];

/// A shell that probing found runnable, with its script-invocation argv
/// template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedShell {
    pub tag: ShellTag,
    pub program: PathBuf,
}

impl ResolvedShell {
    /// The argv that runs `script` under this shell.
    pub fn command_argv(&self, script: &str) -> Vec<String> {
        let program = self.program.to_string_lossy().to_string();
        match self.tag {
            ShellTag::Zsh | ShellTag::Bash | ShellTag::Sh => {
                vec![program, "-c".to_string(), script.to_string()]
            }
            ShellTag::Powershell => vec![
                program,
                "-NoProfile".to_string(),
                "-Command".to_string(),
                script.to_string(),
            ],
            ShellTag::Cmd => vec![program, "/C".to_string(), script.to_string()],
        }
    }
}

static AVAILABILITY: LazyLock<StdMutex<HashMap<ShellTag, Option<PathBuf>>>> =
    LazyLock::new(|| StdMutex::new(HashMap::new()));

/// Locate the first runnable shell, preferring `preferred` when it is
/// available. Probes are cached process-wide.
pub fn resolve_shell(preferred: Option<ShellTag>) -> Result<ResolvedShell> {
    let order: Vec<ShellTag> = preferred
        .into_iter()
        .chain(CANDIDATES.iter().copied())
        .collect();
    for tag in order {
        if let Some(program) = cached_probe(tag) {
            return Ok(ResolvedShell { tag, program });
        }
    }
    Err(LoafErr::EnvUnavailable)
}

fn cached_probe(tag: ShellTag) -> Option<PathBuf> {
    if let Ok(mut cache) = AVAILABILITY.lock() {
        return cache.entry(tag).or_insert_with(|| probe(tag)).clone();
    }
    probe(tag)
}

/// Find an executable for the shell on PATH (plus the conventional system
/// directories, which survive a stripped-down PATH).
fn probe(tag: ShellTag) -> Option<PathBuf> {
    let mut directories: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_default();
    #[cfg(not(windows))]
    {
        for fallback in ["/bin", "/usr/bin", "/usr/local/bin"] {
            directories.push(PathBuf::from(fallback));
        }
    }

    for name in tag.executable_names() {
        for dir in &directories {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                tracing::debug!(shell = tag.as_str(), path = %candidate.display(), "shell probe hit");
                return Some(candidate);
            }
        }
    }
    tracing::debug!(shell = tag.as_str(), "shell probe miss");
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[cfg(unix)]
    #[test]
    fn resolves_some_posix_shell() {
        // Every supported platform ships at least /bin/sh.
        let shell = resolve_shell(None).unwrap();
        assert!(matches!(
            shell.tag,
            ShellTag::Zsh | ShellTag::Bash | ShellTag::Sh
        ));
        assert!(shell.program.exists());
    }

    #[cfg(unix)]
    #[test]
    fn preferred_shell_wins_when_available() {
        let sh = resolve_shell(Some(ShellTag::Sh)).unwrap();
        assert_eq!(sh.tag, ShellTag::Sh);
    }

    #[test]
    fn posix_argv_template_uses_dash_c() {
        let shell = ResolvedShell {
            tag: ShellTag::Bash,
            program: PathBuf::from("/bin/bash"),
        };
        assert_eq!(
            shell.command_argv("echo hi"),
            vec!["/bin/bash".to_string(), "-c".to_string(), "echo hi".to_string()]
        );
    }

    #[test]
    fn probe_results_are_cached() {
        let first = cached_probe(ShellTag::Sh);
        let second = cached_probe(ShellTag::Sh);
        assert_eq!(first, second);
    }
}
