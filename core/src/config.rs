//! Runtime configuration: `~/.loaf/config.toml` over hardcoded defaults.
//! Every tunable works without a config file; `LOAF_HOME` relocates the
//! whole state directory (useful in tests).

use std::path::PathBuf;
use std::time::Duration;

use loaf_compact::CompactionPolicy;
use serde::Deserialize;

use crate::error::Result;

pub const LOAF_HOME_ENV: &str = "LOAF_HOME";
const CONFIG_FILE: &str = "config.toml";
const SESSIONS_SUBDIR: &str = "sessions";
const TOOLS_SUBDIR: &str = "tools";

/// Resolve the state directory: `$LOAF_HOME` when set, `~/.loaf` otherwise.
pub fn loaf_home() -> std::io::Result<PathBuf> {
    if let Some(home) = std::env::var_os(LOAF_HOME_ENV)
        && !home.is_empty()
    {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".loaf"))
        .ok_or_else(|| std::io::Error::other("could not determine home directory"))
}

/// On-disk shape of `config.toml`; every field optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    #[serde(default)]
    shell: ShellToml,
    #[serde(default)]
    compact: CompactToml,
}

#[derive(Debug, Default, Deserialize)]
struct ShellToml {
    default_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CompactToml {
    high_watermark_ratio: Option<f64>,
    target_ratio: Option<f64>,
    context_window_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub loaf_home: PathBuf,
    pub sessions_dir: PathBuf,
    /// Discovery directory for external tool plugins; the loader itself lives
    /// outside the core.
    pub custom_tools_dir: PathBuf,
    pub default_timeout: Duration,
    pub compaction: CompactionPolicy,
    pub context_window_tokens: u64,
}

impl Config {
    /// Load configuration, tolerating a missing config file.
    pub fn load() -> Result<Self> {
        let home = loaf_home()?;
        let toml_path = home.join(CONFIG_FILE);
        let parsed: ConfigToml = match std::fs::read_to_string(&toml_path) {
            Ok(contents) => toml::from_str(&contents).map_err(|err| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("failed to parse {}: {err}", toml_path.display()),
                )
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self::from_parts(home, parsed))
    }

    fn from_parts(home: PathBuf, parsed: ConfigToml) -> Self {
        let defaults = CompactionPolicy::default();
        let compaction = CompactionPolicy {
            high_watermark_ratio: parsed
                .compact
                .high_watermark_ratio
                .unwrap_or(defaults.high_watermark_ratio),
            target_ratio: parsed.compact.target_ratio.unwrap_or(defaults.target_ratio),
        }
        .clamped();

        Self {
            sessions_dir: home.join(SESSIONS_SUBDIR),
            custom_tools_dir: home.join(TOOLS_SUBDIR),
            default_timeout: Duration::from_secs(
                parsed
                    .shell
                    .default_timeout_secs
                    .unwrap_or(crate::exec::DEFAULT_TIMEOUT.as_secs()),
            ),
            context_window_tokens: parsed.compact.context_window_tokens.unwrap_or(128_000),
            compaction,
            loaf_home: home,
        }
    }
}
