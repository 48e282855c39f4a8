//! Sidecar persistence beside a session rollout: an append-only events JSONL,
//! an atomically-replaced state JSON, and a human-readable markdown mirror of
//! the summary.
//!
//! Loaders are deliberately forgiving. A missing file yields defaults, a
//! malformed line is skipped, an unknown event type rejects that line, an
//! invalid timestamp is replaced with `now`, and a non-object payload becomes
//! `{}` — a corrupted sidecar must never take the session down.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::events::CompactEvent;
use crate::events::CompactEventKind;
use crate::events::Payload;
use crate::summary::SummaryState;
use crate::summary::render_summary_markdown;
use crate::valid_iso_or_now;

const EVENTS_SUFFIX: &str = ".compact.events.jsonl";
const STATE_SUFFIX: &str = ".compact.state.json";
const SUMMARY_SUFFIX: &str = ".compact.summary.md";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionPaths {
    pub events: PathBuf,
    pub state: PathBuf,
    pub summary_md: PathBuf,
}

/// Derive the sidecar paths for a rollout file: strip a `.jsonl` extension
/// when present and append the three suffixes.
pub fn sidecar_paths(rollout_path: &Path) -> CompactionPaths {
    let display = rollout_path.to_string_lossy();
    let stem = display
        .strip_suffix(".jsonl")
        .map(str::to_string)
        .unwrap_or_else(|| display.to_string());
    CompactionPaths {
        events: PathBuf::from(format!("{stem}{EVENTS_SUFFIX}")),
        state: PathBuf::from(format!("{stem}{STATE_SUFFIX}")),
        summary_md: PathBuf::from(format!("{stem}{SUMMARY_SUFFIX}")),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCompactionState {
    pub schema_version: u32,
    pub last_anchor_event_index: u64,
    pub backfilled_from_rollout: bool,
    pub summary_state: SummaryState,
    pub updated_at_iso: String,
}

impl Default for PersistedCompactionState {
    fn default() -> Self {
        Self {
            schema_version: 1,
            last_anchor_event_index: 0,
            backfilled_from_rollout: false,
            summary_state: SummaryState::default(),
            updated_at_iso: String::new(),
        }
    }
}

/// Append events to the JSONL sidecar, one record per line.
pub fn append_events(paths: &CompactionPaths, events: &[CompactEvent]) -> std::io::Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    if let Some(parent) = paths.events.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&paths.events)?;
    let mut buffer = String::new();
    for event in events {
        let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        buffer.push_str(&line);
        buffer.push('\n');
    }
    file.write_all(buffer.as_bytes())?;
    file.flush()
}

/// Loose mirror of [`CompactEvent`] used to salvage partially valid lines.
#[derive(Deserialize)]
struct RawEventLine {
    index: u64,
    #[serde(default)]
    at_iso: String,
    #[serde(rename = "type")]
    kind: CompactEventKind,
    #[serde(default)]
    turn_id: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Load the persisted event sequence, skipping anything unusable.
pub fn load_events(paths: &CompactionPaths) -> Vec<CompactEvent> {
    let contents = match std::fs::read_to_string(&paths.events) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            tracing::warn!(error = %err, path = %paths.events.display(), "failed to read events sidecar");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawEventLine = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(line = line_no + 1, error = %err, "skipping malformed event line");
                continue;
            }
        };
        let payload = match raw.payload {
            Value::Object(map) => map,
            Value::Null => Payload::new(),
            other => {
                tracing::warn!(line = line_no + 1, ?other, "replacing non-record payload");
                Payload::new()
            }
        };
        events.push(CompactEvent {
            index: raw.index,
            at_iso: valid_iso_or_now(&raw.at_iso),
            kind: raw.kind,
            turn_id: raw.turn_id,
            provider: raw.provider,
            payload,
        });
    }
    events
}

fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

/// Persist the compaction state: pretty-printed JSON, written to a `.tmp`
/// sibling and renamed into place.
pub fn save_state(paths: &CompactionPaths, state: &PersistedCompactionState) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;
    write_atomically(&paths.state, &json)
}

/// Load the persisted state, falling back to defaults when the file is
/// missing or unreadable.
pub fn load_state(paths: &CompactionPaths) -> PersistedCompactionState {
    let contents = match std::fs::read_to_string(&paths.state) {
        Ok(contents) => contents,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %err, path = %paths.state.display(), "failed to read state sidecar");
            }
            return PersistedCompactionState::default();
        }
    };
    match serde_json::from_str::<PersistedCompactionState>(&contents) {
        Ok(mut state) => {
            state.updated_at_iso = valid_iso_or_now(&state.updated_at_iso);
            state
        }
        Err(err) => {
            tracing::warn!(error = %err, "state sidecar did not parse; starting fresh");
            PersistedCompactionState::default()
        }
    }
}

/// Write the markdown mirror of the summary next to the state file.
pub fn save_summary_markdown(paths: &CompactionPaths, summary: &SummaryState) -> std::io::Result<()> {
    write_atomically(&paths.summary_md, &render_summary_markdown(summary))
}
