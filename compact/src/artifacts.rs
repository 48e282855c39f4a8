//! Derives concrete artifact lists (paths, commands, endpoints, errors) from
//! raw events so the summary never loses track of what the session touched,
//! even when the summariser forgets to mention it.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::events::CompactEvent;
use crate::events::CompactEventKind;

/// Deduplicated, case-insensitive string lists describing what a session has
/// touched so far. Lists grow by append; merging is a union.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryArtifacts {
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub commands_run: Vec<String>,
    #[serde(default)]
    pub errors_seen: Vec<String>,
    #[serde(default)]
    pub external_endpoints: Vec<String>,
}

#[allow(clippy::expect_used)]
fn static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| static_regex(r#"\bhttps?://[^\s"'`<>()]+"#));

static CREATES_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    static_regex(r"(?:^|[;&|]\s*)(?:touch|mkdir(?:\s+-p)?|tee)\s+([^\s;&|>]+)")
});

static READS_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    static_regex(r"(?:^|[;&|]\s*)(?:cat|head|tail|less|wc|stat)\s+(?:-\S+\s+)*([^\s;&|>-][^\s;&|>]*)")
});

static REDIRECT_RE: LazyLock<Regex> = LazyLock::new(|| static_regex(r">>?\s*([^\s;&|]+)"));

impl SummaryArtifacts {
    pub fn is_empty(&self) -> bool {
        self.files_touched.is_empty()
            && self.files_created.is_empty()
            && self.commands_run.is_empty()
            && self.errors_seen.is_empty()
            && self.external_endpoints.is_empty()
    }

    /// Union `other` into `self`, deduplicating case-insensitively and
    /// preserving first-insertion order.
    pub fn merge_from(&mut self, other: &SummaryArtifacts) {
        union_into(&mut self.files_touched, other.files_touched.iter());
        union_into(&mut self.files_created, other.files_created.iter());
        union_into(&mut self.commands_run, other.commands_run.iter());
        union_into(&mut self.errors_seen, other.errors_seen.iter());
        union_into(
            &mut self.external_endpoints,
            other.external_endpoints.iter(),
        );
    }
}

/// Append entries to `list`, trimming, dropping empties, and skipping values
/// already present under a case-insensitive comparison.
pub(crate) fn union_into<'a>(list: &mut Vec<String>, entries: impl Iterator<Item = &'a String>) {
    for entry in entries {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lowered = trimmed.to_lowercase();
        if list.iter().any(|existing| existing.to_lowercase() == lowered) {
            continue;
        }
        list.push(trimmed.to_string());
    }
}

fn push_unique(list: &mut Vec<String>, entry: &str) {
    union_into(list, std::iter::once(&entry.to_string()));
}

/// Walk every event payload (descending into maps and arrays), collecting
/// URLs from any string and classifying well-known payload keys into the
/// artifact buckets.
pub fn extract_artifacts_from_events(events: &[CompactEvent]) -> SummaryArtifacts {
    let mut artifacts = SummaryArtifacts::default();
    for event in events {
        for value in event.payload.values() {
            collect_urls(value, &mut artifacts.external_endpoints);
        }
        match event.kind {
            CompactEventKind::CommandRun => {
                if let Some(command) = event.payload.get("command").and_then(Value::as_str) {
                    push_unique(&mut artifacts.commands_run, command);
                    classify_command(command, &mut artifacts);
                }
            }
            CompactEventKind::FileRead => {
                if let Some(path) = event.payload.get("path").and_then(Value::as_str) {
                    push_unique(&mut artifacts.files_touched, path);
                }
            }
            CompactEventKind::FileWritePatch => {
                if let Some(path) = event.payload.get("path").and_then(Value::as_str) {
                    push_unique(&mut artifacts.files_touched, path);
                }
                if let Some(added) = event.payload.get("added").and_then(Value::as_array) {
                    for path in added.iter().filter_map(Value::as_str) {
                        push_unique(&mut artifacts.files_created, path);
                    }
                }
            }
            CompactEventKind::ErrorObserved => {
                if let Some(message) = event.payload.get("message").and_then(Value::as_str) {
                    push_unique(&mut artifacts.errors_seen, message);
                }
            }
            CompactEventKind::ToolResult => {
                let failed = event.payload.get("ok").and_then(Value::as_bool) == Some(false);
                if failed && let Some(error) = event.payload.get("error").and_then(Value::as_str) {
                    push_unique(&mut artifacts.errors_seen, error);
                }
            }
            _ => {}
        }
    }
    artifacts
}

fn collect_urls(value: &Value, endpoints: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for found in URL_RE.find_iter(text) {
                push_unique(endpoints, found.as_str());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_urls(item, endpoints);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_urls(item, endpoints);
            }
        }
        _ => {}
    }
}

/// Classify a shell command into created/touched file buckets with a small
/// set of regexes. Intentionally heuristic: false negatives are acceptable,
/// the summariser gets another crack at the same payloads.
fn classify_command(command: &str, artifacts: &mut SummaryArtifacts) {
    for captures in CREATES_FILE_RE.captures_iter(command) {
        if let Some(path) = captures.get(1) {
            push_unique(&mut artifacts.files_created, path.as_str());
        }
    }
    for captures in REDIRECT_RE.captures_iter(command) {
        if let Some(path) = captures.get(1) {
            push_unique(&mut artifacts.files_created, path.as_str());
        }
    }
    for captures in READS_FILE_RE.captures_iter(command) {
        if let Some(path) = captures.get(1) {
            push_unique(&mut artifacts.files_touched, path.as_str());
        }
    }
}
