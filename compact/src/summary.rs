//! The rolling structured summary that replaces elided events in the model
//! context, and the union-append merge that keeps it monotone across passes.

use serde::Deserialize;
use serde::Serialize;

use crate::artifacts::SummaryArtifacts;
use crate::artifacts::union_into;
use crate::now_iso;

pub const SUMMARY_SCHEMA_VERSION: u32 = 1;

fn schema_version_default() -> u32 {
    SUMMARY_SCHEMA_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision: String,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_iso: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tradeoffs: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryState {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub progress: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub artifacts: SummaryArtifacts,
    #[serde(default)]
    pub updated_at_iso: String,
}

impl Default for SummaryState {
    fn default() -> Self {
        Self {
            schema_version: SUMMARY_SCHEMA_VERSION,
            intent: String::new(),
            constraints: Vec::new(),
            decisions: Vec::new(),
            progress: Vec::new(),
            open_questions: Vec::new(),
            next_steps: Vec::new(),
            artifacts: SummaryArtifacts::default(),
            updated_at_iso: String::new(),
        }
    }
}

impl SummaryState {
    /// True when nothing has been summarised yet; an empty summary emits no
    /// context message.
    pub fn is_empty(&self) -> bool {
        self.intent.is_empty()
            && self.constraints.is_empty()
            && self.decisions.is_empty()
            && self.progress.is_empty()
            && self.open_questions.is_empty()
            && self.next_steps.is_empty()
            && self.artifacts.is_empty()
    }
}

/// Merge a candidate summary produced by the summariser into the previous
/// one. Lists union by append with case-insensitive dedup (previous order
/// wins); decisions dedup on lowercased `(decision, rationale)`; the
/// candidate's intent wins unless empty. `delta_artifacts` — computed
/// directly from the delta events — is folded in as well, so the artifact
/// record survives a forgetful summariser.
pub fn merge_summaries(
    previous: &SummaryState,
    candidate: &SummaryState,
    delta_artifacts: &SummaryArtifacts,
) -> SummaryState {
    let mut merged = previous.clone();

    if !candidate.intent.trim().is_empty() {
        merged.intent = candidate.intent.trim().to_string();
    }
    union_into(&mut merged.constraints, candidate.constraints.iter());
    union_into(&mut merged.progress, candidate.progress.iter());
    union_into(&mut merged.open_questions, candidate.open_questions.iter());
    union_into(&mut merged.next_steps, candidate.next_steps.iter());

    for decision in &candidate.decisions {
        let key = (
            decision.decision.trim().to_lowercase(),
            decision.rationale.trim().to_lowercase(),
        );
        if key.0.is_empty() {
            continue;
        }
        let seen = merged.decisions.iter().any(|existing| {
            (
                existing.decision.trim().to_lowercase(),
                existing.rationale.trim().to_lowercase(),
            ) == key
        });
        if !seen {
            merged.decisions.push(decision.clone());
        }
    }

    merged.artifacts.merge_from(&candidate.artifacts);
    merged.artifacts.merge_from(delta_artifacts);

    merged.schema_version = SUMMARY_SCHEMA_VERSION;
    merged.updated_at_iso = now_iso();
    merged
}

fn push_list_section(out: &mut String, title: &str, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    out.push_str(&format!("\n## {title}\n"));
    for entry in entries {
        out.push_str(&format!("- {entry}\n"));
    }
}

/// Deterministic Markdown rendering of the summary, used both for the
/// assistant context message and the `.compact.summary.md` sidecar mirror.
pub fn render_summary_markdown(summary: &SummaryState) -> String {
    let mut out = String::from("# Session summary\n");
    if !summary.intent.is_empty() {
        out.push_str(&format!("\n## Intent\n{}\n", summary.intent));
    }
    push_list_section(&mut out, "Constraints", &summary.constraints);
    if !summary.decisions.is_empty() {
        out.push_str("\n## Decisions\n");
        for decision in &summary.decisions {
            out.push_str(&format!("- {}: {}", decision.decision, decision.rationale));
            if let Some(tradeoffs) = &decision.tradeoffs {
                out.push_str(&format!(" (tradeoffs: {tradeoffs})"));
            }
            out.push('\n');
        }
    }
    push_list_section(&mut out, "Progress", &summary.progress);
    push_list_section(&mut out, "Open questions", &summary.open_questions);
    push_list_section(&mut out, "Next steps", &summary.next_steps);

    let artifacts = &summary.artifacts;
    if !artifacts.is_empty() {
        out.push_str("\n## Artifacts\n");
        push_artifact_list(&mut out, "Files touched", &artifacts.files_touched);
        push_artifact_list(&mut out, "Files created", &artifacts.files_created);
        push_artifact_list(&mut out, "Commands run", &artifacts.commands_run);
        push_artifact_list(&mut out, "Errors seen", &artifacts.errors_seen);
        push_artifact_list(&mut out, "External endpoints", &artifacts.external_endpoints);
    }
    if !summary.updated_at_iso.is_empty() {
        out.push_str(&format!("\nUpdated: {}\n", summary.updated_at_iso));
    }
    out
}

fn push_artifact_list(out: &mut String, title: &str, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    out.push_str(&format!("### {title}\n"));
    for entry in entries {
        out.push_str(&format!("- {entry}\n"));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_unions_lists_preserving_previous_order() {
        let previous = SummaryState {
            constraints: strings(&["no network", "Rust 2024"]),
            ..SummaryState::default()
        };
        let candidate = SummaryState {
            constraints: strings(&["NO NETWORK", "tests must pass"]),
            ..SummaryState::default()
        };
        let merged = merge_summaries(&previous, &candidate, &SummaryArtifacts::default());
        assert_eq!(
            merged.constraints,
            strings(&["no network", "Rust 2024", "tests must pass"])
        );
    }

    #[test]
    fn merge_dedupes_decisions_by_lowercased_pair() {
        let previous = SummaryState {
            decisions: vec![Decision {
                decision: "Use JSONL".to_string(),
                rationale: "append-only".to_string(),
                at_iso: None,
                tradeoffs: None,
            }],
            ..SummaryState::default()
        };
        let candidate = SummaryState {
            decisions: vec![
                Decision {
                    decision: "use jsonl".to_string(),
                    rationale: "APPEND-ONLY".to_string(),
                    at_iso: Some("2026-01-01T00:00:00Z".to_string()),
                    tradeoffs: None,
                },
                Decision {
                    decision: "Use JSONL".to_string(),
                    rationale: "human-readable".to_string(),
                    at_iso: None,
                    tradeoffs: None,
                },
            ],
            ..SummaryState::default()
        };
        let merged = merge_summaries(&previous, &candidate, &SummaryArtifacts::default());
        assert_eq!(merged.decisions.len(), 2);
        assert_eq!(merged.decisions[1].rationale, "human-readable");
    }

    #[test]
    fn candidate_intent_wins_unless_empty() {
        let previous = SummaryState {
            intent: "ship the parser".to_string(),
            ..SummaryState::default()
        };
        let blank_candidate = SummaryState::default();
        let merged = merge_summaries(&previous, &blank_candidate, &SummaryArtifacts::default());
        assert_eq!(merged.intent, "ship the parser");

        let candidate = SummaryState {
            intent: "ship the parser and the applier".to_string(),
            ..SummaryState::default()
        };
        let merged = merge_summaries(&previous, &candidate, &SummaryArtifacts::default());
        assert_eq!(merged.intent, "ship the parser and the applier");
    }

    #[test]
    fn delta_artifacts_fold_in() {
        let delta = SummaryArtifacts {
            commands_run: strings(&["cargo test"]),
            ..SummaryArtifacts::default()
        };
        let merged =
            merge_summaries(&SummaryState::default(), &SummaryState::default(), &delta);
        assert_eq!(merged.artifacts.commands_run, strings(&["cargo test"]));
        assert!(!merged.updated_at_iso.is_empty());
    }

    #[test]
    fn markdown_rendering_is_deterministic_and_sectioned() {
        let summary = SummaryState {
            intent: "compact things".to_string(),
            progress: strings(&["built the log"]),
            artifacts: SummaryArtifacts {
                files_touched: strings(&["src/lib.rs"]),
                ..SummaryArtifacts::default()
            },
            updated_at_iso: "2026-01-01T00:00:00Z".to_string(),
            ..SummaryState::default()
        };
        let rendered = render_summary_markdown(&summary);
        let expected = "# Session summary\n\n## Intent\ncompact things\n\n## Progress\n- built the log\n\n## Artifacts\n### Files touched\n- src/lib.rs\n\nUpdated: 2026-01-01T00:00:00Z\n";
        assert_eq!(rendered, expected);
    }
}
