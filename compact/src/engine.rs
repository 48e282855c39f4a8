//! The anchored compaction pass: decide whether to compress, pick the new
//! anchor, summarise the delta through a caller-supplied callback, and merge.
//!
//! The engine never talks to a model or a tokeniser; both arrive as
//! parameters. It is not re-entrant for a single session — the caller must
//! serialize passes (a per-session mutex at the boundary).

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::artifacts::extract_artifacts_from_events;
use crate::events::ChatMessage;
use crate::events::CompactEvent;
use crate::events::CompactEventKind;
use crate::events::Role;
use crate::summary::SummaryState;
use crate::summary::merge_summaries;
use crate::summary::render_summary_markdown;

/// The post-compaction tail must keep at least this many events…
pub const MIN_RECENT_EVENTS: usize = 12;
/// …and at least this many user turns, whichever keeps more.
pub const MIN_RECENT_USER_TURNS: usize = 4;

const RATIO_MIN: f64 = 0.10;
const RATIO_MAX: f64 = 0.99;

#[derive(Debug, Error)]
pub enum CompactError {
    #[error("summarizer failed: {0}")]
    Summarizer(String),
    #[error("summarizer reply was not valid summary JSON: {0}")]
    InvalidReply(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactReason {
    Watermark,
    Manual,
    ProviderSwitch,
}

/// Fractions of the model context window that trigger a pass and that a pass
/// aims to fall below. Accepted values are clamped into `[0.10, 0.99]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    pub high_watermark_ratio: f64,
    pub target_ratio: f64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            high_watermark_ratio: 0.82,
            target_ratio: 0.58,
        }
    }
}

impl CompactionPolicy {
    pub fn clamped(self) -> Self {
        Self {
            high_watermark_ratio: self.high_watermark_ratio.clamp(RATIO_MIN, RATIO_MAX),
            target_ratio: self.target_ratio.clamp(RATIO_MIN, RATIO_MAX),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactRequest {
    pub context_window_tokens: u64,
    /// Token cost of the pinned overhead (system prompt, tool definitions)
    /// that rides along with every request.
    pub pinned_token_estimate: u64,
    pub reason: CompactReason,
    pub force: bool,
}

impl CompactRequest {
    fn is_forced(&self) -> bool {
        self.force || self.reason == CompactReason::ProviderSwitch
    }
}

#[derive(Debug)]
pub struct CompactOutcome {
    pub compressed: bool,
    pub anchor: u64,
    pub summary: SummaryState,
}

/// Emit the model context for a given anchor: the summary rendered as one
/// assistant message (omitted while the summary is empty), followed by the
/// chat projections of all events at or above the anchor.
pub fn build_model_context_messages(
    summary: &SummaryState,
    events: &[CompactEvent],
    anchor: u64,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if !summary.is_empty() {
        messages.push(ChatMessage {
            role: Role::Assistant,
            text: render_summary_markdown(summary),
        });
    }
    messages.extend(
        events
            .iter()
            .filter(|event| event.index >= anchor)
            .map(CompactEvent::to_chat_message),
    );
    messages
}

/// The event index below which everything may be folded away while still
/// keeping `MIN_RECENT_EVENTS` events and `MIN_RECENT_USER_TURNS` user turns
/// in the tail. Whichever constraint keeps more wins.
fn minimum_recent_start(events: &[CompactEvent]) -> u64 {
    let Some(first) = events.first() else {
        return 0;
    };
    let keep_all = first.index;

    let by_count = if events.len() >= MIN_RECENT_EVENTS {
        events[events.len() - MIN_RECENT_EVENTS].index
    } else {
        keep_all
    };

    let user_indices: Vec<u64> = events
        .iter()
        .filter(|event| event.kind == CompactEventKind::UserMsg)
        .map(|event| event.index)
        .collect();
    let by_users = if user_indices.len() >= MIN_RECENT_USER_TURNS {
        user_indices[user_indices.len() - MIN_RECENT_USER_TURNS]
    } else {
        keep_all
    };

    by_count.min(by_users)
}

/// Run one compaction pass.
///
/// Fires when the estimate at the current anchor breaches the high watermark,
/// or when the request forces it (`force` or a provider switch). A pass that
/// does not fire returns the summary verbatim with the anchor unchanged.
pub async fn run_compaction<E, S, Fut>(
    events: &[CompactEvent],
    summary: &SummaryState,
    anchor_before: u64,
    policy: &CompactionPolicy,
    request: &CompactRequest,
    estimate_history_tokens: E,
    summarize_delta: S,
) -> Result<CompactOutcome, CompactError>
where
    E: Fn(&[ChatMessage]) -> u64,
    S: FnOnce(SummaryState, Vec<CompactEvent>) -> Fut,
    Fut: Future<Output = Result<SummaryState, CompactError>>,
{
    let policy = policy.clamped();
    let window = request.context_window_tokens as f64;
    let high_limit = (policy.high_watermark_ratio * window) as u64;
    let target_limit = (policy.target_ratio * window) as u64;

    let estimate_at = |anchor: u64| -> u64 {
        let messages = build_model_context_messages(summary, events, anchor);
        request.pinned_token_estimate + estimate_history_tokens(&messages)
    };

    let unchanged = || CompactOutcome {
        compressed: false,
        anchor: anchor_before,
        summary: summary.clone(),
    };

    if !request.is_forced() && estimate_at(anchor_before) <= high_limit {
        return Ok(unchanged());
    }

    let upper_bound = minimum_recent_start(events).max(anchor_before);
    let new_anchor = if request.is_forced() {
        upper_bound
    } else {
        // Advance one event at a time until the estimate fits under the
        // target or the recency floor stops us.
        let mut anchor = anchor_before;
        while anchor < upper_bound {
            anchor += 1;
            if estimate_at(anchor) <= target_limit {
                break;
            }
        }
        anchor
    };

    if new_anchor <= anchor_before {
        return Ok(unchanged());
    }

    let delta: Vec<CompactEvent> = events
        .iter()
        .filter(|event| event.index >= anchor_before && event.index < new_anchor)
        .cloned()
        .collect();
    if delta.is_empty() {
        return Ok(unchanged());
    }

    tracing::debug!(
        anchor_before,
        new_anchor,
        delta_len = delta.len(),
        "compacting session context"
    );

    let delta_artifacts = extract_artifacts_from_events(&delta);
    let candidate = summarize_delta(summary.clone(), delta).await?;
    let merged = merge_summaries(summary, &candidate, &delta_artifacts);

    Ok(CompactOutcome {
        compressed: true,
        anchor: new_anchor,
        summary: merged,
    })
}

const SUMMARIZER_SYSTEM_PROMPT: &str = "You are the session summarizer for a coding agent. \
Merge the previous summary with the new event rows into an updated summary. \
Return ONLY valid JSON matching the schema; no prose. \
Preserve continuity: keep every decision, constraint, and artifact path that is still relevant.";

const SUMMARIZER_RETRY_SUFFIX: &str = "\nReturn the JSON object only: no code fences, no prose, \
no explanations before or after it.";

fn summarizer_schema_example() -> String {
    serde_json::json!({
        "schema_version": 1,
        "intent": "one sentence describing the task",
        "constraints": ["strings"],
        "decisions": [{"decision": "what", "rationale": "why", "at_iso": "optional", "tradeoffs": "optional"}],
        "progress": ["strings"],
        "open_questions": ["strings"],
        "next_steps": ["strings"],
        "artifacts": {
            "files_touched": [], "files_created": [], "commands_run": [],
            "errors_seen": [], "external_endpoints": []
        },
        "updated_at_iso": "set by the runtime"
    })
    .to_string()
}

fn summarizer_user_message(
    old_summary: &SummaryState,
    delta: &[CompactEvent],
) -> Result<String, CompactError> {
    let old_json = serde_json::to_string(old_summary)?;
    let mut rows = String::new();
    for event in delta {
        rows.push_str(&serde_json::to_string(event)?);
        rows.push('\n');
    }
    Ok(format!(
        "Previous summary (JSON):\n{old_json}\n\nNew events (JSONL):\n{rows}\nSchema example:\n{}",
        summarizer_schema_example()
    ))
}

/// Build the two-message prompt for an LLM-driven summariser.
pub fn build_summarizer_prompt(
    old_summary: &SummaryState,
    delta: &[CompactEvent],
) -> Result<Vec<ChatMessage>, CompactError> {
    Ok(vec![
        ChatMessage {
            role: Role::System,
            text: SUMMARIZER_SYSTEM_PROMPT.to_string(),
        },
        ChatMessage {
            role: Role::User,
            text: summarizer_user_message(old_summary, delta)?,
        },
    ])
}

/// The follow-up prompt after a reply that failed to parse: same content with
/// an explicit no-fences instruction.
pub fn build_summarizer_retry_prompt(
    old_summary: &SummaryState,
    delta: &[CompactEvent],
) -> Result<Vec<ChatMessage>, CompactError> {
    Ok(vec![
        ChatMessage {
            role: Role::System,
            text: format!("{SUMMARIZER_SYSTEM_PROMPT}{SUMMARIZER_RETRY_SUFFIX}"),
        },
        ChatMessage {
            role: Role::User,
            text: summarizer_user_message(old_summary, delta)?,
        },
    ])
}

/// Parse a summariser reply: raw JSON, a fenced code block, or the first
/// `{…}` substring.
pub fn parse_summary_reply(reply: &str) -> Result<SummaryState, CompactError> {
    let trimmed = reply.trim();
    if let Ok(state) = serde_json::from_str::<SummaryState>(trimmed) {
        return Ok(state);
    }

    if let Some(body) = extract_fenced_block(trimmed)
        && let Ok(state) = serde_json::from_str::<SummaryState>(body.trim())
    {
        return Ok(state);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
        && let Ok(state) = serde_json::from_str::<SummaryState>(&trimmed[start..=end])
    {
        return Ok(state);
    }

    let preview: String = trimmed.chars().take(120).collect();
    Err(CompactError::InvalidReply(preview))
}

fn extract_fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    // Skip an info string such as `json` on the fence line.
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::events::EventLog;
    use crate::events::Payload;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn text_payload(text: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("text".to_string(), json!(text));
        payload
    }

    /// 50 events alternating user/assistant, indices 0..50.
    fn alternating_log(count: usize) -> EventLog {
        let mut log = EventLog::new();
        for i in 0..count {
            let kind = if i % 2 == 0 {
                CompactEventKind::UserMsg
            } else {
                CompactEventKind::AssistantMsg
            };
            log.append(kind, text_payload(&format!("message {i}")));
        }
        log
    }

    fn chars_estimator(messages: &[ChatMessage]) -> u64 {
        messages.iter().map(|m| m.text.len() as u64 / 4 + 1).sum()
    }

    #[tokio::test]
    async fn forced_pass_respects_minimum_recency() {
        let log = alternating_log(50);
        let request = CompactRequest {
            context_window_tokens: 560,
            pinned_token_estimate: 36,
            reason: CompactReason::Manual,
            force: true,
        };
        let outcome = run_compaction(
            log.events(),
            &SummaryState::default(),
            0,
            &CompactionPolicy::default(),
            &request,
            chars_estimator,
            |old, _delta| async move { Ok(old) },
        )
        .await
        .unwrap();

        assert!(outcome.compressed);
        let tail: Vec<_> = log
            .events()
            .iter()
            .filter(|e| e.index >= outcome.anchor)
            .collect();
        assert!(tail.len() >= MIN_RECENT_EVENTS, "tail: {}", tail.len());
        let user_turns = tail
            .iter()
            .filter(|e| e.kind == CompactEventKind::UserMsg)
            .count();
        assert!(user_turns >= MIN_RECENT_USER_TURNS, "users: {user_turns}");
    }

    #[tokio::test]
    async fn below_watermark_is_a_no_op() {
        use std::sync::atomic::AtomicBool;
        use std::sync::atomic::Ordering;

        let log = alternating_log(6);
        let summary = SummaryState {
            intent: "carry on".to_string(),
            ..SummaryState::default()
        };
        let request = CompactRequest {
            context_window_tokens: 1_000_000,
            pinned_token_estimate: 0,
            reason: CompactReason::Watermark,
            force: false,
        };
        let summarizer_ran = AtomicBool::new(false);
        let outcome = run_compaction(
            log.events(),
            &summary,
            0,
            &CompactionPolicy::default(),
            &request,
            chars_estimator,
            |old, _| {
                summarizer_ran.store(true, Ordering::SeqCst);
                async move { Ok(old) }
            },
        )
        .await
        .unwrap();
        assert!(!outcome.compressed);
        assert_eq!(outcome.anchor, 0);
        assert_eq!(outcome.summary, summary);
        assert!(!summarizer_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn provider_switch_forces_a_pass() {
        let log = alternating_log(40);
        let request = CompactRequest {
            context_window_tokens: 1_000_000,
            pinned_token_estimate: 0,
            reason: CompactReason::ProviderSwitch,
            force: false,
        };
        let outcome = run_compaction(
            log.events(),
            &SummaryState::default(),
            0,
            &CompactionPolicy::default(),
            &request,
            chars_estimator,
            |old, _| async move { Ok(old) },
        )
        .await
        .unwrap();
        assert!(outcome.compressed);
        assert!(outcome.anchor > 0);
    }

    #[tokio::test]
    async fn non_forced_scan_stops_once_under_target() {
        let log = alternating_log(50);
        // One token per message: 50 messages at anchor 0. Window of 40 puts
        // the high watermark at 32.8 and the target at 23.2, so the scan
        // should stop at anchor 27 (23 remaining messages).
        let request = CompactRequest {
            context_window_tokens: 40,
            pinned_token_estimate: 0,
            reason: CompactReason::Watermark,
            force: false,
        };
        let outcome = run_compaction(
            log.events(),
            &SummaryState::default(),
            0,
            &CompactionPolicy::default(),
            &request,
            |messages: &[ChatMessage]| messages.len() as u64,
            |old, delta| async move {
                assert_eq!(delta.first().map(|e| e.index), Some(0));
                Ok(old)
            },
        )
        .await
        .unwrap();
        assert!(outcome.compressed);
        assert_eq!(outcome.anchor, 27);
    }

    #[tokio::test]
    async fn summarizer_candidate_is_merged_with_delta_artifacts() {
        let mut log = alternating_log(30);
        let mut payload = Payload::new();
        payload.insert("command".to_string(), json!("cargo build"));
        log.append(CompactEventKind::CommandRun, payload);
        for i in 0..20 {
            log.append(CompactEventKind::UserMsg, text_payload(&format!("u{i}")));
        }

        let request = CompactRequest {
            context_window_tokens: 100,
            pinned_token_estimate: 0,
            reason: CompactReason::Manual,
            force: true,
        };
        let outcome = run_compaction(
            log.events(),
            &SummaryState::default(),
            0,
            &CompactionPolicy::default(),
            &request,
            |messages: &[ChatMessage]| messages.len() as u64,
            |mut old, _delta| async move {
                old.intent = "build the crate".to_string();
                Ok(old)
            },
        )
        .await
        .unwrap();
        assert!(outcome.compressed);
        assert_eq!(outcome.summary.intent, "build the crate");
        assert_eq!(
            outcome.summary.artifacts.commands_run,
            vec!["cargo build".to_string()]
        );
    }

    #[test]
    fn ratios_clamp_at_accept_time() {
        let policy = CompactionPolicy {
            high_watermark_ratio: 2.0,
            target_ratio: 0.0,
        }
        .clamped();
        assert_eq!(policy.high_watermark_ratio, 0.99);
        assert_eq!(policy.target_ratio, 0.10);
    }

    #[test]
    fn empty_summary_emits_no_context_message() {
        let log = alternating_log(2);
        let messages = build_model_context_messages(&SummaryState::default(), log.events(), 0);
        assert_eq!(messages.len(), 2);

        let summary = SummaryState {
            intent: "work".to_string(),
            ..SummaryState::default()
        };
        let messages = build_model_context_messages(&summary, log.events(), 1);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::Assistant);
        assert!(messages[0].text.starts_with("# Session summary"));
    }

    #[test]
    fn reply_parser_accepts_raw_fenced_and_embedded_json() {
        let raw = serde_json::to_string(&SummaryState {
            intent: "raw".to_string(),
            ..SummaryState::default()
        })
        .unwrap();
        assert_eq!(parse_summary_reply(&raw).unwrap().intent, "raw");

        let fenced = format!("```json\n{raw}\n```");
        assert_eq!(parse_summary_reply(&fenced).unwrap().intent, "raw");

        let chatty = format!("Sure! Here is the summary:\n{raw}\nHope that helps.");
        assert_eq!(parse_summary_reply(&chatty).unwrap().intent, "raw");

        assert!(parse_summary_reply("no json here").is_err());
    }

    #[test]
    fn prompt_builder_embeds_old_summary_and_rows() {
        let log = alternating_log(2);
        let summary = SummaryState {
            intent: "keep going".to_string(),
            ..SummaryState::default()
        };
        let prompt = build_summarizer_prompt(&summary, log.events()).unwrap();
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, Role::System);
        assert!(prompt[1].text.contains("keep going"));
        assert!(prompt[1].text.contains("message 0"));

        let retry = build_summarizer_retry_prompt(&summary, log.events()).unwrap();
        assert!(retry[0].text.contains("no code fences"));
    }
}
