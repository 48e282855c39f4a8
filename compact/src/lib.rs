//! Anchored context compaction: an append-only event log per session, a
//! rolling structured summary, and an engine that folds old events into the
//! summary while guaranteeing a minimum recent tail stays verbatim.
//!
//! The engine is pure: token estimation and delta summarisation are supplied
//! by the caller, and nothing here performs model calls. Persistence lives in
//! [`storage`], which writes sidecar files beside a session's rollout.

mod artifacts;
mod engine;
mod events;
mod storage;
mod summary;

pub use artifacts::SummaryArtifacts;
pub use artifacts::extract_artifacts_from_events;
pub use engine::CompactError;
pub use engine::CompactOutcome;
pub use engine::CompactReason;
pub use engine::CompactRequest;
pub use engine::CompactionPolicy;
pub use engine::MIN_RECENT_EVENTS;
pub use engine::MIN_RECENT_USER_TURNS;
pub use engine::build_model_context_messages;
pub use engine::build_summarizer_prompt;
pub use engine::build_summarizer_retry_prompt;
pub use engine::parse_summary_reply;
pub use engine::run_compaction;
pub use events::ChatMessage;
pub use events::CompactEvent;
pub use events::CompactEventKind;
pub use events::EventLog;
pub use events::HistoryMessage;
pub use events::Role;
pub use events::backfill_events_from_history;
pub use storage::CompactionPaths;
pub use storage::PersistedCompactionState;
pub use storage::append_events;
pub use storage::load_events;
pub use storage::load_state;
pub use storage::save_state;
pub use storage::save_summary_markdown;
pub use storage::sidecar_paths;
pub use summary::Decision;
pub use summary::SummaryState;
pub use summary::merge_summaries;
pub use summary::render_summary_markdown;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Current UTC time as an RFC-3339 string.
pub(crate) fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Validate an RFC-3339 timestamp, substituting `now` for anything the
/// formatter refuses.
pub(crate) fn valid_iso_or_now(candidate: &str) -> String {
    match OffsetDateTime::parse(candidate, &Rfc3339) {
        Ok(_) => candidate.to_string(),
        Err(_) => now_iso(),
    }
}
