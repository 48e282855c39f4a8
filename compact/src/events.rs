//! The typed, append-only event record that feeds compaction. Events carry a
//! monotonic index, a timestamp, and a free-form JSON payload that the engine
//! treats as opaque except for a handful of well-known keys.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::now_iso;

/// Payloads are string-keyed JSON objects.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactEventKind {
    UserMsg,
    AssistantMsg,
    ToolResult,
    FileRead,
    FileWritePatch,
    CommandRun,
    ErrorObserved,
    Decision,
    PlanStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactEvent {
    pub index: u64,
    pub at_iso: String,
    #[serde(rename = "type")]
    pub kind: CompactEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message as handed to the model provider: the projection target for
/// events and the unit the token estimator sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

/// A transcript entry as stored in a rollout; images ride along so that an
/// otherwise-empty message is still worth keeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

/// In-memory event sequence for one session. Appends assign contiguous,
/// strictly increasing indices.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<CompactEvent>,
    next_index: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a log from previously persisted events. Indices continue after
    /// the highest seen.
    pub fn from_events(events: Vec<CompactEvent>) -> Self {
        let next_index = events.iter().map(|e| e.index + 1).max().unwrap_or(0);
        Self { events, next_index }
    }

    pub fn append(&mut self, kind: CompactEventKind, payload: Payload) -> &CompactEvent {
        self.append_tagged(kind, payload, None, None)
    }

    pub fn append_tagged(
        &mut self,
        kind: CompactEventKind,
        payload: Payload,
        turn_id: Option<String>,
        provider: Option<String>,
    ) -> &CompactEvent {
        let event = CompactEvent {
            index: self.next_index,
            at_iso: now_iso(),
            kind,
            turn_id,
            provider,
            payload,
        };
        self.next_index += 1;
        self.events.push(event);
        let last = self.events.len() - 1;
        &self.events[last]
    }

    pub fn events(&self) -> &[CompactEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Rebuild a contiguous event sequence from a stored chat transcript.
/// Messages that are empty and carry no images are skipped; indices start at
/// `start_index`.
pub fn backfill_events_from_history(
    history: &[HistoryMessage],
    start_index: u64,
) -> Vec<CompactEvent> {
    let mut events = Vec::new();
    let mut index = start_index;
    for message in history {
        if message.text.trim().is_empty() && message.images.is_empty() {
            continue;
        }
        let kind = match message.role {
            Role::User => CompactEventKind::UserMsg,
            Role::System | Role::Assistant => CompactEventKind::AssistantMsg,
        };
        let mut payload = Payload::new();
        payload.insert("text".to_string(), Value::String(message.text.clone()));
        if !message.images.is_empty() {
            payload.insert(
                "images".to_string(),
                Value::Array(message.images.iter().cloned().map(Value::String).collect()),
            );
        }
        events.push(CompactEvent {
            index,
            at_iso: now_iso(),
            kind,
            turn_id: None,
            provider: None,
            payload,
        });
        index += 1;
    }
    events
}

/// Bracketed tag and primary payload key for each operational event kind.
/// `None` marks the two conversational kinds that round-trip their text.
fn tag_and_primary(kind: CompactEventKind) -> (Option<&'static str>, &'static str) {
    match kind {
        CompactEventKind::UserMsg | CompactEventKind::AssistantMsg => (None, "text"),
        CompactEventKind::ToolResult => (Some("tool result"), "output"),
        CompactEventKind::FileRead => (Some("file read"), "path"),
        CompactEventKind::FileWritePatch => (Some("file write"), "path"),
        CompactEventKind::CommandRun => (Some("command"), "command"),
        CompactEventKind::ErrorObserved => (Some("error"), "message"),
        CompactEventKind::Decision => (Some("decision"), "decision"),
        CompactEventKind::PlanStep => (Some("plan step"), "step"),
    }
}

const PREVIEW_MAX_CHARS: usize = 160;

fn clipped_json_preview(payload: &Payload) -> String {
    let rendered = Value::Object(payload.clone()).to_string();
    if rendered.chars().count() <= PREVIEW_MAX_CHARS {
        return rendered;
    }
    let clipped: String = rendered.chars().take(PREVIEW_MAX_CHARS).collect();
    format!("{clipped}…")
}

impl CompactEvent {
    /// Project the event into the chat message shown to the model after
    /// compaction. User/assistant messages round-trip their text; operational
    /// events render as a short bracketed tag plus their primary string
    /// field, falling back to a clipped JSON preview of the payload.
    pub fn to_chat_message(&self) -> ChatMessage {
        let (tag, primary) = tag_and_primary(self.kind);
        let primary_text = self
            .payload
            .get(primary)
            .and_then(Value::as_str)
            .map(str::to_string);

        match tag {
            None => ChatMessage {
                role: match self.kind {
                    CompactEventKind::UserMsg => Role::User,
                    _ => Role::Assistant,
                },
                text: primary_text.unwrap_or_else(|| clipped_json_preview(&self.payload)),
            },
            Some(tag) => {
                let tag = if self.kind == CompactEventKind::ToolResult {
                    let ok = self
                        .payload
                        .get("ok")
                        .and_then(Value::as_bool)
                        .unwrap_or(true);
                    if ok {
                        format!("[{tag}:ok]")
                    } else {
                        format!("[{tag}:error]")
                    }
                } else {
                    format!("[{tag}]")
                };
                let body = primary_text.unwrap_or_else(|| clipped_json_preview(&self.payload));
                ChatMessage {
                    role: Role::Assistant,
                    text: format!("{tag} {body}"),
                }
            }
        }
    }
}
