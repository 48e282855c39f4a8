//! The runtime object a session is built around: the tool registry with the
//! built-ins wired up, the background session manager, the foreground bash
//! baseline, and the compaction event log that observes all tool traffic.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use loaf_compact::ChatMessage;
use loaf_compact::CompactEvent;
use loaf_compact::CompactEventKind;
use loaf_compact::CompactOutcome;
use loaf_compact::CompactReason;
use loaf_compact::CompactRequest;
use loaf_compact::CompactionPaths;
use loaf_compact::EventLog;
use loaf_compact::PersistedCompactionState;
use loaf_compact::SummaryState;
use loaf_compact::build_model_context_messages;
use loaf_compact::run_compaction;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use crate::background::SessionManager;
use crate::bash::BashSession;
use crate::config::Config;
use crate::error::Result;
use crate::exec::CancelSignal;
use crate::rollout::RolloutRecorder;
use crate::tools::ToolCall;
use crate::tools::ToolRegistry;
use crate::tools::ToolResult;
use crate::tools::ToolRuntime;
use crate::tools::background::BgListTool;
use crate::tools::background::BgReadTool;
use crate::tools::background::BgResizeTool;
use crate::tools::background::BgStartTool;
use crate::tools::background::BgStopTool;
use crate::tools::background::BgWriteTool;
use crate::tools::patch::ApplyPatchTool;
use crate::tools::shell::BashTool;

const EVENT_PREVIEW_CHARS: usize = 2_000;

pub struct Runtime {
    config: Config,
    registry: Arc<ToolRegistry>,
    tools: ToolRuntime,
    sessions: Arc<SessionManager>,
    events: StdMutex<EventLog>,
    summary: StdMutex<SummaryState>,
    anchor: StdMutex<u64>,
    compact_paths: Option<CompactionPaths>,
    rollout: Option<RolloutRecorder>,
    /// Compaction passes must not interleave on one session.
    compact_gate: tokio::sync::Mutex<()>,
}

impl Runtime {
    /// Build a runtime with rollout + compaction sidecar persistence under
    /// the configured sessions directory.
    pub async fn new(config: Config) -> Result<Self> {
        let rollout = RolloutRecorder::new(&config.sessions_dir).await?;
        let compact_paths = loaf_compact::sidecar_paths(rollout.path());
        Self::build(config, Some(rollout), Some(compact_paths))
    }

    /// Build a runtime that keeps everything in memory (tests, one-shot CLI
    /// use).
    pub fn without_persistence(config: Config) -> Result<Self> {
        Self::build(config, None, None)
    }

    fn build(
        config: Config,
        rollout: Option<RolloutRecorder>,
        compact_paths: Option<CompactionPaths>,
    ) -> Result<Self> {
        let sessions = Arc::new(SessionManager::new());
        let bash = Arc::new(tokio::sync::Mutex::new(BashSession::new()?));

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(BashTool::new(bash)).definition()?);
        registry.register(Arc::new(ApplyPatchTool).definition()?);
        registry.register(Arc::new(BgStartTool::new(Arc::clone(&sessions))).definition()?);
        registry.register(Arc::new(BgReadTool::new(Arc::clone(&sessions))).definition()?);
        registry.register(Arc::new(BgWriteTool::new(Arc::clone(&sessions))).definition()?);
        registry.register(Arc::new(BgResizeTool::new(Arc::clone(&sessions))).definition()?);
        registry.register(Arc::new(BgStopTool::new(Arc::clone(&sessions))).definition()?);
        registry.register(Arc::new(BgListTool::new(Arc::clone(&sessions))).definition()?);

        let (events, summary, anchor) = match &compact_paths {
            Some(paths) => {
                let state = loaf_compact::load_state(paths);
                (
                    EventLog::from_events(loaf_compact::load_events(paths)),
                    state.summary_state,
                    state.last_anchor_event_index,
                )
            }
            None => (EventLog::new(), SummaryState::default(), 0),
        };

        Ok(Self {
            config,
            tools: ToolRuntime::new(Arc::clone(&registry)),
            registry,
            sessions,
            events: StdMutex::new(events),
            summary: StdMutex::new(summary),
            anchor: StdMutex::new(anchor),
            compact_paths,
            rollout,
            compact_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Dispatch a tool call, recording the traffic in the compaction log.
    pub async fn run_tool(&self, call: &ToolCall, cancel: Option<CancelSignal>) -> ToolResult {
        if call.name == "bash"
            && let Some(command) = call.input.get("command").and_then(Value::as_str)
        {
            self.record_event(
                CompactEventKind::CommandRun,
                payload(&[("command", json!(command))]),
            );
        }

        let result = self.tools.dispatch(call, cancel).await;

        // Both the dedicated tool and a bash-intercepted heredoc report the
        // same added/modified/deleted shape on success.
        if result.ok && matches!(call.name.as_str(), "apply_patch" | "bash") {
            for key in ["added", "modified", "deleted"] {
                if let Some(paths) = result.output.get(key).and_then(Value::as_array) {
                    for path in paths.iter().filter_map(Value::as_str) {
                        let mut event = payload(&[("path", json!(path))]);
                        if key == "added" {
                            event.insert("added".to_string(), json!([path]));
                        }
                        self.record_event(CompactEventKind::FileWritePatch, event);
                    }
                }
            }
        }

        let mut tool_payload = payload(&[
            ("tool", json!(call.name)),
            ("ok", json!(result.ok)),
            ("output", json!(clip(&result.output.to_string()))),
        ]);
        if let Some(error) = &result.error {
            tool_payload.insert("error".to_string(), json!(error));
        }
        self.record_event(CompactEventKind::ToolResult, tool_payload);

        if let Some(error) = &result.error {
            self.record_event(
                CompactEventKind::ErrorObserved,
                payload(&[("message", json!(error))]),
            );
        }

        result
    }

    pub fn record_user_message(&self, text: &str) {
        self.record_event(CompactEventKind::UserMsg, payload(&[("text", json!(text))]));
    }

    pub fn record_assistant_message(&self, text: &str) {
        self.record_event(
            CompactEventKind::AssistantMsg,
            payload(&[("text", json!(text))]),
        );
    }

    fn record_event(&self, kind: CompactEventKind, event_payload: Map<String, Value>) {
        let appended = {
            let Ok(mut events) = self.events.lock() else {
                return;
            };
            events.append(kind, event_payload).clone()
        };
        if let Some(paths) = &self.compact_paths
            && let Err(err) = loaf_compact::append_events(paths, std::slice::from_ref(&appended))
        {
            tracing::warn!(error = %err, "failed to persist compact event");
        }
    }

    /// The messages a model client would be handed right now: summary first,
    /// then the tail of events above the anchor.
    pub fn model_context(&self) -> Vec<ChatMessage> {
        let summary = self
            .summary
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        let anchor = self.anchor.lock().map(|a| *a).unwrap_or(0);
        let events = self
            .events
            .lock()
            .map(|log| log.events().to_vec())
            .unwrap_or_default();
        build_model_context_messages(&summary, &events, anchor)
    }

    /// Run one compaction pass behind the per-session gate. `summarize_delta`
    /// is the caller's summariser (typically an out-of-process model call);
    /// it must not re-enter this runtime's compaction.
    pub async fn compact<S, Fut>(
        &self,
        reason: CompactReason,
        force: bool,
        pinned_token_estimate: u64,
        estimate_history_tokens: impl Fn(&[ChatMessage]) -> u64,
        summarize_delta: S,
    ) -> Result<CompactOutcome>
    where
        S: FnOnce(SummaryState, Vec<CompactEvent>) -> Fut,
        Fut: Future<Output = std::result::Result<SummaryState, loaf_compact::CompactError>>,
    {
        let _gate = self.compact_gate.lock().await;

        let events = self
            .events
            .lock()
            .map(|log| log.events().to_vec())
            .unwrap_or_default();
        let summary = self
            .summary
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        let anchor_before = self.anchor.lock().map(|a| *a).unwrap_or(0);

        let request = CompactRequest {
            context_window_tokens: self.config.context_window_tokens,
            pinned_token_estimate,
            reason,
            force,
        };
        let outcome = run_compaction(
            &events,
            &summary,
            anchor_before,
            &self.config.compaction,
            &request,
            estimate_history_tokens,
            summarize_delta,
        )
        .await?;

        if outcome.compressed {
            if let Ok(mut summary) = self.summary.lock() {
                *summary = outcome.summary.clone();
            }
            if let Ok(mut anchor) = self.anchor.lock() {
                *anchor = outcome.anchor;
            }
            if let Some(paths) = &self.compact_paths {
                let state = PersistedCompactionState {
                    schema_version: 1,
                    last_anchor_event_index: outcome.anchor,
                    backfilled_from_rollout: false,
                    summary_state: outcome.summary.clone(),
                    updated_at_iso: outcome.summary.updated_at_iso.clone(),
                };
                loaf_compact::save_state(paths, &state)?;
                loaf_compact::save_summary_markdown(paths, &outcome.summary)?;
            }
        }
        Ok(outcome)
    }

    pub fn rollout(&self) -> Option<&RolloutRecorder> {
        self.rollout.as_ref()
    }

    /// Terminate all background sessions; called on process exit.
    pub fn shutdown(&self) {
        self.sessions.shutdown_all();
    }
}

fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn clip(text: &str) -> String {
    if text.chars().count() <= EVENT_PREVIEW_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(EVENT_PREVIEW_CHARS).collect();
    format!("{clipped}…")
}
