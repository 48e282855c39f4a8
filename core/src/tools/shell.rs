//! The foreground `bash` tool: one-shot commands with a persistent cwd/env
//! baseline. `apply_patch` heredocs are intercepted and routed through the
//! patch applier instead of a shell.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use loaf_apply_patch::MaybeApplyPatch;
use loaf_apply_patch::maybe_parse_apply_patch;
use serde_json::Value;
use serde_json::json;

use crate::bash::BashRequest;
use crate::bash::BashSession;
use crate::error::LoafErr;
use crate::error::Result;
use crate::tools::ToolContext;
use crate::tools::ToolDefinition;
use crate::tools::ToolFuture;
use crate::tools::ToolHandler;
use crate::tools::ToolResult;
use crate::tools::optional_bool;
use crate::tools::optional_str;
use crate::tools::optional_string_map;
use crate::tools::optional_u64;
use crate::tools::require_str;
use crate::tools::schema::JsonSchema;

pub struct BashTool {
    /// Foreground calls on one logical session must be serialized; the mutex
    /// at this boundary is that serialization.
    session: Arc<tokio::sync::Mutex<BashSession>>,
}

impl BashTool {
    pub fn new(session: Arc<tokio::sync::Mutex<BashSession>>) -> Self {
        Self { session }
    }

    pub fn definition(self: Arc<Self>) -> Result<ToolDefinition> {
        let mut properties = BTreeMap::new();
        properties.insert(
            "command".to_string(),
            JsonSchema::string("The shell command to execute"),
        );
        properties.insert(
            "timeout".to_string(),
            JsonSchema::number("Timeout in seconds (default 120, max 1200)"),
        );
        properties.insert(
            "cwd".to_string(),
            JsonSchema::string("Working directory override for this call"),
        );
        properties.insert(
            "env".to_string(),
            JsonSchema::Object {
                properties: BTreeMap::new(),
                required: None,
                additional_properties: Some(true),
            },
        );
        properties.insert(
            "reset_session".to_string(),
            JsonSchema::boolean("Restore the OS default cwd and environment first"),
        );
        ToolDefinition::new(
            "bash",
            "Run a shell command; cwd and exported variables persist across calls",
            Some(JsonSchema::Object {
                properties,
                required: Some(vec!["command".to_string()]),
                additional_properties: Some(false),
            }),
            self,
        )
    }

    async fn run_inner(&self, ctx: ToolContext, input: Value) -> Result<ToolResult> {
        let command = require_str(&input, "command")?;
        let timeout_secs = optional_u64(&input, "timeout")?;
        let cwd = optional_str(&input, "cwd")?.map(PathBuf::from);
        let env = optional_string_map(&input, "env")?;
        let reset_session = optional_bool(&input, "reset_session")?.unwrap_or(false);

        // Patches arrive disguised as shell commands; apply them directly.
        let probe = [
            "bash".to_string(),
            "-lc".to_string(),
            command.clone(),
        ];
        match maybe_parse_apply_patch(&probe) {
            MaybeApplyPatch::Body(hunks) => return apply_intercepted_patch(&hunks),
            MaybeApplyPatch::PatchParseError(err) => {
                return Err(loaf_apply_patch::ApplyPatchError::from(err).into());
            }
            MaybeApplyPatch::ShellParseError(err) => {
                return Err(LoafErr::InvalidInput(format!(
                    "apply_patch command could not be parsed: {err}"
                )));
            }
            MaybeApplyPatch::NotApplyPatch => {}
        }

        let mut session = self.session.lock().await;
        let result = session
            .run(
                BashRequest {
                    command,
                    timeout_secs,
                    cwd,
                    env,
                    reset_session,
                },
                ctx.cancel,
            )
            .await?;

        let output = json!({
            "exit_code": result.exit_code,
            "signal": result.signal,
            "duration_ms": result.duration.as_millis() as u64,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "stdout_truncated": result.stdout_truncated,
            "stderr_truncated": result.stderr_truncated,
            "cwd_before": result.cwd_before,
            "cwd_after": result.cwd_after,
            "captured_state": result.captured_state,
            "timed_out": result.timed_out,
            "aborted": result.aborted,
        });

        if result.timed_out {
            return Ok(ToolResult {
                ok: false,
                output,
                error: Some(LoafErr::Timeout.to_string()),
            });
        }
        if result.aborted {
            return Ok(ToolResult {
                ok: false,
                output,
                error: Some(LoafErr::Aborted.to_string()),
            });
        }
        if result.exit_code != 0 {
            let message = format!("command exited with status {}", result.exit_code);
            return Ok(ToolResult {
                ok: false,
                output,
                error: Some(message),
            });
        }
        Ok(ToolResult::success(output))
    }
}

fn apply_intercepted_patch(hunks: &[loaf_apply_patch::Hunk]) -> Result<ToolResult> {
    let affected = loaf_apply_patch::apply_hunks_to_files(hunks)?;
    Ok(ToolResult::success(crate::tools::patch::summary_json(
        &affected,
    )))
}

impl ToolHandler for BashTool {
    fn run<'a>(&'a self, ctx: ToolContext, input: Value) -> ToolFuture<'a> {
        Box::pin(self.run_inner(ctx, input))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn tool() -> BashTool {
        BashTool::new(Arc::new(tokio::sync::Mutex::new(
            BashSession::new().unwrap(),
        )))
    }

    fn ctx() -> ToolContext {
        ToolContext {
            now: time::OffsetDateTime::now_utc(),
            cancel: None,
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn command_output_round_trips() {
        let tool = tool();
        let result = tool
            .run_inner(ctx(), json!({"command": "printf hello"}))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.output["stdout"], "hello");
        assert_eq!(result.output["exit_code"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_command_is_invalid_input() {
        let tool = tool();
        let err = tool.run_inner(ctx(), json!({})).await.unwrap_err();
        assert!(matches!(err, LoafErr::InvalidInput(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn env_must_be_a_string_map() {
        let tool = tool();
        let err = tool
            .run_inner(ctx(), json!({"command": "true", "env": {"N": 1}}))
            .await
            .unwrap_err();
        assert!(matches!(err, LoafErr::InvalidInput(_)));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_zero_exit_fails_with_full_output() {
        let tool = tool();
        let result = tool
            .run_inner(ctx(), json!({"command": "printf partial; exit 4"}))
            .await
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.output["exit_code"], 4);
        assert_eq!(result.output["stdout"], "partial");
        assert_eq!(result.error.as_deref(), Some("command exited with status 4"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn apply_patch_heredoc_is_intercepted() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("new.txt");
        let command = format!(
            "apply_patch <<'EOF'\n*** Begin Patch\n*** Add File: {}\n+made it\n*** End Patch\nEOF",
            target.display()
        );
        let tool = tool();
        let result = tool
            .run_inner(ctx(), json!({"command": command}))
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "made it\n");
        let summary = result.output["summary"].as_str().unwrap();
        assert!(summary.contains(&format!("A {}", target.display())));
    }
}
