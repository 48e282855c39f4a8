//! Tools exposing the background session manager: start, incremental read,
//! stdin/key writes, resize, stop, and listing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use serde_json::json;

use crate::background::ReadRequest;
use crate::background::SessionManager;
use crate::background::StartRequest;
use crate::background::StreamSelector;
use crate::background::WriteRequest;
use crate::background::session::SessionId;
use crate::background::stream::StreamRead;
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

fn session_id_arg(input: &Value) -> Result<SessionId> {
    match input.get("session_id").and_then(Value::as_u64) {
        Some(id) if id <= u32::MAX as u64 => Ok(SessionId(id as u32)),
        Some(_) => Err(LoafErr::InvalidInput(
            "'session_id' is out of range".to_string(),
        )),
        None => Err(LoafErr::InvalidInput(
            "missing required 'session_id'".to_string(),
        )),
    }
}

fn session_id_schema() -> JsonSchema {
    JsonSchema::number("Id of the background session")
}

fn stream_read_json(read: &StreamRead) -> Value {
    json!({
        "text": read.text,
        "dropped": read.dropped,
        "has_more": read.has_more,
    })
}

// --- bg_start ---------------------------------------------------------------

pub struct BgStartTool {
    manager: Arc<SessionManager>,
}

impl BgStartTool {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn definition(self: Arc<Self>) -> Result<ToolDefinition> {
        let mut properties = BTreeMap::new();
        properties.insert(
            "command".to_string(),
            JsonSchema::string("Command to run in the session"),
        );
        properties.insert(
            "session_name".to_string(),
            JsonSchema::string("Friendly name, also the reuse key"),
        );
        properties.insert("cwd".to_string(), JsonSchema::string("Working directory"));
        properties.insert(
            "env".to_string(),
            JsonSchema::Object {
                properties: BTreeMap::new(),
                required: None,
                additional_properties: Some(true),
            },
        );
        properties.insert(
            "full_terminal".to_string(),
            JsonSchema::boolean("Allocate a PTY (default true)"),
        );
        properties.insert(
            "terminal_cols".to_string(),
            JsonSchema::number("Terminal columns (40..400, default 120)"),
        );
        properties.insert(
            "terminal_rows".to_string(),
            JsonSchema::number("Terminal rows (10..200, default 36)"),
        );
        properties.insert(
            "reuse_session".to_string(),
            JsonSchema::boolean("Reuse a matching running session"),
        );
        ToolDefinition::new(
            "bg_start",
            "Start (or reuse) a long-lived background shell session",
            Some(JsonSchema::Object {
                properties,
                required: Some(vec!["command".to_string()]),
                additional_properties: Some(false),
            }),
            self,
        )
    }

    async fn run_inner(&self, input: Value) -> Result<ToolResult> {
        let command = require_str(&input, "command")?;
        let request = StartRequest {
            command,
            session_name: optional_str(&input, "session_name")?,
            cwd: optional_str(&input, "cwd")?.map(PathBuf::from),
            env: optional_string_map(&input, "env")?.unwrap_or_default(),
            full_terminal: optional_bool(&input, "full_terminal")?.unwrap_or(true),
            terminal_cols: optional_u64(&input, "terminal_cols")?.map(|v| v as u16),
            terminal_rows: optional_u64(&input, "terminal_rows")?.map(|v| v as u16),
            reuse_session: optional_bool(&input, "reuse_session")?.unwrap_or(false),
            shell: None,
        };
        let outcome = self.manager.start(request).await?;
        Ok(ToolResult::success(json!({
            "session": outcome.session,
            "reused": outcome.reused,
        })))
    }
}

impl ToolHandler for BgStartTool {
    fn run<'a>(&'a self, _ctx: ToolContext, input: Value) -> ToolFuture<'a> {
        Box::pin(self.run_inner(input))
    }
}

// --- bg_read ----------------------------------------------------------------

pub struct BgReadTool {
    manager: Arc<SessionManager>,
}

impl BgReadTool {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn definition(self: Arc<Self>) -> Result<ToolDefinition> {
        let mut properties = BTreeMap::new();
        properties.insert("session_id".to_string(), session_id_schema());
        properties.insert(
            "stream".to_string(),
            JsonSchema::string("'both', 'stdout', or 'stderr' (default 'both')"),
        );
        properties.insert(
            "max_chars".to_string(),
            JsonSchema::number("Maximum characters to return (default 8000, max 120000)"),
        );
        properties.insert(
            "peek".to_string(),
            JsonSchema::boolean("Read without advancing the cursor"),
        );
        ToolDefinition::new(
            "bg_read",
            "Incrementally read new output from a background session",
            Some(JsonSchema::Object {
                properties,
                required: Some(vec!["session_id".to_string()]),
                additional_properties: Some(false),
            }),
            self,
        )
    }

    async fn run_inner(&self, input: Value) -> Result<ToolResult> {
        let id = session_id_arg(&input)?;
        let stream = match optional_str(&input, "stream")?.as_deref() {
            None | Some("both") => StreamSelector::Both,
            Some("stdout") => StreamSelector::Stdout,
            Some("stderr") => StreamSelector::Stderr,
            Some(other) => {
                return Err(LoafErr::InvalidInput(format!(
                    "'stream' must be 'both', 'stdout', or 'stderr', got '{other}'"
                )));
            }
        };
        let request = ReadRequest {
            stream,
            max_chars: optional_u64(&input, "max_chars")?.map(|v| v as usize),
            peek: optional_bool(&input, "peek")?.unwrap_or(false),
        };
        let response = self.manager.read(id, request)?;
        Ok(ToolResult::success(json!({
            "session_id": response.id.0,
            "status": response.status,
            "exit_code": response.exit_code,
            "signal": response.signal,
            "stdout": response.stdout.as_ref().map(stream_read_json),
            "stderr": response.stderr.as_ref().map(stream_read_json),
        })))
    }
}

impl ToolHandler for BgReadTool {
    fn run<'a>(&'a self, _ctx: ToolContext, input: Value) -> ToolFuture<'a> {
        Box::pin(self.run_inner(input))
    }
}

// --- bg_write ---------------------------------------------------------------

pub struct BgWriteTool {
    manager: Arc<SessionManager>,
}

impl BgWriteTool {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn definition(self: Arc<Self>) -> Result<ToolDefinition> {
        let mut properties = BTreeMap::new();
        properties.insert("session_id".to_string(), session_id_schema());
        properties.insert(
            "input".to_string(),
            JsonSchema::string("Raw text to send to the session"),
        );
        properties.insert(
            "append_newline".to_string(),
            JsonSchema::boolean("Append a newline to the input (default true)"),
        );
        properties.insert(
            "key".to_string(),
            JsonSchema::string(
                "Named key: enter, tab, esc, up, down, left, right, home, end, pgup, pgdown, backspace, delete, ctrl+c, ctrl+d, ctrl+z",
            ),
        );
        properties.insert(
            "repeat".to_string(),
            JsonSchema::number("Repeat count for the key (1..100)"),
        );
        ToolDefinition::new(
            "bg_write",
            "Send input text or a special key to a background session",
            Some(JsonSchema::Object {
                properties,
                required: Some(vec!["session_id".to_string()]),
                additional_properties: Some(false),
            }),
            self,
        )
    }

    async fn run_inner(&self, input: Value) -> Result<ToolResult> {
        let id = session_id_arg(&input)?;
        let request = WriteRequest {
            input: optional_str(&input, "input")?,
            append_newline: optional_bool(&input, "append_newline")?.unwrap_or(true),
            key: optional_str(&input, "key")?,
            repeat: optional_u64(&input, "repeat")?.map(|v| v.min(u32::MAX as u64) as u32),
        };
        self.manager.write(id, request).await?;
        Ok(ToolResult::success(json!({ "session_id": id.0, "written": true })))
    }
}

impl ToolHandler for BgWriteTool {
    fn run<'a>(&'a self, _ctx: ToolContext, input: Value) -> ToolFuture<'a> {
        Box::pin(self.run_inner(input))
    }
}

// --- bg_resize --------------------------------------------------------------

pub struct BgResizeTool {
    manager: Arc<SessionManager>,
}

impl BgResizeTool {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn definition(self: Arc<Self>) -> Result<ToolDefinition> {
        let mut properties = BTreeMap::new();
        properties.insert("session_id".to_string(), session_id_schema());
        properties.insert("cols".to_string(), JsonSchema::number("Columns (40..400)"));
        properties.insert("rows".to_string(), JsonSchema::number("Rows (10..200)"));
        ToolDefinition::new(
            "bg_resize",
            "Resize the pseudo-terminal of a background session",
            Some(JsonSchema::Object {
                properties,
                required: Some(vec![
                    "session_id".to_string(),
                    "cols".to_string(),
                    "rows".to_string(),
                ]),
                additional_properties: Some(false),
            }),
            self,
        )
    }

    async fn run_inner(&self, input: Value) -> Result<ToolResult> {
        let id = session_id_arg(&input)?;
        let cols = optional_u64(&input, "cols")?
            .ok_or_else(|| LoafErr::InvalidInput("missing required 'cols'".to_string()))?;
        let rows = optional_u64(&input, "rows")?
            .ok_or_else(|| LoafErr::InvalidInput("missing required 'rows'".to_string()))?;
        let (cols, rows) = self
            .manager
            .resize(id, cols.min(u16::MAX as u64) as u16, rows.min(u16::MAX as u64) as u16)?;
        Ok(ToolResult::success(
            json!({ "session_id": id.0, "cols": cols, "rows": rows }),
        ))
    }
}

impl ToolHandler for BgResizeTool {
    fn run<'a>(&'a self, _ctx: ToolContext, input: Value) -> ToolFuture<'a> {
        Box::pin(self.run_inner(input))
    }
}

// --- bg_stop ----------------------------------------------------------------

pub struct BgStopTool {
    manager: Arc<SessionManager>,
}

impl BgStopTool {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn definition(self: Arc<Self>) -> Result<ToolDefinition> {
        let mut properties = BTreeMap::new();
        properties.insert("session_id".to_string(), session_id_schema());
        properties.insert(
            "force".to_string(),
            JsonSchema::boolean("SIGKILL instead of SIGTERM"),
        );
        ToolDefinition::new(
            "bg_stop",
            "Terminate a background session",
            Some(JsonSchema::Object {
                properties,
                required: Some(vec!["session_id".to_string()]),
                additional_properties: Some(false),
            }),
            self,
        )
    }

    async fn run_inner(&self, input: Value) -> Result<ToolResult> {
        let id = session_id_arg(&input)?;
        let force = optional_bool(&input, "force")?.unwrap_or(false);
        self.manager.stop(id, force).await?;
        Ok(ToolResult::success(
            json!({ "session_id": id.0, "stopping": true, "force": force }),
        ))
    }
}

impl ToolHandler for BgStopTool {
    fn run<'a>(&'a self, _ctx: ToolContext, input: Value) -> ToolFuture<'a> {
        Box::pin(self.run_inner(input))
    }
}

// --- bg_list ----------------------------------------------------------------

pub struct BgListTool {
    manager: Arc<SessionManager>,
}

impl BgListTool {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    pub fn definition(self: Arc<Self>) -> Result<ToolDefinition> {
        ToolDefinition::new(
            "bg_list",
            "List background sessions and their states",
            Some(JsonSchema::Object {
                properties: BTreeMap::new(),
                required: None,
                additional_properties: Some(false),
            }),
            self,
        )
    }

    async fn run_inner(&self) -> Result<ToolResult> {
        Ok(ToolResult::success(
            json!({ "sessions": self.manager.list() }),
        ))
    }
}

impl ToolHandler for BgListTool {
    fn run<'a>(&'a self, _ctx: ToolContext, _input: Value) -> ToolFuture<'a> {
        Box::pin(self.run_inner())
    }
}
