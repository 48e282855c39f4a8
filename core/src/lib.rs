//! Core of the `loaf` agent runtime: process execution, the stateful and
//! background shell layers, the tool registry, and the glue that feeds the
//! compaction subsystem. The TUI, the JSON-RPC transport, and the model
//! clients live outside this crate and consume these APIs.

pub mod background;
pub mod bash;
pub mod config;
pub mod error;
pub mod exec;
pub mod ring;
pub mod rollout;
pub mod runtime;
pub mod shell;
pub mod streaming;
pub mod tools;
pub mod util;

pub use background::SessionManager;
pub use bash::BashRequest;
pub use bash::BashResult;
pub use bash::BashSession;
pub use config::Config;
pub use error::LoafErr;
pub use error::Result;
pub use exec::CancelSignal;
pub use exec::ProcessRunRequest;
pub use exec::ProcessRunResult;
pub use exec::run_process;
pub use rollout::RolloutRecorder;
pub use runtime::Runtime;
pub use shell::ResolvedShell;
pub use shell::ShellTag;
pub use shell::resolve_shell;
pub use streaming::ChunkMode;
pub use streaming::ChunkPolicy;
pub use streaming::DrainScope;
pub use streaming::QueueSnapshot;
pub use tools::ToolCall;
pub use tools::ToolDefinition;
pub use tools::ToolRegistry;
pub use tools::ToolResult;
pub use tools::ToolRuntime;
pub use util::notify_on_sigint;
