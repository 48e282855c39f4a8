//! The `apply_patch` tool: parse the patch dialect, apply it, and report the
//! git-style summary.

use std::collections::BTreeMap;
use std::sync::Arc;

use loaf_apply_patch::AffectedPaths;
use loaf_apply_patch::parse_patch;
use serde_json::Value;
use serde_json::json;

use crate::error::Result;
use crate::tools::ToolContext;
use crate::tools::ToolDefinition;
use crate::tools::ToolFuture;
use crate::tools::ToolHandler;
use crate::tools::ToolResult;
use crate::tools::require_str;
use crate::tools::schema::JsonSchema;

pub struct ApplyPatchTool;

impl ApplyPatchTool {
    pub fn definition(self: Arc<Self>) -> Result<ToolDefinition> {
        let mut properties = BTreeMap::new();
        properties.insert(
            "patch".to_string(),
            JsonSchema::string("Full patch text, from '*** Begin Patch' to '*** End Patch'"),
        );
        ToolDefinition::new(
            "apply_patch",
            "Apply a patch in the add/update/delete dialect to the filesystem",
            Some(JsonSchema::Object {
                properties,
                required: Some(vec!["patch".to_string()]),
                additional_properties: Some(false),
            }),
            self,
        )
    }

    async fn run_inner(&self, input: Value) -> Result<ToolResult> {
        let patch = require_str(&input, "patch")?;
        let hunks = parse_patch(&patch).map_err(loaf_apply_patch::ApplyPatchError::from)?;
        let affected = loaf_apply_patch::apply_hunks_to_files(&hunks)?;
        Ok(ToolResult::success(summary_json(&affected)))
    }
}

impl ToolHandler for ApplyPatchTool {
    fn run<'a>(&'a self, _ctx: ToolContext, input: Value) -> ToolFuture<'a> {
        Box::pin(self.run_inner(input))
    }
}

/// The `A/M/D` summary block plus structured path lists.
pub(crate) fn summary_json(affected: &AffectedPaths) -> Value {
    let mut summary = String::from("Success. Updated the following files:\n");
    for path in &affected.added {
        summary.push_str(&format!("A {}\n", path.display()));
    }
    for path in &affected.modified {
        summary.push_str(&format!("M {}\n", path.display()));
    }
    for path in &affected.deleted {
        summary.push_str(&format!("D {}\n", path.display()));
    }
    json!({
        "summary": summary,
        "added": affected.added,
        "modified": affected.modified,
        "deleted": affected.deleted,
    })
}
