//! Conflict Workbench Tools
//!
//! Unified `conflicts` tool. Actions: `list` (pending conflicts) and
//! `resolve` (kept_existing / merged / versioned / overwritten).

use serde::Deserialize;
use serde_json::Value;

use mnesis_core::ConflictResolution;

use super::memory::parse_args;
use super::ToolContext;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "action": {"type": "string", "enum": ["list", "resolve"]},
            "limit": {"type": "integer", "minimum": 1, "maximum": 100},
            "conflict_id": {"type": "string"},
            "resolution": {
                "type": "string",
                "enum": ["kept_existing", "merged", "versioned", "overwritten"]
            },
            "merged_content": {
                "type": "string",
                "description": "Required when resolution is 'merged'"
            },
            "resolved_by": {"type": "string"}
        },
        "required": ["action"]
    })
}

#[derive(Debug, Deserialize)]
struct ConflictArgs {
    action: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    conflict_id: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    merged_content: Option<String>,
    #[serde(default)]
    resolved_by: Option<String>,
}

fn default_limit() -> usize {
    20
}

pub async fn execute(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: ConflictArgs = parse_args(args)?;
    match args.action.as_str() {
        "list" => {
            let pending = context
                .workbench
                .list_pending(args.limit.clamp(1, 100))
                .map_err(|e| e.to_string())?;
            serde_json::to_value(pending).map_err(|e| e.to_string())
        }
        "resolve" => {
            let conflict_id = args
                .conflict_id
                .ok_or_else(|| "conflict_id is required for resolve".to_string())?;
            let resolution = args
                .resolution
                .as_deref()
                .and_then(ConflictResolution::parse_name)
                .ok_or_else(|| {
                    "resolution must be one of kept_existing, merged, versioned, overwritten"
                        .to_string()
                })?;
            let outcome = context
                .workbench
                .resolve(
                    &context.core,
                    &conflict_id,
                    resolution,
                    args.merged_content.as_deref(),
                    args.resolved_by.as_deref().unwrap_or("mcp"),
                )
                .await
                .map_err(|e| e.to_string())?;
            serde_json::to_value(outcome).map_err(|e| e.to_string())
        }
        other => Err(format!("Unknown action: {other}")),
    }
}
