//! Context Snapshot Tool
//!
//! `context_snapshot`: a Markdown digest of active semantic memories,
//! section order rotated per context, capped at 800 tokens. Meant to be
//! called silently at conversation start.

use serde::Deserialize;
use serde_json::Value;

use super::memory::parse_args;
use super::ToolContext;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "context": {
                "type": "string",
                "enum": ["development", "personal", "creative", "business"],
                "description": "Reorders sections to prioritize the most relevant categories"
            }
        }
    })
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotArgs {
    #[serde(default)]
    context: Option<String>,
}

pub async fn execute(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: SnapshotArgs = parse_args(args.or_else(|| Some(serde_json::json!({}))))?;
    let snapshot = context
        .core
        .get_snapshot(args.context.as_deref())
        .await
        .map_err(|e| e.to_string())?;
    Ok(Value::String(snapshot))
}
