//! Feedback Tool
//!
//! `memory_feedback`: raises importance for memories that genuinely
//! influenced responses and closes the session.

use serde::Deserialize;
use serde_json::Value;

use super::memory::parse_args;
use super::ToolContext;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "used_memory_ids": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Only the memory IDs that actually influenced responses"
            }
        },
        "required": ["used_memory_ids"]
    })
}

#[derive(Debug, Deserialize)]
struct FeedbackArgs {
    used_memory_ids: Vec<String>,
}

pub async fn execute(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: FeedbackArgs = parse_args(args)?;
    context
        .core
        .process_feedback(&args.used_memory_ids, Some(&context.session_id))
        .await
        .map_err(|e| e.to_string())
}
