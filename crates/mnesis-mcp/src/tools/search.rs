//! Search Tool
//!
//! `memory_read`: semantic retrieval re-ranked by similarity, importance,
//! and recency, with an optional context boost.

use serde::Deserialize;
use serde_json::Value;

use super::memory::parse_args;
use super::ToolContext;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {"type": "string"},
            "limit": {"type": "integer", "minimum": 0, "maximum": 50},
            "context": {
                "type": "string",
                "enum": ["development", "personal", "creative", "business"],
                "description": "Boosts memories whose tags match this context (x1.3 on final score)"
            }
        },
        "required": ["query"]
    })
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    context: Option<String>,
}

fn default_limit() -> usize {
    5
}

pub async fn execute(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: SearchArgs = parse_args(args)?;
    let hits = context
        .core
        .search_memories(
            &args.query,
            args.limit.min(50),
            args.context.as_deref(),
            Some(&context.session_id),
        )
        .await
        .map_err(|e| e.to_string())?;

    // Projections only: vectors and distances never reach the client.
    Ok(Value::Array(
        hits.iter().map(|hit| hit.memory.projection()).collect(),
    ))
}
