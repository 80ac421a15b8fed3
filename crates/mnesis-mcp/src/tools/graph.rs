//! Graph Tool
//!
//! `memory_graph`: BFS subgraph around a memory, depth 1-5, with 180-char
//! content previews.

use serde::Deserialize;
use serde_json::Value;

use super::memory::parse_args;
use super::ToolContext;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "start_memory_id": {"type": "string"},
            "depth": {"type": "integer", "minimum": 1, "maximum": 5}
        },
        "required": ["start_memory_id"]
    })
}

#[derive(Debug, Deserialize)]
struct GraphArgs {
    start_memory_id: String,
    #[serde(default = "default_depth")]
    depth: u32,
}

fn default_depth() -> u32 {
    2
}

pub async fn execute(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: GraphArgs = parse_args(args)?;
    let subgraph = mnesis_core::graph_search(context.core.store(), &args.start_memory_id, args.depth)
        .map_err(|e| e.to_string())?;
    serde_json::to_value(subgraph).map_err(|e| e.to_string())
}
