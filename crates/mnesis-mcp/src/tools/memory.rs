//! Memory Tools
//!
//! `memory_write`, `memory_update`, `memory_delete`, `memory_restore`, and
//! `memory_list`.

use serde::Deserialize;
use serde_json::Value;

use mnesis_core::CreateMemoryParams;

use super::ToolContext;

pub fn write_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "content": {
                "type": "string",
                "description": "Third-person declarative fact, 20-1000 chars, under 128 tokens"
            },
            "category": {
                "type": "string",
                "enum": ["identity", "preferences", "skills", "relationships", "projects", "history", "working"]
            },
            "level": {
                "type": "string",
                "enum": ["semantic", "episodic", "working"],
                "description": "semantic = lasting facts, episodic = past events, working = next 72h"
            },
            "source_llm": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "privacy": {"type": "string", "enum": ["public", "sensitive", "private"]},
            "importance_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "confidence_score": {
                "type": "number",
                "minimum": 0.0,
                "maximum": 1.0,
                "description": "Semantic memories below 0.85 land in pending_review"
            }
        },
        "required": ["content", "category", "level", "source_llm"]
    })
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    content: String,
    category: String,
    level: String,
    source_llm: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    privacy: Option<String>,
    #[serde(default)]
    importance_score: Option<f64>,
    #[serde(default)]
    confidence_score: Option<f64>,
}

pub async fn execute_write(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: WriteArgs = parse_args(args)?;
    let mut params =
        CreateMemoryParams::new(&args.content, &args.category, &args.level, &args.source_llm);
    params.tags = args.tags;
    if let Some(privacy) = args.privacy {
        params.privacy = mnesis_core::Privacy::parse_name(&privacy);
    }
    if let Some(importance) = args.importance_score {
        params.importance_score = importance.clamp(0.0, 1.0);
    }
    if let Some(confidence) = args.confidence_score {
        params.confidence_score = confidence.clamp(0.0, 1.0);
    }
    params.session_id = Some(context.session_id.clone());

    let outcome = context
        .core
        .create_memory(params)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(outcome).map_err(|e| e.to_string())
}

pub fn update_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": {"type": "string"},
            "content": {"type": "string"},
            "source_llm": {"type": "string"}
        },
        "required": ["id", "content", "source_llm"]
    })
}

#[derive(Debug, Deserialize)]
struct UpdateArgs {
    id: String,
    content: String,
    source_llm: String,
}

pub async fn execute_update(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: UpdateArgs = parse_args(args)?;
    let outcome = context
        .core
        .update_memory(
            &args.id,
            &args.content,
            &args.source_llm,
            Some(&context.session_id),
        )
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(outcome).map_err(|e| e.to_string())
}

pub fn delete_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "id": {"type": "string"}
        },
        "required": ["id"]
    })
}

#[derive(Debug, Deserialize)]
struct IdArgs {
    id: String,
}

pub async fn execute_delete(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: IdArgs = parse_args(args)?;
    let outcome = context
        .core
        .delete_memory(&args.id)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(outcome).map_err(|e| e.to_string())
}

pub fn restore_schema() -> Value {
    delete_schema()
}

pub async fn execute_restore(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: IdArgs = parse_args(args)?;
    let outcome = context
        .core
        .restore_memory(&args.id)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_value(outcome).map_err(|e| e.to_string())
}

pub fn list_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "category": {
                "type": "string",
                "enum": ["identity", "preferences", "skills", "relationships", "projects", "history", "working"]
            },
            "level": {"type": "string", "enum": ["semantic", "episodic", "working"]},
            "limit": {"type": "integer", "minimum": 1, "maximum": 100},
            "offset": {"type": "integer", "minimum": 0}
        }
    })
}

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    20
}

pub async fn execute_list(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: ListArgs = parse_args(args.or_else(|| Some(serde_json::json!({}))))?;
    let rows = context
        .core
        .list_memories(
            args.category.as_deref(),
            args.level.as_deref(),
            args.limit.clamp(1, 100),
            args.offset,
        )
        .map_err(|e| e.to_string())?;
    Ok(Value::Array(rows))
}

pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: Option<Value>) -> Result<T, String> {
    let value = args.ok_or_else(|| "Missing arguments".to_string())?;
    serde_json::from_value(value).map_err(|e| format!("Invalid arguments: {e}"))
}
