//! Conversation Tools
//!
//! `conversation_search` (word-overlap over title + summary),
//! `conversation_list` (paged metadata), and `conversation_capture`
//! (idempotent transcript ingestion that feeds the miner).

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use mnesis_core::{ConversationRecord, MessageRecord};

use super::memory::parse_args;
use super::ToolContext;

pub fn search_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {"type": "string"},
            "limit": {"type": "integer", "minimum": 1, "maximum": 50},
            "source_llm": {"type": "string"}
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
    source_llm: Option<String>,
}

fn default_limit() -> usize {
    5
}

pub async fn execute_search(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: SearchArgs = parse_args(args)?;
    let store = context.core.store();
    let rows = store
        .list_conversations(args.source_llm.as_deref(), args.limit * 3, 0)
        .map_err(|e| e.to_string())?;

    // Word-overlap scoring over title + summary.
    let query_words: Vec<String> = args
        .query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let mut scored: Vec<(usize, &ConversationRecord)> = rows
        .iter()
        .filter_map(|conv| {
            let haystack = format!("{} {}", conv.title, conv.summary).to_lowercase();
            let matches = query_words.iter().filter(|w| haystack.contains(*w)).count();
            (matches > 0).then_some((matches, conv))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(Value::Array(
        scored
            .into_iter()
            .take(args.limit)
            .map(|(_, conv)| {
                serde_json::json!({
                    "conversation_id": conv.id,
                    "title": conv.title,
                    "source_llm": conv.source_llm,
                    "date": conv.started_at,
                    "summary": conv.summary,
                })
            })
            .collect(),
    ))
}

pub fn list_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "source_llm": {"type": "string"},
            "limit": {"type": "integer", "minimum": 1, "maximum": 100},
            "offset": {"type": "integer", "minimum": 0}
        }
    })
}

#[derive(Debug, Deserialize)]
struct ListArgs {
    #[serde(default)]
    source_llm: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_list_limit() -> usize {
    20
}

pub async fn execute_list(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: ListArgs = parse_args(args.or_else(|| Some(serde_json::json!({}))))?;
    let rows = context
        .core
        .store()
        .list_conversations(args.source_llm.as_deref(), args.limit.clamp(1, 100), args.offset)
        .map_err(|e| e.to_string())?;
    Ok(Value::Array(
        rows.iter()
            .map(|conv| {
                serde_json::json!({
                    "id": conv.id,
                    "title": conv.title,
                    "source_llm": conv.source_llm,
                    "message_count": conv.message_count,
                    "started_at": conv.started_at,
                    "summary": conv.summary,
                })
            })
            .collect(),
    ))
}

pub fn capture_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "source_llm": {"type": "string"},
            "raw_hash": {
                "type": "string",
                "description": "Content hash of the source transcript; repeat captures are idempotent"
            },
            "messages": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "role": {"type": "string", "enum": ["user", "assistant", "system", "tool"]},
                        "content": {"type": "string"},
                        "timestamp": {"type": "string"}
                    },
                    "required": ["role", "content"]
                }
            }
        },
        "required": ["source_llm", "messages"]
    })
}

#[derive(Debug, Deserialize)]
struct CaptureMessage {
    role: String,
    content: String,
    #[serde(default)]
    timestamp: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CaptureArgs {
    #[serde(default)]
    title: Option<String>,
    source_llm: String,
    #[serde(default)]
    raw_hash: Option<String>,
    messages: Vec<CaptureMessage>,
}

pub async fn execute_capture(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: CaptureArgs = parse_args(args)?;
    if args.messages.is_empty() {
        return Err("messages must not be empty".to_string());
    }

    let store = context.core.store().clone();
    let raw_hash = args.raw_hash.unwrap_or_default();

    // Idempotency: an already-imported transcript hash short-circuits.
    if !raw_hash.is_empty() {
        if let Some(existing) = store.conversation_by_hash(&raw_hash).map_err(|e| e.to_string())?
        {
            return Ok(serde_json::json!({
                "id": existing.id,
                "status": "exists",
                "message_count": existing.message_count,
            }));
        }
    }

    let now = Utc::now();
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let started_at = args.messages.iter().filter_map(|m| m.timestamp).min().unwrap_or(now);
    let ended_at = args.messages.iter().filter_map(|m| m.timestamp).max();

    let conversation = ConversationRecord {
        id: conversation_id.clone(),
        title: args.title.unwrap_or_else(|| "Untitled".to_string()),
        source_llm: args.source_llm,
        started_at,
        ended_at,
        message_count: args.messages.len() as i64,
        summary: String::new(),
        status: "archived".to_string(),
        tags: vec![],
        memory_ids: vec![],
        raw_file_hash: raw_hash,
        imported_at: now,
    };
    let messages: Vec<MessageRecord> = args
        .messages
        .into_iter()
        .enumerate()
        .map(|(index, message)| MessageRecord {
            id: format!("{conversation_id}:{index}"),
            conversation_id: conversation_id.clone(),
            role: message.role,
            content: message.content,
            timestamp: message
                .timestamp
                .unwrap_or(now + chrono::Duration::seconds(index as i64)),
            embedding: None,
        })
        .collect();

    let message_count = messages.len() as i64;
    context
        .core
        .write_queue()
        .enqueue(move |store| {
            store.upsert_conversation(&conversation)?;
            store.insert_messages(&messages)?;
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?;

    Ok(serde_json::json!({
        "id": conversation_id,
        "status": "imported",
        "message_count": message_count,
    }))
}
