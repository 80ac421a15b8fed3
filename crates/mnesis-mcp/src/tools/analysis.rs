//! Conversation Analysis Tools
//!
//! Unified `conversation_analysis` tool. Actions:
//! - `run`: enqueue a mining job (deduped against active jobs)
//! - `run_now`: synchronous single-flight run, returns the report
//! - `status`: single-flight runtime snapshot
//! - `jobs`: job counts + recent jobs
//! - `cancel`: cancel a pending job

use serde::Deserialize;
use serde_json::Value;

use mnesis_core::{MiningOptions, MiningRun};

use super::memory::parse_args;
use super::ToolContext;

pub fn schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "action": {"type": "string", "enum": ["run", "run_now", "status", "jobs", "cancel"]},
            "dry_run": {"type": "boolean"},
            "force_reanalyze": {"type": "boolean"},
            "provider": {"type": "string", "enum": ["auto", "openai", "anthropic", "ollama", "heuristic"]},
            "max_conversations": {"type": "integer", "minimum": 1, "maximum": 400},
            "max_new_memories": {"type": "integer", "minimum": 1, "maximum": 500},
            "min_confidence": {"type": "number", "minimum": 0.5, "maximum": 0.99},
            "concurrency": {"type": "integer", "minimum": 1, "maximum": 4},
            "conversation_ids": {"type": "array", "items": {"type": "string"}},
            "require_llm_configured": {"type": "boolean"},
            "priority": {"type": "integer", "minimum": -20, "maximum": 20},
            "job_id": {"type": "string"},
            "limit": {"type": "integer", "minimum": 1, "maximum": 80}
        },
        "required": ["action"]
    })
}

#[derive(Debug, Deserialize)]
struct AnalysisArgs {
    action: String,
    #[serde(default)]
    dry_run: Option<bool>,
    #[serde(default)]
    force_reanalyze: Option<bool>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    max_conversations: Option<usize>,
    #[serde(default)]
    max_new_memories: Option<usize>,
    #[serde(default)]
    min_confidence: Option<f64>,
    #[serde(default)]
    concurrency: Option<usize>,
    #[serde(default)]
    conversation_ids: Option<Vec<String>>,
    #[serde(default)]
    require_llm_configured: Option<bool>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

impl AnalysisArgs {
    fn to_options(&self) -> MiningOptions {
        let mut options = MiningOptions::default();
        if let Some(dry_run) = self.dry_run {
            options.dry_run = dry_run;
        }
        if let Some(force) = self.force_reanalyze {
            options.force_reanalyze = force;
        }
        if let Some(provider) = &self.provider {
            options.provider = provider.clone();
        }
        if let Some(max) = self.max_conversations {
            options.max_conversations = max;
        }
        if let Some(max) = self.max_new_memories {
            options.max_new_memories = max;
        }
        if let Some(min) = self.min_confidence {
            options.min_confidence = min;
        }
        if let Some(concurrency) = self.concurrency {
            options.concurrency = concurrency;
        }
        options.conversation_ids = self.conversation_ids.clone();
        options.require_llm_configured = self.require_llm_configured;
        options
    }
}

pub async fn execute(context: &ToolContext, args: Option<Value>) -> Result<Value, String> {
    let args: AnalysisArgs = parse_args(args)?;
    match args.action.as_str() {
        "run" => {
            let outcome = context
                .jobs
                .enqueue(
                    "manual",
                    args.to_options(),
                    args.priority.unwrap_or(0),
                    2,
                    None,
                    true,
                )
                .await
                .map_err(|e| e.to_string())?;
            serde_json::to_value(outcome).map_err(|e| e.to_string())
        }
        "run_now" => {
            let run = context
                .miner
                .run_singleflight("manual", false, args.to_options())
                .await
                .map_err(|e| e.to_string())?;
            match run {
                MiningRun::Busy { message } => Ok(serde_json::json!({
                    "status": "busy",
                    "message": message,
                })),
                MiningRun::Completed(report) => {
                    serde_json::to_value(report).map_err(|e| e.to_string())
                }
            }
        }
        "status" => {
            serde_json::to_value(context.miner.runtime_status()).map_err(|e| e.to_string())
        }
        "jobs" => context.jobs.overview(args.limit).map_err(|e| e.to_string()),
        "cancel" => {
            let job_id = args
                .job_id
                .ok_or_else(|| "job_id is required for cancel".to_string())?;
            let job = context
                .jobs
                .cancel(&job_id)
                .await
                .map_err(|e| e.to_string())?;
            match job {
                Some(job) => serde_json::to_value(job).map_err(|e| e.to_string()),
                None => Err(format!("Job not found: {job_id}")),
            }
        }
        other => Err(format!("Unknown action: {other}")),
    }
}
