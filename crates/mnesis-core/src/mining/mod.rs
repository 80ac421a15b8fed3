//! Conversation Mining
//!
//! The transcript -> candidate -> memory pipeline. A run selects
//! high-signal conversations (incremental via the analysis index), extracts
//! candidate facts with an LLM provider or built-in heuristics, normalizes
//! and consolidates them, persists them through the candidate store, and
//! promotes the best-scoring candidates into pending-review memories.
//!
//! Runs are process-wide single-flight: concurrent callers either observe
//! `busy` or await the in-flight run.

pub mod candidates;
pub mod jobs;
pub mod provider;
pub mod text;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::ConfigHandle;
use crate::embeddings::EmbeddingService;
use crate::memory::core::{CreateMemoryParams, MemoryCore};
use crate::memory::{MemoryCategory, MemoryLevel, MemoryStatus};
use crate::storage::{AnalysisIndexRecord, MiningCandidateRecord, Result, Store};
use candidates::{CandidateResultUpdate, CandidateStatus, CandidateStore};
use provider::ProviderRuntime;

/// Tag stamped on analyzed conversations and promoted memories.
pub const ANALYSIS_TAG: &str = "auto:conversation-analysis";
const MSGCOUNT_TAG_PREFIX: &str = "auto:conversation-analysis:msgcount:";
const PROVIDER_TAG_PREFIX: &str = "auto:conversation-analysis:provider:";
const RESULT_TAG_PREFIX: &str = "auto:conversation-analysis:result:";

// ============================================================================
// EXTRACTION TYPES
// ============================================================================

/// A raw extracted candidate before the candidate store sees it.
#[derive(Debug, Clone)]
pub struct ExtractedCandidate {
    pub content: String,
    pub category: MemoryCategory,
    pub level: MemoryLevel,
    pub confidence: f64,
    pub source_message_id: String,
    pub source_message_timestamp: Option<DateTime<Utc>>,
    pub source_excerpt: String,
    pub conversation_id: String,
    pub conversation_title: String,
    pub method: String,
}

/// One hydrated conversation offered to extraction.
#[derive(Debug, Clone)]
struct ConversationContext {
    conversation_id: String,
    title: String,
    started_at: DateTime<Utc>,
    messages: Vec<ContextMessage>,
    signal_score: i64,
    conversation_message_count: i64,
    conversation_hash: String,
}

#[derive(Debug, Clone)]
struct ContextMessage {
    id: String,
    role: String,
    content: String,
    timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// OPTIONS / REPORT
// ============================================================================

/// Tunable inputs for one mining run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningOptions {
    pub dry_run: bool,
    pub force_reanalyze: bool,
    pub include_assistant_messages: bool,
    pub max_conversations: usize,
    pub max_messages_per_conversation: usize,
    pub max_candidates_per_conversation: usize,
    pub max_new_memories: usize,
    pub min_confidence: f64,
    pub provider: String,
    pub model: Option<String>,
    pub api_base_url: Option<String>,
    pub api_key: Option<String>,
    pub concurrency: usize,
    pub conversation_ids: Option<Vec<String>>,
    pub require_llm_configured: Option<bool>,
}

impl Default for MiningOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            force_reanalyze: false,
            include_assistant_messages: false,
            max_conversations: 40,
            max_messages_per_conversation: 24,
            max_candidates_per_conversation: 6,
            max_new_memories: 120,
            min_confidence: 0.78,
            provider: "auto".to_string(),
            model: None,
            api_base_url: None,
            api_key: None,
            concurrency: 2,
            conversation_ids: None,
            require_llm_configured: None,
        }
    }
}

impl MiningOptions {
    fn clamped(mut self) -> Self {
        self.max_conversations = self.max_conversations.clamp(1, 400);
        self.max_messages_per_conversation = self.max_messages_per_conversation.clamp(4, 80);
        self.max_candidates_per_conversation =
            self.max_candidates_per_conversation.clamp(1, 20);
        self.max_new_memories = self.max_new_memories.clamp(1, 500);
        self.min_confidence = candidates::normalize_confidence(self.min_confidence);
        self.concurrency = self.concurrency.clamp(1, 4);
        self
    }
}

/// Per-run write outcome counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriteStats {
    pub created: usize,
    pub merged: usize,
    pub skipped: usize,
    pub conflict_pending: usize,
    pub rejected: usize,
}

/// Full report of one mining run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiningReport {
    pub status: String,
    pub mode: String,
    pub provider: String,
    pub llm_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub conversations_scanned: usize,
    pub conversations_selected: usize,
    pub skipped_already_analyzed: usize,
    pub skipped_by_index: usize,
    pub skipped_by_tags: usize,
    pub analysis_index_size: usize,
    pub candidates_total: usize,
    pub candidate_sources: HashMap<String, usize>,
    pub candidate_store: serde_json::Value,
    pub write_stats: WriteStats,
    pub linked_conversations: usize,
    pub analyzed_marked: usize,
    pub indexed_conversations: usize,
    pub preview: Vec<serde_json::Value>,
    pub details: Vec<serde_json::Value>,
    pub llm_error_count: usize,
    pub llm_errors: Vec<String>,
    pub quality_metrics: serde_json::Value,
    pub metrics: HashMap<String, i64>,
}

/// Snapshot of the single-flight runtime state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiningRunStatus {
    pub running: bool,
    pub trigger: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_result_summary: Option<serde_json::Value>,
}

/// Outcome of a single-flight call.
#[derive(Debug)]
pub enum MiningRun {
    Busy { message: String },
    Completed(MiningReport),
}

// ============================================================================
// MINER
// ============================================================================

/// The conversation-analysis pipeline.
pub struct Miner {
    store: Arc<Store>,
    core: Arc<MemoryCore>,
    candidates: CandidateStore,
    config: Arc<ConfigHandle>,
    run_lock: tokio::sync::Mutex<()>,
    status: std::sync::Mutex<MiningRunStatus>,
}

impl Miner {
    pub fn new(
        store: Arc<Store>,
        core: Arc<MemoryCore>,
        embedder: Arc<EmbeddingService>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        let candidates = CandidateStore::new(core.write_queue().clone(), embedder);
        Self {
            store,
            core,
            candidates,
            config,
            run_lock: tokio::sync::Mutex::new(()),
            status: std::sync::Mutex::new(MiningRunStatus::default()),
        }
    }

    /// Current single-flight status snapshot.
    pub fn runtime_status(&self) -> MiningRunStatus {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Serialize mining runs across manual and scheduler triggers.
    pub async fn run_singleflight(
        &self,
        trigger: &str,
        wait_if_busy: bool,
        options: MiningOptions,
    ) -> Result<MiningRun> {
        let _guard = if wait_if_busy {
            self.run_lock.lock().await
        } else {
            match self.run_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    return Ok(MiningRun::Busy {
                        message: "Conversation analysis already running.".to_string(),
                    });
                }
            }
        };

        let started_at = Utc::now();
        if let Ok(mut status) = self.status.lock() {
            status.running = true;
            status.trigger = Some(trigger.to_string());
            status.started_at = Some(started_at);
            status.last_error = None;
        }

        let result = self.mine(options).await;

        let completed_at = Utc::now();
        if let Ok(mut status) = self.status.lock() {
            status.running = false;
            status.last_completed_at = Some(completed_at);
            status.last_duration_ms =
                Some((completed_at - started_at).num_milliseconds());
            match &result {
                Ok(report) => {
                    status.last_result_summary = Some(serde_json::json!({
                        "conversations_selected": report.conversations_selected,
                        "candidates_total": report.candidates_total,
                        "created": report.write_stats.created,
                        "rejected": report.write_stats.rejected,
                    }));
                }
                Err(e) => status.last_error = Some(e.to_string()),
            }
        }

        result.map(MiningRun::Completed)
    }

    // ========================================================================
    // THE RUN
    // ========================================================================

    /// One full mining run. See the module docs for the pipeline stages.
    pub async fn mine(&self, options: MiningOptions) -> Result<MiningReport> {
        let run_started = std::time::Instant::now();
        let options = options.clamped();
        let analysis_config = self.config.force_reload().conversation_analysis;

        let runtime = ProviderRuntime::resolve(
            &options.provider,
            options.model.as_deref(),
            options.api_base_url.as_deref(),
            options.api_key.as_deref(),
            &analysis_config,
        );
        let llm_required = options
            .require_llm_configured
            .unwrap_or(analysis_config.require_llm_configured);

        let mut llm_errors: Vec<String> = Vec::new();
        let mut use_llm = false;
        if runtime.kind.is_llm() && runtime.can_use_llm() {
            match runtime.preflight().await {
                Ok(()) => use_llm = true,
                Err(e) => llm_errors.push(e.to_string()),
            }
        } else if runtime.kind.is_llm() {
            llm_errors.push(runtime.unconfigured_reason());
        }

        let mut report = MiningReport {
            status: "ok".to_string(),
            mode: if options.dry_run { "dry_run" } else { "import" }.to_string(),
            provider: runtime.kind.as_str().to_string(),
            llm_enabled: use_llm,
            ..MiningReport::default()
        };

        if llm_required && !use_llm {
            let reason = llm_errors
                .first()
                .cloned()
                .unwrap_or_else(|| runtime.unconfigured_reason());
            report.status = "blocked".to_string();
            report.mode = "import".to_string();
            report.message = Some(reason.clone());
            report.llm_error_count = 1;
            report.llm_errors = vec![reason];
            report
                .metrics
                .insert("total_ms".into(), run_started.elapsed().as_millis() as i64);
            return Ok(report);
        }

        // --- Selection ---
        let load_started = std::time::Instant::now();
        let selection = self.load_contexts(&options)?;
        report.metrics.insert(
            "load_ms".into(),
            load_started.elapsed().as_millis() as i64,
        );
        report.conversations_scanned = selection.scanned;
        report.conversations_selected = selection.contexts.len();
        report.skipped_already_analyzed = selection.skipped_by_index + selection.skipped_by_tags;
        report.skipped_by_index = selection.skipped_by_index;
        report.skipped_by_tags = selection.skipped_by_tags;
        report.analysis_index_size = selection.index_size;

        // Source-excerpt lookup for candidate provenance.
        let mut excerpt_by_pair: HashMap<(String, String), String> = HashMap::new();
        let mut excerpt_by_message: HashMap<String, String> = HashMap::new();
        for context in &selection.contexts {
            for message in &context.messages {
                if message.role != "user" || message.id.is_empty() {
                    continue;
                }
                let excerpt = text::build_source_excerpt(&message.content, 120);
                if excerpt.is_empty() {
                    continue;
                }
                excerpt_by_pair.insert(
                    (context.conversation_id.clone(), message.id.clone()),
                    excerpt.clone(),
                );
                excerpt_by_message.entry(message.id.clone()).or_insert(excerpt);
            }
        }

        // --- Extraction (bounded concurrency) ---
        let extract_started = std::time::Instant::now();
        let (raw_candidates, candidate_sources, extraction_errors, per_conversation_extract) =
            self.extract_all(&selection.contexts, &options, &runtime, use_llm).await;
        llm_errors.extend(extraction_errors);
        report.metrics.insert(
            "extract_ms".into(),
            extract_started.elapsed().as_millis() as i64,
        );
        report.candidate_sources = candidate_sources;
        let raw_total = raw_candidates.len();

        // --- Dedup + consolidation ---
        let dedupe_started = std::time::Instant::now();
        let mut unique = dedupe_by_content(raw_candidates);
        let first_pass_unique = unique.len();
        unique = consolidate_candidates(unique, 420, 4);
        unique = dedupe_by_content(unique);
        let store_cap = (options.max_new_memories * 12).clamp(400, 4000);
        unique.truncate(store_cap);
        report.metrics.insert(
            "dedupe_ms".into(),
            dedupe_started.elapsed().as_millis() as i64,
        );
        report.candidates_total = unique.len();
        let duplicate_pruned = raw_total.saturating_sub(unique.len());

        report.preview = unique
            .iter()
            .take(40)
            .map(|c| {
                serde_json::json!({
                    "content": c.content,
                    "category": c.category,
                    "level": c.level,
                    "confidence": c.confidence,
                    "conversation_id": c.conversation_id,
                    "conversation_title": c.conversation_title,
                    "source_message_id": c.source_message_id,
                    "source_excerpt": c.source_excerpt,
                    "method": c.method,
                    "suggestion_reason": build_candidate_reason(
                        &c.method,
                        &c.conversation_title,
                        &c.conversation_id,
                        &c.source_message_id,
                        c.confidence,
                        &c.source_excerpt,
                    ),
                })
            })
            .collect();

        report.llm_error_count = llm_errors.len();
        report.llm_errors = llm_errors.iter().take(3).cloned().collect();

        if options.dry_run {
            let generic_detected = unique
                .iter()
                .filter(|c| text::looks_generic_non_memory(&c.content))
                .count();
            report.quality_metrics = quality_metrics(
                raw_total,
                first_pass_unique,
                unique.len(),
                duplicate_pruned,
                generic_detected,
                0,
                0,
                0,
                0,
            );
            report
                .metrics
                .insert("total_ms".into(), run_started.elapsed().as_millis() as i64);
            return Ok(report);
        }

        // --- Persistence + promotion ---
        let source_provider = if use_llm {
            runtime.kind.as_str().to_string()
        } else {
            "heuristic".to_string()
        };
        let source_llm = format!("conversation-analyzer:{source_provider}");

        let store_started = std::time::Instant::now();
        let upsert = self
            .candidates
            .upsert_candidates(
                unique.clone(),
                &source_provider,
                &source_llm,
                analysis_config.semantic_dedupe_threshold,
            )
            .await?;
        report.metrics.insert(
            "candidate_store_ms".into(),
            store_started.elapsed().as_millis() as i64,
        );

        let promotable = candidates::select_promotable(
            &upsert.touched,
            options.max_new_memories,
            analysis_config.promotion_min_score.clamp(0.55, 0.99),
            i64::from(analysis_config.promotion_min_evidence.clamp(1, 8)),
            analysis_config.promotion_min_conversations.clamp(1, 8) as usize,
        );

        let write_started = std::time::Instant::now();
        let promotion = self
            .promote_candidates(
                &promotable,
                &source_llm,
                &excerpt_by_pair,
                &excerpt_by_message,
                &selection.contexts,
            )
            .await;
        report.metrics.insert(
            "write_ms".into(),
            write_started.elapsed().as_millis() as i64,
        );
        report.write_stats = promotion.stats.clone();
        report.details = promotion.details.clone();

        let status_updates = self.candidates.update_results(promotion.result_updates).await?;

        // --- Conversation linking / marking / index ---
        let link_started = std::time::Instant::now();
        let linked = self.link_created_memories(&promotion.created_by_conversation).await?;
        report
            .metrics
            .insert("link_ms".into(), link_started.elapsed().as_millis() as i64);
        report.linked_conversations = linked;

        let mut conversation_results: HashMap<String, String> = HashMap::new();
        let mut conv_outcomes = promotion.conv_outcomes.clone();
        for context in &selection.contexts {
            conv_outcomes
                .entry(context.conversation_id.clone())
                .or_default();
        }
        for candidate in &unique {
            if !candidate.conversation_id.is_empty() {
                conv_outcomes
                    .entry(candidate.conversation_id.clone())
                    .or_default()
                    .candidates += 1;
            }
        }
        for (conv_id, outcome) in &conv_outcomes {
            let result = if outcome.created > 0 {
                "has_memory"
            } else if outcome.errors > 0 {
                "error"
            } else {
                "none"
            };
            conversation_results.insert(conv_id.clone(), result.to_string());
        }

        let mark_started = std::time::Instant::now();
        report.analyzed_marked = self
            .mark_conversations_analyzed(
                &selection.contexts,
                &source_provider,
                &conversation_results,
            )
            .await?;
        report
            .metrics
            .insert("mark_ms".into(), mark_started.elapsed().as_millis() as i64);

        let index_started = std::time::Instant::now();
        report.indexed_conversations = self
            .upsert_analysis_index(
                &selection.contexts,
                &source_provider,
                &conversation_results,
                &conv_outcomes,
                &per_conversation_extract,
            )
            .await?;
        report
            .metrics
            .insert("index_ms".into(), index_started.elapsed().as_millis() as i64);

        report.candidate_store = serde_json::json!({
            "inserted": upsert.inserted,
            "updated": upsert.updated,
            "semantic_merged": upsert.semantic_merged,
            "generic_filtered": upsert.generic_filtered,
            "touched_total": upsert.touched.len(),
            "promotable_total": promotable.len(),
            "status_updates": status_updates,
            "promotion_min_score": analysis_config.promotion_min_score,
            "promotion_min_evidence": analysis_config.promotion_min_evidence,
            "promotion_min_conversations": analysis_config.promotion_min_conversations,
            "semantic_dedupe_threshold": analysis_config.semantic_dedupe_threshold,
        });

        let accepted_denominator =
            report.write_stats.created + report.write_stats.rejected;
        report.quality_metrics = quality_metrics(
            raw_total,
            first_pass_unique,
            unique.len(),
            duplicate_pruned,
            upsert.generic_filtered + promotion.generic_filtered,
            report.write_stats.created,
            accepted_denominator,
            promotion.with_context,
            promotable.len(),
        );
        report
            .metrics
            .insert("total_ms".into(), run_started.elapsed().as_millis() as i64);
        Ok(report)
    }

    // ========================================================================
    // SELECTION
    // ========================================================================

    fn load_contexts(&self, options: &MiningOptions) -> Result<Selection> {
        let index_map = if options.force_reanalyze {
            HashMap::new()
        } else {
            self.store.analysis_index_map()?
        };

        // Wider scan window prevents recency starvation on large imports
        // where only a small recent slice is repeatedly analyzed.
        let scan_limit = (options.max_conversations * 80).clamp(240, 12_000);
        let mut conv_rows = self.store.recent_conversations(scan_limit)?;

        if let Some(requested) = &options.conversation_ids {
            let requested: HashSet<&str> = requested
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect();
            if !requested.is_empty() {
                conv_rows.retain(|c| requested.contains(c.id.as_str()));
            }
        }

        let scanned = conv_rows.len();
        let mut skipped_by_index = 0usize;
        let mut skipped_by_tags = 0usize;
        let probe_limit = (options.max_conversations * 24).clamp(180, scanned.max(180));
        let mut hydrate: Vec<crate::storage::ConversationRecord> = Vec::new();

        for conv in conv_rows {
            if conv.message_count <= 0 {
                continue;
            }
            if !options.force_reanalyze {
                if let Some(index_row) = index_map.get(&conv.id) {
                    if index_row_is_fresh(index_row, &conv) {
                        skipped_by_index += 1;
                        continue;
                    }
                }
                if tags_mark_analyzed(&conv.tags, conv.message_count) {
                    skipped_by_tags += 1;
                    continue;
                }
            }
            hydrate.push(conv);
            if hydrate.len() >= probe_limit {
                break;
            }
        }

        let mut contexts: Vec<ConversationContext> = Vec::new();
        for conv in hydrate {
            let rows = self
                .store
                .messages_for_conversation(&conv.id, options.max_messages_per_conversation * 4)?;
            if rows.is_empty() {
                continue;
            }

            let mut messages: Vec<ContextMessage> = Vec::new();
            for msg in rows {
                let role = msg.role.trim().to_lowercase();
                if role != "user" && role != "assistant" {
                    continue;
                }
                if !options.include_assistant_messages && role != "user" {
                    continue;
                }
                let content = text::collapse_whitespace(msg.content.trim());
                if content.chars().count() < 12 {
                    continue;
                }
                let content: String = content.chars().take(720).collect();
                messages.push(ContextMessage {
                    id: msg.id,
                    role,
                    content,
                    timestamp: Some(msg.timestamp),
                });
            }
            if messages.is_empty() {
                continue;
            }

            let role_content: Vec<(String, String)> = messages
                .iter()
                .map(|m| (m.role.clone(), m.content.clone()))
                .collect();
            let signal_score = text::conversation_signal_score(&role_content);
            if signal_score <= 0 {
                continue;
            }

            let keep_from = messages
                .len()
                .saturating_sub(options.max_messages_per_conversation);
            contexts.push(ConversationContext {
                conversation_id: conv.id.clone(),
                title: if conv.title.is_empty() {
                    "Untitled".to_string()
                } else {
                    conv.title.clone()
                },
                started_at: conv.started_at,
                messages: messages.split_off(keep_from),
                signal_score,
                conversation_message_count: conv.message_count,
                conversation_hash: conv.raw_file_hash.clone(),
            });
        }

        contexts.sort_by(|a, b| {
            (b.signal_score, b.started_at.timestamp())
                .cmp(&(a.signal_score, a.started_at.timestamp()))
        });
        contexts.truncate(options.max_conversations);

        Ok(Selection {
            contexts,
            scanned,
            skipped_by_index,
            skipped_by_tags,
            index_size: index_map.len(),
        })
    }

    // ========================================================================
    // EXTRACTION
    // ========================================================================

    async fn extract_all(
        &self,
        contexts: &[ConversationContext],
        options: &MiningOptions,
        runtime: &ProviderRuntime,
        use_llm: bool,
    ) -> (
        Vec<ExtractedCandidate>,
        HashMap<String, usize>,
        Vec<String>,
        HashMap<String, i64>,
    ) {
        let semaphore = Arc::new(Semaphore::new(options.concurrency));
        let mut joins = Vec::new();

        for (index, context) in contexts.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let runtime = runtime.clone();
            let max_candidates = options.max_candidates_per_conversation;
            let min_confidence = options.min_confidence;
            joins.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let started = std::time::Instant::now();
                let mut llm_error: Option<String> = None;
                let mut batch: Vec<ExtractedCandidate> = Vec::new();
                let mut method = "heuristic";

                if use_llm {
                    match extract_with_llm(&context, &runtime, max_candidates, min_confidence)
                        .await
                    {
                        Ok(candidates) if !candidates.is_empty() => {
                            batch = candidates;
                            method = "llm";
                        }
                        Ok(_) => {}
                        Err(e) => llm_error = Some(e),
                    }
                }
                if batch.is_empty() {
                    batch = heuristic_candidates(&context, max_candidates, min_confidence);
                }
                (
                    index,
                    context.conversation_id.clone(),
                    method,
                    batch,
                    llm_error,
                    started.elapsed().as_millis() as i64,
                )
            }));
        }

        let mut ordered: Vec<(usize, String, &str, Vec<ExtractedCandidate>, Option<String>, i64)> =
            Vec::new();
        for join in joins {
            match join.await {
                Ok(result) => ordered.push(result),
                Err(e) => tracing::warn!("Extraction task panicked: {}", e),
            }
        }
        ordered.sort_by_key(|(index, ..)| *index);

        let mut all = Vec::new();
        let mut sources: HashMap<String, usize> =
            HashMap::from([("llm".to_string(), 0), ("heuristic".to_string(), 0)]);
        let mut errors = Vec::new();
        let mut extract_ms: HashMap<String, i64> = HashMap::new();
        for (_, conversation_id, method, batch, llm_error, elapsed) in ordered {
            *sources.entry(method.to_string()).or_insert(0) += batch.len();
            extract_ms.insert(conversation_id, elapsed);
            if let Some(error) = llm_error {
                errors.push(error);
            }
            all.extend(batch);
        }
        (all, sources, errors, extract_ms)
    }

    // ========================================================================
    // PROMOTION
    // ========================================================================

    async fn promote_candidates(
        &self,
        promotable: &[MiningCandidateRecord],
        source_llm: &str,
        excerpt_by_pair: &HashMap<(String, String), String>,
        excerpt_by_message: &HashMap<String, String>,
        contexts: &[ConversationContext],
    ) -> PromotionOutcome {
        let context_conv_ids: HashSet<&str> = contexts
            .iter()
            .map(|c| c.conversation_id.as_str())
            .collect();
        let mut outcome = PromotionOutcome::default();
        let mut promoted_ids: HashSet<String> = HashSet::new();

        for candidate in promotable {
            if !promoted_ids.insert(candidate.id.clone()) {
                continue;
            }
            let content = candidate.content.trim().to_string();
            let conversation_ids: Vec<String> = candidate
                .conversation_ids
                .iter()
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .collect();
            let primary_conv_id = conversation_ids.first().cloned().unwrap_or_default();
            let source_message_id = candidate
                .source_message_ids
                .iter()
                .find(|v| !v.trim().is_empty())
                .cloned()
                .unwrap_or_default();
            let method = candidate
                .methods
                .first()
                .cloned()
                .unwrap_or_else(|| "heuristic".to_string());
            let confidence = candidates::normalize_confidence(candidate.confidence_score);

            if text::looks_generic_non_memory(&content) {
                outcome.generic_filtered += 1;
                outcome.stats.rejected += 1;
                outcome.result_updates.push(CandidateResultUpdate {
                    candidate_id: candidate.id.clone(),
                    status: CandidateStatus::Rejected,
                    result: "filtered_non_memory".to_string(),
                    error: "Filtered generic/non-personal candidate.".to_string(),
                    promoted_memory_id: None,
                });
                outcome.push_detail(candidate, "filtered_non_memory", None, "");
                continue;
            }

            let source_excerpt = lookup_source_excerpt(
                &conversation_ids,
                &candidate.source_message_ids,
                excerpt_by_pair,
                excerpt_by_message,
            );
            if !source_excerpt.is_empty() {
                outcome.with_context += 1;
            }
            let suggestion_reason = build_candidate_reason(
                &method,
                "",
                &primary_conv_id,
                &source_message_id,
                confidence,
                &source_excerpt,
            );

            let mut params = CreateMemoryParams::new(
                &content,
                candidate.category.as_str(),
                candidate.level.as_str(),
                source_llm,
            );
            params.importance_score = 0.6;
            params.confidence_score = confidence;
            params.tags = vec![ANALYSIS_TAG.to_string()];
            params.source_conversation_id =
                (!primary_conv_id.is_empty()).then(|| primary_conv_id.clone());
            params.source_message_id =
                (!source_message_id.is_empty()).then(|| source_message_id.clone());
            params.source_excerpt = (!source_excerpt.is_empty()).then(|| source_excerpt.clone());
            params.suggestion_reason = Some(suggestion_reason.clone());
            params.forced_status = Some(MemoryStatus::PendingReview);
            params.created_at = Some(candidate.last_seen_at);

            match self.core.create_memory(params).await {
                Ok(result) => {
                    let memory_id = result.id.clone();
                    match result.action.as_str() {
                        "created" | "created_with_conflict" => {
                            outcome.stats.created += 1;
                            if result.action == "created_with_conflict" {
                                outcome.stats.conflict_pending += 1;
                            }
                            if let Some(memory_id) = &memory_id {
                                for conv_id in &conversation_ids {
                                    outcome
                                        .created_by_conversation
                                        .entry(conv_id.clone())
                                        .or_default()
                                        .push(memory_id.clone());
                                    if context_conv_ids.contains(conv_id.as_str()) {
                                        outcome
                                            .conv_outcomes
                                            .entry(conv_id.clone())
                                            .or_default()
                                            .created += 1;
                                    }
                                }
                            }
                            outcome.result_updates.push(CandidateResultUpdate {
                                candidate_id: candidate.id.clone(),
                                status: if result.action == "created_with_conflict" {
                                    CandidateStatus::ConflictPending
                                } else {
                                    CandidateStatus::Promoted
                                },
                                result: result.action.clone(),
                                error: String::new(),
                                promoted_memory_id: memory_id.clone(),
                            });
                        }
                        "merged" | "skipped" => {
                            if result.action == "merged" {
                                outcome.stats.merged += 1;
                            } else {
                                outcome.stats.skipped += 1;
                            }
                            outcome.result_updates.push(CandidateResultUpdate {
                                candidate_id: candidate.id.clone(),
                                status: CandidateStatus::Merged,
                                result: result.action.clone(),
                                error: String::new(),
                                promoted_memory_id: memory_id.clone(),
                            });
                        }
                        _ => {
                            outcome.stats.rejected += 1;
                            for conv_id in &conversation_ids {
                                if context_conv_ids.contains(conv_id.as_str()) {
                                    outcome
                                        .conv_outcomes
                                        .entry(conv_id.clone())
                                        .or_default()
                                        .errors += 1;
                                }
                            }
                            outcome.result_updates.push(CandidateResultUpdate {
                                candidate_id: candidate.id.clone(),
                                status: CandidateStatus::Rejected,
                                result: result.action.clone(),
                                error: result.message.clone().unwrap_or_default(),
                                promoted_memory_id: None,
                            });
                        }
                    }
                    outcome.push_detail(
                        candidate,
                        &result.action,
                        memory_id.as_deref(),
                        result.message.as_deref().unwrap_or(""),
                    );
                }
                Err(e) => {
                    outcome.stats.rejected += 1;
                    for conv_id in &conversation_ids {
                        if context_conv_ids.contains(conv_id.as_str()) {
                            outcome
                                .conv_outcomes
                                .entry(conv_id.clone())
                                .or_default()
                                .errors += 1;
                        }
                    }
                    outcome.result_updates.push(CandidateResultUpdate {
                        candidate_id: candidate.id.clone(),
                        status: CandidateStatus::Rejected,
                        result: "error".to_string(),
                        error: e.to_string(),
                        promoted_memory_id: None,
                    });
                    outcome.push_detail(candidate, "error", None, &e.to_string());
                }
            }
        }

        outcome
    }

    // ========================================================================
    // LINK / MARK / INDEX
    // ========================================================================

    async fn link_created_memories(
        &self,
        created_by_conversation: &HashMap<String, Vec<String>>,
    ) -> Result<usize> {
        if created_by_conversation.is_empty() {
            return Ok(0);
        }
        let created = created_by_conversation.clone();
        self.core
            .write_queue()
            .enqueue(move |store| {
                let mut linked = 0usize;
                for (conv_id, memory_ids) in &created {
                    if memory_ids.is_empty() {
                        continue;
                    }
                    if store.merge_conversation_memory_ids(conv_id, memory_ids)? {
                        linked += 1;
                    }
                }
                Ok(linked)
            })
            .await
    }

    async fn mark_conversations_analyzed(
        &self,
        contexts: &[ConversationContext],
        provider: &str,
        results: &HashMap<String, String>,
    ) -> Result<usize> {
        if contexts.is_empty() {
            return Ok(0);
        }
        let updates: Vec<(String, i64, Option<String>)> = contexts
            .iter()
            .map(|c| {
                (
                    c.conversation_id.clone(),
                    c.conversation_message_count,
                    results.get(&c.conversation_id).cloned(),
                )
            })
            .collect();
        let provider = provider.to_string();

        self.core
            .write_queue()
            .enqueue(move |store| {
                let mut updated = 0usize;
                for (conv_id, message_count, result) in &updates {
                    let Some(conv) = store.get_conversation(conv_id)? else {
                        continue;
                    };
                    let tags = build_analysis_tags(
                        &conv.tags,
                        &provider,
                        *message_count,
                        result.as_deref(),
                    );
                    store.set_conversation_tags(conv_id, &tags)?;
                    updated += 1;
                }
                Ok(updated)
            })
            .await
    }

    async fn upsert_analysis_index(
        &self,
        contexts: &[ConversationContext],
        provider: &str,
        results: &HashMap<String, String>,
        outcomes: &HashMap<String, ConversationOutcome>,
        extract_ms: &HashMap<String, i64>,
    ) -> Result<usize> {
        if contexts.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        let rows: Vec<AnalysisIndexRecord> = contexts
            .iter()
            .map(|context| {
                let outcome = outcomes.get(&context.conversation_id);
                AnalysisIndexRecord {
                    conversation_id: context.conversation_id.clone(),
                    message_count: context.conversation_message_count,
                    conversation_hash: context.conversation_hash.clone(),
                    latest_message_at: context.messages.last().and_then(|m| m.timestamp),
                    last_result: results
                        .get(&context.conversation_id)
                        .cloned()
                        .unwrap_or_else(|| "none".to_string()),
                    provider: provider.to_string(),
                    signal_score: context.signal_score,
                    candidates_count: outcome.map_or(0, |o| o.candidates as i64),
                    created_count: outcome.map_or(0, |o| o.created as i64),
                    error_count: outcome.map_or(0, |o| o.errors as i64),
                    duration_ms: extract_ms
                        .get(&context.conversation_id)
                        .copied()
                        .unwrap_or(0),
                    last_analyzed_at: now,
                }
            })
            .collect();

        self.core
            .write_queue()
            .enqueue(move |store| {
                for row in &rows {
                    store.upsert_analysis_index(row)?;
                }
                Ok(rows.len())
            })
            .await
    }
}

// ============================================================================
// SELECTION HELPERS
// ============================================================================

struct Selection {
    contexts: Vec<ConversationContext>,
    scanned: usize,
    skipped_by_index: usize,
    skipped_by_tags: usize,
    index_size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct ConversationOutcome {
    candidates: usize,
    created: usize,
    errors: usize,
}

#[derive(Debug, Default)]
struct PromotionOutcome {
    stats: WriteStats,
    details: Vec<serde_json::Value>,
    result_updates: Vec<CandidateResultUpdate>,
    created_by_conversation: HashMap<String, Vec<String>>,
    conv_outcomes: HashMap<String, ConversationOutcome>,
    generic_filtered: usize,
    with_context: usize,
}

impl PromotionOutcome {
    fn push_detail(
        &mut self,
        candidate: &MiningCandidateRecord,
        action: &str,
        memory_id: Option<&str>,
        message: &str,
    ) {
        if self.details.len() >= 50 {
            return;
        }
        self.details.push(serde_json::json!({
            "candidate_id": candidate.id,
            "conversation_id": candidate.conversation_ids.first(),
            "content": candidate.content,
            "evidence_count": candidate.evidence_count,
            "promotion_score": candidate.promotion_score,
            "action": action,
            "memory_id": memory_id,
            "message": message,
        }));
    }
}

/// A fresh index row means the conversation is unchanged since the last
/// successful analysis: same hash (when known), message count not grown,
/// and a non-error result.
fn index_row_is_fresh(
    index_row: &AnalysisIndexRecord,
    conversation: &crate::storage::ConversationRecord,
) -> bool {
    if index_row.last_result != "has_memory" && index_row.last_result != "none" {
        return false;
    }
    if index_row.message_count < conversation.message_count {
        return false;
    }
    let conv_hash = conversation.raw_file_hash.trim().to_lowercase();
    if conv_hash.is_empty() {
        return true;
    }
    index_row.conversation_hash.trim().to_lowercase() == conv_hash
}

fn tags_mark_analyzed(tags: &[String], message_count: i64) -> bool {
    let lowered: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();
    if !lowered.iter().any(|t| t == ANALYSIS_TAG) {
        return false;
    }
    let analyzed_count = lowered
        .iter()
        .find_map(|t| t.strip_prefix(MSGCOUNT_TAG_PREFIX))
        .and_then(|raw| raw.parse::<i64>().ok());
    let result = lowered
        .iter()
        .find_map(|t| t.strip_prefix(RESULT_TAG_PREFIX))
        .map(str::to_string);
    matches!(result.as_deref(), Some("has_memory") | Some("none"))
        && analyzed_count.is_none_or(|count| count >= message_count)
}

fn build_analysis_tags(
    existing: &[String],
    provider: &str,
    message_count: i64,
    result: Option<&str>,
) -> Vec<String> {
    let mut cleaned: Vec<String> = existing
        .iter()
        .filter(|tag| {
            let lower = tag.to_lowercase();
            !lower.starts_with(MSGCOUNT_TAG_PREFIX)
                && !lower.starts_with(PROVIDER_TAG_PREFIX)
                && !lower.starts_with(RESULT_TAG_PREFIX)
        })
        .cloned()
        .collect();
    if !cleaned.iter().any(|t| t.to_lowercase() == ANALYSIS_TAG) {
        cleaned.push(ANALYSIS_TAG.to_string());
    }
    let provider_slug: String = provider
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let provider_slug = if provider_slug.is_empty() {
        "heuristic".to_string()
    } else {
        provider_slug
    };
    cleaned.push(format!("{MSGCOUNT_TAG_PREFIX}{}", message_count.max(0)));
    cleaned.push(format!("{PROVIDER_TAG_PREFIX}{provider_slug}"));
    if let Some(result) = result {
        if matches!(result, "has_memory" | "none" | "error") {
            cleaned.push(format!("{RESULT_TAG_PREFIX}{result}"));
        }
    }
    // Dedup preserving order.
    let mut seen = HashSet::new();
    cleaned.retain(|tag| seen.insert(tag.to_lowercase()));
    cleaned
}

// ============================================================================
// EXTRACTION IMPLEMENTATIONS
// ============================================================================

async fn extract_with_llm(
    context: &ConversationContext,
    runtime: &ProviderRuntime,
    max_candidates: usize,
    min_confidence: f64,
) -> std::result::Result<Vec<ExtractedCandidate>, String> {
    let payload = serde_json::json!({
        "conversation_id": context.conversation_id,
        "title": context.title,
        "messages": context
            .messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id,
                    "role": m.role,
                    "content": m.content.chars().take(480).collect::<String>(),
                    "timestamp": m.timestamp,
                })
            })
            .collect::<Vec<_>>(),
    });
    let prompt = provider::build_extraction_prompt(&payload, max_candidates, min_confidence);
    let response = runtime.chat(&prompt).await.map_err(|e| e.to_string())?;
    let Some(parsed) = provider::extract_json_obj(&response) else {
        return Err("Provider returned no parseable JSON".to_string());
    };
    Ok(normalize_llm_candidates(
        &parsed,
        context,
        min_confidence,
        max_candidates,
    ))
}

fn normalize_llm_candidates(
    parsed: &serde_json::Value,
    context: &ConversationContext,
    min_confidence: f64,
    max_candidates: usize,
) -> Vec<ExtractedCandidate> {
    let Some(raw_memories) = parsed.get("memories").and_then(|m| m.as_array()) else {
        return vec![];
    };

    let message_by_id: HashMap<&str, &ContextMessage> = context
        .messages
        .iter()
        .filter(|m| !m.id.is_empty())
        .map(|m| (m.id.as_str(), m))
        .collect();
    let user_messages: Vec<&ContextMessage> =
        context.messages.iter().filter(|m| m.role == "user").collect();

    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for item in raw_memories {
        if out.len() >= max_candidates {
            break;
        }
        let Some(item) = item.as_object() else { continue };
        let raw_content = item.get("content").and_then(|c| c.as_str()).unwrap_or("");
        let cleaned_variants = text::clean_candidate_texts(raw_content, 420, 2);
        if cleaned_variants.is_empty() {
            continue;
        }
        let confidence = item
            .get("confidence")
            .and_then(|c| c.as_f64())
            .map(candidates::normalize_confidence)
            .unwrap_or(0.82);
        if confidence < min_confidence {
            continue;
        }
        let category = MemoryCategory::parse_name(
            item.get("category").and_then(|c| c.as_str()).unwrap_or(""),
        );
        let level =
            MemoryLevel::parse_name(item.get("level").and_then(|l| l.as_str()).unwrap_or(""));

        // Source grounding: the hinted id must reference a user message;
        // otherwise fall back to the best-overlap user message.
        let hinted_id = item
            .get("source_message_id")
            .and_then(|s| s.as_str())
            .unwrap_or("");
        let hinted = message_by_id
            .get(hinted_id)
            .copied()
            .filter(|m| m.role == "user")
            .or_else(|| select_best_user_message(raw_content, &user_messages));

        for cleaned in cleaned_variants {
            if out.len() >= max_candidates {
                break;
            }
            if text::looks_generic_non_memory(&cleaned) {
                continue;
            }
            let source = hinted.or_else(|| select_best_user_message(&cleaned, &user_messages));
            let source_content = source.map(|m| m.content.as_str()).unwrap_or("");
            let enriched = text::enrich_candidate_with_source_context(&cleaned, source_content);
            let chars = enriched.chars().count();
            if !(20..=520).contains(&chars) {
                continue;
            }
            if text::looks_truncated(&enriched) {
                continue;
            }
            if text::contains_first_person(&enriched) {
                continue;
            }
            // Memories must be explicitly user-centric; this blocks generic
            // knowledge statements.
            if !text::contains_user_anchor(&enriched) {
                continue;
            }
            if text::looks_generic_non_memory(&enriched) {
                continue;
            }
            if !seen.insert(enriched.to_lowercase()) {
                continue;
            }
            out.push(ExtractedCandidate {
                content: enriched,
                category,
                level,
                confidence,
                source_message_id: source.map(|m| m.id.clone()).unwrap_or_default(),
                source_message_timestamp: source.and_then(|m| m.timestamp),
                source_excerpt: text::build_source_excerpt(source_content, 120),
                conversation_id: context.conversation_id.clone(),
                conversation_title: context.title.clone(),
                method: "llm".to_string(),
            });
        }
    }
    out
}

/// Best user source message for a candidate, by named+topic token overlap,
/// falling back to the last user message.
fn select_best_user_message<'a>(
    candidate_content: &str,
    user_messages: &[&'a ContextMessage],
) -> Option<&'a ContextMessage> {
    if user_messages.is_empty() {
        return None;
    }
    let mut candidate_tokens = text::extract_topic_tokens(candidate_content);
    candidate_tokens.extend(text::extract_named_tokens(candidate_content));
    if candidate_tokens.is_empty() {
        return user_messages.last().copied();
    }

    let mut best: Option<&ContextMessage> = None;
    let mut best_score = -1i64;
    for message in user_messages {
        let mut tokens = text::extract_topic_tokens(&message.content);
        tokens.extend(text::extract_named_tokens(&message.content));
        let score = candidate_tokens.intersection(&tokens).count() as i64;
        if score > best_score {
            best_score = score;
            best = Some(message);
        }
    }
    best.or_else(|| user_messages.last().copied())
}

/// Marker-based extraction when no LLM is available (or as its fallback).
fn heuristic_candidates(
    context: &ConversationContext,
    max_candidates: usize,
    min_confidence: f64,
) -> Vec<ExtractedCandidate> {
    let mut out: Vec<ExtractedCandidate> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let mut push = |content: String,
                    category: MemoryCategory,
                    confidence: f64,
                    message: &ContextMessage,
                    out: &mut Vec<ExtractedCandidate>,
                    seen: &mut HashSet<String>| {
        if out.len() >= max_candidates {
            return;
        }
        for cleaned in text::clean_candidate_texts(&content, 420, 2) {
            if out.len() >= max_candidates {
                break;
            }
            let enriched = text::enrich_candidate_with_source_context(&cleaned, &message.content);
            let chars = enriched.chars().count();
            if !(20..=520).contains(&chars) {
                continue;
            }
            if text::looks_truncated(&enriched) || text::looks_generic_non_memory(&enriched) {
                continue;
            }
            if !seen.insert(enriched.to_lowercase()) {
                continue;
            }
            out.push(ExtractedCandidate {
                content: enriched,
                category,
                level: MemoryLevel::Semantic,
                confidence,
                source_message_id: message.id.clone(),
                source_message_timestamp: message.timestamp,
                source_excerpt: text::build_source_excerpt(&message.content, 120),
                conversation_id: context.conversation_id.clone(),
                conversation_title: context.title.clone(),
                method: "heuristic".to_string(),
            });
        }
    };

    for message in &context.messages {
        if out.len() >= max_candidates {
            break;
        }
        if message.role != "user" {
            continue;
        }
        let content = message.content.trim();
        if content.chars().count() < 24 {
            continue;
        }
        let lower = content.to_lowercase();

        if lower.contains("my name is ") {
            let name = text::extract_snippet(content, "my name is ");
            if !name.is_empty() {
                push(
                    format!("The user's name is {name}"),
                    MemoryCategory::Identity,
                    0.92,
                    message,
                    &mut out,
                    &mut seen,
                );
            }
        }
        if lower.contains("je m'appelle ") {
            let name = text::extract_snippet(content, "je m'appelle ");
            if !name.is_empty() {
                push(
                    format!("Le nom de l'utilisateur est {name}"),
                    MemoryCategory::Identity,
                    0.92,
                    message,
                    &mut out,
                    &mut seen,
                );
            }
        }

        for marker in [
            "i prefer ",
            "i like ",
            "i love ",
            "i hate ",
            "je prefere ",
            "j'aime ",
            "je deteste ",
        ] {
            if lower.contains(marker) {
                let snippet = text::extract_snippet(content, marker);
                if !snippet.is_empty() {
                    push(
                        format!("The user prefers {snippet}"),
                        MemoryCategory::Preferences,
                        0.84,
                        message,
                        &mut out,
                        &mut seen,
                    );
                }
                break;
            }
        }

        for marker in [
            "i'm working on ",
            "i am working on ",
            "i'm building ",
            "i am building ",
            "je travaille sur ",
            "je developpe ",
            "mon projet ",
        ] {
            if lower.contains(marker) {
                let snippet = text::extract_snippet(content, marker);
                if !snippet.is_empty() {
                    push(
                        format!("The user is working on {snippet}"),
                        MemoryCategory::Projects,
                        0.82,
                        message,
                        &mut out,
                        &mut seen,
                    );
                }
                break;
            }
        }

        for marker in ["i use ", "my stack", "j'utilise ", "tech stack"] {
            if lower.contains(marker) {
                let snippet = text::extract_snippet(content, marker);
                if !snippet.is_empty() {
                    push(
                        format!("The user uses {snippet}"),
                        MemoryCategory::Skills,
                        0.80,
                        message,
                        &mut out,
                        &mut seen,
                    );
                }
                break;
            }
        }
    }

    out.retain(|c| c.confidence >= min_confidence);
    out.truncate(max_candidates);
    out
}

// ============================================================================
// DEDUP + CONSOLIDATION
// ============================================================================

fn dedupe_by_content(candidates: Vec<ExtractedCandidate>) -> Vec<ExtractedCandidate> {
    let mut seen: HashSet<String> = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| {
            let key = text::normalize_for_dedupe(&c.content);
            !key.is_empty() && seen.insert(key)
        })
        .collect()
}

struct Cluster {
    first_index: usize,
    members: Vec<ExtractedCandidate>,
    topic_tokens: HashSet<String>,
    named_tokens: HashSet<String>,
    categories: HashSet<MemoryCategory>,
    source_message_ids: HashSet<String>,
}

fn candidate_related_to_cluster(candidate: &ExtractedCandidate, cluster: &Cluster) -> bool {
    if !candidate.source_message_id.is_empty()
        && cluster.source_message_ids.contains(&candidate.source_message_id)
    {
        return true;
    }

    let named = text::extract_named_tokens(&candidate.content);
    if !named.is_empty() && named.intersection(&cluster.named_tokens).next().is_some() {
        return true;
    }

    let topic = text::extract_topic_tokens(&candidate.content);
    let shared = topic.intersection(&cluster.topic_tokens).count();
    if shared >= 2 {
        return true;
    }
    if !topic.is_empty() && !cluster.topic_tokens.is_empty() {
        let union = topic.union(&cluster.topic_tokens).count().max(1);
        if shared as f64 / union as f64 >= 0.45 {
            return true;
        }
    }

    candidate.category == MemoryCategory::Projects
        && cluster.categories.contains(&MemoryCategory::Projects)
        && !cluster.named_tokens.is_empty()
        && text::looks_like_project_followup(&candidate.content)
}

fn merge_cluster(members: Vec<ExtractedCandidate>, max_chars: usize) -> ExtractedCandidate {
    if members.len() == 1 {
        return members.into_iter().next().expect("non-empty cluster");
    }

    let base = members[0].clone();
    let base_text = base.content.trim_end_matches([' ', '.', ';']).to_string();
    if base_text.is_empty() {
        return base;
    }

    let mut seen: HashSet<String> = HashSet::from([text::normalize_for_dedupe(&base_text)]);
    let mut parts = vec![base_text];
    for member in &members[1..] {
        let extra = member.content.trim_end_matches([' ', '.', ';']).to_string();
        if extra.is_empty() {
            continue;
        }
        let key = text::normalize_for_dedupe(&extra);
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        let trial_len = parts.iter().map(|p| p.chars().count() + 2).sum::<usize>()
            + extra.chars().count();
        if trial_len > max_chars {
            break;
        }
        parts.push(extra);
    }
    if parts.len() <= 1 {
        return base;
    }

    // Category with the highest summed confidence wins.
    let mut category_scores: HashMap<MemoryCategory, f64> = HashMap::new();
    for member in &members {
        *category_scores.entry(member.category).or_insert(0.0) +=
            candidates::normalize_confidence(member.confidence);
    }
    let merged_category = category_scores
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(category, _)| category)
        .unwrap_or(base.category);

    let earliest_timestamp = members
        .iter()
        .filter_map(|m| m.source_message_timestamp)
        .min();

    let mut merged = base;
    merged.content = format!("{}.", parts.join("; "));
    merged.confidence = members
        .iter()
        .map(|m| candidates::normalize_confidence(m.confidence))
        .fold(0.0, f64::max);
    merged.category = merged_category;
    merged.method = format!("{}:condensed", merged.method);
    if earliest_timestamp.is_some() {
        merged.source_message_timestamp = earliest_timestamp;
    }
    merged
}

/// Cluster candidates within the same `(conversation, level)` group and
/// condense each cluster into one joined candidate.
fn consolidate_candidates(
    candidates: Vec<ExtractedCandidate>,
    max_chars: usize,
    max_cluster_size: usize,
) -> Vec<ExtractedCandidate> {
    if candidates.len() <= 1 {
        return candidates;
    }

    let mut grouped: Vec<((String, MemoryLevel), Vec<(usize, ExtractedCandidate)>)> = Vec::new();
    for (index, candidate) in candidates.into_iter().enumerate() {
        let key = (candidate.conversation_id.clone(), candidate.level);
        match grouped.iter_mut().find(|(k, _)| *k == key) {
            Some((_, list)) => list.push((index, candidate)),
            None => grouped.push((key, vec![(index, candidate)])),
        }
    }

    let mut merged_with_index: Vec<(usize, ExtractedCandidate)> = Vec::new();
    for (_, group) in grouped {
        let mut clusters: Vec<Cluster> = Vec::new();
        for (index, candidate) in group {
            let mut placed = false;
            for cluster in &mut clusters {
                if cluster.members.len() >= max_cluster_size {
                    continue;
                }
                if candidate_related_to_cluster(&candidate, cluster) {
                    cluster.topic_tokens.extend(text::extract_topic_tokens(&candidate.content));
                    cluster.named_tokens.extend(text::extract_named_tokens(&candidate.content));
                    cluster.categories.insert(candidate.category);
                    if !candidate.source_message_id.is_empty() {
                        cluster.source_message_ids.insert(candidate.source_message_id.clone());
                    }
                    cluster.members.push(candidate.clone());
                    placed = true;
                    break;
                }
            }
            if !placed {
                let mut source_message_ids = HashSet::new();
                if !candidate.source_message_id.is_empty() {
                    source_message_ids.insert(candidate.source_message_id.clone());
                }
                clusters.push(Cluster {
                    first_index: index,
                    topic_tokens: text::extract_topic_tokens(&candidate.content),
                    named_tokens: text::extract_named_tokens(&candidate.content),
                    categories: HashSet::from([candidate.category]),
                    source_message_ids,
                    members: vec![candidate],
                });
            }
        }
        for cluster in clusters {
            let first_index = cluster.first_index;
            merged_with_index.push((first_index, merge_cluster(cluster.members, max_chars)));
        }
    }

    merged_with_index.sort_by_key(|(index, _)| *index);
    merged_with_index.into_iter().map(|(_, c)| c).collect()
}

// ============================================================================
// PROVENANCE
// ============================================================================

fn build_candidate_reason(
    method: &str,
    conversation_title: &str,
    conversation_id: &str,
    source_message_id: &str,
    confidence: f64,
    source_excerpt: &str,
) -> String {
    let title_part = if !conversation_title.trim().is_empty() {
        conversation_title.trim().to_string()
    } else if !conversation_id.is_empty() {
        conversation_id.chars().take(20).collect()
    } else {
        "unknown conversation".to_string()
    };
    let message_part = if source_message_id.is_empty() {
        String::new()
    } else {
        format!(", message {}", source_message_id.chars().take(16).collect::<String>())
    };
    let mut reason = format!(
        "Auto-suggested from {title_part} via {method} (confidence {confidence:.2}{message_part})."
    );
    let excerpt = text::build_source_excerpt(source_excerpt, 96);
    if !excerpt.is_empty() {
        reason.push_str(&format!(" Context: \"{excerpt}\""));
    }
    reason.chars().take(420).collect()
}

fn lookup_source_excerpt(
    conversation_ids: &[String],
    source_message_ids: &[String],
    excerpt_by_pair: &HashMap<(String, String), String>,
    excerpt_by_message: &HashMap<String, String>,
) -> String {
    for conv_id in conversation_ids {
        for msg_id in source_message_ids {
            if conv_id.is_empty() || msg_id.is_empty() {
                continue;
            }
            if let Some(value) = excerpt_by_pair.get(&(conv_id.clone(), msg_id.clone())) {
                if !value.is_empty() {
                    return value.clone();
                }
            }
        }
    }
    for msg_id in source_message_ids {
        if let Some(value) = excerpt_by_message.get(msg_id) {
            if !value.is_empty() {
                return value.clone();
            }
        }
    }
    String::new()
}

#[allow(clippy::too_many_arguments)]
fn quality_metrics(
    raw_total: usize,
    first_pass_unique: usize,
    post_dedupe: usize,
    duplicate_pruned: usize,
    generic_filtered: usize,
    created: usize,
    accepted_denominator: usize,
    with_context: usize,
    promotable_total: usize,
) -> serde_json::Value {
    let rate = |num: usize, den: usize| {
        if den > 0 {
            (num as f64 / den as f64 * 10_000.0).round() / 10_000.0
        } else {
            0.0
        }
    };
    serde_json::json!({
        "raw_candidates_total": raw_total,
        "first_pass_unique_total": first_pass_unique,
        "post_dedupe_total": post_dedupe,
        "duplicate_pruned": duplicate_pruned,
        "generic_filtered_total": generic_filtered,
        "generic_rate": rate(generic_filtered, raw_total),
        "duplicate_rate": rate(duplicate_pruned, raw_total),
        "accepted_rate": rate(created, accepted_denominator),
        "context_coverage_rate": rate(with_context, promotable_total),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::write_queue::WriteQueue;
    use crate::storage::{ConversationRecord, MessageRecord};

    fn seed_conversation(store: &Store, id: &str, user_lines: &[&str]) {
        let now = Utc::now();
        store
            .upsert_conversation(&ConversationRecord {
                id: id.to_string(),
                title: format!("Conversation {id}"),
                source_llm: "claude".to_string(),
                started_at: now,
                ended_at: None,
                message_count: user_lines.len() as i64,
                summary: String::new(),
                status: "archived".to_string(),
                tags: vec![],
                memory_ids: vec![],
                raw_file_hash: format!("hash-{id}"),
                imported_at: now,
            })
            .unwrap();
        let messages: Vec<MessageRecord> = user_lines
            .iter()
            .enumerate()
            .map(|(i, line)| MessageRecord {
                id: format!("{id}-m{i}"),
                conversation_id: id.to_string(),
                role: "user".to_string(),
                content: line.to_string(),
                timestamp: now + chrono::Duration::seconds(i as i64),
                embedding: None,
            })
            .collect();
        store.insert_messages(&messages).unwrap();
    }

    fn build_miner() -> (tempfile::TempDir, Arc<Store>, Arc<MemoryCore>, Miner) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("mine.db"))).unwrap());
        let embedder = Arc::new(EmbeddingService::hashed());
        let queue = WriteQueue::start(store.clone());
        let core = Arc::new(MemoryCore::new(store.clone(), embedder.clone(), queue));
        let config = Arc::new(ConfigHandle::new());
        let miner = Miner::new(store.clone(), core.clone(), embedder, config);
        (dir, store, core, miner)
    }

    fn heuristic_options(dry_run: bool) -> MiningOptions {
        MiningOptions {
            dry_run,
            provider: "heuristic".to_string(),
            require_llm_configured: Some(false),
            ..MiningOptions::default()
        }
    }

    #[tokio::test]
    async fn dry_run_previews_without_writing() {
        let (_dir, store, _core, miner) = build_miner();
        seed_conversation(
            &store,
            "c1",
            &["I prefer concise technical answers with direct action items."],
        );

        let report = miner.mine(heuristic_options(true)).await.unwrap();
        assert_eq!(report.status, "ok");
        assert_eq!(report.mode, "dry_run");
        assert!(report.candidates_total >= 1);
        assert_eq!(report.write_stats.created, 0);
        assert_eq!(store.count_memories(None).unwrap(), 0);

        let preview_content = report.preview[0]["content"].as_str().unwrap();
        assert!(
            preview_content.starts_with("The user prefers concise technical answers"),
            "unexpected preview: {preview_content}"
        );
    }

    #[tokio::test]
    async fn real_run_promotes_into_pending_review() {
        let (_dir, store, core, miner) = build_miner();
        // An identity fact carries 0.92 heuristic confidence, enough for
        // the high-confidence promotion path on first sighting.
        seed_conversation(&store, "c1", &["My name is Julien and I work remotely from Lyon."]);

        let report = miner.mine(heuristic_options(false)).await.unwrap();
        assert_eq!(report.status, "ok");
        assert!(report.write_stats.created >= 1, "report: {report:?}");

        // Promoted memories arrive as pending_review with provenance.
        let pending = store
            .memories_with_status(MemoryStatus::PendingReview, 10)
            .unwrap();
        assert_eq!(pending.len(), report.write_stats.created);
        let memory = &pending[0];
        assert_eq!(memory.source_conversation_id.as_deref(), Some("c1"));
        assert!(memory.tags.contains(&ANALYSIS_TAG.to_string()));
        assert!(memory
            .suggestion_reason
            .as_deref()
            .unwrap_or("")
            .starts_with("Auto-suggested from"));

        // The conversation is linked and tagged.
        let conv = store.get_conversation("c1").unwrap().unwrap();
        assert!(!conv.memory_ids.is_empty());
        assert!(conv.tags.iter().any(|t| t == ANALYSIS_TAG));
        assert!(conv
            .tags
            .iter()
            .any(|t| t.starts_with(RESULT_TAG_PREFIX)));

        // Candidate rows carry the promotion outcome.
        assert!(store.count_candidates(Some("promoted")).unwrap() >= 1);
        let _ = core;
    }

    #[tokio::test]
    async fn second_run_skips_fresh_conversations() {
        let (_dir, store, _core, miner) = build_miner();
        seed_conversation(
            &store,
            "c1",
            &["I prefer concise technical answers with direct action items."],
        );
        seed_conversation(&store, "c2", &["I am building a HomeBoard dashboard for my family."]);

        let first = miner.mine(heuristic_options(false)).await.unwrap();
        assert_eq!(first.conversations_selected, 2);

        let second = miner.mine(heuristic_options(false)).await.unwrap();
        assert_eq!(second.skipped_by_index, second.conversations_scanned);
        assert_eq!(second.conversations_selected, 0);
        assert_eq!(second.write_stats.created, 0);
    }

    #[tokio::test]
    async fn force_reanalyze_overrides_index() {
        let (_dir, store, _core, miner) = build_miner();
        seed_conversation(&store, "c1", &["My name is Julien and I work remotely from Lyon."]);
        let first = miner.mine(heuristic_options(false)).await.unwrap();
        assert_eq!(first.write_stats.created, 1);

        let mut options = heuristic_options(false);
        options.force_reanalyze = true;
        let rerun = miner.mine(options).await.unwrap();
        assert_eq!(rerun.skipped_by_index, 0);
        assert_eq!(rerun.conversations_selected, 1);
        // The candidate already carries a promoted status, so the second
        // pass merges evidence instead of writing a duplicate memory.
        assert_eq!(rerun.write_stats.created, 0);
        assert_eq!(
            store.memories_with_status(MemoryStatus::PendingReview, 10).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn blocked_when_llm_required_but_unconfigured() {
        let (_dir, store, _core, miner) = build_miner();
        seed_conversation(
            &store,
            "c1",
            &["I prefer concise technical answers with direct action items."],
        );

        let options = MiningOptions {
            dry_run: false,
            provider: "heuristic".to_string(),
            require_llm_configured: Some(true),
            ..MiningOptions::default()
        };
        let report = miner.mine(options).await.unwrap();
        assert_eq!(report.status, "blocked");
        assert_eq!(report.conversations_selected, 0);
        assert_eq!(report.llm_error_count, 1);
    }

    #[tokio::test]
    async fn singleflight_rejects_overlap_without_wait() {
        let (_dir, _store, _core, miner) = build_miner();
        let miner = Arc::new(miner);

        // Hold the run lock, then observe busy from a non-waiting call.
        let guard = miner.run_lock.lock().await;
        let result = miner
            .run_singleflight("manual", false, heuristic_options(true))
            .await
            .unwrap();
        assert!(matches!(result, MiningRun::Busy { .. }));
        drop(guard);

        let result = miner
            .run_singleflight("manual", false, heuristic_options(true))
            .await
            .unwrap();
        assert!(matches!(result, MiningRun::Completed(_)));
        let status = miner.runtime_status();
        assert!(!status.running);
        assert!(status.last_completed_at.is_some());
    }

    #[tokio::test]
    async fn low_signal_conversations_are_discarded() {
        let (_dir, store, _core, miner) = build_miner();
        // Assistant-only content and short user messages carry no signal.
        seed_conversation(&store, "c1", &["ok", "thanks a lot for the help today"]);

        let report = miner.mine(heuristic_options(true)).await.unwrap();
        assert_eq!(report.conversations_selected, 0);
        assert_eq!(report.candidates_total, 0);
    }

    #[test]
    fn consolidation_merges_related_candidates() {
        let now = Utc::now();
        let make = |content: &str, msg: &str| ExtractedCandidate {
            content: content.to_string(),
            category: MemoryCategory::Projects,
            level: MemoryLevel::Semantic,
            confidence: 0.8,
            source_message_id: msg.to_string(),
            source_message_timestamp: Some(now),
            source_excerpt: String::new(),
            conversation_id: "c1".to_string(),
            conversation_title: "Chat".to_string(),
            method: "heuristic".to_string(),
        };

        let merged = consolidate_candidates(
            vec![
                make("The user is building the HomeBoard dashboard", "m1"),
                // Same source message joins the cluster.
                make("The project ships weekly to beta testers", "m1"),
                // Unrelated topic stays separate.
                make("The user drinks espresso before standup meetings", "m9"),
            ],
            420,
            4,
        );
        assert_eq!(merged.len(), 2);
        assert!(merged[0].content.contains("HomeBoard"));
        assert!(merged[0].content.contains("; "));
        assert!(merged[0].method.ends_with(":condensed"));
        assert!(merged[1].content.contains("espresso"));
    }

    #[test]
    fn cluster_respects_max_size_and_chars() {
        let now = Utc::now();
        let make = |i: usize| ExtractedCandidate {
            content: format!("The user tracks HomeBoard milestone number {i} closely"),
            category: MemoryCategory::Projects,
            level: MemoryLevel::Semantic,
            confidence: 0.8,
            source_message_id: "m1".to_string(),
            source_message_timestamp: Some(now),
            source_excerpt: String::new(),
            conversation_id: "c1".to_string(),
            conversation_title: "Chat".to_string(),
            method: "heuristic".to_string(),
        };
        let merged =
            consolidate_candidates((0..6).map(make).collect(), 420, 4);
        // Max cluster size 4 -> first four condense, remaining two form a
        // second cluster.
        assert_eq!(merged.len(), 2);
        assert!(merged[0].content.chars().count() <= 420);
    }

    #[test]
    fn analysis_tags_round_trip() {
        let tags = build_analysis_tags(
            &["imported".to_string(), format!("{MSGCOUNT_TAG_PREFIX}3")],
            "heuristic",
            7,
            Some("has_memory"),
        );
        assert!(tags.contains(&"imported".to_string()));
        assert!(tags.contains(&ANALYSIS_TAG.to_string()));
        assert!(tags.contains(&format!("{MSGCOUNT_TAG_PREFIX}7")));
        assert!(tags.contains(&format!("{RESULT_TAG_PREFIX}has_memory")));
        // The stale msgcount tag was replaced.
        assert!(!tags.contains(&format!("{MSGCOUNT_TAG_PREFIX}3")));

        assert!(tags_mark_analyzed(&tags, 7));
        // More messages than analyzed -> stale.
        assert!(!tags_mark_analyzed(&tags, 9));
    }
}
