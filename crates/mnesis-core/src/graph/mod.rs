//! Knowledge-Graph Edge Layer
//!
//! Derives typed directed edges between a newly created memory and its
//! vector neighbors, persists them in the edge table, and answers BFS
//! subgraph queries. Edge derivation is pure; persistence has two sinks:
//! the in-store edge table (authoritative) and an optional external
//! property-graph backend (best-effort, never blocks a memory write).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::conflicts::is_semantic_contradiction;
use crate::memory::decay::parse_event_date;
use crate::storage::{GraphEdgeRecord, MemoryRecord, Result, Store};

/// Minimum neighbor score considered for any edge.
const MIN_EDGE_SCORE: f32 = 0.65;

// ============================================================================
// EDGE TYPES
// ============================================================================

/// Typed relationship between two memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    #[serde(rename = "BELONGS_TO")]
    BelongsTo,
    #[serde(rename = "CONTRADICTS")]
    Contradicts,
    #[serde(rename = "REINFORCES")]
    Reinforces,
    #[serde(rename = "PRECEDES")]
    Precedes,
    #[serde(rename = "DEPENDS_ON")]
    DependsOn,
    #[serde(rename = "INVOLVES_PERSON")]
    InvolvesPerson,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::BelongsTo => "BELONGS_TO",
            EdgeType::Contradicts => "CONTRADICTS",
            EdgeType::Reinforces => "REINFORCES",
            EdgeType::Precedes => "PRECEDES",
            EdgeType::DependsOn => "DEPENDS_ON",
            EdgeType::InvolvesPerson => "INVOLVES_PERSON",
        }
    }
}

// ============================================================================
// EXTERNAL SINK
// ============================================================================

/// Optional mirror into an external property-graph backend. Failures are
/// the implementation's problem to log; callers never propagate them.
pub trait GraphSink: Send + Sync {
    fn upsert_memory(&self, memory_id: &str, content_preview: &str);
    fn add_edge(&self, edge: &GraphEdgeRecord);
}

// ============================================================================
// NEIGHBOR INPUT
// ============================================================================

/// A vector-search neighbor offered to edge derivation.
#[derive(Debug, Clone)]
pub struct GraphNeighbor {
    pub id: String,
    pub content: String,
    pub category: crate::memory::MemoryCategory,
    pub event_date: Option<DateTime<Utc>>,
    /// Cosine distance from the new memory (lower is nearer).
    pub distance: f32,
}

impl GraphNeighbor {
    pub fn from_record(record: &MemoryRecord, distance: f32) -> Self {
        Self {
            id: record.id.clone(),
            content: record.content.clone(),
            category: record.category,
            event_date: record.event_date,
            distance,
        }
    }
}

// ============================================================================
// GRAPH LAYER
// ============================================================================

/// Edge derivation + persistence.
pub struct GraphLayer {
    sink: Option<Arc<dyn GraphSink>>,
}

impl Default for GraphLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphLayer {
    pub fn new() -> Self {
        Self { sink: None }
    }

    pub fn with_sink(sink: Arc<dyn GraphSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Derive edges for a new memory against its neighbor list.
    ///
    /// Neighbors below the 0.65 score floor are skipped, self-edges are
    /// skipped, and `(src, dst, type)` triples are deduplicated within the
    /// call. Scores are clamped to [0, 1].
    pub fn derive_edges(
        &self,
        new_memory: &MemoryRecord,
        neighbors: &[GraphNeighbor],
        now: DateTime<Utc>,
    ) -> Vec<GraphEdgeRecord> {
        let new_id = &new_memory.id;
        let new_content = &new_memory.content;
        let new_event = new_memory
            .event_date
            .or_else(|| parse_event_date(new_content, now));
        let new_people = extract_people(new_content);
        let depends_on_signal = has_dependency_signal(new_content);

        let mut edges: Vec<GraphEdgeRecord> = Vec::new();
        let mut seen: HashSet<(String, String, EdgeType)> = HashSet::new();

        for neighbor in neighbors {
            if neighbor.id.is_empty() || neighbor.id == *new_id {
                continue;
            }
            let score = (1.0 - neighbor.distance).max(0.0);
            if score < MIN_EDGE_SCORE {
                continue;
            }

            let neighbor_event = neighbor
                .event_date
                .or_else(|| parse_event_date(&neighbor.content, now));
            let neighbor_people = extract_people(&neighbor.content);

            let mut append = |src: &str, dst: &str, edge_type: EdgeType, edge_score: f32| {
                let key = (src.to_string(), dst.to_string(), edge_type);
                if !seen.insert(key) {
                    return;
                }
                edges.push(GraphEdgeRecord {
                    id: Uuid::new_v4().to_string(),
                    source_memory_id: src.to_string(),
                    target_memory_id: dst.to_string(),
                    edge_type: edge_type.as_str().to_string(),
                    score: f64::from(edge_score.clamp(0.0, 1.0)),
                    created_at: now,
                });
            };

            if neighbor.category == new_memory.category && score >= 0.72 {
                append(new_id, &neighbor.id, EdgeType::BelongsTo, score);
            }

            if is_semantic_contradiction(&neighbor.content, new_content) {
                append(new_id, &neighbor.id, EdgeType::Contradicts, score);
            } else if score >= 0.90 {
                append(new_id, &neighbor.id, EdgeType::Reinforces, score);
            }

            if let (Some(new_dt), Some(neighbor_dt)) = (new_event, neighbor_event) {
                if neighbor_dt < new_dt {
                    append(&neighbor.id, new_id, EdgeType::Precedes, 0.85);
                } else if new_dt < neighbor_dt {
                    append(new_id, &neighbor.id, EdgeType::Precedes, 0.85);
                }
            }

            if depends_on_signal && score >= 0.75 {
                append(new_id, &neighbor.id, EdgeType::DependsOn, score);
            }

            if !new_people.is_empty() && new_people.intersection(&neighbor_people).next().is_some()
            {
                append(new_id, &neighbor.id, EdgeType::InvolvesPerson, 0.8);
            }
        }

        edges
    }

    /// Persist derived edges and mirror them to the external sink.
    pub fn persist_edges(&self, store: &Store, edges: &[GraphEdgeRecord]) -> Result<usize> {
        let inserted = store.insert_edges(edges)?;
        if let Some(sink) = &self.sink {
            for edge in edges {
                sink.add_edge(edge);
            }
        }
        Ok(inserted)
    }

    /// Mirror node previews to the external sink (no-op without one).
    pub fn sync_nodes(&self, nodes: &[(String, String)]) {
        if let Some(sink) = &self.sink {
            for (id, preview) in nodes {
                sink.upsert_memory(id, preview);
            }
        }
    }
}

fn has_dependency_signal(content: &str) -> bool {
    static SIGNAL: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"(?i)\b(depends on|requires|after)\b").unwrap()
    });
    SIGNAL.is_match(content)
}

/// Capitalized person-name tokens, excluding weekday/month names.
fn extract_people(content: &str) -> HashSet<String> {
    const COMMON_NAMES: &[&str] = &[
        "monday",
        "tuesday",
        "wednesday",
        "thursday",
        "friday",
        "saturday",
        "sunday",
        "january",
        "february",
        "march",
        "april",
        "may",
        "june",
        "july",
        "august",
        "september",
        "october",
        "november",
        "december",
    ];
    static NAME: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\b[A-Z][a-z]{2,}\b").unwrap());

    NAME.find_iter(content)
        .map(|m| m.as_str().to_string())
        .filter(|token| !COMMON_NAMES.contains(&token.to_lowercase().as_str()))
        .collect()
}

// ============================================================================
// GRAPH SEARCH
// ============================================================================

/// Node preview in a subgraph result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphNode {
    pub id: String,
    pub content_preview: String,
    pub category: crate::memory::MemoryCategory,
    pub level: crate::memory::MemoryLevel,
}

/// Edge projection in a subgraph result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub score: f64,
}

/// BFS result: the induced node + edge subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subgraph {
    pub start_memory_id: String,
    pub depth: u32,
    pub nodes: Vec<SubgraphNode>,
    pub edges: Vec<SubgraphEdge>,
}

/// BFS over edges up to `depth` (clamped to [1, 5]), returning the induced
/// subgraph with 180-char content previews. Archived memories are excluded.
pub fn graph_search(store: &Store, start_memory_id: &str, depth: u32) -> Result<Subgraph> {
    let depth = depth.clamp(1, 5);
    let all_edges = store.all_edges(200_000)?;

    let mut visited: HashSet<String> = HashSet::from([start_memory_id.to_string()]);
    let mut frontier: HashSet<String> = visited.clone();
    let mut selected: Vec<GraphEdgeRecord> = Vec::new();
    let mut selected_ids: HashSet<String> = HashSet::new();

    for _ in 0..depth {
        let mut next_frontier: HashSet<String> = HashSet::new();
        for edge in &all_edges {
            let src = &edge.source_memory_id;
            let dst = &edge.target_memory_id;
            if frontier.contains(src) || frontier.contains(dst) {
                if selected_ids.insert(edge.id.clone()) {
                    selected.push(edge.clone());
                }
                if !visited.contains(src) {
                    next_frontier.insert(src.clone());
                }
                if !visited.contains(dst) {
                    next_frontier.insert(dst.clone());
                }
            }
        }
        visited.extend(next_frontier.iter().cloned());
        frontier = next_frontier;
        if frontier.is_empty() {
            break;
        }
    }

    let mut nodes = Vec::new();
    let mut node_ids: HashSet<String> = HashSet::new();
    for id in &visited {
        if let Some(memory) = store.get_memory(id)? {
            if memory.status == crate::memory::MemoryStatus::Archived {
                continue;
            }
            node_ids.insert(memory.id.clone());
            nodes.push(SubgraphNode {
                id: memory.id.clone(),
                content_preview: crate::storage::records_preview(&memory.content, 180),
                category: memory.category,
                level: memory.level,
            });
        }
    }

    let edges = selected
        .into_iter()
        .filter(|e| node_ids.contains(&e.source_memory_id) && node_ids.contains(&e.target_memory_id))
        .map(|e| SubgraphEdge {
            id: e.id,
            source: e.source_memory_id,
            target: e.target_memory_id,
            edge_type: e.edge_type,
            score: e.score,
        })
        .collect();

    Ok(Subgraph {
        start_memory_id: start_memory_id.to_string(),
        depth,
        nodes,
        edges,
    })
}

// ============================================================================
// TESTS
// ============================================================================
