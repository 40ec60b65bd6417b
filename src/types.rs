//! Domain model shared across the storage, search, and API layers.

use serde::{Deserialize, Serialize};

/// Kind of knowledge a memory item captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Fact,
    Decision,
    Preference,
    Event,
    Goal,
    Todo,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Decision => "decision",
            MemoryType::Preference => "preference",
            MemoryType::Event => "event",
            MemoryType::Goal => "goal",
            MemoryType::Todo => "todo",
        }
    }

    /// Parse a stored or user-provided value. `None` for unknown values;
    /// the ingestion pipeline maps unknown to [`MemoryType::Fact`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fact" => Some(MemoryType::Fact),
            "decision" => Some(MemoryType::Decision),
            "preference" => Some(MemoryType::Preference),
            "event" => Some(MemoryType::Event),
            "goal" => Some(MemoryType::Goal),
            "todo" => Some(MemoryType::Todo),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval-filter tag carried on every item. Workspaces isolate rows;
/// scopes are a label within a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    Workspace,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Workspace => "workspace",
            Scope::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(Scope::Global),
            "workspace" => Some(Scope::Workspace),
            "user" => Some(Scope::User),
            _ => None,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a memory item.
///
/// Creation writes `pending`; the save protocol finalises to `active`;
/// supersede archives the prior row; soft delete is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Pending,
    Active,
    Archived,
    Deleted,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Pending => "pending",
            MemoryStatus::Active => "active",
            MemoryStatus::Archived => "archived",
            MemoryStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MemoryStatus::Pending),
            "active" => Some(MemoryStatus::Active),
            "archived" => Some(MemoryStatus::Archived),
            "deleted" => Some(MemoryStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which retrieval pipelines a recall runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Hybrid,
    Lexical,
    Vector,
}

impl RetrievalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hybrid" => Some(RetrievalMode::Hybrid),
            "lexical" => Some(RetrievalMode::Lexical),
            "vector" => Some(RetrievalMode::Vector),
            _ => None,
        }
    }
}

/// A durable unit of memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub source: Option<String>,
    pub scope: Scope,
    pub workspace: String,
    pub tags: Vec<String>,
    pub importance: f64,
    pub status: MemoryStatus,
    pub supersedes_id: Option<String>,
    pub content_hash: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A contiguous sub-span of an item's content, the unit of embedding.
///
/// `id` is deterministic: `"<memory_id>_<seq>"`.
#[derive(Debug, Clone)]
pub struct ContentChunk {
    pub id: String,
    pub memory_id: String,
    pub seq: i64,
    pub pos: i64,
    pub token_count: i64,
    pub chunk_text: String,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

/// Validated input to `save`.
#[derive(Debug, Clone, Default)]
pub struct SaveInput {
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub source: Option<String>,
    pub scope: Option<Scope>,
    pub tags: Vec<String>,
    pub importance: Option<f64>,
    pub supersedes_id: Option<String>,
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::Fact
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub id: String,
    pub is_new: bool,
    pub superseded_id: Option<String>,
}

/// Filters for `list`.
#[derive(Debug, Clone)]
pub struct ListFilters {
    pub memory_type: Option<MemoryType>,
    pub scope: Option<Scope>,
    pub status: Option<MemoryStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListFilters {
    fn default() -> Self {
        Self {
            memory_type: None,
            scope: None,
            status: Some(MemoryStatus::Active),
            limit: 20,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListPage {
    pub items: Vec<MemoryItem>,
    pub total: i64,
}

/// Options for `recall`.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    pub mode: RetrievalMode,
    pub top_k: usize,
    pub scopes: Vec<Scope>,
    pub types: Vec<MemoryType>,
    pub include_superseded: bool,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            top_k: 20,
            scopes: Vec::new(),
            types: Vec::new(),
            include_superseded: false,
        }
    }
}

/// Workspace-scoped counters reported by `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub total_items: i64,
    pub total_vectors: i64,
    pub pending_embeddings: i64,
    pub last_indexed_at: Option<String>,
}

/// Summary of one ingestion run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    pub scanned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub chunks_created: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Summary of one reindex run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReindexReport {
    pub processed: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

/// Current UTC time as an ISO-8601 string (millisecond precision, sorts
/// lexically).
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Collision-resistant opaque item id.
pub fn new_memory_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Deterministic chunk id for a given item and position.
pub fn chunk_id(memory_id: &str, seq: i64) -> String {
    format!("{}_{}", memory_id, seq)
}

/// Recover the owning `memory_id` from a chunk id by stripping the
/// trailing `_<digits>` suffix. Returns the input unchanged when no such
/// suffix exists.
pub fn memory_id_of_chunk(chunk_id: &str) -> &str {
    match chunk_id.rfind('_') {
        Some(idx) if chunk_id[idx + 1..].chars().all(|c| c.is_ascii_digit())
            && idx + 1 < chunk_id.len() =>
        {
            &chunk_id[..idx]
        }
        _ => chunk_id,
    }
}
