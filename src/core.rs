//! Core API: `save`, `get`, `list`, `recall`, `delete`, `reindex`,
//! `status`. Owns the metadata store, the per-workspace vector
//! collections, and the embedding engine; enforces the item lifecycle and
//! the dual-store consistency protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::config::{env_flag, ZmemConfig};
use crate::db::MetadataStore;
use crate::embeddings::{EmbeddingEngine, EmbeddingInput};
use crate::error::{Result, ZmemError};
use crate::indexer::chunker::{chunk_document, ChunkerConfig};
use crate::indexer::{build_chunks, persist_two_phase, IngestOptions};
use crate::metrics::RecallLatencyWindow;
use crate::search::lexical::{self, LexicalParams};
use crate::search::ranking::{reciprocal_rank_fusion, FusionConfig};
use crate::search::vector::{self as vector_search, VectorParams};
use crate::search::SearchHit;
use crate::types::{
    new_memory_id, now_iso, IngestReport, ListFilters, ListPage, MemoryItem, MemoryStatus,
    RecallOptions, ReindexReport, RetrievalMode, SaveInput, SaveOutcome, Scope, StatusReport,
};
use crate::vector::VectorCollections;

pub struct MemoryCore {
    store: MetadataStore,
    collections: VectorCollections,
    engine: EmbeddingEngine,
    config: ZmemConfig,
    chunker: ChunkerConfig,
    metrics: Option<RecallLatencyWindow>,
}

impl MemoryCore {
    /// Open the stores configured in `config` and wire up the engine.
    pub fn new(config: ZmemConfig) -> Result<Self> {
        let store = MetadataStore::open(&config.storage.db_path)?;
        let collections = VectorCollections::new(
            config.storage.zvec_path.clone(),
            config.ai.embedding.dimensions,
        );
        let engine = EmbeddingEngine::from_config(&config.ai.embedding);
        Ok(Self::with_parts(store, collections, engine, config))
    }

    /// Assemble a core from preconstructed parts (custom providers,
    /// in-memory stores).
    pub fn with_parts(
        store: MetadataStore,
        collections: VectorCollections,
        engine: EmbeddingEngine,
        config: ZmemConfig,
    ) -> Self {
        let metrics = env_flag("ZMEM_RECALL_METRICS").then(RecallLatencyWindow::new);
        Self {
            store,
            collections,
            engine,
            config,
            chunker: ChunkerConfig::default(),
            metrics,
        }
    }

    pub fn config(&self) -> &ZmemConfig {
        &self.config
    }

    /// Initialise the embedding provider. Must run before the first
    /// vector-side operation.
    pub async fn initialize(&self) -> Result<()> {
        self.engine.initialize().await
    }

    /// Dispose the provider and release vector-collection handles.
    pub fn shutdown(&self) {
        self.engine.dispose();
        self.collections.close_all();
    }

    /// Persist a new memory item through the two-phase protocol.
    pub async fn save(&self, workspace: &str, input: SaveInput) -> Result<SaveOutcome> {
        validate_save_input(&input)?;

        // Supersede preconditions: target exists here and is active
        let superseded = match &input.supersedes_id {
            Some(target_id) => {
                let target = self.store.get_item(workspace, target_id)?.ok_or_else(|| {
                    ZmemError::NotFound(format!(
                        "supersede target {target_id} not found in workspace {workspace}"
                    ))
                })?;
                if target.status != MemoryStatus::Active {
                    return Err(ZmemError::Conflict(format!(
                        "supersede target {target_id} is {}, not active",
                        target.status
                    )));
                }
                Some(target)
            }
            None => None,
        };

        let now = now_iso();
        let content_hash = hex::encode(Sha256::digest(input.content.as_bytes()));
        let item = MemoryItem {
            id: new_memory_id(),
            memory_type: input.memory_type,
            title: input.title.trim().to_string(),
            content: input.content,
            summary: input.summary,
            source: input.source,
            scope: input.scope.unwrap_or(Scope::Workspace),
            workspace: workspace.to_string(),
            tags: input.tags,
            importance: input.importance.unwrap_or(0.5),
            status: MemoryStatus::Pending,
            supersedes_id: superseded.as_ref().map(|t| t.id.clone()),
            content_hash,
            created_at: now.clone(),
            updated_at: now,
        };

        // Phase 0: chunk and embed before touching either store
        let chunks = build_chunks(&item, &chunk_document(&item.content, &self.chunker));
        let inputs: Vec<EmbeddingInput> = chunks
            .iter()
            .map(|c| EmbeddingInput {
                id: c.id.clone(),
                text: c.chunk_text.clone(),
            })
            .collect();
        let vectors: HashMap<String, Vec<f32>> = self
            .engine
            .embed_batch(&inputs)
            .await?
            .into_iter()
            .map(|o| (o.id, o.vector))
            .collect();

        // Phases 1-4
        let collection = self.collections.collection(workspace)?;
        persist_two_phase(
            &self.store,
            &collection,
            self.engine.model(),
            &item,
            &chunks,
            &vectors,
            item.supersedes_id.as_deref(),
        )?;

        Ok(SaveOutcome {
            superseded_id: item.supersedes_id.clone(),
            id: item.id,
            is_new: true,
        })
    }

    /// Fetch one item, scoped to the workspace. Soft-deleted items are
    /// not returned; the row itself stays inspectable at the store layer.
    pub fn get(&self, workspace: &str, id: &str) -> Result<Option<MemoryItem>> {
        if id.trim().is_empty() {
            return Err(ZmemError::Validation("id must not be empty".into()));
        }
        let item = self.store.get_item(workspace, id)?;
        Ok(item.filter(|i| i.status != MemoryStatus::Deleted))
    }

    pub fn list(&self, workspace: &str, filters: &ListFilters) -> Result<ListPage> {
        if filters.limit <= 0 {
            return Err(ZmemError::Validation("limit must be positive".into()));
        }
        if filters.offset < 0 {
            return Err(ZmemError::Validation("offset must not be negative".into()));
        }
        self.store.list_items(workspace, filters)
    }

    /// Hybrid/lexical/vector retrieval with superseded-visibility rules.
    pub async fn recall(
        &self,
        workspace: &str,
        query: &str,
        options: &RecallOptions,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(ZmemError::Validation("query must not be blank".into()));
        }
        let started = Instant::now();

        let statuses: Vec<MemoryStatus> = if options.include_superseded {
            vec![MemoryStatus::Active, MemoryStatus::Archived]
        } else {
            vec![MemoryStatus::Active]
        };
        let retrieval = &self.config.defaults.retrieval;

        let lex_params = LexicalParams {
            workspace,
            top_k: retrieval.top_k_lex,
            scopes: &options.scopes,
            types: &options.types,
            statuses: &statuses,
        };
        let vec_params = VectorParams {
            workspace,
            top_k: retrieval.top_k_vec,
            scopes: &options.scopes,
            types: &options.types,
            statuses: &statuses,
        };

        let mut results = match options.mode {
            RetrievalMode::Lexical => lexical::search(&self.store, query, &lex_params)?,
            RetrievalMode::Vector => {
                let collection = self.collections.collection(workspace)?;
                vector_search::search(&self.store, &collection, &self.engine, query, &vec_params)
                    .await?
            }
            RetrievalMode::Hybrid => {
                let collection = self.collections.collection(workspace)?;
                let lex = lexical::search(&self.store, query, &lex_params)?;
                let vec = vector_search::search(
                    &self.store,
                    &collection,
                    &self.engine,
                    query,
                    &vec_params,
                )
                .await?;
                let fusion = FusionConfig {
                    min_score: retrieval.min_score,
                    ..Default::default()
                };
                reciprocal_rank_fusion(&lex, &vec, &fusion)
            }
        };

        // Archived rows are reachable by keyword regardless of mode when
        // superseded results were requested
        if options.include_superseded {
            let tokens = lexical::tokenize_query(query);
            let archived = lexical::archived_fallback(&self.store, &tokens, &lex_params)?;
            lexical::merge_by_id(&mut results, archived);
        }

        // Prune rows shadowed by a competing active row. Relative to the
        // query's include_superseded setting, so it cannot fold into SQL
        if !options.include_superseded {
            let hidden = self.store.hidden_superseded_ids(workspace)?;
            if !hidden.is_empty() {
                results.retain(|hit| !hidden.contains(&hit.id));
            }
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(options.top_k);

        if let Some(metrics) = &self.metrics {
            metrics.record(started.elapsed().as_secs_f64() * 1000.0);
        }
        Ok(results)
    }

    /// Idempotent soft delete. Restores the previous status when the
    /// vector-side cleanup fails.
    pub fn delete(&self, workspace: &str, id: &str) -> Result<bool> {
        if id.trim().is_empty() {
            return Err(ZmemError::Validation("id must not be empty".into()));
        }
        let Some(item) = self.store.get_item(workspace, id)? else {
            return Ok(false);
        };
        if item.status == MemoryStatus::Deleted {
            return Ok(false);
        }

        let prior = (item.status, item.updated_at.clone());
        self.store.set_status(id, MemoryStatus::Deleted)?;

        let chunk_ids = self.store.chunk_ids_all(id)?;
        let collection = self.collections.collection(workspace)?;
        if let Err(e) = collection.delete_many(&chunk_ids) {
            self.store.restore_status(id, prior.0, &prior.1)?;
            return Err(ZmemError::Database(format!("vector delete failed: {e}")));
        }
        Ok(true)
    }

    pub async fn ingest(&self, options: &IngestOptions) -> Result<IngestReport> {
        let collection = self.collections.collection(&options.workspace)?;
        crate::indexer::ingest(&self.store, &collection, &self.engine, options, &self.chunker)
            .await
    }

    pub async fn reindex(&self, workspace: &str) -> Result<ReindexReport> {
        let collection = self.collections.collection(workspace)?;
        crate::indexer::reindex(&self.store, &collection, &self.engine, workspace, &self.chunker)
            .await
    }

    pub fn status(&self, workspace: &str) -> Result<StatusReport> {
        self.store.status_counts(workspace)
    }
}

/// Convenience alias used by the tool server.
pub type SharedCore = Arc<MemoryCore>;

fn validate_save_input(input: &SaveInput) -> Result<()> {
    if input.title.trim().is_empty() {
        return Err(ZmemError::Validation("title must not be empty".into()));
    }
    if input.content.trim().is_empty() {
        return Err(ZmemError::Validation("content must not be empty".into()));
    }
    if let Some(importance) = input.importance {
        if !(0.0..=1.0).contains(&importance) {
            return Err(ZmemError::Validation(
                "importance must be within [0, 1]".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::hash_engine;

    const DIMS: usize = 48;

    async fn test_core() -> (MemoryCore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open_in_memory().unwrap();
        let collections = VectorCollections::new(dir.path().to_path_buf(), DIMS);
        let engine = hash_engine(DIMS).await;
        let core = MemoryCore::with_parts(store, collections, engine, ZmemConfig::default());
        (core, dir)
    }

    fn fact(title: &str, content: &str) -> SaveInput {
        SaveInput {
            title: title.to_string(),
            content: content.to_string(),
            source: Some("smoke".to_string()),
            tags: vec!["smoke".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (core, _dir) = test_core().await;

        let outcome = core
            .save("w", fact("Happy path TKN", "This content validates TKN."))
            .await
            .unwrap();
        assert!(outcome.is_new);
        assert!(outcome.superseded_id.is_none());
        let id = outcome.id;

        let item = core.get("w", &id).unwrap().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.status, MemoryStatus::Active);

        let page = core.list("w", &ListFilters::default()).unwrap();
        assert!(page.items.iter().any(|i| i.id == id));

        let hits = core
            .recall("w", "TKN", &RecallOptions::default())
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.id == id));

        assert!(core.delete("w", &id).unwrap());
        assert!(!core.delete("w", &id).unwrap());
        assert!(core.get("w", &id).unwrap().is_none());

        let hits = core
            .recall("w", "TKN", &RecallOptions::default())
            .await
            .unwrap();
        assert!(!hits.iter().any(|h| h.id == id));
    }

    #[tokio::test]
    async fn test_supersede_semantics() {
        let (core, _dir) = test_core().await;

        let old = core
            .save("w", fact("Old fact", "Original content KEY OLDONLY"))
            .await
            .unwrap();
        let new = core
            .save(
                "w",
                SaveInput {
                    supersedes_id: Some(old.id.clone()),
                    ..fact("New fact", "Updated content KEY")
                },
            )
            .await
            .unwrap();
        assert_eq!(new.superseded_id.as_deref(), Some(old.id.as_str()));

        assert_eq!(
            core.get("w", &old.id).unwrap().unwrap().status,
            MemoryStatus::Archived
        );
        assert_eq!(
            core.get("w", &new.id).unwrap().unwrap().status,
            MemoryStatus::Active
        );

        // Default filters see the new row only
        let hits = core
            .recall("w", "KEY", &RecallOptions::default())
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.id == new.id));
        assert!(!hits.iter().any(|h| h.id == old.id));

        let lexical = RecallOptions {
            mode: RetrievalMode::Lexical,
            ..Default::default()
        };
        let hits = core.recall("w", "OLDONLY", &lexical).await.unwrap();
        assert!(hits.is_empty());

        let superseded = RecallOptions {
            mode: RetrievalMode::Lexical,
            include_superseded: true,
            ..Default::default()
        };
        let hits = core.recall("w", "OLDONLY", &superseded).await.unwrap();
        assert!(hits.iter().any(|h| h.id == old.id));
    }

    #[tokio::test]
    async fn test_supersede_preconditions() {
        let (core, _dir) = test_core().await;

        let err = core
            .save(
                "w",
                SaveInput {
                    supersedes_id: Some("missing-id".to_string()),
                    ..fact("T", "c")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let old = core.save("w", fact("Old", "content one")).await.unwrap();
        core.delete("w", &old.id).unwrap();
        let err = core
            .save(
                "w",
                SaveInput {
                    supersedes_id: Some(old.id.clone()),
                    ..fact("New", "content two")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");

        // Cross-workspace supersede is a NOT_FOUND
        let other = core.save("w2", fact("Other", "content three")).await.unwrap();
        let err = core
            .save(
                "w",
                SaveInput {
                    supersedes_id: Some(other.id),
                    ..fact("New", "content four")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_workspace_isolation() {
        let (core, _dir) = test_core().await;

        let a = core.save("w1", fact("A", "isolation token TKA")).await.unwrap();
        core.save("w2", fact("B", "isolation token TKB")).await.unwrap();

        let hits = core.recall("w1", "TKA", &RecallOptions::default()).await.unwrap();
        assert!(hits.iter().any(|h| h.id == a.id));
        let hits = core.recall("w1", "TKB", &RecallOptions::default()).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_mode_selectivity() {
        let (core, _dir) = test_core().await;

        let lex_item = core
            .save("w", fact("Rare token", "contains the rare LEXKW42 marker"))
            .await
            .unwrap();
        let hits = core
            .recall(
                "w",
                "LEXKW42",
                &RecallOptions {
                    mode: RetrievalMode::Lexical,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.id == lex_item.id));

        let vec_item = core
            .save(
                "w",
                fact("Benchmark", "semantic memory retrieval benchmark sentence"),
            )
            .await
            .unwrap();
        let hits = core
            .recall(
                "w",
                "semantic memory retrieval benchmark sentence",
                &RecallOptions {
                    mode: RetrievalMode::Vector,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, vec_item.id);
    }

    #[tokio::test]
    async fn test_empty_corpus() {
        let (core, _dir) = test_core().await;
        let hits = core
            .recall("fresh", "anything", &RecallOptions::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(core.status("fresh").unwrap().total_items, 0);
    }

    #[tokio::test]
    async fn test_punctuation_robustness() {
        let (core, _dir) = test_core().await;
        let item = core
            .save(
                "w",
                fact(
                    "Preference",
                    "Preference for handling oauth2/token (beta), user's-flow",
                ),
            )
            .await
            .unwrap();
        let hits = core
            .recall("w", "oauth2 beta users flow", &RecallOptions::default())
            .await
            .unwrap();
        assert!(hits.iter().any(|h| h.id == item.id));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (core, _dir) = test_core().await;

        let err = core.save("w", fact("", "content")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        let err = core.save("w", fact("title", "  ")).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        let err = core
            .save(
                "w",
                SaveInput {
                    importance: Some(1.5),
                    ..fact("t", "c")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");

        let err = core.recall("w", "   ", &RecallOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        let err = core.get("w", "").unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        let err = core.delete("w", " ").unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
        let err = core
            .list(
                "w",
                &ListFilters {
                    limit: 0,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_save_is_linearisable_for_status() {
        let (core, _dir) = test_core().await;
        let outcome = core.save("w", fact("Linear", "visible right away")).await.unwrap();
        // Immediately after save returns, the row is active and the
        // status counters include its vectors
        let item = core.get("w", &outcome.id).unwrap().unwrap();
        assert_eq!(item.status, MemoryStatus::Active);
        let report = core.status("w").unwrap();
        assert_eq!(report.total_items, 1);
        assert!(report.total_vectors >= 1);
        assert_eq!(report.pending_embeddings, 0);
    }

    #[tokio::test]
    async fn test_reindex_after_saves() {
        let (core, _dir) = test_core().await;
        core.save("w", fact("One", "first content")).await.unwrap();
        core.save("w", fact("Two", "second content")).await.unwrap();

        let report = core.reindex("w").await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.errors, 0);

        let report = core.reindex("empty-ws").await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.errors, 0);
    }
}
