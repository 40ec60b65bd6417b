//! Ingestion pipeline: discovery, parsing, chunking, embedding, upsert,
//! and soft-deletion of removed sources. Also hosts the reindex path and
//! the two-phase persist protocol shared with `save`.

pub mod chunker;
pub mod parser;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::db::MetadataStore;
use crate::embeddings::{EmbeddingEngine, EmbeddingInput};
use crate::error::{Result, ZmemError};
use crate::indexer::chunker::{chunk_document, ChunkSpan, ChunkerConfig};
use crate::indexer::parser::{parse_document, ParsedDocument};
use crate::types::{
    chunk_id, new_memory_id, now_iso, ContentChunk, IngestReport, MemoryItem, MemoryStatus,
    ReindexReport, Scope,
};
use crate::vector::{VectorCollection, VectorMetadata};

/// Directories never descended into, in addition to any dot-prefixed
/// path component.
const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".cache",
    "vendor",
    "dist",
    "build",
    ".env",
    "coverage",
];

const DEFAULT_PATTERNS: &[&str] = &["**/*.md", "**/*.markdown", "**/*.txt"];

const PARSE_CONCURRENCY: usize = 10;
/// Documents per embed_batch call.
const DOCS_PER_EMBED_BATCH: usize = 8;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub workspace: String,
    pub root_path: PathBuf,
    pub glob_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

/// One file found during discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub absolute: PathBuf,
    pub relative: String,
    pub size: u64,
    pub modified: Option<std::time::SystemTime>,
}

struct PendingDoc {
    relative: String,
    doc: ParsedDocument,
    existing: Option<MemoryItem>,
}

/// Recursively discover ingestable files under `root`, deny-list and
/// glob-filtered, sorted by relative path for determinism.
pub fn discover_files(
    root: &Path,
    patterns: &[String],
    excludes: &[String],
) -> Result<Vec<DiscoveredFile>> {
    let include = if patterns.is_empty() {
        let defaults: Vec<String> = DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect();
        build_globset(&defaults)?
    } else {
        build_globset(patterns)?
    };
    let exclude = if excludes.is_empty() {
        None
    } else {
        Some(build_globset(excludes)?)
    };

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_excluded_entry(entry));
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        if !include.is_match(&relative) {
            continue;
        }
        if let Some(exclude) = &exclude {
            if exclude.is_match(&relative) {
                continue;
            }
        }
        let metadata = entry.metadata().ok();
        files.push(DiscoveredFile {
            absolute: entry.path().to_path_buf(),
            relative,
            size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            modified: metadata.and_then(|m| m.modified().ok()),
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

fn is_excluded_entry(entry: &walkdir::DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.')
        || (entry.file_type().is_dir() && EXCLUDED_DIRS.contains(&name.as_ref()))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ZmemError::Validation(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ZmemError::Validation(format!("invalid glob set: {e}")))
}

/// Run one ingestion pass over a workspace root.
pub async fn ingest(
    store: &MetadataStore,
    collection: &VectorCollection,
    engine: &EmbeddingEngine,
    options: &IngestOptions,
    chunker_config: &ChunkerConfig,
) -> Result<IngestReport> {
    let started = Instant::now();
    let mut report = IngestReport::default();

    let files = discover_files(
        &options.root_path,
        &options.glob_patterns,
        &options.exclude_patterns,
    )?;
    report.scanned = files.len();
    let seen: HashSet<String> = files.iter().map(|f| f.relative.clone()).collect();
    tracing::debug!(
        scanned = files.len(),
        bytes = files.iter().map(|f| f.size).sum::<u64>(),
        "discovery complete"
    );

    // Parse with bounded concurrency, preserving discovery order
    let parsed: Vec<(DiscoveredFile, Result<ParsedDocument>)> = stream::iter(files)
        .map(|file| async move {
            let result = read_and_parse(&file).await;
            (file, result)
        })
        .buffered(PARSE_CONCURRENCY)
        .collect()
        .await;

    // Change detection
    let mut pending = Vec::new();
    for (file, result) in parsed {
        match result {
            Err(e) => report.errors.push(format!("{}: {}", file.relative, e)),
            Ok(doc) => match store.find_active_by_source(&options.workspace, &file.relative)? {
                Some(existing) if existing.content_hash == doc.content_hash => {
                    report.unchanged += 1;
                }
                existing => pending.push(PendingDoc {
                    relative: file.relative,
                    doc,
                    existing,
                }),
            },
        }
    }

    // Embed and upsert, a batch of documents at a time
    for batch in pending.chunks(DOCS_PER_EMBED_BATCH) {
        let mut prepared = Vec::new();
        let mut inputs = Vec::new();
        for doc in batch {
            // A pending row stranded by a crash was never visible: treat
            // the source as absent
            store.purge_stale_pending(&options.workspace, &doc.relative)?;
            let item = item_from_document(&options.workspace, &doc.relative, &doc.doc, doc.existing.as_ref());
            let chunks = build_chunks(&item, &chunk_document(&item.content, chunker_config));
            inputs.extend(chunks.iter().map(|c| EmbeddingInput {
                id: c.id.clone(),
                text: c.chunk_text.clone(),
            }));
            prepared.push((doc, item, chunks));
        }

        let vectors = match engine.embed_batch(&inputs).await {
            Ok(outputs) => outputs
                .into_iter()
                .map(|o| (o.id, o.vector))
                .collect::<HashMap<_, _>>(),
            Err(e) => {
                for (doc, _, _) in &prepared {
                    report.errors.push(format!("{}: {}", doc.relative, e));
                }
                continue;
            }
        };

        for (doc, item, chunks) in prepared {
            match persist_two_phase(
                store,
                collection,
                engine.model(),
                &item,
                &chunks,
                &vectors,
                doc.existing.as_ref().map(|e| e.id.as_str()),
            ) {
                Ok(()) => {
                    report.chunks_created += chunks.len();
                    if doc.existing.is_some() {
                        report.updated += 1;
                    } else {
                        report.inserted += 1;
                    }
                }
                Err(e) => report.errors.push(format!("{}: {}", doc.relative, e)),
            }
        }
    }

    // Sources no longer on disk are soft-deleted; their vectors are
    // filtered by status and reclaimed on reindex
    report.removed = store
        .cleanup_missing_sources(&options.workspace, &seen)?
        .len();

    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        scanned = report.scanned,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        removed = report.removed,
        errors = report.errors.len(),
        "ingestion complete"
    );
    Ok(report)
}

/// Rebuild chunks and vectors for every active item in the workspace from
/// its stored content. Item rows are not recreated; only `updated_at`
/// advances. Also sweeps vectors left behind by archived or deleted items.
pub async fn reindex(
    store: &MetadataStore,
    collection: &VectorCollection,
    engine: &EmbeddingEngine,
    workspace: &str,
    chunker_config: &ChunkerConfig,
) -> Result<ReindexReport> {
    let started = Instant::now();
    let mut report = ReindexReport::default();

    let stale = store.embedded_chunk_ids_not_active(workspace)?;
    if !stale.is_empty() {
        collection.delete_many(&stale)?;
        store.delete_embedding_rows(&stale)?;
        tracing::debug!(swept = stale.len(), "removed vectors of non-active items");
    }

    let items = store.active_items(workspace)?;
    if items.is_empty() {
        report.duration_ms = started.elapsed().as_millis() as u64;
        return Ok(report);
    }

    for batch in items.chunks(DOCS_PER_EMBED_BATCH) {
        let mut prepared = Vec::new();
        let mut inputs = Vec::new();
        for item in batch {
            let chunks = build_chunks(item, &chunk_document(&item.content, chunker_config));
            inputs.extend(chunks.iter().map(|c| EmbeddingInput {
                id: c.id.clone(),
                text: c.chunk_text.clone(),
            }));
            prepared.push((item, chunks));
        }

        let vectors = match engine.embed_batch(&inputs).await {
            Ok(outputs) => outputs
                .into_iter()
                .map(|o| (o.id, o.vector))
                .collect::<HashMap<_, _>>(),
            Err(e) => {
                tracing::warn!("Reindex batch embedding failed: {}", e);
                report.errors += prepared.len();
                continue;
            }
        };

        for (item, chunks) in prepared {
            match rebuild_item(store, collection, engine.model(), item, &chunks, &vectors) {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    tracing::warn!("Reindex of {} failed: {}", item.id, e);
                    report.errors += 1;
                }
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(
        processed = report.processed,
        errors = report.errors,
        "reindex complete"
    );
    Ok(report)
}

/// The dual-store persist protocol shared by `save` and ingestion upsert:
/// commit DB rows as pending, write vectors, then finalise to active —
/// compensating earlier phases when a later one fails.
pub(crate) fn persist_two_phase(
    store: &MetadataStore,
    collection: &VectorCollection,
    model: &str,
    item: &MemoryItem,
    chunks: &[ContentChunk],
    vectors: &HashMap<String, Vec<f32>>,
    superseded_id: Option<&str>,
) -> Result<()> {
    // Every requested chunk id must have an embedding
    for chunk in chunks {
        if !vectors.contains_key(&chunk.id) {
            return Err(ZmemError::Embedding(format!(
                "no embedding returned for chunk {}",
                chunk.id
            )));
        }
    }

    // Phase 1: pending row + chunks + tracking rows, one transaction
    store.insert_pending(item, chunks, model)?;

    // Phase 2: vector writes. Metadata status is written as "active";
    // visibility is governed by the row-status filter at hydration
    let mut inserted = Vec::new();
    for chunk in chunks {
        let metadata = VectorMetadata {
            memory_id: item.id.clone(),
            workspace: item.workspace.clone(),
            scope: item.scope.as_str().to_string(),
            memory_type: item.memory_type.as_str().to_string(),
            status: MemoryStatus::Active.as_str().to_string(),
        };
        if let Err(e) = collection.insert(&chunk.id, &vectors[&chunk.id], &metadata) {
            let _ = collection.delete_many(&inserted);
            let _ = store.delete_item_row(&item.id);
            return Err(ZmemError::Database(format!("vector insert failed: {e}")));
        }
        inserted.push(chunk.id.clone());
    }

    // Phase 3: finalise to active, archiving the superseded row
    if let Err(e) = store.finalize_save(&item.id, superseded_id) {
        let _ = collection.delete_many(&inserted);
        let _ = store.delete_item_row(&item.id);
        return Err(e);
    }

    // Phase 4: the superseded item's vectors are no longer reachable
    if let Some(old_id) = superseded_id {
        let old_chunks = store.chunk_ids_all(old_id)?;
        collection
            .delete_many(&old_chunks)
            .map_err(|e| ZmemError::Database(format!("superseded vector cleanup failed: {e}")))?;
    }

    Ok(())
}

fn rebuild_item(
    store: &MetadataStore,
    collection: &VectorCollection,
    model: &str,
    item: &MemoryItem,
    chunks: &[ContentChunk],
    vectors: &HashMap<String, Vec<f32>>,
) -> Result<()> {
    for chunk in chunks {
        if !vectors.contains_key(&chunk.id) {
            return Err(ZmemError::Embedding(format!(
                "no embedding returned for chunk {}",
                chunk.id
            )));
        }
    }

    let old_chunks = store.chunk_ids_all(&item.id)?;
    collection.delete_many(&old_chunks)?;
    store.delete_chunks(&item.id)?;
    store.insert_chunks(chunks, model)?;
    for chunk in chunks {
        let metadata = VectorMetadata {
            memory_id: item.id.clone(),
            workspace: item.workspace.clone(),
            scope: item.scope.as_str().to_string(),
            memory_type: item.memory_type.as_str().to_string(),
            status: MemoryStatus::Active.as_str().to_string(),
        };
        collection.insert(&chunk.id, &vectors[&chunk.id], &metadata)?;
    }
    store.touch(&item.id)?;
    Ok(())
}

/// Materialise chunk rows for an item from chunker output.
pub(crate) fn build_chunks(item: &MemoryItem, spans: &[ChunkSpan]) -> Vec<ContentChunk> {
    let now = now_iso();
    spans
        .iter()
        .map(|span| ContentChunk {
            id: chunk_id(&item.id, span.seq),
            memory_id: item.id.clone(),
            seq: span.seq,
            pos: span.pos,
            token_count: span.token_count,
            chunk_text: span.text.clone(),
            created_at: now.clone(),
            deleted_at: None,
        })
        .collect()
}

fn item_from_document(
    workspace: &str,
    relative: &str,
    doc: &ParsedDocument,
    existing: Option<&MemoryItem>,
) -> MemoryItem {
    let now = now_iso();
    MemoryItem {
        id: new_memory_id(),
        memory_type: doc.memory_type,
        title: doc.title.clone(),
        content: doc.content.clone(),
        summary: None,
        source: Some(relative.to_string()),
        scope: Scope::Workspace,
        workspace: workspace.to_string(),
        tags: doc.tags.clone(),
        importance: doc.importance.unwrap_or(0.5),
        status: MemoryStatus::Pending,
        supersedes_id: existing.map(|e| e.id.clone()),
        content_hash: doc.content_hash.clone(),
        created_at: now.clone(),
        updated_at: now,
    }
}

async fn read_and_parse(file: &DiscoveredFile) -> Result<ParsedDocument> {
    let bytes = tokio::fs::read(&file.absolute).await?;
    let stem = Path::new(&file.relative)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file.relative.clone());
    Ok(parse_document(&bytes, &stem))
}
