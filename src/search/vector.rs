//! Vector retrieval: embed the query, run a filtered ANN search, then
//! hydrate snippets from the metadata store.

use std::collections::HashMap;

use crate::db::MetadataStore;
use crate::embeddings::EmbeddingEngine;
use crate::error::Result;
use crate::types::{memory_id_of_chunk, MemoryStatus, MemoryType, Scope};
use crate::vector::{FilterBuilder, VectorCollection};

use super::{window_snippet, SearchHit, SOURCE_VECTOR};

#[derive(Debug, Clone)]
pub struct VectorParams<'a> {
    pub workspace: &'a str,
    pub top_k: usize,
    pub scopes: &'a [Scope],
    pub types: &'a [MemoryType],
    pub statuses: &'a [MemoryStatus],
}

/// Run the vector pipeline. A blank query yields an empty result.
pub async fn search(
    store: &MetadataStore,
    collection: &VectorCollection,
    engine: &EmbeddingEngine,
    query: &str,
    params: &VectorParams<'_>,
) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let vector = engine.embed(query).await?;

    let statuses: Vec<&str> = params.statuses.iter().map(|s| s.as_str()).collect();
    let scopes: Vec<&str> = params.scopes.iter().map(|s| s.as_str()).collect();
    let types: Vec<&str> = params.types.iter().map(|t| t.as_str()).collect();
    let filter = FilterBuilder::new()
        .eq("workspace", params.workspace)
        .any("status", &statuses)
        .any("scope", &scopes)
        .any("type", &types)
        .build();

    let chunk_hits = collection.query(&vector, params.top_k, filter.as_deref())?;

    // Collapse chunk hits to memory ids, keeping the best score. Hits
    // arrive score-descending, so first sight is the best chunk.
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, f64> = HashMap::new();
    for hit in &chunk_hits {
        let memory_id = memory_id_of_chunk(&hit.chunk_id).to_string();
        match best.get(&memory_id) {
            Some(&score) if score >= hit.score => {}
            Some(_) => {
                best.insert(memory_id, hit.score);
            }
            None => {
                best.insert(memory_id.clone(), hit.score);
                order.push(memory_id);
            }
        }
    }

    // Hydrate from the row store; items that are missing or filtered out
    // by status/workspace are dropped here
    let hydrated = store.hydrate_items(&order, params.workspace, params.statuses)?;

    let mut results = Vec::new();
    for memory_id in order {
        let Some(item) = hydrated.get(&memory_id) else {
            continue;
        };
        results.push(SearchHit {
            id: memory_id.clone(),
            title: item.title.clone(),
            snippet: window_snippet(&item.content, query),
            score: best[&memory_id],
            source: SOURCE_VECTOR.to_string(),
            scope: item.scope,
            memory_type: item.memory_type,
            status: item.status,
        });
    }
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(results)
}
