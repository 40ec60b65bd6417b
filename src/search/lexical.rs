//! Lexical retrieval: BM25 over the full-text index with a strict-AND
//! pass, a relaxed-OR retry, and a keyword fallback for archived rows.

use std::collections::HashMap;

use crate::db::MetadataStore;
use crate::error::Result;
use crate::types::{MemoryStatus, MemoryType, Scope};

use super::{leading_snippet, SearchHit, SOURCE_LEXICAL};

/// Queries are capped to this many tokens.
pub const MAX_QUERY_TOKENS: usize = 12;

/// Fixed score for archived keyword hits; below any BM25-normalised hit.
pub const ARCHIVED_FALLBACK_SCORE: f64 = 0.35;

#[derive(Debug, Clone)]
pub struct LexicalParams<'a> {
    pub workspace: &'a str,
    pub top_k: usize,
    pub scopes: &'a [Scope],
    pub types: &'a [MemoryType],
    pub statuses: &'a [MemoryStatus],
}

/// Normalise and tokenise a query: lowercase, quotes to spaces, split on
/// non-word boundaries, drop tokens shorter than two characters, cap the
/// count.
pub fn tokenize_query(query: &str) -> Vec<String> {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '\'' | '"' | '’' | '‘' | '“' | '”' | '`' => ' ',
            other => other,
        })
        .collect();

    let mut tokens = Vec::new();
    for token in cleaned.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if token.chars().count() < 2 {
            continue;
        }
        tokens.push(token.to_string());
        if tokens.len() == MAX_QUERY_TOKENS {
            break;
        }
    }
    tokens
}

/// Run the lexical pipeline. Zero tokens yield an empty result, never an
/// error.
pub fn search(store: &MetadataStore, query: &str, params: &LexicalParams<'_>) -> Result<Vec<SearchHit>> {
    let tokens = tokenize_query(query);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let strict = run_match(store, &tokens, " AND ", params)?;
    let mut hits = if !strict.is_empty() {
        strict
    } else if tokens.len() > 1 {
        // Strict conjunction found nothing; retry as a disjunction
        run_match(store, &tokens, " OR ", params)?
    } else {
        Vec::new()
    };

    if params.statuses.contains(&MemoryStatus::Archived) {
        let archived = archived_fallback(store, &tokens, params)?;
        merge_by_id(&mut hits, archived);
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(params.top_k);
    Ok(hits)
}

fn run_match(
    store: &MetadataStore,
    tokens: &[String],
    separator: &str,
    params: &LexicalParams<'_>,
) -> Result<Vec<SearchHit>> {
    let match_expr = tokens
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(separator);

    let rows = store.fts_search(
        &match_expr,
        params.workspace,
        params.scopes,
        params.types,
        params.statuses,
        params.top_k,
    )?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let snippet = row
                .snippet
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| leading_snippet(&row.content, 200));
            SearchHit {
                id: row.item_id,
                title: row.title,
                snippet,
                // BM25 rank is negative, lower is better; remap to (0, 1]
                score: 1.0 / (1.0 + row.bm25.abs()),
                source: SOURCE_LEXICAL.to_string(),
                scope: row.scope,
                memory_type: row.memory_type,
                status: row.status,
            }
        })
        .collect())
}

/// The FTS triggers exclude non-active rows, so archived content needs a
/// separate keyword pass.
pub fn archived_fallback(
    store: &MetadataStore,
    tokens: &[String],
    params: &LexicalParams<'_>,
) -> Result<Vec<SearchHit>> {
    let rows = store.archived_keyword_search(
        tokens,
        params.workspace,
        params.scopes,
        params.types,
        params.top_k,
    )?;
    Ok(rows
        .into_iter()
        .map(|row| SearchHit {
            id: row.item_id,
            title: row.title,
            snippet: leading_snippet(&row.content, 200),
            score: ARCHIVED_FALLBACK_SCORE,
            source: SOURCE_LEXICAL.to_string(),
            scope: row.scope,
            memory_type: row.memory_type,
            status: row.status,
        })
        .collect())
}

/// Merge `incoming` into `hits`, deduplicating by id and keeping the
/// higher score.
pub fn merge_by_id(hits: &mut Vec<SearchHit>, incoming: Vec<SearchHit>) {
    let mut index: HashMap<String, usize> = hits
        .iter()
        .enumerate()
        .map(|(i, h)| (h.id.clone(), i))
        .collect();
    for hit in incoming {
        match index.get(&hit.id) {
            Some(&i) => {
                if hit.score > hits[i].score {
                    hits[i] = hit;
                }
            }
            None => {
                index.insert(hit.id.clone(), hits.len());
                hits.push(hit);
            }
        }
    }
}
