pub mod schema;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{Result, ZmemError};
use crate::types::{
    now_iso, ContentChunk, ListFilters, ListPage, MemoryItem, MemoryStatus, MemoryType, Scope,
    StatusReport,
};

const ITEM_COLUMNS: &str = "id, type, title, content, summary, source, scope, workspace, tags, \
     importance, status, supersedes_id, content_hash, created_at, updated_at";

/// Thread-safe wrapper around the metadata database.
///
/// All multi-statement mutations go through [`MetadataStore::with_transaction`]
/// and either fully commit or fully roll back.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

/// One BM25 hit from the full-text index, joined with its item row.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub item_id: String,
    pub bm25: f64,
    pub snippet: Option<String>,
    pub title: String,
    pub content: String,
    pub scope: Scope,
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
}

/// One hit from the archived keyword fallback.
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub item_id: String,
    pub title: String,
    pub content: String,
    pub scope: Scope,
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
}

/// Item fields fetched in bulk when hydrating vector hits.
#[derive(Debug, Clone)]
pub struct HydratedItem {
    pub title: String,
    pub content: String,
    pub scope: Scope,
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
}

impl MetadataStore {
    /// Open or create the metadata database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ZmemError::Database(format!("open {}: {}", path.display(), e)))?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure with access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ZmemError::Database(format!("connection lock poisoned: {e}")))?;
        f(&conn)
    }

    /// Run a closure inside a transaction; rolls back when it errors.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ZmemError::Database(format!("connection lock poisoned: {e}")))?;
        let tx = conn.unchecked_transaction().map_err(ZmemError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(ZmemError::from)?;
        Ok(out)
    }

    // --- Item lifecycle ---

    /// Phase 1 of the save protocol: insert the pending item row together
    /// with its chunks and embedding-tracking rows, in one transaction.
    pub fn insert_pending(
        &self,
        item: &MemoryItem,
        chunks: &[ContentChunk],
        model: &str,
    ) -> Result<()> {
        self.with_transaction(|conn| {
            insert_item_row(conn, item)?;
            for chunk in chunks {
                insert_chunk_row(conn, chunk)?;
                conn.execute(
                    "INSERT INTO chunk_embeddings (chunk_id, embedded_at, model)
                     VALUES (?1, ?2, ?3)",
                    params![chunk.id, now_iso(), model],
                )?;
            }
            Ok(())
        })
    }

    /// Phase 3 of the save protocol: activate the new row and, when
    /// superseding, archive the prior row and retire its chunks.
    pub fn finalize_save(&self, new_id: &str, superseded_id: Option<&str>) -> Result<()> {
        self.with_transaction(|conn| {
            let now = now_iso();
            conn.execute(
                "UPDATE memory_items SET status = 'active', updated_at = ?2 WHERE id = ?1",
                params![new_id, now],
            )?;
            if let Some(old_id) = superseded_id {
                conn.execute(
                    "UPDATE memory_items SET status = 'archived', updated_at = ?2 WHERE id = ?1",
                    params![old_id, now],
                )?;
                conn.execute(
                    "DELETE FROM chunk_embeddings WHERE chunk_id IN
                         (SELECT id FROM content_chunks WHERE memory_id = ?1)",
                    params![old_id],
                )?;
                conn.execute(
                    "UPDATE content_chunks SET deleted_at = ?2
                     WHERE memory_id = ?1 AND deleted_at IS NULL",
                    params![old_id, now],
                )?;
            }
            Ok(())
        })
    }

    /// Compensation path: hard-delete an item row (chunks and embedding
    /// rows cascade). Returns whether a row was removed.
    pub fn delete_item_row(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM memory_items WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    pub fn get_item(&self, workspace: &str, id: &str) -> Result<Option<MemoryItem>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items WHERE id = ?1 AND workspace = ?2"
            );
            let item = conn
                .query_row(&sql, params![id, workspace], row_to_item)
                .optional()?;
            Ok(item)
        })
    }

    /// The single active row for a `(workspace, source)` pair, if any.
    pub fn find_active_by_source(
        &self,
        workspace: &str,
        source: &str,
    ) -> Result<Option<MemoryItem>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items
                 WHERE source = ?1 AND workspace = ?2 AND status = 'active'"
            );
            let item = conn
                .query_row(&sql, params![source, workspace], row_to_item)
                .optional()?;
            Ok(item)
        })
    }

    /// Remove pending rows stranded by a crash for this source. They were
    /// never visible, so no compensation is required.
    pub fn purge_stale_pending(&self, workspace: &str, source: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM memory_items
                 WHERE workspace = ?1 AND source = ?2 AND status = 'pending'",
                params![workspace, source],
            )?;
            Ok(n)
        })
    }

    pub fn set_status(&self, id: &str, status: MemoryStatus) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_items SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now_iso()],
            )?;
            Ok(())
        })
    }

    /// Restore a previously captured `(status, updated_at)` pair, used when
    /// a vector-side mutation fails after the row was already updated.
    pub fn restore_status(&self, id: &str, status: MemoryStatus, updated_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_items SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), updated_at],
            )?;
            Ok(())
        })
    }

    /// Advance `updated_at` without touching anything else (reindex).
    pub fn touch(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_items SET updated_at = ?2 WHERE id = ?1",
                params![id, now_iso()],
            )?;
            Ok(())
        })
    }

    pub fn list_items(&self, workspace: &str, filters: &ListFilters) -> Result<ListPage> {
        self.with_conn(|conn| {
            let mut clauses = vec!["workspace = ?1".to_string()];
            if let Some(t) = filters.memory_type {
                clauses.push(format!("type = '{}'", t.as_str()));
            }
            if let Some(s) = filters.scope {
                clauses.push(format!("scope = '{}'", s.as_str()));
            }
            if let Some(s) = filters.status {
                clauses.push(format!("status = '{}'", s.as_str()));
            }
            let where_sql = clauses.join(" AND ");

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM memory_items WHERE {where_sql}"),
                params![workspace],
                |row| row.get(0),
            )?;

            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items WHERE {where_sql}
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![workspace, filters.limit, filters.offset], row_to_item)?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(ListPage { items, total })
        })
    }

    pub fn active_items(&self, workspace: &str) -> Result<Vec<MemoryItem>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM memory_items
                 WHERE workspace = ?1 AND status = 'active'
                 ORDER BY created_at"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![workspace], row_to_item)?;
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(items)
        })
    }

    // --- Chunks ---

    /// All chunk ids for an item, tombstoned included (vector cleanup).
    pub fn chunk_ids_all(&self, memory_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM content_chunks WHERE memory_id = ?1 ORDER BY seq")?;
            let rows = stmt.query_map(params![memory_id], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    /// Hard-delete an item's chunks (embedding rows cascade). Reindex uses
    /// this before rebuilding from the stored content.
    pub fn delete_chunks(&self, memory_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM content_chunks WHERE memory_id = ?1",
                params![memory_id],
            )?;
            Ok(())
        })
    }

    /// Insert freshly rebuilt chunks with their tracking rows (reindex).
    pub fn insert_chunks(&self, chunks: &[ContentChunk], model: &str) -> Result<()> {
        self.with_transaction(|conn| {
            for chunk in chunks {
                insert_chunk_row(conn, chunk)?;
                conn.execute(
                    "INSERT INTO chunk_embeddings (chunk_id, embedded_at, model)
                     VALUES (?1, ?2, ?3)",
                    params![chunk.id, now_iso(), model],
                )?;
            }
            Ok(())
        })
    }

    /// Chunk ids of non-active items that still have embedding-tracking
    /// rows; these vectors are swept during reindex.
    pub fn embedded_chunk_ids_not_active(&self, workspace: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ce.chunk_id FROM chunk_embeddings ce
                 JOIN content_chunks c ON c.id = ce.chunk_id
                 JOIN memory_items i ON i.id = c.memory_id
                 WHERE i.workspace = ?1 AND i.status != 'active'",
            )?;
            let rows = stmt.query_map(params![workspace], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }

    pub fn delete_embedding_rows(&self, chunk_ids: &[String]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        self.with_transaction(|conn| {
            for id in chunk_ids {
                conn.execute(
                    "DELETE FROM chunk_embeddings WHERE chunk_id = ?1",
                    params![id],
                )?;
            }
            Ok(())
        })
    }

    // --- Ingestion support ---

    /// Soft-delete active rows whose source was not observed in this run.
    /// Returns the ids that were marked deleted.
    pub fn cleanup_missing_sources(
        &self,
        workspace: &str,
        seen_sources: &HashSet<String>,
    ) -> Result<Vec<String>> {
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source FROM memory_items
                 WHERE workspace = ?1 AND status = 'active' AND source IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![workspace], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut removed = Vec::new();
            for row in rows {
                let (id, source) = row?;
                if !seen_sources.contains(&source) {
                    removed.push(id);
                }
            }
            let now = now_iso();
            for id in &removed {
                conn.execute(
                    "UPDATE memory_items SET status = 'deleted', updated_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
            }
            Ok(removed)
        })
    }

    // --- Search ---

    /// BM25 query over the full-text index, joined with item rows for
    /// filtering. `match_expr` is a prebuilt FTS5 MATCH expression.
    pub fn fts_search(
        &self,
        match_expr: &str,
        workspace: &str,
        scopes: &[Scope],
        types: &[MemoryType],
        statuses: &[MemoryStatus],
        limit: usize,
    ) -> Result<Vec<FtsHit>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT memory_fts.item_id,
                        bm25(memory_fts) AS score,
                        snippet(memory_fts, 2, '<mark>', '</mark>', '…', 64) AS snip,
                        i.title, i.content, i.scope, i.type, i.status
                 FROM memory_fts
                 JOIN memory_items i ON i.id = memory_fts.item_id
                 WHERE memory_fts MATCH ?1 AND i.workspace = ?2",
            );
            push_enum_filter(&mut sql, "i.scope", scopes.iter().map(|s| s.as_str()));
            push_enum_filter(&mut sql, "i.type", types.iter().map(|t| t.as_str()));
            push_enum_filter(&mut sql, "i.status", statuses.iter().map(|s| s.as_str()));
            sql.push_str(" ORDER BY bm25(memory_fts) LIMIT ?3");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![match_expr, workspace, limit as i64], |row| {
                Ok(FtsHit {
                    item_id: row.get(0)?,
                    bm25: row.get(1)?,
                    snippet: row.get(2)?,
                    title: row.get(3)?,
                    content: row.get(4)?,
                    scope: parse_scope(row, 5)?,
                    memory_type: parse_type(row, 6)?,
                    status: parse_status(row, 7)?,
                })
            })?;
            let mut hits = Vec::new();
            for row in rows {
                hits.push(row?);
            }
            Ok(hits)
        })
    }

    /// Keyword fallback over archived rows, which the FTS triggers exclude
    /// by construction. Runs a LIKE conjunction over lowered title/content.
    pub fn archived_keyword_search(
        &self,
        tokens: &[String],
        workspace: &str,
        scopes: &[Scope],
        types: &[MemoryType],
        limit: usize,
    ) -> Result<Vec<KeywordHit>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, title, content, scope, type, status FROM memory_items
                 WHERE status = 'archived' AND workspace = ?",
            );
            let mut values: Vec<Value> = vec![Value::Text(workspace.to_string())];
            for token in tokens {
                sql.push_str(
                    " AND (lower(title) LIKE '%'||?||'%' OR lower(content) LIKE '%'||?||'%')",
                );
                values.push(Value::Text(token.clone()));
                values.push(Value::Text(token.clone()));
            }
            push_enum_filter(&mut sql, "scope", scopes.iter().map(|s| s.as_str()));
            push_enum_filter(&mut sql, "type", types.iter().map(|t| t.as_str()));
            sql.push_str(" ORDER BY updated_at DESC LIMIT ?");
            values.push(Value::Integer(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |row| {
                Ok(KeywordHit {
                    item_id: row.get(0)?,
                    title: row.get(1)?,
                    content: row.get(2)?,
                    scope: parse_scope(row, 3)?,
                    memory_type: parse_type(row, 4)?,
                    status: parse_status(row, 5)?,
                })
            })?;
            let mut hits = Vec::new();
            for row in rows {
                hits.push(row?);
            }
            Ok(hits)
        })
    }

    /// Batch-fetch item fields for vector-hit hydration, restricted to the
    /// requested statuses and workspace.
    pub fn hydrate_items(
        &self,
        ids: &[String],
        workspace: &str,
        statuses: &[MemoryStatus],
    ) -> Result<HashMap<String, HydratedItem>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.with_conn(|conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let mut sql = format!(
                "SELECT id, title, content, scope, type, status FROM memory_items
                 WHERE id IN ({placeholders}) AND workspace = ?"
            );
            push_enum_filter(&mut sql, "status", statuses.iter().map(|s| s.as_str()));

            let mut values: Vec<Value> =
                ids.iter().map(|id| Value::Text(id.clone())).collect();
            values.push(Value::Text(workspace.to_string()));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    HydratedItem {
                        title: row.get(1)?,
                        content: row.get(2)?,
                        scope: parse_scope(row, 3)?,
                        memory_type: parse_type(row, 4)?,
                        status: parse_status(row, 5)?,
                    },
                ))
            })?;
            let mut map = HashMap::new();
            for row in rows {
                let (id, item) = row?;
                map.insert(id, item);
            }
            Ok(map)
        })
    }

    /// Active items shadowed by another active item's `supersedes_id`.
    /// Recall hides these unless superseded results were requested.
    pub fn hidden_superseded_ids(&self, workspace: &str) -> Result<HashSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id FROM memory_items i
                 JOIN memory_items t ON t.id = i.supersedes_id
                 WHERE i.status = 'active' AND t.status = 'active'
                   AND i.workspace = ?1 AND t.workspace = ?1",
            )?;
            let rows = stmt.query_map(params![workspace], |row| row.get::<_, String>(0))?;
            let mut ids = HashSet::new();
            for row in rows {
                ids.insert(row?);
            }
            Ok(ids)
        })
    }

    // --- Status ---

    pub fn status_counts(&self, workspace: &str) -> Result<StatusReport> {
        self.with_conn(|conn| {
            let total_items: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memory_items WHERE workspace = ?1 AND status != 'deleted'",
                params![workspace],
                |row| row.get(0),
            )?;
            let total_vectors: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chunk_embeddings ce
                 JOIN content_chunks c ON c.id = ce.chunk_id
                 JOIN memory_items i ON i.id = c.memory_id
                 WHERE c.deleted_at IS NULL AND i.workspace = ?1",
                params![workspace],
                |row| row.get(0),
            )?;
            let pending_embeddings: i64 = conn.query_row(
                "SELECT COUNT(*) FROM content_chunks c
                 JOIN memory_items i ON i.id = c.memory_id
                 LEFT JOIN chunk_embeddings ce ON ce.chunk_id = c.id
                 WHERE ce.chunk_id IS NULL AND c.deleted_at IS NULL AND i.workspace = ?1",
                params![workspace],
                |row| row.get(0),
            )?;
            let last_indexed_at: Option<String> = conn.query_row(
                "SELECT MAX(updated_at) FROM memory_items
                 WHERE workspace = ?1 AND status = 'active'",
                params![workspace],
                |row| row.get(0),
            )?;
            Ok(StatusReport {
                total_items,
                total_vectors,
                pending_embeddings,
                last_indexed_at,
            })
        })
    }
}

/// Append `AND <column> IN ('a','b')` for a non-empty set of enum values.
/// Values are compile-time enum strings, never user input.
fn push_enum_filter<'a>(sql: &mut String, column: &str, values: impl Iterator<Item = &'a str>) {
    let quoted: Vec<String> = values.map(|v| format!("'{v}'")).collect();
    if quoted.is_empty() {
        return;
    }
    sql.push_str(&format!(" AND {} IN ({})", column, quoted.join(", ")));
}

fn insert_item_row(conn: &Connection, item: &MemoryItem) -> Result<()> {
    let tags_json = serde_json::to_string(&item.tags)
        .map_err(|e| ZmemError::Database(format!("encode tags: {e}")))?;
    conn.execute(
        "INSERT INTO memory_items
             (id, type, title, content, summary, source, scope, workspace, tags,
              importance, status, supersedes_id, content_hash, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            item.id,
            item.memory_type.as_str(),
            item.title,
            item.content,
            item.summary,
            item.source,
            item.scope.as_str(),
            item.workspace,
            tags_json,
            item.importance,
            item.status.as_str(),
            item.supersedes_id,
            item.content_hash,
            item.created_at,
            item.updated_at,
        ],
    )?;
    Ok(())
}

fn insert_chunk_row(conn: &Connection, chunk: &ContentChunk) -> Result<()> {
    conn.execute(
        "INSERT INTO content_chunks
             (id, memory_id, seq, pos, token_count, chunk_text, created_at, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            chunk.id,
            chunk.memory_id,
            chunk.seq,
            chunk.pos,
            chunk.token_count,
            chunk.chunk_text,
            chunk.created_at,
            chunk.deleted_at,
        ],
    )?;
    Ok(())
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<MemoryItem> {
    let tags_json: String = row.get(8)?;
    Ok(MemoryItem {
        id: row.get(0)?,
        memory_type: parse_type(row, 1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        summary: row.get(4)?,
        source: row.get(5)?,
        scope: parse_scope(row, 6)?,
        workspace: row.get(7)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        importance: row.get(9)?,
        status: parse_status(row, 10)?,
        supersedes_id: row.get(11)?,
        content_hash: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn conversion_error(idx: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {what}: {value}").into(),
    )
}

fn parse_type(row: &Row<'_>, idx: usize) -> rusqlite::Result<MemoryType> {
    let value: String = row.get(idx)?;
    MemoryType::parse(&value).ok_or_else(|| conversion_error(idx, "memory type", &value))
}

fn parse_scope(row: &Row<'_>, idx: usize) -> rusqlite::Result<Scope> {
    let value: String = row.get(idx)?;
    Scope::parse(&value).ok_or_else(|| conversion_error(idx, "scope", &value))
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<MemoryStatus> {
    let value: String = row.get(idx)?;
    MemoryStatus::parse(&value).ok_or_else(|| conversion_error(idx, "status", &value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{chunk_id, new_memory_id};

    fn test_item(workspace: &str, title: &str, content: &str) -> MemoryItem {
        let now = now_iso();
        MemoryItem {
            id: new_memory_id(),
            memory_type: MemoryType::Fact,
            title: title.to_string(),
            content: content.to_string(),
            summary: None,
            source: None,
            scope: Scope::Workspace,
            workspace: workspace.to_string(),
            tags: vec!["test".to_string()],
            importance: 0.5,
            status: MemoryStatus::Pending,
            supersedes_id: None,
            content_hash: "hash".to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn test_chunks(item: &MemoryItem) -> Vec<ContentChunk> {
        vec![ContentChunk {
            id: chunk_id(&item.id, 0),
            memory_id: item.id.clone(),
            seq: 0,
            pos: 0,
            token_count: 4,
            chunk_text: item.content.clone(),
            created_at: item.created_at.clone(),
            deleted_at: None,
        }]
    }

    #[test]
    fn test_insert_pending_then_finalize() {
        let store = MetadataStore::open_in_memory().unwrap();
        let item = test_item("w", "Title", "searchable content body");
        store
            .insert_pending(&item, &test_chunks(&item), "test-model")
            .unwrap();

        // Pending row exists but is invisible to FTS
        let fetched = store.get_item("w", &item.id).unwrap().unwrap();
        assert_eq!(fetched.status, MemoryStatus::Pending);
        let hits = store
            .fts_search("\"searchable\"", "w", &[], &[], &[MemoryStatus::Active], 10)
            .unwrap();
        assert!(hits.is_empty());

        store.finalize_save(&item.id, None).unwrap();
        let fetched = store.get_item("w", &item.id).unwrap().unwrap();
        assert_eq!(fetched.status, MemoryStatus::Active);
        let hits = store
            .fts_search("\"searchable\"", "w", &[], &[], &[MemoryStatus::Active], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item_id, item.id);
        assert!(hits[0].bm25 <= 0.0);
    }

    #[test]
    fn test_finalize_archives_superseded() {
        let store = MetadataStore::open_in_memory().unwrap();
        let old = test_item("w", "Old", "original content");
        store.insert_pending(&old, &test_chunks(&old), "m").unwrap();
        store.finalize_save(&old.id, None).unwrap();

        let mut new = test_item("w", "New", "updated content");
        new.supersedes_id = Some(old.id.clone());
        store.insert_pending(&new, &test_chunks(&new), "m").unwrap();
        store.finalize_save(&new.id, Some(&old.id)).unwrap();

        assert_eq!(
            store.get_item("w", &old.id).unwrap().unwrap().status,
            MemoryStatus::Archived
        );
        assert_eq!(
            store.get_item("w", &new.id).unwrap().unwrap().status,
            MemoryStatus::Active
        );
        // The archived item's tracking rows are gone and chunks tombstoned
        let orphaned: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM chunk_embeddings ce
                     JOIN content_chunks c ON c.id = ce.chunk_id
                     WHERE c.memory_id = ?1",
                    params![old.id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(orphaned, 0);
    }

    #[test]
    fn test_workspace_scoping() {
        let store = MetadataStore::open_in_memory().unwrap();
        let item = test_item("w1", "Title", "content");
        store.insert_pending(&item, &[], "m").unwrap();
        store.finalize_save(&item.id, None).unwrap();

        assert!(store.get_item("w1", &item.id).unwrap().is_some());
        assert!(store.get_item("w2", &item.id).unwrap().is_none());
    }

    #[test]
    fn test_archived_keyword_search() {
        let store = MetadataStore::open_in_memory().unwrap();
        let item = test_item("w", "Old decision", "we chose OLDONLY postgres");
        store.insert_pending(&item, &[], "m").unwrap();
        store.finalize_save(&item.id, None).unwrap();
        store.set_status(&item.id, MemoryStatus::Archived).unwrap();

        let hits = store
            .archived_keyword_search(&["oldonly".to_string()], "w", &[], &[], 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].item_id, item.id);

        // Conjunction: a token that matches nothing filters the row out
        let hits = store
            .archived_keyword_search(
                &["oldonly".to_string(), "missing".to_string()],
                "w",
                &[],
                &[],
                10,
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_list_items_ordering_and_total() {
        let store = MetadataStore::open_in_memory().unwrap();
        for i in 0..3 {
            let mut item = test_item("w", &format!("Item {i}"), "content");
            item.created_at = format!("2026-01-0{}T00:00:00.000Z", i + 1);
            store.insert_pending(&item, &[], "m").unwrap();
            store.finalize_save(&item.id, None).unwrap();
        }
        let page = store
            .list_items(
                "w",
                &ListFilters {
                    limit: 2,
                    offset: 0,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].title, "Item 2");
    }

    #[test]
    fn test_status_counts() {
        let store = MetadataStore::open_in_memory().unwrap();
        let report = store.status_counts("w").unwrap();
        assert_eq!(report.total_items, 0);
        assert_eq!(report.total_vectors, 0);
        assert!(report.last_indexed_at.is_none());

        let item = test_item("w", "T", "c");
        store.insert_pending(&item, &test_chunks(&item), "m").unwrap();
        store.finalize_save(&item.id, None).unwrap();

        let report = store.status_counts("w").unwrap();
        assert_eq!(report.total_items, 1);
        assert_eq!(report.total_vectors, 1);
        assert_eq!(report.pending_embeddings, 0);
        assert!(report.last_indexed_at.is_some());
    }

    #[test]
    fn test_hidden_superseded_ids() {
        let store = MetadataStore::open_in_memory().unwrap();
        let old = test_item("w", "Old", "c");
        store.insert_pending(&old, &[], "m").unwrap();
        store.finalize_save(&old.id, None).unwrap();

        let mut new = test_item("w", "New", "c");
        new.supersedes_id = Some(old.id.clone());
        store.insert_pending(&new, &[], "m").unwrap();
        store.finalize_save(&new.id, None).unwrap();
        // Degenerate state: both rows active while one supersedes the other
        store.set_status(&new.id, MemoryStatus::Active).unwrap();
        store.set_status(&old.id, MemoryStatus::Active).unwrap();

        let hidden = store.hidden_superseded_ids("w").unwrap();
        assert!(hidden.contains(&old.id));
        assert!(!hidden.contains(&new.id));
    }

    #[test]
    fn test_purge_stale_pending() {
        let store = MetadataStore::open_in_memory().unwrap();
        let mut item = test_item("w", "T", "c");
        item.source = Some("notes/a.md".to_string());
        store.insert_pending(&item, &test_chunks(&item), "m").unwrap();

        let purged = store.purge_stale_pending("w", "notes/a.md").unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_item("w", &item.id).unwrap().is_none());
    }

    #[test]
    fn test_cleanup_missing_sources() {
        let store = MetadataStore::open_in_memory().unwrap();
        let mut kept = test_item("w", "Kept", "c");
        kept.source = Some("a.md".to_string());
        store.insert_pending(&kept, &[], "m").unwrap();
        store.finalize_save(&kept.id, None).unwrap();

        let mut gone = test_item("w", "Gone", "c");
        gone.source = Some("b.md".to_string());
        store.insert_pending(&gone, &[], "m").unwrap();
        store.finalize_save(&gone.id, None).unwrap();

        let seen: HashSet<String> = ["a.md".to_string()].into_iter().collect();
        let removed = store.cleanup_missing_sources("w", &seen).unwrap();
        assert_eq!(removed, vec![gone.id.clone()]);
        assert_eq!(
            store.get_item("w", &gone.id).unwrap().unwrap().status,
            MemoryStatus::Deleted
        );
        assert_eq!(
            store.get_item("w", &kept.id).unwrap().unwrap().status,
            MemoryStatus::Active
        );
    }
}
