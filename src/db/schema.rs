//! Metadata-store schema and migrations.
//!
//! Migrations are forward-only and idempotent: each version runs once,
//! inside its own transaction, tracked by `schema_migrations`.

use rusqlite::Connection;

use crate::error::Result;

/// Connection-level pragmas, applied on every open (not versioned).
const PRAGMAS: &str = "
    -- WAL for concurrent reads; NORMAL sync is safe with WAL
    PRAGMA journal_mode=WAL;
    PRAGMA foreign_keys=ON;
    PRAGMA synchronous=NORMAL;
    -- 16MB page cache
    PRAGMA cache_size=-16000;
    PRAGMA temp_store=MEMORY;
    PRAGMA busy_timeout=5000;
";

const SCHEMA_V1: &str = "
    -- Memory items: one row per durable unit of memory
    CREATE TABLE memory_items (
        id TEXT PRIMARY KEY,
        type TEXT NOT NULL,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        summary TEXT,
        source TEXT,
        scope TEXT NOT NULL DEFAULT 'workspace',
        workspace TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        importance REAL NOT NULL DEFAULT 0.5,
        status TEXT NOT NULL DEFAULT 'pending',
        supersedes_id TEXT REFERENCES memory_items(id) ON DELETE SET NULL,
        content_hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- Chunks: item content split into embeddable pieces
    CREATE TABLE content_chunks (
        id TEXT PRIMARY KEY,
        memory_id TEXT NOT NULL REFERENCES memory_items(id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        pos INTEGER NOT NULL,
        token_count INTEGER NOT NULL,
        chunk_text TEXT NOT NULL,
        created_at TEXT NOT NULL,
        deleted_at TEXT,
        UNIQUE(memory_id, seq)
    );

    -- Tracking rows: presence means a vector with the same id exists
    -- in the workspace's vector collection
    CREATE TABLE chunk_embeddings (
        chunk_id TEXT PRIMARY KEY REFERENCES content_chunks(id) ON DELETE CASCADE,
        embedded_at TEXT NOT NULL,
        model TEXT NOT NULL
    );

    -- FTS5 index over active items only
    CREATE VIRTUAL TABLE memory_fts USING fts5(
        item_id UNINDEXED,
        title,
        content,
        tags,
        tokenize='porter unicode61'
    );

    -- Triggers keep memory_fts in sync with memory_items: any change
    -- removes the stale row, and a row is reinserted only while active
    CREATE TRIGGER memory_items_ai AFTER INSERT ON memory_items BEGIN
        DELETE FROM memory_fts WHERE item_id = new.id;
        INSERT INTO memory_fts(item_id, title, content, tags)
            SELECT new.id, new.title, new.content, new.tags
            WHERE new.status = 'active';
    END;

    CREATE TRIGGER memory_items_au AFTER UPDATE ON memory_items BEGIN
        DELETE FROM memory_fts WHERE item_id = old.id;
        INSERT INTO memory_fts(item_id, title, content, tags)
            SELECT new.id, new.title, new.content, new.tags
            WHERE new.status = 'active';
    END;

    CREATE TRIGGER memory_items_ad AFTER DELETE ON memory_items BEGIN
        DELETE FROM memory_fts WHERE item_id = old.id;
    END;

    -- Secondary indexes
    CREATE INDEX idx_items_workspace ON memory_items(workspace);
    CREATE INDEX idx_items_scope ON memory_items(scope);
    CREATE INDEX idx_items_type ON memory_items(type);
    CREATE INDEX idx_items_status ON memory_items(status);
    CREATE INDEX idx_items_content_hash ON memory_items(content_hash);
    CREATE INDEX idx_items_supersedes ON memory_items(supersedes_id);
    CREATE INDEX idx_items_source_ws_status ON memory_items(source, workspace, status);
    CREATE INDEX idx_items_ws_status ON memory_items(workspace, status);

    -- Live chunks only; tombstoned chunks are invisible to search and re-embed
    CREATE INDEX idx_chunks_memory_live ON content_chunks(memory_id)
        WHERE deleted_at IS NULL;
";

const MIGRATIONS: &[(i64, &str)] = &[(1, SCHEMA_V1)];

/// Apply pragmas and run any pending migrations.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(PRAGMAS)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for (version, sql) in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )?;
        tx.commit()?;
        tracing::info!("Applied schema migration v{}", version);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(versions, MIGRATIONS.len() as i64);

        for table in ["memory_items", "content_chunks", "chunk_embeddings"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_fts_triggers_track_status() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        conn.execute(
            "INSERT INTO memory_items (id, type, title, content, workspace, status, content_hash, created_at, updated_at)
             VALUES ('m1', 'fact', 'Title', 'Body text', 'w', 'pending', 'h', '2026-01-01', '2026-01-01')",
            [],
        )
        .unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_fts WHERE item_id = 'm1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0, "pending items must not be indexed");

        conn.execute("UPDATE memory_items SET status = 'active' WHERE id = 'm1'", [])
            .unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_fts WHERE item_id = 'm1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        conn.execute("UPDATE memory_items SET status = 'archived' WHERE id = 'm1'", [])
            .unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_fts WHERE item_id = 'm1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0, "archived items must leave the index");

        conn.execute("DELETE FROM memory_items WHERE id = 'm1'", []).unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_chunk_cascade() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        conn.execute(
            "INSERT INTO memory_items (id, type, title, content, workspace, status, content_hash, created_at, updated_at)
             VALUES ('m1', 'fact', 'T', 'C', 'w', 'active', 'h', '2026-01-01', '2026-01-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO content_chunks (id, memory_id, seq, pos, token_count, chunk_text, created_at)
             VALUES ('m1_0', 'm1', 0, 0, 2, 'C', '2026-01-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chunk_embeddings (chunk_id, embedded_at, model) VALUES ('m1_0', '2026-01-01', 'test')",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM memory_items WHERE id = 'm1'", []).unwrap();
        let chunks: i64 = conn
            .query_row("SELECT COUNT(*) FROM content_chunks", [], |r| r.get(0))
            .unwrap();
        let embeddings: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunk_embeddings", [], |r| r.get(0))
            .unwrap();
        assert_eq!((chunks, embeddings), (0, 0));
    }
}
