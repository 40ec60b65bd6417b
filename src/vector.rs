//! Per-workspace vector collections backed by sqlite-vec.
//!
//! Each workspace owns one collection under `<zvecPath>/<workspace>/`,
//! a standalone SQLite file holding a single `vec0` virtual table with
//! cosine distance and sidecar metadata columns used for filtering.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};

use rusqlite::{params, Connection};

use crate::error::{Result, ZmemError};

/// Metadata fields exposed for server-side filtering.
const FILTER_FIELDS: &[&str] = &["memory_id", "workspace", "scope", "type", "status"];

const COLLECTION_FILE: &str = "collection.db";

static REGISTER_VEC: Once = Once::new();

/// Register sqlite-vec as an auto-extension (idempotent; must happen
/// before any connection is opened).
fn register_vec_extension() {
    REGISTER_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut std::ffi::c_char,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> std::ffi::c_int,
        >(sqlite_vec::sqlite3_vec_init as *const ())));
    });
}

/// Sidecar metadata stored with each vector.
#[derive(Debug, Clone)]
pub struct VectorMetadata {
    pub memory_id: String,
    pub workspace: String,
    pub scope: String,
    pub memory_type: String,
    pub status: String,
}

/// One ANN hit: chunk id and similarity score (higher is better).
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f64,
}

/// A single on-disk ANN collection.
pub struct VectorCollection {
    conn: Mutex<Connection>,
    dimensions: usize,
}

impl VectorCollection {
    /// Open or create the collection in `dir`. An existing collection that
    /// fails to open is removed and recreated empty.
    pub fn open(dir: &Path, dimensions: usize) -> Result<Self> {
        register_vec_extension();
        std::fs::create_dir_all(dir)?;

        match Self::open_file(&dir.join(COLLECTION_FILE), dimensions) {
            Ok(conn) => Ok(Self {
                conn: Mutex::new(conn),
                dimensions,
            }),
            Err(e) => {
                tracing::warn!(
                    "Vector collection at {} unreadable ({}) — recreating",
                    dir.display(),
                    e
                );
                std::fs::remove_dir_all(dir)?;
                std::fs::create_dir_all(dir)?;
                let conn = Self::open_file(&dir.join(COLLECTION_FILE), dimensions)?;
                Ok(Self {
                    conn: Mutex::new(conn),
                    dimensions,
                })
            }
        }
    }

    fn open_file(path: &Path, dimensions: usize) -> Result<Connection> {
        let conn = Connection::open(path)
            .map_err(|e| ZmemError::Database(format!("open {}: {}", path.display(), e)))?;
        // Fails when the extension did not load or the file is corrupt
        conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
            .map_err(|e| ZmemError::Database(format!("sqlite-vec unavailable: {e}")))?;
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS chunk_vectors USING vec0(
                chunk_id TEXT PRIMARY KEY,
                memory_id TEXT,
                workspace TEXT,
                scope TEXT,
                type TEXT,
                status TEXT,
                embedding FLOAT[{dimensions}] distance_metric=cosine
            );"
        ))?;
        Ok(conn)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ZmemError::Database(format!("collection lock poisoned: {e}")))
    }

    /// Upsert a vector with its metadata.
    pub fn insert(&self, id: &str, vector: &[f32], metadata: &VectorMetadata) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(ZmemError::Database(format!(
                "vector dimension mismatch: got {}, collection is {}",
                vector.len(),
                self.dimensions
            )));
        }
        let blob: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO chunk_vectors
                 (chunk_id, memory_id, workspace, scope, type, status, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                metadata.memory_id,
                metadata.workspace,
                metadata.scope,
                metadata.memory_type,
                metadata.status,
                blob,
            ],
        )?;
        Ok(())
    }

    /// KNN query returning up to `top_k` hits by descending similarity.
    /// `filter` is an expression over metadata fields, e.g.
    /// `workspace = "w" and (status = "active" or status = "archived")`.
    pub fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<VectorHit>> {
        if vector.len() != self.dimensions {
            return Err(ZmemError::Database(format!(
                "query dimension mismatch: got {}, collection is {}",
                vector.len(),
                self.dimensions
            )));
        }
        let blob: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();

        let mut sql = String::from(
            "SELECT chunk_id, distance FROM chunk_vectors
             WHERE embedding MATCH ?1 AND k = ?2",
        );
        if let Some(expr) = filter {
            let compiled = compile_filter(expr)?;
            sql.push_str(" AND ");
            sql.push_str(&compiled);
        }
        sql.push_str(" ORDER BY distance");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![blob, top_k as i64], |row| {
            Ok(VectorHit {
                chunk_id: row.get(0)?,
                // Cosine distance in [0, 2]; remap so larger is better
                score: 1.0 - row.get::<_, f64>(1)?,
            })
        })?;
        let mut hits = Vec::new();
        for row in rows {
            hits.push(row?);
        }
        Ok(hits)
    }

    /// Remove a single vector. A missing id is not an error.
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM chunk_vectors WHERE chunk_id = ?1", params![id])?;
        Ok(())
    }

    pub fn delete_many(&self, ids: &[String]) -> Result<()> {
        let conn = self.lock()?;
        for id in ids {
            conn.execute("DELETE FROM chunk_vectors WHERE chunk_id = ?1", params![id])?;
        }
        Ok(())
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.lock()?;
        let n = conn.query_row("SELECT COUNT(*) FROM chunk_vectors", [], |row| row.get(0))?;
        Ok(n)
    }
}

/// Registry of open collections, one per workspace, rooted at `zvecPath`.
pub struct VectorCollections {
    base: PathBuf,
    dimensions: usize,
    open: Mutex<HashMap<String, Arc<VectorCollection>>>,
}

impl VectorCollections {
    pub fn new(base: PathBuf, dimensions: usize) -> Self {
        Self {
            base,
            dimensions,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Open-or-get the collection for a workspace.
    pub fn collection(&self, workspace: &str) -> Result<Arc<VectorCollection>> {
        let mut open = self
            .open
            .lock()
            .map_err(|e| ZmemError::Database(format!("collections lock poisoned: {e}")))?;
        if let Some(existing) = open.get(workspace) {
            return Ok(existing.clone());
        }
        let collection = Arc::new(VectorCollection::open(
            &self.base.join(workspace),
            self.dimensions,
        )?);
        open.insert(workspace.to_string(), collection.clone());
        Ok(collection)
    }

    /// Release all file handles. Called exactly once on shutdown.
    pub fn close_all(&self) {
        if let Ok(mut open) = self.open.lock() {
            open.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata filter expressions
// ---------------------------------------------------------------------------

/// Builds filter expressions in the collection's filter language.
#[derive(Debug, Default)]
pub struct FilterBuilder {
    clauses: Vec<String>,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `field = "value"`.
    pub fn eq(mut self, field: &str, value: &str) -> Self {
        self.clauses
            .push(format!("{} = \"{}\"", field, escape_literal(value)));
        self
    }

    /// `(field = "a" or field = "b" …)`; an empty set adds no clause.
    pub fn any<S: AsRef<str>>(mut self, field: &str, values: &[S]) -> Self {
        if values.is_empty() {
            return self;
        }
        let parts: Vec<String> = values
            .iter()
            .map(|v| format!("{} = \"{}\"", field, escape_literal(v.as_ref())))
            .collect();
        if parts.len() == 1 {
            self.clauses.push(parts.into_iter().next().unwrap());
        } else {
            self.clauses.push(format!("({})", parts.join(" or ")));
        }
        self
    }

    /// The combined expression, or `None` when no clause was added.
    pub fn build(self) -> Option<String> {
        if self.clauses.is_empty() {
            None
        } else {
            Some(self.clauses.join(" and "))
        }
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    LParen,
    RParen,
    And,
    Or,
}

fn lex_filter(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => {
                                return Err(filter_error(expr, "unterminated escape"));
                            }
                        },
                        Some('"') => break,
                        Some(other) => value.push(other),
                        None => return Err(filter_error(expr, "unterminated string")),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => {
                return Err(filter_error(expr, &format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

fn filter_error(expr: &str, reason: &str) -> ZmemError {
    ZmemError::Database(format!("invalid vector filter '{expr}': {reason}"))
}

/// Compile a filter expression to a SQL constraint over the collection's
/// metadata columns. Field names are validated against the exposed set;
/// string literals become escaped SQL literals.
pub fn compile_filter(expr: &str) -> Result<String> {
    let tokens = lex_filter(expr)?;
    let mut pos = 0;
    let sql = parse_or(expr, &tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(filter_error(expr, "trailing tokens"));
    }
    Ok(sql)
}

fn parse_or(expr: &str, tokens: &[Token], pos: &mut usize) -> Result<String> {
    let mut parts = vec![parse_and(expr, tokens, pos)?];
    while matches!(tokens.get(*pos), Some(Token::Or)) {
        *pos += 1;
        parts.push(parse_and(expr, tokens, pos)?);
    }
    if parts.len() == 1 {
        Ok(parts.pop().unwrap())
    } else {
        Ok(format!("({})", parts.join(" OR ")))
    }
}

fn parse_and(expr: &str, tokens: &[Token], pos: &mut usize) -> Result<String> {
    let mut parts = vec![parse_primary(expr, tokens, pos)?];
    while matches!(tokens.get(*pos), Some(Token::And)) {
        *pos += 1;
        parts.push(parse_primary(expr, tokens, pos)?);
    }
    if parts.len() == 1 {
        Ok(parts.pop().unwrap())
    } else {
        Ok(format!("({})", parts.join(" AND ")))
    }
}

fn parse_primary(expr: &str, tokens: &[Token], pos: &mut usize) -> Result<String> {
    match tokens.get(*pos) {
        Some(Token::LParen) => {
            *pos += 1;
            let inner = parse_or(expr, tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(inner)
                }
                _ => Err(filter_error(expr, "expected ')'")),
            }
        }
        Some(Token::Ident(field)) => {
            if !FILTER_FIELDS.contains(&field.as_str()) {
                return Err(filter_error(expr, &format!("unknown field '{field}'")));
            }
            *pos += 1;
            match tokens.get(*pos) {
                Some(Token::Eq) => {
                    *pos += 1;
                }
                _ => return Err(filter_error(expr, "expected '='")),
            }
            match tokens.get(*pos) {
                Some(Token::Str(value)) => {
                    *pos += 1;
                    Ok(format!("\"{}\" = '{}'", field, value.replace('\'', "''")))
                }
                _ => Err(filter_error(expr, "expected string literal")),
            }
        }
        _ => Err(filter_error(expr, "expected field or '('")),
    }
}
