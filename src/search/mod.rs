pub mod lexical;
pub mod ranking;
pub mod vector;

use serde::Serialize;

use crate::types::{MemoryStatus, MemoryType, Scope};

/// Result-source tags.
pub const SOURCE_LEXICAL: &str = "lex";
pub const SOURCE_VECTOR: &str = "vec";
pub const SOURCE_HYBRID: &str = "hybrid";

/// A retrieval result keyed by memory id.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub snippet: String,
    pub score: f64,
    pub source: String,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
}

/// First `max_chars` characters, with an ellipsis when truncated.
/// Char-boundary safe.
pub(crate) fn leading_snippet(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let mut end = text.len();
    for (count, (idx, _)) in text.char_indices().enumerate() {
        if count == max_chars {
            end = idx;
            break;
        }
    }
    if end == text.len() {
        text.to_string()
    } else {
        format!("{}…", &text[..end])
    }
}

/// A 200-character window around the first query word (longer than two
/// characters) found in `content`, with ellipses; otherwise the leading
/// 200 characters.
pub(crate) fn window_snippet(content: &str, query: &str) -> String {
    let lowered = content.to_lowercase();
    for word in query.split_whitespace() {
        let word = word.to_lowercase();
        if word.chars().count() <= 2 {
            continue;
        }
        if let Some(idx) = lowered.find(&word) {
            // Offsets into the lowercased text can drift from the original
            // for multi-byte case pairs; clamp to valid boundaries
            let idx = idx.min(content.len());
            let start = floor_boundary(content, idx.saturating_sub(50));
            let end = ceil_boundary(content, (idx + 150).min(content.len()));
            let mut snippet = String::new();
            if start > 0 {
                snippet.push('…');
            }
            snippet.push_str(content[start..end].trim());
            if end < content.len() {
                snippet.push('…');
            }
            return snippet;
        }
    }
    leading_snippet(content, 200)
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx.min(s.len())
}
