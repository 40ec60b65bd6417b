//! Token-aware document chunker with heading-preferred boundaries.
//!
//! Break points are scored by structural priority and proximity to the
//! size target; fenced code blocks are never split. Two guards — at least
//! half the window must be new content, and every iteration advances by at
//! least one byte — keep the loop finite on pathological input.

use std::sync::LazyLock;

use tiktoken_rs::CoreBPE;

pub const DEFAULT_MAX_TOKENS: usize = 900;
/// 15% of the window.
pub const DEFAULT_OVERLAP_TOKENS: usize = 135;

/// Rough chars-per-token estimate used to size the scan window.
const CHARS_PER_TOKEN: usize = 4;

static BPE: LazyLock<CoreBPE> = LazyLock::new(|| {
    tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary is embedded in the binary")
});

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
        }
    }
}

/// One emitted chunk: a trimmed slice of the content plus its origin
/// offset and token count.
#[derive(Debug, Clone)]
pub struct ChunkSpan {
    pub seq: i64,
    pub pos: i64,
    pub token_count: i64,
    pub text: String,
}

/// Deterministic token count for sizing and bookkeeping.
pub fn count_tokens(text: &str) -> usize {
    BPE.encode_with_special_tokens(text).len()
}

/// Split `content` into overlapping chunks at structure-preferred
/// boundaries. Empty content yields no chunks.
pub fn chunk_document(content: &str, config: &ChunkerConfig) -> Vec<ChunkSpan> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let len = content.len();
    let max_chars = (config.max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = config.overlap_tokens * CHARS_PER_TOKEN;
    let candidates = break_candidates(content);

    let mut chunks = Vec::new();
    let mut seq = 0i64;
    let mut pos = 0usize;

    loop {
        let target_end = floor_char_boundary(content, (pos + max_chars).min(len));
        let chunk_end = if target_end >= len {
            len
        } else {
            best_break(&candidates, pos, target_end, max_chars).unwrap_or(target_end)
        };

        if chunk_end <= pos {
            // Pathological input: emit the trailing remainder and stop
            push_chunk(&mut chunks, &mut seq, content, pos, len);
            break;
        }

        push_chunk(&mut chunks, &mut seq, content, pos, chunk_end);
        if chunk_end >= len {
            break;
        }

        // Overlap, bounded so at least half of the next window is new
        let half_forward = pos + (chunk_end - pos) / 2;
        let next = chunk_end
            .saturating_sub(overlap_chars)
            .max(half_forward)
            .max(pos + 1);
        let next = ceil_char_boundary(content, next);
        if next >= len {
            break;
        }
        pos = next;
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<ChunkSpan>, seq: &mut i64, content: &str, start: usize, end: usize) {
    let text = content[start..end].trim();
    if text.is_empty() {
        return;
    }
    chunks.push(ChunkSpan {
        seq: *seq,
        pos: start as i64,
        token_count: count_tokens(text) as i64,
        text: text.to_string(),
    });
    *seq += 1;
}

/// Pick the candidate in `(pos, target_end]` maximising
/// `priority * (1 - (distance/max_chars)^2)`.
fn best_break(
    candidates: &[(usize, u32)],
    pos: usize,
    target_end: usize,
    max_chars: usize,
) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for &(bp, priority) in candidates {
        if bp <= pos {
            continue;
        }
        if bp > target_end {
            break;
        }
        let distance = (target_end - bp) as f64 / max_chars as f64;
        let score = priority as f64 * (1.0 - distance * distance);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((bp, score));
        }
    }
    best.map(|(bp, _)| bp)
}

/// Enumerate candidate break points (line starts, byte offsets) with
/// their structural priority. Points inside fenced code blocks are
/// forbidden; the fence lines themselves are boundaries.
fn break_candidates(content: &str) -> Vec<(usize, u32)> {
    let mut candidates = Vec::new();
    let mut in_fence = false;
    let mut offset = 0usize;

    for line in content.split_inclusive('\n') {
        let start = offset;
        offset += line.len();

        let trimmed = line.trim_end_matches('\n');
        let is_fence_line = trimmed.trim_start().starts_with("```");

        if is_fence_line {
            in_fence = !in_fence;
            if start > 0 {
                candidates.push((start, 80));
            }
            continue;
        }
        if in_fence || start == 0 {
            continue;
        }

        let priority = if trimmed.starts_with("# ") {
            100
        } else if trimmed.starts_with("## ") {
            90
        } else if trimmed.starts_with("### ") {
            80
        } else if is_horizontal_rule(trimmed) {
            60
        } else if trimmed.trim().is_empty() {
            20
        } else if is_list_item(trimmed) {
            5
        } else {
            1
        };
        candidates.push((start, priority));
    }

    candidates
}

fn is_horizontal_rule(line: &str) -> bool {
    let t = line.trim();
    t.len() >= 3
        && (t.chars().all(|c| c == '-')
            || t.chars().all(|c| c == '*')
            || t.chars().all(|c| c == '_'))
}

fn is_list_item(line: &str) -> bool {
    let t = line.trim_start();
    if t.starts_with("- ") || t.starts_with("* ") || t.starts_with("+ ") {
        return true;
    }
    let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && (t[digits..].starts_with(". ") || t[digits..].starts_with(") "))
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx.min(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ChunkerConfig {
        ChunkerConfig {
            max_tokens: 50,
            overlap_tokens: 8,
        }
    }

    #[test]
    fn test_empty_content() {
        assert!(chunk_document("", &ChunkerConfig::default()).is_empty());
        assert!(chunk_document("   \n\n  ", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn test_short_content_single_chunk() {
        let chunks = chunk_document("A single short paragraph.", &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[0].pos, 0);
        assert_eq!(chunks[0].text, "A single short paragraph.");
        assert!(chunks[0].token_count > 0);
    }

    #[test]
    fn test_prefers_heading_boundaries() {
        let mut doc = String::new();
        doc.push_str("# First\n");
        doc.push_str(&"alpha bravo charlie delta echo foxtrot golf hotel.\n".repeat(4));
        doc.push_str("## Second\n");
        doc.push_str(&"india juliett kilo lima mike november oscar papa.\n".repeat(4));

        let chunks = chunk_document(&doc, &small_config());
        assert!(chunks.len() >= 2);
        // Some later chunk starts exactly at the H2 heading
        assert!(
            chunks
                .iter()
                .any(|c| c.text.starts_with("## Second")),
            "expected a chunk to begin at the section heading: {:?}",
            chunks.iter().map(|c| &c.text[..c.text.len().min(20)]).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_no_break_candidates_inside_code_fences() {
        let mut doc = String::new();
        doc.push_str("Intro paragraph.\n\n");
        doc.push_str("```\n");
        for i in 0..40 {
            doc.push_str(&format!("let value_{i} = compute({i});\n\n"));
        }
        doc.push_str("```\n\n");
        doc.push_str("Outro paragraph.\n");

        let fence_open = doc.find("```").unwrap();
        let fence_close = doc.rfind("```").unwrap();
        for (bp, _) in break_candidates(&doc) {
            assert!(
                bp <= fence_open || bp == fence_close || bp > fence_close,
                "break candidate inside code fence at byte {bp}"
            );
        }
    }

    #[test]
    fn test_fence_kept_whole_when_it_fits() {
        let mut doc = String::new();
        doc.push_str(&"intro words before the block continue for a while.\n".repeat(3));
        doc.push_str("\n```\nfn demo() {}\nlet x = 1;\n```\n\n");
        doc.push_str(&"outro words after the block continue for a while.\n".repeat(3));

        let fence_open = doc.find("```").unwrap();
        let fence_close = doc.rfind("```").unwrap();
        let chunks = chunk_document(&doc, &small_config());
        for chunk in &chunks {
            let start = chunk.pos as usize;
            assert!(
                start <= fence_open || start == fence_close || start > fence_close,
                "chunk starts inside a fence that fits the window (byte {start})"
            );
        }
    }

    #[test]
    fn test_progress_on_unbroken_text() {
        // One long line, no newlines at all
        let doc = "word ".repeat(2000);
        let chunks = chunk_document(&doc, &small_config());
        assert!(chunks.len() > 1);
        // Positions strictly increase
        for pair in chunks.windows(2) {
            assert!(pair[1].pos > pair[0].pos);
        }
    }

    #[test]
    fn test_chunks_cover_content() {
        let doc: String = (0..200)
            .map(|i| format!("unique_token_{i} sentence body here.\n"))
            .collect();
        let config = small_config();
        let chunks = chunk_document(&doc, &config);
        assert!(chunks.len() > 1);

        // Coverage: consecutive chunks leave no gap
        for pair in chunks.windows(2) {
            let prev_end = pair[0].pos as usize + pair[0].text.len();
            assert!(
                (pair[1].pos as usize) <= prev_end + 2,
                "gap between chunks at byte {}",
                pair[1].pos
            );
        }
        // Last chunk reaches the end of the document (modulo trim)
        let last = chunks.last().unwrap();
        assert!(last.pos as usize + last.text.len() >= doc.trim_end().len());
    }

    #[test]
    fn test_token_budget_roughly_respected() {
        let doc = "lorem ipsum dolor sit amet consectetur adipiscing elit ".repeat(300);
        let config = ChunkerConfig {
            max_tokens: 100,
            overlap_tokens: 15,
        };
        for chunk in chunk_document(&doc, &config) {
            // 4-chars-per-token sizing is an estimate; allow tokenizer slack
            assert!(
                chunk.token_count <= (config.max_tokens * 2) as i64,
                "chunk of {} tokens far exceeds the budget",
                chunk.token_count
            );
        }
    }

    #[test]
    fn test_overlap_between_chunks() {
        let doc = "word ".repeat(1000);
        let chunks = chunk_document(&doc, &small_config());
        assert!(chunks.len() > 1);
        let first_end = chunks[0].pos as usize + chunks[0].text.len();
        assert!(
            (chunks[1].pos as usize) < first_end,
            "second chunk should re-cover the tail of the first"
        );
    }

    #[test]
    fn test_multibyte_safety() {
        let doc = "начало документа ".repeat(400) + "конец";
        let chunks = chunk_document(&doc, &small_config());
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(doc.is_char_boundary(chunk.pos as usize));
        }
    }

    #[test]
    fn test_dense_sequence_numbers() {
        let doc = "paragraph text here\n\n".repeat(200);
        let chunks = chunk_document(&doc, &small_config());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as i64);
        }
    }
}
