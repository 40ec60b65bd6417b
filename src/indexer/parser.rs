//! Document parsing: frontmatter, title extraction, content hashing.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::types::MemoryType;

/// A parsed source document, ready for chunking and upsert.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub title: String,
    pub memory_type: MemoryType,
    pub tags: Vec<String>,
    pub importance: Option<f64>,
    pub date: Option<String>,
    /// Body after frontmatter, BOM-stripped, line endings normalised.
    pub content: String,
    /// SHA-256 over the raw source bytes; the re-ingestion idempotency key.
    pub content_hash: String,
}

/// Recognised frontmatter keys. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    title: Option<String>,
    tags: Option<Vec<String>>,
    #[serde(rename = "type")]
    doc_type: Option<String>,
    date: Option<String>,
    importance: Option<f64>,
}

/// Parse raw file bytes. `file_stem` is the title fallback of last resort.
pub fn parse_document(raw: &[u8], file_stem: &str) -> ParsedDocument {
    let content_hash = hex::encode(Sha256::digest(raw));

    let decoded = String::from_utf8_lossy(raw);
    let text = decoded.strip_prefix('\u{feff}').unwrap_or(&decoded);
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");

    let (frontmatter, body) = split_frontmatter(&normalized);

    let title = frontmatter
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| title_from_markdown(body))
        .unwrap_or_else(|| file_stem.to_string());

    let memory_type = frontmatter
        .doc_type
        .as_deref()
        .and_then(MemoryType::parse)
        .unwrap_or(MemoryType::Fact);

    ParsedDocument {
        title,
        memory_type,
        tags: frontmatter.tags.unwrap_or_default(),
        importance: frontmatter.importance.map(|i| i.clamp(0.0, 1.0)),
        date: frontmatter.date,
        content: body.to_string(),
        content_hash,
    }
}

/// Split an optional leading `---` frontmatter block from the body.
/// A block that fails to parse as YAML is treated as body text.
fn split_frontmatter(text: &str) -> (Frontmatter, &str) {
    let Some(rest) = text.strip_prefix("---\n") else {
        return (Frontmatter::default(), text);
    };

    let Some(end) = rest.find("\n---") else {
        return (Frontmatter::default(), text);
    };
    let after = &rest[end + 4..];
    // The closing fence must sit on its own line
    if !(after.is_empty() || after.starts_with('\n')) {
        return (Frontmatter::default(), text);
    }

    let yaml = &rest[..end];
    match serde_yaml::from_str::<Frontmatter>(yaml) {
        Ok(frontmatter) => {
            let body = after.strip_prefix('\n').unwrap_or(after);
            (frontmatter, body)
        }
        Err(e) => {
            tracing::debug!("Frontmatter did not parse ({e}) — treating as body");
            (Frontmatter::default(), text)
        }
    }
}

/// Title fallback: first H1 (skipping a generic "Notes"), then first H2.
fn title_from_markdown(body: &str) -> Option<String> {
    let mut first_h2: Option<String> = None;
    for line in body.lines() {
        if let Some(h1) = line.strip_prefix("# ") {
            let h1 = h1.trim();
            if !h1.is_empty() && !h1.eq_ignore_ascii_case("notes") {
                return Some(h1.to_string());
            }
        } else if first_h2.is_none() {
            if let Some(h2) = line.strip_prefix("## ") {
                let h2 = h2.trim();
                if !h2.is_empty() {
                    first_h2 = Some(h2.to_string());
                }
            }
        }
    }
    first_h2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontmatter_fields() {
        let raw = b"---\ntitle: OAuth rollout\ntags:\n  - auth\n  - infra\ntype: decision\nimportance: 0.9\ndate: 2026-03-01\n---\n\nWe will use PKCE everywhere.\n";
        let doc = parse_document(raw, "oauth");
        assert_eq!(doc.title, "OAuth rollout");
        assert_eq!(doc.memory_type, MemoryType::Decision);
        assert_eq!(doc.tags, vec!["auth", "infra"]);
        assert_eq!(doc.importance, Some(0.9));
        assert_eq!(doc.date.as_deref(), Some("2026-03-01"));
        assert_eq!(doc.content.trim(), "We will use PKCE everywhere.");
    }

    #[test]
    fn test_unknown_type_defaults_to_fact() {
        let raw = b"---\ntype: opinion\n---\nBody.\n";
        let doc = parse_document(raw, "stem");
        assert_eq!(doc.memory_type, MemoryType::Fact);
    }

    #[test]
    fn test_title_priority_h1_skips_notes() {
        let raw = b"# Notes\n\n# Real Title\n\nBody.\n";
        let doc = parse_document(raw, "stem");
        assert_eq!(doc.title, "Real Title");
    }

    #[test]
    fn test_title_falls_back_to_h2_then_stem() {
        let doc = parse_document(b"## Section heading\nBody.\n", "stem");
        assert_eq!(doc.title, "Section heading");

        let doc = parse_document(b"just prose, no headings\n", "meeting-notes");
        assert_eq!(doc.title, "meeting-notes");
    }

    #[test]
    fn test_bom_and_crlf_normalisation() {
        let raw = "\u{feff}# Title\r\nline one\r\nline two\r".as_bytes();
        let doc = parse_document(raw, "stem");
        assert_eq!(doc.title, "Title");
        assert!(!doc.content.contains('\r'));
    }

    #[test]
    fn test_hash_covers_raw_bytes() {
        let a = parse_document(b"# Same body\n", "s");
        let b = parse_document(b"# Same body\n", "s");
        let c = parse_document(b"# Same body\n\n", "s");
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn test_malformed_frontmatter_is_body() {
        let raw = b"---\n: not yaml [\n---\nBody.\n";
        let doc = parse_document(raw, "stem");
        assert!(doc.content.starts_with("---\n"));
    }

    #[test]
    fn test_unclosed_frontmatter_is_body() {
        let raw = b"---\ntitle: dangling\nno closing fence\n";
        let doc = parse_document(raw, "stem");
        assert_eq!(doc.title, "stem");
        assert!(doc.content.contains("dangling"));
    }
}
