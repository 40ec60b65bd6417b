//! Engine configuration.
//!
//! Loaded from a JSON document; a missing file yields defaults, a malformed
//! file logs a warning and yields defaults. Environment overrides are
//! applied after loading.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{RetrievalMode, Scope};

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ZmemConfig {
    pub defaults: Defaults,
    pub ai: AiConfig,
    pub workspaces: Vec<WorkspaceConfig>,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub retrieval_mode: RetrievalMode,
    pub scopes_default: Vec<Scope>,
    pub retrieval: RetrievalDefaults,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            retrieval_mode: RetrievalMode::Hybrid,
            scopes_default: vec![Scope::Workspace, Scope::Global],
            retrieval: RetrievalDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalDefaults {
    pub top_k_lex: usize,
    pub top_k_vec: usize,
    pub rerank_top_k: usize,
    pub min_score: f64,
    pub include_superseded: bool,
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self {
            top_k_lex: 30,
            top_k_vec: 30,
            rerank_top_k: 20,
            min_score: 0.25,
            include_superseded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AiConfig {
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
}

/// Which embedding backend to reach over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Llamacpp,
    Openai,
    Ollama,
}

impl EmbeddingProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "llamacpp" => Some(EmbeddingProviderKind::Llamacpp),
            "openai" => Some(EmbeddingProviderKind::Openai),
            "ollama" => Some(EmbeddingProviderKind::Ollama),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingProviderKind::Llamacpp => "llamacpp",
            EmbeddingProviderKind::Openai => "openai",
            EmbeddingProviderKind::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimensions: usize,
    pub quantization: Option<String>,
    pub batch_size: usize,
    pub max_tokens: usize,
    /// Per-request deadline for embed calls; providers fall back to
    /// their own default when unset.
    pub request_timeout_secs: Option<u64>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Llamacpp,
            model: "bge-m3".to_string(),
            dimensions: 1024,
            quantization: None,
            batch_size: 8,
            max_tokens: 8192,
            request_timeout_secs: None,
            base_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RerankConfig {
    pub enabled: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub top_k: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            model: None,
            top_k: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceConfig {
    pub name: String,
    pub root: PathBuf,
    pub include_by_default: bool,
    pub patterns: Vec<String>,
    pub context: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            root: PathBuf::new(),
            include_by_default: true,
            patterns: Vec::new(),
            context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub zvec_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("zmem");
        Self {
            db_path: data.join("zmem.db"),
            zvec_path: data.join("zvec"),
        }
    }
}

impl ZmemConfig {
    /// Load from a JSON file. Precedence is defaults, then `ZMD_*`
    /// environment overrides, then the file itself — a checked-in config
    /// value always wins over the environment. A missing file yields the
    /// env-adjusted defaults; a malformed file logs a warning and does
    /// the same.
    pub fn load(path: &Path) -> Self {
        let mut base = Self::default();
        base.apply_env_overrides();

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                tracing::info!("No config file found, using defaults");
                return base;
            }
        };

        let document: serde_json::Value = match serde_json::from_str(&content) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Failed to parse config file: {} — using defaults", e);
                return base;
            }
        };
        // The file only overrides the env for keys it actually sets
        let file_sets_model = document.pointer("/ai/embedding/model").is_some();
        let file_sets_provider = document.pointer("/ai/embedding/provider").is_some();

        match serde_json::from_value::<ZmemConfig>(document) {
            Ok(mut parsed) => {
                if !file_sets_model {
                    parsed.ai.embedding.model = base.ai.embedding.model.clone();
                }
                if !file_sets_provider {
                    parsed.ai.embedding.provider = base.ai.embedding.provider;
                }
                parsed
            }
            Err(e) => {
                tracing::warn!("Failed to parse config file: {} — using defaults", e);
                base
            }
        }
    }

    /// Apply `ZMD_*` environment overrides. These sit between the
    /// built-in defaults and the config file. An unknown
    /// `ZMD_EMBED_PROVIDER` value is silently ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("ZMD_EMBED_MODEL") {
            if !model.is_empty() {
                self.ai.embedding.model = model;
            }
        }
        if let Ok(provider) = std::env::var("ZMD_EMBED_PROVIDER") {
            if let Some(kind) = EmbeddingProviderKind::parse(&provider) {
                self.ai.embedding.provider = kind;
            }
        }
    }

    /// Resolve the workspace the tool server operates in: explicit argument,
    /// then `ZMEM_WORKSPACE`, then the sole configured workspace, then
    /// `"default"`.
    pub fn resolve_workspace(&self, explicit: Option<&str>) -> String {
        if let Some(ws) = explicit {
            if !ws.is_empty() {
                return ws.to_string();
            }
        }
        if let Ok(ws) = std::env::var("ZMEM_WORKSPACE") {
            if !ws.is_empty() {
                return ws;
            }
        }
        if self.workspaces.len() == 1 {
            return self.workspaces[0].name.clone();
        }
        "default".to_string()
    }

    /// Find a configured workspace entry by name.
    pub fn workspace(&self, name: &str) -> Option<&WorkspaceConfig> {
        self.workspaces.iter().find(|w| w.name == name)
    }
}

/// True when the named boolean env flag is set to `true`.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "true").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ZmemConfig::default();
        assert_eq!(config.defaults.retrieval.top_k_lex, 30);
        assert_eq!(config.defaults.retrieval.min_score, 0.25);
        assert_eq!(config.ai.embedding.dimensions, 1024);
        assert_eq!(config.ai.embedding.batch_size, 8);
        assert!(!config.ai.rerank.enabled);
        assert_eq!(
            config.defaults.scopes_default,
            vec![Scope::Workspace, Scope::Global]
        );
    }

    #[test]
    fn test_parse_partial_document() {
        let json = r#"{
            "defaults": { "retrievalMode": "lexical" },
            "ai": { "embedding": { "provider": "ollama", "model": "nomic-embed-text", "dimensions": 768 } },
            "workspaces": [ { "name": "notes", "root": "/tmp/notes" } ],
            "storage": { "dbPath": "/tmp/zmem.db", "zvecPath": "/tmp/zvec" }
        }"#;
        let config: ZmemConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.defaults.retrieval_mode, RetrievalMode::Lexical);
        assert_eq!(config.ai.embedding.provider, EmbeddingProviderKind::Ollama);
        assert_eq!(config.ai.embedding.dimensions, 768);
        // Untouched sections keep their defaults
        assert_eq!(config.defaults.retrieval.top_k_vec, 30);
        assert_eq!(config.workspaces[0].name, "notes");
        assert!(config.workspaces[0].include_by_default);
    }

    #[test]
    fn test_load_missing_file() {
        let config = ZmemConfig::load(Path::new("/nonexistent/zmem.json"));
        assert_eq!(config.ai.embedding.batch_size, 8);
    }

    #[test]
    fn test_file_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zmem.json");
        // The file pins the model but stays silent on the provider
        std::fs::write(
            &path,
            r#"{ "ai": { "embedding": { "model": "file-model" } } }"#,
        )
        .unwrap();

        std::env::set_var("ZMD_EMBED_MODEL", "env-model");
        std::env::set_var("ZMD_EMBED_PROVIDER", "ollama");
        let config = ZmemConfig::load(&path);
        std::env::remove_var("ZMD_EMBED_MODEL");
        std::env::remove_var("ZMD_EMBED_PROVIDER");

        // File value beats the env; the unset key keeps the env value
        assert_eq!(config.ai.embedding.model, "file-model");
        assert_eq!(config.ai.embedding.provider, EmbeddingProviderKind::Ollama);
    }

    #[test]
    fn test_resolve_workspace_explicit_wins() {
        let mut config = ZmemConfig::default();
        config.workspaces.push(WorkspaceConfig {
            name: "only".into(),
            ..Default::default()
        });
        assert_eq!(config.resolve_workspace(Some("w1")), "w1");
        assert_eq!(config.resolve_workspace(None), "only");
    }

    #[test]
    fn test_resolve_workspace_default() {
        let config = ZmemConfig::default();
        assert_eq!(config.resolve_workspace(None), "default");
    }
}
