//! MCP tool server — exposes the memory engine to coding agents.
//!
//! Transport: stdio (stdout carries the protocol; all diagnostics go to
//! stderr). Tools: `memory_query`, `memory_get`, `memory_list`,
//! `memory_save`, `memory_delete`, `memory_status`, and — gated by
//! `ZMEM_ENABLE_REINDEX_TOOL` — `memory_reindex`.
//!
//! Verbose diagnostics summarise inputs by length only and never echo
//! query or content text.

use std::sync::Arc;

use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::env_flag;
use crate::core::MemoryCore;
use crate::error::ZmemError;
use crate::types::{
    ListFilters, MemoryStatus, MemoryType, RecallOptions, RetrievalMode, SaveInput, Scope,
};

/// Hard cap on `memory_query.limit`.
const MAX_QUERY_LIMIT: usize = 100;
const DEFAULT_QUERY_LIMIT: usize = 20;

// ---------------------------------------------------------------------------
// Tool parameter types
// ---------------------------------------------------------------------------

/// Parameters for the `memory_query` tool.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QueryParams {
    /// The search query (keywords or natural language).
    pub query: String,
    /// Retrieval mode; defaults to the configured mode.
    #[serde(default)]
    pub mode: Option<RetrievalMode>,
    /// Maximum results to return (default 20, max 100).
    #[serde(default)]
    pub limit: Option<usize>,
    /// Restrict to these scopes; defaults to the configured scope set.
    #[serde(default)]
    pub scopes: Option<Vec<Scope>>,
    /// Restrict to these memory types.
    #[serde(default)]
    pub types: Option<Vec<MemoryType>>,
    /// Also return archived (superseded) memories.
    #[serde(default, rename = "includeSuperseded")]
    pub include_superseded: Option<bool>,
}

/// Parameters for the `memory_get` tool.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetParams {
    /// Memory item id.
    pub id: String,
}

/// Parameters for the `memory_list` tool.
#[derive(Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListParams {
    #[serde(default, rename = "type")]
    pub memory_type: Option<MemoryType>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub status: Option<MemoryStatus>,
    /// Page size (default 20).
    #[serde(default)]
    pub limit: Option<i64>,
    /// Page offset (default 0).
    #[serde(default)]
    pub offset: Option<i64>,
}

/// Parameters for the `memory_save` tool.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SaveParams {
    /// Memory type: fact, decision, preference, event, goal, or todo.
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    /// Short human-readable title.
    pub title: String,
    /// Full memory content.
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    /// Origin label, e.g. a file path or tool name.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Importance within [0, 1] (default 0.5).
    #[serde(default)]
    pub importance: Option<f64>,
    /// Id of an active memory this one replaces.
    #[serde(default, rename = "supersedesId")]
    pub supersedes_id: Option<String>,
}

/// Parameters for the `memory_delete` tool.
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeleteParams {
    /// Memory item id.
    pub id: String,
}

// ---------------------------------------------------------------------------
// Server handler
// ---------------------------------------------------------------------------

/// The zmem MCP server handler, bound to one resolved workspace.
#[derive(Clone)]
pub struct ZmemServer {
    core: Arc<MemoryCore>,
    workspace: String,
    verbose: bool,
    tool_router: ToolRouter<Self>,
}

impl ZmemServer {
    pub fn new(core: Arc<MemoryCore>, workspace: String, enable_reindex: bool) -> Self {
        let mut tool_router = Self::tool_router_core();
        if enable_reindex {
            tool_router = tool_router + Self::tool_router_admin();
        }
        Self {
            core,
            workspace,
            verbose: env_flag("ZMEM_MCP_VERBOSE"),
            tool_router,
        }
    }
}

fn tool_error(e: ZmemError) -> rmcp::ErrorData {
    let message = format!("{}: {}", e.code(), e);
    match e {
        ZmemError::Validation(_) | ZmemError::NotFound(_) | ZmemError::Conflict(_) => {
            rmcp::ErrorData::invalid_params(message, None)
        }
        _ => rmcp::ErrorData::internal_error(message, None),
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, rmcp::ErrorData> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| rmcp::ErrorData::internal_error(format!("encode result: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[tool_router(router = tool_router_core)]
impl ZmemServer {
    /// Hybrid search over the workspace's memories.
    #[tool(
        name = "memory_query",
        description = "Search stored memories with hybrid keyword + semantic retrieval. Returns ranked results with snippets."
    )]
    async fn memory_query(
        &self,
        params: Parameters<QueryParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let limit = params.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(rmcp::ErrorData::invalid_params(
                format!("limit must be within 1..={MAX_QUERY_LIMIT}"),
                None,
            ));
        }
        if self.verbose {
            tracing::debug!(
                queryLen = params.query.len(),
                limit,
                "memory_query"
            );
        }

        let defaults = &self.core.config().defaults;
        let options = RecallOptions {
            mode: params.mode.unwrap_or(defaults.retrieval_mode),
            top_k: limit,
            scopes: params.scopes.unwrap_or_else(|| defaults.scopes_default.clone()),
            types: params.types.unwrap_or_default(),
            include_superseded: params
                .include_superseded
                .unwrap_or(defaults.retrieval.include_superseded),
        };
        let hits = self
            .core
            .recall(&self.workspace, &params.query, &options)
            .await
            .map_err(tool_error)?;
        json_result(&hits)
    }

    /// Fetch a single memory by id.
    #[tool(
        name = "memory_get",
        description = "Fetch one memory item by id, including its full content and lifecycle status."
    )]
    async fn memory_get(
        &self,
        params: Parameters<GetParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        if self.verbose {
            tracing::debug!(idLen = params.0.id.len(), "memory_get");
        }
        let item = self
            .core
            .get(&self.workspace, &params.0.id)
            .map_err(tool_error)?;
        json_result(&item)
    }

    /// Page through the workspace's memories.
    #[tool(
        name = "memory_list",
        description = "List memories in the workspace, filtered by type, scope, and status, newest first."
    )]
    async fn memory_list(
        &self,
        params: Parameters<ListParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let filters = ListFilters {
            memory_type: params.memory_type,
            scope: params.scope,
            status: params.status.or(Some(MemoryStatus::Active)),
            limit: params.limit.unwrap_or(20),
            offset: params.offset.unwrap_or(0),
        };
        if self.verbose {
            tracing::debug!(limit = filters.limit, offset = filters.offset, "memory_list");
        }
        let page = self.core.list(&self.workspace, &filters).map_err(tool_error)?;
        json_result(&page)
    }

    /// Persist a new memory.
    #[tool(
        name = "memory_save",
        description = "Save a new memory item. Optionally supersedes an existing active memory, archiving it."
    )]
    async fn memory_save(
        &self,
        params: Parameters<SaveParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        if self.verbose {
            tracing::debug!(
                titleLen = params.title.len(),
                contentLen = params.content.len(),
                "memory_save"
            );
        }
        let input = SaveInput {
            memory_type: params.memory_type,
            title: params.title,
            content: params.content,
            summary: params.summary,
            source: params.source,
            scope: params.scope,
            tags: params.tags.unwrap_or_default(),
            importance: params.importance,
            supersedes_id: params.supersedes_id,
        };
        let outcome = self
            .core
            .save(&self.workspace, input)
            .await
            .map_err(tool_error)?;
        json_result(&outcome)
    }

    /// Soft-delete a memory.
    #[tool(
        name = "memory_delete",
        description = "Soft-delete a memory item by id. Returns false when the item is missing or already deleted."
    )]
    async fn memory_delete(
        &self,
        params: Parameters<DeleteParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        if self.verbose {
            tracing::debug!(idLen = params.0.id.len(), "memory_delete");
        }
        let deleted = self
            .core
            .delete(&self.workspace, &params.0.id)
            .map_err(tool_error)?;
        json_result(&serde_json::json!({ "deleted": deleted }))
    }

    /// Workspace counters.
    #[tool(
        name = "memory_status",
        description = "Report workspace counters: item count, vector count, pending embeddings, and last index time."
    )]
    async fn memory_status(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let report = self.core.status(&self.workspace).map_err(tool_error)?;
        json_result(&report)
    }
}

#[tool_router(router = tool_router_admin)]
impl ZmemServer {
    /// Admin tool, registered only when `ZMEM_ENABLE_REINDEX_TOOL=true`.
    #[tool(
        name = "memory_reindex",
        description = "Rebuild chunks and vectors for every active memory in the workspace."
    )]
    async fn memory_reindex(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let report = self.core.reindex(&self.workspace).await.map_err(tool_error)?;
        json_result(&report)
    }
}

#[tool_handler]
impl ServerHandler for ZmemServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "zmem".into(),
                title: Some("zmem — hybrid memory engine".into()),
                version: env!("CARGO_PKG_VERSION").into(),
                description: Some(
                    "Local-first hybrid memory engine. Stores engineering memories \
                     and retrieves them with combined keyword + semantic search."
                        .into(),
                ),
                icons: None,
                website_url: Some("https://github.com/cosmiclasagnadev/zmem".into()),
            },
            instructions: Some(
                "zmem stores durable engineering memories per workspace. \
                 Use memory_query to retrieve relevant memories, memory_save to record \
                 new facts and decisions, and memory_status to check index health."
                    .into(),
            ),
        }
    }
}

/// Serve the tool surface over stdio until the client disconnects.
pub async fn serve_stdio(core: Arc<MemoryCore>, workspace: String) -> anyhow::Result<()> {
    let enable_reindex = env_flag("ZMEM_ENABLE_REINDEX_TOOL");
    let handler = ZmemServer::new(core, workspace, enable_reindex);

    tracing::info!(
        workspace = %handler.workspace,
        reindex_tool = enable_reindex,
        "MCP server on stdio"
    );

    let service = handler.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
