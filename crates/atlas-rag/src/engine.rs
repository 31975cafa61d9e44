//! Contract for the knowledge-graph engine.
//!
//! The engine (RAG library + Neo4j) is an external collaborator; this
//! module pins down the five calls the rest of the system makes and a
//! process-global builder hook through which the concrete backend is
//! installed. Tests install fakes through the same hook.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use atlas_core::config::RagConfig;
use atlas_core::types::QueryMode;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Backend library/driver missing — permanent.
    #[error("engine dependency missing: {0}")]
    Dependency(String),

    /// Bad wiring (credentials, URIs) — permanent.
    #[error("engine config error: {0}")]
    Config(String),

    /// Network/storage hiccup — retryable.
    #[error("engine transient failure: {0}")]
    Transient(String),

    #[error("engine failure: {0}")]
    Other(String),
}

/// Query parameters forwarded to the engine.
#[derive(Debug, Clone, Serialize)]
pub struct QueryParam {
    pub mode: QueryMode,
    pub top_k: usize,
    pub chunk_top_k: Option<usize>,
    /// Skip answer generation and return retrieval context only.
    pub only_need_context: bool,
    pub enable_rerank: bool,
    pub max_total_tokens: Option<usize>,
}

impl QueryParam {
    pub fn new(mode: QueryMode, top_k: usize) -> Self {
        Self {
            mode,
            top_k,
            chunk_top_k: None,
            only_need_context: false,
            enable_rerank: false,
            max_total_tokens: None,
        }
    }
}

/// A retrieved text chunk. `score` stays raw JSON because upstream
/// backends emit numbers, numeric strings, and worse — normalisation
/// happens in the retrieval service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkHit {
    pub content: String,
    pub doc_id: Option<String>,
    pub file_path: Option<String>,
    pub score: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphEntity {
    pub name: String,
    pub entity_type: Option<String>,
    pub description: Option<String>,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub source: String,
    pub target: String,
    pub description: Option<String>,
    pub keywords: Option<String>,
    pub file_path: Option<String>,
}

/// Output of `query_llm`: generated answer plus the retrieval context
/// that produced it.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub llm_response: String,
    pub chunks: Vec<ChunkHit>,
    pub entities: Vec<GraphEntity>,
    pub relationships: Vec<GraphRelationship>,
}

/// Raw knowledge-graph slice as the engine reports it.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    pub nodes: Vec<KgNode>,
    pub edges: Vec<KgEdge>,
}

#[derive(Debug, Clone, Default)]
pub struct KgNode {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct KgEdge {
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    pub edge_type: Option<String>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// The five calls everything else is built on. All methods run on the
/// dedicated runtime thread; implementations may hold loop-bound state.
#[async_trait(?Send)]
pub trait KgEngine {
    /// Insert (or re-insert) a document under explicit ids. Returns a
    /// backend tracking id.
    async fn ainsert(
        &self,
        text: &str,
        ids: &[String],
        file_paths: &[String],
    ) -> Result<String, EngineError>;

    /// Delete a document by id. Must be idempotent.
    async fn adelete_by_doc_id(&self, doc_id: &str) -> Result<(), EngineError>;

    /// Retrieval-augmented answer generation.
    async fn query_llm(&self, query: &str, param: &QueryParam) -> Result<QueryOutput, EngineError>;

    /// Graph neighbourhood export.
    async fn get_knowledge_graph(
        &self,
        node_label: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> Result<KnowledgeGraph, EngineError>;

    /// Vector-store-only recall (no LLM).
    async fn chunks_query(&self, query: &str, top_k: usize) -> Result<Vec<ChunkHit>, EngineError>;
}

/// Everything an engine backend needs to wire itself.
pub struct EngineInit {
    pub config: RagConfig,
    pub embedder: Option<Arc<atlas_llm::embedding::EmbeddingClient>>,
    pub rerank: Option<Arc<atlas_llm::rerank::RerankClient>>,
}

pub type EngineBuilder =
    Arc<dyn Fn(&EngineInit) -> Result<Arc<dyn KgEngine>, EngineError> + Send + Sync>;

static ENGINE_BUILDER: OnceLock<Mutex<Option<EngineBuilder>>> = OnceLock::new();

fn builder_slot() -> &'static Mutex<Option<EngineBuilder>> {
    ENGINE_BUILDER.get_or_init(|| Mutex::new(None))
}

/// Install the concrete engine backend. Last writer wins; tests use
/// this to swap in fakes.
pub fn set_engine_builder(builder: EngineBuilder) {
    *builder_slot().lock().unwrap() = Some(builder);
}

pub fn engine_builder() -> Option<EngineBuilder> {
    builder_slot().lock().unwrap().clone()
}

/// Test hook: drop any installed builder.
pub fn reset_engine_builder_for_tests() {
    *builder_slot().lock().unwrap() = None;
}
