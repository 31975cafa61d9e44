use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// `last_error` columns are truncated to this length before storage.
pub const MAX_STORED_ERROR_CHARS: usize = 4000;

/// Top-level config (atlas.toml + ATLAS_* env overrides, `__` nesting).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AtlasConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub parse: ParseConfig,
    #[serde(default)]
    pub kb: KbConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_app_env")]
    pub env: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            env: default_app_env(),
            debug: false,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// S3-compatible object storage (attachment blobs). `upload_dir` backs
/// the filesystem store used when no remote endpoint is wired in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_storage_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_storage_endpoint(),
            access_key: String::new(),
            secret_key: String::new(),
            bucket: default_storage_bucket(),
            secure: false,
            upload_dir: default_upload_dir(),
        }
    }
}

/// AI registry settings. `crypto_key` is the base64-encoded 32-byte key
/// that seals credential API keys at rest.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AiConfig {
    #[serde(default)]
    pub crypto_key: String,
}

/// Shared lease-worker tuning, one instance per pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTuning {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lock_ttl_sec")]
    pub lock_ttl_sec: i64,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            lock_ttl_sec: default_lock_ttl_sec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Master feature gate. When false the indexer fast-skips events so
    /// the outbox never backlogs, and retrieval returns FeatureDisabled.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub worker: WorkerTuning,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default = "default_graph_storage")]
    pub graph_storage: String,
    #[serde(default)]
    pub llm_model: String,
    #[serde(default)]
    pub llm_host: String,
    #[serde(default)]
    pub llm_key: String,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_host: String,
    #[serde(default)]
    pub embedding_key: String,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    #[serde(default = "default_init_timeout_sec")]
    pub init_timeout_sec: f64,
    #[serde(default = "default_query_timeout_sec")]
    pub query_timeout_sec: f64,
    #[serde(default = "default_query_max_concurrency")]
    pub query_max_concurrency: usize,
    /// TTL-LRU cache for retrieval; ttl=0 disables caching.
    #[serde(default)]
    pub query_cache_ttl_sec: u64,
    #[serde(default = "default_query_cache_maxsize")]
    pub query_cache_maxsize: usize,
    /// Prompt language for summarisation inside the KG engine
    /// (e.g. "English", "Chinese"); empty = engine default.
    #[serde(default)]
    pub summary_language: String,
    #[serde(default)]
    pub rerank: RerankSettings,
    #[serde(default)]
    pub neo4j: Neo4jConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker: WorkerTuning::default(),
            working_dir: default_working_dir(),
            workspace: String::new(),
            graph_storage: default_graph_storage(),
            llm_model: String::new(),
            llm_host: String::new(),
            llm_key: String::new(),
            embedding_model: String::new(),
            embedding_host: String::new(),
            embedding_key: String::new(),
            embedding_dim: default_embedding_dim(),
            init_timeout_sec: default_init_timeout_sec(),
            query_timeout_sec: default_query_timeout_sec(),
            query_max_concurrency: default_query_max_concurrency(),
            query_cache_ttl_sec: 0,
            query_cache_maxsize: default_query_cache_maxsize(),
            summary_language: String::new(),
            rerank: RerankSettings::default(),
            neo4j: Neo4jConfig::default(),
        }
    }
}

/// Rerank is enabled when `model` is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankSettings {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_rerank_timeout_sec")]
    pub timeout_sec: f64,
    /// "standard" | "aliyun"
    #[serde(default = "default_rerank_format")]
    pub request_format: String,
    #[serde(default)]
    pub enable_chunking: bool,
    #[serde(default = "default_rerank_max_tokens")]
    pub max_tokens_per_doc: usize,
    #[serde(default)]
    pub min_score: f64,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            host: String::new(),
            key: String::new(),
            timeout_sec: default_rerank_timeout_sec(),
            request_format: default_rerank_format(),
            enable_chunking: false,
            max_tokens_per_doc: default_rerank_max_tokens(),
            min_score: 0.0,
        }
    }
}

impl RerankSettings {
    pub fn configured(&self) -> bool {
        !self.model.trim().is_empty() && !self.host.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    #[serde(default = "default_neo4j_uri")]
    pub uri: String,
    #[serde(default = "default_neo4j_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_neo4j_database")]
    pub database: String,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: default_neo4j_uri(),
            user: default_neo4j_user(),
            password: String::new(),
            database: default_neo4j_database(),
        }
    }
}

/// Attachment parse pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseConfig {
    #[serde(default = "default_parse_worker")]
    pub worker: WorkerTuning,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "default_max_pdf_pages")]
    pub max_pdf_pages: u32,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            worker: default_parse_worker(),
            max_file_size_mb: default_max_file_size_mb(),
            max_pdf_pages: default_max_pdf_pages(),
        }
    }
}

/// Knowledge-base recall settings for the assistant path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbConfig {
    #[serde(default = "default_kb_mode")]
    pub graph_recall_mode: String,
    #[serde(default = "default_kb_top_k")]
    pub graph_recall_top_k: usize,
    #[serde(default = "default_kb_chunk_top_k")]
    pub graph_recall_chunk_top_k: usize,
    #[serde(default = "default_kb_max_entries")]
    pub graph_recall_max_entries: usize,
    #[serde(default = "default_kb_chunks_per_entry")]
    pub graph_recall_chunks_per_entry: usize,
    #[serde(default = "default_kb_max_chunk_chars")]
    pub graph_recall_max_chunk_chars: usize,
    #[serde(default)]
    pub graph_recall_min_score: f64,
    #[serde(default = "default_kb_max_tokens")]
    pub graph_recall_max_tokens: usize,
    /// Budget for KB material injected into the agent prompt.
    #[serde(default = "default_kb_context_max_chars")]
    pub context_max_chars: usize,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            graph_recall_mode: default_kb_mode(),
            graph_recall_top_k: default_kb_top_k(),
            graph_recall_chunk_top_k: default_kb_chunk_top_k(),
            graph_recall_max_entries: default_kb_max_entries(),
            graph_recall_chunks_per_entry: default_kb_chunks_per_entry(),
            graph_recall_max_chunk_chars: default_kb_max_chunk_chars(),
            graph_recall_min_score: 0.0,
            graph_recall_max_tokens: default_kb_max_tokens(),
            context_max_chars: default_kb_context_max_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_app_name() -> String {
    "MindAtlas".to_string()
}
fn default_app_env() -> String {
    "development".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.mindatlas/atlas.db")
}
fn default_storage_endpoint() -> String {
    "localhost:9000".to_string()
}
fn default_storage_bucket() -> String {
    "mindatlas".to_string()
}
fn default_upload_dir() -> String {
    "./uploads".to_string()
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_batch_size() -> usize {
    50
}
fn default_max_attempts() -> u32 {
    6
}
fn default_lock_ttl_sec() -> i64 {
    300
}
fn default_working_dir() -> String {
    "./rag_storage".to_string()
}
fn default_graph_storage() -> String {
    "Neo4JStorage".to_string()
}
fn default_embedding_dim() -> usize {
    1536
}
fn default_init_timeout_sec() -> f64 {
    120.0
}
fn default_query_timeout_sec() -> f64 {
    30.0
}
fn default_query_max_concurrency() -> usize {
    1
}
fn default_query_cache_maxsize() -> usize {
    128
}
fn default_rerank_timeout_sec() -> f64 {
    15.0
}
fn default_rerank_format() -> String {
    "standard".to_string()
}
fn default_rerank_max_tokens() -> usize {
    480
}
fn default_neo4j_uri() -> String {
    "bolt://localhost:7687".to_string()
}
fn default_neo4j_user() -> String {
    "neo4j".to_string()
}
fn default_neo4j_database() -> String {
    "neo4j".to_string()
}
fn default_parse_worker() -> WorkerTuning {
    WorkerTuning {
        enabled: false,
        poll_interval_ms: 2000,
        batch_size: 1,
        max_attempts: 3,
        lock_ttl_sec: 600,
    }
}
fn default_max_file_size_mb() -> u64 {
    100
}
fn default_max_pdf_pages() -> u32 {
    500
}
fn default_kb_mode() -> String {
    "mix".to_string()
}
fn default_kb_top_k() -> usize {
    10
}
fn default_kb_chunk_top_k() -> usize {
    20
}
fn default_kb_max_entries() -> usize {
    10
}
fn default_kb_chunks_per_entry() -> usize {
    3
}
fn default_kb_max_chunk_chars() -> usize {
    600
}
fn default_kb_max_tokens() -> usize {
    8
}
fn default_kb_context_max_chars() -> usize {
    16000
}

impl AtlasConfig {
    /// Load config from a TOML file with ATLAS_* env overrides.
    /// Nested keys use double underscore: ATLAS_RAG__WORKER__BATCH_SIZE=10.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: AtlasConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ATLAS_").split("__"))
            .extract()
            .map_err(|e| crate::error::AtlasError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.mindatlas/atlas.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_tuning() {
        let cfg = AtlasConfig::default();
        assert_eq!(cfg.rag.worker.batch_size, 50);
        assert_eq!(cfg.rag.worker.max_attempts, 6);
        assert_eq!(cfg.rag.worker.lock_ttl_sec, 300);
        assert_eq!(cfg.parse.worker.batch_size, 1);
        assert_eq!(cfg.parse.worker.max_attempts, 3);
        assert_eq!(cfg.parse.worker.lock_ttl_sec, 600);
        assert_eq!(cfg.parse.max_file_size_mb, 100);
    }

    #[test]
    fn rerank_disabled_until_model_and_host_set() {
        let mut cfg = RerankSettings::default();
        assert!(!cfg.configured());
        cfg.model = "bge-reranker".to_string();
        assert!(!cfg.configured());
        cfg.host = "https://rerank.example.com/v1/rerank".to_string();
        assert!(cfg.configured());
    }
}
