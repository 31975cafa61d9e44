//! Retrieval service: bounded-concurrency KG queries with TTL caching,
//! source normalisation, graph-context extraction, and numbered
//! citation references.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use atlas_core::types::QueryMode;
use atlas_store::Store;

use crate::cache::{make_cache_key, SemaphoreRegistry, TtlLruCache};
use crate::engine::{ChunkHit, GraphEntity, GraphRelationship, QueryOutput, QueryParam};
use crate::error::{RagError, Result};
use crate::graph::{knowledge_graph_to_graph_data, GraphData};
use crate::recommend::{
    build_entry_query_text, build_recommendation_prompt, extract_candidate_entry_ids,
    parse_recommendation_payload, RelationRecommendation, MIN_RELEVANCE_FLOOR,
};
use crate::runtime::RagRuntime;
use crate::source_ids::{
    is_attachment_doc_id, parse_attachment_id_from_attachment_file_path,
    parse_attachment_id_from_doc_id, parse_entry_id_from_attachment_file_path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Entry,
    Attachment,
}

/// A retrieval hit, decorated with entry/attachment linkage derived
/// from the doc_id / file_path conventions.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<SourceKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetadata {
    pub mode: QueryMode,
    pub top_k: usize,
    pub latency_ms: u64,
    pub cache_hit: bool,
}

/// Numbered citation reference for `[^n]` markers: entries first, then
/// entities, then relationships.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub index: usize,
    #[serde(rename = "type")]
    pub ref_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub metadata: QueryMetadata,
    pub references: Vec<Reference>,
}

/// Retrieval context for graph-aware callers (no generated answer).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphContext {
    pub chunks: Vec<Source>,
    pub entities: Vec<GraphEntity>,
    pub relationships: Vec<GraphRelationship>,
}

/// Coerce a raw score into a usable f64: numeric strings accepted,
/// booleans stripped, NaN/Inf rejected.
pub fn normalize_score(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Bool(_) | serde_json::Value::Null => None,
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::String(s) => {
            s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

fn chunk_to_source(chunk: &ChunkHit) -> Source {
    Source {
        doc_id: chunk
            .doc_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
        file_path: chunk
            .file_path
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
        content: if chunk.content.is_empty() {
            None
        } else {
            Some(chunk.content.clone())
        },
        score: normalize_score(chunk.score.as_ref()),
        kind: None,
        entry_id: None,
        attachment_id: None,
    }
}

/// Derive entry/attachment linkage for each source. Attachment linkage
/// is recovered from the composite file_path even when the upstream
/// lost the `attachment:` doc_id prefix.
pub fn decorate_sources(sources: &mut [Source]) {
    for src in sources.iter_mut() {
        let doc_id = src.doc_id.clone().unwrap_or_default();
        let file_path = src.file_path.clone().unwrap_or_default();

        if file_path.contains("/attachments/") {
            let attachment_id = parse_attachment_id_from_attachment_file_path(&file_path);
            let entry_id = parse_entry_id_from_attachment_file_path(&file_path);
            if let (Some(attachment_id), Some(entry_id)) = (attachment_id, entry_id) {
                src.kind = Some(SourceKind::Attachment);
                src.attachment_id = Some(attachment_id);
                src.entry_id = Some(entry_id);
                continue;
            }
        }

        if is_attachment_doc_id(&doc_id) {
            src.kind = Some(SourceKind::Attachment);
            src.attachment_id = parse_attachment_id_from_doc_id(&doc_id);
            src.entry_id = parse_entry_id_from_attachment_file_path(&file_path);
            continue;
        }

        if let Ok(u) = uuid::Uuid::parse_str(doc_id.trim()) {
            src.entry_id = Some(u.to_string());
            src.kind = Some(SourceKind::Entry);
        }
    }
}

/// Build the numbered reference list: entries 1..N, entities N+1..M,
/// relationships M+1..K.
pub fn build_references(
    sources: &[Source],
    entities: &[GraphEntity],
    relationships: &[GraphRelationship],
    store: Option<&Store>,
) -> Vec<Reference> {
    let mut refs = Vec::new();
    let mut seen_entries: HashSet<String> = HashSet::new();
    let mut entry_ids: Vec<String> = Vec::new();
    for src in sources {
        if let Some(entry_id) = &src.entry_id {
            if seen_entries.insert(entry_id.clone()) {
                entry_ids.push(entry_id.clone());
            }
        }
    }
    let titles = store
        .and_then(|s| s.entry_titles_by_ids(&entry_ids).ok())
        .unwrap_or_default();

    let mut index = 1usize;
    for entry_id in entry_ids {
        refs.push(Reference {
            index,
            ref_type: "entry".to_string(),
            title: titles.get(&entry_id).cloned(),
            entry_id: Some(entry_id),
            name: None,
            entity_type: None,
            source: None,
            target: None,
        });
        index += 1;
    }
    for entity in entities {
        refs.push(Reference {
            index,
            ref_type: "entity".to_string(),
            title: None,
            entry_id: None,
            name: Some(entity.name.clone()),
            entity_type: entity.entity_type.clone(),
            source: None,
            target: None,
        });
        index += 1;
    }
    for rel in relationships {
        refs.push(Reference {
            index,
            ref_type: "rel".to_string(),
            title: None,
            entry_id: None,
            name: None,
            entity_type: None,
            source: Some(rel.source.clone()),
            target: Some(rel.target.clone()),
        });
        index += 1;
    }
    refs
}

pub struct RetrievalService {
    store: Store,
    runtime: RagRuntime,
    cfg: atlas_core::config::RagConfig,
    cache: TtlLruCache<Arc<QueryResponse>>,
    semaphores: SemaphoreRegistry,
}

impl RetrievalService {
    pub fn new(store: Store, runtime: RagRuntime, cfg: atlas_core::config::RagConfig) -> Self {
        Self {
            store,
            runtime,
            cfg,
            cache: TtlLruCache::new(),
            semaphores: SemaphoreRegistry::new(),
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.cfg.enabled {
            Ok(())
        } else {
            Err(RagError::NotEnabled)
        }
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs_f64(if self.cfg.query_timeout_sec > 0.0 {
            self.cfg.query_timeout_sec
        } else {
            30.0
        })
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cfg.query_cache_ttl_sec)
    }

    /// Concurrency slot with the query timeout applied to queueing;
    /// exhaustion surfaces as a timeout to the caller.
    async fn acquire_slot(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        let sem = self.semaphores.get(self.cfg.query_max_concurrency);
        match tokio::time::timeout(self.query_timeout(), sem.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(RagError::Internal("query semaphore closed".into())),
            Err(_) => {
                warn!(
                    max_concurrency = self.cfg.query_max_concurrency,
                    "query concurrency slot timeout"
                );
                Err(RagError::Timeout)
            }
        }
    }

    /// Retrieval-augmented answer with supplemental vector-store
    /// sources and citation references.
    pub async fn query(
        &self,
        query: &str,
        mode: QueryMode,
        top_k: usize,
    ) -> Result<Arc<QueryResponse>> {
        self.ensure_enabled()?;
        let cache_key = make_cache_key("query", query, &mode.to_string(), top_k);

        if let Some(cached) = self.cache.get(&cache_key) {
            let mut hit = (*cached).clone();
            hit.metadata = QueryMetadata {
                mode,
                top_k,
                latency_ms: 0,
                cache_hit: true,
            };
            return Ok(Arc::new(hit));
        }

        let started = Instant::now();
        let _permit = self.acquire_slot().await?;
        let queue_wait_ms = started.elapsed().as_millis() as u64;

        let timeout = self.query_timeout();
        let q = query.trim().to_string();
        let mut param = QueryParam::new(mode, top_k);
        param.enable_rerank = self.cfg.rerank.configured();

        let (output, supplement): (QueryOutput, Vec<ChunkHit>) = self
            .runtime
            .with_engine(timeout, move |engine| {
                Box::pin(async move {
                    let output = engine.query_llm(&q, &param).await.map_err(RagError::from)?;
                    // Supplement sources with direct vector recall so
                    // doc_id/file_path/score are always present.
                    let supplement = engine
                        .chunks_query(&q, top_k)
                        .await
                        .map_err(RagError::from)?;
                    Ok((output, supplement))
                })
            })
            .await?;

        let mut sources: Vec<Source> = supplement.iter().map(chunk_to_source).collect();
        decorate_sources(&mut sources);
        let references =
            build_references(&sources, &output.entities, &output.relationships, Some(&self.store));

        let latency_ms = started.elapsed().as_millis() as u64;
        let response = Arc::new(QueryResponse {
            answer: output.llm_response,
            sources,
            metadata: QueryMetadata {
                mode,
                top_k,
                latency_ms,
                cache_hit: false,
            },
            references,
        });

        self.cache.set(
            &cache_key,
            response.clone(),
            self.cache_ttl(),
            self.cfg.query_cache_maxsize,
        );

        info!(
            mode = %mode,
            top_k,
            latency_ms,
            queue_wait_ms,
            cache_hit = false,
            "rag query done"
        );
        Ok(response)
    }

    /// Vector-only recall: cheap relevance lookups with no LLM call.
    pub async fn recall_sources(
        &self,
        query: &str,
        mode: QueryMode,
        top_k: usize,
    ) -> Result<Vec<Source>> {
        self.ensure_enabled()?;
        let cache_key = make_cache_key("recall", query, &mode.to_string(), top_k);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached.sources.clone());
        }

        let _permit = self.acquire_slot().await?;
        let q = query.trim().to_string();
        let chunks = self
            .runtime
            .with_engine(self.query_timeout(), move |engine| {
                Box::pin(async move { engine.chunks_query(&q, top_k).await.map_err(RagError::from) })
            })
            .await?;

        let mut sources: Vec<Source> = chunks.iter().map(chunk_to_source).collect();
        decorate_sources(&mut sources);

        self.cache.set(
            &cache_key,
            Arc::new(QueryResponse {
                answer: String::new(),
                sources: sources.clone(),
                metadata: QueryMetadata {
                    mode,
                    top_k,
                    latency_ms: 0,
                    cache_hit: false,
                },
                references: Vec::new(),
            }),
            self.cache_ttl(),
            self.cfg.query_cache_maxsize,
        );
        Ok(sources)
    }

    /// Context-only retrieval for graph-aware callers: chunks plus the
    /// entities/relationships that backed them.
    pub async fn graph_recall_with_context(
        &self,
        query: &str,
        mode: QueryMode,
        top_k: usize,
        chunk_top_k: usize,
        max_tokens: usize,
    ) -> Result<GraphContext> {
        self.ensure_enabled()?;
        let _permit = self.acquire_slot().await?;

        let q = query.trim().to_string();
        let mut param = QueryParam::new(mode, top_k);
        param.chunk_top_k = Some(chunk_top_k);
        param.only_need_context = true;
        param.max_total_tokens = Some(max_tokens);
        param.enable_rerank = self.cfg.rerank.configured();

        let output = self
            .runtime
            .with_engine(self.query_timeout(), move |engine| {
                Box::pin(async move { engine.query_llm(&q, &param).await.map_err(RagError::from) })
            })
            .await?;

        let mut chunks: Vec<Source> = output.chunks.iter().map(chunk_to_source).collect();
        decorate_sources(&mut chunks);
        Ok(GraphContext {
            chunks,
            entities: output.entities,
            relationships: output.relationships,
        })
    }

    /// Graph neighbourhood export, normalised for the frontend.
    pub async fn get_graph_data(
        &self,
        node_label: &str,
        max_depth: usize,
        max_nodes: usize,
    ) -> Result<GraphData> {
        self.ensure_enabled()?;

        let label = {
            let trimmed = node_label.trim();
            let trimmed = if trimmed.is_empty() { "*" } else { trimmed };
            let label: String = trimmed.chars().take(256).collect();
            if label != "*"
                && !label.chars().all(|c| {
                    c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-' | ' ')
                })
            {
                return Err(RagError::Validation("invalid node label format".into()));
            }
            label
        };
        let max_depth = max_depth.clamp(1, 10);
        let max_nodes = max_nodes.clamp(1, 5000);

        let _permit = self.acquire_slot().await?;
        let raw = self
            .runtime
            .with_engine(self.query_timeout(), move |engine| {
                Box::pin(async move {
                    engine
                        .get_knowledge_graph(&label, max_depth, max_nodes)
                        .await
                        .map_err(RagError::from)
                })
            })
            .await?;

        Ok(knowledge_graph_to_graph_data(&raw, Some(&self.store)))
    }

    /// Recommend related entries for `entry_id`, ranked by an
    /// LLM-assessed relevance over the retrieval context.
    #[allow(clippy::too_many_arguments)]
    pub async fn recommend_entry_relations(
        &self,
        entry_id: &str,
        mode: QueryMode,
        limit: usize,
        min_score: f64,
        exclude_existing_relations: bool,
        include_relation_type: bool,
    ) -> Result<Vec<RelationRecommendation>> {
        self.ensure_enabled()?;
        if !(1..=100).contains(&limit) {
            return Err(RagError::Validation(format!("limit out of range: {limit}")));
        }
        if !(0.0..=1.0).contains(&min_score) {
            return Err(RagError::Validation(format!(
                "min_score out of range: {min_score}"
            )));
        }
        let effective_min_score = min_score.max(MIN_RELEVANCE_FLOOR);

        let entry = self
            .store
            .find_entry(entry_id)
            .map_err(|e| RagError::Internal(e.to_string()))?
            .ok_or_else(|| RagError::NotFound(format!("entry not found: {entry_id}")))?;

        let base_text = build_entry_query_text(&entry);
        if base_text.is_empty() {
            return Ok(Vec::new());
        }

        let relation_type_codes = if include_relation_type {
            self.store
                .enabled_relation_type_codes()
                .map_err(|e| RagError::Internal(e.to_string()))?
        } else {
            Vec::new()
        };

        let top_k = (limit * 2).clamp(1, 50);
        let prompt = build_recommendation_prompt(&base_text, &relation_type_codes, limit);

        let _permit = self.acquire_slot().await?;
        let mut param = QueryParam::new(mode, top_k);
        param.chunk_top_k = Some(top_k);
        let output = self
            .runtime
            .with_engine(self.query_timeout(), move |engine| {
                Box::pin(async move { engine.query_llm(&prompt, &param).await.map_err(RagError::from) })
            })
            .await?;

        let mut candidates = extract_candidate_entry_ids(&output);
        candidates.remove(entry_id);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut recommendations =
            parse_recommendation_payload(&output.llm_response, &relation_type_codes, &candidates);

        let excluded: HashSet<String> = if exclude_existing_relations {
            self.store
                .relations_by_entry(entry_id)
                .map_err(|e| RagError::Internal(e.to_string()))?
                .into_iter()
                .map(|rel| {
                    if rel.source_entry_id == entry_id {
                        rel.target_entry_id
                    } else {
                        rel.source_entry_id
                    }
                })
                .collect()
        } else {
            HashSet::new()
        };

        recommendations.retain(|r| {
            r.target_entry_id != entry_id
                && !excluded.contains(&r.target_entry_id)
                && r.score >= effective_min_score
        });

        // Deleted entries never surface in recommendations.
        let ids: Vec<String> = recommendations
            .iter()
            .map(|r| r.target_entry_id.clone())
            .collect();
        let existing = self
            .store
            .existing_entry_ids(&ids)
            .map_err(|e| RagError::Internal(e.to_string()))?;
        recommendations.retain(|r| existing.contains(&r.target_entry_id));

        recommendations.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.target_entry_id.cmp(&b.target_entry_id))
        });
        recommendations.truncate(limit);
        Ok(recommendations)
    }

    /// Test hook mirroring the process-wide reset of caches/semaphores.
    pub fn reset_query_state_for_tests(&self) {
        self.cache.clear();
        self.semaphores.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use super::*;
    use crate::engine::{GraphEntity, KgNode, KnowledgeGraph};
    use crate::runtime::test_engines::FakeEngine;
    use atlas_core::config::RagConfig;
    use atlas_store::entry::test_support::{entry_input, seed_type};

    const ENTRY: &str = "6f1f3a9a-88f7-4a2e-9d3b-52a5a6a1c000";
    const ATT: &str = "0e0b57f3-0a3a-4a9a-8c5d-9e3f1b2c4d5e";

    fn enabled_cfg() -> RagConfig {
        RagConfig {
            enabled: true,
            query_cache_ttl_sec: 60,
            query_cache_maxsize: 16,
            query_timeout_sec: 5.0,
            query_max_concurrency: 2,
            ..Default::default()
        }
    }

    fn service_with_engine(engine: FakeEngine, store: Store) -> RetrievalService {
        let engine = std::sync::Mutex::new(Some(engine));
        let runtime = RagRuntime::start(Box::new(move || {
            Ok(StdArc::new(engine.lock().unwrap().take().expect("engine built once")) as _)
        }));
        RetrievalService::new(store, runtime, enabled_cfg())
    }

    fn chunk(doc_id: &str, file_path: &str, score: serde_json::Value) -> ChunkHit {
        ChunkHit {
            content: "chunk text".into(),
            doc_id: Some(doc_id.into()),
            file_path: Some(file_path.into()),
            score: Some(score),
        }
    }

    #[test]
    fn score_normalisation_rules() {
        assert_eq!(normalize_score(Some(&serde_json::json!("0.5"))), Some(0.5));
        assert_eq!(normalize_score(Some(&serde_json::json!(0.25))), Some(0.25));
        assert_eq!(normalize_score(Some(&serde_json::json!(true))), None);
        assert_eq!(normalize_score(Some(&serde_json::json!("NaN"))), None);
        assert_eq!(normalize_score(Some(&serde_json::json!("inf"))), None);
        assert_eq!(normalize_score(None), None);
    }

    #[test]
    fn decoration_recovers_attachment_linkage_without_prefix() {
        let mut sources = vec![Source {
            doc_id: Some("lost-prefix".into()),
            file_path: Some(format!("{ENTRY}/attachments/{ATT}")),
            ..Default::default()
        }];
        decorate_sources(&mut sources);
        assert_eq!(sources[0].kind, Some(SourceKind::Attachment));
        assert_eq!(sources[0].attachment_id.as_deref(), Some(ATT));
        assert_eq!(sources[0].entry_id.as_deref(), Some(ENTRY));
    }

    #[test]
    fn decoration_marks_entry_uuids() {
        let mut sources = vec![Source {
            doc_id: Some(ENTRY.into()),
            file_path: Some(ENTRY.into()),
            ..Default::default()
        }];
        decorate_sources(&mut sources);
        assert_eq!(sources[0].kind, Some(SourceKind::Entry));
        assert_eq!(sources[0].entry_id.as_deref(), Some(ENTRY));
    }

    #[test]
    fn references_number_entries_then_entities_then_rels() {
        let sources = vec![Source {
            entry_id: Some(ENTRY.into()),
            kind: Some(SourceKind::Entry),
            ..Default::default()
        }];
        let entities = vec![GraphEntity {
            name: "Rust".into(),
            entity_type: Some("Language".into()),
            ..Default::default()
        }];
        let rels = vec![GraphRelationship {
            source: "Rust".into(),
            target: "Systems".into(),
            ..Default::default()
        }];
        let refs = build_references(&sources, &entities, &rels, None);
        assert_eq!(refs.len(), 3);
        assert_eq!((refs[0].index, refs[0].ref_type.as_str()), (1, "entry"));
        assert_eq!((refs[1].index, refs[1].ref_type.as_str()), (2, "entity"));
        assert_eq!((refs[2].index, refs[2].ref_type.as_str()), (3, "rel"));
    }

    #[tokio::test]
    async fn query_caches_and_marks_cache_hits() {
        let store = Store::open_in_memory().unwrap();
        let engine = FakeEngine {
            answer: "the answer".into(),
            chunks: vec![chunk(ENTRY, ENTRY, serde_json::json!("0.9"))],
            ..Default::default()
        };
        let service = service_with_engine(engine, store);

        let first = service.query("q", QueryMode::Mix, 10).await.unwrap();
        assert!(!first.metadata.cache_hit);
        assert_eq!(first.answer, "the answer");
        assert_eq!(first.sources[0].score, Some(0.9));
        assert_eq!(first.sources[0].kind, Some(SourceKind::Entry));

        let second = service.query("q", QueryMode::Mix, 10).await.unwrap();
        assert!(second.metadata.cache_hit);
        assert_eq!(second.metadata.latency_ms, 0);
    }

    #[tokio::test]
    async fn disabled_service_reports_feature_disabled() {
        let store = Store::open_in_memory().unwrap();
        let runtime = RagRuntime::start(Box::new(|| Ok(StdArc::new(FakeEngine::default()) as _)));
        let service = RetrievalService::new(store, runtime, RagConfig::default());
        assert!(matches!(
            service.query("q", QueryMode::Mix, 5).await,
            Err(RagError::NotEnabled)
        ));
    }

    #[tokio::test]
    async fn graph_label_validation_rejects_junk() {
        let store = Store::open_in_memory().unwrap();
        let service = service_with_engine(FakeEngine::default(), store);
        assert!(matches!(
            service.get_graph_data("drop table;", 3, 100).await,
            Err(RagError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn graph_data_resolves_entry_titles() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "My note", "x")).unwrap();

        let engine = FakeEngine {
            graph: KnowledgeGraph {
                nodes: vec![KgNode {
                    id: "n1".into(),
                    labels: vec!["Concept".into()],
                    properties: [(
                        "file_path".to_string(),
                        serde_json::json!(entry.id.clone()),
                    )]
                    .into_iter()
                    .collect(),
                }],
                edges: vec![],
            },
            ..Default::default()
        };
        let service = service_with_engine(engine, store);
        let data = service.get_graph_data("*", 3, 1000).await.unwrap();
        assert_eq!(data.nodes[0].entry_id.as_deref(), Some(entry.id.as_str()));
        assert_eq!(data.nodes[0].entry_title.as_deref(), Some("My note"));
    }

    #[tokio::test]
    async fn recommendations_filter_score_self_and_deleted() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let source = store.create_entry(&entry_input("t1", "Source", "x")).unwrap();
        let target = store.create_entry(&entry_input("t1", "Target", "y")).unwrap();

        // Candidates: the target, the source itself, and a ghost id.
        let ghost = "11111111-2222-4333-8444-555555555555";
        let answer = format!(
            r#"[{{"entryId": "{t}", "relevance": 0.8}},
                {{"entryId": "{s}", "relevance": 0.95}},
                {{"entryId": "{g}", "relevance": 0.9}},
                {{"entryId": "{t2}", "relevance": 0.1}}]"#,
            t = target.id,
            s = source.id,
            g = ghost,
            t2 = target.id
        );
        let engine = FakeEngine {
            answer,
            chunks: vec![
                chunk(&target.id, &target.id, serde_json::json!(0.8)),
                chunk(&source.id, &source.id, serde_json::json!(0.9)),
                chunk(ghost, ghost, serde_json::json!(0.9)),
            ],
            ..Default::default()
        };
        let service = service_with_engine(engine, store);

        let recs = service
            .recommend_entry_relations(&source.id, QueryMode::Mix, 10, 0.1, false, false)
            .await
            .unwrap();
        // Ghost does not exist, source is self, 0.1 is below the 0.30 floor.
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].target_entry_id, target.id);
        assert_eq!(recs[0].score, 0.8);
    }

    #[tokio::test]
    async fn recommendation_limit_is_validated() {
        let store = Store::open_in_memory().unwrap();
        let service = service_with_engine(FakeEngine::default(), store);
        assert!(matches!(
            service
                .recommend_entry_relations("e", QueryMode::Mix, 0, 0.1, false, false)
                .await,
            Err(RagError::Validation(_))
        ));
        assert!(matches!(
            service
                .recommend_entry_relations("e", QueryMode::Mix, 101, 0.1, false, false)
                .await,
            Err(RagError::Validation(_))
        ));
    }
}
