//! Rerank client: standard and Aliyun request formats, normalised to
//! `[{index, relevance_score}]`, with optional local chunking that
//! aggregates chunk scores back to the original documents by max.

use serde::Serialize;
use tracing::{debug, warn};

use atlas_core::config::RerankSettings;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f64,
}

pub struct RerankClient {
    client: reqwest::Client,
    cfg: RerankSettings,
}

impl RerankClient {
    pub fn new(cfg: RerankSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }

    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: Option<usize>,
    ) -> Result<Vec<RerankResult>, LlmError> {
        let q = query.trim();
        if q.is_empty() || documents.is_empty() {
            return Ok(Vec::new());
        }

        let (docs_sent, doc_indices, api_top_n) = if self.cfg.enable_chunking {
            let (chunks, indices) =
                chunk_documents(documents, self.cfg.max_tokens_per_doc.max(1), 32);
            // API-level top_n would drop chunks, not documents; disable it.
            (chunks, Some(indices), None)
        } else {
            (documents.to_vec(), None, top_n)
        };

        debug!(
            model = %self.cfg.model,
            docs = documents.len(),
            docs_sent = docs_sent.len(),
            format = %self.cfg.request_format,
            "rerank call"
        );

        let body = build_request_body(&self.cfg, q, &docs_sent, api_top_n);
        let mut request = self
            .client
            .post(&self.cfg.host)
            .header("content-type", "application/json")
            .timeout(std::time::Duration::from_secs_f64(
                if self.cfg.timeout_sec > 0.0 {
                    self.cfg.timeout_sec
                } else {
                    15.0
                },
            ));
        if !self.cfg.key.trim().is_empty() {
            request = request.bearer_auth(self.cfg.key.trim());
        }

        let resp = request.json(&body).send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "rerank API error");
            return Err(LlmError::Api {
                status,
                message: text,
            });
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        let mut results = normalize_results(extract_results_payload(&data));

        if let Some(indices) = doc_indices {
            results = aggregate_chunk_scores(&results, &indices, documents.len());
            if let Some(n) = top_n {
                results.truncate(n);
            }
        }
        Ok(results)
    }
}

fn build_request_body(
    cfg: &RerankSettings,
    query: &str,
    documents: &[String],
    top_n: Option<usize>,
) -> serde_json::Value {
    if cfg.request_format.trim().eq_ignore_ascii_case("aliyun") {
        let mut parameters = serde_json::json!({ "return_documents": false });
        if let Some(n) = top_n {
            parameters["top_n"] = serde_json::json!(n);
        }
        serde_json::json!({
            "model": cfg.model,
            "input": { "query": query, "documents": documents },
            "parameters": parameters,
        })
    } else {
        let mut body = serde_json::json!({
            "model": cfg.model,
            "query": query,
            "documents": documents,
        });
        if let Some(n) = top_n {
            body["top_n"] = serde_json::json!(n);
        }
        body
    }
}

/// Providers disagree on where the list lives: `results`,
/// `output.results` (Aliyun), or `data` (some proxies).
fn extract_results_payload(data: &serde_json::Value) -> Option<&serde_json::Value> {
    data.get("results")
        .or_else(|| data.get("output").and_then(|o| o.get("results")))
        .or_else(|| data.get("data"))
}

fn normalize_results(payload: Option<&serde_json::Value>) -> Vec<RerankResult> {
    let Some(items) = payload.and_then(|p| p.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let idx = item
                .get("index")
                .or_else(|| item.get("document_index"))?
                .as_u64()? as usize;
            let score = item
                .get("relevance_score")
                .or_else(|| item.get("score"))
                .or_else(|| item.get("relevanceScore"))?
                .as_f64()?;
            Some(RerankResult {
                index: idx,
                relevance_score: score,
            })
        })
        .collect()
}

/// Split long documents into overlapping chunks, 4 chars ≈ 1 token.
fn chunk_documents(
    documents: &[String],
    max_tokens: usize,
    overlap_tokens: usize,
) -> (Vec<String>, Vec<usize>) {
    let max_chars = max_tokens.max(1) * 4;
    let overlap_chars = overlap_tokens.min(max_tokens.saturating_sub(1)) * 4;

    let mut chunks = Vec::new();
    let mut indices = Vec::new();
    for (idx, doc) in documents.iter().enumerate() {
        let chars: Vec<char> = doc.chars().collect();
        if chars.len() <= max_chars {
            chunks.push(doc.clone());
            indices.push(idx);
            continue;
        }
        let mut start = 0usize;
        loop {
            let end = (start + max_chars).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            indices.push(idx);
            if end >= chars.len() {
                break;
            }
            start = end.saturating_sub(overlap_chars);
        }
    }
    (chunks, indices)
}

/// Max-wins aggregation of chunk scores back onto original documents.
fn aggregate_chunk_scores(
    chunk_results: &[RerankResult],
    doc_indices: &[usize],
    num_original_docs: usize,
) -> Vec<RerankResult> {
    let mut scores = vec![0.0f64; num_original_docs];
    for r in chunk_results {
        if let Some(&orig) = doc_indices.get(r.index) {
            if orig < num_original_docs {
                scores[orig] = scores[orig].max(r.relevance_score);
            }
        }
    }
    let mut out: Vec<RerankResult> = scores
        .into_iter()
        .enumerate()
        .filter(|(_, s)| *s > 0.0)
        .map(|(index, relevance_score)| RerankResult {
            index,
            relevance_score,
        })
        .collect();
    out.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(format: &str) -> RerankSettings {
        RerankSettings {
            model: "rerank-1".into(),
            host: "https://rerank.example.com".into(),
            key: String::new(),
            timeout_sec: 15.0,
            request_format: format.into(),
            enable_chunking: false,
            max_tokens_per_doc: 480,
            min_score: 0.0,
        }
    }

    #[test]
    fn standard_and_aliyun_bodies_differ() {
        let docs = vec!["a".to_string()];
        let std_body = build_request_body(&settings("standard"), "q", &docs, Some(3));
        assert_eq!(std_body["top_n"], 3);
        assert_eq!(std_body["query"], "q");

        let ali_body = build_request_body(&settings("aliyun"), "q", &docs, Some(3));
        assert_eq!(ali_body["input"]["query"], "q");
        assert_eq!(ali_body["parameters"]["top_n"], 3);
        assert_eq!(ali_body["parameters"]["return_documents"], false);
    }

    #[test]
    fn normalizes_alternate_field_names() {
        let payload = serde_json::json!([
            {"index": 1, "relevance_score": 0.9},
            {"document_index": 0, "score": 0.5},
            {"index": "bad"},
        ]);
        let results = normalize_results(Some(&payload));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 1);
        assert_eq!(results[1].relevance_score, 0.5);
    }

    #[test]
    fn chunk_scores_aggregate_by_max() {
        // Two chunks of doc 0, one of doc 1.
        let indices = vec![0, 0, 1];
        let chunk_results = vec![
            RerankResult { index: 0, relevance_score: 0.2 },
            RerankResult { index: 1, relevance_score: 0.8 },
            RerankResult { index: 2, relevance_score: 0.5 },
        ];
        let out = aggregate_chunk_scores(&chunk_results, &indices, 2);
        assert_eq!(out[0], RerankResult { index: 0, relevance_score: 0.8 });
        assert_eq!(out[1], RerankResult { index: 1, relevance_score: 0.5 });
    }

    #[test]
    fn long_documents_are_chunked_with_overlap() {
        let doc = "x".repeat(5000);
        let (chunks, indices) = chunk_documents(&[doc], 480, 32);
        assert!(chunks.len() > 2);
        assert!(indices.iter().all(|&i| i == 0));
        assert!(chunks.iter().all(|c| c.chars().count() <= 480 * 4));
    }
}
