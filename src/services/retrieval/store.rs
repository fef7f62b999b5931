//! Document store contract and the local JSONL-backed implementation.
//!
//! The external vector store is consumed through `VectorStore`; when it is
//! unreachable (or embeddings are absent) the retriever degrades to local
//! corpora + BM25, which the local store serves directly.

use async_trait::async_trait;
use std::sync::Arc;

use crate::models::{Doc, DocKind};
use crate::services::llm::LlmError;
use crate::services::metadata::MetadataCache;
use crate::utils::ApiResult;

/// `VectorSearch(embedding, k, filter)` / `ListDocuments(filter, limit)`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn vector_search(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<DocKind>,
    ) -> ApiResult<Vec<(Doc, f64)>>;

    async fn list_documents(&self, filter: Option<DocKind>, limit: usize) -> ApiResult<Vec<Doc>>;
}

/// Query embedding provider. `None` means dense scoring is unavailable and
/// lexical retrieval carries the request alone.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, LlmError>;
}

/// Embedder used when no provider is configured.
pub struct NoopEmbedder;

#[async_trait]
impl Embedder for NoopEmbedder {
    async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>, LlmError> {
        Ok(None)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Local store over the metadata cache's JSONL corpora.
pub struct LocalDocStore {
    cache: Arc<MetadataCache>,
}

impl LocalDocStore {
    pub fn new(cache: Arc<MetadataCache>) -> Self {
        Self { cache }
    }

    fn docs_for(&self, filter: Option<DocKind>) -> Vec<Doc> {
        match filter {
            Some(kind) => self.cache.docs(kind).as_ref().clone(),
            None => DocKind::ALL
                .iter()
                .flat_map(|kind| self.cache.docs(*kind).as_ref().clone())
                .collect(),
        }
    }
}

#[async_trait]
impl VectorStore for LocalDocStore {
    async fn vector_search(
        &self,
        embedding: &[f32],
        k: usize,
        filter: Option<DocKind>,
    ) -> ApiResult<Vec<(Doc, f64)>> {
        let mut scored: Vec<(Doc, f64)> = self
            .docs_for(filter)
            .into_iter()
            .filter_map(|doc| {
                let score = doc.embedding.as_ref().map(|e| cosine(embedding, e))?;
                (score > 0.0).then_some((doc, score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn list_documents(&self, filter: Option<DocKind>, limit: usize) -> ApiResult<Vec<Doc>> {
        let mut docs = self.docs_for(filter);
        docs.truncate(limit);
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0, 0.0], &[1.0]), 0.0);
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
    }
}
