//! Top-K chunk retrieval with a recency fallback.

use serde::Serialize;
use uuid::Uuid;

use crate::config::QueryConfig;
use crate::error::{AppError, AppResult};
use crate::store::{RetrievedChunk, SharedStore, StoreError};

/// Which path produced a retrieval result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// The workspace has no chunks; nothing was searched
    Empty,
    Similarity,
    /// Similarity search failed or is unavailable; newest chunks instead
    RecencyFallback,
}

#[derive(Debug, Clone)]
pub struct Retrieval {
    pub chunks: Vec<RetrievedChunk>,
    pub strategy: RetrievalStrategy,
}

#[derive(Clone)]
pub struct Retriever {
    store: SharedStore,
    top_k: usize,
    similarity_threshold: f64,
}

impl Retriever {
    pub fn new(store: SharedStore, top_k: usize, similarity_threshold: f64) -> Self {
        Self {
            store,
            top_k,
            similarity_threshold,
        }
    }

    pub fn from_config(store: SharedStore, config: &QueryConfig) -> Self {
        Self::new(store, config.top_k, config.similarity_threshold)
    }

    /// Up to `top_k` chunks of `workspace_id`, most relevant first.
    pub async fn retrieve(
        &self,
        workspace_id: Uuid,
        query_embedding: &[f32],
    ) -> AppResult<Retrieval> {
        let count = self
            .store
            .count_chunks(workspace_id)
            .await
            .map_err(|e| AppError::Retrieval(e.to_string()))?;
        if count == 0 {
            tracing::debug!("Workspace {} has no chunks; skipping search", workspace_id);
            return Ok(Retrieval {
                chunks: Vec::new(),
                strategy: RetrievalStrategy::Empty,
            });
        }

        if !self.store.supports_similarity() {
            return self.fallback(workspace_id, "similarity search unsupported").await;
        }

        match self
            .store
            .search_chunks(
                workspace_id,
                query_embedding,
                self.similarity_threshold,
                self.top_k,
            )
            .await
        {
            Ok(chunks) => {
                tracing::debug!(
                    "Similarity search returned {} chunks for workspace {}",
                    chunks.len(),
                    workspace_id
                );
                Ok(Retrieval {
                    chunks,
                    strategy: RetrievalStrategy::Similarity,
                })
            }
            Err(StoreError::Unsupported(what)) => self.fallback(workspace_id, what).await,
            Err(e) => {
                tracing::warn!("Similarity search failed, using recent chunks: {}", e);
                self.fallback(workspace_id, "similarity search failed").await
            }
        }
    }

    async fn fallback(&self, workspace_id: Uuid, reason: &str) -> AppResult<Retrieval> {
        tracing::info!(
            "Retrieval for workspace {} using recency fallback ({})",
            workspace_id,
            reason
        );
        let mut chunks = self
            .store
            .recent_chunks(workspace_id, self.top_k)
            .await
            .map_err(|e| AppError::Retrieval(e.to_string()))?;
        for (rank, chunk) in chunks.iter_mut().enumerate() {
            chunk.similarity = synthetic_score(rank);
        }
        Ok(Retrieval {
            chunks,
            strategy: RetrievalStrategy::RecencyFallback,
        })
    }
}

/// Strictly decreasing placeholder score for fallback ranks: 0.5, 0.33, 0.25...
fn synthetic_score(rank: usize) -> f64 {
    1.0 / (rank as f64 + 2.0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{ChunkStore, InMemoryStore};
    use crate::testing::chunk_with_embedding;

    #[tokio::test]
    async fn empty_workspace_skips_search() {
        // A store without similarity would error if searched
        let store = Arc::new(InMemoryStore::without_similarity());
        let retriever = Retriever::new(store, 5, 0.1);
        let result = retriever.retrieve(Uuid::new_v4(), &[1.0, 0.0]).await.unwrap();
        assert_eq!(result.strategy, RetrievalStrategy::Empty);
        assert!(result.chunks.is_empty());
    }

    #[tokio::test]
    async fn similarity_path_ranks_and_limits() {
        let store = Arc::new(InMemoryStore::new());
        let ws = Uuid::new_v4();
        store
            .insert_chunks(&[
                chunk_with_embedding(ws, "north", vec![1.0, 0.0]),
                chunk_with_embedding(ws, "mostly north", vec![0.8, 0.2]),
                chunk_with_embedding(ws, "east", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let retriever = Retriever::new(store, 2, 0.1);
        let result = retriever.retrieve(ws, &[1.0, 0.0]).await.unwrap();
        assert_eq!(result.strategy, RetrievalStrategy::Similarity);
        let contents: Vec<_> = result.chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["north", "mostly north"]);
    }

    #[tokio::test]
    async fn unsupported_similarity_falls_back_to_recency() {
        let store = Arc::new(InMemoryStore::without_similarity());
        let ws = Uuid::new_v4();
        for name in ["first", "second", "third"] {
            store
                .insert_chunks(&[chunk_with_embedding(ws, name, vec![1.0])])
                .await
                .unwrap();
        }

        let retriever = Retriever::new(store, 2, 0.1);
        let result = retriever.retrieve(ws, &[1.0]).await.unwrap();
        assert_eq!(result.strategy, RetrievalStrategy::RecencyFallback);
        assert_eq!(result.chunks.len(), 2);
        assert_eq!(result.chunks[0].content, "third");
        assert!(result.chunks[0].similarity > result.chunks[1].similarity);
    }

    #[tokio::test]
    async fn backend_search_error_falls_back_to_recency() {
        let store = Arc::new(InMemoryStore::with_failing_search("function missing"));
        assert!(store.supports_similarity());
        let ws = Uuid::new_v4();
        for name in ["first", "second", "third"] {
            store
                .insert_chunks(&[chunk_with_embedding(ws, name, vec![1.0])])
                .await
                .unwrap();
        }

        let retriever = Retriever::new(store, 3, 0.1);
        let result = retriever.retrieve(ws, &[1.0]).await.unwrap();
        assert_eq!(result.strategy, RetrievalStrategy::RecencyFallback);
        let contents: Vec<_> = result.chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["third", "second", "first"]);
        assert!(result
            .chunks
            .windows(2)
            .all(|w| w[0].similarity > w[1].similarity));
    }

    #[test]
    fn synthetic_scores_descend() {
        let scores: Vec<f64> = (0..5).map(synthetic_score).collect();
        assert!(scores.windows(2).all(|w| w[0] > w[1]));
        assert!(scores.iter().all(|s| *s > 0.0 && *s <= 1.0));
    }
}
