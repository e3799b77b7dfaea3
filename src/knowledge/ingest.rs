//! Ingestion pipeline: parse -> chunk -> embed -> store.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::chunker::RecursiveChunker;
use super::embed::EmbeddingService;
use super::tabular::{parse_tabular, TabularFormat};
use crate::error::{AppError, AppResult};
use crate::store::{AgentWorkspace, ChunkMetadata, DocumentChunk, SharedStore, SourceFileSummary};

/// Summary of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub source_file_name: String,
    pub documents_processed: usize,
    pub chunks_created: usize,
    pub zero_vector_fallbacks: usize,
    /// Chunks already stored under this source name before the run
    pub previously_ingested_chunks: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    store: SharedStore,
    embeddings: EmbeddingService,
    chunker: RecursiveChunker,
}

impl Ingestor {
    pub fn new(
        store: SharedStore,
        embeddings: EmbeddingService,
        chunker: RecursiveChunker,
    ) -> Self {
        Self {
            store,
            embeddings,
            chunker,
        }
    }

    /// Ingest one uploaded tabular file into `workspace`.
    ///
    /// Validation (file type, empty content) happens before any embedding
    /// call; nothing is written when it fails.
    pub async fn ingest(
        &self,
        workspace: &AgentWorkspace,
        file_name: &str,
        bytes: &[u8],
    ) -> AppResult<IngestReport> {
        let source_file_name = source_name(file_name)?;
        TabularFormat::from_file_name(&source_file_name)?;
        let documents = parse_tabular(&source_file_name, bytes)?;

        // (text, metadata) per chunk, in document order
        let mut pending: Vec<(String, ChunkMetadata)> = Vec::new();
        for document in &documents {
            let pieces = self.chunker.split(&document.text);
            let total_chunks = pieces.len();
            for (chunk_index, content) in pieces.into_iter().enumerate() {
                pending.push((
                    content,
                    ChunkMetadata {
                        chunk_index,
                        total_chunks,
                        sheet_name: document.sheet_name.clone(),
                        strategy: self.chunker.strategy(),
                    },
                ));
            }
        }
        if pending.is_empty() {
            return Err(AppError::validation(format!(
                "{} has no content to ingest",
                source_file_name
            )));
        }

        let previously_ingested_chunks = self
            .store
            .count_chunks_for_source(workspace.id, &source_file_name)
            .await?;
        if previously_ingested_chunks > 0 {
            tracing::warn!(
                "Workspace {} already holds {} chunks from {}; new chunks are appended",
                workspace.id,
                previously_ingested_chunks,
                source_file_name
            );
        }

        tracing::info!(
            "Ingesting {} into workspace {}: {} documents, {} chunks",
            source_file_name,
            workspace.id,
            documents.len(),
            pending.len()
        );

        let texts: Vec<String> = pending.iter().map(|(text, _)| text.clone()).collect();
        let embedded = self.embeddings.embed_chunks(&texts).await;

        let created_at = Utc::now();
        let chunks: Vec<DocumentChunk> = pending
            .into_iter()
            .zip(embedded.embeddings)
            .map(|((content, metadata), embedding)| DocumentChunk {
                id: Uuid::new_v4(),
                workspace_id: workspace.id,
                content,
                embedding,
                source_file_name: source_file_name.clone(),
                created_at,
                metadata: Some(metadata),
            })
            .collect();

        let chunks_created = self.store.insert_chunks(&chunks).await?;

        tracing::info!(
            "Ingested {}: {} chunks stored ({} zero-vector fallbacks)",
            source_file_name,
            chunks_created,
            embedded.zero_vector_fallbacks
        );

        Ok(IngestReport {
            source_file_name,
            documents_processed: documents.len(),
            chunks_created,
            zero_vector_fallbacks: embedded.zero_vector_fallbacks,
            previously_ingested_chunks,
        })
    }

    /// Delete every chunk ingested from `source_file_name`.
    ///
    /// The caller must already have checked workspace ownership.
    pub async fn delete_source(
        &self,
        workspace: &AgentWorkspace,
        source_file_name: &str,
    ) -> AppResult<usize> {
        if source_file_name.trim().is_empty() {
            return Err(AppError::validation("source_csv_name is required"));
        }
        let deleted = self
            .store
            .delete_chunks_by_source(workspace.id, source_file_name)
            .await?;
        if deleted == 0 {
            return Err(AppError::not_found(format!(
                "chunks for {} in workspace {}",
                source_file_name, workspace.id
            )));
        }
        tracing::info!(
            "Deleted {} chunks of {} from workspace {}",
            deleted,
            source_file_name,
            workspace.id
        );
        Ok(deleted)
    }

    pub async fn list_sources(
        &self,
        workspace: &AgentWorkspace,
    ) -> AppResult<Vec<SourceFileSummary>> {
        Ok(self.store.list_sources(workspace.id).await?)
    }
}

/// The file name recorded on chunks: the upload's base name.
fn source_name(file_name: &str) -> AppResult<String> {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .trim();
    if base.is_empty() {
        return Err(AppError::validation("A file name is required"));
    }
    Ok(base.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::IngestConfig;
    use crate::knowledge::embed::Embedder;
    use crate::llm::RetryPolicy;
    use crate::store::{ChunkStore, InMemoryStore};
    use crate::testing::{FakeEmbedder, FlakyEmbedder};

    fn ingestor(store: Arc<InMemoryStore>, embedder: Arc<dyn Embedder>, size: usize) -> Ingestor {
        let embeddings =
            EmbeddingService::new(embedder, RetryPolicy::immediate(1), 5, Duration::ZERO);
        Ingestor::new(store, embeddings, RecursiveChunker::new(size, size / 5, 5))
    }

    #[tokio::test]
    async fn three_short_rows_make_one_chunk() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(FakeEmbedder::new(32));
        let ws = AgentWorkspace::new("alice", "A");
        let csv = "product,units\nbolts,40\nnuts,75\nwashers,12\n";

        let report = ingestor(store.clone(), embedder.clone(), 500)
            .ingest(&ws, "stock.csv", csv.as_bytes())
            .await
            .unwrap();

        assert_eq!(report.chunks_created, 1);
        assert_eq!(report.documents_processed, 1);
        assert_eq!(report.source_file_name, "stock.csv");
        assert_eq!(report.zero_vector_fallbacks, 0);

        let stored = store.recent_chunks(ws.id, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        for row in ["bolts", "nuts", "washers"] {
            assert!(stored[0].content.contains(row));
        }
        let metadata = stored[0].metadata.clone().unwrap();
        assert_eq!((metadata.chunk_index, metadata.total_chunks), (0, 1));
    }

    #[tokio::test]
    async fn large_file_makes_bounded_overlapping_chunks() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(FakeEmbedder::new(32));
        let ws = AgentWorkspace::new("alice", "A");
        let mut csv = String::from("region,product,revenue\n");
        for i in 0..60 {
            csv.push_str(&format!("R{:02},widget-{},{}\n", i, i % 7, i * 113));
        }

        let report = ingestor(store.clone(), embedder, 100)
            .ingest(&ws, "sales.csv", csv.as_bytes())
            .await
            .unwrap();
        assert!(report.chunks_created >= 3);

        let mut stored = store.recent_chunks(ws.id, 100).await.unwrap();
        stored.sort_by_key(|c| c.metadata.as_ref().map(|m| m.chunk_index));
        for pair in stored.windows(2) {
            let opener = pair[1].content.lines().next().unwrap();
            assert!(pair[0].content.contains(opener));
        }
        assert!(stored
            .iter()
            .all(|c| crate::knowledge::estimate_tokens(&c.content) <= 100));
    }

    #[tokio::test]
    async fn wide_rows_overlap_under_default_chunking() {
        let store = Arc::new(InMemoryStore::new());
        let embeddings = EmbeddingService::new(
            Arc::new(FakeEmbedder::new(16)),
            RetryPolicy::immediate(1),
            5,
            Duration::ZERO,
        );
        let chunker = RecursiveChunker::from_config(&IngestConfig::default());
        let ingestor = Ingestor::new(store.clone(), embeddings, chunker);
        let ws = AgentWorkspace::new("alice", "A");

        let headers: Vec<String> = (0..10).map(|c| format!("metric_{}", c)).collect();
        let mut csv = headers.join(",") + "\n";
        for i in 0..40 {
            let row: Vec<String> = (0..10)
                .map(|c| format!("measurement {:03}.{:02}", i, c))
                .collect();
            csv.push_str(&row.join(","));
            csv.push('\n');
        }

        let report = ingestor
            .ingest(&ws, "metrics.csv", csv.as_bytes())
            .await
            .unwrap();
        assert!(report.chunks_created >= 3);

        let mut stored = store.recent_chunks(ws.id, 100).await.unwrap();
        stored.sort_by_key(|c| c.metadata.as_ref().map(|m| m.chunk_index));
        for pair in stored.windows(2) {
            let opening_cell = pair[1].content.split(" | ").next().unwrap();
            assert!(
                pair[0].content.contains(opening_cell),
                "chunk opens with {:?}, which its predecessor lacks",
                opening_cell
            );
        }
    }

    #[tokio::test]
    async fn unsupported_type_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(FakeEmbedder::new(8));
        let ws = AgentWorkspace::new("alice", "A");
        let err = ingestor(store.clone(), embedder.clone(), 500)
            .ingest(&ws, "notes.pdf", b"%PDF")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert_eq!(embedder.calls(), 0);
        assert_eq!(store.count_chunks(ws.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn embedding_outage_degrades_to_zero_vectors() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(FlakyEmbedder::failing_first(8, usize::MAX));
        let ws = AgentWorkspace::new("alice", "A");
        let report = ingestor(store.clone(), embedder, 500)
            .ingest(&ws, "a.csv", b"k,v\nx,1\n")
            .await
            .unwrap();
        assert_eq!(report.chunks_created, 1);
        assert_eq!(report.zero_vector_fallbacks, 1);
    }

    #[tokio::test]
    async fn reingestion_appends_and_delete_removes_all() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(FakeEmbedder::new(8));
        let ws = AgentWorkspace::new("alice", "A");
        let ingestor = ingestor(store.clone(), embedder, 500);
        let csv = b"k,v\nx,1\ny,2\n";

        ingestor.ingest(&ws, "uploads/a.csv", csv).await.unwrap();
        let second = ingestor.ingest(&ws, "a.csv", csv).await.unwrap();
        assert_eq!(second.previously_ingested_chunks, 1);
        assert_eq!(store.count_chunks(ws.id).await.unwrap(), 2);

        let sources = ingestor.list_sources(&ws).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].chunk_count, 2);

        assert_eq!(ingestor.delete_source(&ws, "a.csv").await.unwrap(), 2);
        let err = ingestor.delete_source(&ws, "a.csv").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn source_name_strips_directories() {
        assert_eq!(source_name("C:\\exports\\q3.csv").unwrap(), "q3.csv");
        assert_eq!(source_name("dir/sub/x.tsv").unwrap(), "x.tsv");
        assert!(source_name("dir/").is_err());
    }
}
