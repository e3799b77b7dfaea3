//! Knowledge base: tabular ingestion, embeddings, and chunk retrieval.
//!
//! Ingestion runs parse -> chunk -> embed -> store as one sequential loop;
//! embeddings are requested in small paced batches so a single upload stays
//! under provider rate limits.

mod chunker;
mod embed;
mod ingest;
mod retriever;
mod tabular;

pub use chunker::{estimate_tokens, RecursiveChunker, CHARS_PER_TOKEN};
pub use embed::{EmbeddedChunks, Embedder, EmbeddingClient, EmbeddingService};
pub use ingest::{IngestReport, Ingestor};
pub use retriever::{Retrieval, RetrievalStrategy, Retriever};
pub use tabular::{parse_tabular, sanitize_cell, ParsedDocument, TabularFormat, MAX_UPLOAD_BYTES};
