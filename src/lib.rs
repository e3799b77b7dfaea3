//! # MindOp
//!
//! Personal knowledge agents over tabular data.
//!
//! Each user owns one agent workspace. Uploaded spreadsheets are flattened,
//! chunked and embedded into a chunk store; questions are answered from the
//! most similar chunks (or the newest ones when similarity search is
//! unavailable). Workspaces can follow each other and, once approved, ask
//! one another questions either inline or through a queued task.
//!
//! ## Task Flow
//! 1. Requester submits a question for a followed workspace
//! 2. A `pending` task is stored and the requester-side poller starts
//! 3. The target processes it: `processing` -> `complete` | `failed`
//! 4. The poller surfaces the answer into the requester's conversation
//!
//! ## Modules
//! - `knowledge`: tabular parsing, chunking, embeddings, retrieval
//! - `query`: prompt assembly, conversations, the bounded answer flow
//! - `collab`: follows, collaboration tasks, poller and background worker
//! - `store`: persistence behind one trait (memory, SQLite, Supabase)
//! - `api`: HTTP surface

pub mod api;
pub mod collab;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod query;
pub mod store;
pub mod util;
pub mod workspaces;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{AppError, AppResult};
