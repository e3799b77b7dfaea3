//! Deterministic fakes for tests: embedders, a scripted chat model, and a
//! fully wired engine over [`InMemoryStore`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::collab::{CollaborationEngine, TaskPoller};
use crate::config::Config;
use crate::knowledge::{Embedder, EmbeddingService, IngestReport, Ingestor, RecursiveChunker};
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, RetryPolicy};
use crate::query::{ConversationManager, QueryEngine};
use crate::store::{AgentWorkspace, DocumentChunk, InMemoryStore};

/// Bag-of-words hashing embedder: texts sharing words get similar vectors.
pub struct FakeEmbedder {
    dimension: usize,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            calls: AtomicUsize::new(0),
        }
    }

    /// The vector this embedder returns for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = fnv1a(word.to_lowercase().as_bytes()) as usize % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    /// Number of `embed_batch` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Embedder that fails on demand.
pub struct FlakyEmbedder {
    inner: FakeEmbedder,
    /// Any call containing a text with this substring fails
    poison: Option<String>,
    /// The first `fail_first` calls are rate limited
    fail_first: usize,
    calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn poisoned(dimension: usize, poison: &str) -> Self {
        Self {
            inner: FakeEmbedder::new(dimension),
            poison: Some(poison.to_string()),
            fail_first: 0,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_first(dimension: usize, fail_first: usize) -> Self {
        Self {
            inner: FakeEmbedder::new(dimension),
            poison: None,
            fail_first,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(LlmError::rate_limited("slow down".to_string(), None));
        }
        if let Some(poison) = &self.poison {
            if texts.iter().any(|t| t.contains(poison.as_str())) {
                return Err(LlmError::server_error(500, "poisoned input".to_string()));
            }
        }
        self.inner.embed_batch(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// A chunk with a hand-picked embedding.
pub fn chunk_with_embedding(
    workspace_id: Uuid,
    content: &str,
    embedding: Vec<f32>,
) -> DocumentChunk {
    DocumentChunk {
        id: Uuid::new_v4(),
        workspace_id,
        content: content.to_string(),
        embedding,
        source_file_name: "test.csv".to_string(),
        created_at: Utc::now(),
        metadata: None,
    }
}

enum Scripted {
    Text(String),
    Error(LlmError),
    Panic,
}

/// Chat model that replays queued replies and records every prompt.
///
/// With nothing queued it answers with [`ScriptedLlm::DEFAULT_ANSWER`].
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Scripted>>,
    prompts: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub const DEFAULT_ANSWER: &'static str = "Scripted answer.";

    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push_text(&self, text: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Text(text.to_string()));
    }

    pub fn push_error(&self, error: LlmError) {
        self.script.lock().unwrap().push_back(Scripted::Error(error));
    }

    pub fn push_panic(&self) {
        self.script.lock().unwrap().push_back(Scripted::Panic);
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(prompt);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        let text = match next {
            Some(Scripted::Text(text)) => text,
            Some(Scripted::Error(error)) => return Err(error),
            Some(Scripted::Panic) => panic!("scripted model panic"),
            None => Self::DEFAULT_ANSWER.to_string(),
        };
        Ok(ChatResponse {
            content: Some(text),
            finish_reason: Some("stop".to_string()),
            usage: None,
            model: Some(model.to_string()),
        })
    }
}

/// Every engine wired over one in-memory store.
pub struct Harness {
    pub config: Config,
    pub store: Arc<InMemoryStore>,
    pub embedder: Arc<FakeEmbedder>,
    pub llm: Arc<ScriptedLlm>,
    pub ingestor: Ingestor,
    pub query: QueryEngine,
    pub collab: CollaborationEngine,
}

impl Harness {
    /// Must be called inside a Tokio runtime (the poller is spawned).
    pub fn new() -> Self {
        let config = Config::for_tests();
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(FakeEmbedder::new(config.models.embed_dimension));
        let llm = Arc::new(ScriptedLlm::new());

        let embeddings = EmbeddingService::from_config(embedder.clone(), &config.ingest)
            .with_retry_policy(RetryPolicy::immediate(1));
        let ingestor = Ingestor::new(
            store.clone(),
            embeddings.clone(),
            RecursiveChunker::from_config(&config.ingest),
        );
        let query = QueryEngine::new(store.clone(), embeddings, llm.clone(), &config);
        let poller = TaskPoller::spawn(
            store.clone(),
            ConversationManager::new(store.clone(), config.query.history_messages),
            config.collab.poll_interval,
        );
        let collab = CollaborationEngine::new(
            store.clone(),
            query.clone(),
            poller,
            config.collab.task_batch_size,
        );

        Self {
            config,
            store,
            embedder,
            llm,
            ingestor,
            query,
            collab,
        }
    }

    /// Ingest CSV text into `workspace`.
    pub async fn ingest(
        &self,
        workspace: &AgentWorkspace,
        file_name: &str,
        csv: &str,
    ) -> IngestReport {
        self.ingestor
            .ingest(workspace, file_name, csv.as_bytes())
            .await
            .unwrap()
    }
}
