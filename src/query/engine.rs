//! The retrieval-augmented answer flow: embed -> retrieve -> prompt -> generate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::conversation::ConversationManager;
use super::prompt::{build_prompt, PromptInput};
use super::validate_query;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::knowledge::{EmbeddingService, RetrievalStrategy, Retriever};
use crate::llm::{ChatMessage, ChatOptions, LlmClient, LlmError, Role};
use crate::store::{AgentWorkspace, ConversationMessage, SharedStore};
use crate::workspaces::Workspaces;

const ANSWER_TEMPERATURE: f64 = 0.3;
const ANSWER_MAX_TOKENS: u64 = 1024;

/// One generated answer and how its context was found.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedAnswer {
    pub text: String,
    pub strategy: RetrievalStrategy,
    /// Distinct source files of the chunks in the prompt, best match first
    pub sources: Vec<String>,
    pub chunks_used: usize,
}

/// Result of a local query, persisted in a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub response: String,
    pub conversation_id: Uuid,
    pub mindop_id: Uuid,
    pub retrieval: RetrievalStrategy,
    pub sources: Vec<String>,
}

#[derive(Clone)]
pub struct QueryEngine {
    workspaces: Workspaces,
    conversations: ConversationManager,
    embeddings: EmbeddingService,
    retriever: Retriever,
    llm: Arc<dyn LlmClient>,
    chat_model: String,
    timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        store: SharedStore,
        embeddings: EmbeddingService,
        llm: Arc<dyn LlmClient>,
        config: &Config,
    ) -> Self {
        Self {
            workspaces: Workspaces::new(store.clone()),
            conversations: ConversationManager::new(store.clone(), config.query.history_messages),
            embeddings,
            retriever: Retriever::from_config(store, &config.query),
            llm,
            chat_model: config.models.chat_model.clone(),
            timeout: config.query.timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workspaces(&self) -> &Workspaces {
        &self.workspaces
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    /// Run `flow` under the interactive wall-clock budget.
    pub async fn bounded<T, F>(&self, flow: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match tokio::time::timeout(self.timeout, flow).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Query exceeded {:?}; abandoning", self.timeout);
                Err(AppError::Timeout(self.timeout))
            }
        }
    }

    /// Answer `query` from `workspace`'s chunks. Writes nothing.
    pub async fn generate_answer(
        &self,
        workspace: &AgentWorkspace,
        query: &str,
        history: &[ConversationMessage],
    ) -> AppResult<GeneratedAnswer> {
        let query_embedding = self
            .embeddings
            .embed_query(query)
            .await
            .map_err(AppError::Embedding)?;

        let retrieval = self.retriever.retrieve(workspace.id, &query_embedding).await?;
        tracing::debug!(
            "Workspace {} retrieval: {:?}, {} chunks",
            workspace.id,
            retrieval.strategy,
            retrieval.chunks.len()
        );

        let prompt = build_prompt(PromptInput {
            agent_name: &workspace.name,
            query,
            chunks: &retrieval.chunks,
            history,
        });

        let response = self
            .llm
            .chat_completion(
                &self.chat_model,
                &[ChatMessage::new(Role::User, prompt)],
                ChatOptions {
                    temperature: Some(ANSWER_TEMPERATURE),
                    max_tokens: Some(ANSWER_MAX_TOKENS),
                },
            )
            .await
            .map_err(|e| {
                tracing::error!("Generation failed for workspace {}: {}", workspace.id, e);
                AppError::Generation(e)
            })?;

        let text = response
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                AppError::Generation(LlmError::parse_error(
                    "Model returned an empty answer".to_string(),
                ))
            })?;

        let mut sources: Vec<String> = Vec::new();
        for chunk in &retrieval.chunks {
            if !sources.contains(&chunk.source_file_name) {
                sources.push(chunk.source_file_name.clone());
            }
        }

        Ok(GeneratedAnswer {
            text,
            strategy: retrieval.strategy,
            sources,
            chunks_used: retrieval.chunks.len(),
        })
    }

    /// Answer a question against the caller's own workspace and persist the
    /// exchange. Bounded by the query timeout.
    pub async fn ask(
        &self,
        user_id: &str,
        query: &str,
        mindop_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> AppResult<QueryAnswer> {
        let query = validate_query(query)?;
        self.bounded(self.ask_inner(user_id, query, mindop_id, conversation_id))
            .await
    }

    async fn ask_inner(
        &self,
        user_id: &str,
        query: &str,
        mindop_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
    ) -> AppResult<QueryAnswer> {
        let workspace = self.workspaces.resolve_owned(user_id, mindop_id).await?;

        let existing = match conversation_id {
            Some(id) => Some(self.conversations.load_owned(user_id, id).await?),
            None => None,
        };
        let history = match &existing {
            Some(conversation) => self.conversations.history(conversation.id).await?,
            None => Vec::new(),
        };

        let answer = self.generate_answer(&workspace, query, &history).await?;

        let conversation = self
            .conversations
            .ensure(existing, user_id, workspace.id, query)
            .await?;
        self.conversations
            .record_exchange(conversation.id, query, &answer.text, workspace.id)
            .await?;

        tracing::info!(
            "Answered query in conversation {} ({:?}, {} chunks)",
            conversation.id,
            answer.strategy,
            answer.chunks_used
        );

        Ok(QueryAnswer {
            response: answer.text,
            conversation_id: conversation.id,
            mindop_id: workspace.id,
            retrieval: answer.strategy,
            sources: answer.sources,
        })
    }
}
