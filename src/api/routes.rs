//! Router, shared state, and server lifecycle.

use std::sync::Arc;

use axum::middleware;
use axum::{
    extract::{DefaultBodyLimit, State},
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::collab::{spawn_task_worker, CollaborationEngine, TaskPoller};
use crate::config::Config;
use crate::knowledge::{
    Embedder, EmbeddingClient, EmbeddingService, Ingestor, RecursiveChunker, MAX_UPLOAD_BYTES,
};
use crate::llm::{LlmClient, OpenRouterClient};
use crate::query::{ConversationManager, QueryEngine};
use crate::store::{create_store, SharedStore};
use crate::workspaces::Workspaces;

use super::auth;
use super::collaboration as collaboration_api;
use super::knowledge as knowledge_api;
use super::query as query_api;
use super::types::HealthResponse;

/// Multipart framing allowance on top of the file itself.
const UPLOAD_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub workspaces: Workspaces,
    pub ingestor: Ingestor,
    pub query: QueryEngine,
    pub collab: CollaborationEngine,
}

impl AppState {
    /// Wire every engine over `store`. Spawns the task poller, so this must
    /// run inside a Tokio runtime.
    pub fn new(
        config: Config,
        store: SharedStore,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let embeddings = EmbeddingService::from_config(embedder, &config.ingest);
        let ingestor = Ingestor::new(
            store.clone(),
            embeddings.clone(),
            RecursiveChunker::from_config(&config.ingest),
        );
        let query = QueryEngine::new(store.clone(), embeddings, llm, &config);
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
            workspaces: Workspaces::new(store),
            config,
            ingestor,
            query,
            collab,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let upload_route = Router::new()
        .route("/api/ingest", post(knowledge_api::ingest))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + UPLOAD_OVERHEAD_BYTES));

    let protected_routes = Router::new()
        // Query flow
        .route("/api/query", post(query_api::query))
        .route(
            "/api/conversations/:id/messages",
            get(query_api::conversation_messages),
        )
        // Knowledge base
        .merge(upload_route)
        .route(
            "/api/documents",
            get(knowledge_api::list_documents).delete(knowledge_api::delete_document),
        )
        .route(
            "/api/workspace",
            get(knowledge_api::get_workspace).patch(knowledge_api::update_workspace),
        )
        // Follows
        .route(
            "/api/follows",
            get(collaboration_api::list_follows).post(collaboration_api::request_follow),
        )
        .route(
            "/api/follows/:requester_id/approve",
            post(collaboration_api::approve_follow),
        )
        .route(
            "/api/follows/:requester_id/reject",
            post(collaboration_api::reject_follow),
        )
        // Collaboration tasks
        .route(
            "/api/collaboration/process",
            post(collaboration_api::process),
        )
        .route(
            "/api/collaboration/tasks",
            get(collaboration_api::list_tasks),
        )
        .route(
            "/api/collaboration/events",
            get(collaboration_api::events),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = create_store(&config.store).await?;
    tracing::info!("Using {} store", config.store.backend);

    let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::from_config(&config.models));
    let llm: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(
        config.models.api_key.clone(),
        config.models.base_url.clone(),
    ));

    let addr = format!("{}:{}", config.host, config.port);
    let worker_interval = config.collab.worker_interval;
    let state = Arc::new(AppState::new(config, store, embedder, llm));

    if let Some(interval) = worker_interval {
        spawn_task_worker(state.collab.clone(), interval);
    }

    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dev_mode: state.config.dev_mode,
        store: state.config.store.backend.to_string(),
    })
}
