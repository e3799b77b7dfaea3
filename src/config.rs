//! Configuration management for MindOp.
//!
//! Configuration is read from environment variables:
//! - `LLM_API_KEY` - Required (falls back to `OPENROUTER_API_KEY`). Key for the
//!   OpenAI-compatible chat and embedding endpoints.
//! - `LLM_BASE_URL` - Optional. Defaults to `https://openrouter.ai/api/v1`.
//! - `CHAT_MODEL` - Optional. Generative model. Defaults to `openai/gpt-4o-mini`.
//! - `EMBED_MODEL` - Optional. Defaults to `openai/text-embedding-3-small`.
//! - `EMBED_DIMENSION` - Optional. Defaults to `1536`.
//! - `HOST` / `PORT` - Optional. Server bind address. Defaults to `127.0.0.1:3000`.
//! - `DEV_MODE` - Optional. Disables JWT checks; the caller is taken from `x-user-id`.
//! - `JWT_SECRET` - Required unless `DEV_MODE` is set.
//! - `STORE_BACKEND` - Optional. `memory`, `sqlite` (default) or `supabase`.
//! - `DATA_DIR` - Optional. SQLite location. Defaults to `./data`.
//! - `SUPABASE_URL` / `SUPABASE_SERVICE_ROLE_KEY` - Required for `supabase`.
//! - `CHUNK_SIZE_TOKENS`, `CHUNK_OVERLAP_TOKENS`, `MIN_CHUNK_TOKENS` - Chunker bounds.
//! - `EMBED_BATCH_SIZE`, `EMBED_BATCH_DELAY_MS`, `EMBED_MAX_RETRIES` - Ingestion pacing.
//! - `RETRIEVAL_TOP_K`, `SIMILARITY_THRESHOLD`, `HISTORY_MESSAGES`,
//!   `QUERY_TIMEOUT_SECS` - Query flow.
//! - `TASK_BATCH_SIZE`, `POLL_INTERVAL_SECS`, `TASK_WORKER_INTERVAL_SECS` -
//!   Collaboration engine.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreType;
use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Model provider configuration (chat + embeddings).
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: String,
    /// Base URL of an OpenAI-compatible API (no trailing slash)
    pub base_url: String,
    pub chat_model: String,
    pub embed_model: String,
    /// Embedding dimension (must match model output)
    pub embed_dimension: usize,
}

/// Storage backend configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreType,
    pub data_dir: PathBuf,
    pub supabase_url: Option<String>,
    pub supabase_service_role_key: Option<String>,
}

/// Chunker and embedding pacing for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub chunk_size_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub min_chunk_tokens: usize,
    pub embed_batch_size: usize,
    pub embed_batch_delay: Duration,
    pub embed_max_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: 500,
            chunk_overlap_tokens: 50,
            min_chunk_tokens: 5,
            embed_batch_size: 5,
            embed_batch_delay: Duration::from_millis(200),
            embed_max_retries: 3,
        }
    }
}

/// Retrieval and generation parameters for the query flow.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub top_k: usize,
    /// Deliberately low: the generative step judges relevance itself
    pub similarity_threshold: f64,
    /// Number of prior messages included in the prompt
    pub history_messages: usize,
    /// Wall-clock budget of an interactive query
    pub timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            similarity_threshold: 0.1,
            history_messages: 6,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Collaboration task engine parameters.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub task_batch_size: usize,
    pub poll_interval: Duration,
    /// When set, a background worker drains pending tasks on this interval
    pub worker_interval: Option<Duration>,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            task_batch_size: 5,
            poll_interval: Duration::from_secs(5),
            worker_interval: None,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    pub auth: AuthConfig,
    pub models: ModelConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    pub collab: CollabConfig,
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if no model API key is set, or if the
    /// Supabase backend is selected without credentials.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| ConfigError::MissingEnvVar("LLM_API_KEY".to_string()))?;

        let models = ModelConfig {
            api_key,
            base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            chat_model: std::env::var("CHAT_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string()),
            embed_model: std::env::var("EMBED_MODEL")
                .unwrap_or_else(|_| "openai/text-embedding-3-small".to_string()),
            embed_dimension: parse_env("EMBED_DIMENSION", 1536)?,
        };

        let backend = match std::env::var("STORE_BACKEND") {
            Ok(raw) => raw
                .parse::<StoreType>()
                .map_err(|e| ConfigError::InvalidValue("STORE_BACKEND".to_string(), e))?,
            Err(_) => StoreType::default(),
        };
        let store = StoreConfig {
            backend,
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            supabase_url: std::env::var("SUPABASE_URL").ok(),
            supabase_service_role_key: std::env::var("SUPABASE_SERVICE_ROLE_KEY").ok(),
        };
        if store.backend == StoreType::Supabase {
            if store.supabase_url.is_none() {
                return Err(ConfigError::MissingEnvVar("SUPABASE_URL".to_string()));
            }
            if store.supabase_service_role_key.is_none() {
                return Err(ConfigError::MissingEnvVar(
                    "SUPABASE_SERVICE_ROLE_KEY".to_string(),
                ));
            }
        }

        let defaults = IngestConfig::default();
        let ingest = IngestConfig {
            chunk_size_tokens: parse_env("CHUNK_SIZE_TOKENS", defaults.chunk_size_tokens)?,
            chunk_overlap_tokens: parse_env("CHUNK_OVERLAP_TOKENS", defaults.chunk_overlap_tokens)?,
            min_chunk_tokens: parse_env("MIN_CHUNK_TOKENS", defaults.min_chunk_tokens)?,
            embed_batch_size: parse_env("EMBED_BATCH_SIZE", defaults.embed_batch_size)?.max(1),
            embed_batch_delay: Duration::from_millis(parse_env("EMBED_BATCH_DELAY_MS", 200u64)?),
            embed_max_retries: parse_env("EMBED_MAX_RETRIES", defaults.embed_max_retries)?,
        };
        if ingest.chunk_overlap_tokens >= ingest.chunk_size_tokens {
            return Err(ConfigError::InvalidValue(
                "CHUNK_OVERLAP_TOKENS".to_string(),
                "must be smaller than CHUNK_SIZE_TOKENS".to_string(),
            ));
        }

        let query_defaults = QueryConfig::default();
        let query = QueryConfig {
            top_k: parse_env("RETRIEVAL_TOP_K", query_defaults.top_k)?,
            similarity_threshold: parse_env(
                "SIMILARITY_THRESHOLD",
                query_defaults.similarity_threshold,
            )?,
            history_messages: parse_env("HISTORY_MESSAGES", query_defaults.history_messages)?,
            timeout: Duration::from_secs(parse_env("QUERY_TIMEOUT_SECS", 60u64)?),
        };

        let worker_secs: Option<u64> = match std::env::var("TASK_WORKER_INTERVAL_SECS") {
            Ok(raw) => Some(raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidValue("TASK_WORKER_INTERVAL_SECS".to_string(), e.to_string())
            })?),
            Err(_) => None,
        };
        let collab = CollabConfig {
            task_batch_size: parse_env("TASK_BATCH_SIZE", 5usize)?.max(1),
            poll_interval: Duration::from_secs(parse_env("POLL_INTERVAL_SECS", 5u64)?.max(1)),
            worker_interval: worker_secs.filter(|s| *s > 0).map(Duration::from_secs),
        };

        let dev_mode = env_var_bool("DEV_MODE", false);
        let auth = AuthConfig {
            jwt_secret: std::env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
        };
        if !dev_mode && auth.jwt_secret.is_none() {
            return Err(ConfigError::MissingEnvVar("JWT_SECRET".to_string()));
        }

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_env("PORT", 3000u16)?,
            dev_mode,
            auth,
            models,
            store,
            ingest,
            query,
            collab,
        })
    }

    /// Create an in-memory config with millisecond pacing and a manually
    /// driven poller (useful for testing).
    pub fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            dev_mode: true,
            auth: AuthConfig::default(),
            models: ModelConfig {
                api_key: "test-key".to_string(),
                base_url: "http://127.0.0.1:9".to_string(),
                chat_model: "test/chat".to_string(),
                embed_model: "test/embed".to_string(),
                embed_dimension: 64,
            },
            store: StoreConfig {
                backend: StoreType::Memory,
                data_dir: PathBuf::from("./data"),
                supabase_url: None,
                supabase_service_role_key: None,
            },
            ingest: IngestConfig {
                embed_batch_delay: Duration::from_millis(1),
                ..IngestConfig::default()
            },
            query: QueryConfig::default(),
            collab: CollabConfig {
                // Tests drive the poller explicitly
                poll_interval: Duration::from_secs(3600),
                ..CollabConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_falls_back_to_default() {
        let value: usize = parse_env("MINDOP_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_env_reports_invalid_values() {
        std::env::set_var("MINDOP_TEST_BAD_NUMBER", "not-a-number");
        let err = parse_env::<usize>("MINDOP_TEST_BAD_NUMBER", 1).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue(name, _) if name == "MINDOP_TEST_BAD_NUMBER"
        ));
        std::env::remove_var("MINDOP_TEST_BAD_NUMBER");
    }

    #[test]
    fn defaults_keep_overlap_below_chunk_size() {
        let ingest = IngestConfig::default();
        assert!(ingest.chunk_overlap_tokens < ingest.chunk_size_tokens);
        assert_eq!(QueryConfig::default().timeout, Duration::from_secs(60));
    }
}
