//! Configuration management for Arbor API.
//!
//! Configuration is loaded from defaults, an optional `config/arbor`
//! file, and `ARBOR__`-prefixed environment variables, in that order.

use serde::{Deserialize, Serialize};

use crate::retrieval::chunker::{DEFAULT_OVERLAP, DEFAULT_WINDOW};
use crate::retrieval::{
    DEFAULT_CONTEXT_CHAR_BUDGET, DEFAULT_MAX_ATTACHMENT_CHUNKS, DEFAULT_MAX_WEB_SNIPPETS,
    DEFAULT_MIN_SCORE,
};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Provider configuration.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Retrieval configuration.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Streaming checkpoint configuration.
    #[serde(default)]
    pub streaming: StreamingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "arbor.db".to_string(),
        }
    }
}

/// Completion/embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL for the provider API.
    pub base_url: String,
    /// API key; usually supplied via `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Default completion model.
    pub model: String,
    /// Embedding model.
    pub embedding_model: String,
    /// Maximum tokens per generation.
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            max_tokens: 4096,
        }
    }
}

/// Retrieval and ingestion tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum attachment-chunk matches per query.
    pub max_attachment_chunks: usize,
    /// Maximum web-snippet matches per query.
    pub max_web_snippets: usize,
    /// Similarity floor.
    pub min_score: f32,
    /// Per-match character budget when folding into context.
    pub context_char_budget: usize,
    /// Chunker window size in characters.
    pub chunk_window: usize,
    /// Chunker overlap in characters.
    pub chunk_overlap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_attachment_chunks: DEFAULT_MAX_ATTACHMENT_CHUNKS,
            max_web_snippets: DEFAULT_MAX_WEB_SNIPPETS,
            min_score: DEFAULT_MIN_SCORE,
            context_char_budget: DEFAULT_CONTEXT_CHAR_BUDGET,
            chunk_window: DEFAULT_WINDOW,
            chunk_overlap: DEFAULT_OVERLAP,
        }
    }
}

/// Streaming checkpoint throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Minimum interval between checkpoints, in milliseconds.
    pub checkpoint_interval_ms: u64,
    /// Buffered character count that forces a checkpoint.
    pub checkpoint_chars: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: 150,
            checkpoint_chars: 24,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config files, and environment.
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present.
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.path", "arbor.db")?
            .add_source(config::File::with_name("config/arbor").required(false))
            .add_source(
                config::Environment::with_prefix("ARBOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize().unwrap_or_default();

        // Provider API key from the conventional environment variable.
        if app_config.llm.api_key.is_none() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                app_config.llm.api_key = Some(key);
            }
        }

        Ok(app_config)
    }
}
