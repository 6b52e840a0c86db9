//! Provider driver traits and settings.
//!
//! The [`CompletionDriver`] trait defines the streaming interface every
//! completion backend must support; provider wire shapes are adapted into
//! [`ProviderEvent`](crate::events::ProviderEvent) at the driver boundary.
//! [`EmbeddingsClient`] is the matching seam for embedding vectors.

pub mod providers;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::events::ProviderEvent;

/// Provider connection and model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Base URL for the provider API.
    pub base_url: String,
    /// API key for authentication.
    pub api_key: Option<String>,
    /// Completion model identifier.
    pub model: String,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// A single turn of model input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    /// "system", "user", or "assistant".
    pub role: String,
    /// Turn content.
    pub content: String,
}

impl PromptMessage {
    /// System turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    /// User turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    /// Assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Request to a completion driver.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Ordered model input.
    pub messages: Vec<PromptMessage>,
    /// Model override; falls back to settings.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Reasoning effort hint.
    pub reasoning_effort: Option<String>,
}

impl CompletionRequest {
    /// Create a request from assembled messages.
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            reasoning_effort: None,
        }
    }
}

/// Boxed provider event stream returned by drivers.
pub type ProviderEventStream =
    Pin<Box<dyn Stream<Item = anyhow::Result<ProviderEvent>> + Send>>;

/// Trait for streaming completion drivers.
///
/// The driver emits `ProviderEvent::Completed { text, usage }` as its
/// final-response resolution before the stream ends.
#[async_trait]
pub trait CompletionDriver: Send + Sync {
    /// Stream a completion for the request.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<ProviderEventStream>;
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingsClient: Send + Sync {
    /// Embed a batch of texts; one vector per input, in order.
    async fn create(&self, model: &str, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// External blob storage contract consumed by ingestion.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the raw bytes stored under `key`.
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}
