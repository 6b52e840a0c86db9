//! Arbor API - branching conversation core service.
//!
//! This crate implements the core of a chat service whose conversations
//! branch into parallel threads while assistant replies stream in:
//!
//! - **Graph store**: one actor per conversation owning a durable forest
//!   of branches and messages under single-writer consistency and
//!   monotonic versioning
//! - **Streaming broker**: one active generation per (conversation,
//!   branch), fan-out to any number of subscribers, throttled
//!   persistence checkpoints
//! - **Retrieval engine**: query embedding plus merged top-K cosine
//!   search over attachment chunks and web snippets, folded into
//!   bounded prompt context
//!
//! # Architecture
//!
//! - [`config`]: configuration management and environment loading
//! - [`domain`]: core domain models (conversations, branches, messages)
//! - [`graph`]: store actors, update application, tree views
//! - [`storage`]: durable SQLite layer and blob store
//! - [`events`]: normalized streaming event model
//! - [`stream`]: generation broker and checkpoint throttling
//! - [`retrieval`]: similarity search, chunking, ingestion
//! - [`llm`]: provider driver traits and implementations
//! - [`api`]: HTTP API endpoints
//!
//! # Example
//!
//! ```rust,ignore
//! use arbor_api::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let app = create_app(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod graph;
pub mod llm;
pub mod logging;
pub mod retrieval;
pub mod server;
pub mod storage;
pub mod stream;

use std::sync::Arc;

use config::AppConfig;
use graph::StoreRegistry;
use llm::CompletionDriver;
use retrieval::ingest::AttachmentIngestor;
use retrieval::RetrievalEngine;
use stream::StreamBroker;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Per-conversation store actors.
    pub registry: Arc<StoreRegistry>,
    /// Streaming generation broker.
    pub broker: StreamBroker,
    /// Retrieval engine.
    pub retrieval: Arc<RetrievalEngine>,
    /// Completion driver used for generations.
    pub completions: Arc<dyn CompletionDriver>,
    /// Attachment ingestion pipeline.
    pub ingestor: Arc<AttachmentIngestor>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("registry", &self.registry)
            .field("broker", &self.broker)
            .finish()
    }
}
