//! HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::config::AppConfig;
use crate::graph::StoreRegistry;
use crate::llm::providers::OpenAiDriver;
use crate::llm::LlmSettings;
use crate::log_init_step;
use crate::logging::OpTimer;
use crate::retrieval::chunker::ChunkerConfig;
use crate::retrieval::ingest::AttachmentIngestor;
use crate::retrieval::RetrievalEngine;
use crate::storage::blobs::FsBlobStore;
use crate::storage::SqliteStorage;
use crate::stream::{StreamBroker, ThrottleConfig};
use crate::AppState;

/// Request timeout for non-streaming endpoints.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the application with all routes and middleware.
pub async fn create_app(config: AppConfig) -> anyhow::Result<Router> {
    let overall_timer = OpTimer::new("server", "create_app");

    // [1/5] Durable storage
    let step_timer = OpTimer::new("server", "storage");
    let storage = SqliteStorage::open(&config.database.path)?;
    let registry = Arc::new(StoreRegistry::new(storage));
    log_init_step!(1, 5, "Storage", format!("sqlite at {}", config.database.path));
    step_timer.finish();

    // [2/5] Provider driver
    let step_timer = OpTimer::new("server", "provider");
    let settings = LlmSettings {
        base_url: config.llm.base_url.clone(),
        api_key: config.llm.api_key.clone(),
        model: config.llm.model.clone(),
        embedding_model: config.llm.embedding_model.clone(),
        max_tokens: config.llm.max_tokens,
    };
    if settings.api_key.is_none() {
        tracing::warn!("no provider API key configured; generations will fail");
    }
    let driver = Arc::new(OpenAiDriver::new(settings)?);
    log_init_step!(2, 5, "Provider", format!("{} / {}", config.llm.model, config.llm.embedding_model));
    step_timer.finish();

    // [3/5] Retrieval engine + ingestion
    let step_timer = OpTimer::new("server", "retrieval");
    let retrieval = Arc::new(RetrievalEngine::new(
        driver.clone(),
        config.llm.embedding_model.clone(),
        config.retrieval.context_char_budget,
    ));
    let blobs = Arc::new(FsBlobStore::new("blobs"));
    let ingestor = Arc::new(AttachmentIngestor::new(
        blobs,
        retrieval.clone(),
        ChunkerConfig {
            window: config.retrieval.chunk_window,
            overlap: config.retrieval.chunk_overlap,
        },
    ));
    log_init_step!(3, 5, "Retrieval", format!("caps {}/{}", config.retrieval.max_attachment_chunks, config.retrieval.max_web_snippets));
    step_timer.finish();

    // [4/5] Stream broker
    let step_timer = OpTimer::new("server", "broker");
    let broker = StreamBroker::new(ThrottleConfig {
        interval: Duration::from_millis(config.streaming.checkpoint_interval_ms),
        chars: config.streaming.checkpoint_chars,
    });
    log_init_step!(4, 5, "Stream Broker", format!("checkpoint every {}ms / {} chars", config.streaming.checkpoint_interval_ms, config.streaming.checkpoint_chars));
    step_timer.finish();

    // [5/5] Routes and middleware
    let step_timer = OpTimer::new("server", "routes");
    let state = AppState {
        config: Arc::new(config),
        registry,
        broker,
        retrieval,
        completions: driver,
        ingestor,
    };

    // The SSE route is long-lived and sits outside the request timeout.
    let app = Router::new()
        .merge(api::health::router())
        .merge(api::conversations::router())
        .merge(api::retrieval::router())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .merge(api::streaming::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);
    log_init_step!(5, 5, "Routes", "API surface ready");
    step_timer.finish();

    overall_timer.finish();
    Ok(app)
}
