//! Retrieval query and ingestion endpoints.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::domain::{IngestionRecord, WebSearchSnippet};
use crate::error::{ArborError, ArborResult};
use crate::retrieval::ingest::IngestionRequest;
use crate::retrieval::{RetrievalMatches, RetrievalQuery};
use crate::AppState;

/// Retrieval routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/conversations/{id}/retrieval/query",
            post(query_retrieval),
        )
        .route(
            "/api/v1/conversations/{id}/attachments/{attachment_id}/ingest",
            post(ingest_attachment),
        )
        .route(
            "/api/v1/conversations/{id}/web-snippets",
            post(upsert_web_snippets),
        )
}

/// Retrieval query request. Either a precomputed embedding or a query
/// text (embedded server-side with a single provider call).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrievalQueryRequest {
    embedding: Option<Vec<f32>>,
    query: Option<String>,
    max_attachment_chunks: Option<usize>,
    max_web_snippets: Option<usize>,
    min_score: Option<f32>,
    allowed_attachment_ids: Option<Vec<String>>,
}

async fn query_retrieval(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<RetrievalQueryRequest>,
) -> ArborResult<Json<RetrievalMatches>> {
    let embedding = match (req.embedding, req.query) {
        (Some(embedding), _) => embedding,
        (None, Some(text)) => state.retrieval.embed(&text).await?,
        (None, None) => {
            return Err(ArborError::Validation(
                "either embedding or query text is required".into(),
            ));
        }
    };

    let mut query = RetrievalQuery::new(embedding);
    query.caps.max_attachment_chunks = req
        .max_attachment_chunks
        .unwrap_or(state.config.retrieval.max_attachment_chunks);
    query.caps.max_web_snippets = req
        .max_web_snippets
        .unwrap_or(state.config.retrieval.max_web_snippets);
    query.min_score = req.min_score.unwrap_or(state.config.retrieval.min_score);
    query.allowed_attachment_ids = req
        .allowed_attachment_ids
        .map(|ids| ids.into_iter().collect());

    let handle = state.registry.handle(&conversation_id);
    Ok(Json(handle.query_retrieval(&query)))
}

/// Attachment ingestion request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestAttachmentRequest {
    blob_key: String,
    file_name: Option<String>,
    content_type: Option<String>,
}

async fn ingest_attachment(
    State(state): State<AppState>,
    Path((conversation_id, attachment_id)): Path<(String, String)>,
    Json(req): Json<IngestAttachmentRequest>,
) -> ArborResult<Json<IngestionRecord>> {
    let handle = state.registry.handle(&conversation_id);
    let record = state
        .ingestor
        .ingest(
            &handle,
            IngestionRequest {
                attachment_id,
                blob_key: req.blob_key,
                file_name: req.file_name,
                content_type: req.content_type,
            },
        )
        .await?;
    Ok(Json(record))
}

/// Web snippet upsert request, fed by the search pipeline.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertSnippetsRequest {
    snippets: Vec<SnippetPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnippetPayload {
    id: Option<String>,
    title: String,
    url: String,
    snippet: String,
    provider: String,
}

async fn upsert_web_snippets(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<UpsertSnippetsRequest>,
) -> ArborResult<Json<serde_json::Value>> {
    if req.snippets.is_empty() {
        return Err(ArborError::Validation("no snippets supplied".into()));
    }

    // Embed all snippet texts in one provider call.
    let texts: Vec<String> = req.snippets.iter().map(|s| s.snippet.clone()).collect();
    let embeddings = state.retrieval.embed_batch(&texts).await?;

    let now = Utc::now();
    let snippets: Vec<WebSearchSnippet> = req
        .snippets
        .into_iter()
        .zip(embeddings)
        .map(|(payload, embedding)| WebSearchSnippet {
            id: payload.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: conversation_id.clone(),
            title: payload.title,
            url: payload.url,
            snippet: payload.snippet,
            embedding,
            provider: payload.provider,
            created_at: now,
        })
        .collect();

    let count = snippets.len();
    let handle = state.registry.handle(&conversation_id);
    handle.upsert_web_snippets(snippets).await?;

    Ok(Json(serde_json::json!({ "stored": count })))
}
