//! Attachment ingestion pipeline: blob → chunks → embeddings → store.

use std::sync::Arc;

use chrono::Utc;

use crate::domain::{AttachmentChunk, ChunkKind, ChunkMetadata, IngestionRecord, IngestionStatus};
use crate::error::{ArborError, ArborResult};
use crate::graph::ConversationHandle;
use crate::llm::BlobStore;
use crate::retrieval::chunker::{approx_token_count, split_text, ChunkerConfig};
use crate::retrieval::RetrievalEngine;

/// A request to (re-)ingest one attachment.
#[derive(Debug, Clone)]
pub struct IngestionRequest {
    /// Attachment identifier; chunk ids derive from it.
    pub attachment_id: String,
    /// Blob store key holding the extracted text.
    pub blob_key: String,
    /// Original file name, carried into chunk metadata.
    pub file_name: Option<String>,
    /// MIME content type, carried into chunk metadata.
    pub content_type: Option<String>,
}

/// Ingestion pipeline over a blob store and the retrieval engine.
pub struct AttachmentIngestor {
    blobs: Arc<dyn BlobStore>,
    engine: Arc<RetrievalEngine>,
    chunker: ChunkerConfig,
}

impl std::fmt::Debug for AttachmentIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentIngestor")
            .field("chunker", &self.chunker)
            .finish()
    }
}

impl AttachmentIngestor {
    /// Create an ingestor.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        engine: Arc<RetrievalEngine>,
        chunker: ChunkerConfig,
    ) -> Self {
        Self {
            blobs,
            engine,
            chunker,
        }
    }

    /// Ingest (or re-ingest) an attachment into a conversation.
    ///
    /// Writes a `pending` status first, then replaces the attachment's
    /// whole chunk set on success. On failure the status record carries
    /// the error and any previously ingested chunks stay searchable.
    pub async fn ingest(
        &self,
        handle: &ConversationHandle,
        request: IngestionRequest,
    ) -> ArborResult<IngestionRecord> {
        handle
            .upsert_attachment_ingestion(
                request.attachment_id.clone(),
                IngestionStatus::Pending,
                None,
                None,
                None,
            )
            .await?;

        match self.build_chunks(handle.conversation_id(), &request).await {
            Ok((chunks, summary)) => {
                handle
                    .upsert_attachment_ingestion(
                        request.attachment_id.clone(),
                        IngestionStatus::Ready,
                        Some(summary),
                        None,
                        Some(chunks),
                    )
                    .await
            }
            Err(e) => {
                tracing::warn!(
                    attachment_id = %request.attachment_id,
                    error = %e,
                    "attachment ingestion failed"
                );
                handle
                    .upsert_attachment_ingestion(
                        request.attachment_id.clone(),
                        IngestionStatus::Failed,
                        None,
                        Some(e.to_string()),
                        None,
                    )
                    .await
            }
        }
    }

    async fn build_chunks(
        &self,
        conversation_id: &str,
        request: &IngestionRequest,
    ) -> ArborResult<(Vec<AttachmentChunk>, String)> {
        let bytes = self
            .blobs
            .get(&request.blob_key)
            .await
            .map_err(|e| ArborError::Upstream(format!("blob fetch failed: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| ArborError::Validation(format!("attachment is not valid UTF-8: {e}")))?;

        let pieces = split_text(&text, &self.chunker);
        if pieces.is_empty() {
            return Err(ArborError::Validation("attachment has no text content".into()));
        }

        let vectors = self.engine.embed_batch(&pieces).await?;

        let now = Utc::now();
        let chunks = pieces
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (content, embedding))| AttachmentChunk {
                id: AttachmentChunk::chunk_id(&request.attachment_id, index),
                attachment_id: request.attachment_id.clone(),
                conversation_id: conversation_id.to_string(),
                kind: ChunkKind::Text,
                token_count: approx_token_count(&content),
                content,
                embedding,
                metadata: ChunkMetadata {
                    file_name: request.file_name.clone(),
                    content_type: request.content_type.clone(),
                    page_number: None,
                },
                created_at: now,
            })
            .collect::<Vec<_>>();

        let summary = format!(
            "{} chunks, ~{} tokens",
            chunks.len(),
            chunks.iter().map(|c| u64::from(c.token_count)).sum::<u64>()
        );
        Ok((chunks, summary))
    }
}
