//! Retrieval engine: query embedding, two-collection similarity search,
//! and deterministic folding of matches into bounded prompt context.
//!
//! Attachment chunks and web snippets are ranked independently by cosine
//! similarity, each collection capped on its own, so one noisy source can
//! never crowd the other out of the prompt.

pub mod chunker;
pub mod ingest;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentChunk, WebSearchSnippet};
use crate::error::{ArborError, ArborResult};
use crate::llm::EmbeddingsClient;

/// Default similarity floor below which matches are discarded.
pub const DEFAULT_MIN_SCORE: f32 = 0.15;
/// Default cap for attachment-chunk matches.
pub const DEFAULT_MAX_ATTACHMENT_CHUNKS: usize = 6;
/// Default cap for web-snippet matches.
pub const DEFAULT_MAX_WEB_SNIPPETS: usize = 4;
/// Default per-match character budget when folding into context.
pub const DEFAULT_CONTEXT_CHAR_BUDGET: usize = 1_200;

/// Per-collection result caps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrievalCaps {
    /// Maximum attachment-chunk matches returned.
    pub max_attachment_chunks: usize,
    /// Maximum web-snippet matches returned.
    pub max_web_snippets: usize,
}

impl Default for RetrievalCaps {
    fn default() -> Self {
        Self {
            max_attachment_chunks: DEFAULT_MAX_ATTACHMENT_CHUNKS,
            max_web_snippets: DEFAULT_MAX_WEB_SNIPPETS,
        }
    }
}

/// A retrieval query against one conversation's collections.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    /// Query embedding.
    pub embedding: Vec<f32>,
    /// Per-collection caps.
    pub caps: RetrievalCaps,
    /// Similarity floor.
    pub min_score: f32,
    /// Optional allow-list restricting attachment matches.
    pub allowed_attachment_ids: Option<HashSet<String>>,
}

impl RetrievalQuery {
    /// Query with default caps and floor.
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            caps: RetrievalCaps::default(),
            min_score: DEFAULT_MIN_SCORE,
            allowed_attachment_ids: None,
        }
    }
}

/// An attachment chunk with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    /// The matched chunk.
    pub chunk: AttachmentChunk,
    /// Cosine similarity to the query embedding.
    pub similarity: f32,
}

/// A web snippet with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredSnippet {
    /// The matched snippet.
    pub snippet: WebSearchSnippet,
    /// Cosine similarity to the query embedding.
    pub similarity: f32,
}

/// Ranked matches from both collections.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalMatches {
    /// Attachment-chunk matches, similarity descending.
    pub attachments: Vec<ScoredChunk>,
    /// Web-snippet matches, similarity descending.
    pub web_snippets: Vec<ScoredSnippet>,
}

impl RetrievalMatches {
    /// Whether no collection produced a match.
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty() && self.web_snippets.is_empty()
    }
}

/// A bounded context block ready to fold into prompt input.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBlock {
    /// Human-readable source label (file name or URL).
    pub source: String,
    /// Truncated match content.
    pub content: String,
}

/// Cosine similarity of two vectors; `None` for mismatched or degenerate
/// inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Rank both collections against a query.
///
/// Matches below the floor are dropped before ranking; each collection is
/// capped independently, ordered by similarity descending with most
/// recent `created_at` as the tie-break.
pub fn rank_matches(
    chunks: &[AttachmentChunk],
    snippets: &[WebSearchSnippet],
    query: &RetrievalQuery,
) -> RetrievalMatches {
    let mut attachments: Vec<ScoredChunk> = chunks
        .iter()
        .filter(|chunk| match &query.allowed_attachment_ids {
            Some(allowed) => allowed.contains(&chunk.attachment_id),
            None => true,
        })
        .filter_map(|chunk| {
            let similarity = cosine_similarity(&query.embedding, &chunk.embedding)?;
            (similarity >= query.min_score).then(|| ScoredChunk {
                chunk: chunk.clone(),
                similarity,
            })
        })
        .collect();
    attachments.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
    });
    attachments.truncate(query.caps.max_attachment_chunks);

    let mut web_snippets: Vec<ScoredSnippet> = snippets
        .iter()
        .filter_map(|snippet| {
            let similarity = cosine_similarity(&query.embedding, &snippet.embedding)?;
            (similarity >= query.min_score).then(|| ScoredSnippet {
                snippet: snippet.clone(),
                similarity,
            })
        })
        .collect();
    web_snippets.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| b.snippet.created_at.cmp(&a.snippet.created_at))
    });
    web_snippets.truncate(query.caps.max_web_snippets);

    RetrievalMatches {
        attachments,
        web_snippets,
    }
}

/// Truncate to a character budget without splitting a code point.
fn truncate_chars(text: &str, budget: usize) -> String {
    match text.char_indices().nth(budget) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Embedding-backed retrieval front end.
pub struct RetrievalEngine {
    embeddings: Arc<dyn EmbeddingsClient>,
    embedding_model: String,
    context_char_budget: usize,
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("embedding_model", &self.embedding_model)
            .field("context_char_budget", &self.context_char_budget)
            .finish()
    }
}

impl RetrievalEngine {
    /// Create an engine over an embeddings client.
    pub fn new(
        embeddings: Arc<dyn EmbeddingsClient>,
        embedding_model: impl Into<String>,
        context_char_budget: usize,
    ) -> Self {
        Self {
            embeddings,
            embedding_model: embedding_model.into(),
            context_char_budget,
        }
    }

    /// Embed a query text; exactly one provider call.
    pub async fn embed(&self, text: &str) -> ArborResult<Vec<f32>> {
        let mut vectors = self
            .embeddings
            .create(&self.embedding_model, &[text.to_string()])
            .await
            .map_err(|e| ArborError::Upstream(e.to_string()))?;
        if vectors.is_empty() {
            return Err(ArborError::Upstream(
                "embeddings provider returned no vector".into(),
            ));
        }
        Ok(vectors.swap_remove(0))
    }

    /// Embed a batch of chunk texts; one provider call for the whole batch.
    pub async fn embed_batch(&self, texts: &[String]) -> ArborResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self
            .embeddings
            .create(&self.embedding_model, texts)
            .await
            .map_err(|e| ArborError::Upstream(e.to_string()))?;
        if vectors.len() != texts.len() {
            return Err(ArborError::Upstream(format!(
                "embeddings provider returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    /// Fold ranked matches into bounded context blocks.
    ///
    /// Each block's content is truncated to the configured budget, so
    /// prompt token cost stays deterministic regardless of source size.
    pub fn to_context_blocks(&self, matches: &RetrievalMatches) -> Vec<ContextBlock> {
        let mut blocks = Vec::with_capacity(matches.attachments.len() + matches.web_snippets.len());
        for scored in &matches.attachments {
            let source = scored
                .chunk
                .metadata
                .file_name
                .clone()
                .unwrap_or_else(|| scored.chunk.attachment_id.clone());
            blocks.push(ContextBlock {
                source,
                content: truncate_chars(&scored.chunk.content, self.context_char_budget),
            });
        }
        for scored in &matches.web_snippets {
            blocks.push(ContextBlock {
                source: scored.snippet.url.clone(),
                content: truncate_chars(&scored.snippet.snippet, self.context_char_budget),
            });
        }
        blocks
    }
}
