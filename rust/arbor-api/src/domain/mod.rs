//! Core domain models for the conversation graph.
//!
//! A conversation owns a forest of branches rooted at `root_branch_id`.
//! Branches are append-only: they are never physically deleted, only
//! archived by layers above this crate. Messages belong to exactly one
//! branch; user messages are immutable once appended, assistant messages
//! are mutated in place while a generation streams and frozen on
//! completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A chat conversation and its model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique conversation identifier.
    pub id: String,
    /// The root branch of the conversation's branch forest.
    pub root_branch_id: String,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// Model settings used for new generations.
    pub settings: ConversationSettings,
}

/// Model settings attached to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSettings {
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Reasoning effort hint passed through to the provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            reasoning_effort: None,
        }
    }
}

impl Conversation {
    /// Create a conversation with a fresh root branch.
    pub fn new(id: impl Into<String>, root_branch_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            root_branch_id: root_branch_id.into(),
            created_at: Utc::now(),
            settings: ConversationSettings::default(),
        }
    }
}

/// A branch in the conversation forest.
///
/// The root branch has `parent_id == None`. Every other branch forks from
/// a parent at a specific origin message; the origin is the last parent
/// message included when assembling model input for this branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    /// Unique branch identifier.
    pub id: String,
    /// Parent branch; `None` only for the root.
    pub parent_id: Option<String>,
    /// Message in the parent branch this branch forked from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_message_id: Option<String>,
    /// Branch title.
    pub title: String,
    /// When the branch was created.
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// Create the root branch for a new conversation.
    pub fn root(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            origin_message_id: None,
            title: title.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a child branch forked from `origin_message_id` in `parent_id`.
    pub fn fork(
        parent_id: impl Into<String>,
        origin_message_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(parent_id.into()),
            origin_message_id: Some(origin_message_id.into()),
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User turn.
    User,
    /// Assistant turn.
    Assistant,
}

/// Token accounting for a completed assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens generated.
    pub completion_tokens: u32,
    /// Estimated cost in USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// A message in a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Branch this message belongs to.
    pub branch_id: String,
    /// Author role.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
    /// Token accounting; populated when an assistant turn completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl Message {
    /// Create a user message.
    pub fn user(branch_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            branch_id: branch_id.into(),
            role: MessageRole::User,
            content: content.into(),
            created_at: Utc::now(),
            token_usage: None,
        }
    }

    /// Create an empty assistant placeholder, filled in while streaming.
    pub fn assistant_placeholder(branch_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            branch_id: branch_id.into(),
            role: MessageRole::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            token_usage: None,
        }
    }
}

/// Kind of content held by an attachment chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Plain text extracted from the attachment.
    Text,
    /// Image description or caption.
    Image,
}

/// Metadata carried alongside an attachment chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Original file name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// MIME content type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Page number for paginated sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
}

/// A bounded, independently embedded slice of an ingested attachment.
///
/// Chunk ids are deterministic (`{attachment_id}:chunk-{index}`) so that
/// re-ingesting the same attachment replaces rather than duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentChunk {
    /// Deterministic chunk identifier.
    pub id: String,
    /// Attachment this chunk was cut from.
    pub attachment_id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Content kind.
    pub kind: ChunkKind,
    /// Chunk text.
    pub content: String,
    /// Approximate token count of `content`.
    pub token_count: u32,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// Source metadata.
    #[serde(default)]
    pub metadata: ChunkMetadata,
    /// When the chunk was written.
    pub created_at: DateTime<Utc>,
}

impl AttachmentChunk {
    /// Deterministic id for a chunk of an attachment.
    pub fn chunk_id(attachment_id: &str, index: usize) -> String {
        format!("{attachment_id}:chunk-{index}")
    }
}

/// A web search result snippet stored for retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchSnippet {
    /// Unique snippet identifier.
    pub id: String,
    /// Owning conversation.
    pub conversation_id: String,
    /// Result title.
    pub title: String,
    /// Result URL.
    pub url: String,
    /// Snippet text.
    pub snippet: String,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// Search provider that produced the snippet.
    pub provider: String,
    /// When the snippet was stored.
    pub created_at: DateTime<Utc>,
}

/// Status of an attachment ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    /// Ingestion in flight.
    Pending,
    /// Chunks written and searchable.
    Ready,
    /// Ingestion failed; see the recorded error.
    Failed,
}

/// Record of the latest ingestion for an attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionRecord {
    /// Attachment identifier.
    pub attachment_id: String,
    /// Latest status.
    pub status: IngestionStatus,
    /// Optional short summary of the attachment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Error message when `status == Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of chunks in the latest set.
    pub chunk_count: usize,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Full materialized state of a conversation at a given version.
///
/// `version` is the sole concurrency token: every successful mutation
/// batch increments it by exactly 1 regardless of batch size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationGraphSnapshot {
    /// Conversation metadata.
    pub conversation: Conversation,
    /// Branches keyed by id.
    pub branches: HashMap<String, Branch>,
    /// Messages indexed by branch id, in append order.
    pub messages: HashMap<String, Vec<Message>>,
    /// Monotonically increasing version.
    pub version: u64,
}

impl ConversationGraphSnapshot {
    /// Look up a message by branch and id.
    pub fn message(&self, branch_id: &str, message_id: &str) -> Option<&Message> {
        self.messages
            .get(branch_id)
            .and_then(|msgs| msgs.iter().find(|m| m.id == message_id))
    }
}

/// A single mutation operation, submitted in ordered batches.
///
/// Both operations carry a full message payload. For `message:update`
/// only the mutable fields (content, token usage) are taken from it; the
/// stored id, branch, role, and creation time are preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum UpdateOp {
    /// Insert a message keyed by id; re-append with an existing id
    /// overwrites it, making retries idempotent.
    #[serde(rename = "message:append")]
    MessageAppend {
        /// Owning conversation; validated against the addressed store.
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        /// The message to insert.
        message: Message,
    },
    /// Replace the mutable fields of an existing message.
    #[serde(rename = "message:update")]
    MessageUpdate {
        /// Owning conversation; validated against the addressed store.
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        /// Payload addressing the message by id and branch.
        message: Message,
    },
}

impl UpdateOp {
    /// Append a message.
    pub fn append(message: Message) -> Self {
        Self::MessageAppend {
            conversation_id: None,
            message,
        }
    }

    /// Update a message's content and token usage.
    pub fn update(
        branch_id: impl Into<String>,
        message_id: impl Into<String>,
        content: impl Into<String>,
        token_usage: Option<TokenUsage>,
    ) -> Self {
        Self::MessageUpdate {
            conversation_id: None,
            message: Message {
                id: message_id.into(),
                branch_id: branch_id.into(),
                // Identity fields below are preserved from the stored
                // message; these values are placeholders on the wire.
                role: MessageRole::Assistant,
                content: content.into(),
                created_at: Utc::now(),
                token_usage,
            },
        }
    }

    /// The conversation id claimed by the op, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::MessageAppend {
                conversation_id, ..
            }
            | Self::MessageUpdate {
                conversation_id, ..
            } => conversation_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_deterministic() {
        assert_eq!(AttachmentChunk::chunk_id("att-1", 0), "att-1:chunk-0");
        assert_eq!(AttachmentChunk::chunk_id("att-1", 7), "att-1:chunk-7");
    }

    #[test]
    fn update_op_wire_shape_round_trips() {
        let op = UpdateOp::append(Message::user("b-1", "hello"));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "message:append");
        assert_eq!(json["message"]["branchId"], "b-1");

        let back: UpdateOp = serde_json::from_value(json).unwrap();
        match back {
            UpdateOp::MessageAppend { message, .. } => assert_eq!(message.content, "hello"),
            UpdateOp::MessageUpdate { .. } => panic!("expected append"),
        }
    }

    #[test]
    fn assistant_placeholder_starts_empty() {
        let msg = Message::assistant_placeholder("b-1");
        assert_eq!(msg.role, MessageRole::Assistant);
        assert!(msg.content.is_empty());
        assert!(msg.token_usage.is_none());
    }
}
