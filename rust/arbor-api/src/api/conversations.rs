//! Conversation graph endpoints: snapshots, trees, update batches,
//! branching, and the send-message flow.

use axum::{
    extract::{Path, State},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::domain::{Branch, ConversationGraphSnapshot, Message, UpdateOp};
use crate::error::{ArborError, ArborResult};
use crate::graph::{build_tree, thread_for_branch, TreeNode};
use crate::llm::{CompletionRequest, PromptMessage};
use crate::retrieval::{ContextBlock, RetrievalQuery};
use crate::AppState;

/// Conversation routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/conversations/{id}", get(get_snapshot))
        .route("/api/v1/conversations/{id}/tree", get(get_tree))
        .route("/api/v1/conversations/{id}/updates", post(apply_updates))
        .route("/api/v1/conversations/{id}/branches", post(create_branch))
        .route(
            "/api/v1/conversations/{id}/branches/{branch_id}",
            patch(rename_branch),
        )
        .route("/api/v1/conversations/{id}/messages", post(send_message))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ArborResult<Json<ConversationGraphSnapshot>> {
    let handle = state.registry.handle(&conversation_id);
    Ok(Json(handle.snapshot().await?))
}

async fn get_tree(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ArborResult<Json<TreeNode>> {
    let handle = state.registry.handle(&conversation_id);
    let snapshot = handle.snapshot().await?;
    Ok(Json(build_tree(&snapshot)?))
}

/// Response to an applied update batch.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppliedBatchResponse {
    snapshot: ConversationGraphSnapshot,
    version: u64,
}

async fn apply_updates(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(ops): Json<Vec<UpdateOp>>,
) -> ArborResult<Json<AppliedBatchResponse>> {
    // Ops may carry their conversation id on the wire; it must agree
    // with the addressed store.
    for op in &ops {
        if let Some(claimed) = op.conversation_id() {
            if claimed != conversation_id {
                return Err(ArborError::Validation(format!(
                    "operation addresses conversation {claimed}, endpoint addresses {conversation_id}"
                )));
            }
        }
    }

    let handle = state.registry.handle(&conversation_id);
    let applied = handle.apply_updates(ops).await?;
    Ok(Json(AppliedBatchResponse {
        snapshot: applied.snapshot,
        version: applied.version,
    }))
}

/// Branch-from-message request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBranchRequest {
    parent_id: String,
    origin_message_id: String,
    title: String,
}

/// Branch creation response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BranchResponse {
    branch: Branch,
    version: u64,
}

async fn create_branch(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<CreateBranchRequest>,
) -> ArborResult<Json<BranchResponse>> {
    let handle = state.registry.handle(&conversation_id);
    let (branch, version) = handle
        .create_branch(req.parent_id, req.origin_message_id, req.title)
        .await?;
    Ok(Json(BranchResponse { branch, version }))
}

/// Branch rename request.
#[derive(Debug, Deserialize)]
struct RenameBranchRequest {
    title: String,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    version: u64,
}

async fn rename_branch(
    State(state): State<AppState>,
    Path((conversation_id, branch_id)): Path<(String, String)>,
    Json(req): Json<RenameBranchRequest>,
) -> ArborResult<Json<VersionResponse>> {
    let handle = state.registry.handle(&conversation_id);
    let version = handle.rename_branch(branch_id, req.title).await?;
    Ok(Json(VersionResponse { version }))
}

/// Send-message request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    branch_id: String,
    content: String,
    /// Optional allow-list restricting retrieval to these attachments.
    allowed_attachment_ids: Option<Vec<String>>,
}

/// Send-message response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    stream_id: String,
    user_message_id: String,
    assistant_message_id: String,
    version: u64,
}

/// Append the user turn and assistant placeholder as one batch, build
/// retrieval context, and start the generation.
async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ArborResult<Json<SendMessageResponse>> {
    if req.content.trim().is_empty() {
        return Err(ArborError::Validation("message content must not be empty".into()));
    }

    let handle = state.registry.handle(&conversation_id);

    // One batch: both turns land as a single indivisible transition.
    let user = Message::user(req.branch_id.clone(), req.content.clone());
    let placeholder = Message::assistant_placeholder(req.branch_id.clone());
    let applied = handle
        .apply_updates(vec![
            UpdateOp::append(user.clone()),
            UpdateOp::append(placeholder.clone()),
        ])
        .await?;

    // Retrieval degrades to empty context; it never blocks sending.
    let context = build_retrieval_context(&state, &handle, &req).await;

    let thread = thread_for_branch(&applied.snapshot, &req.branch_id)?;
    let settings = &applied.snapshot.conversation.settings;
    let mut request = CompletionRequest::new(assemble_prompt(&context, &thread));
    request.model = Some(settings.model.clone());
    request.temperature = Some(settings.temperature);
    request.reasoning_effort = settings.reasoning_effort.clone();

    let stream_id = state.broker.start_generation(
        handle,
        req.branch_id,
        placeholder.id.clone(),
        state.completions.clone(),
        request,
    );

    Ok(Json(SendMessageResponse {
        stream_id,
        user_message_id: user.id,
        assistant_message_id: placeholder.id,
        version: applied.version,
    }))
}

async fn build_retrieval_context(
    state: &AppState,
    handle: &crate::graph::ConversationHandle,
    req: &SendMessageRequest,
) -> Vec<ContextBlock> {
    let embedding = match state.retrieval.embed(&req.content).await {
        Ok(embedding) => embedding,
        Err(e) => {
            tracing::warn!(error = %e, "retrieval embedding failed; sending without context");
            return Vec::new();
        }
    };

    let mut query = RetrievalQuery::new(embedding);
    query.caps.max_attachment_chunks = state.config.retrieval.max_attachment_chunks;
    query.caps.max_web_snippets = state.config.retrieval.max_web_snippets;
    query.min_score = state.config.retrieval.min_score;
    query.allowed_attachment_ids = req
        .allowed_attachment_ids
        .as_ref()
        .map(|ids| ids.iter().cloned().collect());

    let matches = handle.query_retrieval(&query);
    state.retrieval.to_context_blocks(&matches)
}

/// Fold context blocks and the ancestor thread into model input.
fn assemble_prompt(context: &[ContextBlock], thread: &[Message]) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(thread.len() + 1);

    if !context.is_empty() {
        let mut system = String::from(
            "Use the following retrieved context when it is relevant to the conversation.\n",
        );
        for block in context {
            system.push_str(&format!("\n[{}]\n{}\n", block.source, block.content));
        }
        messages.push(PromptMessage::system(system));
    }

    for msg in thread {
        // The freshly appended assistant placeholder is still empty;
        // empty turns carry no signal for the model.
        if msg.content.is_empty() {
            continue;
        }
        match msg.role {
            crate::domain::MessageRole::User => messages.push(PromptMessage::user(&msg.content)),
            crate::domain::MessageRole::Assistant => {
                messages.push(PromptMessage::assistant(&msg.content));
            }
        }
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageRole;

    #[test]
    fn prompt_skips_empty_placeholder_and_prepends_context() {
        let context = vec![ContextBlock {
            source: "notes.txt".into(),
            content: "Recursion base cases matter.".into(),
        }];
        let thread = vec![
            Message::user("b-1", "Explain recursion."),
            Message::assistant_placeholder("b-1"),
        ];

        let prompt = assemble_prompt(&context, &thread);
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, "system");
        assert!(prompt[0].content.contains("notes.txt"));
        assert_eq!(prompt[1].role, "user");
    }

    #[test]
    fn prompt_preserves_thread_order_without_context() {
        let mut reply = Message::assistant_placeholder("b-1");
        reply.content = "Sure.".into();
        assert_eq!(reply.role, MessageRole::Assistant);

        let thread = vec![Message::user("b-1", "Hi."), reply];
        let prompt = assemble_prompt(&[], &thread);
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0].role, "user");
        assert_eq!(prompt[1].role, "assistant");
    }
}
