//! Per-conversation store actor.
//!
//! One actor task owns each conversation's mutable state. All mutating
//! calls travel through its command queue and are applied one at a time
//! in submission order, so no two writers ever observe interleaved
//! partial state. The actor loads durable state before serving its first
//! command; callers that arrive during the load simply wait in the queue,
//! which is the one-time initialization barrier. A failed load poisons
//! the handle (every command answers with the storage failure) instead of
//! deadlocking, and the registry evicts poisoned handles so a later
//! access retries the load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::domain::{
    AttachmentChunk, Branch, Conversation, ConversationGraphSnapshot, IngestionRecord,
    IngestionStatus, Message, UpdateOp, WebSearchSnippet,
};
use crate::error::{ArborError, ArborResult};
use crate::graph::applier;
use crate::retrieval::{rank_matches, RetrievalMatches, RetrievalQuery};
use crate::storage::{LoadedConversation, MessageWrite, SqliteStorage};

/// Command queue depth per conversation actor.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Result of a successfully applied update batch.
#[derive(Debug, Clone)]
pub struct AppliedBatch {
    /// Snapshot after the batch.
    pub snapshot: ConversationGraphSnapshot,
    /// Version after the batch (pre-batch version + 1).
    pub version: u64,
}

/// Write-once-per-id collections served to concurrent retrieval readers.
#[derive(Debug, Default)]
pub(crate) struct RetrievalCollections {
    pub chunks: Vec<AttachmentChunk>,
    pub snippets: Vec<WebSearchSnippet>,
    pub ingestions: HashMap<String, IngestionRecord>,
}

enum StoreCommand {
    Snapshot {
        reply: oneshot::Sender<ArborResult<ConversationGraphSnapshot>>,
    },
    ApplyUpdates {
        ops: Vec<UpdateOp>,
        reply: oneshot::Sender<ArborResult<AppliedBatch>>,
    },
    CreateBranch {
        parent_id: String,
        origin_message_id: String,
        title: String,
        reply: oneshot::Sender<ArborResult<(Branch, u64)>>,
    },
    RenameBranch {
        branch_id: String,
        title: String,
        reply: oneshot::Sender<ArborResult<u64>>,
    },
    UpsertIngestion {
        attachment_id: String,
        status: IngestionStatus,
        summary: Option<String>,
        error: Option<String>,
        chunks: Option<Vec<AttachmentChunk>>,
        reply: oneshot::Sender<ArborResult<IngestionRecord>>,
    },
    UpsertSnippets {
        snippets: Vec<WebSearchSnippet>,
        reply: oneshot::Sender<ArborResult<()>>,
    },
}

/// Cloneable handle to one conversation's store actor.
#[derive(Clone)]
pub struct ConversationHandle {
    conversation_id: String,
    tx: mpsc::Sender<StoreCommand>,
    collections: Arc<RwLock<RetrievalCollections>>,
    poisoned: Arc<AtomicBool>,
}

impl std::fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationHandle")
            .field("conversation_id", &self.conversation_id)
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConversationHandle {
    /// Spawn the actor for `conversation_id`, loading (or lazily
    /// creating) its durable state before the first command is served.
    pub fn spawn(conversation_id: impl Into<String>, storage: SqliteStorage) -> Self {
        let conversation_id = conversation_id.into();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let collections = Arc::new(RwLock::new(RetrievalCollections::default()));
        let poisoned = Arc::new(AtomicBool::new(false));

        let handle = Self {
            conversation_id: conversation_id.clone(),
            tx,
            collections: Arc::clone(&collections),
            poisoned: Arc::clone(&poisoned),
        };

        tokio::spawn(run_actor(
            conversation_id,
            storage,
            rx,
            collections,
            poisoned,
        ));

        handle
    }

    /// The conversation this handle addresses.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Whether the actor failed its initial load.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<ArborResult<T>>) -> StoreCommand,
    ) -> ArborResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| ArborError::Storage("conversation store task terminated".into()))?;
        reply_rx
            .await
            .map_err(|_| ArborError::Storage("conversation store dropped the request".into()))?
    }

    /// Read the current cached snapshot.
    pub async fn snapshot(&self) -> ArborResult<ConversationGraphSnapshot> {
        self.request(|reply| StoreCommand::Snapshot { reply }).await
    }

    /// Apply an ordered batch of update operations atomically.
    pub async fn apply_updates(&self, ops: Vec<UpdateOp>) -> ArborResult<AppliedBatch> {
        self.request(|reply| StoreCommand::ApplyUpdates { ops, reply })
            .await
    }

    /// Fork a new branch from a message in the parent branch.
    pub async fn create_branch(
        &self,
        parent_id: impl Into<String>,
        origin_message_id: impl Into<String>,
        title: impl Into<String>,
    ) -> ArborResult<(Branch, u64)> {
        self.request(|reply| StoreCommand::CreateBranch {
            parent_id: parent_id.into(),
            origin_message_id: origin_message_id.into(),
            title: title.into(),
            reply,
        })
        .await
    }

    /// Rename a branch.
    pub async fn rename_branch(
        &self,
        branch_id: impl Into<String>,
        title: impl Into<String>,
    ) -> ArborResult<u64> {
        self.request(|reply| StoreCommand::RenameBranch {
            branch_id: branch_id.into(),
            title: title.into(),
            reply,
        })
        .await
    }

    /// Record an ingestion outcome. `Some(chunks)` replaces the whole
    /// chunk set for the attachment; `None` updates the status record
    /// only, leaving existing chunks searchable.
    pub async fn upsert_attachment_ingestion(
        &self,
        attachment_id: impl Into<String>,
        status: IngestionStatus,
        summary: Option<String>,
        error: Option<String>,
        chunks: Option<Vec<AttachmentChunk>>,
    ) -> ArborResult<IngestionRecord> {
        self.request(|reply| StoreCommand::UpsertIngestion {
            attachment_id: attachment_id.into(),
            status,
            summary,
            error,
            chunks,
            reply,
        })
        .await
    }

    /// Append web search snippets, idempotent on snippet id.
    pub async fn upsert_web_snippets(&self, snippets: Vec<WebSearchSnippet>) -> ArborResult<()> {
        self.request(|reply| StoreCommand::UpsertSnippets { snippets, reply })
            .await
    }

    /// Run a retrieval query against the conversation's collections.
    ///
    /// Read-only: served from the shared collection view, so it never
    /// queues behind in-flight writers and observes one point-in-time
    /// state of the write-once collections.
    pub fn query_retrieval(&self, query: &RetrievalQuery) -> RetrievalMatches {
        let collections = self.collections.read();
        rank_matches(&collections.chunks, &collections.snippets, query)
    }

    /// Latest ingestion record for an attachment, if any.
    pub fn ingestion_record(&self, attachment_id: &str) -> Option<IngestionRecord> {
        self.collections.read().ingestions.get(attachment_id).cloned()
    }
}

/// In-memory cache owned by the actor.
struct ActorState {
    conversation: Conversation,
    branches: HashMap<String, Branch>,
    messages: HashMap<String, Vec<Message>>,
    version: u64,
}

async fn run_actor(
    conversation_id: String,
    storage: SqliteStorage,
    mut rx: mpsc::Receiver<StoreCommand>,
    collections: Arc<RwLock<RetrievalCollections>>,
    poisoned: Arc<AtomicBool>,
) {
    let mut state = match initialize(&conversation_id, &storage, &collections) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %e,
                "conversation store failed to load"
            );
            poisoned.store(true, Ordering::Release);
            // Answer everything already queued (and anything that races
            // in before the sender side notices) with the failure, then
            // drop the queue.
            while let Some(cmd) = rx.recv().await {
                fail_command(cmd, &e);
            }
            return;
        }
    };

    tracing::debug!(
        conversation_id = %conversation_id,
        version = state.version,
        "conversation store ready"
    );

    while let Some(cmd) = rx.recv().await {
        handle_command(&conversation_id, &storage, &collections, &mut state, cmd);
    }
}

fn initialize(
    conversation_id: &str,
    storage: &SqliteStorage,
    collections: &Arc<RwLock<RetrievalCollections>>,
) -> ArborResult<ActorState> {
    let loaded = match storage.load(conversation_id)? {
        Some(loaded) => loaded,
        None => {
            // First access: create the conversation with a default root.
            let root = Branch::root("Main Branch");
            let conversation = Conversation::new(conversation_id, root.id.clone());
            storage.create_conversation(&conversation, &root)?;
            let mut branches = HashMap::new();
            let mut messages = HashMap::new();
            messages.insert(root.id.clone(), Vec::new());
            branches.insert(root.id.clone(), root);
            LoadedConversation {
                conversation,
                branches,
                messages,
                version: 0,
                chunks: Vec::new(),
                snippets: Vec::new(),
                ingestions: HashMap::new(),
            }
        }
    };

    {
        let mut view = collections.write();
        view.chunks = loaded.chunks;
        view.snippets = loaded.snippets;
        view.ingestions = loaded.ingestions;
    }

    Ok(ActorState {
        conversation: loaded.conversation,
        branches: loaded.branches,
        messages: loaded.messages,
        version: loaded.version,
    })
}

fn fail_command(cmd: StoreCommand, error: &ArborError) {
    let storage_err = || ArborError::Storage(error.to_string());
    match cmd {
        StoreCommand::Snapshot { reply } => drop(reply.send(Err(storage_err()))),
        StoreCommand::ApplyUpdates { reply, .. } => drop(reply.send(Err(storage_err()))),
        StoreCommand::CreateBranch { reply, .. } => drop(reply.send(Err(storage_err()))),
        StoreCommand::RenameBranch { reply, .. } => drop(reply.send(Err(storage_err()))),
        StoreCommand::UpsertIngestion { reply, .. } => drop(reply.send(Err(storage_err()))),
        StoreCommand::UpsertSnippets { reply, .. } => drop(reply.send(Err(storage_err()))),
    }
}

fn handle_command(
    conversation_id: &str,
    storage: &SqliteStorage,
    collections: &Arc<RwLock<RetrievalCollections>>,
    state: &mut ActorState,
    cmd: StoreCommand,
) {
    match cmd {
        StoreCommand::Snapshot { reply } => {
            let _ = reply.send(Ok(snapshot_of(state)));
        }
        StoreCommand::ApplyUpdates { ops, reply } => {
            let _ = reply.send(apply_updates(conversation_id, storage, state, ops));
        }
        StoreCommand::CreateBranch {
            parent_id,
            origin_message_id,
            title,
            reply,
        } => {
            let _ = reply.send(create_branch(
                conversation_id,
                storage,
                state,
                parent_id,
                origin_message_id,
                title,
            ));
        }
        StoreCommand::RenameBranch {
            branch_id,
            title,
            reply,
        } => {
            let _ = reply.send(rename_branch(
                conversation_id,
                storage,
                state,
                &branch_id,
                title,
            ));
        }
        StoreCommand::UpsertIngestion {
            attachment_id,
            status,
            summary,
            error,
            chunks,
            reply,
        } => {
            let _ = reply.send(upsert_ingestion(
                conversation_id,
                storage,
                collections,
                attachment_id,
                status,
                summary,
                error,
                chunks,
            ));
        }
        StoreCommand::UpsertSnippets { snippets, reply } => {
            let _ = reply.send(upsert_snippets(
                conversation_id,
                storage,
                collections,
                snippets,
            ));
        }
    }
}

fn snapshot_of(state: &ActorState) -> ConversationGraphSnapshot {
    ConversationGraphSnapshot {
        conversation: state.conversation.clone(),
        branches: state.branches.clone(),
        messages: state.messages.clone(),
        version: state.version,
    }
}

fn apply_updates(
    conversation_id: &str,
    storage: &SqliteStorage,
    state: &mut ActorState,
    ops: Vec<UpdateOp>,
) -> ArborResult<AppliedBatch> {
    let writes = applier::plan_batch(&state.branches, &state.messages, &ops)?;

    let next_version = state.version + 1;
    let message_writes: Vec<MessageWrite<'_>> = writes
        .iter()
        .map(|w| MessageWrite {
            message: &w.message,
            position: w.position,
        })
        .collect();
    // Durable first; the cache only ever reflects committed state.
    storage.persist_batch(conversation_id, next_version, &message_writes)?;

    applier::commit_writes(&mut state.messages, writes);
    state.version = next_version;

    Ok(AppliedBatch {
        snapshot: snapshot_of(state),
        version: next_version,
    })
}

fn create_branch(
    conversation_id: &str,
    storage: &SqliteStorage,
    state: &mut ActorState,
    parent_id: String,
    origin_message_id: String,
    title: String,
) -> ArborResult<(Branch, u64)> {
    if !state.branches.contains_key(&parent_id) {
        return Err(ArborError::NotFound(format!(
            "parent branch {parent_id} does not exist"
        )));
    }
    let origin_exists = state
        .messages
        .get(&parent_id)
        .is_some_and(|msgs| msgs.iter().any(|m| m.id == origin_message_id));
    if !origin_exists {
        return Err(ArborError::NotFound(format!(
            "origin message {origin_message_id} not found in branch {parent_id}"
        )));
    }
    if title.trim().is_empty() {
        return Err(ArborError::Validation("branch title must not be empty".into()));
    }

    let branch = Branch::fork(parent_id, origin_message_id, title);
    let next_version = state.version + 1;
    storage.persist_branch(conversation_id, &branch, next_version)?;

    state.branches.insert(branch.id.clone(), branch.clone());
    state.messages.entry(branch.id.clone()).or_default();
    state.version = next_version;

    Ok((branch, next_version))
}

fn rename_branch(
    conversation_id: &str,
    storage: &SqliteStorage,
    state: &mut ActorState,
    branch_id: &str,
    title: String,
) -> ArborResult<u64> {
    if !state.branches.contains_key(branch_id) {
        return Err(ArborError::NotFound(format!(
            "branch {branch_id} does not exist"
        )));
    }
    if title.trim().is_empty() {
        return Err(ArborError::Validation("branch title must not be empty".into()));
    }

    let next_version = state.version + 1;
    storage.persist_branch_title(conversation_id, branch_id, &title, next_version)?;

    if let Some(branch) = state.branches.get_mut(branch_id) {
        branch.title = title;
    }
    state.version = next_version;
    Ok(next_version)
}

#[allow(clippy::too_many_arguments, reason = "actor command unpacking")]
fn upsert_ingestion(
    conversation_id: &str,
    storage: &SqliteStorage,
    collections: &Arc<RwLock<RetrievalCollections>>,
    attachment_id: String,
    status: IngestionStatus,
    summary: Option<String>,
    error: Option<String>,
    chunks: Option<Vec<AttachmentChunk>>,
) -> ArborResult<IngestionRecord> {
    let record = IngestionRecord {
        attachment_id: attachment_id.clone(),
        status,
        summary,
        error,
        chunk_count: chunks.as_ref().map_or_else(
            || {
                collections
                    .read()
                    .ingestions
                    .get(&attachment_id)
                    .map_or(0, |r| r.chunk_count)
            },
            Vec::len,
        ),
        updated_at: Utc::now(),
    };

    match chunks {
        Some(chunks) => {
            storage.replace_attachment_chunks(conversation_id, &record, &chunks)?;
            let mut view = collections.write();
            view.chunks.retain(|c| c.attachment_id != attachment_id);
            view.chunks.extend(chunks);
            view.ingestions.insert(attachment_id, record.clone());
        }
        None => {
            storage.replace_status_only(conversation_id, &record)?;
            collections
                .write()
                .ingestions
                .insert(attachment_id, record.clone());
        }
    }

    Ok(record)
}

fn upsert_snippets(
    conversation_id: &str,
    storage: &SqliteStorage,
    collections: &Arc<RwLock<RetrievalCollections>>,
    snippets: Vec<WebSearchSnippet>,
) -> ArborResult<()> {
    storage.upsert_snippets(conversation_id, &snippets)?;

    let mut view = collections.write();
    for snippet in snippets {
        if !view.snippets.iter().any(|s| s.id == snippet.id) {
            view.snippets.push(snippet);
        }
    }
    Ok(())
}
