//! Durable storage: SQLite conversation graphs and the blob store.
//!
//! One database serves all conversations; per-conversation write ordering
//! is guaranteed by the store actors above this layer, so the connection
//! only needs a plain mutex. Embeddings, settings, and metadata are stored
//! as JSON text columns.

pub mod blobs;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{
    AttachmentChunk, Branch, ChunkKind, ChunkMetadata, Conversation, ConversationSettings,
    IngestionRecord, IngestionStatus, Message, MessageRole, TokenUsage, WebSearchSnippet,
};
use crate::error::{ArborError, ArborResult};

/// Durable state for one conversation, loaded into the store actor cache.
#[derive(Debug, Clone)]
pub struct LoadedConversation {
    /// Conversation metadata.
    pub conversation: Conversation,
    /// Branches keyed by id.
    pub branches: HashMap<String, Branch>,
    /// Messages per branch, in append order.
    pub messages: HashMap<String, Vec<Message>>,
    /// Persisted version.
    pub version: u64,
    /// Attachment chunks owned by the conversation.
    pub chunks: Vec<AttachmentChunk>,
    /// Web snippets owned by the conversation.
    pub snippets: Vec<WebSearchSnippet>,
    /// Latest ingestion record per attachment.
    pub ingestions: HashMap<String, IngestionRecord>,
}

/// A message write queued for one durable batch.
#[derive(Debug)]
pub struct MessageWrite<'a> {
    /// The message to upsert.
    pub message: &'a Message,
    /// Stable position within its branch.
    pub position: usize,
}

/// SQLite-backed storage shared by all conversation actors.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish()
    }
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> ArborResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database, used by tests.
    pub fn in_memory() -> ArborResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> ArborResult<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // WAL lets retrieval reads proceed while an actor writes.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> ArborResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                root_branch_id TEXT NOT NULL,
                settings TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS branches (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                parent_id TEXT,
                origin_message_id TEXT,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_branches_conversation
                ON branches(conversation_id);
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                branch_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                token_usage TEXT,
                position INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, branch_id, id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_branch
                ON messages(conversation_id, branch_id, position);
            CREATE TABLE IF NOT EXISTS attachment_chunks (
                id TEXT PRIMARY KEY,
                attachment_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                embedding TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_attachment
                ON attachment_chunks(attachment_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_conversation
                ON attachment_chunks(conversation_id);
            CREATE TABLE IF NOT EXISTS web_snippets (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                snippet TEXT NOT NULL,
                embedding TEXT NOT NULL,
                provider TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snippets_conversation
                ON web_snippets(conversation_id);
            CREATE TABLE IF NOT EXISTS ingestions (
                attachment_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                status TEXT NOT NULL,
                summary TEXT,
                error TEXT,
                chunk_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;

        Ok(())
    }

    /// Load one conversation's full durable state, or `None` if it does
    /// not exist yet.
    pub fn load(&self, conversation_id: &str) -> ArborResult<Option<LoadedConversation>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT root_branch_id, settings, version, created_at
                 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((root_branch_id, settings_json, version, created_at)) = row else {
            return Ok(None);
        };

        let settings: ConversationSettings = serde_json::from_str(&settings_json)
            .map_err(|e| ArborError::Storage(format!("corrupt settings: {e}")))?;
        let conversation = Conversation {
            id: conversation_id.to_string(),
            root_branch_id,
            created_at: parse_ts(&created_at)?,
            settings,
        };

        let mut branches = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, parent_id, origin_message_id, title, created_at
                 FROM branches WHERE conversation_id = ?1",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            for row in rows {
                let (id, parent_id, origin_message_id, title, created_at) = row?;
                branches.insert(
                    id.clone(),
                    Branch {
                        id,
                        parent_id,
                        origin_message_id,
                        title,
                        created_at: parse_ts(&created_at)?,
                    },
                );
            }
        }

        let mut messages: HashMap<String, Vec<Message>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, branch_id, role, content, token_usage, created_at
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY branch_id, position",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?;
            for row in rows {
                let (id, branch_id, role, content, usage_json, created_at) = row?;
                let token_usage: Option<TokenUsage> = match usage_json {
                    Some(json) => Some(
                        serde_json::from_str(&json)
                            .map_err(|e| ArborError::Storage(format!("corrupt usage: {e}")))?,
                    ),
                    None => None,
                };
                messages.entry(branch_id.clone()).or_default().push(Message {
                    id,
                    branch_id,
                    role: parse_role(&role)?,
                    content,
                    created_at: parse_ts(&created_at)?,
                    token_usage,
                });
            }
        }

        // Branches without messages still get an (empty) entry, so the
        // snapshot shape does not depend on load vs. fresh creation.
        for branch_id in branches.keys() {
            messages.entry(branch_id.clone()).or_default();
        }

        let chunks = Self::load_chunks(&conn, conversation_id)?;
        let snippets = Self::load_snippets(&conn, conversation_id)?;
        let ingestions = Self::load_ingestions(&conn, conversation_id)?;

        Ok(Some(LoadedConversation {
            conversation,
            branches,
            messages,
            version: u64::try_from(version).unwrap_or(0),
            chunks,
            snippets,
            ingestions,
        }))
    }

    fn load_chunks(conn: &Connection, conversation_id: &str) -> ArborResult<Vec<AttachmentChunk>> {
        let mut stmt = conn.prepare(
            "SELECT id, attachment_id, kind, content, token_count, embedding, metadata, created_at
             FROM attachment_chunks WHERE conversation_id = ?1",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            let (id, attachment_id, kind, content, token_count, embedding, metadata, created_at) =
                row?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding)
                .map_err(|e| ArborError::Storage(format!("corrupt embedding: {e}")))?;
            let metadata: ChunkMetadata = serde_json::from_str(&metadata)
                .map_err(|e| ArborError::Storage(format!("corrupt chunk metadata: {e}")))?;
            chunks.push(AttachmentChunk {
                id,
                attachment_id,
                conversation_id: conversation_id.to_string(),
                kind: parse_kind(&kind)?,
                content,
                token_count: u32::try_from(token_count).unwrap_or(0),
                embedding,
                metadata,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(chunks)
    }

    fn load_snippets(
        conn: &Connection,
        conversation_id: &str,
    ) -> ArborResult<Vec<WebSearchSnippet>> {
        let mut stmt = conn.prepare(
            "SELECT id, title, url, snippet, embedding, provider, created_at
             FROM web_snippets WHERE conversation_id = ?1",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut snippets = Vec::new();
        for row in rows {
            let (id, title, url, snippet, embedding, provider, created_at) = row?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding)
                .map_err(|e| ArborError::Storage(format!("corrupt embedding: {e}")))?;
            snippets.push(WebSearchSnippet {
                id,
                conversation_id: conversation_id.to_string(),
                title,
                url,
                snippet,
                embedding,
                provider,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(snippets)
    }

    fn load_ingestions(
        conn: &Connection,
        conversation_id: &str,
    ) -> ArborResult<HashMap<String, IngestionRecord>> {
        let mut stmt = conn.prepare(
            "SELECT attachment_id, status, summary, error, chunk_count, updated_at
             FROM ingestions WHERE conversation_id = ?1",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut ingestions = HashMap::new();
        for row in rows {
            let (attachment_id, status, summary, error, chunk_count, updated_at) = row?;
            ingestions.insert(
                attachment_id.clone(),
                IngestionRecord {
                    attachment_id,
                    status: parse_status(&status)?,
                    summary,
                    error,
                    chunk_count: usize::try_from(chunk_count).unwrap_or(0),
                    updated_at: parse_ts(&updated_at)?,
                },
            );
        }
        Ok(ingestions)
    }

    /// Persist a freshly created conversation and its root branch.
    pub fn create_conversation(
        &self,
        conversation: &Conversation,
        root: &Branch,
    ) -> ArborResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO conversations (id, root_branch_id, settings, version, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                conversation.id,
                conversation.root_branch_id,
                serde_json::to_string(&conversation.settings)
                    .map_err(|e| ArborError::Storage(e.to_string()))?,
                conversation.created_at.to_rfc3339(),
            ],
        )?;
        Self::insert_branch(&tx, &conversation.id, root)?;

        tx.commit()?;
        Ok(())
    }

    /// Persist a message batch and the new version in one transaction.
    pub fn persist_batch(
        &self,
        conversation_id: &str,
        version: u64,
        writes: &[MessageWrite<'_>],
    ) -> ArborResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        for write in writes {
            let msg = write.message;
            let usage_json = msg
                .token_usage
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| ArborError::Storage(e.to_string()))?;
            tx.execute(
                "INSERT OR REPLACE INTO messages
                 (id, conversation_id, branch_id, role, content, token_usage, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    msg.id,
                    conversation_id,
                    msg.branch_id,
                    role_str(msg.role),
                    msg.content,
                    usage_json,
                    i64::try_from(write.position).unwrap_or(i64::MAX),
                    msg.created_at.to_rfc3339(),
                ],
            )?;
        }
        Self::bump_version(&tx, conversation_id, version)?;

        tx.commit()?;
        Ok(())
    }

    /// Persist a new branch and the new version in one transaction.
    pub fn persist_branch(
        &self,
        conversation_id: &str,
        branch: &Branch,
        version: u64,
    ) -> ArborResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::insert_branch(&tx, conversation_id, branch)?;
        Self::bump_version(&tx, conversation_id, version)?;
        tx.commit()?;
        Ok(())
    }

    /// Persist a branch rename and the new version in one transaction.
    pub fn persist_branch_title(
        &self,
        conversation_id: &str,
        branch_id: &str,
        title: &str,
        version: u64,
    ) -> ArborResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE branches SET title = ?1 WHERE id = ?2 AND conversation_id = ?3",
            params![title, branch_id, conversation_id],
        )?;
        Self::bump_version(&tx, conversation_id, version)?;
        tx.commit()?;
        Ok(())
    }

    /// Replace all chunks stored under an attachment id and record the
    /// ingestion outcome. Delete precedes insert so a re-parse producing
    /// fewer chunks leaves no stale higher-indexed rows.
    pub fn replace_attachment_chunks(
        &self,
        conversation_id: &str,
        record: &IngestionRecord,
        chunks: &[AttachmentChunk],
    ) -> ArborResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM attachment_chunks WHERE attachment_id = ?1",
            params![record.attachment_id],
        )?;
        for chunk in chunks {
            tx.execute(
                "INSERT INTO attachment_chunks
                 (id, attachment_id, conversation_id, kind, content, token_count,
                  embedding, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    chunk.id,
                    chunk.attachment_id,
                    conversation_id,
                    kind_str(chunk.kind),
                    chunk.content,
                    i64::from(chunk.token_count),
                    serde_json::to_string(&chunk.embedding)
                        .map_err(|e| ArborError::Storage(e.to_string()))?,
                    serde_json::to_string(&chunk.metadata)
                        .map_err(|e| ArborError::Storage(e.to_string()))?,
                    chunk.created_at.to_rfc3339(),
                ],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO ingestions
             (attachment_id, conversation_id, status, summary, error, chunk_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.attachment_id,
                conversation_id,
                status_str(record.status),
                record.summary,
                record.error,
                i64::try_from(record.chunk_count).unwrap_or(0),
                record.updated_at.to_rfc3339(),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Update an ingestion status record without touching the chunk set.
    pub fn replace_status_only(
        &self,
        conversation_id: &str,
        record: &IngestionRecord,
    ) -> ArborResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO ingestions
             (attachment_id, conversation_id, status, summary, error, chunk_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.attachment_id,
                conversation_id,
                status_str(record.status),
                record.summary,
                record.error,
                i64::try_from(record.chunk_count).unwrap_or(0),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Upsert web snippets, idempotent on snippet id.
    pub fn upsert_snippets(
        &self,
        conversation_id: &str,
        snippets: &[WebSearchSnippet],
    ) -> ArborResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for snippet in snippets {
            tx.execute(
                "INSERT OR IGNORE INTO web_snippets
                 (id, conversation_id, title, url, snippet, embedding, provider, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    snippet.id,
                    conversation_id,
                    snippet.title,
                    snippet.url,
                    snippet.snippet,
                    serde_json::to_string(&snippet.embedding)
                        .map_err(|e| ArborError::Storage(e.to_string()))?,
                    snippet.provider,
                    snippet.created_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_branch(tx: &rusqlite::Transaction<'_>, conversation_id: &str, branch: &Branch) -> ArborResult<()> {
        tx.execute(
            "INSERT INTO branches
             (id, conversation_id, parent_id, origin_message_id, title, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                branch.id,
                conversation_id,
                branch.parent_id,
                branch.origin_message_id,
                branch.title,
                branch.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn bump_version(
        tx: &rusqlite::Transaction<'_>,
        conversation_id: &str,
        version: u64,
    ) -> ArborResult<()> {
        tx.execute(
            "UPDATE conversations SET version = ?1 WHERE id = ?2",
            params![i64::try_from(version).unwrap_or(i64::MAX), conversation_id],
        )?;
        Ok(())
    }
}

fn parse_ts(raw: &str) -> ArborResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ArborError::Storage(format!("corrupt timestamp {raw:?}: {e}")))
}

fn parse_role(raw: &str) -> ArborResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        other => Err(ArborError::Storage(format!("corrupt role {other:?}"))),
    }
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn parse_kind(raw: &str) -> ArborResult<ChunkKind> {
    match raw {
        "text" => Ok(ChunkKind::Text),
        "image" => Ok(ChunkKind::Image),
        other => Err(ArborError::Storage(format!("corrupt chunk kind {other:?}"))),
    }
}

fn kind_str(kind: ChunkKind) -> &'static str {
    match kind {
        ChunkKind::Text => "text",
        ChunkKind::Image => "image",
    }
}

fn parse_status(raw: &str) -> ArborResult<IngestionStatus> {
    match raw {
        "pending" => Ok(IngestionStatus::Pending),
        "ready" => Ok(IngestionStatus::Ready),
        "failed" => Ok(IngestionStatus::Failed),
        other => Err(ArborError::Storage(format!(
            "corrupt ingestion status {other:?}"
        ))),
    }
}

fn status_str(status: IngestionStatus) -> &'static str {
    match status {
        IngestionStatus::Pending => "pending",
        IngestionStatus::Ready => "ready",
        IngestionStatus::Failed => "failed",
    }
}
