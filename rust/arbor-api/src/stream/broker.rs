//! Stream broker: one active generation per (conversation, branch).
//!
//! The broker fans lifecycle events out to any number of subscribers over
//! broadcast channels and checkpoints partial content into the graph
//! store on a throttle, so a fast token stream cannot overwhelm durable
//! storage. Persistence never waits on subscriber presence: a dropped
//! subscriber never halts a generation or its checkpoints.
//!
//! Starting a new generation for a pair that already has one supersedes
//! the old generation: the active-stream marker atomically repoints at
//! the new stream id and the orphaned task is cancelled through its
//! token. The cancelled task still checkpoints whatever it buffered, so
//! partial work is never discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{TokenUsage, UpdateOp};
use crate::error::{ArborError, ArborResult};
use crate::events::{ProviderEvent, StreamEvent, StreamEventKind, StreamPhase};
use crate::graph::ConversationHandle;
use crate::llm::{CompletionDriver, CompletionRequest};

/// Broadcast capacity per stream. A subscriber lagging by more than this
/// many events observes `Lagged` and loses the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Persisted in place of content when a generation fails before any
/// content was buffered, so no assistant turn is left permanently empty.
pub const INTERRUPTED_NOTICE: &str =
    "_The response was interrupted before any content arrived. Please retry._";

/// Checkpoint throttle thresholds; a checkpoint fires when either is hit.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Minimum interval between checkpoints.
    pub interval: Duration,
    /// Buffered character count that forces a checkpoint.
    pub chars: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(150),
            chars: 24,
        }
    }
}

/// Shared state of one in-flight generation.
struct ActiveStream {
    stream_id: String,
    sender: broadcast::Sender<StreamEvent>,
    /// Cumulative content, retained so late joiners can catch up.
    content: Arc<RwLock<String>>,
    phase: Arc<RwLock<StreamPhase>>,
    cancel: CancellationToken,
}

/// A live subscription to a stream.
#[derive(Debug)]
pub struct StreamSubscription {
    /// Receiver of future events.
    pub receiver: broadcast::Receiver<StreamEvent>,
    /// Cumulative content at subscription time; non-empty for late
    /// joiners, delivered ahead of live events as a full-content delta.
    pub buffered: Option<String>,
    /// Phase at subscription time.
    pub phase: StreamPhase,
}

/// Broker tracking the active generation per (conversation, branch).
#[derive(Clone)]
pub struct StreamBroker {
    active: Arc<RwLock<HashMap<(String, String), ActiveStream>>>,
    by_stream: Arc<RwLock<HashMap<String, (String, String)>>>,
    throttle: ThrottleConfig,
}

impl std::fmt::Debug for StreamBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBroker")
            .field("active_streams", &self.active.read().len())
            .finish()
    }
}

impl StreamBroker {
    /// Create a broker with the given throttle thresholds.
    pub fn new(throttle: ThrottleConfig) -> Self {
        Self {
            active: Arc::new(RwLock::new(HashMap::new())),
            by_stream: Arc::new(RwLock::new(HashMap::new())),
            throttle,
        }
    }

    /// Start a generation for an assistant placeholder message.
    ///
    /// Supersedes any generation already active for the same
    /// (conversation, branch): the marker repoints at the new stream id
    /// before the old task is cancelled.
    pub fn start_generation(
        &self,
        handle: ConversationHandle,
        branch_id: impl Into<String>,
        assistant_message_id: impl Into<String>,
        driver: Arc<dyn CompletionDriver>,
        request: CompletionRequest,
    ) -> String {
        let branch_id = branch_id.into();
        let assistant_message_id = assistant_message_id.into();
        let key = (handle.conversation_id().to_string(), branch_id.clone());
        let stream_id = Uuid::new_v4().to_string();

        let (sender, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stream = ActiveStream {
            stream_id: stream_id.clone(),
            sender: sender.clone(),
            content: Arc::new(RwLock::new(String::new())),
            phase: Arc::new(RwLock::new(StreamPhase::Connecting)),
            cancel: CancellationToken::new(),
        };
        let content = Arc::clone(&stream.content);
        let phase = Arc::clone(&stream.phase);
        let cancel = stream.cancel.clone();

        {
            let mut active = self.active.write();
            let mut by_stream = self.by_stream.write();
            if let Some(old) = active.insert(key.clone(), stream) {
                tracing::info!(
                    conversation_id = %key.0,
                    branch_id = %key.1,
                    superseded = %old.stream_id,
                    replacement = %stream_id,
                    "superseding active generation"
                );
                by_stream.remove(&old.stream_id);
                old.cancel.cancel();
            }
            by_stream.insert(stream_id.clone(), key.clone());
        }

        let task = GenerationTask {
            broker: self.clone(),
            handle,
            key,
            stream_id: stream_id.clone(),
            branch_id,
            assistant_message_id,
            sender,
            content,
            phase,
            cancel,
            throttle: self.throttle,
        };
        tokio::spawn(task.run(driver, request));

        stream_id
    }

    /// Subscribe to a stream by id.
    ///
    /// Returns `None` when the id is unknown or no longer the active
    /// stream for its pair; a superseded id yields no further events.
    pub fn subscribe(&self, stream_id: &str) -> Option<StreamSubscription> {
        let by_stream = self.by_stream.read();
        let key = by_stream.get(stream_id)?;
        let active = self.active.read();
        let stream = active.get(key)?;
        if stream.stream_id != stream_id {
            return None;
        }
        let buffered = {
            let content = stream.content.read();
            (!content.is_empty()).then(|| content.clone())
        };
        Some(StreamSubscription {
            receiver: stream.sender.subscribe(),
            buffered,
            phase: *stream.phase.read(),
        })
    }

    /// The active stream id for a (conversation, branch) pair, if any.
    pub fn active_stream_id(&self, conversation_id: &str, branch_id: &str) -> Option<String> {
        let active = self.active.read();
        active
            .get(&(conversation_id.to_string(), branch_id.to_string()))
            .map(|s| s.stream_id.clone())
    }

    /// Clear the marker for a finished stream, unless it was superseded.
    fn clear(&self, key: &(String, String), stream_id: &str) {
        let mut active = self.active.write();
        let mut by_stream = self.by_stream.write();
        if active.get(key).is_some_and(|s| s.stream_id == stream_id) {
            active.remove(key);
        }
        by_stream.remove(stream_id);
    }
}

/// Everything one generation task needs; consumed by [`GenerationTask::run`].
struct GenerationTask {
    broker: StreamBroker,
    handle: ConversationHandle,
    key: (String, String),
    stream_id: String,
    branch_id: String,
    assistant_message_id: String,
    sender: broadcast::Sender<StreamEvent>,
    content: Arc<RwLock<String>>,
    phase: Arc<RwLock<StreamPhase>>,
    cancel: CancellationToken,
    throttle: ThrottleConfig,
}

impl GenerationTask {
    async fn run(self, driver: Arc<dyn CompletionDriver>, request: CompletionRequest) {
        let mut seq = 0u64;
        self.emit(&mut seq, StreamEventKind::Start);

        let stream = match driver.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(&mut seq, &format!("provider request failed: {e}"))
                    .await;
                return;
            }
        };
        futures::pin_mut!(stream);

        let mut last_persist = Instant::now();
        let mut chars_since_persist = 0usize;
        let mut reasoning = String::new();

        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => {
                    // Superseded: keep whatever streamed in so far.
                    tracing::debug!(stream_id = %self.stream_id, "generation cancelled");
                    let buffered = self.content.read().clone();
                    if !buffered.is_empty() {
                        let _ = self.checkpoint(buffered, None).await;
                    }
                    *self.phase.write() = StreamPhase::Error;
                    self.broker.clear(&self.key, &self.stream_id);
                    return;
                }
                next = stream.next() => next,
            };

            match event {
                Some(Ok(ProviderEvent::Started)) => {
                    *self.phase.write() = StreamPhase::Streaming;
                }
                Some(Ok(ProviderEvent::Delta { text })) => {
                    *self.phase.write() = StreamPhase::Streaming;
                    chars_since_persist += text.chars().count();
                    {
                        self.content.write().push_str(&text);
                    }
                    self.emit(&mut seq, StreamEventKind::delta(text));

                    let due = last_persist.elapsed() >= self.throttle.interval
                        || chars_since_persist >= self.throttle.chars;
                    if due {
                        let buffered = self.content.read().clone();
                        if self.checkpoint(buffered, None).await.is_err() {
                            self.fail(&mut seq, "checkpoint write failed").await;
                            return;
                        }
                        last_persist = Instant::now();
                        chars_since_persist = 0;
                    }
                }
                Some(Ok(ProviderEvent::ReasoningDelta { text })) => {
                    reasoning.push_str(&text);
                    self.emit(
                        &mut seq,
                        StreamEventKind::ReasoningSummary {
                            reasoning_summary: reasoning.clone(),
                        },
                    );
                }
                Some(Ok(ProviderEvent::ToolProgress { tool, status })) => {
                    self.emit(&mut seq, StreamEventKind::ToolProgress { tool, status });
                }
                Some(Ok(ProviderEvent::Completed { text, usage })) => {
                    self.complete(&mut seq, text, usage).await;
                    return;
                }
                Some(Ok(ProviderEvent::Failed { reason })) => {
                    self.fail(&mut seq, &reason).await;
                    return;
                }
                Some(Err(e)) => {
                    self.fail(&mut seq, &e.to_string()).await;
                    return;
                }
                None => {
                    // Stream ended without a terminal event; resolve with
                    // the buffered content.
                    let buffered = self.content.read().clone();
                    self.complete(&mut seq, buffered, None).await;
                    return;
                }
            }
        }
    }

    async fn complete(&self, seq: &mut u64, text: String, usage: Option<TokenUsage>) {
        let final_content = if text.is_empty() {
            self.content.read().clone()
        } else {
            *self.content.write() = text.clone();
            text
        };

        if self.checkpoint(final_content.clone(), usage).await.is_err() {
            self.fail(seq, "final checkpoint write failed").await;
            return;
        }

        *self.phase.write() = StreamPhase::Complete;
        self.emit(
            seq,
            StreamEventKind::Complete {
                content: final_content,
            },
        );
        self.broker.clear(&self.key, &self.stream_id);
    }

    /// Persist what we have (or the interrupted notice), then surface the
    /// error to subscribers. Buffered partial work is never discarded.
    async fn fail(&self, seq: &mut u64, reason: &str) {
        tracing::warn!(
            stream_id = %self.stream_id,
            reason,
            "generation failed; persisting buffered content"
        );
        let buffered = self.content.read().clone();
        let persisted = if buffered.is_empty() {
            INTERRUPTED_NOTICE.to_string()
        } else {
            buffered
        };
        if let Err(e) = self.checkpoint(persisted, None).await {
            tracing::error!(
                stream_id = %self.stream_id,
                error = %e,
                "failed to persist content for failed generation"
            );
        }

        *self.phase.write() = StreamPhase::Error;
        self.emit(
            seq,
            StreamEventKind::Error {
                message: reason.to_string(),
            },
        );
        self.broker.clear(&self.key, &self.stream_id);
    }

    async fn checkpoint(&self, content: String, usage: Option<TokenUsage>) -> ArborResult<()> {
        self.handle
            .apply_updates(vec![UpdateOp::update(
                self.branch_id.clone(),
                self.assistant_message_id.clone(),
                content,
                usage,
            )])
            .await
            .map(|_| ())
            .map_err(|e| {
                tracing::error!(
                    stream_id = %self.stream_id,
                    error = %e,
                    "checkpoint failed"
                );
                ArborError::Storage(e.to_string())
            })
    }

    fn emit(&self, seq: &mut u64, kind: StreamEventKind) {
        let event = StreamEvent::new(self.stream_id.clone(), *seq, kind);
        *seq += 1;
        // Fire-and-forget: no subscribers is not an error.
        let _ = self.sender.send(event);
    }
}
