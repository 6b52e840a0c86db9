//! Normalized streaming event model.
//!
//! Provider-specific payloads are adapted into [`ProviderEvent`] at the
//! driver boundary, so internal logic never depends on a third party's
//! exact wire shape. The broker turns provider events into
//! [`StreamEvent`]s, the subscriber-facing sequence delivered over SSE.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::TokenUsage;

/// A normalized event from a completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// The provider accepted the request and will begin streaming.
    Started,
    /// Incremental assistant text.
    Delta {
        /// The text fragment.
        text: String,
    },
    /// Incremental reasoning-summary text.
    ReasoningDelta {
        /// The summary fragment.
        text: String,
    },
    /// A tool invocation progressed.
    ToolProgress {
        /// Tool name.
        tool: String,
        /// Provider-reported status.
        status: String,
    },
    /// The generation finished; carries the resolved final text and usage.
    Completed {
        /// Full final text.
        text: String,
        /// Token accounting, if the provider reported it.
        usage: Option<TokenUsage>,
    },
    /// The generation failed upstream.
    Failed {
        /// Failure reason.
        reason: String,
    },
}

/// Lifecycle state of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    /// Upstream request issued, nothing received yet.
    Connecting,
    /// Deltas flowing.
    Streaming,
    /// Terminal: finished cleanly.
    Complete,
    /// Terminal: failed upstream.
    Error,
}

/// A subscriber-facing stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEventKind {
    /// The generation started.
    Start,
    /// Incremental or full-content payload.
    Delta {
        /// Cumulative content, sent on late-join recovery.
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Incremental fragment.
        #[serde(skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },
    /// Auxiliary reasoning-summary payload.
    ReasoningSummary {
        /// Cumulative reasoning summary.
        reasoning_summary: String,
    },
    /// Auxiliary tool progress payload.
    ToolProgress {
        /// Tool name.
        tool: String,
        /// Status text.
        status: String,
    },
    /// The generation completed; carries the final content.
    Complete {
        /// Full final content.
        content: String,
    },
    /// The generation failed.
    Error {
        /// Failure message.
        message: String,
    },
}

/// A stream event with delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Unique event id.
    pub id: String,
    /// Sequence number within the stream.
    pub seq: u64,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// The event payload.
    #[serde(flatten)]
    pub kind: StreamEventKind,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    /// Create a new event for `stream_id` with sequence `seq`.
    pub fn new(stream_id: impl Into<String>, seq: u64, kind: StreamEventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq,
            stream_id: stream_id.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    /// SSE event name for this event.
    pub fn event_type(&self) -> &'static str {
        match &self.kind {
            StreamEventKind::Start => "start",
            StreamEventKind::Delta { .. } => "delta",
            StreamEventKind::ReasoningSummary { .. } => "reasoning_summary",
            StreamEventKind::ToolProgress { .. } => "tool_progress",
            StreamEventKind::Complete { .. } => "complete",
            StreamEventKind::Error { .. } => "error",
        }
    }

    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            StreamEventKind::Complete { .. } | StreamEventKind::Error { .. }
        )
    }
}

impl StreamEventKind {
    /// Incremental delta payload.
    pub fn delta(fragment: impl Into<String>) -> Self {
        Self::Delta {
            content: None,
            delta: Some(fragment.into()),
        }
    }

    /// Full-content payload, used to catch late joiners up.
    pub fn full_content(content: impl Into<String>) -> Self {
        Self::Delta {
            content: Some(content.into()),
            delta: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_match_wire_names() {
        let ev = StreamEvent::new("s-1", 0, StreamEventKind::Start);
        assert_eq!(ev.event_type(), "start");

        let ev = StreamEvent::new("s-1", 1, StreamEventKind::delta("hi"));
        assert_eq!(ev.event_type(), "delta");

        let ev = StreamEvent::new(
            "s-1",
            2,
            StreamEventKind::Complete {
                content: "done".into(),
            },
        );
        assert_eq!(ev.event_type(), "complete");
        assert!(ev.is_terminal());
    }

    #[test]
    fn delta_serializes_incremental_and_full_payloads() {
        let incremental = serde_json::to_value(StreamEventKind::delta("abc")).unwrap();
        assert_eq!(incremental["delta"], "abc");
        assert!(incremental.get("content").is_none());

        let full = serde_json::to_value(StreamEventKind::full_content("abcdef")).unwrap();
        assert_eq!(full["content"], "abcdef");
        assert!(full.get("delta").is_none());
    }

    #[test]
    fn provider_events_round_trip() {
        let ev = ProviderEvent::Completed {
            text: "final".into(),
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                cost_usd: None,
            }),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "completed");
        let back: ProviderEvent = serde_json::from_value(json).unwrap();
        match back {
            ProviderEvent::Completed { text, usage } => {
                assert_eq!(text, "final");
                assert_eq!(usage.unwrap().completion_tokens, 5);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
