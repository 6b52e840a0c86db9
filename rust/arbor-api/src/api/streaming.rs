//! SSE streaming endpoint for generation events.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::Stream;
use tokio::sync::broadcast;

use crate::error::ArborError;
use crate::events::{StreamEvent, StreamEventKind};
use crate::AppState;

/// Streaming routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/streams/{stream_id}", get(subscribe_stream))
        .route(
            "/api/v1/conversations/{id}/branches/{branch_id}/stream",
            get(active_stream),
        )
}

/// Authoritative active-stream lookup for a (conversation, branch) pair.
///
/// Clients may hold a stream id as a reconnection hint, but only the
/// broker can arbitrate across tabs and devices.
async fn active_stream(
    State(state): State<AppState>,
    Path((conversation_id, branch_id)): Path<(String, String)>,
) -> axum::Json<serde_json::Value> {
    let stream_id = state.broker.active_stream_id(&conversation_id, &branch_id);
    axum::Json(serde_json::json!({ "streamId": stream_id }))
}

/// Subscribe to a generation's event stream.
///
/// A late joiner first receives a full-content `delta` carrying the
/// buffered content, then live events. The stream closes after a
/// terminal `complete` or `error` event. Subscribing to a superseded or
/// finished stream id is a 404: that id yields no further events.
async fn subscribe_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ArborError> {
    let subscription = state
        .broker
        .subscribe(&stream_id)
        .ok_or_else(|| ArborError::NotFound(format!("stream {stream_id} is not active")))?;

    let stream = async_stream::stream! {
        if let Some(content) = subscription.buffered {
            let replay = StreamEvent::new(stream_id.clone(), 0, StreamEventKind::full_content(content));
            yield Ok::<_, Infallible>(sse_event(&replay));
        }

        let mut rx = subscription.receiver;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    yield Ok(sse_event(&event));
                    if terminal {
                        break;
                    }
                }
                // Slow consumer: resume with the live tail.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(stream_id = %stream_id, skipped, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.event_type())
        .data(serde_json::to_string(event).unwrap_or_default())
}
