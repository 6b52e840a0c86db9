//! Generation lifecycle: streaming, checkpoints, supersession, and
//! failure degradation, driven by a scripted provider.

mod support;

use std::time::Duration;

use arbor_api::domain::{Message, TokenUsage, UpdateOp};
use arbor_api::events::{ProviderEvent, StreamEvent, StreamEventKind};
use arbor_api::graph::{ConversationHandle, StoreRegistry};
use arbor_api::llm::CompletionRequest;
use arbor_api::storage::SqliteStorage;
use arbor_api::stream::{StreamBroker, ThrottleConfig, INTERRUPTED_NOTICE};
use std::sync::Arc;
use support::{ScriptStep, ScriptedDriver};

fn broker() -> StreamBroker {
    StreamBroker::new(ThrottleConfig {
        interval: Duration::from_millis(150),
        chars: 24,
    })
}

/// Send a user turn and assistant placeholder; returns (root, placeholder id).
async fn send_exchange(handle: &ConversationHandle, content: &str) -> (String, String) {
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;
    let user = Message::user(root.clone(), content);
    let placeholder = Message::assistant_placeholder(root.clone());
    let applied = handle
        .apply_updates(vec![
            UpdateOp::append(user),
            UpdateOp::append(placeholder.clone()),
        ])
        .await
        .unwrap();
    assert_eq!(applied.version, 1);
    (root, placeholder.id)
}

async fn collect_until_terminal(
    rx: &mut tokio::sync::broadcast::Receiver<StreamEvent>,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("stream did not terminate in time");
        match event {
            Ok(event) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    events
}

#[tokio::test]
async fn send_stream_complete_scenario() {
    let registry = StoreRegistry::new(SqliteStorage::in_memory().unwrap());
    let handle = registry.handle("conv-1");
    let (root, placeholder_id) = send_exchange(&handle, "Explain recursion.").await;

    let usage = TokenUsage {
        prompt_tokens: 12,
        completion_tokens: 9,
        cost_usd: None,
    };
    let driver = Arc::new(ScriptedDriver::streaming(
        &["Recur", "sion is a function calling itself."],
        Some(usage),
    ));

    let broker = broker();
    let stream_id = broker.start_generation(
        handle.clone(),
        root.clone(),
        placeholder_id.clone(),
        driver,
        CompletionRequest::new(Vec::new()),
    );

    let mut sub = broker.subscribe(&stream_id).expect("stream is active");
    let events = collect_until_terminal(&mut sub.receiver).await;

    // start, two deltas, complete - in order.
    assert!(matches!(events[0].kind, StreamEventKind::Start));
    let deltas: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            StreamEventKind::Delta { delta, .. } => delta.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Recur", "sion is a function calling itself."]);
    match &events.last().unwrap().kind {
        StreamEventKind::Complete { content } => {
            assert_eq!(content, "Recursion is a function calling itself.");
        }
        other => panic!("expected complete, got {other:?}"),
    }

    // The final checkpoint froze the assistant turn with usage attached,
    // and the version advanced monotonically past the send batch.
    let snapshot = handle.snapshot().await.unwrap();
    let msg = snapshot
        .message(&root, &placeholder_id)
        .expect("assistant message exists");
    assert_eq!(msg.content, "Recursion is a function calling itself.");
    assert_eq!(msg.token_usage, Some(usage));
    assert!(snapshot.version > 1);

    // Marker cleared after completion.
    assert!(broker.active_stream_id("conv-1", &root).is_none());
    assert!(broker.subscribe(&stream_id).is_none());
}

#[tokio::test]
async fn checkpoints_fire_on_char_threshold_before_completion() {
    let registry = StoreRegistry::new(SqliteStorage::in_memory().unwrap());
    let handle = registry.handle("conv-1");
    let (root, placeholder_id) = send_exchange(&handle, "Write a paragraph.").await;

    // 30 chars in the first delta crosses the 24-char threshold; the
    // script then stalls, leaving the checkpoint observable mid-stream.
    let driver = Arc::new(ScriptedDriver::new(vec![
        ScriptStep::Emit(ProviderEvent::Started),
        ScriptStep::Emit(ProviderEvent::Delta {
            text: "012345678901234567890123456789".into(),
        }),
        ScriptStep::Wait(Duration::from_millis(400)),
        ScriptStep::Emit(ProviderEvent::Completed {
            text: "012345678901234567890123456789 done".into(),
            usage: None,
        }),
    ]));

    let broker = broker();
    broker.start_generation(
        handle.clone(),
        root.clone(),
        placeholder_id.clone(),
        driver,
        CompletionRequest::new(Vec::new()),
    );

    // Partial content is durable while the stream is still open.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = handle.snapshot().await.unwrap();
    let msg = snapshot.message(&root, &placeholder_id).unwrap();
    assert_eq!(msg.content, "012345678901234567890123456789");
    assert_eq!(snapshot.version, 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let snapshot = handle.snapshot().await.unwrap();
    let msg = snapshot.message(&root, &placeholder_id).unwrap();
    assert_eq!(msg.content, "012345678901234567890123456789 done");
}

#[tokio::test]
async fn late_joiner_recovers_buffered_content() {
    let registry = StoreRegistry::new(SqliteStorage::in_memory().unwrap());
    let handle = registry.handle("conv-1");
    let (root, placeholder_id) = send_exchange(&handle, "hello").await;

    let driver = Arc::new(ScriptedDriver::new(vec![
        ScriptStep::Emit(ProviderEvent::Started),
        ScriptStep::Emit(ProviderEvent::Delta {
            text: "Hello ".into(),
        }),
        ScriptStep::Wait(Duration::from_millis(300)),
        ScriptStep::Emit(ProviderEvent::Delta {
            text: "world".into(),
        }),
        ScriptStep::Emit(ProviderEvent::Completed {
            text: "Hello world".into(),
            usage: None,
        }),
    ]));

    let broker = broker();
    let stream_id = broker.start_generation(
        handle,
        root,
        placeholder_id,
        driver,
        CompletionRequest::new(Vec::new()),
    );

    // Join after the first delta has streamed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut sub = broker.subscribe(&stream_id).expect("still active");
    assert_eq!(sub.buffered.as_deref(), Some("Hello "));

    // Only future events arrive on the receiver; buffered content covers
    // the past.
    let events = collect_until_terminal(&mut sub.receiver).await;
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, StreamEventKind::Delta { delta: Some(d), .. } if d == "world")));
}

#[tokio::test]
async fn superseding_generation_repoints_marker_and_cancels_old() {
    let registry = StoreRegistry::new(SqliteStorage::in_memory().unwrap());
    let handle = registry.handle("conv-1");
    let (root, placeholder_id) = send_exchange(&handle, "first ask").await;

    // The first generation would run for a long time if not cancelled.
    let slow = Arc::new(ScriptedDriver::new(vec![
        ScriptStep::Emit(ProviderEvent::Started),
        ScriptStep::Emit(ProviderEvent::Delta {
            text: "partial answer".into(),
        }),
        ScriptStep::Wait(Duration::from_secs(30)),
        ScriptStep::Emit(ProviderEvent::Completed {
            text: "never reached".into(),
            usage: None,
        }),
    ]));

    let broker = broker();
    let first_id = broker.start_generation(
        handle.clone(),
        root.clone(),
        placeholder_id.clone(),
        slow,
        CompletionRequest::new(Vec::new()),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A fresh exchange supersedes the first one, as a retry would.
    let user2 = Message::user(root.clone(), "ask again");
    let placeholder2 = Message::assistant_placeholder(root.clone());
    handle
        .apply_updates(vec![
            UpdateOp::append(user2),
            UpdateOp::append(placeholder2.clone()),
        ])
        .await
        .unwrap();

    let fast = Arc::new(ScriptedDriver::streaming(&["replacement"], None));
    let second_id = broker.start_generation(
        handle.clone(),
        root.clone(),
        placeholder2.id.clone(),
        fast,
        CompletionRequest::new(Vec::new()),
    );

    // Marker references only the newer stream; the old id is dead to new
    // subscribers.
    assert_eq!(
        broker.active_stream_id("conv-1", &root),
        Some(second_id.clone())
    );
    assert!(broker.subscribe(&first_id).is_none());

    let mut sub = broker.subscribe(&second_id).expect("new stream is active");
    let events = collect_until_terminal(&mut sub.receiver).await;
    assert!(matches!(
        events.last().unwrap().kind,
        StreamEventKind::Complete { .. }
    ));

    // Give the cancelled task time to land its final checkpoint.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = handle.snapshot().await.unwrap();
    // The superseded generation checkpointed its buffered work on the old
    // placeholder; the replacement completed on the new one.
    let old = snapshot.message(&root, &placeholder_id).unwrap();
    assert_eq!(old.content, "partial answer");
    let new = snapshot.message(&root, &placeholder2.id).unwrap();
    assert_eq!(new.content, "replacement");
}

#[tokio::test]
async fn upstream_failure_persists_partial_content() {
    let registry = StoreRegistry::new(SqliteStorage::in_memory().unwrap());
    let handle = registry.handle("conv-1");
    let (root, placeholder_id) = send_exchange(&handle, "doomed ask").await;

    let driver = Arc::new(ScriptedDriver::new(vec![
        ScriptStep::Emit(ProviderEvent::Started),
        ScriptStep::Emit(ProviderEvent::Delta {
            text: "partial thoughts".into(),
        }),
        ScriptStep::Emit(ProviderEvent::Failed {
            reason: "upstream 503".into(),
        }),
    ]));

    let broker = broker();
    let stream_id = broker.start_generation(
        handle.clone(),
        root.clone(),
        placeholder_id.clone(),
        driver,
        CompletionRequest::new(Vec::new()),
    );

    let mut sub = broker.subscribe(&stream_id).expect("stream is active");
    let events = collect_until_terminal(&mut sub.receiver).await;
    assert!(matches!(
        events.last().unwrap().kind,
        StreamEventKind::Error { .. }
    ));

    // Buffered work is never discarded.
    let snapshot = handle.snapshot().await.unwrap();
    let msg = snapshot.message(&root, &placeholder_id).unwrap();
    assert_eq!(msg.content, "partial thoughts");
}

#[tokio::test]
async fn failure_with_empty_buffer_persists_interrupted_notice() {
    let registry = StoreRegistry::new(SqliteStorage::in_memory().unwrap());
    let handle = registry.handle("conv-1");
    let (root, placeholder_id) = send_exchange(&handle, "never answered").await;

    let driver = Arc::new(ScriptedDriver::new(vec![ScriptStep::Emit(
        ProviderEvent::Failed {
            reason: "connection reset".into(),
        },
    )]));

    let broker = broker();
    let stream_id = broker.start_generation(
        handle.clone(),
        root.clone(),
        placeholder_id.clone(),
        driver,
        CompletionRequest::new(Vec::new()),
    );

    let mut sub = broker.subscribe(&stream_id).expect("stream is active");
    collect_until_terminal(&mut sub.receiver).await;

    // No assistant turn is ever left permanently empty.
    let snapshot = handle.snapshot().await.unwrap();
    let msg = snapshot.message(&root, &placeholder_id).unwrap();
    assert_eq!(msg.content, INTERRUPTED_NOTICE);
}

#[tokio::test]
async fn reasoning_and_tool_events_are_forwarded() {
    let registry = StoreRegistry::new(SqliteStorage::in_memory().unwrap());
    let handle = registry.handle("conv-1");
    let (root, placeholder_id) = send_exchange(&handle, "search something").await;

    let driver = Arc::new(ScriptedDriver::new(vec![
        ScriptStep::Emit(ProviderEvent::Started),
        ScriptStep::Emit(ProviderEvent::ReasoningDelta {
            text: "Considering sources. ".into(),
        }),
        ScriptStep::Emit(ProviderEvent::ToolProgress {
            tool: "web_search".into(),
            status: "running".into(),
        }),
        ScriptStep::Emit(ProviderEvent::Delta {
            text: "Answer.".into(),
        }),
        ScriptStep::Emit(ProviderEvent::Completed {
            text: "Answer.".into(),
            usage: None,
        }),
    ]));

    let broker = broker();
    let stream_id = broker.start_generation(
        handle,
        root,
        placeholder_id,
        driver,
        CompletionRequest::new(Vec::new()),
    );

    let mut sub = broker.subscribe(&stream_id).expect("stream is active");
    let events = collect_until_terminal(&mut sub.receiver).await;

    assert!(events.iter().any(|e| matches!(
        &e.kind,
        StreamEventKind::ReasoningSummary { reasoning_summary } if reasoning_summary.contains("Considering")
    )));
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        StreamEventKind::ToolProgress { tool, .. } if tool == "web_search"
    )));
}
