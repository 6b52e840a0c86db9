//! Store consistency: atomic batches, exactly-one version bump,
//! serialized concurrent writers, and branch lifecycle.

use arbor_api::domain::{Message, MessageRole, TokenUsage, UpdateOp};
use arbor_api::graph::{build_tree, thread_for_branch, StoreRegistry};
use arbor_api::storage::SqliteStorage;

fn registry() -> StoreRegistry {
    StoreRegistry::new(SqliteStorage::in_memory().unwrap())
}

#[tokio::test]
async fn first_access_creates_conversation_with_root_branch() {
    let registry = registry();
    let handle = registry.handle("conv-1");

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.version, 0);
    assert_eq!(snapshot.branches.len(), 1);
    let root = &snapshot.branches[&snapshot.conversation.root_branch_id];
    assert_eq!(root.title, "Main Branch");
    assert!(root.parent_id.is_none());
}

#[tokio::test]
async fn concurrent_first_access_yields_one_consistent_store() {
    let registry = std::sync::Arc::new(registry());

    // Many callers race the initialization barrier; all must resolve
    // against the same store without deadlock.
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = std::sync::Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            registry.handle("conv-1").snapshot().await
        }));
    }

    let mut root_ids = std::collections::HashSet::new();
    for task in tasks {
        let snapshot = task.await.unwrap().unwrap();
        root_ids.insert(snapshot.conversation.root_branch_id);
    }
    assert_eq!(root_ids.len(), 1);
    assert_eq!(registry.active_conversations(), 1);
}

#[tokio::test]
async fn batch_bumps_version_exactly_once_and_lands_every_op() {
    let registry = registry();
    let handle = registry.handle("conv-1");
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;

    let user = Message::user(root.clone(), "Explain recursion.");
    let placeholder = Message::assistant_placeholder(root.clone());
    let applied = handle
        .apply_updates(vec![
            UpdateOp::append(user.clone()),
            UpdateOp::append(placeholder.clone()),
        ])
        .await
        .unwrap();

    // Two ops, one bump.
    assert_eq!(applied.version, 1);
    let msgs = &applied.snapshot.messages[&root];
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].id, user.id);
    assert_eq!(msgs[1].id, placeholder.id);
    assert_eq!(msgs[1].role, MessageRole::Assistant);
    assert!(msgs[1].content.is_empty());
}

#[tokio::test]
async fn invalid_batch_leaves_state_untouched() {
    let registry = registry();
    let handle = registry.handle("conv-1");
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;

    let good = Message::user(root.clone(), "kept?");
    let err = handle
        .apply_updates(vec![
            UpdateOp::append(good),
            UpdateOp::append(Message::user("missing-branch", "bad")),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    // Nothing from the rejected batch is visible.
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.version, 0);
    assert!(snapshot.messages[&root].is_empty());
}

#[tokio::test]
async fn concurrent_batches_serialize() {
    let registry = registry();
    let handle = registry.handle("conv-1");
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;

    let mut tasks = Vec::new();
    for i in 0..8 {
        let handle = handle.clone();
        let root = root.clone();
        tasks.push(tokio::spawn(async move {
            handle
                .apply_updates(vec![UpdateOp::append(Message::user(
                    root,
                    format!("message {i}"),
                ))])
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // Equivalent to some serial order: every batch applied exactly once,
    // version advanced once per batch, no interleaved partial state.
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.version, 8);
    assert_eq!(snapshot.messages[&root].len(), 8);
}

#[tokio::test]
async fn reapplied_append_is_idempotent() {
    let registry = registry();
    let handle = registry.handle("conv-1");
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;

    let user = Message::user(root.clone(), "v1");
    handle
        .apply_updates(vec![UpdateOp::append(user.clone())])
        .await
        .unwrap();

    // A retried send overwrites in place rather than duplicating.
    let mut retry = user.clone();
    retry.content = "v2".into();
    let applied = handle
        .apply_updates(vec![UpdateOp::append(retry)])
        .await
        .unwrap();

    let msgs = &applied.snapshot.messages[&root];
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].content, "v2");
}

#[tokio::test]
async fn update_populates_usage_and_preserves_identity() {
    let registry = registry();
    let handle = registry.handle("conv-1");
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;

    let placeholder = Message::assistant_placeholder(root.clone());
    handle
        .apply_updates(vec![UpdateOp::append(placeholder.clone())])
        .await
        .unwrap();

    let usage = TokenUsage {
        prompt_tokens: 42,
        completion_tokens: 17,
        cost_usd: Some(0.002),
    };
    let applied = handle
        .apply_updates(vec![UpdateOp::update(
            root.clone(),
            placeholder.id.clone(),
            "final text",
            Some(usage),
        )])
        .await
        .unwrap();

    let msg = &applied.snapshot.messages[&root][0];
    assert_eq!(msg.content, "final text");
    assert_eq!(msg.token_usage, Some(usage));
    assert_eq!(msg.created_at, placeholder.created_at);
}

#[tokio::test]
async fn state_survives_actor_restart() {
    let storage = SqliteStorage::in_memory().unwrap();
    let first = StoreRegistry::new(storage.clone());
    let handle = first.handle("conv-1");
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;
    handle
        .apply_updates(vec![UpdateOp::append(Message::user(root.clone(), "kept"))])
        .await
        .unwrap();

    // A second registry over the same storage reloads the same state.
    let second = StoreRegistry::new(storage);
    let reloaded = second.handle("conv-1").snapshot().await.unwrap();
    assert_eq!(reloaded.version, 1);
    assert_eq!(reloaded.messages[&root][0].content, "kept");
}

#[tokio::test]
async fn branch_lifecycle_and_thread_assembly() {
    let registry = registry();
    let handle = registry.handle("conv-1");
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;

    let m1 = Message::user(root.clone(), "first");
    let m2 = Message::user(root.clone(), "second");
    let m3 = Message::user(root.clone(), "third");
    handle
        .apply_updates(vec![
            UpdateOp::append(m1),
            UpdateOp::append(m2.clone()),
            UpdateOp::append(m3),
        ])
        .await
        .unwrap();

    // Fork from the middle of the root branch.
    let (branch, version) = handle
        .create_branch(root.clone(), m2.id.clone(), "What about iteration?")
        .await
        .unwrap();
    assert_eq!(version, 2);
    assert_eq!(branch.parent_id.as_deref(), Some(root.as_str()));

    let alt = Message::user(branch.id.clone(), "Use a loop instead.");
    handle
        .apply_updates(vec![UpdateOp::append(alt)])
        .await
        .unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    let tree = build_tree(&snapshot).unwrap();
    assert_eq!(tree.children.len(), 1);
    assert_eq!(tree.children[0].branch.id, branch.id);
    assert_eq!(tree.children[0].depth, 1);

    // Model input for the fork stops at the origin message.
    let thread = thread_for_branch(&snapshot, &branch.id).unwrap();
    let contents: Vec<_> = thread.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "Use a loop instead."]);

    // Rename bumps the version once more.
    let version = handle
        .rename_branch(branch.id.clone(), "Iteration")
        .await
        .unwrap();
    assert_eq!(version, 4);
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.branches[&branch.id].title, "Iteration");
}

#[tokio::test]
async fn branch_creation_validates_parent_and_origin() {
    let registry = registry();
    let handle = registry.handle("conv-1");
    let root = handle.snapshot().await.unwrap().conversation.root_branch_id;

    let err = handle
        .create_branch("ghost-branch", "ghost-message", "x")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    let err = handle
        .create_branch(root, "ghost-message", "x")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}
