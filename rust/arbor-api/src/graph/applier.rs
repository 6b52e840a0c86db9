//! Atomic application of ordered update batches.
//!
//! A batch either fully applies (one version bump) or not at all. The
//! whole batch is validated before any effect is computed, so a malformed
//! batch never partially lands. Validation sees intra-batch effects: an
//! op may update a message appended earlier in the same batch.

use std::collections::{HashMap, HashSet};

use crate::domain::{Branch, Message, UpdateOp};
use crate::error::{ArborError, ArborResult};

/// One message write produced by a batch, with its stable position in the
/// branch (positions drive durable ordering).
#[derive(Debug, Clone)]
pub struct BatchWrite {
    /// The message value after the op.
    pub message: Message,
    /// Position within its branch.
    pub position: usize,
}

/// Validate a batch against current state, then compute its writes.
///
/// Returns the writes in op order. The caller persists them durably and
/// only then commits them to the in-memory maps via [`commit_writes`].
pub fn plan_batch(
    branches: &HashMap<String, Branch>,
    messages: &HashMap<String, Vec<Message>>,
    ops: &[UpdateOp],
) -> ArborResult<Vec<BatchWrite>> {
    if ops.is_empty() {
        return Err(ArborError::Validation("empty update batch".into()));
    }
    validate(branches, messages, ops)?;

    // Track per-branch lengths and appended ids so later ops in the batch
    // see earlier ones.
    let mut lengths: HashMap<&str, usize> = HashMap::new();
    let mut pending: HashMap<(String, String), (Message, usize)> = HashMap::new();
    let mut writes = Vec::with_capacity(ops.len());

    for op in ops {
        match op {
            UpdateOp::MessageAppend { message, .. } => {
                let key = (message.branch_id.clone(), message.id.clone());
                let position = existing_position(messages, &message.branch_id, &message.id)
                    .or_else(|| pending.get(&key).map(|(_, pos)| *pos))
                    .unwrap_or_else(|| {
                        let len = lengths.entry(message.branch_id.as_str()).or_insert_with(|| {
                            messages.get(&message.branch_id).map_or(0, Vec::len)
                        });
                        let pos = *len;
                        *len += 1;
                        pos
                    });
                pending.insert(key, (message.clone(), position));
                writes.push(BatchWrite {
                    message: message.clone(),
                    position,
                });
            }
            UpdateOp::MessageUpdate { message, .. } => {
                let key = (message.branch_id.clone(), message.id.clone());
                // Mutable fields only; id/branch/role/created_at preserved.
                let (mut updated, position) = match pending.get(&key) {
                    Some((msg, pos)) => (msg.clone(), *pos),
                    None => {
                        let pos = existing_position(messages, &message.branch_id, &message.id)
                            .ok_or_else(|| not_found(&message.branch_id, &message.id))?;
                        let msg = messages[message.branch_id.as_str()][pos].clone();
                        (msg, pos)
                    }
                };
                updated.content.clone_from(&message.content);
                updated.token_usage = message.token_usage;
                pending.insert(key, (updated.clone(), position));
                writes.push(BatchWrite {
                    message: updated,
                    position,
                });
            }
        }
    }

    Ok(writes)
}

/// Commit planned writes to the in-memory maps after the durable write
/// succeeded.
pub fn commit_writes(messages: &mut HashMap<String, Vec<Message>>, writes: Vec<BatchWrite>) {
    for write in writes {
        let branch = messages.entry(write.message.branch_id.clone()).or_default();
        if write.position < branch.len() {
            branch[write.position] = write.message;
        } else {
            // Positions are assigned densely per branch, so a new message
            // always lands exactly at the current end.
            branch.push(write.message);
        }
    }
}

fn validate(
    branches: &HashMap<String, Branch>,
    messages: &HashMap<String, Vec<Message>>,
    ops: &[UpdateOp],
) -> ArborResult<()> {
    let mut appended: HashSet<(String, String)> = HashSet::new();

    for op in ops {
        match op {
            UpdateOp::MessageAppend { message, .. } => {
                if message.id.is_empty() || message.branch_id.is_empty() {
                    return Err(ArborError::Validation(
                        "message:append requires non-empty id and branch_id".into(),
                    ));
                }
                if !branches.contains_key(&message.branch_id) {
                    return Err(ArborError::NotFound(format!(
                        "branch {} does not exist",
                        message.branch_id
                    )));
                }
                appended.insert((message.branch_id.clone(), message.id.clone()));
            }
            UpdateOp::MessageUpdate { message, .. } => {
                if message.id.is_empty() || message.branch_id.is_empty() {
                    return Err(ArborError::Validation(
                        "message:update requires non-empty id and branch_id".into(),
                    ));
                }
                let exists = appended.contains(&(message.branch_id.clone(), message.id.clone()))
                    || existing_position(messages, &message.branch_id, &message.id).is_some();
                if !exists {
                    return Err(not_found(&message.branch_id, &message.id));
                }
            }
        }
    }
    Ok(())
}

fn existing_position(
    messages: &HashMap<String, Vec<Message>>,
    branch_id: &str,
    message_id: &str,
) -> Option<usize> {
    messages
        .get(branch_id)
        .and_then(|msgs| msgs.iter().position(|m| m.id == message_id))
}

fn not_found(branch_id: &str, id: &str) -> ArborError {
    ArborError::NotFound(format!("message {id} not found in branch {branch_id}"))
}
