//! Derived tree view over a flat conversation snapshot.
//!
//! `build_tree` is a pure function: navigation UIs call it on every
//! snapshot, and model-input assembly walks the same parent links via
//! `thread_for_branch`.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::domain::{Branch, ConversationGraphSnapshot, Message};
use crate::error::{ArborError, ArborResult};

/// A node in the derived branch tree.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    /// The branch at this node.
    pub branch: Branch,
    /// Child branches, ordered by creation time (id as tie-break).
    pub children: Vec<TreeNode>,
    /// Depth below the root (root is 0).
    pub depth: usize,
}

/// Build the ordered tree rooted at the conversation's root branch.
///
/// Branches whose parent is missing cannot be attached; they are excluded
/// from the tree and reported through the diagnostic log, since the rest
/// of the graph must still render.
pub fn build_tree(snapshot: &ConversationGraphSnapshot) -> ArborResult<TreeNode> {
    let root_id = &snapshot.conversation.root_branch_id;
    let root = snapshot
        .branches
        .get(root_id)
        .ok_or_else(|| ArborError::NotFound(format!("root branch {root_id} missing")))?;

    let mut children_of: HashMap<&str, Vec<&Branch>> = HashMap::new();
    for branch in snapshot.branches.values() {
        if let Some(parent_id) = &branch.parent_id {
            if snapshot.branches.contains_key(parent_id) {
                children_of.entry(parent_id.as_str()).or_default().push(branch);
            } else {
                tracing::warn!(
                    conversation_id = %snapshot.conversation.id,
                    branch_id = %branch.id,
                    parent_id = %parent_id,
                    "excluding branch with missing parent from tree"
                );
            }
        }
    }
    for children in children_of.values_mut() {
        children.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    Ok(attach(root, &children_of, 0))
}

fn attach(branch: &Branch, children_of: &HashMap<&str, Vec<&Branch>>, depth: usize) -> TreeNode {
    let children = children_of
        .get(branch.id.as_str())
        .map(|kids| {
            kids.iter()
                .map(|child| attach(child, children_of, depth + 1))
                .collect()
        })
        .unwrap_or_default();

    TreeNode {
        branch: branch.clone(),
        children,
        depth,
    }
}

/// Assemble the message thread for a branch by walking its ancestor chain.
///
/// Each ancestor contributes its messages up to and including the fork
/// origin of the branch below it; the target branch contributes all of
/// its messages. The result is root-first, ready to feed model input.
pub fn thread_for_branch(
    snapshot: &ConversationGraphSnapshot,
    branch_id: &str,
) -> ArborResult<Vec<Message>> {
    let mut segments: Vec<Vec<Message>> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();

    let mut current = snapshot
        .branches
        .get(branch_id)
        .ok_or_else(|| ArborError::NotFound(format!("branch {branch_id} does not exist")))?;
    // Messages of the target branch itself, in full.
    let mut cutoff: Option<&str> = None;

    loop {
        if !visited.insert(current.id.as_str()) {
            return Err(ArborError::Conflict(format!(
                "cycle detected in branch parents at {}",
                current.id
            )));
        }

        let msgs = snapshot
            .messages
            .get(&current.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let segment = match cutoff {
            None => msgs.to_vec(),
            Some(origin_id) => {
                let end = msgs.iter().position(|m| m.id == origin_id).map(|i| i + 1);
                match end {
                    Some(end) => msgs[..end].to_vec(),
                    // Origin not found: contribute nothing rather than leak
                    // messages past an unknown fork point.
                    None => Vec::new(),
                }
            }
        };
        segments.push(segment);

        match &current.parent_id {
            Some(parent_id) => {
                cutoff = current.origin_message_id.as_deref();
                current = snapshot.branches.get(parent_id).ok_or_else(|| {
                    ArborError::NotFound(format!("parent branch {parent_id} does not exist"))
                })?;
            }
            None => break,
        }
    }

    segments.reverse();
    Ok(segments.into_iter().flatten().collect())
}
