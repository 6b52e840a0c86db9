//! Per-conversation graph state: the store actor, update application,
//! and the derived tree view.

pub mod applier;
pub mod registry;
pub mod store;
pub mod tree;

pub use registry::StoreRegistry;
pub use store::{AppliedBatch, ConversationHandle};
pub use tree::{build_tree, thread_for_branch, TreeNode};
