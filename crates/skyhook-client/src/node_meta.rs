//! Node-meta companion object (spec.md §3 "Node-meta companion object"):
//! a single namespaced object per declaration, snapshotting which nodes
//! currently carry that declaration's stamped annotation/label keys. A
//! node can be deleted before its annotations are ever read back, so
//! this companion — not the node itself — is the only durable record of
//! which nodes a declaration has ever touched, which is what node
//! deletion handling uses to scrub every declaration's keys without
//! having to watch every node forever (spec.md §8 invariant 7).
//!
//! The stamped key set itself (`keys::node_state_key` / `status_key` /
//! `version_key` / `cordon_key`) is fixed per declaration, so only node
//! names need recording here, not the keys.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetaSnapshot {
  pub nodes: BTreeSet<String>,
}

impl NodeMetaSnapshot {
  /// Records `node` as carrying this declaration's stamped keys.
  /// Returns `true` if this was a new entry (caller should persist).
  pub fn record(&mut self, node: &str) -> bool {
    self.nodes.insert(node.to_string())
  }

  /// Forgets `node`. Returns `true` if it had been present.
  pub fn forget(&mut self, node: &str) -> bool {
    self.nodes.remove(node)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_is_idempotent() {
    let mut snapshot = NodeMetaSnapshot::default();
    assert!(snapshot.record("node-1"));
    assert!(!snapshot.record("node-1"));
    assert_eq!(snapshot.nodes.len(), 1);
  }

  #[test]
  fn forget_removes_recorded_node() {
    let mut snapshot = NodeMetaSnapshot::default();
    snapshot.record("node-1");
    assert!(snapshot.forget("node-1"));
    assert!(snapshot.nodes.is_empty());
    assert!(!snapshot.forget("node-1"));
  }
}
