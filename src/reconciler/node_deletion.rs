//! Node deletion handling (spec.md §4.7 "On node deletion, all per-node
//! state is scrubbed and the node-meta companion is updated"; §7
//! "Lifecycle"; §8 invariant 7 "no orphans").
//!
//! A deleted node can no longer have its annotations patched, so the
//! scrub call here is expected to fail for a node that's truly gone —
//! that failure is swallowed per the Lifecycle error policy
//! (best-effort, ignore errors). The node-meta companion update is what
//! actually matters: it's what lets a later declaration deletion or
//! audit pass know this node no longer needs visiting.

use crate::store::{
  NodeAnnotations, NodeMetaStore, NodeStateStore, forget_node_meta,
};

/// Scrubs `node`'s per-declaration annotations (best-effort) and forgets
/// it from every listed declaration's node-meta companion snapshot.
/// `declarations` should be every declaration whose companion snapshot
/// might list this node — typically every declaration the caller knows
/// about, since a stale snapshot only costs an extra no-op forget.
pub async fn handle_deleted(
  annotations: &dyn NodeAnnotations,
  meta: &dyn NodeMetaStore,
  node: &str,
  declarations: &[String],
) {
  let store = NodeStateStore::new(annotations);
  for declaration in declarations {
    if let Ok((_, version)) = store.read(node, declaration).await {
      let _ = store.scrub(node, declaration, &version).await;
    }
    let _ = forget_node_meta(meta, declaration, node).await;
  }
}
