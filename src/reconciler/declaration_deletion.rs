//! Declaration deletion handling (spec.md §4.7 trigger "declaration CRUD";
//! §6 "On declaration deletion, all its metrics must be withdrawn"; §8
//! invariant 7 "no orphans"). Declarations are deleted by operators, not by
//! this engine (spec.md §3 "we never delete their objects") — the watch
//! layer that learns of the deletion (out of scope per spec.md §1) would
//! remove it from `state::declarations()` and call this to withdraw its
//! metrics and scrub every node its node-meta companion still lists.

use crate::{
  metrics,
  store::{forget_node_meta, NodeAnnotations, NodeMetaStore, NodeStateStore},
};

pub async fn handle_deleted(
  annotations: &dyn NodeAnnotations,
  meta: &dyn NodeMetaStore,
  declaration: &str,
) {
  metrics::metrics().withdraw(declaration);

  let Ok((snapshot, _)) = meta.get(declaration).await else { return };
  let store = NodeStateStore::new(annotations);
  for node in &snapshot.nodes {
    if let Ok((_, version)) = store.read(node, declaration).await {
      let _ = store.scrub(node, declaration, &version).await;
    }
    let _ = forget_node_meta(meta, declaration, node).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{fake::FakeNodeAnnotations, fake::FakeNodeMetaStore, record_node_meta};

  #[tokio::test]
  async fn deleted_declaration_withdraws_metrics_and_scrubs_every_recorded_node() {
    let annotations = FakeNodeAnnotations::default();
    let meta = FakeNodeMetaStore::default();

    let store = NodeStateStore::new(&annotations);
    let (_empty, version) = store.read("node-1", "gone").await.unwrap();
    let record = skyhook_client::NodeRecord {
      status: skyhook_client::NodeStatus::Complete,
      version: "1".into(),
      ..Default::default()
    };
    store.write("node-1", "gone", &record, &version).await.unwrap();
    record_node_meta(&meta, "gone", "node-1").await.unwrap();

    metrics::metrics().set_status("gone", skyhook_client::NodeStatus::Complete);

    handle_deleted(&annotations, &meta, "gone").await;

    let (raw, _) = annotations.get("node-1").await.unwrap();
    assert!(raw.is_empty());
    let (snapshot, _) = meta.get("gone").await.unwrap();
    assert!(snapshot.nodes.is_empty());
  }

  #[tokio::test]
  async fn declaration_with_no_recorded_nodes_is_a_no_op() {
    let annotations = FakeNodeAnnotations::default();
    let meta = FakeNodeMetaStore::default();
    handle_deleted(&annotations, &meta, "never-seen").await;
  }
}
