//! Node State Store (C2, spec.md §4.2): durable per-node, per-declaration
//! `NodeRecord`, backed by a CAS'd map of node annotations.

pub mod migration;

use std::collections::BTreeMap;

use skyhook_client::{
  NodeMetaSnapshot, NodeRecord,
  keys::{cordon_key, node_state_key, status_key, version_key},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceVersion(pub String);

#[derive(Debug, Error)]
pub enum StoreError {
  /// Another writer updated the node between our read and write.
  #[error("node record CAS conflict")]
  Conflict,
  #[error("store backend error: {0}")]
  Backend(String),
}

/// The only thing the engine assumes about the underlying cluster API: a
/// node's annotation map can be read with its current resource version,
/// and updated under a CAS precondition on that version. A real
/// implementation backs this with the Kubernetes API; tests use
/// `FakeNodeAnnotations`.
#[async_trait::async_trait]
pub trait NodeAnnotations: Send + Sync {
  async fn get(
    &self,
    node: &str,
  ) -> anyhow::Result<(BTreeMap<String, String>, ResourceVersion)>;

  /// `None` values remove the key. Fails with `StoreError::Conflict` if
  /// `expected` no longer matches the node's current version.
  async fn update(
    &self,
    node: &str,
    expected: &ResourceVersion,
    changes: BTreeMap<String, Option<String>>,
  ) -> Result<ResourceVersion, StoreError>;
}

pub struct NodeStateStore<'a> {
  annotations: &'a dyn NodeAnnotations,
}

impl<'a> NodeStateStore<'a> {
  pub fn new(annotations: &'a dyn NodeAnnotations) -> Self {
    Self { annotations }
  }

  /// Missing record ⇒ empty `NodeRecord`. Legacy shapes are migrated
  /// in place before being returned (spec.md §4.8).
  pub async fn read(
    &self,
    node: &str,
    declaration: &str,
  ) -> Result<(NodeRecord, ResourceVersion), StoreError> {
    let (raw, version) = self
      .annotations
      .get(node)
      .await
      .map_err(|e| StoreError::Backend(e.to_string()))?;

    let Some(value) = raw.get(&node_state_key(declaration)) else {
      return Ok((NodeRecord::default(), version));
    };

    let json: serde_json::Value = serde_json::from_str(value)
      .map_err(|e| StoreError::Backend(e.to_string()))?;
    let json = migration::migrate(json);
    let record: NodeRecord = serde_json::from_value(json)
      .map_err(|e| StoreError::Backend(e.to_string()))?;
    Ok((record, version))
  }

  /// CAS write. `expected` must be the version returned by the `read`
  /// that produced `record` in this reconcile pass — per the store
  /// invariant, a stale record must never be written (spec.md §4.2).
  pub async fn write(
    &self,
    node: &str,
    declaration: &str,
    record: &NodeRecord,
    expected: &ResourceVersion,
  ) -> Result<ResourceVersion, StoreError> {
    let encoded = serde_json::to_string(record)
      .map_err(|e| StoreError::Backend(e.to_string()))?;
    let status = serde_json::to_string(&record.status)
      .unwrap_or_default()
      .trim_matches('"')
      .to_string();
    let changes = BTreeMap::from([
      (node_state_key(declaration), Some(encoded)),
      (status_key(declaration), Some(status)),
      (version_key(declaration), Some(record.version.clone())),
    ]);
    self.annotations.update(node, expected, changes).await
  }

  /// Removes every key this declaration owns on this node (spec.md §4.2,
  /// invariant 7 in §8).
  pub async fn scrub(
    &self,
    node: &str,
    declaration: &str,
    expected: &ResourceVersion,
  ) -> Result<ResourceVersion, StoreError> {
    let changes = BTreeMap::from([
      (node_state_key(declaration), None),
      (status_key(declaration), None),
      (version_key(declaration), None),
      (cordon_key(declaration), None),
    ]);
    self.annotations.update(node, expected, changes).await
  }
}

/// Port for the per-declaration node-meta companion object (spec.md §3):
/// a single namespaced object, one per declaration, holding the snapshot
/// of nodes currently carrying its stamped keys. A real implementation
/// backs this with a small namespaced object (e.g. a ConfigMap) owned by
/// the declaration; tests use `FakeNodeMetaStore`.
#[async_trait::async_trait]
pub trait NodeMetaStore: Send + Sync {
  async fn get(
    &self,
    declaration: &str,
  ) -> anyhow::Result<(NodeMetaSnapshot, ResourceVersion)>;

  async fn update(
    &self,
    declaration: &str,
    expected: &ResourceVersion,
    snapshot: NodeMetaSnapshot,
  ) -> Result<ResourceVersion, StoreError>;
}

/// Records `node` into `declaration`'s companion snapshot, retrying once
/// on a CAS conflict. Best-effort bookkeeping alongside the planner's
/// critical path, not gating it: a failure here only means node deletion
/// handling might miss scrubbing this one node later, not that the
/// reconcile pass that called it should fail.
pub async fn record_node_meta(
  meta: &dyn NodeMetaStore,
  declaration: &str,
  node: &str,
) -> anyhow::Result<()> {
  for _ in 0..2 {
    let (mut snapshot, version) = meta.get(declaration).await?;
    if !snapshot.record(node) {
      return Ok(());
    }
    match meta.update(declaration, &version, snapshot).await {
      Ok(_) => return Ok(()),
      Err(StoreError::Conflict) => continue,
      Err(StoreError::Backend(msg)) => anyhow::bail!(msg),
    }
  }
  Ok(())
}

/// Forgets `node` from `declaration`'s companion snapshot, retrying once
/// on a CAS conflict (spec.md §8 invariant 7: no orphaned keys once a
/// node is scrubbed).
pub async fn forget_node_meta(
  meta: &dyn NodeMetaStore,
  declaration: &str,
  node: &str,
) -> anyhow::Result<()> {
  for _ in 0..2 {
    let (mut snapshot, version) = meta.get(declaration).await?;
    if !snapshot.forget(node) {
      return Ok(());
    }
    match meta.update(declaration, &version, snapshot).await {
      Ok(_) => return Ok(()),
      Err(StoreError::Conflict) => continue,
      Err(StoreError::Backend(msg)) => anyhow::bail!(msg),
    }
  }
  Ok(())
}

#[cfg(test)]
pub mod fake {
  use std::{collections::BTreeMap, sync::Mutex};

  use super::*;

  /// In-memory `NodeAnnotations` for tests: one resource-version counter
  /// per node, bumped on every successful update.
  #[derive(Default)]
  pub struct FakeNodeAnnotations {
    nodes: Mutex<BTreeMap<String, (BTreeMap<String, String>, u64)>>,
  }

  #[async_trait::async_trait]
  impl NodeAnnotations for FakeNodeAnnotations {
    async fn get(
      &self,
      node: &str,
    ) -> anyhow::Result<(BTreeMap<String, String>, ResourceVersion)> {
      let nodes = self.nodes.lock().unwrap();
      let (map, version) =
        nodes.get(node).cloned().unwrap_or_default();
      Ok((map, ResourceVersion(version.to_string())))
    }

    async fn update(
      &self,
      node: &str,
      expected: &ResourceVersion,
      changes: BTreeMap<String, Option<String>>,
    ) -> Result<ResourceVersion, StoreError> {
      let mut nodes = self.nodes.lock().unwrap();
      let entry = nodes.entry(node.to_string()).or_default();
      if entry.1.to_string() != expected.0 {
        return Err(StoreError::Conflict);
      }
      for (key, value) in changes {
        match value {
          Some(v) => {
            entry.0.insert(key, v);
          }
          None => {
            entry.0.remove(&key);
          }
        }
      }
      entry.1 += 1;
      Ok(ResourceVersion(entry.1.to_string()))
    }
  }

  /// In-memory `NodeMetaStore` for tests: one resource-version counter
  /// per declaration.
  #[derive(Default)]
  pub struct FakeNodeMetaStore {
    declarations: Mutex<BTreeMap<String, (NodeMetaSnapshot, u64)>>,
  }

  #[async_trait::async_trait]
  impl NodeMetaStore for FakeNodeMetaStore {
    async fn get(
      &self,
      declaration: &str,
    ) -> anyhow::Result<(NodeMetaSnapshot, ResourceVersion)> {
      let declarations = self.declarations.lock().unwrap();
      let (snapshot, version) =
        declarations.get(declaration).cloned().unwrap_or_default();
      Ok((snapshot, ResourceVersion(version.to_string())))
    }

    async fn update(
      &self,
      declaration: &str,
      expected: &ResourceVersion,
      snapshot: NodeMetaSnapshot,
    ) -> Result<ResourceVersion, StoreError> {
      let mut declarations = self.declarations.lock().unwrap();
      let entry = declarations.entry(declaration.to_string()).or_default();
      if entry.1.to_string() != expected.0 {
        return Err(StoreError::Conflict);
      }
      entry.0 = snapshot;
      entry.1 += 1;
      Ok(ResourceVersion(entry.1.to_string()))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{fake::FakeNodeAnnotations, *};
  use skyhook_client::{NodeStatus, PackageRecord, PackageState, Stage};

  #[tokio::test]
  async fn missing_record_reads_as_empty() {
    let backend = FakeNodeAnnotations::default();
    let store = NodeStateStore::new(&backend);
    let (record, _version) = store.read("node-1", "demo").await.unwrap();
    assert!(record.packages.is_empty());
    assert_eq!(record.status, NodeStatus::Unknown);
  }

  #[tokio::test]
  async fn write_then_read_round_trips() {
    let backend = FakeNodeAnnotations::default();
    let store = NodeStateStore::new(&backend);
    let (_empty, version) = store.read("node-1", "demo").await.unwrap();

    let mut record = NodeRecord {
      status: NodeStatus::InProgress,
      version: "1".into(),
      ..Default::default()
    };
    record.packages.insert(
      "a|1.0.0".into(),
      PackageRecord {
        name: "a".into(),
        version: "1.0.0".into(),
        image: "repo/a:1.0.0".into(),
        stage: Stage::Apply,
        state: PackageState::InProgress,
        restarts: 0,
        config_hash: None,
        interrupt_resource_id: None,
        post_interrupt_resource_id: None,
      },
    );

    let version = store
      .write("node-1", "demo", &record, &version)
      .await
      .unwrap();
    let (read_back, _) = store.read("node-1", "demo").await.unwrap();
    assert_eq!(read_back.status, NodeStatus::InProgress);
    assert_eq!(read_back.packages.len(), 1);

    // Stale write (reusing an old version) is rejected.
    let stale = ResourceVersion("0".into());
    let err = store
      .write("node-1", "demo", &record, &stale)
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::Conflict));
    let _ = version;
  }

  #[tokio::test]
  async fn scrub_removes_all_owned_keys() {
    let backend = FakeNodeAnnotations::default();
    let store = NodeStateStore::new(&backend);
    let (_empty, version) = store.read("node-1", "demo").await.unwrap();
    let record = NodeRecord {
      status: NodeStatus::Complete,
      version: "1".into(),
      ..Default::default()
    };
    let version = store
      .write("node-1", "demo", &record, &version)
      .await
      .unwrap();
    store.scrub("node-1", "demo", &version).await.unwrap();

    let (map, _) = backend.get("node-1").await.unwrap();
    assert!(map.is_empty());
  }

  #[tokio::test]
  async fn node_meta_records_and_forgets_nodes() {
    use fake::FakeNodeMetaStore;

    let meta = FakeNodeMetaStore::default();
    record_node_meta(&meta, "demo", "node-1").await.unwrap();
    record_node_meta(&meta, "demo", "node-2").await.unwrap();

    let (snapshot, _) = meta.get("demo").await.unwrap();
    assert_eq!(snapshot.nodes.len(), 2);

    forget_node_meta(&meta, "demo", "node-1").await.unwrap();
    let (snapshot, _) = meta.get("demo").await.unwrap();
    assert_eq!(snapshot.nodes, std::collections::BTreeSet::from(["node-2".to_string()]));
  }

  #[tokio::test]
  async fn node_meta_record_is_a_no_op_when_already_present() {
    use fake::FakeNodeMetaStore;

    let meta = FakeNodeMetaStore::default();
    record_node_meta(&meta, "demo", "node-1").await.unwrap();
    let (_, version_after_first) = meta.get("demo").await.unwrap();
    record_node_meta(&meta, "demo", "node-1").await.unwrap();
    let (_, version_after_second) = meta.get("demo").await.unwrap();
    assert_eq!(version_after_first, version_after_second);
  }
}
