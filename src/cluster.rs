//! The cluster API client: a real implementation backs this with the
//! Kubernetes API (node annotation patches, worker Pod lifecycle, cordon
//! and eviction). Out of scope for this repository (spec.md §1 "treated
//! as external collaborators") — this stub only keeps `skyhook-operator`
//! linkable as a standalone binary; wire a real implementation of
//! `NodeAnnotations`/`WorkerObjects`/`NodeOps` in its place for an actual
//! deployment.

use std::collections::BTreeMap;

use anyhow::bail;
use skyhook::{
  dispatcher::{WorkerObjects, WorkerOutcome},
  interrupt::{NodeOps, PodRef},
  store::{NodeAnnotations, NodeMetaStore, ResourceVersion, StoreError},
};
use skyhook_client::{NodeMetaSnapshot, Stage, WorkerObject};

#[derive(Default)]
pub struct UnimplementedClusterClient;

#[async_trait::async_trait]
impl NodeAnnotations for UnimplementedClusterClient {
  async fn get(
    &self,
    _node: &str,
  ) -> anyhow::Result<(BTreeMap<String, String>, ResourceVersion)> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn update(
    &self,
    _node: &str,
    _expected: &ResourceVersion,
    _changes: BTreeMap<String, Option<String>>,
  ) -> Result<ResourceVersion, StoreError> {
    Err(StoreError::Backend(
      "no cluster API client is wired into this binary".into(),
    ))
  }
}

#[async_trait::async_trait]
impl WorkerObjects for UnimplementedClusterClient {
  async fn create(&self, _worker: WorkerObject) -> anyhow::Result<()> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn status(
    &self,
    _node: &str,
    _package: &str,
    _stage: Stage,
  ) -> anyhow::Result<Option<WorkerOutcome>> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn delete(&self, _node: &str, _package: &str, _stage: Stage) -> anyhow::Result<()> {
    bail!("no cluster API client is wired into this binary")
  }
}

#[async_trait::async_trait]
impl NodeMetaStore for UnimplementedClusterClient {
  async fn get(
    &self,
    _declaration: &str,
  ) -> anyhow::Result<(NodeMetaSnapshot, ResourceVersion)> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn update(
    &self,
    _declaration: &str,
    _expected: &ResourceVersion,
    _snapshot: NodeMetaSnapshot,
  ) -> Result<ResourceVersion, StoreError> {
    Err(StoreError::Backend(
      "no cluster API client is wired into this binary".into(),
    ))
  }
}

#[async_trait::async_trait]
impl NodeOps for UnimplementedClusterClient {
  async fn cordon(&self, _node: &str, _declaration: &str) -> anyhow::Result<()> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn uncordon(&self, _node: &str, _declaration: &str) -> anyhow::Result<()> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn list_pods(&self, _node: &str) -> anyhow::Result<Vec<PodRef>> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn evict_pod(&self, _pod: &PodRef) -> anyhow::Result<()> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn wait_for_pod_gone(&self, _pod: &PodRef) -> anyhow::Result<bool> {
    bail!("no cluster API client is wired into this binary")
  }

  async fn remove_runtime_required_taint(&self, _node: &str) -> anyhow::Result<()> {
    bail!("no cluster API client is wired into this binary")
  }
}
