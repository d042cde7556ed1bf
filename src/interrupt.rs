//! Interrupt Coordinator (C5, spec.md §4.5): merges every package on one
//! node needing an interrupt into a single grouped interrupt, then drives
//! cordon → evict → wait-for-pod → dispatch → post-interrupt → uncordon.

use skyhook_client::{
  evaluate, keys, Declaration, InterruptType, Labels, LabelSelector,
};
use thiserror::Error;

use crate::planner::InterruptNeed;

/// One interrupt, already merged across every package that needed one on
/// this node this pass (spec.md §4.5 merge rule: reboot dominates service;
/// service sets union).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedInterrupt {
  pub interrupt_type: InterruptType,
  pub services: Vec<String>,
  /// Package names participating in this group, in the order their needs
  /// were supplied (i.e. forward graph order).
  pub packages: Vec<String>,
  /// Identifies this group for `resourceId`-gated re-dispatch (spec.md
  /// §4.5: "one `resourceId` per group prevents re-execution on mere
  /// reconcile churn"). Deterministic over the merged package set so the
  /// same set of simultaneous needs always yields the same group id.
  pub resource_id: String,
}

/// Merge rule (spec.md §4.5): any `reboot` need makes the whole group a
/// reboot; otherwise the group is a `service` interrupt with the union of
/// every need's services. Returns `None` for an empty input.
pub fn merge(needs: &[InterruptNeed]) -> Option<MergedInterrupt> {
  if needs.is_empty() {
    return None;
  }

  let interrupt_type = if needs
    .iter()
    .any(|n| n.interrupt_type == InterruptType::Reboot)
  {
    InterruptType::Reboot
  } else {
    InterruptType::Service
  };

  let mut services: Vec<String> = Vec::new();
  for need in needs {
    for service in &need.services {
      if !services.contains(service) {
        services.push(service.clone());
      }
    }
  }

  let packages: Vec<String> =
    needs.iter().map(|n| n.package_name.clone()).collect();
  let resource_id = group_resource_id(needs);

  Some(MergedInterrupt {
    interrupt_type,
    services,
    packages,
    resource_id,
  })
}

fn group_resource_id(needs: &[InterruptNeed]) -> String {
  use sha2::{Digest, Sha256};
  let mut sorted: Vec<&InterruptNeed> = needs.iter().collect();
  sorted.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
  let mut hasher = Sha256::new();
  for need in sorted {
    hasher.update(need.resource_id.as_bytes());
    hasher.update(b";");
  }
  hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
  pub namespace: String,
  pub name: String,
  pub labels: Labels,
}

#[derive(Debug, Error)]
pub enum InterruptError {
  #[error("wait-for-pod timed out after eviction")]
  WaitTimeout,
  #[error("interrupt coordinator backend error: {0}")]
  Backend(String),
}

/// Thin seam over the actual node/pod operations a real Kubernetes client
/// performs; a fake backs the in-memory test suite.
#[async_trait::async_trait]
pub trait NodeOps: Send + Sync {
  async fn cordon(&self, node: &str, declaration: &str) -> anyhow::Result<()>;
  async fn uncordon(&self, node: &str, declaration: &str) -> anyhow::Result<()>;
  async fn list_pods(&self, node: &str) -> anyhow::Result<Vec<PodRef>>;
  async fn evict_pod(&self, pod: &PodRef) -> anyhow::Result<()>;
  /// Blocks (up to the caller's own timeout handling) until the pod has
  /// terminated or reached whatever "done" condition the real
  /// implementation defines.
  async fn wait_for_pod_gone(&self, pod: &PodRef) -> anyhow::Result<bool>;
  /// Removes the `runtime-required` node-entry taint (spec.md §4.3, §6,
  /// §8 invariant 5). Idempotent: a node that never carried the taint, or
  /// already had it removed, is not an error.
  async fn remove_runtime_required_taint(&self, node: &str) -> anyhow::Result<()>;
}

pub struct Coordinator<'a> {
  ops: &'a dyn NodeOps,
}

impl<'a> Coordinator<'a> {
  pub fn new(ops: &'a dyn NodeOps) -> Self {
    Self { ops }
  }

  /// Step 1-3 of spec.md §4.5: cordon, evict every pod not protected by
  /// `podNonInterruptLabels` and not itself a wait-for-pod, then wait for
  /// the wait-for-pods to clear. Returns once the node is safe to
  /// interrupt; the caller dispatches the grouped interrupt worker and
  /// later calls `finish` to uncordon.
  pub async fn prepare(
    &self,
    node: &str,
    declaration: &Declaration,
  ) -> Result<(), InterruptError> {
    self
      .ops
      .cordon(node, &declaration.name)
      .await
      .map_err(|e| InterruptError::Backend(e.to_string()))?;

    let pods = self
      .ops
      .list_pods(node)
      .await
      .map_err(|e| InterruptError::Backend(e.to_string()))?;

    let (_protected, evictable): (Vec<_>, Vec<_>) = pods.into_iter().partition(
      |pod| is_protected(&declaration.pod_non_interrupt_labels, &pod.labels),
    );

    for pod in &evictable {
      self
        .ops
        .evict_pod(pod)
        .await
        .map_err(|e| InterruptError::Backend(e.to_string()))?;
    }

    // `protected` pods are deliberately never evicted and must survive the
    // interrupt — only the pods we just evicted are waited on here.
    for pod in &evictable {
      let gone = self
        .ops
        .wait_for_pod_gone(pod)
        .await
        .map_err(|e| InterruptError::Backend(e.to_string()))?;
      if !gone {
        return Err(InterruptError::WaitTimeout);
      }
    }

    Ok(())
  }

  /// Step 6: release our cordon once post-interrupt has run for every
  /// participating package. On a wait-for-pod timeout the caller must NOT
  /// call this — the node stays cordoned and `status=erroring` is
  /// surfaced instead (spec.md §4.5).
  pub async fn finish(
    &self,
    node: &str,
    declaration: &str,
  ) -> anyhow::Result<()> {
    self.ops.uncordon(node, declaration).await
  }
}

fn is_protected(non_interrupt: &LabelSelector, labels: &Labels) -> bool {
  evaluate(non_interrupt, labels).matches
}

/// The argv/env `extra` payload for the grouped interrupt worker (spec.md
/// §6): `{type, services}`.
pub fn extra_payload(merged: &MergedInterrupt) -> serde_json::Value {
  serde_json::json!({
    "type": merged.interrupt_type,
    "services": merged.services,
  })
}

pub fn cordon_key(declaration: &str) -> String {
  keys::cordon_key(declaration)
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  fn declaration_with_protected_label() -> Declaration {
    Declaration {
      name: "demo".into(),
      generation: 1,
      priority: 0,
      node_selector: LabelSelector::everything(),
      packages: Default::default(),
      additional_tolerations: Vec::new(),
      pod_non_interrupt_labels: LabelSelector::from_equals([(
        "protected".to_string(),
        "true".to_string(),
      )]),
      interruption_budget: None,
      deployment_policy_ref: None,
      runtime_required: false,
      pause: false,
      disable: false,
    }
  }

  fn pod(name: &str, protected: bool) -> PodRef {
    let mut labels = Labels::new();
    if protected {
      labels.insert("protected".into(), "true".into());
    }
    PodRef { namespace: "default".into(), name: name.into(), labels }
  }

  /// A `NodeOps` whose `wait_for_pod_gone` fails for any pod carrying the
  /// `protected` label — standing in for a real backend where a
  /// never-evicted pod never terminates. `prepare` must never call it on
  /// such a pod.
  struct FakeNodeOps {
    pods: Vec<PodRef>,
    evicted: AtomicUsize,
  }

  #[async_trait::async_trait]
  impl NodeOps for FakeNodeOps {
    async fn cordon(&self, _node: &str, _declaration: &str) -> anyhow::Result<()> {
      Ok(())
    }
    async fn uncordon(&self, _node: &str, _declaration: &str) -> anyhow::Result<()> {
      Ok(())
    }
    async fn list_pods(&self, _node: &str) -> anyhow::Result<Vec<PodRef>> {
      Ok(self.pods.clone())
    }
    async fn evict_pod(&self, _pod: &PodRef) -> anyhow::Result<()> {
      self.evicted.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
    async fn wait_for_pod_gone(&self, pod: &PodRef) -> anyhow::Result<bool> {
      Ok(!is_protected(
        &LabelSelector::from_equals([("protected".to_string(), "true".to_string())]),
        &pod.labels,
      ))
    }
    async fn remove_runtime_required_taint(&self, _node: &str) -> anyhow::Result<()> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn prepare_never_waits_on_protected_pods() {
    let ops = FakeNodeOps {
      pods: vec![pod("protected-pod", true), pod("evictable-pod", false)],
      evicted: AtomicUsize::new(0),
    };
    let coordinator = Coordinator::new(&ops);
    let declaration = declaration_with_protected_label();

    coordinator
      .prepare("node-a", &declaration)
      .await
      .expect("protected pod must not block prepare on a wait timeout");

    assert_eq!(ops.evicted.load(Ordering::SeqCst), 1);
  }

  fn need(
    name: &str,
    interrupt_type: InterruptType,
    services: &[&str],
  ) -> InterruptNeed {
    InterruptNeed {
      package_name: name.into(),
      package_version: "1.0.0".into(),
      interrupt_type,
      services: services.iter().map(|s| s.to_string()).collect(),
      resource_id: format!("{name}-rid"),
    }
  }

  #[test]
  fn merges_services_across_packages() {
    let needs = vec![
      need("a", InterruptType::Service, &["cron"]),
      need("b", InterruptType::Service, &["containerd", "foobar"]),
    ];
    let merged = merge(&needs).unwrap();
    assert_eq!(merged.interrupt_type, InterruptType::Service);
    assert_eq!(merged.services.len(), 3);
    for svc in ["cron", "containerd", "foobar"] {
      assert!(merged.services.contains(&svc.to_string()));
    }
    assert_eq!(merged.packages, vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn reboot_dominates_service() {
    let needs = vec![
      need("a", InterruptType::Service, &["cron"]),
      need("b", InterruptType::Reboot, &[]),
    ];
    let merged = merge(&needs).unwrap();
    assert_eq!(merged.interrupt_type, InterruptType::Reboot);
  }

  #[test]
  fn empty_needs_merge_to_none() {
    assert!(merge(&[]).is_none());
  }

  #[test]
  fn resource_id_is_order_independent() {
    let forward = vec![
      need("a", InterruptType::Service, &["x"]),
      need("b", InterruptType::Service, &["y"]),
    ];
    let backward = vec![
      need("b", InterruptType::Service, &["y"]),
      need("a", InterruptType::Service, &["x"]),
    ];
    assert_eq!(
      merge(&forward).unwrap().resource_id,
      merge(&backward).unwrap().resource_id
    );
  }
}
