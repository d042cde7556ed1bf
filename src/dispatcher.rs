//! Work Dispatcher (C4, spec.md §4.4): materialize a planner decision as a
//! transient `WorkerObject`, submit it through the `WorkerObjects` port,
//! and interpret its terminal status.

use skyhook_client::{
  keys::{self, ENV_OVERLAY_FRAMEWORK_VERSION, ENV_SKYHOOK_RESOURCE_ID},
  worker::{compose_args, init_container_names, InitContainer},
  Declaration, Stage, Toleration, WorkerObject,
};
use thiserror::Error;

use crate::planner::PlannedStage;

/// Hard-coded tolerations every worker carries regardless of the
/// declaration, so workers can land on nodes already cordoned by this
/// system or carrying the runtime-required taint (spec.md §4.4).
pub fn system_tolerations() -> Vec<Toleration> {
  vec![
    Toleration {
      key: keys::UNSCHEDULABLE_TAINT_KEY.to_string(),
      operator: skyhook_client::TolerationOperator::Exists,
      value: None,
      effect: None,
    },
    Toleration {
      key: keys::RUNTIME_REQUIRED_TAINT_KEY.to_string(),
      operator: skyhook_client::TolerationOperator::Exists,
      value: None,
      effect: None,
    },
  ]
}

/// The holding container run while the init-container chain executes;
/// kept alive with a minimal pause image per spec.md §4.4.
pub const HOLDING_IMAGE: &str = "registry.k8s.io/pause:3.9";
const ROOT_DIR: &str = "/opt/skyhook";

/// Result a `WorkerObjects` port reports once a worker reaches a terminal
/// state. Pre-terminal observation is the caller's responsibility (the
/// port itself decides when to report, e.g. by watching the object).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
  Succeeded,
  Failed { reason: String },
}

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error("worker has not reached a terminal state yet")]
  NotTerminal,
  #[error("dispatcher backend error: {0}")]
  Backend(String),
  #[error("worker for node '{node}' package '{package}' failed: {reason}")]
  Failed {
    node: String,
    package: String,
    reason: String,
  },
}

/// Thin seam over the actual worker-object API (a real implementation
/// creates Kubernetes Pods; tests use an in-memory fake). Kept separate
/// from `NodeAnnotations` since worker objects are namespaced, owned
/// resources rather than node-scoped annotations.
#[async_trait::async_trait]
pub trait WorkerObjects: Send + Sync {
  async fn create(&self, worker: WorkerObject) -> anyhow::Result<()>;
  /// `None` if no worker currently exists for this `(node, package,
  /// stage)` key.
  async fn status(
    &self,
    node: &str,
    package: &str,
    stage: Stage,
  ) -> anyhow::Result<Option<WorkerOutcome>>;
  async fn delete(
    &self,
    node: &str,
    package: &str,
    stage: Stage,
  ) -> anyhow::Result<()>;
}

pub struct Dispatcher<'a> {
  workers: &'a dyn WorkerObjects,
}

impl<'a> Dispatcher<'a> {
  pub fn new(workers: &'a dyn WorkerObjects) -> Self {
    Self { workers }
  }

  /// Compose and submit the `WorkerObject` for a planned stage. No-op on
  /// already-dispatched (non-fresh) stages from the caller's perspective —
  /// callers only invoke `dispatch` when `PlannedStage::fresh` is true or
  /// a restart is warranted.
  pub async fn dispatch(
    &self,
    node: &str,
    declaration: &Declaration,
    stage: &PlannedStage,
    restarts: u32,
  ) -> Result<(), DispatchError> {
    let worker = build_worker(node, declaration, stage, restarts);
    self
      .workers
      .create(worker)
      .await
      .map_err(|e| DispatchError::Backend(e.to_string()))
  }

  /// Observe a previously dispatched worker's terminal status, if any.
  pub async fn observe(
    &self,
    node: &str,
    package: &str,
    stage: &PlannedStage,
  ) -> Result<WorkerOutcome, DispatchError> {
    let status = self
      .workers
      .status(node, package, stage.stage)
      .await
      .map_err(|e| DispatchError::Backend(e.to_string()))?;
    match status {
      None => Err(DispatchError::NotTerminal),
      Some(WorkerOutcome::Succeeded) => Ok(WorkerOutcome::Succeeded),
      Some(WorkerOutcome::Failed { reason }) => {
        Err(DispatchError::Failed {
          node: node.to_string(),
          package: package.to_string(),
          reason,
        })
      }
    }
  }

  pub async fn cleanup(
    &self,
    node: &str,
    package: &str,
    stage: Stage,
  ) -> anyhow::Result<()> {
    self.workers.delete(node, package, stage).await
  }
}

fn build_worker(
  node: &str,
  declaration: &Declaration,
  planned: &PlannedStage,
  restarts: u32,
) -> WorkerObject {
  let args = compose_args(planned.stage, ROOT_DIR, planned.extra.as_ref());
  let mut tolerations = declaration.additional_tolerations.clone();
  tolerations.extend(system_tolerations());

  let labels = WorkerObject::labels_for(
    &declaration.name,
    &planned.package_name,
    &planned.package_version,
  );
  let mut annotations = std::collections::BTreeMap::new();
  let fingerprint = serde_json::json!({
    "name": planned.package_name,
    "version": planned.package_version,
    "skyhook": declaration.name,
    "stage": planned.stage,
    "image": planned.image,
  });
  annotations.insert(
    keys::WORKER_FINGERPRINT_ANNOTATION.to_string(),
    fingerprint.to_string(),
  );

  let [init, stage_container, check] =
    init_container_names(&planned.package_name, planned.stage);
  let mut env = vec![
    (
      ENV_OVERLAY_FRAMEWORK_VERSION.to_string(),
      format!("{}-{}", planned.package_name, planned.package_version),
    ),
  ];
  if let Some(resource_id) = &planned.resource_id {
    env.push((ENV_SKYHOOK_RESOURCE_ID.to_string(), resource_id.clone()));
  }

  let init_containers = vec![
    InitContainer {
      name: init,
      args: vec!["init".to_string(), ROOT_DIR.to_string()],
      env: env.clone(),
    },
    InitContainer {
      name: stage_container,
      args: args.clone(),
      env: env.clone(),
    },
    InitContainer {
      name: check,
      args,
      env,
    },
  ];

  WorkerObject {
    node: node.to_string(),
    declaration: declaration.name.clone(),
    package_name: planned.package_name.clone(),
    package_version: planned.package_version.clone(),
    stage: planned.stage,
    image: planned.image.clone(),
    labels,
    annotations,
    tolerations,
    init_containers,
    restarts,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use indexmap::IndexMap;
  use skyhook_client::LabelSelector;
  use std::sync::Mutex;

  fn declaration() -> Declaration {
    Declaration {
      name: "demo".into(),
      generation: 1,
      priority: 0,
      node_selector: LabelSelector::everything(),
      packages: IndexMap::new(),
      additional_tolerations: vec![Toleration {
        key: "custom".into(),
        operator: Default::default(),
        value: Some("v".into()),
        effect: None,
      }],
      pod_non_interrupt_labels: LabelSelector::everything(),
      interruption_budget: None,
      deployment_policy_ref: None,
      runtime_required: false,
      pause: false,
      disable: false,
    }
  }

  fn stage() -> PlannedStage {
    PlannedStage {
      package_name: "foobar".into(),
      package_version: "1.2.0".into(),
      image: "repo/foobar:1.2.0".into(),
      stage: Stage::Apply,
      fresh: true,
      extra: None,
      resource_id: None,
    }
  }

  #[test]
  fn built_worker_carries_declaration_and_system_tolerations() {
    let worker = build_worker("node-1", &declaration(), &stage(), 0);
    assert_eq!(worker.tolerations.len(), 3);
    assert_eq!(worker.init_containers.len(), 3);
    assert!(
      worker
        .annotations
        .contains_key(keys::WORKER_FINGERPRINT_ANNOTATION)
    );
  }

  #[derive(Default)]
  struct FakeWorkers {
    created: Mutex<Vec<WorkerObject>>,
    outcome: Mutex<Option<WorkerOutcome>>,
  }

  #[async_trait::async_trait]
  impl WorkerObjects for FakeWorkers {
    async fn create(&self, worker: WorkerObject) -> anyhow::Result<()> {
      self.created.lock().unwrap().push(worker);
      Ok(())
    }

    async fn status(
      &self,
      _node: &str,
      _package: &str,
      _stage: Stage,
    ) -> anyhow::Result<Option<WorkerOutcome>> {
      Ok(self.outcome.lock().unwrap().clone())
    }

    async fn delete(
      &self,
      _node: &str,
      _package: &str,
      _stage: Stage,
    ) -> anyhow::Result<()> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn dispatch_then_observe_not_terminal() {
    let backend = FakeWorkers::default();
    let dispatcher = Dispatcher::new(&backend);
    dispatcher
      .dispatch("node-1", &declaration(), &stage(), 0)
      .await
      .unwrap();
    assert_eq!(backend.created.lock().unwrap().len(), 1);

    let err = dispatcher
      .observe("node-1", "foobar", &stage())
      .await
      .unwrap_err();
    assert!(matches!(err, DispatchError::NotTerminal));
  }

  #[tokio::test]
  async fn observe_surfaces_failure_with_context() {
    let backend = FakeWorkers::default();
    *backend.outcome.lock().unwrap() = Some(WorkerOutcome::Failed {
      reason: "exit code 1".into(),
    });
    let dispatcher = Dispatcher::new(&backend);

    let err = dispatcher
      .observe("node-1", "foobar", &stage())
      .await
      .unwrap_err();
    match err {
      DispatchError::Failed { node, package, .. } => {
        assert_eq!(node, "node-1");
        assert_eq!(package, "foobar");
      }
      other => panic!("unexpected: {other:?}"),
    }
  }
}
