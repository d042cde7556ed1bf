//! Reconciler Loop (C7, spec.md §4.7): ties C1-C6 together for one
//! `(node, declaration)` pair per pass, and drives the event queue that
//! decides which pairs run when.

pub mod admission;
pub mod declaration_deletion;
pub mod node_deletion;
pub mod queue;

use std::time::Duration;

use skyhook_client::{
  Declaration, NodeRecord, NodeStatus, PackageRecord, PackageState, Stage,
};

use crate::{
  dispatcher::{DispatchError, Dispatcher, WorkerObjects, WorkerOutcome},
  error::ReconcileError,
  interrupt::{self, Coordinator, NodeOps},
  metrics,
  planner::{self, InterruptNeed, PlannedStage},
  rollout::gate::{self, Gate},
  store::{NodeAnnotations, NodeStateStore, ResourceVersion},
};

pub use admission::{resync, TargetNode};
pub use declaration_deletion::handle_deleted as handle_declaration_deleted;
pub use node_deletion::handle_deleted as handle_node_deleted;
pub use queue::{ReconcileKey, WorkQueue};

/// Everything one reconcile pass needs to reach the cluster. A real
/// binary backs these with Kubernetes clients; tests use the in-memory
/// fakes alongside `store::fake::FakeNodeAnnotations`.
pub struct Reconciler<'a> {
  pub annotations: &'a dyn NodeAnnotations,
  pub workers: &'a dyn WorkerObjects,
  pub node_ops: &'a dyn NodeOps,
  pub max_worker_restarts: u32,
}

/// One package's whole-entry record, either fresh or mutated in place by
/// stage-success bookkeeping.
fn upsert(
  record: &mut NodeRecord,
  stage: &PlannedStage,
  state: PackageState,
  config_hash: Option<String>,
) {
  let key = skyhook_client::keys::package_key(
    &stage.package_name,
    &stage.package_version,
  );
  let entry = record.packages.entry(key).or_insert_with(|| PackageRecord {
    name: stage.package_name.clone(),
    version: stage.package_version.clone(),
    image: stage.image.clone(),
    stage: stage.stage,
    state,
    restarts: 0,
    config_hash: None,
    interrupt_resource_id: None,
    post_interrupt_resource_id: None,
  });
  entry.stage = stage.stage;
  entry.state = state;
  entry.image = stage.image.clone();
  if let Some(hash) = config_hash {
    entry.config_hash = Some(hash);
  }
  if stage.stage == Stage::Interrupt {
    if let Some(id) = &stage.resource_id {
      entry.interrupt_resource_id = Some(id.clone());
    }
  }
  if stage.stage == Stage::PostInterrupt {
    if let Some(id) = &stage.resource_id {
      entry.post_interrupt_resource_id = Some(id.clone());
    }
  }
}

impl<'a> Reconciler<'a> {
  pub fn new(
    annotations: &'a dyn NodeAnnotations,
    workers: &'a dyn WorkerObjects,
    node_ops: &'a dyn NodeOps,
    max_worker_restarts: u32,
  ) -> Self {
    Self { annotations, workers, node_ops, max_worker_restarts }
  }

  /// One reconcile pass for one `(node, declaration)` pair. `Ok(())`
  /// means the pass made forward progress or found nothing to do (the
  /// caller should not requeue); `Err` carries the bucket (spec.md §7)
  /// the caller's queue uses to decide whether/when to requeue.
  pub async fn reconcile_node(
    &self,
    node: &str,
    declaration: &Declaration,
  ) -> Result<(), ReconcileError> {
    let store = NodeStateStore::new(self.annotations);
    let (mut record, version) = store.read(node, &declaration.name).await?;

    let gate = gate::evaluate(declaration);
    if let Gate::Disabled = gate {
      self
        .set_status_if_changed(&store, node, declaration, &mut record, &version, NodeStatus::Disabled)
        .await?;
      return Ok(());
    }

    let interrupt_needs = planner::interrupt_needs(declaration, &record)?;
    if !interrupt_needs.is_empty() {
      if let Gate::Paused = gate {
        self
          .set_status_if_changed(&store, node, declaration, &mut record, &version, NodeStatus::Paused)
          .await?;
        return Ok(());
      }
      return self
        .run_interrupt_group(&store, node, declaration, &mut record, &version, interrupt_needs)
        .await;
    }

    let post_pending = planner::post_interrupt_pending(declaration, &record)?;
    if let Some(stage) = post_pending.into_iter().next() {
      let outcome = self.run_stage(&store, node, declaration, &mut record, &version, &stage).await;
      if post_interrupt_fully_done(declaration, &record)? {
        let _ = self.node_ops.uncordon(node, &declaration.name).await;
      }
      return outcome;
    }

    let planned = planner::plan_node(declaration, &record)?;
    let Some(stage) = planned else {
      self
        .set_status_if_changed(&store, node, declaration, &mut record, &version, NodeStatus::Complete)
        .await?;
      return Ok(());
    };

    if let Gate::Paused = gate {
      if stage.fresh {
        self
          .set_status_if_changed(&store, node, declaration, &mut record, &version, NodeStatus::Paused)
          .await?;
        return Ok(());
      }
      // Not fresh: an already in-flight stage may finish while paused.
    }

    metrics::metrics().set_status(&declaration.name, NodeStatus::InProgress);
    self.run_stage(&store, node, declaration, &mut record, &version, &stage).await
  }

  async fn set_status_if_changed(
    &self,
    store: &NodeStateStore<'a>,
    node: &str,
    declaration: &Declaration,
    record: &mut NodeRecord,
    version: &ResourceVersion,
    status: NodeStatus,
  ) -> Result<(), ReconcileError> {
    if record.status == status {
      metrics::metrics().set_status(&declaration.name, status);
      return Ok(());
    }
    record.status = status;
    record.version = declaration.generation.to_string();
    store.write(node, &declaration.name, record, version).await?;
    metrics::metrics().set_status(&declaration.name, status);
    Ok(())
  }

  async fn run_stage(
    &self,
    store: &NodeStateStore<'a>,
    node: &str,
    declaration: &Declaration,
    record: &mut NodeRecord,
    version: &ResourceVersion,
    stage: &PlannedStage,
  ) -> Result<(), ReconcileError> {
    let dispatcher = Dispatcher::new(self.workers);

    if stage.fresh {
      let restarts = record
        .package_by_name(&stage.package_name)
        .map(|p| p.restarts)
        .unwrap_or(0);
      dispatcher.dispatch(node, declaration, stage, restarts).await?;
      upsert(record, stage, PackageState::InProgress, None);
      record.status = NodeStatus::InProgress;
      store.write(node, &declaration.name, record, version).await?;
      return Err(ReconcileError::Transient(
        "worker dispatched; awaiting terminal status".into(),
      ));
    }

    match dispatcher.observe(node, &stage.package_name, stage).await {
      Ok(WorkerOutcome::Succeeded) => {
        self.advance_on_success(declaration, record, stage);
        if stage.stage == Stage::Uninstall {
          let key = skyhook_client::keys::package_key(
            &stage.package_name,
            &stage.package_version,
          );
          record.packages.remove(&key);
        }
        record.status = NodeStatus::InProgress;
        store.write(node, &declaration.name, record, version).await?;
        Ok(())
      }
      Err(DispatchError::NotTerminal) => {
        Err(ReconcileError::Transient("worker not yet terminal".into()))
      }
      Err(DispatchError::Backend(msg)) => Err(ReconcileError::Transient(msg)),
      Err(DispatchError::Failed { node, package, reason }) => {
        let restarts = self.bump_restarts(record, stage);
        record.status = if restarts >= self.max_worker_restarts {
          NodeStatus::Erroring
        } else {
          NodeStatus::InProgress
        };
        store.write(&node, &declaration.name, record, version).await?;
        metrics::metrics().set_status(&declaration.name, record.status);
        if restarts >= self.max_worker_restarts {
          Ok(())
        } else {
          Err(ReconcileError::Execution { node, package, reason })
        }
      }
    }
  }

  fn advance_on_success(
    &self,
    declaration: &Declaration,
    record: &mut NodeRecord,
    stage: &PlannedStage,
  ) {
    let config_hash = if stage.stage == Stage::Config {
      declaration
        .packages
        .get(&stage.package_name)
        .map(|spec| spec.config_hash())
    } else {
      None
    };
    upsert(record, stage, PackageState::Complete, config_hash);
  }

  fn bump_restarts(&self, record: &mut NodeRecord, stage: &PlannedStage) -> u32 {
    let key = skyhook_client::keys::package_key(
      &stage.package_name,
      &stage.package_version,
    );
    let entry = record.packages.entry(key).or_insert_with(|| PackageRecord {
      name: stage.package_name.clone(),
      version: stage.package_version.clone(),
      image: stage.image.clone(),
      stage: stage.stage,
      state: PackageState::Erroring,
      restarts: 0,
      config_hash: None,
      interrupt_resource_id: None,
      post_interrupt_resource_id: None,
    });
    entry.state = PackageState::Erroring;
    entry.restarts += 1;
    entry.restarts
  }

  /// Merge every package on this node needing an interrupt, cordon,
  /// evict, wait, dispatch one grouped worker, and on success mark every
  /// participating package's `interrupt_resource_id` (spec.md §4.5). The
  /// cordon itself is released later, once `post_interrupt_fully_done`
  /// confirms every participant's post-interrupt stage has also run.
  async fn run_interrupt_group(
    &self,
    store: &NodeStateStore<'a>,
    node: &str,
    declaration: &Declaration,
    record: &mut NodeRecord,
    version: &ResourceVersion,
    needs: Vec<InterruptNeed>,
  ) -> Result<(), ReconcileError> {
    let Some(merged) = interrupt::merge(&needs) else { return Ok(()) };
    let coordinator = Coordinator::new(self.node_ops);

    coordinator
      .prepare(node, declaration)
      .await
      .map_err(|e| match e {
        interrupt::InterruptError::WaitTimeout => {
          ReconcileError::Transient("wait-for-pod timed out".into())
        }
        interrupt::InterruptError::Backend(msg) => ReconcileError::Transient(msg),
      })?;

    let dispatcher = Dispatcher::new(self.workers);
    let group_stage = PlannedStage {
      package_name: "__interrupt__".to_string(),
      package_version: merged.resource_id.clone(),
      image: String::new(),
      stage: Stage::Interrupt,
      fresh: true,
      extra: Some(interrupt::extra_payload(&merged)),
      resource_id: Some(merged.resource_id.clone()),
    };
    dispatcher.dispatch(node, declaration, &group_stage, 0).await?;

    loop {
      match dispatcher
        .observe(node, "__interrupt__", &group_stage)
        .await
      {
        Ok(WorkerOutcome::Succeeded) => break,
        Err(DispatchError::NotTerminal) => {
          return Err(ReconcileError::Transient(
            "grouped interrupt worker not yet terminal".into(),
          ));
        }
        Err(DispatchError::Backend(msg)) => {
          return Err(ReconcileError::Transient(msg));
        }
        Err(DispatchError::Failed { node, package, reason }) => {
          return Err(ReconcileError::Execution { node, package, reason });
        }
      }
    }

    for need in &needs {
      let key =
        skyhook_client::keys::package_key(&need.package_name, &need.package_version);
      if let Some(entry) = record.packages.get_mut(&key) {
        entry.stage = Stage::Interrupt;
        entry.state = PackageState::Complete;
        entry.interrupt_resource_id = Some(need.resource_id.clone());
      }
    }
    record.last_interrupt_resource_id = Some(merged.resource_id.clone());
    store.write(node, &declaration.name, record, version).await?;
    Ok(())
  }
}

/// `true` once every package that required an interrupt for its current
/// `interrupt_resource_id` has also completed its matching
/// `post_interrupt_resource_id` — the point at which the cordon placed
/// for that group may be released (spec.md §4.5 step 6).
fn post_interrupt_fully_done(
  declaration: &Declaration,
  record: &NodeRecord,
) -> Result<bool, skyhook_client::GraphError> {
  Ok(planner::post_interrupt_pending(declaration, record)?.is_empty())
}

/// Backoff policy applied by the top-level loop around `reconcile_node`
/// (spec.md §7): only `Transient` requeues with backoff and no further
/// mutation; `Execution` has already mutated state inside
/// `reconcile_node` and requeues too; `Configuration`/`Tolerability`
/// surface status and do not requeue on a timer (they wait for the
/// declaration to be edited); `Lifecycle` is scrub-and-ignore, handled by
/// the node-deletion path rather than this function.
pub fn requeue_delay(error: &ReconcileError, max_backoff: Duration) -> Option<Duration> {
  use crate::error::ErrorPolicy;
  match error.policy() {
    ErrorPolicy::RequeueOnly | ErrorPolicy::MutateStateAndRequeue => {
      Some(max_backoff.min(Duration::from_secs(30)))
    }
    ErrorPolicy::SurfaceStatusOnly | ErrorPolicy::ScrubAndIgnore => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::fake::FakeNodeAnnotations;
  use indexmap::IndexMap;
  use skyhook_client::{
    ConfigEntry, InterruptSpec, InterruptType, LabelSelector, PackageSpec,
  };
  use std::{collections::BTreeMap, sync::Mutex as StdMutex};

  fn declaration(packages: IndexMap<String, PackageSpec>) -> Declaration {
    Declaration {
      name: "demo".into(),
      generation: 1,
      priority: 0,
      node_selector: LabelSelector::everything(),
      packages,
      additional_tolerations: Vec::new(),
      pod_non_interrupt_labels: LabelSelector::everything(),
      interruption_budget: None,
      deployment_policy_ref: None,
      runtime_required: false,
      pause: false,
      disable: false,
    }
  }

  fn pkg(version: &str) -> PackageSpec {
    PackageSpec {
      version: semver::Version::parse(version).unwrap(),
      image: "repo/pkg:latest".into(),
      config_map: BTreeMap::new(),
      env: Vec::new(),
      interrupt: None,
      depends_on: BTreeMap::new(),
    }
  }

  #[derive(Default)]
  struct FakeWorkers {
    outcomes: StdMutex<BTreeMap<String, WorkerOutcome>>,
    created: StdMutex<Vec<(String, Stage)>>,
  }

  impl FakeWorkers {
    fn succeed(&self, package: &str, stage: Stage) {
      self
        .outcomes
        .lock()
        .unwrap()
        .insert(format!("{package}/{stage:?}"), WorkerOutcome::Succeeded);
    }
  }

  #[async_trait::async_trait]
  impl WorkerObjects for FakeWorkers {
    async fn create(&self, worker: skyhook_client::WorkerObject) -> anyhow::Result<()> {
      self
        .created
        .lock()
        .unwrap()
        .push((worker.package_name.clone(), worker.stage));
      Ok(())
    }

    async fn status(
      &self,
      _node: &str,
      package: &str,
      stage: Stage,
    ) -> anyhow::Result<Option<WorkerOutcome>> {
      Ok(
        self
          .outcomes
          .lock()
          .unwrap()
          .get(&format!("{package}/{stage:?}"))
          .cloned(),
      )
    }

    async fn delete(&self, _node: &str, _package: &str, _stage: Stage) -> anyhow::Result<()> {
      Ok(())
    }
  }

  #[derive(Default)]
  struct FakeNodeOps;

  #[async_trait::async_trait]
  impl NodeOps for FakeNodeOps {
    async fn cordon(&self, _node: &str, _declaration: &str) -> anyhow::Result<()> {
      Ok(())
    }
    async fn uncordon(&self, _node: &str, _declaration: &str) -> anyhow::Result<()> {
      Ok(())
    }
    async fn list_pods(&self, _node: &str) -> anyhow::Result<Vec<interrupt::PodRef>> {
      Ok(Vec::new())
    }
    async fn evict_pod(&self, _pod: &interrupt::PodRef) -> anyhow::Result<()> {
      Ok(())
    }
    async fn wait_for_pod_gone(&self, _pod: &interrupt::PodRef) -> anyhow::Result<bool> {
      Ok(true)
    }
    async fn remove_runtime_required_taint(&self, _node: &str) -> anyhow::Result<()> {
      Ok(())
    }
  }

  #[tokio::test]
  async fn simple_apply_then_config_reaches_complete() {
    let mut packages = IndexMap::new();
    packages.insert("foobar".into(), pkg("1.2.0"));
    let declaration = declaration(packages);

    let annotations = FakeNodeAnnotations::default();
    let workers = FakeWorkers::default();
    let node_ops = FakeNodeOps::default();
    let reconciler = Reconciler::new(&annotations, &workers, &node_ops, 5);

    // Pass 1: dispatches apply, transiently errors (awaiting terminal).
    let err = reconciler
      .reconcile_node("node-1", &declaration)
      .await
      .unwrap_err();
    assert!(matches!(err, ReconcileError::Transient(_)));

    // Apply succeeds.
    workers.succeed("foobar", Stage::Apply);
    reconciler.reconcile_node("node-1", &declaration).await.unwrap();

    // Pass 3: dispatches config.
    let err = reconciler
      .reconcile_node("node-1", &declaration)
      .await
      .unwrap_err();
    assert!(matches!(err, ReconcileError::Transient(_)));

    workers.succeed("foobar", Stage::Config);
    reconciler.reconcile_node("node-1", &declaration).await.unwrap();

    // Node fully reconciled.
    reconciler.reconcile_node("node-1", &declaration).await.unwrap();

    let store = NodeStateStore::new(&annotations);
    let (record, _) = store.read("node-1", "demo").await.unwrap();
    assert_eq!(record.status, NodeStatus::Complete);
    let entry = record.package_by_name("foobar").unwrap();
    assert_eq!(entry.stage, Stage::Config);
    assert_eq!(entry.state, PackageState::Complete);
  }

  #[tokio::test]
  async fn depends_on_blocks_dependent_until_dependencies_complete() {
    let mut packages = IndexMap::new();
    packages.insert("a".into(), pkg("1.0.0"));
    packages.insert("b".into(), pkg("1.0.0"));
    let mut c = pkg("1.0.0");
    c.depends_on = BTreeMap::from([
      ("a".to_string(), "1.0.0".to_string()),
      ("b".to_string(), "1.0.0".to_string()),
    ]);
    packages.insert("c".into(), c);
    let declaration = declaration(packages);

    let annotations = FakeNodeAnnotations::default();
    let workers = FakeWorkers::default();
    let node_ops = FakeNodeOps::default();
    let reconciler = Reconciler::new(&annotations, &workers, &node_ops, 5);

    // First pass plans "a" (topo order a, b, c — a first alphabetically
    // among roots).
    reconciler.reconcile_node("node-1", &declaration).await.unwrap_err();
    assert_eq!(workers.created.lock().unwrap().last().unwrap().0, "a");
    assert!(!workers.created.lock().unwrap().iter().any(|(n, _)| n == "c"));
  }

  #[tokio::test]
  async fn disable_gate_dispatches_no_workers() {
    let mut packages = IndexMap::new();
    packages.insert("foobar".into(), pkg("1.0.0"));
    let mut declaration = declaration(packages);
    declaration.disable = true;

    let annotations = FakeNodeAnnotations::default();
    let workers = FakeWorkers::default();
    let node_ops = FakeNodeOps::default();
    let reconciler = Reconciler::new(&annotations, &workers, &node_ops, 5);

    reconciler.reconcile_node("node-1", &declaration).await.unwrap();
    assert!(workers.created.lock().unwrap().is_empty());

    let store = NodeStateStore::new(&annotations);
    let (record, _) = store.read("node-1", "demo").await.unwrap();
    assert_eq!(record.status, NodeStatus::Disabled);
  }

  #[tokio::test]
  async fn interrupt_needs_merge_across_two_packages() {
    let mut a = pkg("1.0.0");
    a.interrupt = Some(InterruptSpec {
      interrupt_type: InterruptType::Service,
      services: vec!["cron".into()],
    });
    let mut b = pkg("1.0.0");
    b.interrupt = Some(InterruptSpec {
      interrupt_type: InterruptType::Service,
      services: vec!["containerd".into(), "foobar".into()],
    });
    let mut packages = IndexMap::new();
    packages.insert("a".into(), a);
    packages.insert("b".into(), b);
    let declaration = declaration(packages);

    let annotations = FakeNodeAnnotations::default();
    let workers = FakeWorkers::default();
    let node_ops = FakeNodeOps::default();
    let reconciler = Reconciler::new(&annotations, &workers, &node_ops, 5);

    // Seed both packages as already applied + configured, ready for
    // interrupt.
    let store = NodeStateStore::new(&annotations);
    let (_empty, version) = store.read("node-1", "demo").await.unwrap();
    let mut record = NodeRecord { status: NodeStatus::InProgress, version: "1".into(), ..Default::default() };
    for (name, spec) in &declaration.packages {
      record.packages.insert(
        skyhook_client::keys::package_key(name, &spec.version.to_string()),
        PackageRecord {
          name: name.clone(),
          version: spec.version.to_string(),
          image: format!("repo/{name}:{}", spec.version),
          stage: Stage::Config,
          state: PackageState::Complete,
          restarts: 0,
          config_hash: Some(spec.config_hash()),
          interrupt_resource_id: None,
          post_interrupt_resource_id: None,
        },
      );
    }
    store.write("node-1", "demo", &record, &version).await.unwrap();

    workers.succeed("__interrupt__", Stage::Interrupt);
    reconciler.reconcile_node("node-1", &declaration).await.unwrap();

    let (record, _) = store.read("node-1", "demo").await.unwrap();
    for (name, spec) in &declaration.packages {
      let entry = record.package_by_name(name).unwrap();
      // Each participant's stored id must be its own per-package
      // resourceId, not the merged group id — otherwise `interrupt_needs`
      // never matches it and re-enqueues the interrupt forever.
      assert_eq!(
        entry.interrupt_resource_id.as_deref(),
        Some(spec.interrupt_resource_id(declaration.generation).as_str())
      );
    }
    assert!(planner::interrupt_needs(&declaration, &record).unwrap().is_empty());

    // A further reconcile pass must not dispatch a second grouped
    // interrupt worker now that both packages are gated past it.
    let created_before = workers.created.lock().unwrap().len();
    let _ = reconciler.reconcile_node("node-1", &declaration).await;
    let created_after = workers.created.lock().unwrap().len();
    assert!(
      !workers
        .created
        .lock()
        .unwrap()
        .iter()
        .skip(created_before)
        .any(|(pkg, stage)| pkg == "__interrupt__" && *stage == Stage::Interrupt),
      "must not re-dispatch the grouped interrupt; created {created_before}..{created_after}"
    );
  }
}
