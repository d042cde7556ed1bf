//! Wires the Rollout Controller (C6, spec.md §4.6) into the reconcile
//! loop's trigger handling (spec.md §4.7 steps 1-2: "Resolve target node
//! set" / "Admit a subset under C6"). Everything in `crate::rollout` is a
//! pure decision function; this module is the glue that feeds it live
//! declarations, node inventory, and per-node stored progress, and turns
//! its answer into `ReconcileKey`s the event queue will actually drain.

use std::collections::BTreeMap as Map;
use std::sync::{Mutex, OnceLock};

use skyhook_client::{
  evaluate, BatchStrategy, Compartment, Declaration, DeploymentPolicy,
  InterruptionBudget, LabelSelector, Labels, NodeRecord,
};

use crate::{
  interrupt::NodeOps,
  planner,
  rollout::{self, compartment, gate::Gate, priority, NodeCandidate},
  state,
  store::{NodeAnnotations, NodeMetaStore, NodeStateStore, record_node_meta},
};

use super::{declaration_deletion, node_deletion, queue::ReconcileKey, WorkQueue};

/// Declaration names seen on the previous `resync` pass, kept only to
/// detect a declaration disappearing from `state::declarations()` between
/// passes (spec.md §4.7 "declaration CRUD" trigger) — there is no real
/// watch client (spec.md §1) to call `declaration_deletion::handle_deleted`
/// directly, so resync's own before/after diff stands in for it.
fn known_declarations() -> &'static Mutex<std::collections::BTreeSet<String>> {
  static KNOWN: OnceLock<Mutex<std::collections::BTreeSet<String>>> = OnceLock::new();
  KNOWN.get_or_init(|| Mutex::new(std::collections::BTreeSet::new()))
}

/// One node a declaration's selector might match, with the labels needed
/// for compartment assignment.
#[derive(Debug, Clone)]
pub struct TargetNode {
  pub name: String,
  pub labels: Labels,
}

/// Whether `declaration` has any outstanding work on this node per the
/// planner, and whether that work is already in flight (a stage was
/// dispatched on a previous pass and is now just being observed) versus
/// not yet started. Errors surfacing from graph construction count as
/// "has work" so a misconfigured declaration still gets a reconcile pass
/// that can report the real `Configuration` error, rather than being
/// silently starved of admission.
fn work_status(declaration: &Declaration, record: &NodeRecord) -> (bool, bool) {
  match planner::interrupt_needs(declaration, record) {
    Ok(needs) if !needs.is_empty() => return (true, false),
    Err(_) => return (true, false),
    _ => {}
  }
  match planner::post_interrupt_pending(declaration, record) {
    Ok(pending) if !pending.is_empty() => return (true, false),
    Err(_) => return (true, false),
    _ => {}
  }
  match planner::plan_node(declaration, record) {
    Ok(Some(stage)) => (true, !stage.fresh),
    Ok(None) => (false, false),
    Err(_) => (true, false),
  }
}

/// Resolve, for one declaration, which of its target nodes may be
/// reconciled this pass:
///
/// 1. Per-node priority (spec.md §4.6 "Priority"): among all declarations
///    selecting a given node, only the lowest-priority one with
///    outstanding work is eligible there; resolved independently per
///    node, never globally.
/// 2. Compartment assignment + budget/batch admission (spec.md §4.6
///    "Budget"/"Batch progression"), scoped to the nodes that survived
///    step 1, with every compartment's `BatchState` persisted back to
///    `state::batch_states()`.
///
/// Returns admitted node names in no particular order.
pub async fn admit(
  annotations: &dyn NodeAnnotations,
  declaration: &Declaration,
  competing: &[Declaration],
  policy: Option<&DeploymentPolicy>,
  target_nodes: &[TargetNode],
) -> Vec<String> {
  if let Gate::Disabled = crate::rollout::gate::evaluate(declaration) {
    return Vec::new();
  }

  let store = NodeStateStore::new(annotations);

  // `own_pending`: nodes `declaration` still selects with outstanding
  // work there (irrespective of who wins priority) — the universe used
  // for each compartment's `total_remaining`.
  let mut own_pending: Vec<&TargetNode> = Vec::new();
  let mut in_progress: Map<String, bool> = Map::new();
  let mut priority_eligible: Vec<String> = Vec::new();

  for node in target_nodes {
    if !evaluate(&declaration.node_selector, &node.labels).matches {
      continue;
    }

    let mut selecting: Vec<&Declaration> = vec![declaration];
    for other in competing {
      if other.name != declaration.name
        && evaluate(&other.node_selector, &node.labels).matches
      {
        selecting.push(other);
      }
    }

    let mut has_work: Map<String, bool> = Map::new();
    for candidate in &selecting {
      if let Gate::Disabled = crate::rollout::gate::evaluate(candidate) {
        has_work.insert(candidate.name.clone(), false);
        continue;
      }
      let Ok((record, _)) = store.read(&node.name, &candidate.name).await else {
        has_work.insert(candidate.name.clone(), false);
        continue;
      };
      let (work, busy) = work_status(candidate, &record);
      has_work.insert(candidate.name.clone(), work);
      if candidate.name == declaration.name {
        in_progress.insert(node.name.clone(), busy);
      }
    }

    if !*has_work.get(&declaration.name).unwrap_or(&false) {
      continue;
    }
    own_pending.push(node);

    let active =
      priority::select_active(selecting, |d| *has_work.get(&d.name).unwrap_or(&false));
    if active.map(|d| d.name.as_str()) == Some(declaration.name.as_str()) {
      priority_eligible.push(node.name.clone());
    }
  }

  let compartments: &[Compartment] =
    policy.map(|p| p.compartments.as_slice()).unwrap_or(&[]);

  let mut by_compartment: Map<Option<usize>, (Vec<NodeCandidate>, usize)> = Map::new();
  for node in &own_pending {
    let assignment = compartment::assign(compartments, &node.labels);
    let entry = by_compartment.entry(assignment.0).or_insert((Vec::new(), 0));
    entry.1 += 1;
    if priority_eligible.contains(&node.name) {
      entry.0.push(NodeCandidate {
        name: node.name.clone(),
        in_progress: in_progress.get(&node.name).copied().unwrap_or(false),
      });
    }
  }

  // Compartments with nothing pending this pass still need to run
  // through `rollout::admit` with `total_remaining == 0` so their
  // `BatchState` resets (spec.md §4.6 "Reset") — a compartment every
  // node vacated this pass (last node just completed) won't otherwise
  // appear in `by_compartment` at all.
  for index in 0..compartments.len() {
    by_compartment.entry(Some(index)).or_insert((Vec::new(), 0));
  }
  by_compartment.entry(None).or_insert((Vec::new(), 0));

  let legacy_compartment = synthesize_legacy_compartment(declaration, own_pending.len());

  let mut admitted = Vec::new();
  for (index, (candidates, total_remaining)) in by_compartment {
    let compartment_ref = match index {
      Some(i) => Some(&compartments[i]),
      None => legacy_compartment.as_ref(),
    };
    let comp_name = compartment::Assignment(index).name(compartments);
    let key = state::batch_state_key(&declaration.name, &comp_name);
    let batch_state = state::batch_states().get_or_insert_default(&key).await;
    let admission =
      rollout::admit(compartment_ref, batch_state, &candidates, total_remaining);
    state::batch_states().insert(key, admission.batch_state).await;
    admitted.extend(admission.admitted);
  }

  admitted
}

/// Legacy `interruptionBudget` (spec.md §3) translated into the same
/// `Compartment` shape `rollout::admit` expects for the synthetic
/// `__default__` compartment, so callers need only one admission code
/// path regardless of which budget style a declaration uses.
fn synthesize_legacy_compartment(
  declaration: &Declaration,
  node_count: usize,
) -> Option<Compartment> {
  let budget = match declaration.interruption_budget? {
    InterruptionBudget::Count(n) => n,
    InterruptionBudget::Percent(p) => {
      (((node_count as u64) * (p as u64) + 99) / 100).max(1) as u32
    }
  };
  Some(Compartment {
    selector: LabelSelector::everything(),
    strategy: BatchStrategy::Fixed { n: budget },
    budget,
    reset_batch_state_on_completion: true,
  })
}

/// Periodic resync (spec.md §4.7 trigger "periodic resync"; also the
/// natural home for the other trigger sources once a real watch client
/// exists): walks every known declaration, records the nodes it
/// currently selects into its node-meta companion snapshot, resolves
/// its admitted node set, and enqueues one `ReconcileKey` per admitted
/// `(declaration, node)` pair. Any companion-recorded node no longer
/// present in the live node inventory is treated as deleted (spec.md
/// §4.7 "On node deletion, all per-node state is scrubbed and the
/// node-meta companion is updated") and scrubbed via
/// `node_deletion::handle_deleted`. Finally sweeps every node for
/// `runtimeRequired` taint removal (spec.md §8 invariant 5).
pub async fn resync(
  annotations: &dyn NodeAnnotations,
  meta: &dyn NodeMetaStore,
  node_ops: &dyn NodeOps,
  queue: &WorkQueue,
) {
  let declarations = state::declarations().get_values().await;
  let nodes = state::node_inventory().get_entries().await;
  let live_node_names: std::collections::BTreeSet<String> =
    nodes.iter().map(|(name, _)| name.clone()).collect();

  let current_names: std::collections::BTreeSet<String> =
    declarations.iter().map(|d| d.name.clone()).collect();
  let previous_names =
    std::mem::replace(&mut *known_declarations().lock().unwrap(), current_names.clone());
  for removed in previous_names.difference(&current_names) {
    declaration_deletion::handle_deleted(annotations, meta, removed).await;
  }
  let target_nodes: Vec<TargetNode> = nodes
    .into_iter()
    .map(|(name, labels)| TargetNode { name, labels })
    .collect();

  for declaration in &declarations {
    let matching: Vec<TargetNode> = target_nodes
      .iter()
      .filter(|n| evaluate(&declaration.node_selector, &n.labels).matches)
      .cloned()
      .collect();
    if matching.is_empty() {
      continue;
    }

    for node in &matching {
      let _ = record_node_meta(meta, &declaration.name, &node.name).await;
    }

    let competing: Vec<Declaration> = declarations
      .iter()
      .filter(|d| d.name != declaration.name)
      .cloned()
      .collect();

    let policy = match &declaration.deployment_policy_ref {
      Some(name) => state::deployment_policies().get(name).await,
      None => None,
    };

    let admitted =
      admit(annotations, declaration, &competing, policy.as_ref(), &matching).await;
    for node in admitted {
      queue.enqueue(ReconcileKey::new(declaration.name.clone(), node)).await;
    }
  }

  for declaration in &declarations {
    let Ok((snapshot, _)) = meta.get(&declaration.name).await else { continue };
    for node in snapshot.nodes.iter().filter(|n| !live_node_names.contains(*n)) {
      node_deletion::handle_deleted(
        annotations,
        meta,
        node,
        std::slice::from_ref(&declaration.name),
      )
      .await;
    }
  }

  sweep_runtime_required_taints(annotations, node_ops, &declarations, &target_nodes).await;
}

/// Node runtime-required taint removal (spec.md §4.3, §8 invariant 5):
/// for every node targeted by at least one `runtimeRequired` declaration,
/// remove the taint once every such declaration reports `complete` there.
/// A node no `runtimeRequired` declaration targets is left untouched —
/// this engine only ever acts on a taint it has reason to reason about.
async fn sweep_runtime_required_taints(
  annotations: &dyn NodeAnnotations,
  node_ops: &dyn NodeOps,
  declarations: &[Declaration],
  target_nodes: &[TargetNode],
) {
  let store = NodeStateStore::new(annotations);
  let runtime_required: Vec<&Declaration> =
    declarations.iter().filter(|d| d.runtime_required).collect();
  if runtime_required.is_empty() {
    return;
  }

  for node in target_nodes {
    let targeting: Vec<&&Declaration> = runtime_required
      .iter()
      .filter(|d| evaluate(&d.node_selector, &node.labels).matches)
      .collect();
    if targeting.is_empty() {
      continue;
    }

    let mut all_satisfied = true;
    for declaration in &targeting {
      let Ok((record, _)) = store.read(&node.name, &declaration.name).await else {
        all_satisfied = false;
        break;
      };
      if !planner::runtime_required_satisfied(declaration, &record) {
        all_satisfied = false;
        break;
      }
    }

    if all_satisfied {
      let _ = node_ops.remove_runtime_required_taint(&node.name).await;
    }
  }
}
