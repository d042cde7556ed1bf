//! Per-Node Planner (C3, spec.md §4.3): given a declaration and the
//! node's current `NodeRecord`, decide the next stage to execute for the
//! first package with outstanding work.

use semver::Version;
use serde_json::json;
use skyhook_client::{
  Declaration, GraphError, InterruptType, NodeRecord, PackageGraph,
  PackageRecord, PackageSpec, PackageState, Stage,
};

/// The stage the reconciler should drive next for one package on one node.
/// `fresh` distinguishes "start this stage" from "this stage is already
/// in-flight, keep observing/retrying it" — the dispatcher uses this to
/// decide whether a new worker is needed or an existing one should just be
/// observed (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
  pub package_name: String,
  pub package_version: String,
  pub image: String,
  pub stage: Stage,
  pub fresh: bool,
  pub extra: Option<serde_json::Value>,
  pub resource_id: Option<String>,
}

/// One package's pending interrupt need, prior to the cross-package merge
/// the Interrupt Coordinator performs (C5, spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptNeed {
  pub package_name: String,
  pub package_version: String,
  pub interrupt_type: InterruptType,
  pub services: Vec<String>,
  pub resource_id: String,
}

/// Compute the next stage to execute on this node for this declaration, or
/// `None` if the node is fully reconciled. Rebuilds the `PackageGraph`
/// defensively on every call (spec.md §9's cyclic-dependency-risk note),
/// using packages already recorded complete on the node to resolve
/// `dependsOn` against prior installs.
pub fn plan_node(
  declaration: &Declaration,
  record: &NodeRecord,
) -> Result<Option<PlannedStage>, GraphError> {
  let installed = record.installed_set();
  let graph = PackageGraph::build(&declaration.packages, &installed)?;

  if let Some(stage) = plan_removals(declaration, record) {
    return Ok(Some(stage));
  }

  for name in graph.order() {
    let spec = &declaration.packages[name];
    if let Some(stage) =
      plan_package(declaration.generation, name, spec, record.package_by_name(name))
    {
      return Ok(Some(stage));
    }
  }

  Ok(None)
}

/// Whether `declaration`'s runtime-required requirement, if any, is
/// satisfied on this node (spec.md §4.3, §8 invariant 5: "the planner does
/// not remove that taint until every runtime-required declaration
/// targeting THAT node reports complete"). A declaration that doesn't set
/// `runtimeRequired` never blocks removal.
pub fn runtime_required_satisfied(declaration: &Declaration, record: &NodeRecord) -> bool {
  !declaration.runtime_required || record.status == skyhook_client::NodeStatus::Complete
}

/// All packages on this node currently needing an interrupt dispatched
/// *right now* (stage decision would be `Stage::Interrupt`, fresh), in
/// graph order. Empty if nothing needs interrupting this pass. Used by the
/// Interrupt Coordinator to merge multiple needs into one grouped
/// interrupt (spec.md §4.5).
pub fn interrupt_needs(
  declaration: &Declaration,
  record: &NodeRecord,
) -> Result<Vec<InterruptNeed>, GraphError> {
  let installed = record.installed_set();
  let graph = PackageGraph::build(&declaration.packages, &installed)?;

  let mut needs = Vec::new();
  for name in graph.order() {
    let spec = &declaration.packages[name];
    let Some(interrupt) = &spec.interrupt else { continue };
    let existing = record.package_by_name(name);
    let Some(rec) = existing else { continue };
    if rec.version != spec.version.to_string() || rec.state != PackageState::Complete {
      continue;
    }
    if rec.config_hash.as_deref() != Some(spec.config_hash().as_str()) {
      continue;
    }
    let resource_id = spec.interrupt_resource_id(declaration.generation);
    if rec.interrupt_resource_id.as_deref() == Some(resource_id.as_str()) {
      continue;
    }
    needs.push(InterruptNeed {
      package_name: name.clone(),
      package_version: spec.version.to_string(),
      interrupt_type: interrupt.interrupt_type,
      services: interrupt.services.clone(),
      resource_id,
    });
  }
  Ok(needs)
}

/// Packages whose post-interrupt stage has not yet run for the interrupt
/// group they just completed, in reverse graph order (spec.md §4.5 step
/// 5: "run `post-interrupt` stage for each participating package (reverse
/// topological order)").
pub fn post_interrupt_pending(
  declaration: &Declaration,
  record: &NodeRecord,
) -> Result<Vec<PlannedStage>, GraphError> {
  let installed = record.installed_set();
  let graph = PackageGraph::build(&declaration.packages, &installed)?;

  let mut pending = Vec::new();
  for name in graph.reverse_order() {
    let spec = &declaration.packages[name];
    let Some(interrupt) = &spec.interrupt else { continue };
    let Some(rec) = record.package_by_name(name) else { continue };
    if rec.version != spec.version.to_string() || rec.state != PackageState::Complete {
      continue;
    }
    let resource_id = spec.interrupt_resource_id(declaration.generation);
    let interrupt_done = rec.interrupt_resource_id.as_deref() == Some(resource_id.as_str());
    let post_done = rec.post_interrupt_resource_id.as_deref() == Some(resource_id.as_str());
    if interrupt_done && !post_done {
      pending.push(PlannedStage {
        package_name: name.clone(),
        package_version: spec.version.to_string(),
        image: package_image(spec),
        stage: Stage::PostInterrupt,
        fresh: true,
        extra: Some(json!({"type": interrupt.interrupt_type, "services": interrupt.services})),
        resource_id: Some(resource_id),
      });
    }
  }
  Ok(pending)
}

/// Removal pass: packages recorded on the node but absent from the
/// declaration, or recorded at a version the declaration no longer wants
/// (downgrade modeled as uninstall-then-apply, spec.md §4.3 edge case).
/// Iterated in reverse storage-key order for determinism, since removed
/// packages may not appear in the current declaration's graph at all.
fn plan_removals(
  declaration: &Declaration,
  record: &NodeRecord,
) -> Option<PlannedStage> {
  for rec in record.packages.values().rev() {
    if !needs_removal(declaration, rec) {
      continue;
    }
    if rec.stage == Stage::Uninstall && rec.state == PackageState::Complete {
      // Already finished; the reconciler should have pruned this entry.
      // Defensive no-op so a late prune doesn't re-dispatch uninstall.
      continue;
    }
    let fresh = !(rec.stage == Stage::Uninstall
      && matches!(rec.state, PackageState::InProgress | PackageState::Erroring));
    return Some(PlannedStage {
      package_name: rec.name.clone(),
      package_version: rec.version.clone(),
      image: rec.image.clone(),
      stage: Stage::Uninstall,
      fresh,
      extra: None,
      resource_id: None,
    });
  }
  None
}

fn needs_removal(declaration: &Declaration, rec: &PackageRecord) -> bool {
  match declaration.packages.get(&rec.name) {
    None => true,
    Some(spec) => {
      let declared = &spec.version;
      let Ok(stored) = Version::parse(&rec.version) else {
        return false;
      };
      *declared < stored
    }
  }
}

fn plan_package(
  generation: u64,
  name: &str,
  spec: &PackageSpec,
  existing: Option<&PackageRecord>,
) -> Option<PlannedStage> {
  let declared_version = spec.version.to_string();
  let image = package_image(spec);

  let Some(rec) = existing else {
    return Some(PlannedStage {
      package_name: name.to_string(),
      package_version: declared_version,
      image,
      stage: Stage::Apply,
      fresh: true,
      extra: None,
      resource_id: None,
    });
  };

  if rec.version != declared_version {
    // Removal pass already returned early if `stored > declared`; reaching
    // here with a version mismatch means `stored < declared`: an upgrade.
    let fresh = !(rec.stage == Stage::Upgrade
      && matches!(rec.state, PackageState::InProgress | PackageState::Erroring));
    return Some(PlannedStage {
      package_name: name.to_string(),
      package_version: declared_version,
      image,
      stage: Stage::Upgrade,
      fresh,
      extra: None,
      resource_id: None,
    });
  }

  if rec.state != PackageState::Complete {
    // Currently-recorded stage is still in flight; keep driving it.
    return Some(PlannedStage {
      package_name: name.to_string(),
      package_version: declared_version,
      image,
      stage: rec.stage,
      fresh: false,
      extra: None,
      resource_id: None,
    });
  }

  if rec.config_hash.as_deref() != Some(spec.config_hash().as_str()) {
    return Some(PlannedStage {
      package_name: name.to_string(),
      package_version: declared_version,
      image,
      stage: Stage::Config,
      fresh: true,
      extra: None,
      resource_id: None,
    });
  }

  let Some(interrupt) = &spec.interrupt else {
    return None;
  };
  let resource_id = spec.interrupt_resource_id(generation);
  if rec.interrupt_resource_id.as_deref() != Some(resource_id.as_str()) {
    return Some(PlannedStage {
      package_name: name.to_string(),
      package_version: declared_version,
      image,
      stage: Stage::Interrupt,
      fresh: true,
      extra: Some(json!({
        "type": interrupt.interrupt_type,
        "services": interrupt.services,
      })),
      resource_id: Some(resource_id),
    });
  }
  if rec.post_interrupt_resource_id.as_deref() != Some(resource_id.as_str()) {
    return Some(PlannedStage {
      package_name: name.to_string(),
      package_version: declared_version,
      image,
      stage: Stage::PostInterrupt,
      fresh: true,
      extra: None,
      resource_id: Some(resource_id),
    });
  }

  None
}

/// The declared image with `:tag` replaced by the version verbatim
/// (spec.md §3 "Package" identity rules). Only the segment after the last
/// `/` is checked for a `:tag`, so a `host:port/repo` registry reference
/// isn't mistaken for one.
pub fn package_image(spec: &PackageSpec) -> String {
  let version = spec.version.to_string();
  let (prefix, last_segment) = match spec.image.rfind('/') {
    Some(slash) => spec.image.split_at(slash + 1),
    None => ("", spec.image.as_str()),
  };
  match last_segment.rsplit_once(':') {
    Some((repo, _tag)) => format!("{prefix}{repo}:{version}"),
    None => format!("{prefix}{last_segment}:{version}"),
  }
}
