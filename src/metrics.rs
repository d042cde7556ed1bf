//! Metrics (A4, spec.md §6): a `prometheus` gauge registry, with full
//! withdrawal of a declaration's series on its deletion (invariant 6,
//! spec.md §8).

use std::collections::HashMap;
use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};
use skyhook_client::{NodeStatus, PackageState, Stage};

pub struct Metrics {
  pub registry: Registry,
  status: IntGaugeVec,
  node_status_count: IntGaugeVec,
  node_target_count: IntGaugeVec,
  package_state_count: IntGaugeVec,
  package_stage_count: IntGaugeVec,
  package_restarts_count: IntGaugeVec,
}

pub fn metrics() -> &'static Metrics {
  static METRICS: OnceLock<Metrics> = OnceLock::new();
  METRICS.get_or_init(Metrics::new)
}

impl Metrics {
  fn new() -> Self {
    let registry = Registry::new();

    let status = register(
      &registry,
      "skyhook_status",
      "Declaration status indicator, one series per status value",
      &["skyhook", "status"],
    );
    let node_status_count = register(
      &registry,
      "skyhook_node_status_count",
      "Node count per declaration status",
      &["skyhook", "status"],
    );
    let node_target_count = register(
      &registry,
      "skyhook_node_target_count",
      "Nodes targeted by this declaration's node selector",
      &["skyhook"],
    );
    let package_state_count = register(
      &registry,
      "skyhook_package_state_count",
      "Node count per package state",
      &["skyhook", "package", "version", "state"],
    );
    let package_stage_count = register(
      &registry,
      "skyhook_package_stage_count",
      "Node count per package stage",
      &["skyhook", "package", "version", "stage"],
    );
    let package_restarts_count = register(
      &registry,
      "skyhook_package_restarts_count",
      "Cumulative worker restarts per package",
      &["skyhook", "package", "version"],
    );

    Self {
      registry,
      status,
      node_status_count,
      node_target_count,
      package_state_count,
      package_stage_count,
      package_restarts_count,
    }
  }

  /// Set the `{0,1}` indicator for `declaration`'s current status, zeroing
  /// every other status value for the same declaration so exactly one
  /// series reads `1` at a time.
  pub fn set_status(&self, declaration: &str, status: NodeStatus) {
    for candidate in ALL_STATUSES {
      let value = if candidate == status { 1 } else { 0 };
      self
        .status
        .with_label_values(&[declaration, status_label(candidate).as_str()])
        .set(value);
    }
  }

  pub fn set_node_status_count(
    &self,
    declaration: &str,
    status: NodeStatus,
    count: i64,
  ) {
    self
      .node_status_count
      .with_label_values(&[declaration, status_label(status).as_str()])
      .set(count);
  }

  pub fn set_node_target_count(&self, declaration: &str, count: i64) {
    self
      .node_target_count
      .with_label_values(&[declaration])
      .set(count);
  }

  pub fn set_package_state_count(
    &self,
    declaration: &str,
    package: &str,
    version: &str,
    state: PackageState,
    count: i64,
  ) {
    self
      .package_state_count
      .with_label_values(&[declaration, package, version, state_label(state).as_str()])
      .set(count);
  }

  pub fn set_package_stage_count(
    &self,
    declaration: &str,
    package: &str,
    version: &str,
    stage: Stage,
    count: i64,
  ) {
    self
      .package_stage_count
      .with_label_values(&[declaration, package, version, stage_label(stage).as_str()])
      .set(count);
  }

  pub fn set_package_restarts(
    &self,
    declaration: &str,
    package: &str,
    version: &str,
    restarts: i64,
  ) {
    self
      .package_restarts_count
      .with_label_values(&[declaration, package, version])
      .set(restarts);
  }

  /// Remove every series bearing `declaration`'s name, across every
  /// metric family (spec.md invariant 6). `prometheus`'s `IntGaugeVec`
  /// doesn't expose a "delete by partial label match" primitive, so each
  /// family is swept and any matching series is explicitly removed.
  pub fn withdraw(&self, declaration: &str) {
    withdraw_matching(&self.status, declaration);
    withdraw_matching(&self.node_status_count, declaration);
    withdraw_matching(&self.node_target_count, declaration);
    withdraw_matching(&self.package_state_count, declaration);
    withdraw_matching(&self.package_stage_count, declaration);
    withdraw_matching(&self.package_restarts_count, declaration);
  }
}

fn register(
  registry: &Registry,
  name: &str,
  help: &str,
  labels: &[&str],
) -> IntGaugeVec {
  let gauge = IntGaugeVec::new(Opts::new(name, help), labels)
    .expect("static metric definitions are well-formed");
  registry
    .register(Box::new(gauge.clone()))
    .expect("metric name collision");
  gauge
}

/// Sweep a gauge vec's exposed text form for series bearing `declaration`'s
/// `skyhook` label and delete them. `IntGaugeVec` tracks its own
/// label-to-metric map internally but only exposes deletion by exact,
/// declared-order label set, so we reconstruct candidate label sets from
/// the metric family snapshot rather than needing a side index.
///
/// `prometheus` sorts each metric's label pairs by name before exposing
/// them (`make_label_pairs`), so the declaration's `skyhook` label is not
/// reliably first positionally — families with `package`/`state`/`stage`
/// labels sort `skyhook` after `package`. Match it by name, and rebuild the
/// positional values vector from the vec's own declared label order rather
/// than from the sorted snapshot order.
fn withdraw_matching(vec: &IntGaugeVec, declaration: &str) {
  let label_names: Vec<String> = vec
    .desc()
    .first()
    .map(|desc| desc.variable_labels.clone())
    .unwrap_or_default();

  let families = vec.collect();
  for family in families {
    for metric in family.get_metric() {
      let by_name: HashMap<&str, &str> = metric
        .get_label()
        .iter()
        .map(|pair| (pair.name(), pair.value()))
        .collect();
      if by_name.get("skyhook") != Some(&declaration) {
        continue;
      }
      let values: Vec<&str> = label_names
        .iter()
        .map(|name| *by_name.get(name.as_str()).unwrap_or(&""))
        .collect();
      let _ = vec.remove_label_values(&values);
    }
  }
}

const ALL_STATUSES: [NodeStatus; 8] = [
  NodeStatus::Unknown,
  NodeStatus::InProgress,
  NodeStatus::Complete,
  NodeStatus::Erroring,
  NodeStatus::Blocked,
  NodeStatus::Waiting,
  NodeStatus::Disabled,
  NodeStatus::Paused,
];

/// Label rendering for all three leans on each type's `strum::Display`
/// impl (`skyhook_client::node_record`) rather than restating the mapping
/// here.
fn status_label(status: NodeStatus) -> String {
  status.to_string()
}

fn state_label(state: PackageState) -> String {
  state.to_string()
}

fn stage_label(stage: Stage) -> String {
  stage.to_string()
}

/// Also exposes an `IntGauge`-backed readiness probe, independent of the
/// registry above, following the teacher's habit of keeping a single
/// trivially-scraped liveness series alongside the structured metrics.
pub fn build_up_gauge(registry: &Registry) -> IntGauge {
  let gauge = IntGauge::new("skyhook_up", "1 once the reconciler loop is running")
    .expect("static metric definition is well-formed");
  registry
    .register(Box::new(gauge.clone()))
    .expect("metric name collision");
  gauge.set(1);
  gauge
}
