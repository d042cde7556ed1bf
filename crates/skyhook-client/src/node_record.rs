use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::keys::package_key;

/// Per-node, per-declaration durable record (spec.md §3), stored as JSON
/// under the declaration's `nodeState_<decl>` annotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRecord {
  #[serde(default)]
  pub status: NodeStatus,
  /// Generation tag of the last applied declaration.
  #[serde(default)]
  pub version: String,
  /// `name|version` -> package progress.
  #[serde(default)]
  pub packages: BTreeMap<String, PackageRecord>,
  /// The resource id of the last interrupt group dispatched on this node
  /// for this declaration, used to gate re-dispatch on reconcile churn.
  #[serde(default)]
  pub last_interrupt_resource_id: Option<String>,
}

impl NodeRecord {
  pub fn package(
    &self,
    name: &str,
    version: &str,
  ) -> Option<&PackageRecord> {
    self.packages.get(&package_key(name, version))
  }

  /// At most one entry is expected per package name; more than one
  /// indicates an in-flight version transition (upgrade/downgrade).
  pub fn package_by_name(&self, name: &str) -> Option<&PackageRecord> {
    self.packages.values().find(|p| p.name == name)
  }

  pub fn installed_set(&self) -> std::collections::BTreeSet<(String, String)> {
    self
      .packages
      .values()
      .filter(|p| p.state == PackageState::Complete)
      .map(|p| (p.name.clone(), p.version.clone()))
      .collect()
  }
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeStatus {
  #[default]
  Unknown,
  InProgress,
  Complete,
  Erroring,
  Blocked,
  Waiting,
  Disabled,
  Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRecord {
  pub name: String,
  pub version: String,
  pub image: String,
  pub stage: Stage,
  pub state: PackageState,
  #[serde(default)]
  pub restarts: u32,
  /// Hash of the configMap content last successfully applied to this
  /// package. Compared against the declaration's current config hash to
  /// decide whether the config stage needs to re-run (spec.md §4.3 rule
  /// 4); `None` until the config stage has completed once.
  #[serde(default)]
  pub config_hash: Option<String>,
  /// resource id of the interrupt group this package last required and
  /// received; gates re-dispatch across reconciles for the same group
  /// (spec.md §4.3 rule 5).
  #[serde(default)]
  pub interrupt_resource_id: Option<String>,
  /// resource id of the interrupt group whose post-interrupt step has
  /// already run for this package; post-interrupt runs at most once per
  /// group (spec.md §4.3 rule 6).
  #[serde(default)]
  pub post_interrupt_resource_id: Option<String>,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
  Uninstall,
  Upgrade,
  Apply,
  Config,
  Interrupt,
  #[serde(rename = "post-interrupt")]
  #[strum(serialize = "post-interrupt")]
  PostInterrupt,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PackageState {
  #[default]
  Unknown,
  InProgress,
  Complete,
  Erroring,
  Skipped,
}
