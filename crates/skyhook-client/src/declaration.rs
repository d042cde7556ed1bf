use std::collections::BTreeMap;

use indexmap::IndexMap;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::selector::LabelSelector;

/// Cluster-scoped desired state: a node selector paired with a set of
/// packages to install on every matching node (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declaration {
  pub name: String,
  /// Monotonic generation bumped on every spec change. Feeds
  /// `resourceId` computation and the `version_<decl>` node annotation.
  pub generation: u64,
  /// Lower runs first. Declarations with equal priority are ordered by
  /// name ascending.
  #[serde(default)]
  pub priority: i32,
  pub node_selector: LabelSelector,
  /// Package name -> spec. Iteration order for stage execution is always
  /// determined by `PackageGraph`, never map order.
  pub packages: IndexMap<String, PackageSpec>,
  #[serde(default)]
  pub additional_tolerations: Vec<Toleration>,
  /// Pods matching this selector are never evicted by the interrupt
  /// coordinator.
  #[serde(default)]
  pub pod_non_interrupt_labels: LabelSelector,
  /// Legacy fixed-size rollout control. Superseded by
  /// `deployment_policy_ref`; mutually exclusive with it.
  #[serde(default)]
  pub interruption_budget: Option<InterruptionBudget>,
  pub deployment_policy_ref: Option<String>,
  /// Require nodes to carry the runtime-required taint on entry; it is
  /// removed only once this declaration (among all runtime-required
  /// declarations targeting the node) reports `complete` there.
  #[serde(default)]
  pub runtime_required: bool,
  #[serde(default)]
  pub pause: bool,
  #[serde(default)]
  pub disable: bool,
}

impl Declaration {
  pub fn uses_legacy_budget(&self) -> bool {
    self.deployment_policy_ref.is_none()
  }
}

impl PackageSpec {
  /// Stable digest of this package's configMap, used by the planner to
  /// detect content changes without storing the map itself on the node
  /// (spec.md §4.3 rule 4). Keys are iterated in sorted order since
  /// `config_map` is a `BTreeMap`.
  pub fn config_hash(&self) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for (key, entry) in &self.config_map {
      hasher.update(key.as_bytes());
      hasher.update(b"=");
      hasher.update(entry.value.as_bytes());
      hasher.update(b";");
    }
    hex::encode(hasher.finalize())
  }

  /// Identifies one `(declaration-generation, package-version,
  /// config-hash)` triple (spec.md §4.3 rule 5). Stored on the node
  /// record so the planner can tell "already ran this exact interrupt"
  /// apart from "reconcile churn, nothing changed" without re-running
  /// the interrupt on every pass.
  ///
  /// Only folds in the config hash when at least one configMap entry is
  /// `config_interrupt`-marked, so a plain (non-interrupt-marked) config
  /// edit does not spuriously force a re-interrupt.
  pub fn interrupt_resource_id(&self, generation: u64) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(generation.to_le_bytes());
    hasher.update(self.version.to_string().as_bytes());
    if self.has_interrupt_marked_config() {
      hasher.update(self.config_hash().as_bytes());
    }
    hex::encode(hasher.finalize())
  }

  /// `true` if any configMap entry is marked `config_interrupt`. The
  /// node only ever stores one aggregate `config_hash`, not a per-key
  /// hash, so the planner cannot tell which specific key changed — any
  /// entry so marked conservatively escalates a config change to also
  /// require an interrupt.
  pub fn has_interrupt_marked_config(&self) -> bool {
    self.config_map.values().any(|entry| entry.config_interrupt)
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionBudget {
  Count(u32),
  Percent(u8),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSpec {
  pub version: Version,
  pub image: String,
  /// Key -> config entry. A changed entry triggers a `config` stage
  /// rerun; a changed entry marked `config_interrupt` additionally
  /// enqueues an interrupt need (spec.md §4.3 rule 4).
  #[serde(default)]
  pub config_map: BTreeMap<String, ConfigEntry>,
  #[serde(default)]
  pub env: Vec<EnvVar>,
  #[serde(default)]
  pub interrupt: Option<InterruptSpec>,
  /// Dependency name -> required version. Must resolve to a package in
  /// the same declaration or one already recorded complete on the node.
  #[serde(default)]
  pub depends_on: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
  pub value: String,
  /// If true, a change to this key also requires an interrupt, not just
  /// the `config` stage.
  #[serde(default)]
  pub config_interrupt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
  pub name: String,
  pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptSpec {
  #[serde(rename = "type")]
  pub interrupt_type: InterruptType,
  #[serde(default)]
  pub services: Vec<String>,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InterruptType {
  Service,
  /// Dominates `Service` when merging interrupts across packages on one
  /// node (spec.md §4.5).
  Reboot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toleration {
  pub key: String,
  #[serde(default)]
  pub operator: TolerationOperator,
  #[serde(default)]
  pub value: Option<String>,
  #[serde(default)]
  pub effect: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum TolerationOperator {
  #[default]
  Equal,
  Exists,
}

/// An optional rollout policy referenced by `deployment_policy_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPolicy {
  pub name: String,
  pub compartments: Vec<Compartment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartment {
  pub selector: LabelSelector,
  pub strategy: BatchStrategy,
  /// Max nodes in-progress concurrently within this compartment.
  pub budget: u32,
  #[serde(default = "default_true")]
  pub reset_batch_state_on_completion: bool,
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchStrategy {
  Fixed { n: u32 },
  Linear { start: u32, delta: u32, max: u32 },
  Exponential { start: u32, max: u32 },
}

/// The synthetic compartment name nodes fall into when no configured
/// compartment's selector matches them.
pub const DEFAULT_COMPARTMENT: &str = "__default__";
