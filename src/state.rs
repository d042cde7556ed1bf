//! Process-wide runtime registries: the in-memory view of cluster objects
//! the reconciler loop watches (declarations, deployment policies, node
//! inventory) and the rollout controller's per-compartment `BatchState`.
//!
//! Mirrors the teacher's `state.rs` accessor pattern (`db_client()`,
//! `periphery_connections()` style globals backed by `cache::CloneCache`)
//! rather than passing a context struct through every call.

use std::sync::OnceLock;

use cache::CloneCache;
use skyhook_client::{BatchState, Declaration, DeploymentPolicy, Labels};

/// Declarations currently known to the reconciler, keyed by name. Populated
/// by the declaration watch (C7); never mutated by the reconcile body
/// itself.
pub fn declarations() -> &'static CloneCache<String, Declaration> {
  static DECLARATIONS: OnceLock<CloneCache<String, Declaration>> =
    OnceLock::new();
  DECLARATIONS.get_or_init(CloneCache::default)
}

/// Deployment policies referenced by `deploymentPolicyRef`, keyed by name.
pub fn deployment_policies()
-> &'static CloneCache<String, DeploymentPolicy> {
  static POLICIES: OnceLock<CloneCache<String, DeploymentPolicy>> =
    OnceLock::new();
  POLICIES.get_or_init(CloneCache::default)
}

/// Live node labels, keyed by node name. Populated by the node watch.
pub fn node_inventory() -> &'static CloneCache<String, Labels> {
  static NODES: OnceLock<CloneCache<String, Labels>> = OnceLock::new();
  NODES.get_or_init(CloneCache::default)
}

/// `BatchState` per `(declaration, compartment)`, keyed by
/// `"<declaration>/<compartment>"` (C6, spec.md §3/§4.6).
pub fn batch_states() -> &'static CloneCache<String, BatchState> {
  static BATCH_STATES: OnceLock<CloneCache<String, BatchState>> =
    OnceLock::new();
  BATCH_STATES.get_or_init(CloneCache::default)
}

pub fn batch_state_key(declaration: &str, compartment: &str) -> String {
  format!("{declaration}/{compartment}")
}
