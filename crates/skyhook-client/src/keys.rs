//! Centralized annotation/label/taint key constants (spec.md §6).
//!
//! Every component references these helpers instead of restating the
//! literal strings, so the wire format lives in exactly one place.

/// The API group all Skyhook keys are namespaced under.
pub const DOMAIN: &str = "skyhook.nvidia.com";

/// Taint Skyhook places to cordon a node it is about to interrupt.
/// Distinct from any user- or system-owned `unschedulable` taint so the
/// interrupt coordinator never removes a cordon it did not place itself.
pub const UNSCHEDULABLE_TAINT_KEY: &str =
  "skyhook.nvidia.com/unschedulable";

/// Taint a node must carry on entry for `runtimeRequired` declarations;
/// removed only once every such declaration reports `complete` on that node.
pub const RUNTIME_REQUIRED_TAINT_KEY: &str = "skyhook.nvidia.com";
pub const RUNTIME_REQUIRED_TAINT_VALUE: &str = "runtime-required";
pub const RUNTIME_REQUIRED_TAINT_EFFECT: &str = "NoSchedule";

/// Annotation key holding the JSON-encoded `NodeRecord.packages` map for
/// one declaration.
pub fn node_state_key(declaration: &str) -> String {
  format!("{DOMAIN}/nodeState_{declaration}")
}

/// Annotation/label key mirroring `NodeRecord.status` for one declaration.
pub fn status_key(declaration: &str) -> String {
  format!("{DOMAIN}/status_{declaration}")
}

/// Annotation key holding the declaration generation tag last applied.
pub fn version_key(declaration: &str) -> String {
  format!("{DOMAIN}/version_{declaration}")
}

/// Annotation key present on a node while Skyhook holds its cordon for a
/// given declaration.
pub fn cordon_key(declaration: &str) -> String {
  format!("{DOMAIN}/cordon_{declaration}")
}

/// Annotation key carrying the worker fingerprint JSON
/// (`{name,version,skyhook,stage,image}`) on a dispatched worker object.
pub const WORKER_FINGERPRINT_ANNOTATION: &str =
  "skyhook.nvidia.com/package";

/// Label key identifying the declaration a worker object belongs to.
pub const DECLARATION_LABEL: &str = "skyhook.nvidia.com/declaration";

/// Label key identifying `<package>-<version>` on a worker object.
pub const PACKAGE_LABEL: &str = "skyhook.nvidia.com/package";

/// Env var presenting `<package>-<version>` to the agent.
pub const ENV_OVERLAY_FRAMEWORK_VERSION: &str =
  "OVERLAY_FRAMEWORK_VERSION";

/// Env var presenting the resource id to the agent so it can skip an
/// already-completed interrupt for the same resource id.
pub const ENV_SKYHOOK_RESOURCE_ID: &str = "SKYHOOK_RESOURCE_ID";

/// Storage key for a package entry: `name|version`.
pub fn package_key(name: &str, version: &str) -> String {
  format!("{name}|{version}")
}

/// Split a storage key of shape `name|version` back into its parts.
/// Returns `None` for legacy keys without the `|version` segment —
/// callers route those through the migration path (spec.md §4.8).
pub fn split_package_key(key: &str) -> Option<(&str, &str)> {
  key.split_once('|')
}
