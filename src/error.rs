//! Error taxonomy (spec.md §7). Every fallible path in the engine reports
//! into one of these five buckets so the reconciler can apply the right
//! policy without re-deriving intent from the error text.

use skyhook_client::{GraphError, ValidationError};
use thiserror::Error;

use crate::{dispatcher::DispatchError, store::StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
  /// CAS conflict, API throttling, worker not yet terminal. Requeue with
  /// backoff; no state mutation.
  #[error("transient: {0}")]
  Transient(String),

  /// Unresolved dependency, bad semver, webhook-equivalent denial.
  /// Surface in declaration status; node state untouched.
  #[error("configuration: {0}")]
  Configuration(String),

  /// Worker exited with a non-success code. `state=erroring`,
  /// `restarts++`, recreate after backoff; report and await human action
  /// past the retry ceiling.
  #[error("execution failed on node '{node}' package '{package}': {reason}")]
  Execution {
    node: String,
    package: String,
    reason: String,
  },

  /// Node carries a taint the declaration does not tolerate. Node status
  /// `blocked`; no work attempted.
  #[error("node '{node}' has an intolerable taint '{taint}'")]
  Tolerability { node: String, taint: String },

  /// Node deletion mid-reconcile. Best-effort scrub; ignore errors.
  #[error("lifecycle: {0}")]
  Lifecycle(String),
}

/// The policy response dictated by spec.md §7 for a given error bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
  RequeueOnly,
  SurfaceStatusOnly,
  MutateStateAndRequeue,
  ScrubAndIgnore,
}

impl ReconcileError {
  pub fn policy(&self) -> ErrorPolicy {
    match self {
      ReconcileError::Transient(_) => ErrorPolicy::RequeueOnly,
      ReconcileError::Configuration(_) => ErrorPolicy::SurfaceStatusOnly,
      ReconcileError::Execution { .. } => {
        ErrorPolicy::MutateStateAndRequeue
      }
      ReconcileError::Tolerability { .. } => {
        ErrorPolicy::SurfaceStatusOnly
      }
      ReconcileError::Lifecycle(_) => ErrorPolicy::ScrubAndIgnore,
    }
  }
}

impl From<GraphError> for ReconcileError {
  fn from(e: GraphError) -> Self {
    ReconcileError::Configuration(e.to_string())
  }
}

impl From<ValidationError> for ReconcileError {
  fn from(e: ValidationError) -> Self {
    ReconcileError::Configuration(e.to_string())
  }
}

impl From<StoreError> for ReconcileError {
  fn from(e: StoreError) -> Self {
    match e {
      StoreError::Conflict => {
        ReconcileError::Transient("node record CAS conflict".into())
      }
      StoreError::Backend(msg) => ReconcileError::Transient(msg),
    }
  }
}

impl From<DispatchError> for ReconcileError {
  fn from(e: DispatchError) -> Self {
    match e {
      DispatchError::NotTerminal => {
        ReconcileError::Transient("worker not yet terminal".into())
      }
      DispatchError::Backend(msg) => ReconcileError::Transient(msg),
      DispatchError::Failed { node, package, reason } => {
        ReconcileError::Execution { node, package, reason }
      }
    }
  }
}
