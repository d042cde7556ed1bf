//! Admission-time validation, shared between the (external) admission
//! webhook and the per-node planner's defensive re-check (spec.md §4.1,
//! §9). This crate implements only the contract the core itself relies
//! on; the webhook's HTTP transport is out of scope per spec.md §1.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::{declaration::Declaration, graph::GraphError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
  #[error("declaration name must not be empty")]
  EmptyName,
  #[error("declaration declares no packages")]
  NoPackages,
  #[error(
    "declaration sets both interruptionBudget and deploymentPolicyRef; pick one"
  )]
  AmbiguousRolloutAuthority,
  #[error(transparent)]
  Graph(#[from] GraphError),
}

/// Validate a declaration in isolation (no prior node state available —
/// `dependsOn` may only resolve against packages in this declaration).
pub fn validate_declaration(
  declaration: &Declaration,
) -> Result<(), ValidationError> {
  if declaration.name.trim().is_empty() {
    return Err(ValidationError::EmptyName);
  }
  if declaration.packages.is_empty() {
    return Err(ValidationError::NoPackages);
  }
  if declaration.interruption_budget.is_some()
    && declaration.deployment_policy_ref.is_some()
  {
    return Err(ValidationError::AmbiguousRolloutAuthority);
  }
  crate::graph::PackageGraph::build(
    &declaration.packages,
    &BTreeSet::new(),
  )?;
  Ok(())
}
