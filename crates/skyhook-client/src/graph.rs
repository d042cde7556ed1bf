//! Topological ordering of the packages within one declaration by
//! `dependsOn` (spec.md §4.1 / C1).
//!
//! Used both by admission-time validation (the webhook-equivalent
//! `declaration::validate`, out of scope for this crate but sharing this
//! type) and defensively by the per-node planner on every reconcile pass,
//! per spec.md §9's cyclic-dependency-risk note.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use thiserror::Error;

use crate::declaration::PackageSpec;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("dependency cycle detected among packages: {0:?}")]
  Cycle(Vec<String>),
  #[error(
    "package '{package}' depends on unresolved '{dep_name}@{dep_version}'"
  )]
  UnresolvedDependency {
    package: String,
    dep_name: String,
    dep_version: String,
  },
}

/// A topological order over one declaration's packages, ties broken by
/// package name ascending for determinism.
#[derive(Debug, Clone)]
pub struct PackageGraph {
  order: Vec<String>,
}

impl PackageGraph {
  /// `previously_installed` is the set of `(name, version)` pairs already
  /// recorded complete on the node being planned (or, at admission time,
  /// simply empty) — a `dependsOn` entry may resolve against either the
  /// current declaration or this set.
  pub fn build(
    packages: &IndexMap<String, PackageSpec>,
    previously_installed: &BTreeSet<(String, String)>,
  ) -> Result<Self, GraphError> {
    for (name, spec) in packages {
      for (dep_name, dep_version) in &spec.depends_on {
        let resolved_in_declaration = packages
          .get(dep_name)
          .is_some_and(|dep| &dep.version.to_string() == dep_version);
        let resolved_installed = previously_installed
          .contains(&(dep_name.clone(), dep_version.clone()));
        if !resolved_in_declaration && !resolved_installed {
          return Err(GraphError::UnresolvedDependency {
            package: name.clone(),
            dep_name: dep_name.clone(),
            dep_version: dep_version.clone(),
          });
        }
      }
    }

    let mut indegree: BTreeMap<&str, usize> =
      packages.keys().map(|n| (n.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> =
      packages.keys().map(|n| (n.as_str(), Vec::new())).collect();

    for (name, spec) in packages {
      for dep_name in spec.depends_on.keys() {
        // Only edges within this declaration constrain ordering; a
        // dependency already satisfied by prior installation imposes no
        // sequencing requirement on this pass.
        if let Some(deps) = packages.get(dep_name.as_str())
          && deps.version.to_string() == spec.depends_on[dep_name]
        {
          *indegree.get_mut(name.as_str()).unwrap() += 1;
          dependents.get_mut(dep_name.as_str()).unwrap().push(name);
        }
      }
    }

    let mut ready: BTreeSet<&str> = indegree
      .iter()
      .filter(|(_, &degree)| degree == 0)
      .map(|(name, _)| *name)
      .collect();
    let mut order: Vec<String> = Vec::with_capacity(packages.len());

    while let Some(name) = ready.iter().next().copied() {
      ready.remove(name);
      order.push(name.to_string());
      for dependent in &dependents[name] {
        let degree = indegree.get_mut(dependent).unwrap();
        *degree -= 1;
        if *degree == 0 {
          ready.insert(dependent);
        }
      }
    }

    if order.len() != packages.len() {
      let ordered: BTreeSet<&str> =
        order.iter().map(String::as_str).collect();
      let remaining = packages
        .keys()
        .filter(|name| !ordered.contains(name.as_str()))
        .cloned()
        .collect();
      return Err(GraphError::Cycle(remaining));
    }

    Ok(Self { order })
  }

  /// Forward order: used for every stage except `uninstall`.
  pub fn order(&self) -> &[String] {
    &self.order
  }

  /// Reverse order: used for `uninstall` and for `post-interrupt`.
  pub fn reverse_order(&self) -> impl Iterator<Item = &String> {
    self.order.iter().rev()
  }
}
