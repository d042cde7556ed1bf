//! Compartment assignment (C6, spec.md §4.6): partition nodes into
//! compartments by label selector, most-specific match wins, ties by
//! declaration order; unmatched nodes fall into the synthetic
//! `__default__` compartment.

use skyhook_client::{evaluate, Compartment, Labels, DEFAULT_COMPARTMENT};

/// The compartment a node falls into, identified by index into the
/// policy's `compartments` list — `None` means the synthetic default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment(pub Option<usize>);

impl Assignment {
  pub fn name(self, compartments: &[Compartment]) -> String {
    match self.0 {
      Some(i) => compartment_name(i, &compartments[i]),
      None => DEFAULT_COMPARTMENT.to_string(),
    }
  }
}

/// Stable per-compartment name used as the `BatchState` cache key's
/// second segment. Compartments have no declared name in the data model
/// (spec.md §3 describes them only by selector/strategy/budget), so the
/// index is the only stable handle across reconciles as long as the
/// declaration's compartment list itself is unchanged.
pub fn compartment_name(index: usize, _compartment: &Compartment) -> String {
  format!("compartment-{index}")
}

/// Evaluate every compartment's selector against `node_labels` and assign
/// to the one with the most matched requirements; ties keep the earliest
/// (declaration order). A node matching nothing falls to `__default__`
/// (spec.md invariant 8 in §8: exactly one compartment per node).
pub fn assign(
  compartments: &[Compartment],
  node_labels: &Labels,
) -> Assignment {
  let mut best: Option<(usize, usize)> = None; // (index, matched_count)
  for (index, compartment) in compartments.iter().enumerate() {
    let result = evaluate(&compartment.selector, node_labels);
    if !result.matches {
      continue;
    }
    match best {
      Some((_, best_count)) if result.matched_label_count <= best_count => {}
      _ => best = Some((index, result.matched_label_count)),
    }
  }
  Assignment(best.map(|(index, _)| index))
}
