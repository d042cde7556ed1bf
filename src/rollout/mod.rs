//! Rollout Controller (C6, spec.md §4.6): compartment assignment, budget
//! enforcement, batch progression, and the admission decision the
//! reconciler consults before planning work on a node.

pub mod compartment;
pub mod gate;
pub mod priority;
pub mod strategy;

use skyhook_client::{BatchState, Compartment};

/// One candidate node for admission into a compartment this pass.
#[derive(Debug, Clone)]
pub struct NodeCandidate {
  pub name: String,
  /// Already has a non-terminal worker in flight — counts against the
  /// budget regardless of whether a *new* admission slot is available,
  /// and is always allowed to keep progressing (spec.md §4.6: "A node is
  /// 'in progress' from the first non-complete worker creation through
  /// the last stage's completion").
  pub in_progress: bool,
}

/// Result of admitting a batch of candidates into one compartment this
/// pass: which nodes may start or continue work, and the `BatchState` to
/// persist.
#[derive(Debug, Clone)]
pub struct Admission {
  pub admitted: Vec<String>,
  pub batch_state: BatchState,
}

/// Resolve a compartment (by legacy budget or `DeploymentPolicy`) and
/// budget-admit candidates for one `(declaration, compartment)` pass.
///
/// `total_remaining` is the count of candidate nodes (across this whole
/// compartment, not just this pass) that are not yet fully reconciled —
/// used to detect compartment completion for the batch-state reset rule
/// (spec.md §4.6 "Reset").
pub fn admit(
  compartment: Option<&Compartment>,
  mut batch_state: BatchState,
  candidates: &[NodeCandidate],
  total_remaining: usize,
) -> Admission {
  let budget = compartment.map(|c| c.budget).unwrap_or(u32::MAX);
  let strategy_size = compartment
    .map(|c| strategy::batch_size(&c.strategy, batch_state.current_batch))
    .unwrap_or(u32::MAX);

  if batch_state.batch_size == 0 {
    batch_state.batch_size = strategy_size;
  }

  if total_remaining == 0 {
    let reset_on_completion = compartment
      .map(|c| c.reset_batch_state_on_completion)
      .unwrap_or(true);
    if reset_on_completion {
      batch_state.reset();
      batch_state.batch_size = match compartment {
        Some(c) => strategy::batch_size(&c.strategy, 1),
        None => u32::MAX,
      };
    }
    return Admission { admitted: Vec::new(), batch_state };
  }

  if batch_state.ready_to_advance() {
    batch_state.current_batch += 1;
    batch_state.batch_size = compartment
      .map(|c| strategy::batch_size(&c.strategy, batch_state.current_batch))
      .unwrap_or(u32::MAX);
    batch_state.in_progress_count = 0;
    batch_state.completed_this_batch = 0;
    batch_state.failed_this_batch = 0;
  }

  let in_progress = candidates.iter().filter(|c| c.in_progress).count() as u32;
  batch_state.in_progress_count = in_progress;

  let window = batch_state.batch_size.min(budget);
  let mut slots = window.saturating_sub(in_progress);

  let mut admitted: Vec<String> = candidates
    .iter()
    .filter(|c| c.in_progress)
    .map(|c| c.name.clone())
    .collect();

  for candidate in candidates.iter().filter(|c| !c.in_progress) {
    if slots == 0 {
      break;
    }
    admitted.push(candidate.name.clone());
    slots -= 1;
  }

  Admission { admitted, batch_state }
}

#[cfg(test)]
mod tests {
  use super::*;
  use skyhook_client::BatchStrategy;

  fn candidates(names: &[&str], in_progress: &[&str]) -> Vec<NodeCandidate> {
    names
      .iter()
      .map(|n| NodeCandidate {
        name: n.to_string(),
        in_progress: in_progress.contains(n),
      })
      .collect()
  }

  #[test]
  fn budget_caps_admission() {
    let compartment = Compartment {
      selector: Default::default(),
      strategy: BatchStrategy::Fixed { n: 100 },
      budget: 2,
      reset_batch_state_on_completion: true,
    };
    let candidates = candidates(&["a", "b", "c", "d"], &[]);
    let admission =
      admit(Some(&compartment), BatchState::default(), &candidates, 4);
    assert_eq!(admission.admitted.len(), 2);
  }

  #[test]
  fn in_progress_nodes_always_count_and_stay_admitted() {
    let compartment = Compartment {
      selector: Default::default(),
      strategy: BatchStrategy::Fixed { n: 1 },
      budget: 1,
      reset_batch_state_on_completion: true,
    };
    let candidates = candidates(&["a", "b"], &["a"]);
    let admission =
      admit(Some(&compartment), BatchState::default(), &candidates, 2);
    assert!(admission.admitted.contains(&"a".to_string()));
    // Budget of 1 already consumed by "a" in progress; "b" gets no slot.
    assert!(!admission.admitted.contains(&"b".to_string()));
  }

  #[test]
  fn exponential_rollout_batch_progression() {
    let compartment = Compartment {
      selector: Default::default(),
      strategy: BatchStrategy::Exponential { start: 1, max: 8 },
      budget: 8,
      reset_batch_state_on_completion: true,
    };
    let mut state = BatchState::default();

    let round1 = admit(Some(&compartment), state, &candidates(&[], &[]), 15);
    state = round1.batch_state;
    assert_eq!(state.batch_size, 1);

    // Batch 1 completes (one node admitted and finished).
    state.completed_this_batch = 1;
    state.in_progress_count = 0;
    let round2 = admit(Some(&compartment), state, &candidates(&[], &[]), 14);
    state = round2.batch_state;
    assert_eq!(state.current_batch, 2);
    assert_eq!(state.batch_size, 2);
  }

  #[test]
  fn compartment_completion_resets_unless_disabled() {
    let compartment = Compartment {
      selector: Default::default(),
      strategy: BatchStrategy::Fixed { n: 4 },
      budget: 4,
      reset_batch_state_on_completion: false,
    };
    let mut state = BatchState::default();
    state.current_batch = 3;
    state.batch_size = 4;
    let admission = admit(Some(&compartment), state, &[], 0);
    assert_eq!(admission.batch_state.current_batch, 3);
  }
}
