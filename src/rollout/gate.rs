//! Admission gates (spec.md §4.6 "Gates"): `pause` suspends new work
//! without touching `disable`, and vice versa (invariant 4 in §8).

use skyhook_client::{Declaration, NodeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
  /// No worker objects may be created; already-reported status
  /// `disabled` (invariant 3 in §8).
  Disabled,
  /// In-progress nodes finish their current stage, then report `paused`;
  /// no *new* stage is started.
  Paused,
  Open,
}

pub fn evaluate(declaration: &Declaration) -> Gate {
  if declaration.disable {
    Gate::Disabled
  } else if declaration.pause {
    Gate::Paused
  } else {
    Gate::Open
  }
}

impl Gate {
  /// Whether the reconciler may dispatch a brand new worker right now.
  /// A `Paused` gate still permits the reconciler to *observe* an
  /// already-dispatched worker to completion — only fresh dispatch is
  /// blocked.
  pub fn allows_new_dispatch(self) -> bool {
    matches!(self, Gate::Open)
  }

  pub fn status(self) -> Option<NodeStatus> {
    match self {
      Gate::Disabled => Some(NodeStatus::Disabled),
      Gate::Paused => Some(NodeStatus::Paused),
      Gate::Open => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use indexmap::IndexMap;
  use skyhook_client::LabelSelector;

  fn decl(pause: bool, disable: bool) -> Declaration {
    Declaration {
      name: "demo".into(),
      generation: 1,
      priority: 0,
      node_selector: LabelSelector::everything(),
      packages: IndexMap::new(),
      additional_tolerations: Vec::new(),
      pod_non_interrupt_labels: LabelSelector::everything(),
      interruption_budget: None,
      deployment_policy_ref: None,
      runtime_required: false,
      pause,
      disable,
    }
  }

  #[test]
  fn disable_blocks_dispatch_regardless_of_pause() {
    assert!(!evaluate(&decl(false, true)).allows_new_dispatch());
    assert!(!evaluate(&decl(true, true)).allows_new_dispatch());
  }

  #[test]
  fn pause_alone_blocks_new_dispatch_but_is_distinct_status() {
    let gate = evaluate(&decl(true, false));
    assert!(!gate.allows_new_dispatch());
    assert_eq!(gate.status(), Some(NodeStatus::Paused));
  }

  #[test]
  fn removing_pause_does_not_affect_disable_and_vice_versa() {
    // Each field is read independently off the declaration; clearing one
    // never mutates the other (invariant 4, spec.md §8).
    let mut declaration = decl(true, true);
    declaration.pause = false;
    assert!(declaration.disable, "disable must be untouched");
    declaration.disable = false;
    declaration.pause = true;
    assert!(!declaration.disable);
  }

  #[test]
  fn open_gate_allows_dispatch() {
    assert!(evaluate(&decl(false, false)).allows_new_dispatch());
  }
}
