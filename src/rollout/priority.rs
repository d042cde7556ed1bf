//! Per-node priority resolution (spec.md §4.6 "Priority"): across
//! declarations selecting the same node, the node works on the
//! lowest-priority declaration with any outstanding work; this is
//! resolved independently per node, never globally.

use skyhook_client::Declaration;

/// Order declarations by priority ascending, then name ascending — the
/// order in which a single node should attempt them.
pub fn ordered<'a>(
  declarations: impl IntoIterator<Item = &'a Declaration>,
) -> Vec<&'a Declaration> {
  let mut ordered: Vec<&Declaration> = declarations.into_iter().collect();
  ordered.sort_by(|a, b| {
    a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name))
  });
  ordered
}

/// Pick the first declaration (in priority order) for which `has_work`
/// returns true on this node. Declarations earlier in priority order that
/// have no outstanding work never block later ones; declarations after
/// the selected one are left `waiting` by the caller.
pub fn select_active<'a>(
  declarations: impl IntoIterator<Item = &'a Declaration>,
  mut has_work: impl FnMut(&Declaration) -> bool,
) -> Option<&'a Declaration> {
  ordered(declarations).into_iter().find(|d| has_work(d))
}

#[cfg(test)]
mod tests {
  use super::*;
  use indexmap::IndexMap;
  use skyhook_client::LabelSelector;

  fn decl(name: &str, priority: i32) -> Declaration {
    Declaration {
      name: name.into(),
      generation: 1,
      priority,
      node_selector: LabelSelector::everything(),
      packages: IndexMap::new(),
      additional_tolerations: Vec::new(),
      pod_non_interrupt_labels: LabelSelector::everything(),
      interruption_budget: None,
      deployment_policy_ref: None,
      runtime_required: false,
      pause: false,
      disable: false,
    }
  }

  #[test]
  fn orders_by_priority_then_name() {
    let zzz = decl("zzz", 1);
    let b = decl("b", 2);
    let c = decl("c", 2);
    let result = ordered([&zzz, &b, &c]);
    assert_eq!(
      result.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
      vec!["zzz", "b", "c"]
    );
  }

  #[test]
  fn select_active_skips_declarations_with_no_work() {
    let high = decl("high-priority", 1);
    let low = decl("low-priority", 2);
    let active = select_active([&high, &low], |d| d.name == "low-priority");
    assert_eq!(active.unwrap().name, "low-priority");
  }

  #[test]
  fn per_node_priority_is_independent_of_other_nodes() {
    // Node A still on priority 1 (blocked); node B already past it onto
    // priority 2. Each call only ever sees its own node's work function.
    let p1 = decl("zzz", 1);
    let p2a = decl("b", 2);
    let p2b = decl("c", 2);

    let node_a_active =
      select_active([&p1, &p2a, &p2b], |d| d.name == "zzz");
    assert_eq!(node_a_active.unwrap().priority, 1);

    let node_b_active =
      select_active([&p1, &p2a, &p2b], |d| d.name != "zzz");
    assert_eq!(node_b_active.unwrap().priority, 2);
  }
}
