//! Dynamic label-selector evaluation (spec.md §9: "avoid reflection").
//!
//! Used for declaration `nodeSelector`, `podNonInterruptLabels`, and
//! deployment-policy compartment `selector`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Requirement {
  Equals { key: String, value: String },
  NotEquals { key: String, value: String },
  In { key: String, values: Vec<String> },
  NotIn { key: String, values: Vec<String> },
  Exists { key: String },
  DoesNotExist { key: String },
}

impl Requirement {
  fn key(&self) -> &str {
    match self {
      Requirement::Equals { key, .. }
      | Requirement::NotEquals { key, .. }
      | Requirement::In { key, .. }
      | Requirement::NotIn { key, .. }
      | Requirement::Exists { key }
      | Requirement::DoesNotExist { key } => key,
    }
  }

  fn matches(&self, labels: &Labels) -> bool {
    match self {
      Requirement::Equals { key, value } => {
        labels.get(key).is_some_and(|v| v == value)
      }
      Requirement::NotEquals { key, value } => {
        labels.get(key).is_none_or(|v| v != value)
      }
      Requirement::In { key, values } => {
        labels.get(key).is_some_and(|v| values.contains(v))
      }
      Requirement::NotIn { key, values } => {
        labels.get(key).is_none_or(|v| !values.contains(v))
      }
      Requirement::Exists { key } => labels.contains_key(key),
      Requirement::DoesNotExist { key } => !labels.contains_key(key),
    }
  }
}

/// A conjunction of requirements. An empty selector matches everything
/// (zero specificity).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector(pub Vec<Requirement>);

impl LabelSelector {
  pub fn everything() -> Self {
    Self(Vec::new())
  }

  pub fn from_equals(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
    Self(
      pairs
        .into_iter()
        .map(|(key, value)| Requirement::Equals { key, value })
        .collect(),
    )
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(|r| r.key())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
  /// Number of requirements in the selector — its specificity. Only
  /// meaningful for comparison when `matches` is true.
  pub matched_label_count: usize,
  pub matches: bool,
}

pub fn evaluate(selector: &LabelSelector, labels: &Labels) -> MatchResult {
  let matches = selector.0.iter().all(|req| req.matches(labels));
  MatchResult {
    matched_label_count: selector.0.len(),
    matches,
  }
}
