use serde::{Deserialize, Serialize};

/// Per `(declaration, compartment)` rollout progress (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
  pub current_batch: u32,
  pub batch_size: u32,
  pub in_progress_count: u32,
  pub completed_this_batch: u32,
  pub failed_this_batch: u32,
}

impl Default for BatchState {
  fn default() -> Self {
    Self {
      current_batch: 1,
      batch_size: 0,
      in_progress_count: 0,
      completed_this_batch: 0,
      failed_this_batch: 0,
    }
  }
}

impl BatchState {
  /// Reset to batch 1 with zeroed counters, keeping the just-computed
  /// `batch_size` for the new batch (spec.md §4.6 "Reset").
  pub fn reset(&mut self) {
    self.current_batch = 1;
    self.in_progress_count = 0;
    self.completed_this_batch = 0;
    self.failed_this_batch = 0;
  }

  /// Advance iff `completedThisBatch >= batchSize` and no node is
  /// in-progress. Errors halt the compartment (spec.md §4.6).
  pub fn ready_to_advance(&self) -> bool {
    self.failed_this_batch == 0
      && self.completed_this_batch >= self.batch_size
      && self.in_progress_count == 0
  }
}
