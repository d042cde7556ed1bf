//! The event-driven work queue (spec.md §9 "Event-driven loop"): a
//! dedup'd set of reconcile keys with exponential backoff + jitter on
//! requeue. Mirrors the teacher's per-key `CloneCache<String,
//! Arc<Mutex<...>>>` serialization idiom (`monitor::update_cache_for_*`)
//! but generalized into an explicit queue type, since spec.md requires
//! per-object dedup rather than a fixed-interval sweep (SPEC_FULL.md
//! §4.7).

use std::{
  collections::HashMap,
  time::Duration,
};

use rand::Rng;
use tokio::sync::{Mutex, Notify};

/// One `(declaration, node)` pair due for reconciliation. Cloned cheaply;
/// used as the map key so two enqueues of the same pair collapse into one
/// pending entry (spec.md §7: "every external change enqueues at most one
/// key per object").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileKey {
  pub declaration: String,
  pub node: String,
}

impl ReconcileKey {
  pub fn new(declaration: impl Into<String>, node: impl Into<String>) -> Self {
    Self { declaration: declaration.into(), node: node.into() }
  }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
  attempts: u32,
  ready: bool,
}

pub struct WorkQueue {
  entries: Mutex<HashMap<ReconcileKey, Entry>>,
  notify: Notify,
  max_backoff: Duration,
}

impl WorkQueue {
  pub fn new(max_backoff: Duration) -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      notify: Notify::new(),
      max_backoff,
    }
  }

  /// Enqueue `key` for immediate processing, deduplicating against any
  /// already-pending entry for the same key.
  pub async fn enqueue(&self, key: ReconcileKey) {
    let mut entries = self.entries.lock().await;
    entries.entry(key).or_insert(Entry { attempts: 0, ready: true }).ready = true;
    drop(entries);
    self.notify.notify_one();
  }

  /// Requeue `key` after an exponential backoff with jitter, capped at
  /// `max_backoff` (spec.md §5 "exponential, capped"). Used after a
  /// Transient error or a not-yet-terminal worker observation.
  pub async fn requeue_backoff(&self, key: ReconcileKey) -> Duration {
    let mut entries = self.entries.lock().await;
    let entry = entries.entry(key.clone()).or_insert(Entry {
      attempts: 0,
      ready: false,
    });
    entry.attempts = entry.attempts.saturating_add(1);
    entry.ready = false;
    let delay = backoff_with_jitter(entry.attempts, self.max_backoff);
    drop(entries);

    let queue_notify = &self.notify;
    tokio::time::sleep(delay).await;
    let mut entries = self.entries.lock().await;
    if let Some(entry) = entries.get_mut(&key) {
      entry.ready = true;
    }
    drop(entries);
    queue_notify.notify_one();
    delay
  }

  /// Mark `key` fully processed, clearing its backoff state.
  pub async fn complete(&self, key: &ReconcileKey) {
    self.entries.lock().await.remove(key);
  }

  /// Pop one ready key, if any. Callers loop on this, `await`ing
  /// `notified()` when nothing is ready.
  pub async fn pop_ready(&self) -> Option<ReconcileKey> {
    let mut entries = self.entries.lock().await;
    let ready_key = entries
      .iter()
      .find(|(_, e)| e.ready)
      .map(|(k, _)| k.clone());
    if let Some(key) = &ready_key {
      entries.get_mut(key).unwrap().ready = false;
    }
    ready_key
  }

  pub async fn notified(&self) {
    self.notify.notified().await;
  }

  pub async fn len(&self) -> usize {
    self.entries.lock().await.len()
  }
}

fn backoff_with_jitter(attempts: u32, max: Duration) -> Duration {
  let base_ms = 500u64.saturating_mul(1u64 << attempts.min(10));
  let capped_ms = base_ms.min(max.as_millis() as u64).max(1);
  let jitter_ms = rand::rng().random_range(0..=capped_ms / 4 + 1);
  Duration::from_millis(capped_ms.saturating_sub(jitter_ms / 2))
}
