//! Startup configuration (A1, SPEC_FULL.md §2): env + `.env` + optional
//! TOML file, following the teacher's `core_config()` `OnceLock` accessor
//! pattern rather than threading a config struct through every call site.

use std::{path::PathBuf, sync::OnceLock};

use serde::{Deserialize, Serialize};
use skyhook_client::config::LogConfig;

/// Process-wide configuration, read once at startup and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Optional path to a TOML file overlaying env-derived defaults. Set via
  /// `SKYHOOK_CONFIG_PATH`; unset means env + `.env` only.
  pub config_path: Option<PathBuf>,
  /// How many reconcile requests may run concurrently across all
  /// declarations (spec.md §5: "reconciles for different declarations run
  /// in parallel").
  pub reconcile_concurrency: usize,
  /// Ceiling for the per-node CAS-retry / worker-recreate backoff
  /// (spec.md §5, §7 Transient/Execution policy).
  pub max_backoff_secs: u64,
  /// Deadline for a dispatched worker to reach a terminal state before the
  /// reconciler treats it as stuck and requeues (spec.md §5 "per-stage
  /// deadline").
  pub worker_observation_timeout_secs: u64,
  /// Deadline for wait-for-pod during an interrupt (spec.md §4.5/§5).
  pub wait_for_pod_timeout_secs: u64,
  /// Execution-error retries before a package is left `erroring` pending
  /// human action (spec.md §7 "after a ceiling").
  pub max_worker_restarts: u32,
  /// Period between periodic resync passes (spec.md §4.7 trigger
  /// "periodic resync"): re-runs C6 admission over every known
  /// declaration and enqueues whatever it admits, independent of
  /// whatever watch-driven triggers exist.
  pub resync_interval_secs: u64,
  pub logging: LogConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      config_path: None,
      reconcile_concurrency: 8,
      max_backoff_secs: 300,
      worker_observation_timeout_secs: 600,
      wait_for_pod_timeout_secs: 120,
      max_worker_restarts: 5,
      resync_interval_secs: 60,
      logging: LogConfig::default(),
    }
  }
}

pub fn engine_config() -> &'static EngineConfig {
  static ENGINE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();
  ENGINE_CONFIG.get_or_init(load)
}

fn load() -> EngineConfig {
  dotenvy::dotenv().ok();

  // `SKYHOOK_<FIELD>` env vars map directly onto `EngineConfig` fields;
  // a TOML file (named by `SKYHOOK_CONFIG_PATH`) fully overrides fields
  // awkward to express as flat env vars (the nested `logging` table).
  let mut config: EngineConfig =
    envy::prefixed("SKYHOOK_").from_env().unwrap_or_default();

  if let Some(path) = config.config_path.clone() {
    let contents = std::fs::read_to_string(&path)
      .unwrap_or_else(|e| panic!("failed to read config file {path:?}: {e:#}"));
    config = toml::from_str(&contents)
      .unwrap_or_else(|e| panic!("failed to parse config file {path:?}: {e:#}"));
    config.config_path = Some(path);
  }

  config
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_sane() {
    let config = EngineConfig::default();
    assert!(config.reconcile_concurrency > 0);
    assert!(config.max_backoff_secs >= config.worker_observation_timeout_secs.min(config.max_backoff_secs));
  }
}
