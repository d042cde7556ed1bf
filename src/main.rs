//! `skyhook-operator`: loads configuration, starts logging and the
//! metrics registry, and drives the reconciler's event queue.

#[macro_use]
extern crate tracing;

mod cluster;

use std::time::Duration;

use clap::Parser;
use futures_util::stream::{FuturesUnordered, StreamExt};
use skyhook::{
  config::{self, EngineConfig},
  metrics,
  reconciler::{self, Reconciler, ReconcileKey, WorkQueue},
  state,
};

/// `SKYHOOK_CONFIG_PATH` does the same job as this flag; the flag wins
/// when both are set.
#[derive(Parser, Debug)]
#[command(name = "skyhook-operator", version, about = None, long_about = None)]
struct Args {
  #[arg(long)]
  config: Option<std::path::PathBuf>,
}

async fn app() -> anyhow::Result<()> {
  let args = Args::parse();
  if let Some(path) = args.config {
    // SAFETY-equivalent: single-threaded at this point in startup, before
    // any other code reads the env.
    unsafe { std::env::set_var("SKYHOOK_CONFIG_PATH", path) };
  }

  let config = config::engine_config();
  logger::init(&config.logging)?;

  info!("skyhook-operator v{} starting", env!("CARGO_PKG_VERSION"));
  metrics::build_up_gauge(&metrics::metrics().registry);

  let client = cluster::UnimplementedClusterClient::default();
  let reconciler = Reconciler::new(&client, &client, &client, config.max_worker_restarts);
  let queue = WorkQueue::new(Duration::from_secs(config.max_backoff_secs));

  run(&reconciler, &client, &client, &client, &queue, config).await
}

/// The event loop proper (spec.md §4.7): pop ready `(declaration, node)`
/// keys and drive up to `reconcile_concurrency` reconciles at once,
/// alongside a periodic resync that re-runs C6 admission
/// (`reconciler::resync`) over every known declaration and enqueues
/// whatever it admits. Watch-driven trigger sources (node/declaration/
/// worker updates) are an external collaborator (spec.md §1) that would
/// call `queue.enqueue(...)` directly; this loop's own admission pass is
/// the "periodic resync" trigger spec.md §4.7 lists alongside them.
async fn run(
  reconciler: &Reconciler<'_>,
  annotations: &dyn skyhook::store::NodeAnnotations,
  meta: &dyn skyhook::store::NodeMetaStore,
  node_ops: &dyn skyhook::interrupt::NodeOps,
  queue: &WorkQueue,
  config: &EngineConfig,
) -> anyhow::Result<()> {
  let mut in_flight = FuturesUnordered::new();
  let mut resync_tick = tokio::time::interval(Duration::from_secs(config.resync_interval_secs));
  resync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

  loop {
    while in_flight.len() < config.reconcile_concurrency {
      match queue.pop_ready().await {
        Some(key) => in_flight.push(reconcile_one(reconciler, queue, config, key)),
        None => break,
      }
    }

    if in_flight.is_empty() {
      tokio::select! {
        _ = queue.notified() => {}
        _ = resync_tick.tick() => {
          debug!("periodic resync: running C6 admission over known declarations");
          reconciler::resync(annotations, meta, node_ops, queue).await;
        }
      }
      continue;
    }

    tokio::select! {
      _ = in_flight.next() => {}
      _ = resync_tick.tick() => {
        debug!("periodic resync: running C6 admission over known declarations");
        reconciler::resync(annotations, meta, node_ops, queue).await;
      }
    }
  }
}

async fn reconcile_one(
  reconciler: &Reconciler<'_>,
  queue: &WorkQueue,
  config: &EngineConfig,
  key: ReconcileKey,
) {
  let Some(declaration) = state::declarations().get(&key.declaration).await else {
    // Declaration deleted out from under a still-queued key.
    queue.complete(&key).await;
    return;
  };

  match reconciler.reconcile_node(&key.node, &declaration).await {
    Ok(()) => queue.complete(&key).await,
    Err(err) => {
      let max_backoff = Duration::from_secs(config.max_backoff_secs);
      match reconciler::requeue_delay(&err, max_backoff) {
        Some(_) => {
          warn!(
            declaration = %key.declaration,
            node = %key.node,
            "reconcile requeued: {err:#}"
          );
          queue.requeue_backoff(key).await;
        }
        None => {
          error!(
            declaration = %key.declaration,
            node = %key.node,
            "reconcile surfaced to status, no requeue: {err:#}"
          );
          queue.complete(&key).await;
        }
      }
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let mut term_signal =
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

  tokio::select! {
    res = app() => res,
    _ = term_signal.recv() => {
      info!("received SIGTERM, shutting down");
      Ok(())
    }
  }
}
