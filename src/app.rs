//! The application: wiring and lifecycle.
//!
//! There is no main loop. [`start`] builds the boundary handles, spawns the
//! jobs, and parks on the shutdown signal; teardown then happens source
//! first (indexers), so the pipeline drains naturally: the discovery
//! channel closes, the pipe job ends, outstanding fetchers run into their
//! deadlines, and the drain channel closes behind them.
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use magpie_configuration::Configuration;
use tracing::info;

use crate::bootstrap::jobs::{dht_crawler, leech_pipe, persister};
use crate::core::{statistics, InMemoryMetadataStore, InMemorySeenSet, LogNotifier, MetadataStore, Notifier, SeenSet};
use crate::metadata::sink::Sink;

/// Runs the crawler until an interrupt or terminate signal arrives.
pub async fn start(configuration: &Configuration) {
    let (stats_event_sender, stats_repository) = statistics::Keeper::new_active_instance();

    // The boundary handles. Real deployments put a database and a chat
    // webhook behind these; the crawler core does not care.
    let seen: Arc<dyn SeenSet> = Arc::new(InMemorySeenSet::new());
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

    let mut manager = dht_crawler::start_job(&configuration.crawler, Some(stats_event_sender.clone())).await;
    let (sink, drain) = Sink::new(&configuration.leech, Some(stats_event_sender));

    let pipe_job = leech_pipe::start_job(manager.output(), sink.clone(), seen.clone());
    let persister_job = persister::start_job(drain, store, seen, notifier);

    global_shutdown_signal().await;
    info!("shutting down");

    manager.terminate().await;
    sink.terminate();

    pipe_job.abort();
    drop(pipe_job.await);
    persister_job.abort();
    drop(persister_job.await);

    let stats = stats_repository.get_stats().await;
    info!(
        packets_sent = stats.packets_sent,
        discoveries = stats.discoveries_emitted,
        fetched = stats.metadata_fetched,
        "goodbye"
    );
}

/// Resolves on `ctrl_c` or the terminate signal (unix only).
async fn global_shutdown_signal() {
    let interrupt = global_interrupt_signal();
    let terminate = global_terminate_signal();

    tokio::select! {
        () = interrupt => {},
        () = terminate => {},
    }
}

/// Creates a future awaiting the interrupt, i.e. `ctrl_c`, signal.
///
/// # Panics
///
/// Panics if unable to connect to the global signal handle.
fn global_interrupt_signal<'a>() -> BoxFuture<'a, ()> {
    async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    }
    .boxed()
}

/// Creates a future awaiting the terminate signal (unix only).
///
/// # Panics
///
/// Panics if unable to connect to the global signal handle.
fn global_terminate_signal<'a>() -> BoxFuture<'a, ()> {
    #[cfg(unix)]
    let terminate: BoxFuture<'a, ()> = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    }
    .boxed();

    #[cfg(not(unix))]
    let terminate: BoxFuture<'a, ()> = std::future::pending::<()>().boxed();

    terminate
}
