//! DHT crawler job starter.
//!
//! It brings up one indexing service per configured bind address, wrapped
//! in a [`Manager`] that owns their tasks and the discovery channel.
use std::sync::Arc;

use tracing::info;

use crate::core::statistics;
use crate::mainline::manager::Manager;

/// Starts the DHT side of the crawler.
///
/// # Panics
///
/// It will panic if an indexer socket cannot be bound, including when a
/// non-IPv4 listen address is configured.
#[must_use]
pub async fn start_job(
    config: &magpie_configuration::Crawler,
    stats_event_sender: Option<Arc<dyn statistics::EventSender>>,
) -> Manager {
    let manager = Manager::start(config, stats_event_sender)
        .await
        .expect("it should be able to bind the indexer sockets");

    info!(indexers = config.indexer_addrs.len(), "DHT crawler started");

    manager
}
