//! The pipe between the DHT side and the TCP side.
//!
//! It consumes the discovery channel, skips infohashes storage already
//! knows, and hands the rest to the leech sink. The job ends when the
//! discovery channel closes.
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::SeenSet;
use crate::mainline::Discovery;
use crate::metadata::sink::Sink;

#[must_use]
pub fn start_job(mut discoveries: mpsc::Receiver<Discovery>, sink: Arc<Sink>, seen: Arc<dyn SeenSet>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(discovery) = discoveries.recv().await {
            if seen.contains(&discovery.info_hash) {
                debug!(info_hash = %discovery.info_hash, "already known, skipping the fetch");
                continue;
            }

            sink.sink(discovery);
        }
    })
}
