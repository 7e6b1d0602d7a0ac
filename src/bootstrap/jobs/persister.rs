//! The drain consumer: fetched metadata into storage, plus the heads-up.
//!
//! For each record coming out of the sink, the job offers it to the
//! [`MetadataStore`]; when the store accepts it, the infohash joins the
//! seen-set (so the crawler stops chasing it) and the notifier gets one
//! message. A rejected record (blacklists live behind the store boundary)
//! is dropped without marking the infohash as seen.
//!
//! The job ends when the drain channel closes.
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::core::{MetadataStore, Notifier, SeenSet};
use crate::metadata::Metadata;

#[must_use]
pub fn start_job(
    mut drain: mpsc::Receiver<Metadata>,
    store: Arc<dyn MetadataStore>,
    seen: Arc<dyn SeenSet>,
    notifier: Arc<dyn Notifier>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(metadata) = drain.recv().await {
            if !store.insert(&metadata) {
                debug!(info_hash = %metadata.info_hash, "the store rejected a metadata record");
                continue;
            }

            seen.add(metadata.info_hash);

            info!(info_hash = %metadata.info_hash, name = %metadata.name, "torrent discovered");
            notifier.notify(&format!(
                "Discovered \"{}\" ({} files, {} bytes)",
                metadata.name,
                metadata.files.len(),
                metadata.total_size
            ));
        }
    })
}
