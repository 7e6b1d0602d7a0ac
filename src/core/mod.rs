//! The boundaries of the crawler core.
//!
//! Storage and notification are external collaborators. The core only ever
//! talks to them through three narrow contracts:
//!
//! - [`SeenSet`]: "have we seen this infohash?", consulted before a fetch is
//!   enqueued so known torrents are not leeched again.
//! - [`MetadataStore`]: the sink for successfully fetched metadata. The
//!   return value says whether the record was accepted (a store may reject
//!   records, e.g. a blacklist).
//! - [`Notifier`]: a single fire-and-forget notification call. Whatever
//!   happens inside the notifier never propagates back.
//!
//! The handles are explicit values threaded through the wiring at startup;
//! there are no process-wide registries.
use std::collections::HashSet;
use std::sync::RwLock;

use magpie_primitives::info_hash::InfoHash;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::metadata::Metadata;

pub mod statistics;

/// Membership test over the infohashes already known to storage.
#[cfg_attr(test, automock)]
pub trait SeenSet: Send + Sync {
    fn contains(&self, info_hash: &InfoHash) -> bool;

    fn add(&self, info_hash: InfoHash);
}

/// Sink for fetched metadata. `insert` returns whether the record was
/// accepted.
#[cfg_attr(test, automock)]
pub trait MetadataStore: Send + Sync {
    fn insert(&self, metadata: &Metadata) -> bool;
}

/// Outbound notification fan-out, reduced to one call.
#[cfg_attr(test, automock)]
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// A [`SeenSet`] over a plain in-process hash set.
#[derive(Default)]
pub struct InMemorySeenSet {
    inner: RwLock<HashSet<InfoHash>>,
}

impl InMemorySeenSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeenSet for InMemorySeenSet {
    fn contains(&self, info_hash: &InfoHash) -> bool {
        self.inner.read().expect("the seen set lock should not be poisoned").contains(info_hash)
    }

    fn add(&self, info_hash: InfoHash) {
        self.inner
            .write()
            .expect("the seen set lock should not be poisoned")
            .insert(info_hash);
    }
}

/// A [`MetadataStore`] that keeps the records in memory. Accepts everything.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<Vec<Metadata>>,
}

impl InMemoryMetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records accepted so far.
    ///
    /// # Panics
    ///
    /// Panics if the store lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().expect("the store lock should not be poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn insert(&self, metadata: &Metadata) -> bool {
        self.records
            .write()
            .expect("the store lock should not be poisoned")
            .push(metadata.clone());
        true
    }
}

/// A [`Notifier`] that writes the message to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        info!(target: "notifier", "{message}");
    }
}

#[cfg(test)]
mod tests {
    use magpie_primitives::info_hash::InfoHash;

    use super::{InMemorySeenSet, SeenSet};

    #[test]
    fn the_in_memory_seen_set_should_remember_added_infohashes() {
        let seen = InMemorySeenSet::new();
        let info_hash = InfoHash::from([1u8; 20]);

        assert!(!seen.contains(&info_hash));

        seen.add(info_hash);

        assert!(seen.contains(&info_hash));
    }
}
