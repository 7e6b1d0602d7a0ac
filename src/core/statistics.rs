//! Structs to collect and keep crawler metrics.
//!
//! The crawler collects metrics such as:
//!
//! - Number of KRPC packets sent, and dropped by the egress rate limiter
//! - Number of discoveries emitted, and dropped on a full channel
//! - Number of metadata fetches that succeeded or failed
//!
//! The data is collected with an `event-sender -> event listener` model: hot
//! paths push an [`Event`] through a channel and the listener updates the
//! counters in the shared [`Repo`], so that no hot path ever waits on the
//! metrics lock.
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock, RwLockReadGuard};
use tracing::debug;

const CHANNEL_BUFFER_SIZE: usize = 65_535;

/// A statistics event, sent from the crawler's hot paths.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// A KRPC packet left through the UDP socket.
    PacketSent,
    /// The egress token bucket was empty and a packet was dropped.
    PacketDropped,
    /// A discovery was handed to the sink side.
    DiscoveryEmitted,
    /// The discovery channel was full and a discovery was dropped.
    DiscoveryDropped,
    /// A metadata fetch finished with verified metadata.
    MetadataFetched,
    /// A single fetch session failed (the infohash may still be retried).
    FetchFailed,
}

/// Metrics collected by the crawler.
#[derive(Debug, PartialEq, Eq, Default)]
pub struct Metrics {
    /// Total number of KRPC packets sent.
    pub packets_sent: u64,
    /// Total number of outbound packets dropped by the rate limiter.
    pub packets_dropped: u64,
    /// Total number of discoveries handed to the sink side.
    pub discoveries_emitted: u64,
    /// Total number of discoveries dropped on a full channel.
    pub discoveries_dropped: u64,
    /// Total number of fetches that produced verified metadata.
    pub metadata_fetched: u64,
    /// Total number of fetch sessions that failed.
    pub fetches_failed: u64,
}

/// The service responsible for keeping the crawler metrics: it listens to
/// statistics events and applies them to its repository.
pub struct Keeper {
    pub repository: Repo,
}

impl Default for Keeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Keeper {
    #[must_use]
    pub fn new() -> Self {
        Self { repository: Repo::new() }
    }

    /// Starts a listener and returns the sender for the crawler's hot paths
    /// together with the repository holding the counters.
    #[must_use]
    pub fn new_active_instance() -> (Arc<dyn EventSender>, Repo) {
        let mut keeper = Self::new();

        let sender = keeper.run_event_listener();

        (sender, keeper.repository)
    }

    pub fn run_event_listener(&mut self) -> Arc<dyn EventSender> {
        let (sender, receiver) = mpsc::channel::<Event>(CHANNEL_BUFFER_SIZE);

        let repository = self.repository.clone();

        tokio::spawn(async move { event_listener(receiver, repository).await });

        Arc::new(Sender { sender })
    }
}

async fn event_listener(mut receiver: mpsc::Receiver<Event>, repository: Repo) {
    while let Some(event) = receiver.recv().await {
        event_handler(event, &repository).await;
    }
}

async fn event_handler(event: Event, repository: &Repo) {
    match event {
        Event::PacketSent => repository.increase_packets_sent().await,
        Event::PacketDropped => repository.increase_packets_dropped().await,
        Event::DiscoveryEmitted => repository.increase_discoveries_emitted().await,
        Event::DiscoveryDropped => repository.increase_discoveries_dropped().await,
        Event::MetadataFetched => repository.increase_metadata_fetched().await,
        Event::FetchFailed => repository.increase_fetches_failed().await,
    }

    debug!("stats: {:?}", repository.get_stats().await);
}

/// A trait to allow sending statistics events.
///
/// Sending never blocks; an event that finds the buffer full is discarded,
/// which only skews the counters under pathological load.
#[cfg_attr(test, automock)]
pub trait EventSender: Sync + Send {
    fn send_event(&self, event: Event) -> Option<Result<(), TrySendError<Event>>>;
}

/// An [`EventSender`] implementation over the channel created by a [`Keeper`].
pub struct Sender {
    sender: mpsc::Sender<Event>,
}

impl EventSender for Sender {
    fn send_event(&self, event: Event) -> Option<Result<(), TrySendError<Event>>> {
        Some(self.sender.try_send(event))
    }
}

/// A repository for the crawler metrics.
#[derive(Clone)]
pub struct Repo {
    pub stats: Arc<RwLock<Metrics>>,
}

impl Default for Repo {
    fn default() -> Self {
        Self::new()
    }
}

impl Repo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: Arc::new(RwLock::new(Metrics::default())),
        }
    }

    pub async fn get_stats(&self) -> RwLockReadGuard<'_, Metrics> {
        self.stats.read().await
    }

    pub async fn increase_packets_sent(&self) {
        let mut stats_lock = self.stats.write().await;
        stats_lock.packets_sent += 1;
        drop(stats_lock);
    }

    pub async fn increase_packets_dropped(&self) {
        let mut stats_lock = self.stats.write().await;
        stats_lock.packets_dropped += 1;
        drop(stats_lock);
    }

    pub async fn increase_discoveries_emitted(&self) {
        let mut stats_lock = self.stats.write().await;
        stats_lock.discoveries_emitted += 1;
        drop(stats_lock);
    }

    pub async fn increase_discoveries_dropped(&self) {
        let mut stats_lock = self.stats.write().await;
        stats_lock.discoveries_dropped += 1;
        drop(stats_lock);
    }

    pub async fn increase_metadata_fetched(&self) {
        let mut stats_lock = self.stats.write().await;
        stats_lock.metadata_fetched += 1;
        drop(stats_lock);
    }

    pub async fn increase_fetches_failed(&self) {
        let mut stats_lock = self.stats.write().await;
        stats_lock.fetches_failed += 1;
        drop(stats_lock);
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, Keeper};

    #[tokio::test]
    async fn the_keeper_should_count_each_kind_of_event() {
        let (sender, repo) = Keeper::new_active_instance();

        sender.send_event(Event::PacketSent);
        sender.send_event(Event::PacketSent);
        sender.send_event(Event::PacketDropped);
        sender.send_event(Event::MetadataFetched);

        // The listener runs on its own task; yield until it has drained.
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if repo.get_stats().await.metadata_fetched == 1 {
                break;
            }
        }

        let stats = repo.get_stats().await;
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(stats.metadata_fetched, 1);
        assert_eq!(stats.fetches_failed, 0);
    }
}
