//! The leech sink: turns discoveries into bounded, de-duplicated fetches.
//!
//! The sink keeps one entry per infohash being worked on, holding the peers
//! not yet tried. A fetcher task takes a semaphore permit, runs one leech
//! session, and on failure hands the infohash back so the next candidate
//! can be tried on a fresh permit. Peers gossiped over PEX during a live
//! session join the tail of the ladder, so retry order stays: discovery
//! peers first, gossiped peers strictly after.
//!
//! Successes leave through the drain channel. The channel is small and the
//! senders are the fetcher tasks; when storage falls behind, fetchers
//! briefly block, which is the backpressure the crawler wants. The entry is
//! removed only after the metadata has been published, so a consumer can
//! never observe an infohash as "gone" while its metadata is still in
//! flight.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use magpie_primitives::info_hash::InfoHash;
use magpie_primitives::peer_id::PeerId;
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use super::leech::Leech;
use super::Metadata;
use crate::core::statistics;
use crate::mainline::Discovery;

/// Capacity of the drain channel between the fetchers and storage.
const DRAIN_CHANNEL_CAPACITY: usize = 10;

/// The dispatcher for metadata fetches.
pub struct Sink {
    peer_id: PeerId,
    deadline: Duration,
    max_leeches: usize,
    download_sem: Arc<Semaphore>,
    drain_tx: mpsc::Sender<Metadata>,
    in_flight: Mutex<HashMap<InfoHash, Vec<SocketAddr>>>,
    terminated: AtomicBool,
    stats_event_sender: Option<Arc<dyn statistics::EventSender>>,
}

impl Sink {
    /// Builds the sink and hands back the consumer side of its drain
    /// channel.
    #[must_use]
    pub fn new(
        config: &magpie_configuration::Leech,
        stats_event_sender: Option<Arc<dyn statistics::EventSender>>,
    ) -> (Arc<Self>, mpsc::Receiver<Metadata>) {
        let (drain_tx, drain_rx) = mpsc::channel(DRAIN_CHANNEL_CAPACITY);

        let sink = Arc::new(Self {
            peer_id: PeerId::random(),
            deadline: config.drain_timeout(),
            max_leeches: config.max_leeches,
            download_sem: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            drain_tx,
            in_flight: Mutex::new(HashMap::new()),
            terminated: AtomicBool::new(false),
            stats_event_sender,
        });

        (sink, drain_rx)
    }

    /// Accepts a discovery, unless the infohash is already being worked on
    /// or the sink is at its leech limit.
    pub fn sink(self: &Arc<Self>, discovery: Discovery) {
        if self.terminated.load(Ordering::SeqCst) {
            debug!("discovery arrived after termination, dropping it");
            return;
        }

        let Discovery { info_hash, mut peers } = discovery;

        if peers.is_empty() {
            return;
        }

        let first = {
            let mut in_flight = self.lock_in_flight();

            if in_flight.len() >= self.max_leeches {
                return;
            }

            if in_flight.contains_key(&info_hash) {
                return;
            }

            let first = peers.remove(0);
            in_flight.insert(info_hash, peers);
            first
        };

        self.spawn_fetch(info_hash, first);
    }

    /// Number of infohashes currently being worked on.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Stops the sink: discoveries are no longer accepted and running
    /// fetchers notice the flag before publishing.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn spawn_fetch(self: &Arc<Self>, info_hash: InfoHash, peer: SocketAddr) {
        let sink = self.clone();

        tokio::spawn(async move {
            // The permit is held for this one session and released before
            // any retry, so a retrying infohash queues like everyone else.
            let Ok(_permit) = sink.download_sem.clone().acquire_owned().await else {
                return;
            };

            let on_peers = {
                let sink = sink.clone();
                Box::new(move |info_hash, peers| sink.on_peers(info_hash, peers))
            };

            let leech = Leech::new(info_hash, peer, sink.peer_id, Some(on_peers));

            match leech.run(sink.deadline).await {
                Ok(metadata) => sink.flush(metadata).await,
                Err(err) => {
                    debug!(%info_hash, %peer, "fetch failed: {err}");
                    sink.on_leech_error(info_hash);
                }
            }
        });
    }

    /// PEX gossip from a live session: append to the ladder, but only while
    /// the infohash is still being worked on. This bounds gossip-driven
    /// growth to the lifetime of the session.
    fn on_peers(&self, info_hash: InfoHash, peers: Vec<SocketAddr>) {
        let mut in_flight = self.lock_in_flight();

        if let Some(ladder) = in_flight.get_mut(&info_hash) {
            ladder.extend(peers);
        }
    }

    /// Publishes a fetched metadata record, then retires the infohash.
    async fn flush(&self, metadata: Metadata) {
        if self.terminated.load(Ordering::SeqCst) {
            return;
        }

        self.send_stats_event(statistics::Event::MetadataFetched);

        let info_hash = metadata.info_hash;

        // Publish before delete: the drain consumer must never see the
        // infohash gone while its metadata is still unsent.
        if self.drain_tx.send(metadata).await.is_err() {
            debug!(%info_hash, "the drain consumer is gone, discarding metadata");
        }

        self.lock_in_flight().remove(&info_hash);
    }

    /// A session failed: try the next rung of the ladder or retire the
    /// infohash. The external seen-set is not touched, so the crawler will
    /// simply try again if the DHT offers the infohash another day.
    fn on_leech_error(self: &Arc<Self>, info_hash: InfoHash) {
        self.send_stats_event(statistics::Event::FetchFailed);

        let next = {
            let mut in_flight = self.lock_in_flight();

            match in_flight.get_mut(&info_hash) {
                Some(ladder) if !ladder.is_empty() => Some(ladder.remove(0)),
                Some(_) => {
                    in_flight.remove(&info_hash);
                    None
                }
                None => None,
            }
        };

        if let Some(peer) = next {
            self.spawn_fetch(info_hash, peer);
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<InfoHash, Vec<SocketAddr>>> {
        self.in_flight.lock().expect("the in-flight map lock should not be poisoned")
    }

    fn send_stats_event(&self, event: statistics::Event) {
        if let Some(stats_event_sender) = &self.stats_event_sender {
            drop(stats_event_sender.send_event(event));
        }
    }

    #[cfg(test)]
    fn ladder_for(&self, info_hash: &InfoHash) -> Option<Vec<SocketAddr>> {
        self.lock_in_flight().get(info_hash).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use magpie_primitives::info_hash::InfoHash;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::{Metadata, Sink};
    use crate::mainline::Discovery;
    use crate::metadata::test_peer;
    use crate::metadata::TorrentFile;

    fn config(max_leeches: usize) -> magpie_configuration::Leech {
        magpie_configuration::Leech {
            max_leeches,
            max_concurrent_downloads: 4,
            drain_timeout_secs: 10,
        }
    }

    fn sink(max_leeches: usize) -> (Arc<Sink>, mpsc::Receiver<Metadata>) {
        Sink::new(&config(max_leeches), None)
    }

    /// An address that refuses connections: bind a listener and drop it.
    async fn dead_peer() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    fn sample_metadata(info_hash: InfoHash) -> Metadata {
        Metadata {
            info_hash,
            name: String::from("t.iso"),
            total_size: 40000,
            discovered_on: 0,
            files: vec![TorrentFile {
                path: String::from("t.iso"),
                size: 40000,
            }],
        }
    }

    async fn wait_until_idle(sink: &Arc<Sink>) {
        timeout(Duration::from_secs(30), async {
            while sink.in_flight_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("the sink should drain its in-flight work");
    }

    #[tokio::test]
    async fn a_fetch_should_walk_the_retry_ladder_and_succeed_on_a_later_rung() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let good_peer = listener.local_addr().unwrap();
        let server = tokio::spawn(test_peer::serve_large_info_dict(listener));

        let info = test_peer::large_info_dict();
        let info_hash = test_peer::sha1_of(&info);

        let (sink, mut drain) = sink(64);

        sink.sink(Discovery {
            info_hash,
            peers: vec![dead_peer().await, dead_peer().await, good_peer],
        });

        let metadata = timeout(Duration::from_secs(30), drain.recv())
            .await
            .expect("metadata should arrive in time")
            .expect("the drain should stay open");

        assert_eq!(metadata.info_hash, info_hash);
        assert_eq!(metadata.name, "t.iso");

        wait_until_idle(&sink).await;
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn exhausting_every_candidate_should_retire_the_infohash_silently() {
        let (sink, mut drain) = sink(64);
        let info_hash = InfoHash::from([7u8; 20]);

        sink.sink(Discovery {
            info_hash,
            peers: vec![dead_peer().await, dead_peer().await, dead_peer().await],
        });

        wait_until_idle(&sink).await;

        assert!(drain.try_recv().is_err());
    }

    #[tokio::test]
    async fn a_duplicate_discovery_should_be_rejected_while_the_first_is_in_flight() {
        let (sink, _drain) = sink(64);
        let info_hash = InfoHash::from([7u8; 20]);
        let slow_peer = dead_peer().await;

        sink.sink(Discovery {
            info_hash,
            peers: vec![slow_peer, slow_peer],
        });
        sink.sink(Discovery {
            info_hash,
            peers: vec![slow_peer, slow_peer, slow_peer, slow_peer],
        });

        // The second discovery did not replace or extend the first ladder.
        assert_eq!(sink.in_flight_count(), 1);
        assert!(sink.ladder_for(&info_hash).unwrap().len() <= 1);
    }

    #[tokio::test]
    async fn the_leech_cap_should_reject_new_infohashes() {
        let (sink, _drain) = sink(1);
        let peer = dead_peer().await;

        sink.sink(Discovery {
            info_hash: InfoHash::from([7u8; 20]),
            peers: vec![peer, peer],
        });
        sink.sink(Discovery {
            info_hash: InfoHash::from([8u8; 20]),
            peers: vec![peer, peer],
        });

        assert_eq!(sink.in_flight_count(), 1);
    }

    #[tokio::test]
    async fn pex_peers_should_join_the_ladder_only_while_the_entry_lives() {
        let (sink, _drain) = sink(64);
        let info_hash = InfoHash::from([7u8; 20]);
        let peer = dead_peer().await;
        let gossiped: SocketAddr = "9.9.9.9:8080".parse().unwrap();

        sink.sink(Discovery {
            info_hash,
            peers: vec![peer, peer],
        });

        sink.on_peers(info_hash, vec![gossiped]);
        assert!(sink.ladder_for(&info_hash).unwrap().contains(&gossiped));

        let unknown = InfoHash::from([9u8; 20]);
        sink.on_peers(unknown, vec![gossiped]);
        assert!(sink.ladder_for(&unknown).is_none());
    }

    #[tokio::test]
    async fn flush_should_publish_before_deleting_the_entry() {
        let (sink, mut drain) = sink(64);
        let info_hash = InfoHash::from([7u8; 20]);

        sink.sink(Discovery {
            info_hash,
            peers: vec![dead_peer().await],
        });

        sink.flush(sample_metadata(info_hash)).await;

        // The drain already holds the metadata and the entry is gone: a
        // consumer that sees the record can never observe the entry again.
        let received = drain.try_recv().unwrap();
        assert_eq!(received.info_hash, info_hash);
        assert_eq!(sink.ladder_for(&info_hash), None);
    }

    #[tokio::test]
    async fn a_terminated_sink_should_neither_accept_nor_publish() {
        let (sink, mut drain) = sink(64);
        let info_hash = InfoHash::from([7u8; 20]);

        sink.terminate();

        sink.sink(Discovery {
            info_hash,
            peers: vec![dead_peer().await],
        });
        assert_eq!(sink.in_flight_count(), 0);

        sink.flush(sample_metadata(info_hash)).await;
        assert!(drain.try_recv().is_err());
    }
}
