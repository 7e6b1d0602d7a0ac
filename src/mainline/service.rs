//! The indexing service: the part of the crawler that lives on the DHT.
//!
//! The service keeps a bounded table of recently seen neighbours. A ticker
//! seeds the table from the bootstrap nodes while it is empty; once
//! populated, every tick sends each neighbour a `sample_infohashes` query
//! with a fresh random target (so probes spread across the id space) and
//! sweeps out neighbours that have been quiet for too long. Sampled
//! infohashes are chased with `get_peers`, and each `get_peers` response
//! with usable peers becomes a [`Discovery`].
//!
//! Locking: the neighbour table, its LRU order and the last-seen stamps live
//! in one structure behind one `RwLock`, and are only mutated together.
//! Sends never happen while the lock is held. The outstanding-query map is
//! owned by the dispatch loop and needs no lock at all.
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use magpie_clock::Time;
use magpie_primitives::info_hash::InfoHash;
use magpie_primitives::node_id::{NodeId, NODE_ID_BYTES_LEN};
use magpie_primitives::DurationSinceUnixEpoch;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec::{CompactNodeInfo, CompactNodes, Message};
use super::protocol::{self, Inbound, Protocol};
use super::transport::MAX_PACKET_SIZE;
use super::Discovery;
use crate::CurrentClock;

/// Neighbours quiet for longer than this are swept out.
const NEIGHBOUR_MAX_IDLE: Duration = Duration::from_secs(5 * 60);

/// How many neighbours an inbound `sample_infohashes` query gets back.
const COURTESY_NODES: usize = 8;

/// Handler the owner wires in to receive discoveries.
pub type OnResult = Box<dyn Fn(Discovery) + Send + Sync>;

/// A neighbour table entry.
#[derive(Debug, Clone, Copy)]
struct Neighbour {
    addr: SocketAddr,
    last_seen: DurationSinceUnixEpoch,
}

/// What [`NeighbourTable::admit`] did with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// The node was unusable (port 0) and was ignored.
    Ignored,
    /// The node was already known; its last-seen stamp was refreshed.
    Refreshed,
    /// The node is new and was inserted, possibly displacing the
    /// least-recently-seen entry.
    Inserted,
}

/// The neighbour table with its LRU order and last-seen stamps.
///
/// The map and the order list are co-indexed: every map key appears in the
/// list exactly once, and never more than `max_neighbors` entries exist.
struct NeighbourTable {
    max_neighbors: usize,
    entries: HashMap<NodeId, Neighbour>,
    /// Most recently seen at the front.
    lru: VecDeque<NodeId>,
}

impl NeighbourTable {
    fn new(max_neighbors: usize) -> Self {
        Self {
            max_neighbors,
            entries: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn admit(&mut self, id: NodeId, addr: SocketAddr, now: DurationSinceUnixEpoch) -> Admission {
        if addr.port() == 0 {
            return Admission::Ignored;
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.last_seen = now;
            self.move_to_front(&id);
            return Admission::Refreshed;
        }

        if self.entries.len() >= self.max_neighbors {
            if let Some(oldest) = self.lru.pop_back() {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(id, Neighbour { addr, last_seen: now });
        self.lru.push_front(id);

        Admission::Inserted
    }

    fn move_to_front(&mut self, id: &NodeId) {
        if let Some(position) = self.lru.iter().position(|candidate| candidate == id) {
            self.lru.remove(position);
        }
        self.lru.push_front(*id);
    }

    /// Sweeps the LRU tail: every entry idle longer than `max_idle` goes.
    /// The sweep stops at the first fresh entry, since the list is ordered
    /// by recency.
    fn prune(&mut self, now: DurationSinceUnixEpoch, max_idle: Duration) {
        while let Some(oldest) = self.lru.back() {
            let last_seen = self.entries[oldest].last_seen;

            if now.saturating_sub(last_seen) > max_idle {
                let oldest = *oldest;
                self.lru.pop_back();
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn snapshot_addrs(&self) -> Vec<SocketAddr> {
        self.entries.values().map(|entry| entry.addr).collect()
    }

    fn some_nodes(&self, limit: usize) -> CompactNodes {
        CompactNodes(
            self.entries
                .iter()
                .take(limit)
                .map(|(id, entry)| CompactNodeInfo {
                    id: *id,
                    addr: entry.addr,
                })
                .collect(),
        )
    }
}

/// The `tag → infohash` map for outstanding `get_peers` queries.
///
/// Owned by the dispatch loop, so no lock. Tags come from a wrapping `u16`
/// counter; when the counter wraps, a new query silently displaces the
/// stale entry under the same tag, and the stale response (if it ever
/// arrives) is simply unmatched.
#[derive(Default)]
pub struct OutstandingQueries {
    counter: u16,
    by_tag: HashMap<[u8; 2], InfoHash>,
}

impl OutstandingQueries {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Assigns the next tag to `info_hash` and records the mapping.
    pub fn assign(&mut self, info_hash: InfoHash) -> [u8; 2] {
        let tag = self.counter.to_be_bytes();
        self.by_tag.insert(tag, info_hash);
        self.counter = self.counter.wrapping_add(1);
        tag
    }

    /// Consumes the mapping for a response's transaction id.
    pub fn take(&mut self, transaction_id: &[u8]) -> Option<InfoHash> {
        let mut tag = [0u8; 2];
        for (slot, byte) in tag.iter_mut().zip(transaction_id) {
            *slot = *byte;
        }
        self.by_tag.remove(&tag)
    }

    #[must_use]
    pub fn get(&self, tag: [u8; 2]) -> Option<&InfoHash> {
        self.by_tag.get(&tag)
    }
}

/// One DHT indexing service, bound to one UDP socket.
#[allow(clippy::module_name_repetitions)]
pub struct IndexingService {
    node_id: NodeId,
    interval: Duration,
    bootstrap_nodes: Vec<String>,
    protocol: Arc<Protocol>,
    table: RwLock<NeighbourTable>,
    on_result: OnResult,
}

impl IndexingService {
    /// Builds the service around an already bound protocol instance.
    ///
    /// `on_result` is wired in by the owner at construction time; the
    /// service never holds a reference back to its owner.
    #[must_use]
    pub fn new(
        protocol: Arc<Protocol>,
        interval: Duration,
        max_neighbors: usize,
        bootstrap_nodes: Vec<String>,
        on_result: OnResult,
    ) -> Self {
        Self {
            node_id: NodeId::random(),
            interval,
            bootstrap_nodes,
            protocol,
            table: RwLock::new(NeighbourTable::new(max_neighbors)),
            on_result,
        }
    }

    /// Number of neighbours currently in the table.
    ///
    /// # Panics
    ///
    /// Panics if the table lock is poisoned.
    #[must_use]
    pub fn neighbour_count(&self) -> usize {
        self.table.read().expect("the neighbour table lock should not be poisoned").len()
    }

    /// Spawns the read loop, the probe ticker and the token-rotation timer.
    /// All three stop when `shutdown` fires.
    #[must_use]
    pub fn start(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let dispatcher = {
            let service = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut outstanding = OutstandingQueries::new();
                let mut buffer = vec![0u8; MAX_PACKET_SIZE];
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        received = service.protocol.transport().receive(&mut buffer) => match received {
                            Ok((message, from)) => service.handle_message(message, from, &mut outstanding).await,
                            Err(err) => {
                                warn!("indexer socket failed, stopping the read loop: {err}");
                                break;
                            }
                        },
                    }
                }
            })
        };

        let ticker = {
            let service = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(service.interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = timer.tick() => service.tick().await,
                    }
                }
            })
        };

        let rotation = self.protocol.start_token_rotation();

        vec![dispatcher, ticker, rotation]
    }

    /// One probe round: bootstrap while the table is empty, otherwise sample
    /// every neighbour and then sweep the stale tail.
    ///
    /// # Panics
    ///
    /// Panics if the neighbour table lock is poisoned.
    pub async fn tick(&self) {
        let empty = self.table.read().expect("the neighbour table lock should not be poisoned").is_empty();

        if empty {
            self.bootstrap().await;
        } else {
            self.sample_neighbours().await;

            self.table
                .write()
                .expect("the neighbour table lock should not be poisoned")
                .prune(CurrentClock::now(), NEIGHBOUR_MAX_IDLE);
        }
    }

    async fn bootstrap(&self) {
        for node in &self.bootstrap_nodes {
            let resolved = match tokio::net::lookup_host(node.as_str()).await {
                Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
                Err(err) => {
                    warn!(%node, "could not resolve a bootstrap node: {err}");
                    continue;
                }
            };

            let Some(addr) = resolved else {
                warn!(%node, "a bootstrap node resolved to no IPv4 address");
                continue;
            };

            let query = protocol::new_find_node_query(self.node_id, random_target());
            self.protocol.send(&query, addr).await;
        }
    }

    async fn sample_neighbours(&self) {
        // Snapshot the endpoints so responses can take the write lock while
        // the queries go out.
        let addrs = self
            .table
            .read()
            .expect("the neighbour table lock should not be poisoned")
            .snapshot_addrs();

        for addr in addrs {
            let query = protocol::new_sample_infohashes_query(self.node_id, random_target());
            self.protocol.send(&query, addr).await;
        }
    }

    /// Classifies one inbound message and reacts to the types the crawler
    /// cares about. Everything else was either answered by nobody (we are
    /// passive) or already dropped by validation.
    pub async fn handle_message(&self, message: Message, from: SocketAddr, outstanding: &mut OutstandingQueries) {
        match protocol::classify(message) {
            Some(Inbound::FindNodeResponse(message)) => self.on_find_node_response(&message, from).await,
            Some(Inbound::GetPeersResponse(message)) => self.on_get_peers_response(&message, from, outstanding).await,
            Some(Inbound::SampleInfohashesResponse(message)) => {
                self.on_sample_infohashes_response(&message, from, outstanding).await;
            }
            Some(Inbound::SampleInfohashesQuery(message)) => self.on_sample_infohashes_query(&message, from).await,
            _ => {}
        };
    }

    /// Admits a node; a brand new neighbour is immediately probed for
    /// samples, to get an answer in before it may churn out.
    async fn add_node(&self, id: NodeId, addr: SocketAddr) {
        let admission = self
            .table
            .write()
            .expect("the neighbour table lock should not be poisoned")
            .admit(id, addr, CurrentClock::now());

        if admission == Admission::Inserted {
            let query = protocol::new_sample_infohashes_query(self.node_id, random_target());
            self.protocol.send(&query, addr).await;
        }
    }

    async fn admit_responder(&self, message: &Message, from: SocketAddr) {
        let id = message
            .r
            .as_ref()
            .and_then(|r| NodeId::try_from(r.id.as_slice()).ok())
            .expect("validated responses carry a 20-byte id");
        self.add_node(id, from).await;
    }

    async fn on_find_node_response(&self, message: &Message, from: SocketAddr) {
        self.admit_responder(message, from).await;

        let response = message.r.as_ref().expect("classified responses carry values");
        for node in response.nodes.0.iter().chain(response.nodes6.0.iter()) {
            self.add_node(node.id, node.addr).await;
        }
    }

    async fn on_sample_infohashes_response(&self, message: &Message, from: SocketAddr, outstanding: &mut OutstandingQueries) {
        self.admit_responder(message, from).await;

        let response = message.r.as_ref().expect("classified responses carry values");

        for sample in response.samples.chunks(20) {
            let info_hash = InfoHash::try_from(sample).expect("validation left only whole 20-byte samples");
            self.request_peers(info_hash, from, outstanding).await;
        }

        for sample in &response.samples2 {
            let info_hash = InfoHash::try_from(sample.as_slice()).expect("validation left only 32-byte v2 samples");
            self.request_peers(info_hash, from, outstanding).await;
        }

        for node in response.nodes.0.iter().chain(response.nodes6.0.iter()) {
            self.add_node(node.id, node.addr).await;
        }
    }

    /// Sends a `get_peers` query for a sampled infohash and records the
    /// transaction tag so the response can be matched back.
    async fn request_peers(&self, info_hash: InfoHash, addr: SocketAddr, outstanding: &mut OutstandingQueries) {
        let tag = outstanding.assign(info_hash);
        let query = protocol::new_get_peers_query(self.node_id, tag, info_hash.bytes());
        self.protocol.send(&query, addr).await;
    }

    async fn on_get_peers_response(&self, message: &Message, from: SocketAddr, outstanding: &mut OutstandingQueries) {
        self.admit_responder(message, from).await;

        // Consume the tag whether or not the response is usable.
        let Some(info_hash) = outstanding.take(&message.t) else {
            debug!(%from, "a get_peers response matched no outstanding query");
            return;
        };

        let response = message.r.as_ref().expect("classified responses carry values");

        // BEP 51 says samples are infohashes the node holds get_peers values
        // for, so `values` should never be empty here. C'est la vie.
        let peers: Vec<SocketAddr> = response
            .values
            .0
            .iter()
            .filter(|peer| peer.port != 0)
            .map(super::codec::CompactPeer::socket_addr)
            .collect();

        if peers.is_empty() {
            return;
        }

        (self.on_result)(Discovery { info_hash, peers });
    }

    /// The courtesy reply: a handful of neighbours, our probing interval as
    /// the refresh hint, and no samples, since the crawler stores no
    /// `get_peers` records it could sample.
    async fn on_sample_infohashes_query(&self, message: &Message, from: SocketAddr) {
        let nodes = self
            .table
            .read()
            .expect("the neighbour table lock should not be poisoned")
            .some_nodes(COURTESY_NODES);

        let interval = i64::try_from(self.interval.as_secs()).unwrap_or(i64::MAX);
        let reply = protocol::new_sample_infohashes_response(message.t.clone(), self.node_id, interval, nodes);

        self.protocol.send(&reply, from).await;
    }
}

/// A fresh random probe target.
///
/// # Panics
///
/// Panics if the OS random number generator fails.
fn random_target() -> [u8; NODE_ID_BYTES_LEN] {
    let mut target = [0u8; NODE_ID_BYTES_LEN];
    OsRng.fill_bytes(&mut target);
    target
}
