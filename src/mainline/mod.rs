//! The Mainline DHT side of the crawler.
//!
//! Leaf to root:
//!
//! - [`codec`]: the bencoded KRPC message grammar (BEP 5/33/51/52).
//! - [`transport`]: one IPv4 UDP socket with a rate-limited egress path.
//! - [`protocol`]: message classification, validation and token secrets.
//! - [`service`]: the indexing service proper, which keeps a bounded
//!   neighbour table, probes it for infohash samples and chases the samples
//!   to their peers.
//! - [`manager`]: starts one service per configured bind address and funnels
//!   what they find into one bounded channel.
//!
//! The crawler is a passive citizen of the DHT: it initiates `find_node`,
//! `sample_infohashes` and `get_peers` queries, answers inbound
//! `sample_infohashes` queries out of courtesy, and never announces
//! anything.
use std::net::SocketAddr;

use magpie_primitives::info_hash::InfoHash;

pub mod codec;
pub mod manager;
pub mod protocol;
pub mod service;
pub mod transport;

/// An infohash spotted on the DHT, together with the peers that were
/// advertised as holding it. What the indexing side produces and the leech
/// side consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub info_hash: InfoHash,
    pub peers: Vec<SocketAddr>,
}
