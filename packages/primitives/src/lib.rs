//! Primitive types shared by the magpie packages.
//!
//! This crate contains the basic identifiers of the `BitTorrent` world as the
//! crawler sees them: [`info_hash::InfoHash`] (the key under which peers
//! announce a torrent), [`node_id::NodeId`] (the identity of a DHT node) and
//! [`peer_id::PeerId`] (the identity the crawler presents to peers over TCP).
//!
//! They are used by the crawler core crate and by the configuration crate, so
//! they live in their own package to avoid a dependency cycle.
use std::time::Duration;

pub mod info_hash;
pub mod node_id;
pub mod peer_id;

/// Duration since the Unix Epoch (timestamp).
pub type DurationSinceUnixEpoch = Duration;
