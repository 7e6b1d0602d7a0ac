//! The KRPC message grammar (BEP 5), bencoded.
//!
//! Everything the crawler reads from or writes to the UDP wire passes through
//! the [`Message`] type. The grammar also covers the extensions the crawler
//! speaks or must at least be able to decode:
//!
//! - BEP 33 (DHT scrapes): the Bloom-filter response fields.
//! - BEP 51 (`sample_infohashes`): the `samples`/`interval`/`num` fields.
//! - BEP 52 (`BitTorrent` v2): 32-byte infohashes in `samples2`.
//!
//! Bencoded dictionaries must be emitted with their keys in raw-byte order,
//! and `serde_bencode` writes struct fields in declaration order, so every
//! struct here declares its fields already sorted.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use magpie_primitives::node_id::{NodeId, NODE_ID_BYTES_LEN};
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::ByteBuf;
use thiserror::Error;

/// Bytes of a compact IPv4 peer: 4 IP + 2 port.
const COMPACT_PEER_V4_LEN: usize = 6;
/// Bytes of a compact IPv6 peer: 16 IP + 2 port.
const COMPACT_PEER_V6_LEN: usize = 18;
/// Bytes of a compact IPv4 node: 20 id + 4 IP + 2 port.
const COMPACT_NODE_V4_LEN: usize = 26;
/// Bytes of a compact IPv6 node: 20 id + 16 IP + 2 port.
const COMPACT_NODE_V6_LEN: usize = 38;

/// Errors decoding the compact binary encodings embedded in KRPC messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("compact peer info length {len} is neither a multiple of 6 nor 18")]
    InvalidPeersBlobLength { len: usize },

    #[error("compact peer length {len} is neither 6 nor 18")]
    InvalidPeerLength { len: usize },

    #[error("compact node info length {len} is neither a multiple of 26 nor 38")]
    InvalidNodesBlobLength { len: usize },
}

/// A KRPC message: query, response or error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// The named arguments sent with a query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<QueryArguments>,

    /// The error payload. `e` messages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<KrpcError>,

    /// The query method. One of `ping`, `find_node`, `get_peers`,
    /// `announce_peer` or `sample_infohashes` (BEP 51).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,

    /// The response values. `r` messages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<ResponseValues>,

    /// The transaction id, echoed back by the responder.
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub t: ByteBuf,

    /// The message type: `q` for query, `r` for response, `e` for error.
    pub y: String,
}

impl Message {
    /// Decodes a message from a bencoded datagram.
    ///
    /// # Errors
    ///
    /// Will return `Err` on anything that is not a syntactically correct
    /// KRPC message. Semantic checks are left to the protocol layer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    /// Encodes the message for the wire.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the message cannot be bencoded. Messages built by
    /// this crate always can.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

/// The `a` dictionary of a KRPC query.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryArguments {
    /// Id of the querying node.
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub id: ByteBuf,

    /// Whether the responder should use the UDP source port instead of
    /// `port` (`announce_peer`).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub implied_port: i64,

    /// The infohash the query is about (`get_peers`, `announce_peer`).
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub info_hash: ByteBuf,

    /// Whether the responder should prefer non-seed values (BEP 33).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub noseed: i64,

    /// The announcing peer's torrent port (`announce_peer`).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: i64,

    /// Whether the responder should add Bloom filters to the response
    /// (BEP 33).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub scrape: i64,

    /// Whether the announcing peer is a seed (BEP 33).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub seed: i64,

    /// The id of the node sought (`find_node`, `sample_infohashes`).
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub target: ByteBuf,

    /// A token received in an earlier `get_peers` response (`announce_peer`).
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub token: ByteBuf,
}

/// The `r` dictionary of a KRPC response.
///
/// The uppercase Bloom-filter keys sort before the lowercase ones in
/// raw-byte order, hence their position.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseValues {
    /// Bloom filter of announced peers (BEP 33). Decoded, never consulted.
    #[serde(rename = "BFpe", default, skip_serializing_if = "is_empty_bytes")]
    pub bf_peers: ByteBuf,

    /// Bloom filter of announced seeds (BEP 33). Decoded, never consulted.
    #[serde(rename = "BFsd", default, skip_serializing_if = "is_empty_bytes")]
    pub bf_seeds: ByteBuf,

    /// Id of the responding node.
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub id: ByteBuf,

    /// The sample-refresh interval hint in seconds (BEP 51).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub interval: i64,

    /// Compact info of the K closest IPv4 nodes.
    #[serde(default, skip_serializing_if = "CompactNodes::is_empty")]
    pub nodes: CompactNodes,

    /// Compact info of the K closest IPv6 nodes.
    #[serde(default, skip_serializing_if = "CompactNodes::is_empty")]
    pub nodes6: CompactNodes,

    /// Number of infohashes the responder holds (BEP 51).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num: i64,

    /// Concatenated 20-byte infohash samples (BEP 51).
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub samples: ByteBuf,

    /// 32-byte infohash samples (BEP 52).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples2: Vec<ByteBuf>,

    /// Token for a future `announce_peer`.
    #[serde(default, skip_serializing_if = "is_empty_bytes")]
    pub token: ByteBuf,

    /// Compact peers holding the requested infohash.
    #[serde(default, skip_serializing_if = "CompactPeers::is_empty")]
    pub values: CompactPeers,
}

// `skip_serializing_if` requires the reference.
#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &i64) -> bool {
    *value == 0
}

fn is_empty_bytes(bytes: &ByteBuf) -> bool {
    bytes.is_empty()
}

/// A KRPC error payload: a two-element list of code and message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KrpcError {
    pub code: i64,
    pub message: ByteBuf,
}

impl Serialize for KrpcError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for KrpcError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KrpcErrorVisitor;

        impl<'de> Visitor<'de> for KrpcErrorVisitor {
            type Value = KrpcError;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a list of an error code and an error message")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let code: i64 = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let message: ByteBuf = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;

                // Drain whatever extra elements a sloppy peer appended.
                while seq.next_element::<serde_bencode::value::Value>()?.is_some() {}

                Ok(KrpcError { code, message })
            }
        }

        deserializer.deserialize_seq(KrpcErrorVisitor)
    }
}

/// A peer's IP and port, from the 6 or 18-byte compact encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactPeer {
    pub ip: IpAddr,
    pub port: u16,
}

impl CompactPeer {
    /// The peer as a TCP socket address.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Encodes the peer: IP octets followed by the port, big endian.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = match self.ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        bytes.extend_from_slice(&self.port.to_be_bytes());
        bytes
    }

    /// Decodes one compact peer.
    ///
    /// # Errors
    ///
    /// Will return `Err` unless the slice is exactly 6 (IPv4) or 18 (IPv6)
    /// bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let ip = match bytes.len() {
            COMPACT_PEER_V4_LEN => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&bytes[..4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            COMPACT_PEER_V6_LEN => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[..16]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            len => return Err(Error::InvalidPeerLength { len }),
        };
        let port = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);

        Ok(Self { ip, port })
    }
}

impl From<SocketAddr> for CompactPeer {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

/// The `values` list of a `get_peers` response.
///
/// On the wire this is normally a list of compact-peer byte strings, but
/// some implementations send one concatenated string; both forms decode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompactPeers(pub Vec<CompactPeer>);

impl CompactPeers {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Decodes a concatenated compact-peer blob.
    ///
    /// The blob length decides the address family: a multiple of 6 is read
    /// as IPv4 peers, a multiple of 18 (that is not a multiple of 6) as
    /// IPv6 peers. Anything else fails.
    ///
    /// # Errors
    ///
    /// Will return `Err` on a blob length that fits neither family.
    pub fn from_concatenated(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }

        let peer_size = if bytes.len() % COMPACT_PEER_V4_LEN == 0 {
            COMPACT_PEER_V4_LEN
        } else if bytes.len() % COMPACT_PEER_V6_LEN == 0 {
            COMPACT_PEER_V6_LEN
        } else {
            return Err(Error::InvalidPeersBlobLength { len: bytes.len() });
        };

        let peers = bytes
            .chunks(peer_size)
            .map(CompactPeer::from_bytes)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self(peers))
    }
}

impl Serialize for CompactPeers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for peer in &self.0 {
            seq.serialize_element(&ByteBuf::from(peer.to_bytes()))?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for CompactPeers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CompactPeersVisitor;

        impl<'de> Visitor<'de> for CompactPeersVisitor {
            type Value = CompactPeers;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a list of compact peer strings or one concatenated string")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut peers = Vec::new();
                while let Some(bytes) = seq.next_element::<ByteBuf>()? {
                    peers.push(CompactPeer::from_bytes(&bytes).map_err(serde::de::Error::custom)?);
                }
                Ok(CompactPeers(peers))
            }

            fn visit_bytes<E: serde::de::Error>(self, bytes: &[u8]) -> Result<Self::Value, E> {
                CompactPeers::from_concatenated(bytes).map_err(serde::de::Error::custom)
            }

            fn visit_byte_buf<E: serde::de::Error>(self, bytes: Vec<u8>) -> Result<Self::Value, E> {
                self.visit_bytes(&bytes)
            }
        }

        deserializer.deserialize_any(CompactPeersVisitor)
    }
}

/// A node's id and UDP address, from the 26 or 38-byte compact encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl CompactNodeInfo {
    /// Encodes the node info: id, IP octets, port, big endian. The scope
    /// (zone) of an IPv6 address is not representable and is dropped.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.id.bytes().to_vec();
        match self.addr.ip() {
            IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
        }
        bytes.extend_from_slice(&self.addr.port().to_be_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let id = NodeId::try_from(&bytes[..NODE_ID_BYTES_LEN]).expect("the caller checked the element length");
        let peer = CompactPeer::from_bytes(&bytes[NODE_ID_BYTES_LEN..]).expect("the caller checked the element length");

        Self {
            id,
            addr: peer.socket_addr(),
        }
    }
}

/// The `nodes`/`nodes6` field of a response: concatenated compact node infos.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompactNodes(pub Vec<CompactNodeInfo>);

impl CompactNodes {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Decodes a concatenated node-info blob; elements are 26 bytes (IPv4)
    /// or 38 bytes (IPv6), never mixed.
    ///
    /// # Errors
    ///
    /// Will return `Err` on a blob length that fits neither element size.
    pub fn from_concatenated(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }

        let node_size = if bytes.len() % COMPACT_NODE_V4_LEN == 0 {
            COMPACT_NODE_V4_LEN
        } else if bytes.len() % COMPACT_NODE_V6_LEN == 0 {
            COMPACT_NODE_V6_LEN
        } else {
            return Err(Error::InvalidNodesBlobLength { len: bytes.len() });
        };

        let nodes = bytes.chunks(node_size).map(CompactNodeInfo::from_bytes).collect();

        Ok(Self(nodes))
    }

    #[must_use]
    pub fn to_concatenated(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        for node in &self.0 {
            bytes.extend_from_slice(&node.to_bytes());
        }
        bytes
    }
}

impl Serialize for CompactNodes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_concatenated())
    }
}

impl<'de> Deserialize<'de> for CompactNodes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CompactNodesVisitor;

        impl Visitor<'_> for CompactNodesVisitor {
            type Value = CompactNodes;

            fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a string of concatenated compact node infos")
            }

            fn visit_bytes<E: serde::de::Error>(self, bytes: &[u8]) -> Result<Self::Value, E> {
                CompactNodes::from_concatenated(bytes).map_err(serde::de::Error::custom)
            }

            fn visit_byte_buf<E: serde::de::Error>(self, bytes: Vec<u8>) -> Result<Self::Value, E> {
                self.visit_bytes(&bytes)
            }
        }

        deserializer.deserialize_byte_buf(CompactNodesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    use serde_bytes::ByteBuf;

    use super::{CompactNodeInfo, CompactNodes, CompactPeer, CompactPeers, KrpcError, Message, ResponseValues};

    fn v4_peer_bytes() -> Vec<u8> {
        vec![5, 6, 7, 8, 0xc8, 0xd5] // 5.6.7.8:51413
    }

    mod decoding_compact_peers {
        use super::super::CompactPeers;
        use super::v4_peer_bytes;

        #[test]
        fn a_blob_whose_length_is_a_multiple_of_six_should_yield_ipv4_peers() {
            for n in 1..=8 {
                let blob = v4_peer_bytes().repeat(n);

                let peers = CompactPeers::from_concatenated(&blob).unwrap();

                assert_eq!(peers.len(), n);
                assert!(peers.0.iter().all(|peer| peer.ip.is_ipv4()));
            }
        }

        #[test]
        fn the_ipv4_reading_should_win_when_both_element_sizes_divide_the_blob() {
            // Every multiple of 18 is also a multiple of 6, so a concatenated
            // blob is always read as IPv4 peers first. IPv6 peers reach the
            // crawler through fields with a known family (`added6`, `nodes6`)
            // rather than through ambiguous blobs.
            let mut element = [0u8; 18];
            element[15] = 1;
            element[17] = 80;

            let peers = CompactPeers::from_concatenated(&element).unwrap();

            assert_eq!(peers.len(), 3);
            assert!(peers.0.iter().all(|peer| peer.ip.is_ipv4()));
        }

        #[test]
        fn a_blob_of_any_other_length_should_be_rejected() {
            for len in [1, 5, 7, 11, 13] {
                assert!(CompactPeers::from_concatenated(&vec![0u8; len]).is_err());
            }
        }

        #[test]
        fn an_empty_blob_should_yield_no_peers() {
            assert!(CompactPeers::from_concatenated(&[]).unwrap().is_empty());
        }
    }

    #[test]
    fn a_compact_peer_should_round_trip_through_its_ipv4_encoding() {
        let peer = CompactPeer {
            ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            port: 1234,
        };

        assert_eq!(CompactPeer::from_bytes(&peer.to_bytes()).unwrap(), peer);
    }

    #[test]
    fn a_compact_peer_should_round_trip_through_its_ipv6_encoding() {
        let peer = CompactPeer {
            ip: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            port: 51413,
        };

        let bytes = peer.to_bytes();

        assert_eq!(bytes.len(), 18);
        assert_eq!(CompactPeer::from_bytes(&bytes).unwrap(), peer);
    }

    mod decoding_compact_nodes {
        use super::super::CompactNodes;

        fn v4_node_bytes() -> Vec<u8> {
            let mut bytes = vec![0u8; 20];
            bytes.extend_from_slice(&[127, 0, 0, 1, 0, 80]);
            bytes
        }

        fn v6_node_bytes() -> Vec<u8> {
            let mut bytes = vec![0u8; 20];
            let mut ip = [0u8; 16];
            ip[15] = 1;
            bytes.extend_from_slice(&ip);
            bytes.extend_from_slice(&[0, 80]);
            bytes
        }

        #[test]
        fn twenty_six_byte_elements_should_yield_ipv4_nodes() {
            for n in 1..=4 {
                let nodes = CompactNodes::from_concatenated(&v4_node_bytes().repeat(n)).unwrap();

                assert_eq!(nodes.len(), n);
                assert!(nodes.0.iter().all(|node| node.addr.is_ipv4()));
            }
        }

        #[test]
        fn thirty_eight_byte_elements_should_yield_ipv6_nodes() {
            let nodes = CompactNodes::from_concatenated(&v6_node_bytes().repeat(2)).unwrap();

            assert_eq!(nodes.len(), 2);
            assert!(nodes.0.iter().all(|node| node.addr.is_ipv6()));
        }

        #[test]
        fn trailing_bytes_should_be_rejected() {
            let mut blob = v4_node_bytes();
            blob.extend_from_slice(&[1, 2, 3]);

            assert!(CompactNodes::from_concatenated(&blob).is_err());
        }

        #[test]
        fn an_empty_blob_should_yield_no_nodes() {
            assert!(CompactNodes::from_concatenated(&[]).unwrap().is_empty());
        }
    }

    #[test]
    fn a_compact_node_should_round_trip_preserving_id_ip_and_port() {
        let node = CompactNodeInfo {
            id: [7u8; 20].into(),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 6881),
        };

        let nodes = CompactNodes(vec![node]);
        let decoded = CompactNodes::from_concatenated(&nodes.to_concatenated()).unwrap();

        assert_eq!(decoded, nodes);
    }

    #[test]
    fn a_krpc_error_should_round_trip_through_bencode() {
        let error = KrpcError {
            code: 201,
            message: ByteBuf::from(*b"A Generic Error Ocurred"),
        };

        let bytes = serde_bencode::to_bytes(&error).unwrap();

        assert_eq!(bytes, b"li201e23:A Generic Error Ocurrede");
        assert_eq!(serde_bencode::from_bytes::<KrpcError>(&bytes).unwrap(), error);
    }

    #[test]
    fn an_error_message_should_decode_from_its_literal_wire_form() {
        let message = Message::from_bytes(b"d1:eli203e18:Protocol Violatione1:t2:aa1:y1:ee").unwrap();

        assert_eq!(message.y, "e");
        let error = message.e.unwrap();
        assert_eq!(error.code, 203);
        assert_eq!(error.message.as_slice(), b"Protocol Violation");
    }

    #[test]
    fn a_ping_query_should_decode_from_its_literal_wire_form() {
        // The example datagram from BEP 5.
        let message = Message::from_bytes(b"d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe").unwrap();

        assert_eq!(message.y, "q");
        assert_eq!(message.q.as_deref(), Some("ping"));
        assert_eq!(message.a.unwrap().id.as_slice(), b"abcdefghij0123456789");
    }

    #[test]
    fn a_get_peers_response_should_decode_values_sent_as_a_list_of_strings() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"d1:rd2:id20:abcdefghij01234567895:token2:xx6:valuesl6:");
        wire.extend_from_slice(&v4_peer_bytes());
        wire.extend_from_slice(b"ee1:t2:aa1:y1:re");

        let message = Message::from_bytes(&wire).unwrap();
        let values = message.r.unwrap().values;

        assert_eq!(values.len(), 1);
        assert_eq!(
            values.0[0].socket_addr(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)), 51413)
        );
    }

    #[test]
    fn a_message_should_round_trip_through_bencode() {
        let message = Message {
            r: Some(ResponseValues {
                id: ByteBuf::from([9u8; 20].to_vec()),
                token: ByteBuf::from(*b"xx"),
                values: CompactPeers(vec![CompactPeer {
                    ip: IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)),
                    port: 51413,
                }]),
                ..Default::default()
            }),
            t: ByteBuf::from(*b"ab"),
            y: String::from("r"),
            ..Default::default()
        };

        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn emitted_dictionaries_should_have_their_keys_sorted() {
        let message = Message {
            q: Some(String::from("ping")),
            a: Some(super::QueryArguments {
                id: ByteBuf::from([0u8; 20].to_vec()),
                ..Default::default()
            }),
            t: ByteBuf::from(*b"aa"),
            y: String::from("q"),
            ..Default::default()
        };

        let bytes = message.to_bytes().unwrap();
        let text = String::from_utf8_lossy(&bytes);

        let positions: Vec<usize> = ["1:a", "1:q", "1:t", "1:y"]
            .iter()
            .map(|key| text.find(*key).unwrap())
            .collect();

        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn a_sample_infohashes_response_should_expose_its_samples() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"d1:rd2:id20:abcdefghij01234567898:intervali10e7:samples40:");
        wire.extend_from_slice(&[0x11u8; 20]);
        wire.extend_from_slice(&[0x22u8; 20]);
        wire.extend_from_slice(b"e1:t2:aa1:y1:re");

        let message = Message::from_bytes(&wire).unwrap();
        let response = message.r.unwrap();

        assert_eq!(response.interval, 10);
        assert_eq!(response.samples.len(), 40);
        assert_eq!(&response.samples[..20], &[0x11u8; 20]);
    }
}
