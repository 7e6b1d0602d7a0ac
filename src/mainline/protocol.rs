//! The KRPC protocol layer: semantic checks over decoded messages.
//!
//! The transport delivers syntactically correct [`Message`]s; this layer
//! classifies them ([`Inbound`]), validates the fields each message type
//! requires, and silently drops everything else. It also owns the
//! `announce_peer` token secrets and builds the queries the indexing service
//! sends.
//!
//! Response messages carry no method name. They could be correlated through
//! transaction ids, but a crawler sends thousands of queries per second and
//! two-byte transaction ids wrap quickly, so instead responses are classified
//! by their signature fields, most specific first:
//!
//! `samples` ⇒ `sample_infohashes`, then `token` ⇒ `get_peers`, then
//! `nodes`/`nodes6` ⇒ `find_node`, otherwise `ping`/`announce_peer`.
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use magpie_primitives::node_id::{NodeId, NODE_ID_BYTES_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use tokio::task::JoinHandle;
use tracing::debug;

use super::codec::{CompactNodes, Message, QueryArguments, ResponseValues};
use super::transport::Transport;

/// Bytes in a token secret.
const TOKEN_SECRET_LEN: usize = 20;

/// How often the token secret is rotated.
const TOKEN_ROTATION_PERIOD: Duration = Duration::from_secs(10 * 60);

/// A validated, classified KRPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    PingQuery(Message),
    FindNodeQuery(Message),
    GetPeersQuery(Message),
    AnnouncePeerQuery(Message),
    SampleInfohashesQuery(Message),
    FindNodeResponse(Message),
    GetPeersResponse(Message),
    SampleInfohashesResponse(Message),
    PingOrAnnouncePeerResponse(Message),
}

/// Classifies and validates a decoded message.
///
/// Returns `None` for anything that should be dropped: unknown methods,
/// messages failing validation, and error messages (which are at most
/// logged).
#[must_use]
#[allow(clippy::module_name_repetitions)]
pub fn classify(message: Message) -> Option<Inbound> {
    match message.y.as_str() {
        "q" => classify_query(message),
        "r" => classify_response(message),
        "e" => {
            // 202 Server Error and 204 Method Unknown are everyday noise.
            if let Some(error) = &message.e {
                if error.code != 202 && error.code != 204 {
                    debug!(
                        code = error.code,
                        message = %String::from_utf8_lossy(&error.message),
                        "received a KRPC error"
                    );
                }
            }
            None
        }
        _ => None,
    }
}

fn classify_query(message: Message) -> Option<Inbound> {
    match message.q.as_deref()? {
        "ping" if validate_ping_query(&message) => Some(Inbound::PingQuery(message)),
        "find_node" if validate_find_node_query(&message) => Some(Inbound::FindNodeQuery(message)),
        "get_peers" if validate_get_peers_query(&message) => Some(Inbound::GetPeersQuery(message)),
        "announce_peer" if validate_announce_peer_query(&message) => Some(Inbound::AnnouncePeerQuery(message)),
        "sample_infohashes" if validate_sample_infohashes_query(&message) => Some(Inbound::SampleInfohashesQuery(message)),
        // `vote` exists in the wild; we know about it and ignore it.
        _ => None,
    }
}

fn classify_response(message: Message) -> Option<Inbound> {
    let response = message.r.as_ref()?;

    if !response.samples.is_empty() {
        validate_sample_infohashes_response(&message).then_some(Inbound::SampleInfohashesResponse(message))
    } else if !response.token.is_empty() {
        validate_get_peers_response(&message).then_some(Inbound::GetPeersResponse(message))
    } else if !response.nodes.is_empty() {
        validate_find_node_response(&message).then_some(Inbound::FindNodeResponse(message))
    } else {
        validate_ping_or_announce_peer_response(&message).then_some(Inbound::PingOrAnnouncePeerResponse(message))
    }
}

fn validate_ping_query(message: &Message) -> bool {
    message.a.as_ref().is_some_and(|a| a.id.len() == NODE_ID_BYTES_LEN)
}

fn validate_find_node_query(message: &Message) -> bool {
    message
        .a
        .as_ref()
        .is_some_and(|a| a.id.len() == NODE_ID_BYTES_LEN && a.target.len() == NODE_ID_BYTES_LEN)
}

fn validate_get_peers_query(message: &Message) -> bool {
    message
        .a
        .as_ref()
        .is_some_and(|a| a.id.len() == NODE_ID_BYTES_LEN && (a.info_hash.len() == 20 || a.info_hash.len() == 32))
}

fn validate_announce_peer_query(message: &Message) -> bool {
    message.a.as_ref().is_some_and(|a| {
        a.id.len() == NODE_ID_BYTES_LEN && (a.info_hash.len() == 20 || a.info_hash.len() == 32) && a.port > 0 && !a.token.is_empty()
    })
}

fn validate_sample_infohashes_query(message: &Message) -> bool {
    message
        .a
        .as_ref()
        .is_some_and(|a| a.id.len() == NODE_ID_BYTES_LEN && a.target.len() == NODE_ID_BYTES_LEN)
}

fn validate_ping_or_announce_peer_response(message: &Message) -> bool {
    message.r.as_ref().is_some_and(|r| r.id.len() == NODE_ID_BYTES_LEN)
}

fn validate_find_node_response(message: &Message) -> bool {
    message
        .r
        .as_ref()
        .is_some_and(|r| r.id.len() == NODE_ID_BYTES_LEN && (!r.nodes.is_empty() || !r.nodes6.is_empty()))
}

fn validate_get_peers_response(message: &Message) -> bool {
    message.r.as_ref().is_some_and(|r| {
        r.id.len() == NODE_ID_BYTES_LEN
            && !r.token.is_empty()
            && (!r.values.is_empty() || !r.nodes.is_empty() || !r.nodes6.is_empty())
    })
}

fn validate_sample_infohashes_response(message: &Message) -> bool {
    message.r.as_ref().is_some_and(|r| {
        r.id.len() == NODE_ID_BYTES_LEN
            && r.interval >= 0
            && r.num >= 0
            && r.samples.len() % 20 == 0
            && r.samples2.iter().all(|sample| sample.len() == 32)
    })
}

/// The pair of secrets behind `announce_peer` tokens.
struct TokenSecrets {
    current: [u8; TOKEN_SECRET_LEN],
    previous: [u8; TOKEN_SECRET_LEN],
}

impl TokenSecrets {
    /// # Panics
    ///
    /// Panics if the OS random number generator fails; tokens derived from a
    /// predictable secret are worthless.
    fn generate() -> Self {
        let mut current = [0u8; TOKEN_SECRET_LEN];
        OsRng.fill_bytes(&mut current);

        // Until the first rotation both secrets are the same.
        Self {
            current,
            previous: current,
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        OsRng.fill_bytes(&mut self.current);
    }
}

/// The protocol instance bound to one transport.
pub struct Protocol {
    transport: Transport,
    secrets: Mutex<TokenSecrets>,
}

impl Protocol {
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            secrets: Mutex::new(TokenSecrets::generate()),
        }
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Sends a KRPC message, subject to the transport's egress budget.
    pub async fn send(&self, message: &Message, to: SocketAddr) {
        self.transport.send(message, to).await;
    }

    /// Derives the `announce_peer` token for an address:
    /// `SHA1(current_secret || ip-octets)`.
    ///
    /// # Panics
    ///
    /// Panics if the token secrets lock is poisoned.
    #[must_use]
    pub fn calculate_token(&self, ip: IpAddr) -> [u8; 20] {
        let secrets = self.secrets.lock().expect("the token secrets lock should not be poisoned");
        token_for(&secrets.current, ip)
    }

    /// Accepts tokens derived from the current or the previous secret, so a
    /// token stays valid across one rotation.
    ///
    /// # Panics
    ///
    /// Panics if the token secrets lock is poisoned.
    #[must_use]
    pub fn verify_token(&self, ip: IpAddr, token: &[u8]) -> bool {
        let secrets = self.secrets.lock().expect("the token secrets lock should not be poisoned");

        token == token_for(&secrets.current, ip) || token == token_for(&secrets.previous, ip)
    }

    /// Retires the current secret into the previous slot and draws a fresh
    /// one.
    ///
    /// # Panics
    ///
    /// Panics if the token secrets lock is poisoned or the OS random number
    /// generator fails.
    pub fn rotate_token_secret(&self) {
        self.secrets
            .lock()
            .expect("the token secrets lock should not be poisoned")
            .rotate();
    }

    /// Spawns the rotation timer: one rotation every ten minutes until the
    /// handle is aborted.
    #[must_use]
    pub fn start_token_rotation(self: &Arc<Self>) -> JoinHandle<()> {
        let protocol = self.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(TOKEN_ROTATION_PERIOD);
            timer.tick().await; // the first tick fires immediately

            loop {
                timer.tick().await;
                protocol.rotate_token_secret();
            }
        })
    }
}

fn token_for(secret: &[u8; TOKEN_SECRET_LEN], ip: IpAddr) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.finalize().into()
}

/// Builds a `find_node` query for a random `target`.
#[must_use]
pub fn new_find_node_query(id: NodeId, target: [u8; NODE_ID_BYTES_LEN]) -> Message {
    Message {
        a: Some(QueryArguments {
            id: ByteBuf::from(id.bytes().to_vec()),
            target: ByteBuf::from(target.to_vec()),
            ..Default::default()
        }),
        q: Some(String::from("find_node")),
        t: ByteBuf::from(*b"aa"),
        y: String::from("q"),
        ..Default::default()
    }
}

/// Builds a `get_peers` query. The caller assigns the transaction id it uses
/// to correlate the response.
#[must_use]
pub fn new_get_peers_query(id: NodeId, transaction_id: [u8; 2], info_hash: &[u8]) -> Message {
    Message {
        a: Some(QueryArguments {
            id: ByteBuf::from(id.bytes().to_vec()),
            info_hash: ByteBuf::from(info_hash.to_vec()),
            ..Default::default()
        }),
        q: Some(String::from("get_peers")),
        t: ByteBuf::from(transaction_id.to_vec()),
        y: String::from("q"),
        ..Default::default()
    }
}

/// Builds a `sample_infohashes` query (BEP 51) for a random `target`.
#[must_use]
pub fn new_sample_infohashes_query(id: NodeId, target: [u8; NODE_ID_BYTES_LEN]) -> Message {
    Message {
        a: Some(QueryArguments {
            id: ByteBuf::from(id.bytes().to_vec()),
            target: ByteBuf::from(target.to_vec()),
            ..Default::default()
        }),
        q: Some(String::from("sample_infohashes")),
        t: ByteBuf::from(*b"aa"),
        y: String::from("q"),
        ..Default::default()
    }
}

/// Builds the courtesy reply to an inbound `sample_infohashes` query: some
/// neighbours, the refresh hint, and no samples (the crawler holds no
/// `get_peers` records to sample).
#[must_use]
pub fn new_sample_infohashes_response(transaction_id: ByteBuf, id: NodeId, interval: i64, nodes: CompactNodes) -> Message {
    Message {
        r: Some(ResponseValues {
            id: ByteBuf::from(id.bytes().to_vec()),
            interval,
            nodes,
            ..Default::default()
        }),
        t: transaction_id,
        y: String::from("r"),
        ..Default::default()
    }
}
