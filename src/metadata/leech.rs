//! One TCP session that leeches a torrent's metadata from one peer.
//!
//! The session walks a straight line and aborts on the first wrinkle:
//!
//! ```text
//! dial → BT handshake → extension handshake → request all pieces
//!      → assemble → verify digest → parse info dictionary
//! ```
//!
//! Along the way the peer may gossip other peers via `ut_pex` (BEP 11);
//! those are handed to the owner through the `on_peers` callback so failed
//! sessions can be retried against them.
//!
//! The whole session runs under one absolute deadline fixed at spawn time;
//! there is no cooperative cancellation, a session that overstays is simply
//! cut off.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use magpie_clock::Time;
use magpie_primitives::info_hash::InfoHash;
use magpie_primitives::peer_id::PeerId;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{parse_info, InfoError, Metadata};
use crate::CurrentClock;

/// Upper bound on an advertised metadata size; nothing is allocated before
/// the advertisement passes this check.
pub const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;

/// Metadata piece size (BEP 9). Every piece but the last must be exactly
/// this long.
const PIECE_SIZE: usize = 16 * 1024;

/// TCP connect budget, separate from the session deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// The fixed extension handshake the crawler sends: message id 20,
/// handshake id 0, advertising `ut_metadata = 1` and `ut_pex = 2`.
const EXTENSION_HANDSHAKE: &[u8] = b"\x00\x00\x00\x25\x14\x00d1:md11:ut_metadatai1e6:ut_pexi2eee";

/// The local extension ids advertised above; remotes address us with them.
const LOCAL_UT_METADATA: u8 = 1;
const LOCAL_UT_PEX: u8 = 2;

/// Handler for peers gossiped over `ut_pex` during a session.
pub type OnPeers = Box<dyn Fn(InfoHash, Vec<SocketAddr>) + Send + Sync>;

/// Everything that can cut a session short.
#[derive(Error, Debug)]
pub enum Error {
    #[error("could not dial the peer: {source}")]
    Dial { source: std::io::Error },

    #[error("dialing the peer timed out")]
    DialTimeout,

    #[error("peer socket i/o failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("corrupt BitTorrent handshake received")]
    CorruptHandshake,

    #[error("remote peer infohash mismatch")]
    HandshakeInfoHashMismatch,

    #[error("peer does not support the extension protocol")]
    ExtensionProtocolUnsupported,

    #[error("the first extension message is not an extension handshake")]
    NotAnExtensionHandshake,

    #[error("the extension handshake does not decode: {source}")]
    BadExtensionHandshake { source: serde_bencode::Error },

    #[error("metadata size {size} is out of range")]
    MetadataSizeOutOfRange { size: i64 },

    #[error("ut_metadata id {id} is out of range")]
    UtMetadataIdOutOfRange { id: i64 },

    #[error("a message is longer than the maximum allowed metadata size")]
    OversizedMessage,

    #[error("a metadata piece does not decode")]
    BadPieceMessage,

    #[error("remote peer rejected sending metadata")]
    MetadataRejected,

    #[error("a metadata piece is longer than 16 KiB")]
    OversizedPiece,

    #[error("a non-final metadata piece is shorter than 16 KiB")]
    ShortPiece,

    #[error("a metadata piece falls outside the advertised size")]
    PieceOutOfBounds,

    #[error("the assembled metadata does not hash to the infohash")]
    InfoHashMismatch,

    #[error("bad info dictionary: {source}")]
    Info {
        #[from]
        source: InfoError,
    },

    #[error("the fetch deadline expired")]
    DeadlineExpired,
}

/// The remote's extension handshake, reduced to what the session needs.
#[derive(Debug, Clone, Copy)]
struct RemoteExtensions {
    ut_metadata: u8,
    metadata_size: usize,
}

#[derive(Deserialize, Default, Debug)]
struct ExtensionHandshake {
    #[serde(default)]
    m: ExtensionIds,
    #[serde(default)]
    metadata_size: i64,
}

#[derive(Deserialize, Default, Debug)]
struct ExtensionIds {
    #[serde(default)]
    ut_metadata: i64,
    /// The remote's `ut_pex` id. Decoded for completeness; inbound PEX
    /// messages arrive under the id we advertised, and we never send any.
    #[serde(default)]
    #[allow(dead_code)]
    ut_pex: i64,
}

/// The header dictionary of a `ut_metadata` message.
#[derive(Serialize, Deserialize, Default, Debug)]
struct PieceHeader {
    msg_type: i64,
    piece: i64,
}

/// The parts of a `ut_pex` message the crawler uses.
#[derive(Deserialize, Default, Debug)]
struct PexMessage {
    #[serde(default)]
    added: ByteBuf,
    #[serde(default)]
    added6: ByteBuf,
}

/// One fetch session against one peer.
pub struct Leech {
    info_hash: InfoHash,
    peer_addr: SocketAddr,
    peer_id: PeerId,
    on_peers: Option<OnPeers>,
}

impl Leech {
    #[must_use]
    pub fn new(info_hash: InfoHash, peer_addr: SocketAddr, peer_id: PeerId, on_peers: Option<OnPeers>) -> Self {
        Self {
            info_hash,
            peer_addr,
            peer_id,
            on_peers,
        }
    }

    /// Runs the session under its absolute deadline.
    ///
    /// # Errors
    ///
    /// Will return `Err` for every way a peer can disappoint; see [`Error`].
    /// None of them is fatal to the crawler, the sink just moves on to the
    /// next candidate.
    pub async fn run(self, deadline: Duration) -> Result<Metadata, Error> {
        match tokio::time::timeout(deadline, self.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExpired),
        }
    }

    async fn fetch(self) -> Result<Metadata, Error> {
        let mut stream = self.dial().await?;

        let wire_hash = self.info_hash.truncated();

        bt_handshake(&mut stream, &wire_hash, &self.peer_id).await?;
        let extensions = extension_handshake(&mut stream).await?;
        request_all_pieces(&mut stream, extensions).await?;
        let metadata_bytes = self.assemble(&mut stream, extensions).await?;

        // Done with the transfer; free the file descriptor before the
        // CPU-bound tail so a busy sink does not run out of sockets.
        drop(stream);

        let digest_matches = match self.info_hash {
            InfoHash::V1(expected) => Sha1::digest(&metadata_bytes)[..] == expected,
            InfoHash::V2(expected) => Sha256::digest(&metadata_bytes)[..] == expected,
        };
        if !digest_matches {
            return Err(Error::InfoHashMismatch);
        }

        let discovered_on = i64::try_from(CurrentClock::now().as_secs()).unwrap_or(i64::MAX);

        Ok(parse_info(&metadata_bytes, self.info_hash, discovered_on)?)
    }

    async fn dial(&self) -> Result<TcpStream, Error> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(self.peer_addr))
            .await
            .map_err(|_| Error::DialTimeout)?
            .map_err(|source| Error::Dial { source })?;

        // Discard unsent bytes on close; every session ends with a close and
        // nothing after the metadata matters.
        stream.set_linger(Some(Duration::ZERO))?;
        stream.set_nodelay(true)?;

        Ok(stream)
    }

    /// Reads extension messages until the metadata is complete, harvesting
    /// PEX gossip on the side.
    async fn assemble(&self, stream: &mut TcpStream, extensions: RemoteExtensions) -> Result<Vec<u8>, Error> {
        let mut metadata = vec![0u8; extensions.metadata_size];
        let mut received: usize = 0;

        while received < extensions.metadata_size {
            let message = read_extension_message(stream).await?;

            match message[1] {
                LOCAL_UT_METADATA => {
                    received = apply_piece(&mut metadata, received, &message[2..])?;
                }
                LOCAL_UT_PEX => self.harvest_pex(&message[2..]),
                _ => {}
            }
        }

        Ok(metadata)
    }

    /// Decodes a `ut_pex` message and forwards usable peers to the owner.
    fn harvest_pex(&self, payload: &[u8]) {
        let Ok(message) = serde_bencode::from_bytes::<PexMessage>(payload) else {
            return;
        };

        let mut peers = Vec::new();
        collect_pex_peers(&message.added, 6, &mut peers);
        collect_pex_peers(&message.added6, 18, &mut peers);

        if peers.is_empty() {
            return;
        }

        if let Some(on_peers) = &self.on_peers {
            on_peers(self.info_hash, peers);
        }
    }
}

/// Applies one `ut_metadata` message to the buffer and returns the new
/// received count.
fn apply_piece(metadata: &mut [u8], received: usize, payload: &[u8]) -> Result<usize, Error> {
    let header_len = bencoded_prefix_len(payload).ok_or(Error::BadPieceMessage)?;
    let header: PieceHeader = serde_bencode::from_bytes(&payload[..header_len]).map_err(|_| Error::BadPieceMessage)?;

    match header.msg_type {
        2 => return Err(Error::MetadataRejected),
        1 => {}
        // A request (or anything else) from the remote; nothing to do.
        _ => return Ok(received),
    }

    let piece_data = &payload[header_len..];

    // BEP 9: a piece may only be shorter than 16 KiB if it is the last
    // piece; never longer.
    if piece_data.len() > PIECE_SIZE {
        return Err(Error::OversizedPiece);
    }

    let offset = usize::try_from(header.piece)
        .ok()
        .and_then(|piece| piece.checked_mul(PIECE_SIZE))
        .ok_or(Error::PieceOutOfBounds)?;

    let end = offset.checked_add(piece_data.len()).ok_or(Error::PieceOutOfBounds)?;
    if end > metadata.len() {
        return Err(Error::PieceOutOfBounds);
    }

    metadata[offset..end].copy_from_slice(piece_data);
    let received = received + piece_data.len();

    if piece_data.len() < PIECE_SIZE && received != metadata.len() {
        return Err(Error::ShortPiece);
    }

    if received > metadata.len() {
        return Err(Error::PieceOutOfBounds);
    }

    Ok(received)
}

/// Parses concatenated compact PEX tuples of a fixed width, skipping peers
/// with port 0 and ragged blobs.
fn collect_pex_peers(blob: &[u8], width: usize, peers: &mut Vec<SocketAddr>) {
    if blob.len() % width != 0 {
        return;
    }

    for tuple in blob.chunks(width) {
        let ip: IpAddr = if width == 6 {
            Ipv4Addr::from(<[u8; 4]>::try_from(&tuple[..4]).unwrap()).into()
        } else {
            Ipv6Addr::from(<[u8; 16]>::try_from(&tuple[..16]).unwrap()).into()
        };
        let port = u16::from_be_bytes([tuple[width - 2], tuple[width - 1]]);

        if port == 0 {
            continue;
        }

        peers.push(SocketAddr::new(ip, port));
    }
}

/// Exchanges the 68-byte base handshake and checks the reply.
async fn bt_handshake(stream: &mut TcpStream, wire_hash: &[u8; 20], peer_id: &PeerId) -> Result<(), Error> {
    let mut handshake = [0u8; 68];
    handshake[0] = 19;
    handshake[1..20].copy_from_slice(b"BitTorrent protocol");
    handshake[25] = 0x10; // extension protocol (BEP 10)
    handshake[27] = 0x01; // FastExt, advertised but unused
    handshake[28..48].copy_from_slice(wire_hash);
    handshake[48..68].copy_from_slice(peer_id.bytes());

    stream.write_all(&handshake).await?;

    let mut reply = [0u8; 68];
    stream.read_exact(&mut reply).await?;

    if !reply.starts_with(b"\x13BitTorrent protocol") {
        return Err(Error::CorruptHandshake);
    }

    if reply[28..48] != wire_hash[..] {
        return Err(Error::HandshakeInfoHashMismatch);
    }

    if reply[25] & 0x10 == 0 {
        return Err(Error::ExtensionProtocolUnsupported);
    }

    Ok(())
}

/// Sends our extension handshake and digests the remote's.
async fn extension_handshake(stream: &mut TcpStream) -> Result<RemoteExtensions, Error> {
    stream.write_all(EXTENSION_HANDSHAKE).await?;

    let message = read_extension_message(stream).await?;

    // The extension handshake has extension message id 0.
    if message[1] != 0 {
        return Err(Error::NotAnExtensionHandshake);
    }

    let handshake: ExtensionHandshake =
        serde_bencode::from_bytes(&message[2..]).map_err(|source| Error::BadExtensionHandshake { source })?;

    let max = i64::try_from(MAX_METADATA_SIZE).expect("the cap fits an i64");
    if handshake.metadata_size <= 0 || handshake.metadata_size >= max {
        return Err(Error::MetadataSizeOutOfRange {
            size: handshake.metadata_size,
        });
    }

    if handshake.m.ut_metadata <= 0 || handshake.m.ut_metadata >= 255 {
        return Err(Error::UtMetadataIdOutOfRange {
            id: handshake.m.ut_metadata,
        });
    }

    Ok(RemoteExtensions {
        ut_metadata: u8::try_from(handshake.m.ut_metadata).expect("the range was just checked"),
        metadata_size: usize::try_from(handshake.metadata_size).expect("the range was just checked"),
    })
}

/// Requests every metadata piece up front; no windowing, the pieces are
/// small and the session is short.
async fn request_all_pieces(stream: &mut TcpStream, extensions: RemoteExtensions) -> Result<(), Error> {
    let n_pieces = extensions.metadata_size.div_ceil(PIECE_SIZE);

    for piece in 0..n_pieces {
        let header = serde_bencode::to_bytes(&PieceHeader {
            msg_type: 0,
            piece: i64::try_from(piece).expect("the piece count is bounded by the size cap"),
        })
        .expect("the piece header should encode");

        let length = u32::try_from(2 + header.len()).expect("the frame is tiny");

        let mut frame = Vec::with_capacity(6 + header.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(20);
        frame.push(extensions.ut_metadata);
        frame.extend_from_slice(&header);

        stream.write_all(&frame).await?;
    }

    Ok(())
}

/// Reads the next full `BitTorrent` message, sans length prefix.
async fn read_message(stream: &mut TcpStream) -> Result<Vec<u8>, Error> {
    let mut length_bytes = [0u8; 4];
    stream.read_exact(&mut length_bytes).await?;

    let length = usize::try_from(u32::from_be_bytes(length_bytes)).expect("a u32 fits a usize");

    // A faulty or malicious peer announcing a giant message must not make
    // the crawler allocate.
    if length > MAX_METADATA_SIZE {
        return Err(Error::OversizedMessage);
    }

    let mut message = vec![0u8; length];
    stream.read_exact(&mut message).await?;

    Ok(message)
}

/// Reads messages until an extension message (id 20) arrives.
async fn read_extension_message(stream: &mut TcpStream) -> Result<Vec<u8>, Error> {
    loop {
        let message = read_message(stream).await?;

        // Every extension message has at least the two id bytes; anything
        // shorter (including keep-alives) is skipped.
        if message.len() >= 2 && message[0] == 20 {
            return Ok(message);
        }
    }
}

/// Length of the bencoded value starting at the beginning of `bytes`.
///
/// `ut_metadata` messages carry piece bytes immediately after their header
/// dictionary, so the header's extent has to be found before it can be
/// decoded.
fn bencoded_prefix_len(bytes: &[u8]) -> Option<usize> {
    fn value_end(bytes: &[u8], start: usize) -> Option<usize> {
        match bytes.get(start)? {
            b'i' => {
                let end = bytes[start..].iter().position(|byte| *byte == b'e')? + start;
                Some(end + 1)
            }
            b'l' | b'd' => {
                let mut cursor = start + 1;
                while *bytes.get(cursor)? != b'e' {
                    cursor = value_end(bytes, cursor)?;
                }
                Some(cursor + 1)
            }
            b'0'..=b'9' => {
                let colon = bytes[start..].iter().position(|byte| *byte == b':')? + start;
                let length: usize = std::str::from_utf8(&bytes[start..colon]).ok()?.parse().ok()?;
                let end = colon + 1 + length;
                (end <= bytes.len()).then_some(end)
            }
            _ => None,
        }
    }

    value_end(bytes, 0)
}
