//! A scripted `BitTorrent` peer, used to exercise fetch sessions over
//! localhost sockets.
use magpie_primitives::info_hash::InfoHash;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A single-file info dictionary large enough to span three metadata
/// pieces, with consistent piece accounting.
pub(crate) fn large_info_dict() -> Vec<u8> {
    let piece_count = 2000usize;
    let length = 16384 * piece_count;
    let pieces = vec![0x41u8; piece_count * 20];

    let mut bytes = Vec::new();
    bytes.extend_from_slice(format!("d6:lengthi{length}e4:name5:t.iso12:piece lengthi16384e").as_bytes());
    bytes.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
    bytes.extend_from_slice(&pieces);
    bytes.push(b'e');
    bytes
}

pub(crate) fn sha1_of(bytes: &[u8]) -> InfoHash {
    InfoHash::V1(Sha1::digest(bytes).into())
}

pub(crate) async fn accept(listener: TcpListener) -> TcpStream {
    listener.accept().await.unwrap().0
}

/// Replies to the 68-byte handshake, echoing the leech's infohash unless an
/// override is given.
pub(crate) async fn answer_bt_handshake(stream: &mut TcpStream, reserved_byte_25: u8, info_hash_override: Option<[u8; 20]>) {
    let mut inbound = [0u8; 68];
    stream.read_exact(&mut inbound).await.unwrap();
    assert_eq!(&inbound[..20], b"\x13BitTorrent protocol");
    assert_eq!(inbound[25] & 0x10, 0x10);

    let mut reply = [0u8; 68];
    reply.copy_from_slice(&inbound);
    reply[25] = reserved_byte_25;
    if let Some(info_hash) = info_hash_override {
        reply[28..48].copy_from_slice(&info_hash);
    }
    reply[48..68].copy_from_slice(b"-XX0000-001122334455");
    stream.write_all(&reply).await.unwrap();
}

/// Reads the leech's extension handshake and answers with the given
/// `metadata_size` and a remote `ut_metadata` id of 3.
pub(crate) async fn answer_extension_handshake(stream: &mut TcpStream, metadata_size: usize) {
    let mut length_bytes = [0u8; 4];
    stream.read_exact(&mut length_bytes).await.unwrap();
    let mut payload = vec![0u8; usize::try_from(u32::from_be_bytes(length_bytes)).unwrap()];
    stream.read_exact(&mut payload).await.unwrap();
    assert_eq!(payload[0], 20);
    assert_eq!(payload[1], 0);

    let dict = format!("d1:md11:ut_metadatai3e6:ut_pexi2ee13:metadata_sizei{metadata_size}ee");
    write_extension(stream, 0, dict.as_bytes()).await;
}

/// Frames and sends one extension message.
pub(crate) async fn write_extension(stream: &mut TcpStream, extension_id: u8, payload: &[u8]) {
    let length = u32::try_from(2 + payload.len()).unwrap();
    let mut frame = Vec::new();
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(20);
    frame.push(extension_id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
}

/// Reads the `n` piece requests the leech sends up front.
pub(crate) async fn read_piece_requests(stream: &mut TcpStream, n: usize) {
    for expected in 0..n {
        let mut length_bytes = [0u8; 4];
        stream.read_exact(&mut length_bytes).await.unwrap();
        let mut payload = vec![0u8; usize::try_from(u32::from_be_bytes(length_bytes)).unwrap()];
        stream.read_exact(&mut payload).await.unwrap();

        assert_eq!(payload[0], 20);
        assert_eq!(payload[1], 3); // the remote's ut_metadata id
        let expected_dict = format!("d8:msg_typei0e5:piecei{expected}ee");
        assert_eq!(&payload[2..], expected_dict.as_bytes());
    }
}

pub(crate) async fn send_piece(stream: &mut TcpStream, piece: usize, data: &[u8]) {
    let mut payload = format!("d8:msg_typei1e5:piecei{piece}ee").into_bytes();
    payload.extend_from_slice(data);
    write_extension(stream, 1, &payload).await;
}

/// The whole happy path: handshake, extension handshake, serve every piece
/// of [`large_info_dict`].
pub(crate) async fn serve_large_info_dict(listener: TcpListener) -> TcpStream {
    let info = large_info_dict();
    let size = info.len();

    let mut stream = accept(listener).await;
    answer_bt_handshake(&mut stream, 0x10, None).await;
    answer_extension_handshake(&mut stream, size).await;
    read_piece_requests(&mut stream, size.div_ceil(16384)).await;

    for (piece, chunk) in info.chunks(16384).enumerate() {
        send_piece(&mut stream, piece, chunk).await;
    }

    stream
}
