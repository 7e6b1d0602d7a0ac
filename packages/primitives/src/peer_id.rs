//! The identity the crawler presents to `BitTorrent` peers.
use rand::Rng;

/// Number of bytes in a `BitTorrent` peer id.
pub const PEER_ID_BYTES_LEN: usize = 20;

/// Azureus-style client prefix: `-` + client code + four version digits + `-`.
const PREFIX: &[u8; 8] = b"-MG0100-";

/// The 20-byte peer id sent in the `BitTorrent` base handshake.
///
/// Uses the Azureus-style convention: a fixed client/version prefix followed
/// by random ASCII digits, so that remote clients can classify us while each
/// process remains distinguishable.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct PeerId([u8; PEER_ID_BYTES_LEN]);

impl PeerId {
    /// Generates a peer id with a fresh random suffix.
    #[must_use]
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; PEER_ID_BYTES_LEN];

        bytes[..PREFIX.len()].copy_from_slice(PREFIX);
        for byte in &mut bytes[PREFIX.len()..] {
            *byte = rng.gen_range(b'0'..=b'9');
        }

        Self(bytes)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8; PEER_ID_BYTES_LEN] {
        &self.0
    }
}

impl From<[u8; PEER_ID_BYTES_LEN]> for PeerId {
    fn from(bytes: [u8; PEER_ID_BYTES_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::{PeerId, PREFIX};

    #[test]
    fn it_should_carry_the_azureus_style_prefix() {
        let peer_id = PeerId::random();

        assert_eq!(&peer_id.bytes()[..8], PREFIX);
    }

    #[test]
    fn the_random_suffix_should_be_ascii_digits() {
        let peer_id = PeerId::random();

        assert!(peer_id.bytes()[8..].iter().all(u8::is_ascii_digit));
    }
}
