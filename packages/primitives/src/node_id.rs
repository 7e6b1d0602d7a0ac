//! The identifier of a node in the DHT routing overlay.
use rand::rngs::OsRng;
use rand::RngCore;

/// Number of bytes in a DHT node id.
pub const NODE_ID_BYTES_LEN: usize = 20;

/// The 20-byte identifier naming a node on the Mainline DHT.
///
/// The crawler generates its own id once at process start; remote ids are
/// opaque keys taken from validated KRPC messages.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct NodeId([u8; NODE_ID_BYTES_LEN]);

impl NodeId {
    /// Generates a fresh random node id.
    ///
    /// # Panics
    ///
    /// Panics if the OS random number generator fails. Token issuance and id
    /// generation are not safe to run with degraded randomness.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_BYTES_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8; NODE_ID_BYTES_LEN] {
        &self.0
    }
}

impl From<[u8; NODE_ID_BYTES_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_BYTES_LEN]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = std::array::TryFromSliceError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(<[u8; NODE_ID_BYTES_LEN]>::try_from(bytes)?))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut chars = [0u8; NODE_ID_BYTES_LEN * 2];
        let hex = binascii::bin2hex(&self.0, &mut chars).expect("the buffer fits the id");
        write!(f, "{}", std::str::from_utf8(hex).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::NodeId;

    #[test]
    fn it_should_be_built_from_a_20_byte_slice() {
        let id = NodeId::try_from([9u8; 20].as_slice()).unwrap();

        assert_eq!(id.bytes(), &[9u8; 20]);
    }

    #[test]
    fn it_should_reject_slices_of_the_wrong_length() {
        assert!(NodeId::try_from([9u8; 19].as_slice()).is_err());
    }

    #[test]
    fn two_random_ids_should_differ() {
        // A collision here is a 1 in 2^160 event.
        assert_ne!(NodeId::random(), NodeId::random());
    }
}
