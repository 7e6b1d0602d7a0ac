//! The identifier of a torrent's info dictionary.
use std::panic::Location;

use thiserror::Error;

/// Number of bytes in a v1 (SHA-1) infohash.
pub const INFO_HASH_V1_BYTES_LEN: usize = 20;

/// Number of bytes in a v2 (SHA-256, BEP 52) infohash.
pub const INFO_HASH_V2_BYTES_LEN: usize = 32;

/// `BitTorrent` infohash: the digest of a torrent's info dictionary.
///
/// Either 20 bytes (SHA-1, v1) or 32 bytes (SHA-256, v2 per BEP 52).
/// Equality is byte equality; the hex form is only used at boundaries
/// (display, storage, notifications).
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub enum InfoHash {
    /// A 20-byte SHA-1 infohash.
    V1([u8; INFO_HASH_V1_BYTES_LEN]),
    /// A 32-byte SHA-256 infohash (BEP 52).
    V2([u8; INFO_HASH_V2_BYTES_LEN]),
}

impl InfoHash {
    /// Returns the raw bytes of the infohash.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            InfoHash::V1(bytes) => bytes,
            InfoHash::V2(bytes) => bytes,
        }
    }

    /// Returns the number of bytes of the infohash (20 or 32).
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The 20-byte form used on the `BitTorrent` TCP wire.
    ///
    /// v2 peers still exchange the truncated digest in the base handshake, so
    /// a v2 infohash is cut down to its first 20 bytes.
    #[must_use]
    pub fn truncated(&self) -> [u8; INFO_HASH_V1_BYTES_LEN] {
        let mut wire = [0u8; INFO_HASH_V1_BYTES_LEN];
        wire.copy_from_slice(&self.bytes()[..INFO_HASH_V1_BYTES_LEN]);
        wire
    }

    /// Returns the infohash as a hex string.
    #[must_use]
    pub fn to_hex_string(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut chars = [0u8; INFO_HASH_V2_BYTES_LEN * 2];
        let hex = binascii::bin2hex(self.bytes(), &mut chars).expect("the buffer fits both digest sizes");
        write!(f, "{}", std::str::from_utf8(hex).unwrap())
    }
}

impl std::str::FromStr for InfoHash {
    type Err = binascii::ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            40 => {
                let mut bytes = [0u8; INFO_HASH_V1_BYTES_LEN];
                binascii::hex2bin(s.as_bytes(), &mut bytes)?;
                Ok(InfoHash::V1(bytes))
            }
            64 => {
                let mut bytes = [0u8; INFO_HASH_V2_BYTES_LEN];
                binascii::hex2bin(s.as_bytes(), &mut bytes)?;
                Ok(InfoHash::V2(bytes))
            }
            _ => Err(binascii::ConvertError::InvalidInputLength),
        }
    }
}

impl From<[u8; INFO_HASH_V1_BYTES_LEN]> for InfoHash {
    fn from(bytes: [u8; INFO_HASH_V1_BYTES_LEN]) -> Self {
        InfoHash::V1(bytes)
    }
}

impl From<[u8; INFO_HASH_V2_BYTES_LEN]> for InfoHash {
    fn from(bytes: [u8; INFO_HASH_V2_BYTES_LEN]) -> Self {
        InfoHash::V2(bytes)
    }
}

/// Errors that can occur when converting from a byte slice to an [`InfoHash`].
#[derive(Error, Debug)]
pub enum ConversionError {
    /// The slice is neither 20 nor 32 bytes long.
    #[error("invalid number of bytes for infohash: {message} {location}")]
    InvalidLength {
        location: &'static Location<'static>,
        message: String,
    },
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = ConversionError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        match bytes.len() {
            INFO_HASH_V1_BYTES_LEN => {
                let mut data = [0u8; INFO_HASH_V1_BYTES_LEN];
                data.copy_from_slice(bytes);
                Ok(InfoHash::V1(data))
            }
            INFO_HASH_V2_BYTES_LEN => {
                let mut data = [0u8; INFO_HASH_V2_BYTES_LEN];
                data.copy_from_slice(bytes);
                Ok(InfoHash::V2(data))
            }
            len => Err(ConversionError::InvalidLength {
                location: Location::caller(),
                message: format! {"got {len} bytes, expected {INFO_HASH_V1_BYTES_LEN} or {INFO_HASH_V2_BYTES_LEN}"},
            }),
        }
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = ConversionError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        InfoHash::try_from(bytes.as_slice())
    }
}

impl serde::ser::Serialize for InfoHash {
    fn serialize<S: serde::ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::de::Deserialize<'de> for InfoHash {
    fn deserialize<D: serde::de::Deserializer<'de>>(des: D) -> Result<Self, D::Error> {
        des.deserialize_str(InfoHashVisitor)
    }
}

struct InfoHashVisitor;

impl serde::de::Visitor<'_> for InfoHashVisitor {
    type Value = InfoHash;

    fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "a 40 or 64 character long hex string")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(|_| {
            serde::de::Error::invalid_value(serde::de::Unexpected::Str(v), &"a 40 or 64 character long hex string")
        })
    }
}
