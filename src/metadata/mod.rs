//! The TCP side of the crawler: fetching and describing torrent metadata.
//!
//! - [`leech`]: one short-lived TCP session per (infohash, peer) that pulls
//!   the raw info dictionary via `ut_metadata` (BEP 9/10).
//! - [`sink`]: the dispatcher that bounds concurrency, de-duplicates active
//!   fetches and retries against alternate peers.
//!
//! This module holds the [`Metadata`] record the crawler produces and the
//! decoding of the torrent info dictionary into it.
use magpie_primitives::info_hash::InfoHash;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

pub mod leech;
pub mod sink;

#[cfg(test)]
pub(crate) mod test_peer;

/// One file described by a torrent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TorrentFile {
    /// Display path: the torrent name joined with the file's path
    /// components.
    pub path: String,
    pub size: i64,
}

/// A fully fetched and verified torrent description.
///
/// Immutable once emitted. `files` always holds at least one entry:
/// single-file torrents are normalised into a one-element list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub info_hash: InfoHash,
    /// The "title": the file name for single-file torrents, the root
    /// directory name for multi-file ones.
    pub name: String,
    pub total_size: u64,
    /// Unix seconds at which the crawler completed the fetch.
    pub discovered_on: i64,
    pub files: Vec<TorrentFile>,
}

/// Why an info dictionary was rejected.
#[derive(Error, Debug)]
pub enum InfoError {
    #[error("the info dictionary does not decode: {source}")]
    Decode {
        #[from]
        source: serde_bencode::Error,
    },

    #[error("pieces has invalid length")]
    RaggedPieces,

    #[error("zero piece length with a nonzero total length")]
    ZeroPieceLength,

    #[error("piece count and file lengths are at odds")]
    PieceCountMismatch,

    #[error("file size less than zero")]
    NegativeFileSize,
}

/// The torrent info dictionary, as found on the wire.
#[derive(Deserialize, Debug)]
struct TorrentInfo {
    /// Present for multi-file torrents only.
    #[serde(default)]
    files: Option<Vec<InfoFile>>,

    /// Present for single-file torrents only.
    #[serde(default)]
    length: Option<i64>,

    name: String,

    #[serde(rename = "piece length", default)]
    piece_length: i64,

    /// Concatenated 20-byte SHA-1 piece digests.
    #[serde(default)]
    pieces: ByteBuf,
}

#[derive(Deserialize, Debug)]
struct InfoFile {
    length: i64,
    path: Vec<String>,
}

impl TorrentInfo {
    fn total_length(&self) -> i64 {
        match &self.files {
            Some(files) => files.iter().map(|file| file.length).sum(),
            None => self.length.unwrap_or(0),
        }
    }

    fn num_pieces(&self) -> i64 {
        i64::try_from(self.pieces.len() / 20).expect("the piece count fits an i64")
    }

    fn validate(&self) -> Result<(), InfoError> {
        if !self.pieces.is_empty() && self.pieces.len() % 20 != 0 {
            return Err(InfoError::RaggedPieces);
        }

        if self.piece_length == 0 {
            if self.total_length() != 0 {
                return Err(InfoError::ZeroPieceLength);
            }
        } else if !self.pieces.is_empty()
            && (self.total_length() + self.piece_length - 1) / self.piece_length != self.num_pieces()
        {
            return Err(InfoError::PieceCountMismatch);
        }

        Ok(())
    }
}

/// Decodes and validates an info dictionary, producing the torrent name and
/// its normalised file list.
///
/// # Errors
///
/// Will return `Err` on undecodable input, inconsistent piece accounting or
/// a negative file size.
pub fn parse_info(bytes: &[u8], info_hash: InfoHash, discovered_on: i64) -> Result<Metadata, InfoError> {
    let info: TorrentInfo = serde_bencode::from_bytes(bytes)?;

    info.validate()?;

    // A single-file torrent has no `files` list; synthesise the one entry so
    // consumers never special-case it.
    let files: Vec<TorrentFile> = match &info.files {
        None => vec![TorrentFile {
            path: info.name.clone(),
            size: info.length.unwrap_or(0),
        }],
        Some(listed) => listed
            .iter()
            .map(|file| TorrentFile {
                path: display_path(&info.name, &file.path),
                size: file.length,
            })
            .collect(),
    };

    let mut total_size: u64 = 0;
    for file in &files {
        let size = u64::try_from(file.size).map_err(|_| InfoError::NegativeFileSize)?;
        total_size = total_size.saturating_add(size);
    }

    Ok(Metadata {
        info_hash,
        name: info.name,
        total_size,
        discovered_on,
        files,
    })
}

/// The display path of a file in a multi-file torrent: the torrent name
/// followed by the path components.
fn display_path(name: &str, components: &[String]) -> String {
    let mut path = String::from(name);
    for component in components {
        path.push('/');
        path.push_str(component);
    }
    path
}
