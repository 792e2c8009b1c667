//! Snapshot image codec.
//!
//! The harness builds snapshots itself (every `snapshot_interval` committed
//! entries) and hands them to nodes as opaque bytes. Nodes hand the same
//! bytes back when they install a snapshot, or persist them for the next
//! restart. The harness decodes them to re-base a node's shadow log.
//!
//! ## Wire format
//!
//! A JSON sequence of the last included index followed by every entry from
//! index 0 through that index:
//!
//! ```text
//! [9, [null, "a", "b", 3, ...]]
//!  │   └── entries[0..=9]; entries[0] is always the null placeholder
//!  └────── last_included_index
//! ```
//!
//! Decoding failure or an empty payload is always reported, never ignored.

use std::sync::Arc;

use thiserror::Error;

use crate::types::{Command, LogIndex};

/// Error type for snapshot encoding and decoding.
///
/// The serde error is shared so failures can be cloned into every place
/// that reports them.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Failed to encode an image to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Arc<serde_json::Error>),
    /// Failed to decode bytes to an image.
    #[error("decode error: {0}")]
    Decode(#[source] Arc<serde_json::Error>),
}

impl PartialEq for CodecError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Encode(a), Self::Encode(b)) | (Self::Decode(a), Self::Decode(b)) => {
                a.to_string() == b.to_string()
            }
            _ => false,
        }
    }
}

impl Eq for CodecError {}

/// Decoded contents of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotImage {
    /// Last log index covered by the snapshot.
    pub last_included_index: LogIndex,
    /// Entries `0..=last_included_index`, position equals log index.
    pub entries: Vec<Command>,
}

impl SnapshotImage {
    /// Create an image from its parts.
    pub fn new(last_included_index: LogIndex, entries: Vec<Command>) -> Self {
        Self {
            last_included_index,
            entries,
        }
    }
}

/// Encode a snapshot image.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_snapshot(image: &SnapshotImage) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(&(image.last_included_index, &image.entries))
        .map_err(|e| CodecError::Encode(Arc::new(e)))
}

/// Decode a snapshot image.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] if the bytes are not a valid image.
pub fn decode_snapshot(data: &[u8]) -> Result<SnapshotImage, CodecError> {
    let (last_included_index, entries): (LogIndex, Vec<Command>) =
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(Arc::new(e)))?;
    Ok(SnapshotImage {
        last_included_index,
        entries,
    })
}
