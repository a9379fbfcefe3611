//! Whole-machine snapshots
//!
//! The full `System` state (hart, CSRs, RAM, devices) is serialized with
//! bincode and compressed with zstd. A version word at the front guards
//! against restoring blobs from an incompatible build.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::system::System;

/// Bumped whenever the serialized layout of `System` changes.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("serialization failed: {0}")]
    Encode(bincode::Error),
    #[error("deserialization failed: {0}")]
    Decode(bincode::Error),
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
    #[error("snapshot version {found} does not match supported version {SNAPSHOT_VERSION}")]
    VersionMismatch { found: u32 },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    system: System,
}

/// Serialize a machine into a compressed snapshot blob.
pub fn save(system: &System) -> Result<Vec<u8>, SnapshotError> {
    #[derive(Serialize)]
    struct EnvelopeRef<'a> {
        version: u32,
        system: &'a System,
    }
    let serialized = bincode::serialize(&EnvelopeRef {
        version: SNAPSHOT_VERSION,
        system,
    })
    .map_err(SnapshotError::Encode)?;
    zstd::stream::encode_all(&serialized[..], 0).map_err(SnapshotError::Compress)
}

/// Rebuild a machine from a snapshot blob.
pub fn restore(data: &[u8]) -> Result<System, SnapshotError> {
    let decompressed = zstd::stream::decode_all(data).map_err(SnapshotError::Decompress)?;
    let envelope: Envelope =
        bincode::deserialize(&decompressed).map_err(SnapshotError::Decode)?;
    if envelope.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::VersionMismatch {
            found: envelope.version,
        });
    }
    Ok(envelope.system)
}
