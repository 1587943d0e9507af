//! Snapshot envelope: magic header + SHA-256 checksum + minimum size.
//!
//! Engines typically abort the process on malformed snapshot data, which
//! cannot be caught from Rust. Snapshot blobs handed to an environment are
//! therefore wrapped in an envelope that is validated before the payload
//! ever reaches the engine.
//!
//! The checksum is stored inline with the payload (rather than beside it) so
//! the two cannot go out of sync.
//!
//! Format: [magic (10 bytes)] [SHA-256 checksum (32 bytes)] [payload]

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const SNAPSHOT_MAGIC: &[u8] = b"ISOSNAP\x00v1";
const SNAPSHOT_HEADER_LEN: usize = 10 + 32; // magic (10) + SHA-256 checksum (32)

/// Smallest payload accepted. Real engine snapshots are never tiny; this
/// rejects truncated blobs before the checksum is even computed.
const MIN_SNAPSHOT_PAYLOAD: usize = 64;

fn sha256_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// An enveloped snapshot and the hex digest identifying its content.
pub struct WrappedSnapshot {
    pub data: Vec<u8>,
    pub content_hash: String,
}

/// Wrap a raw engine snapshot in the validated envelope.
pub fn wrap(payload: &[u8]) -> WrappedSnapshot {
    let hash = sha256_hash(payload);
    let mut data = Vec::with_capacity(SNAPSHOT_HEADER_LEN + payload.len());
    data.extend_from_slice(SNAPSHOT_MAGIC);
    data.extend_from_slice(&hash);
    data.extend_from_slice(payload);
    let content_hash = hash.iter().map(|b| format!("{:02x}", b)).collect();
    WrappedSnapshot { data, content_hash }
}

/// Validate an envelope and return the raw payload.
pub fn unwrap(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < SNAPSHOT_HEADER_LEN {
        return Err(Error::Snapshot("data too small".to_string()));
    }
    if &data[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(Error::Snapshot("missing magic header".to_string()));
    }
    let stored_checksum: [u8; 32] = data[SNAPSHOT_MAGIC.len()..SNAPSHOT_HEADER_LEN]
        .try_into()
        .expect("header slice is 32 bytes");
    let payload = &data[SNAPSHOT_HEADER_LEN..];
    if payload.len() < MIN_SNAPSHOT_PAYLOAD {
        return Err(Error::Snapshot("payload too small".to_string()));
    }
    if sha256_hash(payload) != stored_checksum {
        return Err(Error::Snapshot("checksum mismatch".to_string()));
    }
    Ok(payload.to_vec())
}
