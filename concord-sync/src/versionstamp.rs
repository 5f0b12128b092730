//! Causal comparison of server-issued versionstamps.
//!
//! A versionstamp is an opaque base64 cursor handed out by the relay. Its
//! leading bytes hold a fixed-width, big-endian commit version, so ordering
//! two stamps is a plain byte-wise compare of that prefix. Trailing bytes
//! (batch order inside one commit) are ignored.
//!
//! ```text
//! ┌─────────────────────────────┬─────────┐
//! │ commit version (9 bytes BE) │ user    │
//! └─────────────────────────────┴─────────┘
//! ```

use std::cmp::Ordering;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Number of leading bytes that take part in the comparison.
pub const COMPARED_BYTES: usize = 9;

/// Errors raised while decoding a versionstamp.
#[derive(Debug, thiserror::Error)]
pub enum VersionstampError {
    #[error("Versionstamp is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("Versionstamp is empty")]
    Empty,
}

/// A decoded versionstamp.
///
/// Equality and ordering only consider the compared prefix; shorter stamps
/// are zero-padded on the right.
#[derive(Debug, Clone)]
pub struct Versionstamp {
    raw: String,
    key: [u8; COMPARED_BYTES],
}

impl Versionstamp {
    /// Decode a base64 versionstamp as sent by the relay.
    pub fn parse(encoded: &str) -> Result<Self, VersionstampError> {
        if encoded.is_empty() {
            return Err(VersionstampError::Empty);
        }
        let bytes = STANDARD.decode(encoded)?;
        let mut key = [0u8; COMPARED_BYTES];
        for (slot, byte) in key.iter_mut().zip(bytes.iter()) {
            *slot = *byte;
        }
        Ok(Self {
            raw: encoded.to_string(),
            key,
        })
    }

    /// The encoded form, exactly as received.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `self` is strictly newer than `other`.
    pub fn is_newer_than(&self, other: &Versionstamp) -> bool {
        self.key > other.key
    }
}

impl PartialEq for Versionstamp {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Versionstamp {}

impl PartialOrd for Versionstamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Versionstamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Admission check for an inbound command.
///
/// A command is admitted only when it carries a stamp strictly newer than
/// the local one. A missing local stamp admits anything stamped; a missing
/// command stamp is never admitted.
pub fn admits(local: Option<&Versionstamp>, incoming: Option<&Versionstamp>) -> bool {
    match (local, incoming) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(local), Some(incoming)) => incoming.is_newer_than(local),
    }
}
