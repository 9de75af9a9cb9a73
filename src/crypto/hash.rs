//! `SHA-256` digests, used to fingerprint published artifacts.

use sodiumoxide::crypto::hash::sha256;

use super::ByteObject;

/// A `SHA-256` digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha256(sha256::Digest);

impl Sha256 {
    /// Hashes a single message.
    pub fn hash(message: &[u8]) -> Self {
        Self(sha256::hash(message))
    }

    /// Hashes the concatenation of `parts` without copying them into one buffer.
    pub fn hash_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut state = sha256::State::new();
        for part in parts {
            state.update(part);
        }
        Self(state.finalize())
    }
}

impl ByteObject for Sha256 {
    const LENGTH: usize = sha256::DIGESTBYTES;

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        sha256::Digest::from_slice(bytes).map(Self)
    }
}
