//! Wrappers around the [sodiumoxide] primitives used by every other component.
//!
//! Two key pairs with distinct trust scopes exist and are represented by distinct types:
//! - `X25519` [`EncryptKeyPair`]s, used by clients to encrypt contributions for the aggregator
//!   (hybrid encryption: a fresh `XSalsa20-Poly1305` key wrapped in a sealed box).
//! - `Ed25519` [`SigningKeyPair`]s, used by clients to authenticate contributions and by the
//!   model registry to sign published artifacts.
//!
//! # Examples
//! ## Hybrid encryption of a payload
//! ```
//! # use fedagg::crypto::EncryptKeyPair;
//! let keys = EncryptKeyPair::generate();
//! let payload = b"compressed delta".to_vec();
//! let cipher = keys.public.encrypt_for_server(&payload);
//! assert_eq!(payload, keys.secret.decrypt_from_client(&cipher, &keys.public).unwrap());
//! ```
//!
//! ## Signing of messages
//! ```
//! # use fedagg::crypto::SigningKeyPair;
//! let keys = SigningKeyPair::generate();
//! let message = b"Hello world!".to_vec();
//! let signature = keys.secret.sign_detached(&message);
//! assert!(keys.public.verify_detached(&signature, &message));
//! ```
//!
//! [sodiumoxide]: https://docs.rs/sodiumoxide/

pub(crate) mod encrypt;
pub(crate) mod hash;
pub(crate) mod sign;

use thiserror::Error;

pub use self::{
    encrypt::{EncryptKeyPair, HybridCiphertext, PublicEncryptKey, SecretEncryptKey},
    hash::Sha256,
    sign::{PublicSigningKey, SecretSigningKey, Signature, SigningKeyPair},
};

/// The error reported for every cryptographic failure.
///
/// Callers across a trust boundary never learn whether a signature, a wrapped key or an
/// authentication tag was at fault. The specific cause is only logged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("authentication or decryption failed")]
    AuthenticationOrDecryption,
}

#[derive(Error, Debug)]
#[error("initialization failed: the crypto library could not be initialized")]
/// An error related to the initialization of libsodium.
pub struct InitError;

/// Initializes libsodium. Safe to call several times.
pub fn init() -> Result<(), InitError> {
    sodiumoxide::init().map_err(|_| InitError)
}

/// An interface for slicing into cryptographic byte objects.
pub trait ByteObject: Sized {
    /// Length in bytes of this object
    const LENGTH: usize;

    /// Gets the object byte representation.
    fn as_slice(&self) -> &[u8];

    /// Creates an object from the given buffer.
    ///
    /// # Errors
    /// Returns `None` if the length of the byte-slice isn't equal to the length of the object.
    fn from_slice(bytes: &[u8]) -> Option<Self>;

    /// Encodes the object as a lowercase hexadecimal string.
    fn to_hex(&self) -> String {
        hex::encode(self.as_slice())
    }

    /// Decodes an object from a hexadecimal string, ignoring surrounding whitespace.
    fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s.trim())
            .ok()
            .and_then(|bytes| Self::from_slice(&bytes))
    }
}
