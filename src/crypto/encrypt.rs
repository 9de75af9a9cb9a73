//! Hybrid encryption of client contributions.
//!
//! See the [crypto module] documentation since this is a private module anyways.
//!
//! [crypto module]: crate::crypto

use derive_more::{AsMut, AsRef, From};
use serde::{Deserialize, Serialize};
use sodiumoxide::{
    crypto::{box_, sealedbox, secretbox},
    utils::memzero,
};

use super::{ByteObject, CryptoError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A `X25519` key pair used to decrypt client contributions.
///
/// Only the aggregator holds the secret half.
pub struct EncryptKeyPair {
    /// The `X25519` public key.
    pub public: PublicEncryptKey,
    /// The `X25519` secret key.
    pub secret: SecretEncryptKey,
}

impl EncryptKeyPair {
    /// Generates a new random `X25519` key pair for encryption.
    pub fn generate() -> Self {
        let (pk, sk) = box_::gen_keypair();
        Self {
            public: PublicEncryptKey(pk),
            secret: SecretEncryptKey(sk),
        }
    }
}

/// The output of [`PublicEncryptKey::encrypt_for_server`].
///
/// The symmetric key only travels wrapped under the server's public key, so the plaintext can
/// only be recovered inside the aggregator's trust boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HybridCiphertext {
    /// The symmetric key, sealed for the server.
    pub wrapped_key: Vec<u8>,
    /// The nonce used with the symmetric key.
    pub nonce: Vec<u8>,
    /// The encrypted payload, without its authentication tag.
    pub ciphertext: Vec<u8>,
    /// The detached authentication tag of `ciphertext`.
    pub auth_tag: Vec<u8>,
}

impl HybridCiphertext {
    /// Total number of bytes carried by this ciphertext.
    pub fn len(&self) -> usize {
        self.wrapped_key.len() + self.nonce.len() + self.ciphertext.len() + self.auth_tag.len()
    }

    /// Whether the ciphertext carries no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(
    AsRef,
    AsMut,
    From,
    Serialize,
    Deserialize,
    Hash,
    Eq,
    Ord,
    PartialEq,
    Copy,
    Clone,
    PartialOrd,
    Debug,
)]
/// A `X25519` public key that clients encrypt their contributions for.
pub struct PublicEncryptKey(box_::PublicKey);

impl ByteObject for PublicEncryptKey {
    const LENGTH: usize = box_::PUBLICKEYBYTES;

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::PublicKey::from_slice(bytes).map(Self)
    }
}

impl PublicEncryptKey {
    /// Encrypts `plaintext` for the holder of the matching secret key.
    ///
    /// A fresh symmetric key and nonce are generated for every call. The plaintext is encrypted
    /// with `XSalsa20-Poly1305` and the key is sealed under this public key. The symmetric key
    /// is zeroed out when this function returns.
    pub fn encrypt_for_server(&self, plaintext: &[u8]) -> HybridCiphertext {
        let key = secretbox::gen_key();
        let nonce = secretbox::gen_nonce();
        let mut ciphertext = plaintext.to_vec();
        let tag = secretbox::seal_detached(&mut ciphertext, &nonce, &key);
        let wrapped_key = sealedbox::seal(key.as_ref(), self.as_ref());
        HybridCiphertext {
            wrapped_key,
            nonce: nonce.as_ref().to_vec(),
            ciphertext,
            auth_tag: tag.as_ref().to_vec(),
        }
    }
}

#[derive(AsRef, AsMut, From, Serialize, Deserialize, Eq, PartialEq, Clone, Debug)]
/// A `X25519` secret key for decrypting client contributions.
///
/// When this goes out of scope, its contents will be zeroed out.
pub struct SecretEncryptKey(box_::SecretKey);

impl SecretEncryptKey {
    /// Decrypts a [`HybridCiphertext`] using this secret key and the associated public key.
    ///
    /// # Errors
    /// Returns [`CryptoError::AuthenticationOrDecryption`] if the payload is malformed, the key
    /// cannot be unwrapped or the authentication tag does not match. No partial plaintext is
    /// ever returned.
    pub fn decrypt_from_client(
        &self,
        payload: &HybridCiphertext,
        pk: &PublicEncryptKey,
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = secretbox::Nonce::from_slice(&payload.nonce).ok_or_else(|| {
            debug!("decryption failed: invalid nonce length {}", payload.nonce.len());
            CryptoError::AuthenticationOrDecryption
        })?;
        let tag = secretbox::Tag::from_slice(&payload.auth_tag).ok_or_else(|| {
            debug!(
                "decryption failed: invalid tag length {}",
                payload.auth_tag.len()
            );
            CryptoError::AuthenticationOrDecryption
        })?;

        let mut key_bytes =
            sealedbox::open(&payload.wrapped_key, pk.as_ref(), self.as_ref()).map_err(|_| {
                debug!("decryption failed: the symmetric key could not be unwrapped");
                CryptoError::AuthenticationOrDecryption
            })?;
        let key = secretbox::Key::from_slice(&key_bytes);
        memzero(&mut key_bytes);
        let key = key.ok_or_else(|| {
            debug!("decryption failed: unwrapped key has an invalid length");
            CryptoError::AuthenticationOrDecryption
        })?;

        let mut plaintext = payload.ciphertext.clone();
        if secretbox::open_detached(&mut plaintext, &tag, &nonce, &key).is_err() {
            memzero(&mut plaintext);
            debug!("decryption failed: authentication tag mismatch");
            return Err(CryptoError::AuthenticationOrDecryption);
        }
        Ok(plaintext)
    }

    /// Computes the corresponding public key for this secret key.
    pub fn public_key(&self) -> PublicEncryptKey {
        PublicEncryptKey(self.0.public_key())
    }
}

impl ByteObject for SecretEncryptKey {
    const LENGTH: usize = box_::SECRETKEYBYTES;

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        box_::SecretKey::from_slice(bytes).map(Self)
    }
}
