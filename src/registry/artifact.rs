use std::{
    fs,
    io::{self, Read, Write},
    ops::Deref,
    path::Path,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    common::{canonical_bytes, RoundId, Version},
    crypto::{ByteObject, PublicSigningKey, SecretSigningKey, Sha256, Signature},
};

const ARTIFACT_DOMAIN: &[u8] = b"fedagg/model-version/v1";

/// An immutable, signed model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: Version,
    pub parameters: Vec<f32>,
    pub schema_version: String,
    /// The round the parameters were aggregated from, `None` for the bootstrap version and for
    /// rollbacks.
    pub base_round: Option<RoundId>,
    pub created_at: DateTime<Utc>,
    /// The version whose parameters this version restores.
    pub rollback_of: Option<Version>,
    /// The registry signature over the canonical encoding of all other fields.
    pub signature: Signature,
}

#[derive(Serialize)]
struct UnsignedArtifact<'a> {
    version: Version,
    parameters: &'a [f32],
    schema_version: &'a str,
    base_round: Option<RoundId>,
    created_at: i64,
    created_at_nanos: u32,
    rollback_of: Option<Version>,
}

fn artifact_bytes(
    version: Version,
    parameters: &[f32],
    schema_version: &str,
    base_round: Option<RoundId>,
    created_at: &DateTime<Utc>,
    rollback_of: Option<Version>,
) -> Vec<u8> {
    canonical_bytes(
        ARTIFACT_DOMAIN,
        &UnsignedArtifact {
            version,
            parameters,
            schema_version,
            base_round,
            created_at: created_at.timestamp(),
            created_at_nanos: created_at.timestamp_subsec_nanos(),
            rollback_of,
        },
    )
}

impl ModelVersion {
    /// Builds and signs an artifact.
    pub fn sign(
        version: Version,
        parameters: Vec<f32>,
        schema_version: String,
        base_round: Option<RoundId>,
        created_at: DateTime<Utc>,
        rollback_of: Option<Version>,
        sk: &SecretSigningKey,
    ) -> Self {
        let signature = sk.sign_detached(&artifact_bytes(
            version,
            &parameters,
            &schema_version,
            base_round,
            &created_at,
            rollback_of,
        ));
        Self {
            version,
            parameters,
            schema_version,
            base_round,
            created_at,
            rollback_of,
            signature,
        }
    }

    /// The canonical encoding the signature is computed over.
    pub fn signing_bytes(&self) -> Vec<u8> {
        artifact_bytes(
            self.version,
            &self.parameters,
            &self.schema_version,
            self.base_round,
            &self.created_at,
            self.rollback_of,
        )
    }

    /// Verifies the artifact signature against the registry public key.
    pub fn verify(&self, pk: &PublicSigningKey) -> bool {
        pk.verify_detached(&self.signature, &self.signing_bytes())
    }
}

#[derive(Debug, Error)]
/// An error related to exporting or importing a [`SignedPackage`].
pub enum PackageError {
    #[error("package I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("package encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A shareable handle on a published [`ModelVersion`].
///
/// This is what the registry hands out and what clients download, possibly through an
/// air-gapped transfer. Its authenticity only depends on the registry public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedPackage(Arc<ModelVersion>);

impl Deref for SignedPackage {
    type Target = ModelVersion;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<ModelVersion> for SignedPackage {
    fn from(version: ModelVersion) -> Self {
        Self(Arc::new(version))
    }
}

impl SignedPackage {
    /// Encodes the package as JSON.
    pub fn to_json(&self) -> Result<String, PackageError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Decodes a package from JSON. The signature is not checked.
    pub fn from_json(json: &str) -> Result<Self, PackageError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Writes the JSON encoding of the package.
    pub fn write_to(&self, mut writer: impl Write) -> Result<(), PackageError> {
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a JSON encoded package. The signature is not checked.
    pub fn read_from(mut reader: impl Read) -> Result<Self, PackageError> {
        let mut json = String::new();
        reader.read_to_string(&mut json)?;
        Self::from_json(&json)
    }

    /// Writes the package to a file.
    pub fn export(&self, path: impl AsRef<Path>) -> Result<(), PackageError> {
        self.write_to(io::BufWriter::new(fs::File::create(path)?))
    }

    /// Reads a package from a file. The signature is not checked.
    pub fn import(path: impl AsRef<Path>) -> Result<Self, PackageError> {
        Self::read_from(io::BufReader::new(fs::File::open(path)?))
    }

    /// The hex encoded SHA-256 digest of the signed artifact, for out of band comparison.
    pub fn fingerprint(&self) -> String {
        let bytes = self.signing_bytes();
        Sha256::hash_parts(vec![bytes.as_slice(), self.signature.as_slice()]).to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeyPair;

    fn package(keys: &SigningKeyPair) -> SignedPackage {
        ModelVersion::sign(
            3,
            vec![0.5, -1.25, 3.0e-7, 42.0],
            "1.0".to_string(),
            Some(7),
            Utc::now(),
            None,
            &keys.secret,
        )
        .into()
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = SigningKeyPair::generate();
        let package = package(&keys);
        assert!(package.verify(&keys.public));
        assert!(!package.verify(&SigningKeyPair::generate().public));
    }

    #[test]
    fn test_every_field_is_signed() {
        let keys = SigningKeyPair::generate();
        let original: ModelVersion = (*package(&keys)).clone();

        let mut tampered = original.clone();
        tampered.version += 1;
        assert!(!tampered.verify(&keys.public));

        let mut tampered = original.clone();
        tampered.parameters[1] = 1.25;
        assert!(!tampered.verify(&keys.public));

        let mut tampered = original.clone();
        tampered.schema_version = "2.0".to_string();
        assert!(!tampered.verify(&keys.public));

        let mut tampered = original.clone();
        tampered.base_round = None;
        assert!(!tampered.verify(&keys.public));

        let mut tampered = original.clone();
        tampered.created_at = tampered.created_at + chrono::Duration::nanoseconds(1);
        assert!(!tampered.verify(&keys.public));

        let mut tampered = original;
        tampered.rollback_of = Some(1);
        assert!(!tampered.verify(&keys.public));
    }

    #[test]
    fn test_json_export_keeps_signature_valid() {
        let keys = SigningKeyPair::generate();
        let package = package(&keys);

        let json = package.to_json().unwrap();
        let imported = SignedPackage::from_json(&json).unwrap();
        assert_eq!(imported, package);
        assert!(imported.verify(&keys.public));
        assert_eq!(imported.fingerprint(), package.fingerprint());

        let mut buffer = Vec::new();
        package.write_to(&mut buffer).unwrap();
        assert_eq!(SignedPackage::read_from(buffer.as_slice()).unwrap(), package);

        assert!(SignedPackage::from_json("{\"version\": 1}").is_err());
    }

    #[test]
    fn test_fingerprint_covers_the_signature() {
        let keys = SigningKeyPair::generate();
        let package = package(&keys);
        let mut forged = (*package).clone();
        forged.signature = keys.secret.sign_detached(b"something else");
        assert_ne!(SignedPackage::from(forged).fingerprint(), package.fingerprint());
    }
}
