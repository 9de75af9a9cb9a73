use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    common::{canonical_bytes, ClientId, RoundId},
    crypto::{HybridCiphertext, SecretSigningKey, Signature},
};

const CONTRIBUTION_DOMAIN: &[u8] = b"fedagg/contribution/v1";

#[derive(Serialize)]
struct SignedFields<'a> {
    client_id: &'a ClientId,
    round_id: RoundId,
    encrypted_payload: &'a HybridCiphertext,
    schema_version: &'a str,
}

/// The canonical encoding of the fields a client signs.
pub fn signing_bytes(
    client_id: &ClientId,
    round_id: RoundId,
    encrypted_payload: &HybridCiphertext,
    schema_version: &str,
) -> Vec<u8> {
    canonical_bytes(
        CONTRIBUTION_DOMAIN,
        &SignedFields {
            client_id,
            round_id,
            encrypted_payload,
            schema_version,
        },
    )
}

/// A signed contribution as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub client_id: ClientId,
    pub round_id: RoundId,
    pub encrypted_payload: HybridCiphertext,
    pub signature: Signature,
    pub schema_version: String,
}

impl Submission {
    /// Signs the given fields with the client's secret key.
    pub fn sign(
        client_id: ClientId,
        round_id: RoundId,
        encrypted_payload: HybridCiphertext,
        schema_version: String,
        sk: &SecretSigningKey,
    ) -> Self {
        let signature = sk.sign_detached(&signing_bytes(
            &client_id,
            round_id,
            &encrypted_payload,
            &schema_version,
        ));
        Self {
            client_id,
            round_id,
            encrypted_payload,
            signature,
            schema_version,
        }
    }

    pub(crate) fn signing_bytes(&self) -> Vec<u8> {
        signing_bytes(
            &self.client_id,
            self.round_id,
            &self.encrypted_payload,
            &self.schema_version,
        )
    }
}

/// A contribution accepted by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientContribution {
    pub client_id: ClientId,
    pub round_id: RoundId,
    pub encrypted_payload: HybridCiphertext,
    pub signature: Signature,
    pub schema_version: String,
    pub received_at: DateTime<Utc>,
}

impl ClientContribution {
    pub(crate) fn new(submission: Submission, received_at: DateTime<Utc>) -> Self {
        let Submission {
            client_id,
            round_id,
            encrypted_payload,
            signature,
            schema_version,
        } = submission;
        Self {
            client_id,
            round_id,
            encrypted_payload,
            signature,
            schema_version,
            received_at,
        }
    }
}

/// The key under which at most one contribution is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContributionKey {
    pub client_id: ClientId,
    pub round_id: RoundId,
}

/// Why a contribution was not accepted.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The signature did not verify, or the client is unknown.
    #[display(fmt = "authentication or decryption failed")]
    AuthenticationOrDecryption,
    /// The contribution was produced for another schema.
    #[display(fmt = "schema mismatch")]
    SchemaMismatch,
    /// The round does not exist or already ended.
    #[display(fmt = "round not open")]
    RoundNotOpen,
    /// The round stopped accepting contributions.
    #[display(fmt = "round closed")]
    RoundClosed,
}

/// The result of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    /// The contribution was stored.
    Accepted,
    /// A contribution of this client was already accepted for this round. Nothing changed.
    Duplicate,
    Rejected(RejectReason),
}

impl SubmitOutcome {
    /// Whether the ledger holds a contribution of the client after the submission.
    pub fn is_success(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted | SubmitOutcome::Duplicate)
    }
}
