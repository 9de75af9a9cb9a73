//! The client update producer.
//!
//! A producer turns a local model delta into a signed, encrypted contribution for the current
//! round and delivers it through a [`CoordinatorClient`]. Transport failures are retried with
//! bounded exponential backoff; answers of the coordinator, including rejections, are final.

mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use futures_retry::FutureRetry;
use thiserror::Error;

pub use self::retry::{Backoff, RetryPolicy};
use crate::{
    common::ClientId,
    compression::{compress, CompressionError},
    coordinator::{Coordinator, RoundParameters},
    crypto::{PublicSigningKey, SigningKeyPair},
    ledger::{Submission, SubmitOutcome},
    registry::{InstallError, InstallOutcome, LocalModel, ModelStorage, SignedPackage},
    settings::RetrySettings,
};

/// An error of the transport between a producer and the coordinator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("coordinator unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("no round is open")]
    NoOpenRound,
    #[error("coordinator failed: {0}")]
    Internal(String),
}

/// The transport a producer talks to the coordinator through.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Retrieves the parameters of the current round.
    async fn round_parameters(&self) -> Result<RoundParameters, TransportError>;

    /// Delivers a signed contribution.
    async fn submit(&self, submission: Submission) -> Result<SubmitOutcome, TransportError>;

    /// Retrieves the active model package, if the registry is bootstrapped.
    async fn active_model(&self) -> Result<Option<SignedPackage>, TransportError>;
}

/// Errors of the update producer.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("delta has {actual} entries but the model has {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("compression failed: {0}")]
    Compression(#[from] CompressionError),
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: TransportError },
    #[error("no model has been published yet")]
    NoModel,
    #[error("model installation refused: {0}")]
    Install(#[from] InstallError),
}

/// Produces and delivers the contributions of one client.
pub struct UpdateProducer<C> {
    client_id: ClientId,
    keys: SigningKeyPair,
    trust_anchor: PublicSigningKey,
    retry: RetrySettings,
    client: C,
}

impl<C> UpdateProducer<C>
where
    C: CoordinatorClient,
{
    pub fn new(
        client_id: ClientId,
        keys: SigningKeyPair,
        trust_anchor: PublicSigningKey,
        retry: RetrySettings,
        client: C,
    ) -> Self {
        Self {
            client_id,
            keys,
            trust_anchor,
            retry,
            client,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Compresses, encrypts and signs a delta for the given round.
    ///
    /// # Errors
    /// Fails if the delta does not match the model length or cannot be compressed.
    pub fn prepare(
        &self,
        params: &RoundParameters,
        delta: &[f32],
    ) -> Result<Submission, ProducerError> {
        if delta.len() != params.model_length {
            return Err(ProducerError::DimensionMismatch {
                expected: params.model_length,
                actual: delta.len(),
            });
        }
        let sparse = compress(
            delta,
            params.compression.top_k_fraction,
            params.compression.bits,
        )?;
        let mut plaintext = sparse.to_bytes();
        let encrypted_payload = params.server_key.encrypt_for_server(&plaintext);
        sodiumoxide::utils::memzero(&mut plaintext);
        Ok(Submission::sign(
            self.client_id.clone(),
            params.round_id,
            encrypted_payload,
            params.schema_version.clone(),
            &self.keys.secret,
        ))
    }

    /// Delivers a delta to the current round.
    ///
    /// Returns the answer of the coordinator. A [`SubmitOutcome::Rejected`] answer is not
    /// retried: the caller decides whether to recompute against a newer round.
    ///
    /// # Errors
    /// Fails if the delta cannot be prepared or the coordinator stays unreachable.
    pub async fn submit(&self, delta: &[f32]) -> Result<SubmitOutcome, ProducerError> {
        let params = self
            .with_retry("fetching round parameters", || self.client.round_parameters())
            .await?;
        let submission = self.prepare(&params, delta)?;
        let outcome = self
            .with_retry("submitting contribution", || {
                self.client.submit(submission.clone())
            })
            .await?;
        match outcome {
            SubmitOutcome::Rejected(reason) => warn!(
                "contribution of {} to round {} rejected: {}",
                self.client_id, params.round_id, reason
            ),
            _ => info!(
                "contribution of {} to round {} delivered",
                self.client_id, params.round_id
            ),
        }
        Ok(outcome)
    }

    /// Downloads the active model and installs it if it verifies.
    pub async fn fetch_model(&self, local: &LocalModel) -> Result<InstallOutcome, ProducerError> {
        let package = self
            .with_retry("fetching the active model", || self.client.active_model())
            .await?
            .ok_or(ProducerError::NoModel)?;
        Ok(local.verify_and_install(package, &self.trust_anchor)?)
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, request: F) -> Result<T, ProducerError>
    where
        F: FnMut() -> Fut + Unpin,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        let mut policy = RetryPolicy::new(self.retry);
        let result = FutureRetry::new(request, |err: TransportError| match policy.on_failure() {
            Backoff::Retry(delay) => {
                debug!("{} failed ({}), retrying in {:?}", what, err, delay);
                futures_retry::RetryPolicy::WaitRetry(delay)
            }
            Backoff::GiveUp => {
                warn!("{} failed {} times: {}", what, policy.failures(), err);
                futures_retry::RetryPolicy::ForwardError(err)
            }
        })
        .await;
        result
            .map(|(value, _)| value)
            .map_err(|(last, _)| ProducerError::RetriesExhausted {
                attempts: policy.failures(),
                last,
            })
    }
}

/// A [`CoordinatorClient`] calling a coordinator in the same process.
pub struct InMemoryClient<S> {
    coordinator: Arc<Coordinator<S>>,
}

impl<S> InMemoryClient<S> {
    pub fn new(coordinator: Arc<Coordinator<S>>) -> Self {
        Self { coordinator }
    }
}

impl<S> Clone for InMemoryClient<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

#[async_trait]
impl<S> CoordinatorClient for InMemoryClient<S>
where
    S: ModelStorage + 'static,
{
    async fn round_parameters(&self) -> Result<RoundParameters, TransportError> {
        let round_id = self
            .coordinator
            .current_round()
            .ok_or(TransportError::NoOpenRound)?;
        self.coordinator
            .round_parameters(round_id)
            .map_err(|err| TransportError::Internal(err.to_string()))
    }

    async fn submit(&self, submission: Submission) -> Result<SubmitOutcome, TransportError> {
        Ok(self.coordinator.submit_contribution(submission))
    }

    async fn active_model(&self) -> Result<Option<SignedPackage>, TransportError> {
        Ok(self.coordinator.active_model().ok())
    }
}
