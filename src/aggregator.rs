//! Aggregation of the contributions of a closed round.
//!
//! Contributions are decrypted and decompressed on a `rayon` thread-pool, since this is the
//! CPU-intensive part of a round. Contributions that fail to decrypt, to decode or that do not
//! match the model dimension are excluded from the round; they never abort it.
//!
//! The deltas are averaged in `f64` in client id order so that aggregating the same round twice
//! yields bit-identical parameters.

use std::sync::Arc;

use displaydoc::Display;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use sodiumoxide::utils::memzero;
use thiserror::Error;
use zeroize::Zeroize;

use crate::{
    common::ClientId,
    compression::{decompress, SparseQuantized},
    crypto::{EncryptKeyPair, PublicEncryptKey},
    ledger::{ClientContribution, ClosedRound},
    registry::ModelVersion,
    settings::AggregationSettings,
};

/// Why an aggregate was not published.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq)]
pub enum ValidationFailure {
    /// norm {norm} of the averaged delta exceeds the bound {max}
    NormExceeded { norm: f64, max: f64 },
    /// aggregated parameter at index {index} is not finite
    NonFinite { index: usize },
}

/// The result of aggregating a round.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationOutcome {
    /// The new global parameters, `base + mean(deltas)`.
    NewParameters {
        parameters: Vec<f32>,
        /// The L2 norm of the averaged delta.
        mean_delta_norm: f64,
        /// The clients whose contributions were aggregated, in ascending order.
        contributors: Vec<ClientId>,
    },
    /// The aggregate failed validation and must not be published.
    ValidationFailed(ValidationFailure),
    /// No contribution survived decryption and decoding.
    Discarded,
}

/// Errors of the aggregator construction.
#[derive(Debug, Error)]
#[error("failed to build the decryption thread-pool: {0}")]
pub struct AggregatorError(#[from] rayon::ThreadPoolBuildError);

/// Decrypts, decompresses and averages the contributions of closed rounds.
pub struct Aggregator {
    keys: EncryptKeyPair,
    max_delta_norm: f64,
    thread_pool: Arc<ThreadPool>,
}

impl Aggregator {
    /// Creates an aggregator owning the server decryption keys.
    ///
    /// # Errors
    /// Fails if the thread-pool cannot be built.
    pub fn new(keys: EncryptKeyPair, settings: AggregationSettings) -> Result<Self, AggregatorError> {
        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(settings.threads)
            .thread_name(|i| format!("fedagg-decrypt-{}", i))
            .build()?;
        Ok(Self::with_thread_pool(
            keys,
            settings.max_delta_norm,
            Arc::new(thread_pool),
        ))
    }

    pub fn with_thread_pool(
        keys: EncryptKeyPair,
        max_delta_norm: f64,
        thread_pool: Arc<ThreadPool>,
    ) -> Self {
        Self {
            keys,
            max_delta_norm,
            thread_pool,
        }
    }

    /// The public key clients encrypt their contributions for.
    pub fn public_key(&self) -> &PublicEncryptKey {
        &self.keys.public
    }

    /// Aggregates the contributions of a closed round on top of its base model.
    pub fn aggregate(&self, closed: &ClosedRound, base: &ModelVersion) -> AggregationOutcome {
        let round_id = closed.round.round_id;
        if closed.discarded {
            return AggregationOutcome::Discarded;
        }
        let dim = base.parameters.len();

        let deltas: Vec<Option<Vec<f32>>> = self.thread_pool.install(|| {
            closed
                .contributions
                .par_iter()
                .map(|contribution| self.open(contribution, dim))
                .collect()
        });

        let mut contributors = Vec::new();
        let mut sum = vec![0_f64; dim];
        for (contribution, delta) in closed.contributions.iter().zip(deltas) {
            let mut delta = match delta {
                Some(delta) => delta,
                None => {
                    warn!(
                        "excluding contribution of {} from round {}",
                        contribution.client_id, round_id
                    );
                    continue;
                }
            };
            accumulate(&mut sum, &mut delta);
            contributors.push(contribution.client_id.clone());
        }

        if contributors.is_empty() {
            info!("round {}: no contribution survived decryption", round_id);
            return AggregationOutcome::Discarded;
        }

        let n = contributors.len() as f64;
        let mean: Vec<f64> = sum.iter().map(|s| s / n).collect();
        let mean_delta_norm = mean.iter().map(|d| d * d).sum::<f64>().sqrt();
        if !(mean_delta_norm <= self.max_delta_norm) {
            warn!(
                "round {}: norm {} of the averaged delta exceeds {}",
                round_id, mean_delta_norm, self.max_delta_norm
            );
            return AggregationOutcome::ValidationFailed(ValidationFailure::NormExceeded {
                norm: mean_delta_norm,
                max: self.max_delta_norm,
            });
        }

        let parameters: Vec<f32> = base
            .parameters
            .iter()
            .zip(mean.iter())
            .map(|(b, d)| (f64::from(*b) + d) as f32)
            .collect();
        if let Some(index) = parameters.iter().position(|p| !p.is_finite()) {
            warn!("round {}: parameter {} is not finite", round_id, index);
            return AggregationOutcome::ValidationFailed(ValidationFailure::NonFinite { index });
        }

        info!(
            "round {}: aggregated {} of {} contributions",
            round_id,
            contributors.len(),
            closed.contributions.len()
        );
        AggregationOutcome::NewParameters {
            parameters,
            mean_delta_norm,
            contributors,
        }
    }

    /// Decrypts and decodes a single contribution.
    fn open(&self, contribution: &ClientContribution, dim: usize) -> Option<Vec<f32>> {
        let mut plaintext = self
            .keys
            .secret
            .decrypt_from_client(&contribution.encrypted_payload, &self.keys.public)
            .ok()?;
        let decoded = SparseQuantized::from_bytes(&plaintext);
        memzero(&mut plaintext);
        let mut sparse = match decoded {
            Ok(sparse) => sparse,
            Err(err) => {
                debug!("contribution of {} is malformed: {}", contribution.client_id, err);
                return None;
            }
        };
        let delta = if sparse.dim as usize == dim {
            decompress(&sparse).ok()
        } else {
            debug!(
                "contribution of {} has dimension {} instead of {}",
                contribution.client_id, sparse.dim, dim
            );
            None
        };
        sparse.zeroize();
        delta
    }
}

/// Adds `delta` to `sum` and wipes `delta`.
fn accumulate(sum: &mut [f64], delta: &mut [f32]) {
    for (acc, value) in sum.iter_mut().zip(delta.iter()) {
        *acc += f64::from(*value);
    }
    delta.zeroize();
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        compression::compress,
        crypto::SigningKeyPair,
        ledger::{Round, RoundState},
    };

    fn base(parameters: Vec<f32>) -> ModelVersion {
        ModelVersion::sign(
            0,
            parameters,
            "1.0".to_string(),
            None,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            None,
            &SigningKeyPair::generate().secret,
        )
    }

    fn contribution(keys: &EncryptKeyPair, client: &str, plaintext: &[u8]) -> ClientContribution {
        let signer = SigningKeyPair::generate();
        ClientContribution {
            client_id: ClientId::from(client),
            round_id: 1,
            encrypted_payload: keys.public.encrypt_for_server(plaintext),
            signature: signer.secret.sign_detached(b"unused"),
            schema_version: "1.0".to_string(),
            received_at: Utc::now(),
        }
    }

    fn delta(keys: &EncryptKeyPair, client: &str, delta: &[f32]) -> ClientContribution {
        contribution(keys, client, &compress(delta, 1.0, 32).unwrap().to_bytes())
    }

    fn closed(contributions: Vec<ClientContribution>) -> ClosedRound {
        ClosedRound {
            round: Round {
                round_id: 1,
                base_version: 0,
                schema_version: "1.0".to_string(),
                opened_at: Utc::now(),
                grace_deadline: Utc::now(),
                min_clients: 1,
                state: RoundState::Closing,
            },
            contributions,
            discarded: false,
        }
    }

    fn aggregator(keys: &EncryptKeyPair, max_delta_norm: f64) -> Aggregator {
        Aggregator::new(
            keys.clone(),
            AggregationSettings {
                max_delta_norm,
                threads: 2,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_aggregation_arithmetic() {
        let keys = EncryptKeyPair::generate();
        let round = closed(vec![
            delta(&keys, "a", &[1.0, 0.0, -1.0]),
            delta(&keys, "b", &[3.0, 2.0, 1.0]),
        ]);
        match aggregator(&keys, 100.0).aggregate(&round, &base(vec![10.0, 10.0, 10.0])) {
            AggregationOutcome::NewParameters {
                parameters,
                contributors,
                mean_delta_norm,
            } => {
                assert_eq!(parameters, vec![12.0, 11.0, 10.0]);
                assert_eq!(contributors, vec![ClientId::from("a"), ClientId::from("b")]);
                assert!((mean_delta_norm - 5_f64.sqrt()).abs() < 1e-9);
            }
            outcome => panic!("unexpected outcome {:?}", outcome),
        }
    }

    #[test]
    fn test_deterministic() {
        let keys = EncryptKeyPair::generate();
        let round = closed(vec![
            delta(&keys, "a", &[0.1, 0.2, 0.3]),
            delta(&keys, "b", &[0.7, -0.2, 0.05]),
            delta(&keys, "c", &[-0.3, 0.9, 0.0]),
        ]);
        let base = base(vec![1.0, 2.0, 3.0]);
        let aggregator = aggregator(&keys, 100.0);
        assert_eq!(
            aggregator.aggregate(&round, &base),
            aggregator.aggregate(&round, &base)
        );
    }

    #[test]
    fn test_failed_contributions_are_excluded() {
        let keys = EncryptKeyPair::generate();
        let other = EncryptKeyPair::generate();
        let mut tampered = delta(&keys, "c", &[9.0, 9.0, 9.0]);
        tampered.encrypted_payload.auth_tag[0] ^= 1;
        let round = closed(vec![
            delta(&keys, "a", &[2.0, 2.0, 2.0]),
            delta(&other, "b", &[9.0, 9.0, 9.0]),
            tampered,
            contribution(&keys, "d", b"not a sparse vector"),
            delta(&keys, "e", &[9.0, 9.0]),
        ]);
        match aggregator(&keys, 100.0).aggregate(&round, &base(vec![0.0, 0.0, 0.0])) {
            AggregationOutcome::NewParameters {
                parameters,
                contributors,
                ..
            } => {
                assert_eq!(parameters, vec![2.0, 2.0, 2.0]);
                assert_eq!(contributors, vec![ClientId::from("a")]);
            }
            outcome => panic!("unexpected outcome {:?}", outcome),
        }
    }

    #[test]
    fn test_no_surviving_contribution() {
        let keys = EncryptKeyPair::generate();
        let other = EncryptKeyPair::generate();
        let round = closed(vec![delta(&other, "a", &[1.0])]);
        assert_eq!(
            aggregator(&keys, 100.0).aggregate(&round, &base(vec![0.0])),
            AggregationOutcome::Discarded
        );
        assert_eq!(
            aggregator(&keys, 100.0).aggregate(&closed(vec![]), &base(vec![0.0])),
            AggregationOutcome::Discarded
        );
    }

    #[test]
    fn test_norm_bound() {
        let keys = EncryptKeyPair::generate();
        let round = closed(vec![delta(&keys, "a", &[3.0, 4.0])]);
        assert_eq!(
            aggregator(&keys, 4.9).aggregate(&round, &base(vec![0.0, 0.0])),
            AggregationOutcome::ValidationFailed(ValidationFailure::NormExceeded {
                norm: 5.0,
                max: 4.9,
            })
        );
        assert!(matches!(
            aggregator(&keys, 5.0).aggregate(&round, &base(vec![0.0, 0.0])),
            AggregationOutcome::NewParameters { .. }
        ));
    }

    #[test]
    fn test_accumulate_wipes_delta() {
        let mut sum = vec![1.0, 1.0];
        let mut delta = vec![0.5_f32, -2.0];
        accumulate(&mut sum, &mut delta);
        assert_eq!(sum, vec![1.5, -1.0]);
        assert_eq!(delta, vec![0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_result() {
        let keys = EncryptKeyPair::generate();
        let round = closed(vec![delta(&keys, "a", &[f32::MAX, 0.0])]);
        assert_eq!(
            aggregator(&keys, f64::INFINITY).aggregate(&round, &base(vec![f32::MAX, 0.0])),
            AggregationOutcome::ValidationFailed(ValidationFailure::NonFinite { index: 0 })
        );
    }
}
