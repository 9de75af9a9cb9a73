//! The coordinator ties the ledger, the aggregator and the model registry together.
//!
//! Rounds are opened against the active model version. Closing a round freezes its accepted set
//! under the ledger lock of that round only; the aggregation itself runs afterwards without any
//! ledger lock held, so ingestion into other rounds goes on while a round is aggregated.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    aggregator::{AggregationOutcome, Aggregator, AggregatorError, ValidationFailure},
    common::{lock, Clock, RoundId, Version},
    crypto::{EncryptKeyPair, PublicEncryptKey, PublicSigningKey, SigningKeyPair},
    ledger::{IdentityProvider, Ledger, LedgerError, RoundState, Submission, SubmitOutcome},
    registry::{ModelRegistry, ModelStorage, RegistryError, SignedPackage},
    settings::{AggregationSettings, CompressionSettings, LedgerSettings},
};

/// The server side key pairs. They are never interchanged.
#[derive(Debug, Clone)]
pub struct ServerKeyMaterial {
    /// Decrypts contributions. Only the aggregator holds it.
    pub encryption: EncryptKeyPair,
    /// Signs published model versions. Only the registry holds it.
    pub signing: SigningKeyPair,
}

impl ServerKeyMaterial {
    pub fn generate() -> Self {
        Self {
            encryption: EncryptKeyPair::generate(),
            signing: SigningKeyPair::generate(),
        }
    }
}

/// Everything a client needs to produce a contribution for a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundParameters {
    pub round_id: RoundId,
    pub base_version: Version,
    pub schema_version: String,
    /// The number of model parameters, which is also the length of a delta.
    pub model_length: usize,
    /// The key contributions are encrypted for.
    pub server_key: PublicEncryptKey,
    pub grace_deadline: DateTime<Utc>,
    pub compression: CompressionSettings,
}

/// How a round ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// A new model version was published from the round.
    Published(Version),
    /// The round produced nothing, either because its quorum was not reached in time or because
    /// no contribution could be decrypted.
    Discarded,
    /// The aggregate was rejected. The active version is unchanged.
    ValidationFailed(ValidationFailure),
}

/// Errors of the coordinator.
#[derive(Debug, Display, Error)]
pub enum CoordinatorError {
    /// ledger operation failed: {0}
    Ledger(#[from] LedgerError),
    /// registry operation failed: {0}
    Registry(#[from] RegistryError),
    /// aggregator could not be created: {0}
    Aggregator(#[from] AggregatorError),
    /// round {round_id} on version {base_version} is still in progress
    RoundInProgress {
        base_version: Version,
        round_id: RoundId,
    },
}

/// The coordinator settings.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub ledger: LedgerSettings,
    pub compression: CompressionSettings,
    pub aggregation: AggregationSettings,
}

/// The server side of the aggregation protocol.
pub struct Coordinator<S> {
    settings: CoordinatorSettings,
    ledger: Ledger,
    aggregator: Aggregator,
    registry: Arc<ModelRegistry<S>>,
    clock: Arc<dyn Clock>,
    opening: Mutex<()>,
}

impl<S> Coordinator<S>
where
    S: ModelStorage + 'static,
{
    /// Creates a coordinator on top of a registry.
    ///
    /// The registry must have been opened with `keys.signing`.
    pub fn new(
        settings: CoordinatorSettings,
        encryption: EncryptKeyPair,
        registry: Arc<ModelRegistry<S>>,
        identities: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoordinatorError> {
        let aggregator = Aggregator::new(encryption, settings.aggregation)?;
        let ledger = Ledger::new(registry.clone(), identities, clock.clone());
        Ok(Self {
            settings,
            ledger,
            aggregator,
            registry,
            clock,
            opening: Mutex::new(()),
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn registry(&self) -> &ModelRegistry<S> {
        &self.registry
    }

    /// The trust anchor clients verify model packages against.
    pub fn trust_anchor(&self) -> PublicSigningKey {
        self.registry.public_key()
    }

    /// Opens a round against the active model version.
    ///
    /// # Errors
    /// Fails with [`CoordinatorError::RoundInProgress`] while another round on the active version
    /// is open or closing.
    pub fn open_round(&self) -> Result<RoundId, CoordinatorError> {
        let _guard = lock(&self.opening);
        let base = self.registry.get_active()?;
        if let Some(round_id) = self.ledger.round_on_base(base.version) {
            return Err(CoordinatorError::RoundInProgress {
                base_version: base.version,
                round_id,
            });
        }
        let round_id = self.ledger.open_round(
            base.version,
            self.settings.ledger.min_clients,
            self.settings.ledger.grace_period(),
        )?;
        Ok(round_id)
    }

    /// The most recently opened round that still accepts contributions.
    pub fn current_round(&self) -> Option<RoundId> {
        let now = self.clock.now();
        self.ledger
            .rounds_in_state(RoundState::Open)
            .into_iter()
            .rev()
            .find(|id| {
                self.ledger
                    .round(*id)
                    .map_or(false, |round| !round.is_expired(now))
            })
    }

    /// The parameters of a round as handed out to clients.
    pub fn round_parameters(&self, round_id: RoundId) -> Result<RoundParameters, CoordinatorError> {
        let round = self
            .ledger
            .round(round_id)
            .ok_or(LedgerError::RoundNotFound(round_id))?;
        let base = self.registry.get(round.base_version)?;
        Ok(RoundParameters {
            round_id,
            base_version: round.base_version,
            schema_version: round.schema_version,
            model_length: base.parameters.len(),
            server_key: *self.aggregator.public_key(),
            grace_deadline: round.grace_deadline,
            compression: self.settings.compression,
        })
    }

    /// Submits a signed contribution to its round.
    pub fn submit_contribution(&self, submission: Submission) -> SubmitOutcome {
        self.ledger.submit(submission)
    }

    /// Closes a round, aggregates it and publishes the result.
    ///
    /// The round ends up either aggregated or discarded. A failed publication leaves the active
    /// version unchanged.
    pub fn finalize_round(&self, round_id: RoundId) -> Result<RoundOutcome, CoordinatorError> {
        let closed = self.ledger.close_round(round_id)?;
        if closed.discarded {
            return Ok(RoundOutcome::Discarded);
        }

        let result = self
            .registry
            .get(closed.round.base_version)
            .map_err(CoordinatorError::from)
            .and_then(|base| match self.aggregator.aggregate(&closed, &base) {
                AggregationOutcome::NewParameters { parameters, .. } => {
                    let package = self.registry.publish(parameters, Some(round_id), None)?;
                    Ok(RoundOutcome::Published(package.version))
                }
                AggregationOutcome::ValidationFailed(reason) => {
                    error!("round {} failed validation: {}", round_id, reason);
                    Ok(RoundOutcome::ValidationFailed(reason))
                }
                AggregationOutcome::Discarded => Ok(RoundOutcome::Discarded),
            });

        match &result {
            Ok(RoundOutcome::Published(_)) => self.ledger.mark_aggregated(round_id)?,
            _ => self.ledger.mark_discarded(round_id)?,
        }
        result
    }

    /// Finalizes every open round that reached its quorum or whose deadline passed.
    pub fn poll(&self) -> Vec<(RoundId, RoundOutcome)> {
        let now = self.clock.now();
        let mut outcomes = Vec::new();
        for round_id in self.ledger.rounds_in_state(RoundState::Open) {
            let due = self.ledger.quorum_reached(round_id)
                || self
                    .ledger
                    .round(round_id)
                    .map_or(false, |round| round.is_expired(now));
            if !due {
                continue;
            }
            match self.finalize_round(round_id) {
                Ok(outcome) => {
                    info!("round {} finished: {:?}", round_id, outcome);
                    outcomes.push((round_id, outcome));
                }
                // the round may have been finalized concurrently
                Err(CoordinatorError::Ledger(LedgerError::RoundNotOpen(_))) => {}
                Err(err) => error!("failed to finalize round {}: {}", round_id, err),
            }
        }
        self.ledger.prune();
        outcomes
    }

    /// Publishes a new version carrying the parameters of `target`.
    pub fn rollback(&self, target: Version) -> Result<SignedPackage, CoordinatorError> {
        Ok(self.registry.rollback(target)?)
    }

    /// The active model version.
    pub fn active_model(&self) -> Result<SignedPackage, CoordinatorError> {
        Ok(self.registry.get_active()?)
    }
}

/// Polls the coordinator until `shutdown` fires.
///
/// Polling blocks on aggregation, so every poll runs on the blocking thread-pool.
pub async fn run_poller<S>(coordinator: Arc<Coordinator<S>>, mut shutdown: oneshot::Receiver<()>)
where
    S: ModelStorage + 'static,
{
    let mut interval = tokio::time::interval(coordinator.settings.ledger.poll_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let coordinator = coordinator.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || coordinator.poll()).await {
                    error!("round polling panicked: {}", err);
                }
            }
            _ = &mut shutdown => {
                info!("round polling stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        common::{testutils::ManualClock, ClientId},
        compression::compress,
        ledger::{ClientRegistry, RejectReason},
        registry::MemoryStore,
    };

    struct Fixture {
        coordinator: Arc<Coordinator<MemoryStore>>,
        clock: Arc<ManualClock>,
        clients: Vec<(ClientId, SigningKeyPair)>,
    }

    fn settings(min_clients: usize, max_delta_norm: f64) -> CoordinatorSettings {
        CoordinatorSettings {
            ledger: LedgerSettings {
                min_clients,
                grace_period: 60,
                poll_interval: 10,
            },
            compression: CompressionSettings {
                top_k_fraction: 1.0,
                bits: 32,
            },
            aggregation: AggregationSettings {
                max_delta_norm,
                threads: 2,
            },
        }
    }

    fn fixture(min_clients: usize, max_delta_norm: f64) -> Fixture {
        let keys = ServerKeyMaterial::generate();
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(
            ModelRegistry::open(MemoryStore::new(), keys.signing, "1.0", clock.clone()).unwrap(),
        );
        registry.bootstrap(vec![10.0, 10.0, 10.0]).unwrap();

        let identities = Arc::new(ClientRegistry::new());
        let clients = (0..4)
            .map(|i| {
                let id = ClientId::new(format!("client-{}", i));
                let keys = SigningKeyPair::generate();
                identities.register(id.clone(), keys.public);
                (id, keys)
            })
            .collect();
        let coordinator = Coordinator::new(
            settings(min_clients, max_delta_norm),
            keys.encryption,
            registry,
            identities,
            clock.clone(),
        )
        .unwrap();
        Fixture {
            coordinator: Arc::new(coordinator),
            clock,
            clients,
        }
    }

    impl Fixture {
        fn contribute(&self, client: usize, round_id: RoundId, delta: &[f32]) -> SubmitOutcome {
            let params = self.coordinator.round_parameters(round_id).unwrap();
            let sparse = compress(
                delta,
                params.compression.top_k_fraction,
                params.compression.bits,
            )
            .unwrap();
            let (id, keys) = &self.clients[client];
            let submission = Submission::sign(
                id.clone(),
                round_id,
                params.server_key.encrypt_for_server(&sparse.to_bytes()),
                params.schema_version,
                &keys.secret,
            );
            self.coordinator.submit_contribution(submission)
        }
    }

    #[test]
    fn test_round_parameters() {
        let f = fixture(2, 100.0);
        let round_id = f.coordinator.open_round().unwrap();
        let params = f.coordinator.round_parameters(round_id).unwrap();
        assert_eq!(params.base_version, 0);
        assert_eq!(params.model_length, 3);
        assert_eq!(params.schema_version, "1.0");
        assert_eq!(f.coordinator.current_round(), Some(round_id));
        assert!(matches!(
            f.coordinator.round_parameters(99),
            Err(CoordinatorError::Ledger(LedgerError::RoundNotFound(99)))
        ));
    }

    #[test]
    fn test_full_round() {
        let f = fixture(2, 100.0);
        let round_id = f.coordinator.open_round().unwrap();
        assert_eq!(f.contribute(0, round_id, &[1.0, 0.0, -1.0]), SubmitOutcome::Accepted);
        assert_eq!(f.contribute(1, round_id, &[3.0, 2.0, 1.0]), SubmitOutcome::Accepted);

        assert_eq!(
            f.coordinator.finalize_round(round_id).unwrap(),
            RoundOutcome::Published(1)
        );
        let active = f.coordinator.active_model().unwrap();
        assert_eq!(active.version, 1);
        assert_eq!(active.base_round, Some(round_id));
        assert_eq!(active.parameters, vec![12.0, 11.0, 10.0]);
        assert!(active.verify(&f.coordinator.trust_anchor()));
        assert_eq!(
            f.coordinator.ledger().round(round_id).unwrap().state,
            RoundState::Aggregated
        );
        assert_eq!(
            f.contribute(2, round_id, &[0.0, 0.0, 0.0]),
            SubmitOutcome::Rejected(RejectReason::RoundNotOpen)
        );
    }

    #[test]
    fn test_discard_on_timeout_keeps_active_version() {
        let f = fixture(2, 100.0);
        let before = f.coordinator.active_model().unwrap();
        let round_id = f.coordinator.open_round().unwrap();
        f.contribute(0, round_id, &[1.0, 1.0, 1.0]);

        assert!(f.coordinator.poll().is_empty());
        f.clock.advance(Duration::seconds(61));
        assert_eq!(f.coordinator.current_round(), None);
        assert_eq!(
            f.coordinator.poll(),
            vec![(round_id, RoundOutcome::Discarded)]
        );
        assert_eq!(f.coordinator.active_model().unwrap(), before);
        // finished rounds are pruned
        assert!(f.coordinator.ledger().round(round_id).is_none());
    }

    #[test]
    fn test_poll_finalizes_rounds_with_quorum() {
        let f = fixture(2, 100.0);
        let round_id = f.coordinator.open_round().unwrap();
        f.contribute(0, round_id, &[1.0, 1.0, 1.0]);
        f.contribute(1, round_id, &[1.0, 1.0, 1.0]);
        assert_eq!(
            f.coordinator.poll(),
            vec![(round_id, RoundOutcome::Published(1))]
        );
        assert_eq!(
            f.coordinator.active_model().unwrap().parameters,
            vec![11.0, 11.0, 11.0]
        );
    }

    #[test]
    fn test_validation_failure_keeps_active_version() {
        let f = fixture(1, 1.0);
        let before = f.coordinator.active_model().unwrap();
        let round_id = f.coordinator.open_round().unwrap();
        f.contribute(0, round_id, &[5.0, 5.0, 5.0]);
        assert!(matches!(
            f.coordinator.finalize_round(round_id).unwrap(),
            RoundOutcome::ValidationFailed(ValidationFailure::NormExceeded { .. })
        ));
        assert_eq!(f.coordinator.active_model().unwrap(), before);
        assert_eq!(
            f.coordinator.ledger().round(round_id).unwrap().state,
            RoundState::Discarded
        );
    }

    #[test]
    fn test_one_round_per_base_version() {
        let f = fixture(1, 100.0);
        let first = f.coordinator.open_round().unwrap();
        assert!(matches!(
            f.coordinator.open_round(),
            Err(CoordinatorError::RoundInProgress {
                base_version: 0,
                round_id,
            }) if round_id == first
        ));
        assert_eq!(
            f.coordinator.ledger().rounds_in_state(RoundState::Open),
            vec![first]
        );

        f.contribute(0, first, &[5.0, 5.0, 5.0]);
        assert_eq!(
            f.coordinator.finalize_round(first).unwrap(),
            RoundOutcome::Published(1)
        );
        // the next round builds on the published version
        let second = f.coordinator.open_round().unwrap();
        assert_eq!(f.coordinator.ledger().round(second).unwrap().base_version, 1);
        f.contribute(0, second, &[1.0, 1.0, 1.0]);
        assert_eq!(
            f.coordinator.finalize_round(second).unwrap(),
            RoundOutcome::Published(2)
        );
        assert_eq!(
            f.coordinator.active_model().unwrap().parameters,
            vec![16.0, 16.0, 16.0]
        );
        assert!(matches!(
            f.coordinator.finalize_round(first),
            Err(CoordinatorError::Ledger(LedgerError::RoundNotOpen(_)))
        ));
    }

    #[test]
    fn test_concurrent_rounds_on_different_versions() {
        let f = fixture(1, 100.0);
        let first = f.coordinator.open_round().unwrap();
        f.contribute(0, first, &[1.0, 1.0, 1.0]);

        // a rollback moves the active version while the first round is still open
        f.coordinator.rollback(0).unwrap();
        let second = f.coordinator.open_round().unwrap();
        assert_eq!(f.coordinator.ledger().round(first).unwrap().base_version, 0);
        assert_eq!(f.coordinator.ledger().round(second).unwrap().base_version, 1);
        assert_eq!(
            f.coordinator.ledger().rounds_in_state(RoundState::Open),
            vec![first, second]
        );

        f.contribute(0, second, &[2.0, 2.0, 2.0]);
        assert_eq!(
            f.coordinator.finalize_round(second).unwrap(),
            RoundOutcome::Published(2)
        );
        assert_eq!(
            f.coordinator.finalize_round(first).unwrap(),
            RoundOutcome::Published(3)
        );
    }

    #[test]
    fn test_rollback() {
        let f = fixture(1, 100.0);
        let round_id = f.coordinator.open_round().unwrap();
        f.contribute(0, round_id, &[1.0, 1.0, 1.0]);
        f.coordinator.finalize_round(round_id).unwrap();

        let restored = f.coordinator.rollback(0).unwrap();
        assert_eq!(restored.version, 2);
        assert_eq!(restored.rollback_of, Some(0));
        assert_eq!(restored.parameters, vec![10.0, 10.0, 10.0]);
        assert!(matches!(
            f.coordinator.rollback(9),
            Err(CoordinatorError::Registry(RegistryError::TargetVersionNotFound(9)))
        ));
    }

    #[tokio::test]
    async fn test_poller() {
        let f = fixture(1, 100.0);
        let round_id = f.coordinator.open_round().unwrap();
        f.contribute(0, round_id, &[1.0, 1.0, 1.0]);

        let (tx, rx) = oneshot::channel();
        let poller = tokio::spawn(run_poller(f.coordinator.clone(), rx));
        for _ in 0..100 {
            if f.coordinator.registry().active_version() == Some(1) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(f.coordinator.registry().active_version(), Some(1));
        tx.send(()).unwrap();
        poller.await.unwrap();
    }
}
