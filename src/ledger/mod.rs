//! The round and update ledger.
//!
//! The ledger owns the open rounds and the contributions accepted for them. Every round is
//! guarded by its own lock which protects both the round state and its accepted contributions,
//! so that accepting a contribution and closing the round are linearized: a contribution is
//! either part of the set handed to the aggregator or it was rejected, never both.
//!
//! Signatures are verified before the lock is taken. The round state is checked again under the
//! lock, which makes the verification cost invisible to concurrent submissions and closures.

mod contribution;
mod identity;
mod round;

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
        RwLock,
    },
};

use chrono::{DateTime, Duration, Utc};
use displaydoc::Display;
use thiserror::Error;

pub use self::{
    contribution::{
        signing_bytes,
        ClientContribution,
        ContributionKey,
        RejectReason,
        Submission,
        SubmitOutcome,
    },
    identity::{ClientRegistry, IdentityProvider},
    round::{Round, RoundState},
};
use crate::{
    common::{lock, read, write, ClientId, Clock, RoundId, Version},
    crypto::{HybridCiphertext, Signature},
};

/// Errors of the round management operations.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// base version {0} does not exist
    BaseVersionNotFound(Version),
    /// round {0} does not exist
    RoundNotFound(RoundId),
    /// round {0} is not open
    RoundNotOpen(RoundId),
    /// a round needs at least one client
    InvalidQuorum,
    /// round {round_id} cannot move from {from} to {to}
    InvalidTransition {
        round_id: RoundId,
        from: RoundState,
        to: RoundState,
    },
}

/// Read access to the published model versions, as needed to open rounds.
pub trait VersionCatalog: Send + Sync {
    /// Returns the schema of a published version, or `None` if the version does not exist.
    fn schema_version(&self, version: Version) -> Option<String>;
}

/// A round whose accepted set has been frozen.
#[derive(Debug, Clone)]
pub struct ClosedRound {
    pub round: Round,
    /// The accepted contributions, sorted by client id. Empty if the round was discarded.
    pub contributions: Vec<ClientContribution>,
    /// Whether the round was discarded because its quorum was not reached in time.
    pub discarded: bool,
}

#[derive(Debug)]
struct RoundEntry {
    round: Round,
    accepted: HashMap<ContributionKey, ClientContribution>,
}

/// The ledger of rounds and accepted contributions.
pub struct Ledger {
    catalog: Arc<dyn VersionCatalog>,
    identities: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    next_round_id: AtomicU64,
    rounds: RwLock<HashMap<RoundId, Arc<Mutex<RoundEntry>>>>,
}

impl Ledger {
    /// Creates an empty ledger.
    pub fn new(
        catalog: Arc<dyn VersionCatalog>,
        identities: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            identities,
            clock,
            next_round_id: AtomicU64::new(1),
            rounds: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, round_id: RoundId) -> Option<Arc<Mutex<RoundEntry>>> {
        read(&self.rounds).get(&round_id).cloned()
    }

    /// Opens a round against an existing model version.
    ///
    /// # Errors
    /// Fails if the base version is unknown or `min_clients` is zero.
    pub fn open_round(
        &self,
        base_version: Version,
        min_clients: usize,
        grace: Duration,
    ) -> Result<RoundId, LedgerError> {
        if min_clients == 0 {
            return Err(LedgerError::InvalidQuorum);
        }
        let schema_version = self
            .catalog
            .schema_version(base_version)
            .ok_or(LedgerError::BaseVersionNotFound(base_version))?;

        let round_id = self.next_round_id.fetch_add(1, Ordering::SeqCst);
        let opened_at = self.clock.now();
        let round = Round {
            round_id,
            base_version,
            schema_version,
            opened_at,
            grace_deadline: opened_at + grace,
            min_clients,
            state: RoundState::Open,
        };
        info!(
            "round {} opened on version {} (min clients: {}, deadline: {})",
            round_id, base_version, min_clients, round.grace_deadline
        );
        let entry = RoundEntry {
            round,
            accepted: HashMap::new(),
        };
        write(&self.rounds).insert(round_id, Arc::new(Mutex::new(entry)));
        Ok(round_id)
    }

    /// Submits a contribution. See [`Ledger::submit`].
    pub fn submit_contribution(
        &self,
        client_id: ClientId,
        round_id: RoundId,
        encrypted_payload: HybridCiphertext,
        signature: Signature,
        schema_version: String,
    ) -> SubmitOutcome {
        self.submit(Submission {
            client_id,
            round_id,
            encrypted_payload,
            signature,
            schema_version,
        })
    }

    /// Submits a signed contribution.
    ///
    /// At most one contribution per client and round is accepted. Resubmitting after acceptance
    /// returns [`SubmitOutcome::Duplicate`] and leaves the stored contribution untouched.
    pub fn submit(&self, submission: Submission) -> SubmitOutcome {
        let round_id = submission.round_id;
        let client_id = submission.client_id.clone();
        let outcome = self.try_submit(submission);
        match outcome {
            SubmitOutcome::Accepted => {
                debug!("contribution of {} accepted for round {}", client_id, round_id)
            }
            SubmitOutcome::Duplicate => {
                debug!("duplicate contribution of {} for round {}", client_id, round_id)
            }
            SubmitOutcome::Rejected(reason) => warn!(
                "contribution of {} for round {} rejected: {}",
                client_id, round_id, reason
            ),
        }
        outcome
    }

    fn try_submit(&self, submission: Submission) -> SubmitOutcome {
        let entry = match self.entry(submission.round_id) {
            Some(entry) => entry,
            None => return SubmitOutcome::Rejected(RejectReason::RoundNotOpen),
        };
        let expected_schema = {
            let guard = lock(&entry);
            if let Err(reason) = guard.round.accepts(self.clock.now()) {
                return SubmitOutcome::Rejected(reason);
            }
            guard.round.schema_version.clone()
        };

        let authentic = self
            .identities
            .verification_key(&submission.client_id)
            .map_or(false, |pk| {
                pk.verify_detached(&submission.signature, &submission.signing_bytes())
            });
        if !authentic {
            debug!(
                "signature of {} does not verify or the client is unknown",
                submission.client_id
            );
            return SubmitOutcome::Rejected(RejectReason::AuthenticationOrDecryption);
        }
        if submission.schema_version != expected_schema {
            return SubmitOutcome::Rejected(RejectReason::SchemaMismatch);
        }

        let mut guard = lock(&entry);
        let now = self.clock.now();
        if let Err(reason) = guard.round.accepts(now) {
            return SubmitOutcome::Rejected(reason);
        }
        let key = ContributionKey {
            client_id: submission.client_id.clone(),
            round_id: submission.round_id,
        };
        match guard.accepted.entry(key) {
            Entry::Occupied(_) => SubmitOutcome::Duplicate,
            Entry::Vacant(slot) => {
                slot.insert(ClientContribution::new(submission, now));
                SubmitOutcome::Accepted
            }
        }
    }

    /// Freezes the accepted set of an open round and hands it out.
    ///
    /// The round moves to [`RoundState::Closing`], unless its grace deadline has passed with
    /// fewer than `min_clients` accepted contributions, in which case it is discarded and no
    /// contribution is handed out. The accepted set is handed out exactly once.
    ///
    /// # Errors
    /// Fails if the round does not exist or is not open.
    pub fn close_round(&self, round_id: RoundId) -> Result<ClosedRound, LedgerError> {
        let entry = self
            .entry(round_id)
            .ok_or(LedgerError::RoundNotFound(round_id))?;
        let mut guard = lock(&entry);
        if guard.round.state != RoundState::Open {
            return Err(LedgerError::RoundNotOpen(round_id));
        }

        let now = self.clock.now();
        let accepted = guard.accepted.len();
        if accepted < guard.round.min_clients && guard.round.is_expired(now) {
            guard.round.state = RoundState::Discarded;
            guard.accepted.clear();
            info!(
                "round {} discarded: {} of {} required contributions before the deadline",
                round_id, accepted, guard.round.min_clients
            );
            return Ok(ClosedRound {
                round: guard.round.clone(),
                contributions: Vec::new(),
                discarded: true,
            });
        }

        guard.round.state = RoundState::Closing;
        let mut contributions: Vec<ClientContribution> =
            guard.accepted.drain().map(|(_, c)| c).collect();
        contributions.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        info!(
            "round {} closed with {} contributions",
            round_id,
            contributions.len()
        );
        Ok(ClosedRound {
            round: guard.round.clone(),
            contributions,
            discarded: false,
        })
    }

    fn transition(
        &self,
        round_id: RoundId,
        allowed_from: &[RoundState],
        to: RoundState,
    ) -> Result<(), LedgerError> {
        let entry = self
            .entry(round_id)
            .ok_or(LedgerError::RoundNotFound(round_id))?;
        let mut guard = lock(&entry);
        let from = guard.round.state;
        if !allowed_from.contains(&from) {
            return Err(LedgerError::InvalidTransition { round_id, from, to });
        }
        guard.round.state = to;
        guard.accepted.clear();
        debug!("round {}: {} -> {}", round_id, from, to);
        Ok(())
    }

    /// Marks a closing round as aggregated.
    pub fn mark_aggregated(&self, round_id: RoundId) -> Result<(), LedgerError> {
        self.transition(round_id, &[RoundState::Closing], RoundState::Aggregated)
    }

    /// Marks an open or closing round as discarded.
    pub fn mark_discarded(&self, round_id: RoundId) -> Result<(), LedgerError> {
        self.transition(
            round_id,
            &[RoundState::Open, RoundState::Closing],
            RoundState::Discarded,
        )
    }

    /// Returns a snapshot of a round.
    pub fn round(&self, round_id: RoundId) -> Option<Round> {
        self.entry(round_id).map(|entry| lock(&entry).round.clone())
    }

    /// Returns the ids of all rounds in the given state, in ascending order.
    pub fn rounds_in_state(&self, state: RoundState) -> Vec<RoundId> {
        let mut ids: Vec<RoundId> = read(&self.rounds)
            .iter()
            .filter(|(_, entry)| lock(entry).round.state == state)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the open or closing round on a base version, if any.
    pub fn round_on_base(&self, base_version: Version) -> Option<RoundId> {
        read(&self.rounds)
            .iter()
            .filter(|(_, entry)| {
                let guard = lock(entry);
                guard.round.base_version == base_version
                    && matches!(guard.round.state, RoundState::Open | RoundState::Closing)
            })
            .map(|(id, _)| *id)
            .min()
    }

    /// Returns the number of contributions accepted so far for an open round.
    pub fn accepted_count(&self, round_id: RoundId) -> Option<usize> {
        self.entry(round_id).map(|entry| lock(&entry).accepted.len())
    }

    /// Whether an open round has accepted at least `min_clients` contributions.
    pub fn quorum_reached(&self, round_id: RoundId) -> bool {
        self.entry(round_id).map_or(false, |entry| {
            let guard = lock(&entry);
            guard.round.state == RoundState::Open && guard.accepted.len() >= guard.round.min_clients
        })
    }

    /// Returns the open rounds whose grace deadline passed before `now`, in ascending order.
    pub fn expired_rounds(&self, now: DateTime<Utc>) -> Vec<RoundId> {
        let mut ids: Vec<RoundId> = read(&self.rounds)
            .iter()
            .filter(|(_, entry)| {
                let guard = lock(entry);
                guard.round.state == RoundState::Open && guard.round.is_expired(now)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Forgets all aggregated and discarded rounds. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut rounds = write(&self.rounds);
        let before = rounds.len();
        rounds.retain(|_, entry| !lock(entry).round.is_finished());
        let pruned = before - rounds.len();
        if pruned > 0 {
            debug!("pruned {} finished rounds", pruned);
        }
        pruned
    }
}
