use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    common::{RoundId, Version},
    ledger::RejectReason,
};

/// The lifecycle state of a [`Round`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundState {
    /// Contributions are accepted.
    Open,
    /// The accepted set has been frozen and handed to the aggregator.
    Closing,
    /// The aggregator produced a new model version from this round.
    Aggregated,
    /// The round ended without producing a model version.
    Discarded,
}

/// An aggregation window tied to a base model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub round_id: RoundId,
    /// The model version the contributions are computed against.
    pub base_version: Version,
    /// The schema contributions must be produced for, taken from the base version.
    pub schema_version: String,
    pub opened_at: DateTime<Utc>,
    /// Contributions are not accepted anymore after this instant.
    pub grace_deadline: DateTime<Utc>,
    /// The number of accepted contributions required for aggregation.
    pub min_clients: usize,
    pub state: RoundState,
}

impl Round {
    /// Checks whether a contribution may be accepted at `now`.
    pub(crate) fn accepts(&self, now: DateTime<Utc>) -> Result<(), RejectReason> {
        match self.state {
            RoundState::Open if now <= self.grace_deadline => Ok(()),
            RoundState::Open | RoundState::Closing => Err(RejectReason::RoundClosed),
            RoundState::Aggregated | RoundState::Discarded => Err(RejectReason::RoundNotOpen),
        }
    }

    /// Whether the grace deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.grace_deadline
    }

    /// Whether the round reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, RoundState::Aggregated | RoundState::Discarded)
    }
}
