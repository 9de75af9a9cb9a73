use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// The identifier of an aggregation round. Assigned by the ledger, never reused.
pub type RoundId = u64;

/// The number of a published model version.
pub type Version = u64;

/// The identifier of a client, as registered with the identity collaborator.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into, Serialize, Deserialize,
)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A source of the current time.
///
/// Round deadlines and artifact timestamps are computed from a [`Clock`] so that the deadline
/// handling can be driven deterministically.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Encodes a value canonically for signing.
///
/// The encoding is `bincode` with its default fixed-width little-endian integers, prefixed by a
/// domain separation tag, so that a signature made for one kind of record can never be replayed
/// as a signature for another kind.
pub(crate) fn canonical_bytes<T: Serialize>(domain: &[u8], value: &T) -> Vec<u8> {
    let mut bytes = domain.to_vec();
    // safe unwrap: serialization into a vector only fails for maps with non-string keys or
    // sequences of unknown length, neither of which are used in signed records
    bincode::serialize_into(&mut bytes, value).unwrap();
    bytes
}

// Every critical section in this crate leaves its data consistent before anything that may
// panic, so a poisoned lock is recovered instead of propagated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
