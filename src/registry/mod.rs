//! The model registry.
//!
//! The registry is an append-only sequence of signed [`ModelVersion`]s with a single active
//! pointer. Every mutation goes through one serialized publication step which assigns the next
//! version number, signs the artifact, persists it and then advances the active pointer. Version
//! numbers are never reused, and a rollback publishes a new version carrying the parameters of
//! an earlier one.
//!
//! [`LocalModel`] is the client side counterpart, which only installs packages whose signature
//! verifies under the registry public key.

mod artifact;
mod install;
mod store;

use std::{collections::BTreeMap, sync::Arc, sync::Mutex};

use displaydoc::Display;
use thiserror::Error;

pub use self::{
    artifact::{ModelVersion, PackageError, SignedPackage},
    install::{InstallError, InstallOutcome, LocalModel},
    store::{FileStore, MemoryStore, ModelStorage, StorageError, StorageResult},
};
use crate::{
    common::{lock, Clock, RoundId, Version},
    crypto::{PublicSigningKey, SigningKeyPair},
    ledger::VersionCatalog,
};

/// Errors of the model registry.
#[derive(Debug, Display, Error)]
pub enum RegistryError {
    /// the registry has already been bootstrapped
    AlreadyBootstrapped,
    /// the registry has not been bootstrapped yet
    NotBootstrapped,
    /// version {0} does not exist
    NotFound(Version),
    /// rollback target version {0} does not exist
    TargetVersionNotFound(Version),
    /// the model has {actual} parameters instead of {expected}
    DimensionMismatch { expected: usize, actual: usize },
    /// parameter at index {0} is not finite
    NonFiniteParameter(usize),
    /// version {version} is corrupted: {reason}
    Corrupted { version: Version, reason: String },
    /// storage failed: {0}
    Storage(#[from] StorageError),
}

#[derive(Debug, Default)]
struct RegistryState {
    versions: BTreeMap<Version, SignedPackage>,
    active: Option<Version>,
    /// The next version number. Numbers of versions whose publication failed stay consumed.
    next: Version,
}

impl RegistryState {

    fn active(&self) -> Option<&SignedPackage> {
        self.active.and_then(|version| self.versions.get(&version))
    }
}

/// The registry of published model versions.
pub struct ModelRegistry<S> {
    signing: SigningKeyPair,
    schema_version: String,
    clock: Arc<dyn Clock>,
    storage: S,
    state: Mutex<RegistryState>,
}

impl<S> ModelRegistry<S>
where
    S: ModelStorage,
{
    /// Opens a registry on top of a storage, reloading the versions it holds.
    ///
    /// Every stored version must verify under the public half of `signing` and the active
    /// pointer must refer to a stored version.
    ///
    /// # Errors
    /// Fails with [`RegistryError::Corrupted`] if a stored version does not verify, or with
    /// [`RegistryError::Storage`] if the storage cannot be read.
    pub fn open(
        storage: S,
        signing: SigningKeyPair,
        schema_version: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RegistryError> {
        let mut state = RegistryState::default();
        let active = storage.active()?;
        for version in storage.versions()? {
            state.next = state.next.max(version + 1);
            // stored after the active pointer: its publication failed
            if active.map_or(true, |active| version > active) {
                warn!("ignoring unpublished model version {}", version);
                continue;
            }
            let package = storage
                .get(version)?
                .ok_or_else(|| RegistryError::Corrupted {
                    version,
                    reason: "listed but missing".to_string(),
                })?;
            if !package.verify(&signing.public) {
                error!("stored model version {} has an invalid signature", version);
                return Err(RegistryError::Corrupted {
                    version,
                    reason: "invalid signature".to_string(),
                });
            }
            state.versions.insert(version, package);
        }
        state.active = active;
        if let Some(active) = state.active {
            if !state.versions.contains_key(&active) {
                return Err(RegistryError::Corrupted {
                    version: active,
                    reason: "active version is not stored".to_string(),
                });
            }
        }
        info!(
            "model registry opened with {} versions (active: {:?})",
            state.versions.len(),
            state.active
        );
        Ok(Self {
            signing,
            schema_version: schema_version.into(),
            clock,
            storage,
            state: Mutex::new(state),
        })
    }

    /// The trust anchor clients verify packages against.
    pub fn public_key(&self) -> PublicSigningKey {
        self.signing.public
    }

    /// The schema of the models published from now on.
    pub fn current_schema(&self) -> &str {
        &self.schema_version
    }

    /// Publishes the initial version `0`.
    ///
    /// # Errors
    /// Fails if a version was already published, or if the parameters are not finite.
    pub fn bootstrap(&self, parameters: Vec<f32>) -> Result<SignedPackage, RegistryError> {
        let mut state = lock(&self.state);
        if !state.versions.is_empty() {
            return Err(RegistryError::AlreadyBootstrapped);
        }
        self.publish_locked(&mut state, parameters, None, None)
    }

    /// Publishes a new version and makes it the active one.
    ///
    /// # Errors
    /// Fails if the registry is not bootstrapped, or if the parameters are not finite or don't
    /// match the dimension of the active version. Nothing changes on failure.
    pub fn publish(
        &self,
        parameters: Vec<f32>,
        base_round: Option<RoundId>,
        rollback_of: Option<Version>,
    ) -> Result<SignedPackage, RegistryError> {
        let mut state = lock(&self.state);
        if state.versions.is_empty() {
            return Err(RegistryError::NotBootstrapped);
        }
        self.publish_locked(&mut state, parameters, base_round, rollback_of)
    }

    /// Publishes a new version carrying the parameters of `target`.
    ///
    /// The active pointer never moves backwards: the restored parameters get a fresh version
    /// number with `rollback_of` set to `target`.
    pub fn rollback(&self, target: Version) -> Result<SignedPackage, RegistryError> {
        let mut state = lock(&self.state);
        let parameters = state
            .versions
            .get(&target)
            .ok_or(RegistryError::TargetVersionNotFound(target))?
            .parameters
            .clone();
        let package = self.publish_locked(&mut state, parameters, None, Some(target))?;
        warn!(
            "rolled back to the parameters of version {} as version {}",
            target, package.version
        );
        Ok(package)
    }

    fn publish_locked(
        &self,
        state: &mut RegistryState,
        parameters: Vec<f32>,
        base_round: Option<RoundId>,
        rollback_of: Option<Version>,
    ) -> Result<SignedPackage, RegistryError> {
        if !state.versions.is_empty() {
            let expected = state
                .active()
                .ok_or(RegistryError::NotBootstrapped)?
                .parameters
                .len();
            if parameters.len() != expected {
                return Err(RegistryError::DimensionMismatch {
                    expected,
                    actual: parameters.len(),
                });
            }
        }
        if let Some(index) = parameters.iter().position(|p| !p.is_finite()) {
            return Err(RegistryError::NonFiniteParameter(index));
        }

        let version = state.next;
        let package: SignedPackage = ModelVersion::sign(
            version,
            parameters,
            self.schema_version.clone(),
            base_round,
            self.clock.now(),
            rollback_of,
            &self.signing.secret,
        )
        .into();

        self.storage.put(&package)?;
        // the artifact is persisted from here on, its number must never be handed out again
        state.next = version + 1;
        self.storage.set_active(version)?;
        state.versions.insert(version, package.clone());
        state.active = Some(version);

        info!(
            "published model version {} (base round: {:?}, rollback of: {:?})",
            version, base_round, rollback_of
        );
        Ok(package)
    }

    /// Returns a published version.
    pub fn get(&self, version: Version) -> Result<SignedPackage, RegistryError> {
        lock(&self.state)
            .versions
            .get(&version)
            .cloned()
            .ok_or(RegistryError::NotFound(version))
    }

    /// Returns the active version.
    pub fn get_active(&self) -> Result<SignedPackage, RegistryError> {
        lock(&self.state)
            .active()
            .cloned()
            .ok_or(RegistryError::NotBootstrapped)
    }

    pub fn active_version(&self) -> Option<Version> {
        lock(&self.state).active
    }

    /// The numbers of all published versions in ascending order.
    pub fn versions(&self) -> Vec<Version> {
        lock(&self.state).versions.keys().copied().collect()
    }
}

impl<S> VersionCatalog for ModelRegistry<S>
where
    S: ModelStorage,
{
    fn schema_version(&self, version: Version) -> Option<String> {
        lock(&self.state)
            .versions
            .get(&version)
            .map(|package| package.schema_version.clone())
    }
}
