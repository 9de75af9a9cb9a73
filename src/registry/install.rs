//! Client side installation of published model versions.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use displaydoc::Display;
use thiserror::Error;

use crate::{
    common::{lock, Version},
    crypto::PublicSigningKey,
    registry::SignedPackage,
};

/// Why a package was not installed. The local model is untouched in every case.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum InstallError {
    /// the package signature does not verify under the trust anchor
    SignatureVerificationFailed,
    /// the package has schema {actual} but {expected} is required
    SchemaMismatch { expected: String, actual: String },
    /// version {offered} is older than the installed version {installed}
    Outdated { installed: Version, offered: Version },
}

/// The result of a successful installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The package is now the active local model.
    Installed {
        version: Version,
        previous: Option<Version>,
    },
    /// The package was already the active local model.
    AlreadyInstalled(Version),
}

/// The model a client runs inference with, plus the one it replaced.
///
/// Readers never block: the active model is swapped atomically, and installations are
/// serialized among themselves.
#[derive(Debug)]
pub struct LocalModel {
    schema_version: String,
    active: ArcSwapOption<SignedPackage>,
    previous: ArcSwapOption<SignedPackage>,
    install: Mutex<()>,
}

impl LocalModel {
    /// Creates an empty local model accepting packages of the given schema.
    pub fn new(schema_version: impl Into<String>) -> Self {
        Self {
            schema_version: schema_version.into(),
            active: ArcSwapOption::from(None),
            previous: ArcSwapOption::from(None),
            install: Mutex::new(()),
        }
    }

    /// The active local model.
    pub fn active(&self) -> Option<Arc<SignedPackage>> {
        self.active.load_full()
    }

    /// The model replaced by the last installation.
    pub fn previous(&self) -> Option<Arc<SignedPackage>> {
        self.previous.load_full()
    }

    pub fn active_version(&self) -> Option<Version> {
        self.active.load_full().map(|package| package.version)
    }

    /// Verifies a package against the trust anchor and makes it the active local model.
    ///
    /// All checks happen before anything is modified.
    ///
    /// # Errors
    /// Fails if the signature does not verify, the schema differs or the package is older than
    /// the active local model.
    pub fn verify_and_install(
        &self,
        package: SignedPackage,
        trust_anchor: &PublicSigningKey,
    ) -> Result<InstallOutcome, InstallError> {
        if !package.verify(trust_anchor) {
            warn!(
                "refusing model version {}: invalid signature",
                package.version
            );
            return Err(InstallError::SignatureVerificationFailed);
        }
        if package.schema_version != self.schema_version {
            return Err(InstallError::SchemaMismatch {
                expected: self.schema_version.clone(),
                actual: package.schema_version.clone(),
            });
        }

        let _guard = lock(&self.install);
        let current = self.active.load_full();
        if let Some(current) = &current {
            if package.version == current.version {
                return Ok(InstallOutcome::AlreadyInstalled(current.version));
            }
            if package.version < current.version {
                return Err(InstallError::Outdated {
                    installed: current.version,
                    offered: package.version,
                });
            }
        }

        let version = package.version;
        let previous = current.as_ref().map(|p| p.version);
        self.previous.store(current);
        self.active.store(Some(Arc::new(package)));
        info!("installed model version {} (previous: {:?})", version, previous);
        Ok(InstallOutcome::Installed { version, previous })
    }

    /// Reinstates the model replaced by the last installation.
    ///
    /// Only one step back is kept: reverting twice swaps the two models back. Returns the
    /// version that is active afterwards, `None` if there was nothing to revert to.
    pub fn revert(&self) -> Option<Version> {
        let _guard = lock(&self.install);
        let previous = self.previous.load_full()?;
        let version = previous.version;
        let current = self.active.swap(Some(previous));
        self.previous.store(current);
        warn!("reverted the local model to version {}", version);
        Some(version)
    }
}
