//! Read-only access to the client verification keys provisioned by the identity collaborator.

use std::{collections::HashMap, sync::RwLock};

use crate::{
    common::{read, write, ClientId},
    crypto::PublicSigningKey,
};

/// A mapping from client identifiers to their verification keys.
pub trait IdentityProvider: Send + Sync {
    /// Returns the verification key of a registered client.
    fn verification_key(&self, client_id: &ClientId) -> Option<PublicSigningKey>;
}

impl IdentityProvider for HashMap<ClientId, PublicSigningKey> {
    fn verification_key(&self, client_id: &ClientId) -> Option<PublicSigningKey> {
        self.get(client_id).copied()
    }
}

/// An in-memory [`IdentityProvider`] that enrollment can write into.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    keys: RwLock<HashMap<ClientId, PublicSigningKey>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the verification key of a client, returning the key it replaces.
    pub fn register(&self, client_id: ClientId, pk: PublicSigningKey) -> Option<PublicSigningKey> {
        info!("registering verification key of client {}", client_id);
        write(&self.keys).insert(client_id, pk)
    }

    /// Removes a client. Its further contributions fail authentication.
    pub fn revoke(&self, client_id: &ClientId) -> bool {
        write(&self.keys).remove(client_id).is_some()
    }

    pub fn len(&self) -> usize {
        read(&self.keys).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityProvider for ClientRegistry {
    fn verification_key(&self, client_id: &ClientId) -> Option<PublicSigningKey> {
        read(&self.keys).get(client_id).copied()
    }
}
