//! `fedagg` is the core of a federated aggregation service.
//!
//! Clients compute model deltas locally, compress them to sparse quantized vectors, encrypt them
//! for the aggregator and sign them. The coordinator collects these contributions into rounds,
//! averages the deltas of a round once it reached its quorum and publishes the result as a new,
//! signed model version. Clients verify published versions against the registry key before they
//! install them.
//!
//! The crate is organized as follows:
//! - [`crypto`]: hybrid encryption, signatures and hashing.
//! - [`compression`]: top-k sparsification and linear quantization of deltas.
//! - [`ledger`]: rounds and their accepted contributions.
//! - [`aggregator`]: decryption, validation and federated averaging of a closed round.
//! - [`registry`]: signed and versioned model artifacts, their storage and client installation.
//! - [`coordinator`]: the server side, tying ledger, aggregator and registry together.
//! - [`producer`]: the client side, preparing and delivering contributions.
//! - [`settings`]: loading and validation of the configuration.

#[macro_use]
extern crate tracing;

pub mod aggregator;
pub mod common;
pub mod compression;
pub mod coordinator;
pub mod crypto;
pub mod ledger;
pub mod producer;
pub mod registry;
pub mod settings;

pub use self::common::{ClientId, Clock, RoundId, SystemClock, Version};
