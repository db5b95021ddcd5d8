//! Persistent account storage for a smart-contract runtime.
//!
//! Maps on-chain account addresses and named domains to structured values,
//! materialized lazily from a flat key/value ledger through a slab-indexed
//! tree, cached across a transaction, and committed atomically at
//! transaction end. Two on-ledger layouts coexist — v1 keeps one register
//! per `(address, domain)`, v2 keeps a single `"stored"` register per
//! account — with one-way, per-account migration from v1 to v2 at commit.
//!
//! The interpreter drives one [`Storage`] façade per transaction. Reads and
//! writes go through [`Storage::get_domain_map`]; contract updates are
//! recorded separately and stay invisible until commit; the slab store's
//! delta buffer accumulates every mutation and flushes in parallel, in a
//! deterministic order, when [`Storage::commit`] runs.

#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications
)]

pub mod account;
mod codec;
pub mod domain;
pub mod error;
pub mod ledger;
pub mod map;
pub mod meter;
pub mod migration;
pub mod slab;
pub mod storage;
pub mod store;
pub mod value;

pub use crate::domain::Domain;
pub use crate::error::StorageError;
pub use crate::ledger::{InMemoryLedger, Ledger};
pub use crate::storage::{Storage, StorageConfig, StorageKey};
