//! Storage errors.

use thiserror::Error;

use crate::slab::{Address, SlabId};

/// An error surfaced by the host-process ledger.
///
/// Ledger failures are fatal to the current transaction and are propagated
/// unchanged through every layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The backing key/value store failed.
    #[error("ledger backend failure: {0}")]
    Backend(String),

    /// The per-address slab index space is exhausted.
    #[error("slab index space exhausted for address {0}")]
    IndexSpaceExhausted(Address),
}

/// A structural defect discovered while walking the slab tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorruptionError {
    /// A slab is referenced by more than one parent.
    #[error("slab {0} is referenced by more than one parent")]
    MultipleParents(SlabId),

    /// A slab references a child that does not exist.
    #[error("slab {parent} references missing child slab {child}")]
    MissingChild {
        /// The referencing slab.
        parent: SlabId,
        /// The missing child.
        child: SlabId,
    },

    /// A reference cycle was found through the given slab.
    #[error("cycle detected through slab {0}")]
    Cycle(SlabId),

    /// The slab tree is deeper than the requested bound.
    #[error("slab tree exceeds maximum depth {0}")]
    MaxDepthExceeded(i64),
}

/// Failure to decode a slab or stored value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes are not well-formed CBOR.
    #[error("malformed CBOR: {0}")]
    Cbor(String),

    /// The CBOR tag number is not recognised by this codec.
    #[error("unknown CBOR tag {0}")]
    UnknownTag(u64),

    /// The CBOR is well-formed but does not have the expected shape.
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Failure to encode a slab or stored value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodeError {
    /// CBOR serialization failed.
    #[error("CBOR encoding failed: {0}")]
    Cbor(String),
}

/// Error enum encapsulating all failures of the account-storage engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The underlying ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// A slab could not be decoded.
    #[error("failed to decode slab {id}: {source}")]
    Decode {
        /// The slab whose register held the malformed bytes.
        id: SlabId,
        /// The decoding failure.
        source: DecodeError,
    },

    /// A slab or stored value could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// A referenced slab is absent from both the delta buffer and the ledger.
    #[error("slab {0} not found")]
    SlabNotFound(SlabId),

    /// The slab tree is structurally corrupt.
    #[error(transparent)]
    Corruption(#[from] CorruptionError),

    /// An account register does not hold an 8-byte slab index.
    #[error("register {register:?} for address {address} is not a slab index")]
    InvalidRegister {
        /// The account the register belongs to.
        address: Address,
        /// The raw register key.
        register: Vec<u8>,
    },

    /// A slab has a different kind than its referencing context requires.
    #[error("slab {id} is not a {expected}")]
    UnexpectedSlab {
        /// The offending slab.
        id: SlabId,
        /// The kind the caller required.
        expected: &'static str,
    },

    /// An account storage map entry does not hold a slab reference.
    #[error("account storage map entry for domain `{0}` is not a slab reference")]
    UnexpectedStorable(&'static str),

    /// An account storage map points at a slab that is not a root.
    ///
    /// Raised only by the health check.
    #[error("account storage map (or unmigrated domain storage map) points to non-root slab {0}")]
    DanglingRootReference(SlabId),

    /// Root slabs exist that no account refers to.
    ///
    /// Raised only by the health check; the list is sorted.
    #[error("slabs not referenced: {0:?}")]
    UnreferencedRootSlabs(Vec<SlabId>),

    /// A v1 → v2 migration was scheduled while storage format v2 is disabled.
    #[error("cannot migrate account storage to v2, as it is not enabled")]
    MigrationDisabled,

    /// The format state machine reached an impossible branch. Engine bug.
    #[error("unreachable storage state: {0}")]
    Unreachable(&'static str),
}
