//! Ledger adapter.
//!
//! The host process exposes an untyped byte-level key/value store indexed by
//! `(address, key)`. This module defines the trait the engine requires of
//! it, the register key scheme, and an in-memory implementation used by
//! tests and offline tooling.

use std::collections::BTreeMap;

use crate::error::{LedgerError, StorageError};
use crate::slab::{Address, SlabIndex};

/// Well-known register holding the account storage map root index of a
/// v2 account. Present ⇒ the account is in storage format v2.
pub const ACCOUNT_STORAGE_KEY: &str = "stored";

/// Prefix byte of slab register keys.
pub(crate) const SLAB_KEY_PREFIX: u8 = 0x00;

const SLAB_INDEX_LENGTH: usize = 8;

/// The register key of a slab: the prefix byte followed by the 8-byte
/// little-endian slab index.
pub(crate) fn slab_key(index: SlabIndex) -> [u8; 1 + SLAB_INDEX_LENGTH] {
    let mut key = [0u8; 1 + SLAB_INDEX_LENGTH];
    key[0] = SLAB_KEY_PREFIX;
    key[1..].copy_from_slice(&index.to_le_bytes());
    key
}

/// The flat key/value store the engine persists into.
///
/// All failures are fatal to the current transaction.
pub trait Ledger {
    /// Reads the value under `(owner, key)`, if any.
    fn get_value(&self, owner: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Writes the value under `(owner, key)`, overwriting any previous one.
    fn set_value(&mut self, owner: &[u8], key: &[u8], value: &[u8]) -> Result<(), LedgerError>;

    /// Deletes the value under `(owner, key)`. Deleting an absent value is
    /// not an error.
    fn delete_value(&mut self, owner: &[u8], key: &[u8]) -> Result<(), LedgerError>;

    /// Whether a value exists under `(owner, key)`.
    fn value_exists(&self, owner: &[u8], key: &[u8]) -> Result<bool, LedgerError> {
        Ok(self.get_value(owner, key)?.is_some())
    }

    /// Returns a never-before-used slab index for `owner`, monotonically
    /// increasing.
    fn allocate_slab_index(&mut self, owner: &[u8]) -> Result<SlabIndex, LedgerError>;
}

/// Reads a slab index from an account register, validating its shape.
pub(crate) fn read_slab_index<L: Ledger>(
    ledger: &L,
    address: Address,
    register: &[u8],
) -> Result<Option<SlabIndex>, StorageError> {
    let bytes = match ledger.get_value(address.as_bytes(), register)? {
        None => return Ok(None),
        Some(bytes) => bytes,
    };
    let bytes: [u8; SLAB_INDEX_LENGTH] =
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::InvalidRegister {
                address,
                register: register.to_vec(),
            })?;
    Ok(Some(SlabIndex::from_le_bytes(bytes)))
}

/// Writes a slab index to an account register.
pub(crate) fn write_slab_index<L: Ledger>(
    ledger: &mut L,
    address: Address,
    register: &[u8],
    index: SlabIndex,
) -> Result<(), StorageError> {
    ledger.set_value(address.as_bytes(), register, &index.to_le_bytes())?;
    Ok(())
}

/// Ledger implemented purely in memory. No state is saved anywhere. This is
/// mostly used for testing purposes and offline tooling.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLedger {
    values: BTreeMap<(Vec<u8>, Vec<u8>), Vec<u8>>,
    next_indices: BTreeMap<Vec<u8>, u64>,
}

impl InMemoryLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        InMemoryLedger::default()
    }

    /// All register keys present for the given owner, in key order.
    pub fn keys_for_owner(&self, owner: &[u8]) -> Vec<Vec<u8>> {
        self.values
            .keys()
            .filter(|(o, _)| o == owner)
            .map(|(_, key)| key.clone())
            .collect()
    }

    /// Total number of registers in the ledger.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the ledger holds no registers at all.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Ledger for InMemoryLedger {
    fn get_value(&self, owner: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self
            .values
            .get(&(owner.to_vec(), key.to_vec()))
            .cloned())
    }

    fn set_value(&mut self, owner: &[u8], key: &[u8], value: &[u8]) -> Result<(), LedgerError> {
        self.values
            .insert((owner.to_vec(), key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete_value(&mut self, owner: &[u8], key: &[u8]) -> Result<(), LedgerError> {
        self.values.remove(&(owner.to_vec(), key.to_vec()));
        Ok(())
    }

    fn allocate_slab_index(&mut self, owner: &[u8]) -> Result<SlabIndex, LedgerError> {
        let next = self.next_indices.entry(owner.to_vec()).or_insert(1);
        let index = *next;
        *next = next.checked_add(1).ok_or_else(|| {
            let mut address = [0u8; 8];
            let len = owner.len().min(address.len());
            address[..len].copy_from_slice(&owner[..len]);
            LedgerError::IndexSpaceExhausted(Address(address))
        })?;
        Ok(SlabIndex(index))
    }
}
