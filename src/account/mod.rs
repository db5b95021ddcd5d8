//! Account storage layers.
//!
//! Two on-ledger layouts coexist. Format v1 keeps one register per
//! `(address, domain)`, each pointing at a domain storage map root. Format
//! v2 keeps a single well-known register per address pointing at an
//! [`AccountStorageMap`] whose entries map domains to domain storage map
//! roots. Accounts migrate from v1 to v2 one way, per account, at commit.

pub mod v1;
pub mod v2;

use crate::domain::Domain;
use crate::error::StorageError;
use crate::ledger::Ledger;
use crate::map::{DomainStorageMap, StorageMap};
use crate::slab::{Address, SlabId};
use crate::store::PersistentSlabStore;
use crate::value::{MapKey, Storable};

/// Mapping `domain → domain storage map` for one account (storage format
/// v2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountStorageMap {
    map: StorageMap,
}

impl AccountStorageMap {
    /// Creates an empty account storage map owned by `address`.
    pub fn new<L: Ledger>(
        store: &PersistentSlabStore<L>,
        address: Address,
    ) -> Result<Self, StorageError> {
        Ok(AccountStorageMap {
            map: StorageMap::new(store, address)?,
        })
    }

    /// Handle to an existing account storage map rooted at `root`.
    pub fn from_root(root: SlabId) -> Self {
        AccountStorageMap {
            map: StorageMap::from_root(root),
        }
    }

    /// The root slab ID.
    pub fn root_slab_id(&self) -> SlabId {
        self.map.root_slab_id()
    }

    /// Number of domains present. At most the number of defined domains.
    pub fn count<L: Ledger>(&self, store: &PersistentSlabStore<L>) -> Result<u64, StorageError> {
        self.map.count(store)
    }

    /// Looks up the domain storage map for `domain`.
    pub fn get_domain<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
        domain: Domain,
    ) -> Result<Option<DomainStorageMap>, StorageError> {
        match self
            .map
            .get(store, &MapKey::String(domain.identifier().to_owned()))?
        {
            None => Ok(None),
            Some(Storable::SlabRef(root)) => Ok(Some(DomainStorageMap::from_root(root))),
            Some(_) => Err(StorageError::UnexpectedStorable(domain.identifier())),
        }
    }

    /// Inserts `domain → domain_map`.
    pub fn insert_domain<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
        domain: Domain,
        domain_map: DomainStorageMap,
    ) -> Result<(), StorageError> {
        self.map.insert(
            store,
            MapKey::String(domain.identifier().to_owned()),
            Storable::SlabRef(domain_map.root_slab_id()),
        )?;
        Ok(())
    }

    /// The domains present, in identifier order.
    pub fn domains<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
    ) -> Result<Vec<Domain>, StorageError> {
        Ok(self
            .map
            .entries(store)?
            .into_iter()
            .filter_map(|(key, _)| match key {
                MapKey::String(identifier) => Domain::from_identifier(&identifier),
                MapKey::U64(_) => None,
            })
            .collect())
    }
}
