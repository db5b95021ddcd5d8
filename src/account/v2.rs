//! Account storage format v2: a single account storage map per address.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::rc::Rc;

use crate::account::AccountStorageMap;
use crate::domain::Domain;
use crate::error::StorageError;
use crate::ledger::{self, Ledger, ACCOUNT_STORAGE_KEY};
use crate::map::DomainStorageMap;
use crate::meter::MemoryGauge;
use crate::slab::{Address, SlabId, SlabIndex};
use crate::store::PersistentSlabStore;

/// The v2 account layer.
pub struct AccountStorageV2<L: Ledger> {
    ledger: Rc<RefCell<L>>,
    store: Rc<PersistentSlabStore<L>>,
    /// Account storage maps touched this transaction: loaded, created, or
    /// migrated.
    cached_account_maps: RefCell<HashMap<Address, AccountStorageMap>>,
    /// `"stored"` registers to write at commit, for maps created this
    /// transaction. Ordered so the register writes are deterministic.
    pending_roots: RefCell<BTreeMap<Address, SlabIndex>>,
}

impl<L: Ledger> AccountStorageV2<L> {
    pub(crate) fn new(ledger: Rc<RefCell<L>>, store: Rc<PersistentSlabStore<L>>) -> Self {
        AccountStorageV2 {
            ledger,
            store,
            cached_account_maps: RefCell::new(HashMap::new()),
            pending_roots: RefCell::new(BTreeMap::new()),
        }
    }

    /// Whether the account has a `"stored"` register (⇒ it is v2).
    pub(crate) fn has_account_storage_map(&self, address: Address) -> Result<bool, StorageError> {
        Ok(ledger::read_slab_index(
            &*self.ledger.borrow(),
            address,
            ACCOUNT_STORAGE_KEY.as_bytes(),
        )?
        .is_some())
    }

    fn get_account_storage_map<M: MemoryGauge>(
        &self,
        gauge: &M,
        address: Address,
        create_if_not_exists: bool,
    ) -> Result<Option<AccountStorageMap>, StorageError> {
        if let Some(account_map) = self.cached_account_maps.borrow().get(&address) {
            return Ok(Some(*account_map));
        }
        let existing = ledger::read_slab_index(
            &*self.ledger.borrow(),
            address,
            ACCOUNT_STORAGE_KEY.as_bytes(),
        )?;
        let account_map = match existing {
            Some(index) => AccountStorageMap::from_root(SlabId::new(address, index)),
            None if !create_if_not_exists => return Ok(None),
            None => {
                let account_map = AccountStorageMap::new(&self.store, address)?;
                gauge.use_memory(mem::size_of::<AccountStorageMap>() as u64);
                self.pending_roots
                    .borrow_mut()
                    .insert(address, account_map.root_slab_id().index);
                account_map
            }
        };
        self.cached_account_maps
            .borrow_mut()
            .insert(address, account_map);
        Ok(Some(account_map))
    }

    /// Returns the domain storage map for `(address, domain)`, loading the
    /// account storage map first (creating it on first use iff
    /// `create_if_not_exists`).
    pub fn get_domain_map<M: MemoryGauge>(
        &self,
        gauge: &M,
        address: Address,
        domain: Domain,
        create_if_not_exists: bool,
    ) -> Result<Option<DomainStorageMap>, StorageError> {
        let account_map =
            match self.get_account_storage_map(gauge, address, create_if_not_exists)? {
                None => return Ok(None),
                Some(account_map) => account_map,
            };
        if let Some(domain_map) = account_map.get_domain(&self.store, domain)? {
            return Ok(Some(domain_map));
        }
        if !create_if_not_exists {
            return Ok(None);
        }
        let domain_map = DomainStorageMap::new(&self.store, address)?;
        gauge.use_memory(mem::size_of::<DomainStorageMap>() as u64);
        account_map.insert_domain(&self.store, domain, domain_map)?;
        Ok(Some(domain_map))
    }

    /// Caches an account storage map constructed by the migration. The
    /// migrator installs the `"stored"` register itself, so nothing is
    /// scheduled for commit.
    pub(crate) fn cache_account_storage_map(
        &self,
        address: Address,
        account_map: AccountStorageMap,
    ) {
        self.cached_account_maps
            .borrow_mut()
            .insert(address, account_map);
    }

    /// Root slab IDs of all account storage maps touched this transaction.
    pub(crate) fn cached_root_slab_ids(&self) -> Vec<SlabId> {
        self.cached_account_maps
            .borrow()
            .values()
            .map(AccountStorageMap::root_slab_id)
            .collect()
    }

    /// Writes the `"stored"` register for every account storage map created
    /// this transaction, in ascending address order.
    pub fn commit(&self) -> Result<(), StorageError> {
        let pending = mem::take(&mut *self.pending_roots.borrow_mut());
        for (address, index) in pending {
            ledger::write_slab_index(
                &mut *self.ledger.borrow_mut(),
                address,
                ACCOUNT_STORAGE_KEY.as_bytes(),
                index,
            )?;
        }
        Ok(())
    }
}
