//! Account storage format v1: one register per `(address, domain)`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::domain::Domain;
use crate::error::StorageError;
use crate::ledger::{self, Ledger};
use crate::map::DomainStorageMap;
use crate::slab::{Address, SlabId};
use crate::store::PersistentSlabStore;

/// The v1 account layer.
pub struct AccountStorageV1<L: Ledger> {
    ledger: Rc<RefCell<L>>,
    store: Rc<PersistentSlabStore<L>>,
}

impl<L: Ledger> AccountStorageV1<L> {
    pub(crate) fn new(ledger: Rc<RefCell<L>>, store: Rc<PersistentSlabStore<L>>) -> Self {
        AccountStorageV1 { ledger, store }
    }

    /// Returns the domain storage map for `(address, domain)`.
    ///
    /// If the domain register is absent and `create_if_not_exists`, a fresh
    /// root slab is allocated and its index written to the register
    /// immediately; subsequent mutations live inside the slab tree.
    pub fn get_domain_map(
        &self,
        address: Address,
        domain: Domain,
        create_if_not_exists: bool,
    ) -> Result<Option<DomainStorageMap>, StorageError> {
        let register = domain.identifier().as_bytes();
        if let Some(index) = ledger::read_slab_index(&*self.ledger.borrow(), address, register)? {
            return Ok(Some(DomainStorageMap::from_root(SlabId::new(
                address, index,
            ))));
        }
        if !create_if_not_exists {
            return Ok(None);
        }
        let domain_map = DomainStorageMap::new(&self.store, address)?;
        ledger::write_slab_index(
            &mut *self.ledger.borrow_mut(),
            address,
            register,
            domain_map.root_slab_id().index,
        )?;
        Ok(Some(domain_map))
    }

    /// Domain-map root registers are written when the map is created, so
    /// there is nothing to flush here beyond what the slab store does.
    pub fn commit(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
