//! One-way migration of accounts from storage format v1 to v2.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use crate::account::AccountStorageMap;
use crate::domain::Domain;
use crate::error::StorageError;
use crate::ledger::{self, Ledger, ACCOUNT_STORAGE_KEY};
use crate::map::DomainStorageMap;
use crate::slab::Address;
use crate::store::PersistentSlabStore;

/// Migrates one v1 account's domain registers into a v2 account storage
/// map.
///
/// The domain-map source is consulted for every domain; the façade passes a
/// cache-first source so uncommitted domain storage maps are not lost to a
/// stale register read.
pub struct DomainRegisterMigration<'a, L: Ledger, F> {
    ledger: &'a Rc<RefCell<L>>,
    store: &'a PersistentSlabStore<L>,
    domain_map_source: F,
}

impl<'a, L, F> DomainRegisterMigration<'a, L, F>
where
    L: Ledger,
    F: Fn(Address, Domain) -> Result<Option<DomainStorageMap>, StorageError>,
{
    /// Creates a migrator over the given ledger and slab store.
    pub fn new(
        ledger: &'a Rc<RefCell<L>>,
        store: &'a PersistentSlabStore<L>,
        domain_map_source: F,
    ) -> Self {
        DomainRegisterMigration {
            ledger,
            store,
            domain_map_source,
        }
    }

    /// Builds a v2 account storage map for `address` from its v1 domain
    /// maps, deletes each migrated v1 domain register, and installs the
    /// `"stored"` register. Domains with neither a register nor a cached
    /// map do not appear in the new account storage map.
    pub fn migrate_account(&self, address: Address) -> Result<AccountStorageMap, StorageError> {
        let account_map = AccountStorageMap::new(self.store, address)?;
        let mut migrated_domains = 0usize;
        for domain in Domain::ALL {
            let domain_map = match (self.domain_map_source)(address, domain)? {
                None => continue,
                Some(domain_map) => domain_map,
            };
            account_map.insert_domain(self.store, domain, domain_map)?;
            self.ledger
                .borrow_mut()
                .delete_value(address.as_bytes(), domain.identifier().as_bytes())?;
            migrated_domains += 1;
        }
        ledger::write_slab_index(
            &mut *self.ledger.borrow_mut(),
            address,
            ACCOUNT_STORAGE_KEY.as_bytes(),
            account_map.root_slab_id().index,
        )?;
        debug!(%address, domains = migrated_domains, "migrated account to storage format v2");
        Ok(account_map)
    }
}
