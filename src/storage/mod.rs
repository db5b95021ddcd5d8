//! Storage façade.
//!
//! The public surface the interpreter drives. Owns the slab store, both
//! account layers, and the per-transaction caches; resolves every domain
//! access through the format-detection state machine; records contract
//! updates separately so in-progress updates are invisible to executing
//! code; and commits all accumulated mutations at transaction end,
//! migrating scheduled v1 accounts to v2 on the way.
//!
//! The façade is created per transaction; all of its caches die with it.


use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::mem;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::account::v1::AccountStorageV1;
use crate::account::v2::AccountStorageV2;
use crate::domain::Domain;
use crate::error::StorageError;
use crate::ledger::{self, Ledger};
use crate::map::DomainStorageMap;
use crate::meter::{ComputationKind, ComputationMeter, MemoryGauge};
use crate::migration::DomainRegisterMigration;
use crate::slab::{Address, SlabId};
use crate::store::PersistentSlabStore;
use crate::value::{MapKey, Storable};

/// Engine configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageConfig {
    /// Whether accounts may be written in storage format v2. When disabled,
    /// every account is handled as v1 and migrations must not be scheduled.
    pub storage_format_v2_enabled: bool,
}

/// Location of a contract update: account address and contract name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey {
    /// The account the contract lives under.
    pub address: Address,
    /// The contract name.
    pub key: String,
}

impl StorageKey {
    /// Creates a storage key.
    pub fn new(address: Address, key: impl Into<String>) -> Self {
        StorageKey {
            address,
            key: key.into(),
        }
    }
}

/// The storage format of an account, as derived by the probe sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountStorageFormat {
    /// Not determined; only possible on a create-free read that declined to
    /// scan all domain registers.
    Unknown,
    /// No register of either format exists.
    New,
    /// At least one v1 domain register exists.
    V1,
    /// The `"stored"` register exists.
    V2,
}

/// The persistent account-storage engine façade.
pub struct Storage<L: Ledger> {
    ledger: Rc<RefCell<L>>,
    store: Rc<PersistentSlabStore<L>>,
    config: StorageConfig,
    account_storage_v1: AccountStorageV1<L>,
    account_storage_v2: Option<AccountStorageV2<L>>,
    /// Domain storage maps materialized this transaction.
    cached_domain_maps: RefCell<HashMap<(Address, Domain), DomainStorageMap>>,
    /// Per-address format determination: `true` ⇒ v1, `false` ⇒ v2.
    /// Authoritative for the remainder of the transaction.
    cached_v1_accounts: RefCell<HashMap<Address, bool>>,
    /// Deferred contract updates, in first-insertion order. `None` is the
    /// deletion tombstone.
    contract_updates: RefCell<IndexMap<StorageKey, Option<Storable>>>,
    scheduled_v2_migrations: RefCell<Vec<Address>>,
}

impl<L: Ledger> Storage<L> {
    /// Creates a façade over the given ledger for one transaction.
    pub fn new(ledger: L, config: StorageConfig) -> Self {
        let ledger = Rc::new(RefCell::new(ledger));
        let store = Rc::new(PersistentSlabStore::new(Rc::clone(&ledger)));
        let account_storage_v1 =
            AccountStorageV1::new(Rc::clone(&ledger), Rc::clone(&store));
        let account_storage_v2 = config
            .storage_format_v2_enabled
            .then(|| AccountStorageV2::new(Rc::clone(&ledger), Rc::clone(&store)));
        Storage {
            ledger,
            store,
            config,
            account_storage_v1,
            account_storage_v2,
            cached_domain_maps: RefCell::new(HashMap::new()),
            cached_v1_accounts: RefCell::new(HashMap::new()),
            contract_updates: RefCell::new(IndexMap::new()),
            scheduled_v2_migrations: RefCell::new(Vec::new()),
        }
    }

    /// The engine configuration.
    pub fn config(&self) -> StorageConfig {
        self.config
    }

    /// The underlying slab store.
    pub fn slab_store(&self) -> &PersistentSlabStore<L> {
        &self.store
    }

    /// The underlying ledger.
    pub fn ledger(&self) -> &Rc<RefCell<L>> {
        &self.ledger
    }

    /// Returns the existing or new domain storage map for `(address,
    /// domain)`, dispatching to the account layer the probe sequence
    /// selects.
    ///
    /// On a create-free read of an undetermined account, only the
    /// `"stored"` register and the specific domain register are probed; the
    /// caller receives `None` without a full domain-register scan.
    pub fn get_domain_map<M: ComputationMeter + MemoryGauge>(
        &self,
        meter: &M,
        address: Address,
        domain: Domain,
        create_if_not_exists: bool,
    ) -> Result<Option<DomainStorageMap>, StorageError> {
        if let Some(domain_map) = self.cached_domain_maps.borrow().get(&(address, domain)) {
            return Ok(Some(*domain_map));
        }

        let domain_map = if !self.config.storage_format_v2_enabled {
            // All accounts are v1 when storage format v2 is disabled.
            let domain_map =
                self.account_storage_v1
                    .get_domain_map(address, domain, create_if_not_exists)?;
            if domain_map.is_some() {
                self.cache_is_v1_account(address, true);
            }
            domain_map
        } else {
            let only_check_specified_domain = !create_if_not_exists;
            match self.account_storage_format(address, domain, only_check_specified_domain)? {
                AccountStorageFormat::Unknown => {
                    if create_if_not_exists {
                        return Err(StorageError::Unreachable(
                            "account storage format unknown on create",
                        ));
                    }
                    None
                }
                AccountStorageFormat::V1 => {
                    let domain_map = self.account_storage_v1.get_domain_map(
                        address,
                        domain,
                        create_if_not_exists,
                    )?;
                    self.cache_is_v1_account(address, true);
                    domain_map
                }
                AccountStorageFormat::V2 | AccountStorageFormat::New => {
                    let account_storage_v2 = self
                        .account_storage_v2
                        .as_ref()
                        .ok_or(StorageError::Unreachable("v2 layer missing while enabled"))?;
                    let domain_map = account_storage_v2.get_domain_map(
                        meter,
                        address,
                        domain,
                        create_if_not_exists,
                    )?;
                    self.cache_is_v1_account(address, false);
                    domain_map
                }
            }
        };

        if let Some(domain_map) = domain_map {
            self.cached_domain_maps
                .borrow_mut()
                .insert((address, domain), domain_map);
        }
        Ok(domain_map)
    }

    /// Derives the account's storage format, reading as few registers as
    /// possible:
    ///
    /// 1. the cache answers without any register read;
    /// 2. the `"stored"` register present ⇒ v2;
    /// 3. the specific domain register present ⇒ v1;
    /// 4. with `only_check_specified_domain`, stop here: unknown;
    /// 5. any other domain register present ⇒ v1; else the account is new.
    fn account_storage_format(
        &self,
        address: Address,
        domain: Domain,
        only_check_specified_domain: bool,
    ) -> Result<AccountStorageFormat, StorageError> {
        match self.cached_v1_accounts.borrow().get(&address) {
            Some(true) => return Ok(AccountStorageFormat::V1),
            Some(false) => return Ok(AccountStorageFormat::V2),
            None => {}
        }
        let account_storage_v2 = self
            .account_storage_v2
            .as_ref()
            .ok_or(StorageError::Unreachable("format probe without v2 layer"))?;
        if account_storage_v2.has_account_storage_map(address)? {
            return Ok(AccountStorageFormat::V2);
        }
        if self.has_domain_register(address, domain)? {
            return Ok(AccountStorageFormat::V1);
        }
        if only_check_specified_domain {
            return Ok(AccountStorageFormat::Unknown);
        }
        if self.is_v1_account(address)? {
            return Ok(AccountStorageFormat::V1);
        }
        Ok(AccountStorageFormat::New)
    }

    fn has_domain_register(&self, address: Address, domain: Domain) -> Result<bool, StorageError> {
        Ok(ledger::read_slab_index(
            &*self.ledger.borrow(),
            address,
            domain.identifier().as_bytes(),
        )?
        .is_some())
    }

    /// Whether any v1 domain register exists for the account. Checks the
    /// most frequently used domains first.
    fn is_v1_account(&self, address: Address) -> Result<bool, StorageError> {
        for domain in Domain::ALL {
            if self.has_domain_register(address, domain)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn cache_is_v1_account(&self, address: Address, is_v1: bool) {
        self.cached_v1_accounts.borrow_mut().insert(address, is_v1);
    }

    /// Records a pending contract update; `None` means "delete the contract
    /// on commit". The update is not observable through the `contract`
    /// domain until commit.
    pub fn record_contract_update(&self, location: StorageKey, value: Option<Storable>) {
        // NOTE: a later record for the same location overwrites the value
        // but keeps the original position; the entry is never removed, so a
        // deletion tombstone survives to commit.
        self.contract_updates.borrow_mut().insert(location, value);
    }

    /// Whether a contract update has been recorded for `location`.
    pub fn contract_update_recorded(&self, location: &StorageKey) -> bool {
        self.contract_updates.borrow().contains_key(location)
    }

    fn commit_contract_updates<M: ComputationMeter + MemoryGauge>(
        &self,
        meter: &M,
    ) -> Result<(), StorageError> {
        let contract_updates = mem::take(&mut *self.contract_updates.borrow_mut());
        for (location, value) in contract_updates {
            let domain_map = self
                .get_domain_map(meter, location.address, Domain::Contract, true)?
                .ok_or(StorageError::Unreachable("contract domain map on create"))?;
            domain_map.write_value(&self.store, MapKey::String(location.key), value)?;
        }
        Ok(())
    }

    /// Schedules the account for v1 → v2 migration at commit.
    pub fn schedule_v2_migration(&self, address: Address) {
        self.scheduled_v2_migrations.borrow_mut().push(address);
    }

    /// Schedules every cached v1 account with unsaved slab changes for
    /// migration at commit.
    pub fn schedule_v2_migration_for_modified_accounts(&self) {
        let cached_v1_accounts = self.cached_v1_accounts.borrow();
        for (address, is_v1) in cached_v1_accounts.iter() {
            if *is_v1 && self.store.has_unsaved_changes(*address) {
                self.scheduled_v2_migrations.borrow_mut().push(*address);
            }
        }
    }

    fn migrate_v1_accounts_to_v2(&self) -> Result<(), StorageError> {
        let account_storage_v2 = self
            .account_storage_v2
            .as_ref()
            .ok_or(StorageError::MigrationDisabled)?;
        let mut scheduled = mem::take(&mut *self.scheduled_v2_migrations.borrow_mut());
        if scheduled.is_empty() {
            return Ok(());
        }
        // Migrate in a deterministic order; migrating an address twice
        // would orphan the first account storage map.
        scheduled.sort_unstable();
        scheduled.dedup();

        // Cached domain storage maps take precedence over a register read,
        // so uncommitted (new but cached) maps are not lost.
        let domain_map_source =
            |address: Address, domain: Domain| -> Result<Option<DomainStorageMap>, StorageError> {
                if let Some(domain_map) =
                    self.cached_domain_maps.borrow().get(&(address, domain))
                {
                    return Ok(Some(*domain_map));
                }
                self.account_storage_v1.get_domain_map(address, domain, false)
            };
        let migrator = DomainRegisterMigration::new(&self.ledger, &self.store, domain_map_source);

        for address in scheduled {
            let account_map = migrator.migrate_account(address)?;
            account_storage_v2.cache_account_storage_map(address, account_map);
            self.cache_is_v1_account(address, false);
        }
        Ok(())
    }

    /// Commits all accumulated mutations, in order: contract updates (if
    /// requested), the v1 layer, the v2 layer, scheduled migrations,
    /// metering, and finally the deterministic slab flush.
    pub fn commit<M: ComputationMeter + MemoryGauge>(
        &self,
        meter: &M,
        apply_contract_updates: bool,
    ) -> Result<(), StorageError> {
        self.commit_inner(meter, apply_contract_updates, true)
    }

    /// Commits with a nondeterministic slab flush order.
    ///
    /// Deprecated: for offline migration programs only, where commit
    /// ordering is not required.
    pub fn nondeterministic_commit<M: ComputationMeter + MemoryGauge>(
        &self,
        meter: &M,
        apply_contract_updates: bool,
    ) -> Result<(), StorageError> {
        self.commit_inner(meter, apply_contract_updates, false)
    }

    fn commit_inner<M: ComputationMeter + MemoryGauge>(
        &self,
        meter: &M,
        apply_contract_updates: bool,
        deterministic: bool,
    ) -> Result<(), StorageError> {
        if apply_contract_updates {
            self.commit_contract_updates(meter)?;
        }

        self.account_storage_v1.commit()?;

        match &self.account_storage_v2 {
            Some(account_storage_v2) => {
                account_storage_v2.commit()?;
                self.migrate_v1_accounts_to_v2()?;
            }
            None => {
                if !self.scheduled_v2_migrations.borrow().is_empty() {
                    return Err(StorageError::MigrationDisabled);
                }
            }
        }

        let deltas_size = self.store.deltas_size_without_temp()?;
        if deltas_size > 0 {
            meter.report_computation(ComputationKind::EncodeValue, deltas_size);
            meter.use_memory(deltas_size);
        }

        debug!(deltas_size, deterministic, "committing account storage");
        self.store.commit(num_cpus::get(), deterministic)
    }

    /// Checks whole-storage health: the slab tree must be intact, every
    /// account storage map and unmigrated domain storage map must point at
    /// a root slab, and every non-temp root slab must be attributable to an
    /// account.
    pub fn check_health(&self) -> Result<(), StorageError> {
        let mut expected_roots: Vec<SlabId> = Vec::new();
        if let Some(account_storage_v2) = &self.account_storage_v2 {
            expected_roots.extend(account_storage_v2.cached_root_slab_ids());
        }
        // Only accounts still in v1 store domain storage maps directly at
        // the root of the account.
        for ((address, _), domain_map) in self.cached_domain_maps.borrow().iter() {
            if self.is_v1_account(*address)? {
                expected_roots.push(domain_map.root_slab_id());
            }
        }
        expected_roots.sort_unstable();
        expected_roots.dedup();

        // Materialize the expected roots so the walk covers accounts that
        // were only handled by register this transaction. A root that no
        // longer exists is a dangling reference.
        for id in &expected_roots {
            match self.store.retrieve(*id) {
                Ok(_) => {}
                Err(StorageError::SlabNotFound(_)) => {
                    return Err(StorageError::DanglingRootReference(*id))
                }
                Err(err) => return Err(err),
            }
        }

        let root_slab_ids = self.store.check_health(-1)?;

        let account_root_slab_ids: BTreeSet<SlabId> = root_slab_ids
            .into_iter()
            .filter(|id| !id.is_temp())
            .collect();

        let mut found: BTreeSet<SlabId> = BTreeSet::new();
        for id in &expected_roots {
            if !account_root_slab_ids.contains(id) {
                return Err(StorageError::DanglingRootReference(*id));
            }
            found.insert(*id);
        }

        if account_root_slab_ids.len() > found.len() {
            let unreferenced: Vec<SlabId> = account_root_slab_ids
                .difference(&found)
                .copied()
                .collect();
            warn!(
                ?unreferenced,
                "storage health check found unreferenced root slabs"
            );
            return Err(StorageError::UnreferencedRootSlabs(unreferenced));
        }

        Ok(())
    }
}
