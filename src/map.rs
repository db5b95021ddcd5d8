//! Persistent ordered maps over the slab store.
//!
//! [`StorageMap`] is the generic ordered map: a page tree whose root slab ID
//! is stable for the lifetime of the map. Root splits push entries down into
//! fresh child slabs; a root branch left with a single child collapses it
//! back, destroying the child slab. [`DomainStorageMap`] layers value
//! semantics on top: storables whose encoding exceeds the inline threshold
//! spill into their own slab and are referenced by ID.

use crate::codec;
use crate::error::StorageError;
use crate::ledger::Ledger;
use crate::slab::{Address, MapNode, Slab, SlabId};
use crate::store::PersistentSlabStore;
use crate::value::{MapKey, Storable};

/// Maximum entries in one map page before it splits.
pub(crate) const MAX_NODE_ENTRIES: usize = 32;

/// Storables whose encoding exceeds this spill into their own slab.
pub(crate) const MAX_INLINE_ELEMENT_SIZE: usize = 512;

/// Handle to a persistent ordered map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageMap {
    root: SlabId,
}

impl StorageMap {
    /// Creates an empty map owned by `address`, allocating its root slab.
    pub fn new<L: Ledger>(
        store: &PersistentSlabStore<L>,
        address: Address,
    ) -> Result<Self, StorageError> {
        let root = store.new_slab_id(address)?;
        store.store(
            root,
            Slab::MapRoot {
                count: 0,
                node: MapNode::Leaf { entries: Vec::new() },
            },
        );
        Ok(StorageMap { root })
    }

    /// Handle to an existing map rooted at `root`.
    pub fn from_root(root: SlabId) -> Self {
        StorageMap { root }
    }

    /// The root slab ID. Stable for the lifetime of the map.
    pub fn root_slab_id(&self) -> SlabId {
        self.root
    }

    /// Number of entries in the map.
    pub fn count<L: Ledger>(&self, store: &PersistentSlabStore<L>) -> Result<u64, StorageError> {
        Ok(self.load_root(store)?.0)
    }

    /// Looks up the value under `key`.
    pub fn get<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
        key: &MapKey,
    ) -> Result<Option<Storable>, StorageError> {
        let (_, node) = self.load_root(store)?;
        get_in(store, &node, key)
    }

    /// Inserts `value` under `key`, returning the previous value if any.
    pub fn insert<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
        key: MapKey,
        value: Storable,
    ) -> Result<Option<Storable>, StorageError> {
        let (mut count, mut node) = self.load_root(store)?;
        let outcome = insert_in(store, self.root.address, &mut node, key, value)?;
        if let Some((separator, right)) = outcome.split {
            node = split_root(store, self.root.address, node, separator, right)?;
        }
        if outcome.previous.is_none() {
            count += 1;
        }
        store.store(self.root, Slab::MapRoot { count, node });
        Ok(outcome.previous)
    }

    /// Removes the entry under `key`, returning its value if it existed.
    /// Removing a missing key does not dirty any slab.
    pub fn remove<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
        key: &MapKey,
    ) -> Result<Option<Storable>, StorageError> {
        let (mut count, mut node) = self.load_root(store)?;
        let removed = remove_in(store, &mut node, key)?;
        if removed.is_none() {
            return Ok(None);
        }
        count -= 1;
        loop {
            let sole_child = match &node {
                MapNode::Branch { children } if children.is_empty() => None,
                MapNode::Branch { children } if children.len() == 1 => Some(children[0].1),
                _ => break,
            };
            node = match sole_child {
                None => MapNode::Leaf { entries: Vec::new() },
                Some(child_id) => {
                    let child = load_node(store, child_id)?;
                    store.remove(child_id);
                    child
                }
            };
        }
        store.store(self.root, Slab::MapRoot { count, node });
        Ok(removed)
    }

    /// All entries, in key order.
    pub fn entries<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
    ) -> Result<Vec<(MapKey, Storable)>, StorageError> {
        let (_, node) = self.load_root(store)?;
        let mut entries = Vec::new();
        collect_entries(store, &node, &mut entries)?;
        Ok(entries)
    }

    fn load_root<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
    ) -> Result<(u64, MapNode), StorageError> {
        match store.retrieve(self.root)? {
            Slab::MapRoot { count, node } => Ok((count, node)),
            _ => Err(StorageError::UnexpectedSlab {
                id: self.root,
                expected: "map root",
            }),
        }
    }
}

struct InsertOutcome {
    previous: Option<Storable>,
    /// `(separator, right half)` when the page overflowed and split.
    split: Option<(MapKey, SlabId)>,
}

fn load_node<L: Ledger>(
    store: &PersistentSlabStore<L>,
    id: SlabId,
) -> Result<MapNode, StorageError> {
    match store.retrieve(id)? {
        Slab::MapNode(node) => Ok(node),
        _ => Err(StorageError::UnexpectedSlab {
            id,
            expected: "map node",
        }),
    }
}

/// Index of the child covering `key`: the last child whose separator is not
/// above `key`; keys below the first separator route to the first child.
fn route(children: &[(MapKey, SlabId)], key: &MapKey) -> usize {
    match children.partition_point(|(separator, _)| separator <= key) {
        0 => 0,
        covering => covering - 1,
    }
}

fn first_key(node: &MapNode) -> Option<MapKey> {
    match node {
        MapNode::Leaf { entries } => entries.first().map(|(key, _)| key.clone()),
        MapNode::Branch { children } => children.first().map(|(separator, _)| separator.clone()),
    }
}

/// Pushes a split root's halves down one level, keeping the root slab ID.
fn split_root<L: Ledger>(
    store: &PersistentSlabStore<L>,
    address: Address,
    left: MapNode,
    separator: MapKey,
    right: SlabId,
) -> Result<MapNode, StorageError> {
    let left_key = first_key(&left).ok_or(StorageError::Unreachable("split of an empty page"))?;
    let left_id = store.new_slab_id(address)?;
    store.store(left_id, Slab::MapNode(left));
    Ok(MapNode::Branch {
        children: vec![(left_key, left_id), (separator, right)],
    })
}

fn get_in<L: Ledger>(
    store: &PersistentSlabStore<L>,
    node: &MapNode,
    key: &MapKey,
) -> Result<Option<Storable>, StorageError> {
    match node {
        MapNode::Leaf { entries } => Ok(entries
            .binary_search_by(|(entry_key, _)| entry_key.cmp(key))
            .ok()
            .map(|found| entries[found].1.clone())),
        MapNode::Branch { children } => {
            let child = load_node(store, children[route(children, key)].1)?;
            get_in(store, &child, key)
        }
    }
}

fn insert_in<L: Ledger>(
    store: &PersistentSlabStore<L>,
    address: Address,
    node: &mut MapNode,
    key: MapKey,
    value: Storable,
) -> Result<InsertOutcome, StorageError> {
    match node {
        MapNode::Leaf { entries } => {
            let previous = match entries.binary_search_by(|(entry_key, _)| entry_key.cmp(&key)) {
                Ok(found) => Some(std::mem::replace(&mut entries[found].1, value)),
                Err(position) => {
                    entries.insert(position, (key, value));
                    None
                }
            };
            let split = if entries.len() > MAX_NODE_ENTRIES {
                let right = entries.split_off(entries.len() / 2);
                let separator = right[0].0.clone();
                let right_id = store.new_slab_id(address)?;
                store.store(right_id, Slab::MapNode(MapNode::Leaf { entries: right }));
                Some((separator, right_id))
            } else {
                None
            };
            Ok(InsertOutcome { previous, split })
        }
        MapNode::Branch { children } => {
            let position = route(children, &key);
            let child_id = children[position].1;
            let mut child = load_node(store, child_id)?;
            let outcome = insert_in(store, address, &mut child, key, value)?;
            store.store(child_id, Slab::MapNode(child));
            if let Some((separator, right)) = outcome.split {
                children.insert(position + 1, (separator, right));
            }
            let split = if children.len() > MAX_NODE_ENTRIES {
                let right = children.split_off(children.len() / 2);
                let separator = right[0].0.clone();
                let right_id = store.new_slab_id(address)?;
                store.store(right_id, Slab::MapNode(MapNode::Branch { children: right }));
                Some((separator, right_id))
            } else {
                None
            };
            Ok(InsertOutcome {
                previous: outcome.previous,
                split,
            })
        }
    }
}

fn remove_in<L: Ledger>(
    store: &PersistentSlabStore<L>,
    node: &mut MapNode,
    key: &MapKey,
) -> Result<Option<Storable>, StorageError> {
    match node {
        MapNode::Leaf { entries } => {
            match entries.binary_search_by(|(entry_key, _)| entry_key.cmp(key)) {
                Ok(found) => Ok(Some(entries.remove(found).1)),
                Err(_) => Ok(None),
            }
        }
        MapNode::Branch { children } => {
            let position = route(children, key);
            let child_id = children[position].1;
            let mut child = load_node(store, child_id)?;
            let removed = remove_in(store, &mut child, key)?;
            if removed.is_none() {
                return Ok(None);
            }
            if child.is_empty() {
                // Empty page: destroy it and drop the route.
                store.remove(child_id);
                children.remove(position);
            } else {
                store.store(child_id, Slab::MapNode(child));
            }
            Ok(removed)
        }
    }
}

fn collect_entries<L: Ledger>(
    store: &PersistentSlabStore<L>,
    node: &MapNode,
    entries: &mut Vec<(MapKey, Storable)>,
) -> Result<(), StorageError> {
    match node {
        MapNode::Leaf {
            entries: leaf_entries,
        } => entries.extend(leaf_entries.iter().cloned()),
        MapNode::Branch { children } => {
            for (_, child_id) in children {
                let child = load_node(store, *child_id)?;
                collect_entries(store, &child, entries)?;
            }
        }
    }
    Ok(())
}

/// The ordered key→value map stored under one `(address, domain)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStorageMap {
    map: StorageMap,
}

impl DomainStorageMap {
    /// Creates an empty domain storage map owned by `address`.
    pub fn new<L: Ledger>(
        store: &PersistentSlabStore<L>,
        address: Address,
    ) -> Result<Self, StorageError> {
        Ok(DomainStorageMap {
            map: StorageMap::new(store, address)?,
        })
    }

    /// Handle to an existing domain storage map rooted at `root`.
    pub fn from_root(root: SlabId) -> Self {
        DomainStorageMap {
            map: StorageMap::from_root(root),
        }
    }

    /// The root slab ID.
    pub fn root_slab_id(&self) -> SlabId {
        self.map.root_slab_id()
    }

    /// Number of entries.
    pub fn count<L: Ledger>(&self, store: &PersistentSlabStore<L>) -> Result<u64, StorageError> {
        self.map.count(store)
    }

    /// Reads the value under `key`, resolving spilled storables.
    pub fn read_value<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
        key: &MapKey,
    ) -> Result<Option<Storable>, StorageError> {
        match self.map.get(store, key)? {
            None => Ok(None),
            Some(Storable::SlabRef(id)) => Ok(Some(resolve_overflow(store, id)?)),
            Some(storable) => Ok(Some(storable)),
        }
    }

    /// Writes `value` under `key`; `None` removes the entry. Large values
    /// spill into their own slab; a replaced or removed spill slab is
    /// destroyed. Returns whether an entry existed before.
    pub fn write_value<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
        key: MapKey,
        value: Option<Storable>,
    ) -> Result<bool, StorageError> {
        let previous = match value {
            Some(storable) => {
                let storable = spill_if_large(store, self.root_slab_id().address, storable)?;
                self.map.insert(store, key, storable)?
            }
            None => self.map.remove(store, &key)?,
        };
        let existed = previous.is_some();
        if let Some(Storable::SlabRef(id)) = previous {
            store.remove(id);
        }
        Ok(existed)
    }

    /// All entries in key order, with spilled storables resolved.
    pub fn entries<L: Ledger>(
        &self,
        store: &PersistentSlabStore<L>,
    ) -> Result<Vec<(MapKey, Storable)>, StorageError> {
        self.map
            .entries(store)?
            .into_iter()
            .map(|(key, storable)| {
                let storable = match storable {
                    Storable::SlabRef(id) => resolve_overflow(store, id)?,
                    storable => storable,
                };
                Ok((key, storable))
            })
            .collect()
    }
}

fn resolve_overflow<L: Ledger>(
    store: &PersistentSlabStore<L>,
    id: SlabId,
) -> Result<Storable, StorageError> {
    match store.retrieve(id)? {
        Slab::Overflow(storable) => Ok(storable),
        _ => Err(StorageError::UnexpectedSlab {
            id,
            expected: "overflow slab",
        }),
    }
}

fn spill_if_large<L: Ledger>(
    store: &PersistentSlabStore<L>,
    address: Address,
    storable: Storable,
) -> Result<Storable, StorageError> {
    if matches!(storable, Storable::SlabRef(_)) {
        return Ok(storable);
    }
    if codec::encode_storable(&storable)?.len() <= MAX_INLINE_ELEMENT_SIZE {
        return Ok(storable);
    }
    let id = store.new_slab_id(address)?;
    store.store(id, Slab::Overflow(storable));
    Ok(Storable::SlabRef(id))
}
