//! Stored values and map keys.

use std::fmt;

use crate::slab::SlabId;

/// Key of a domain storage map entry: a user-chosen string or integer.
///
/// Integer keys order before string keys; within a kind the natural order
/// applies. The derived order is the canonical map order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    /// An integer key.
    U64(u64),
    /// A string key.
    String(String),
}

impl From<u64> for MapKey {
    fn from(key: u64) -> Self {
        MapKey::U64(key)
    }
}

impl From<&str> for MapKey {
    fn from(key: &str) -> Self {
        MapKey::String(key.to_owned())
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapKey::U64(key) => write!(f, "{}", key),
            MapKey::String(key) => f.write_str(key),
        }
    }
}

/// A capability to a stored path.
///
/// Legacy path-link and account-link values decode to this kind; see the
/// codec for the reserved tag numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    /// The target path.
    pub path: String,
    /// The type the capability may be borrowed as.
    pub borrow_type: String,
}

/// A stored value, as the engine sees it.
///
/// One variant per stored value kind. `SlabRef` is engine-produced: it
/// stands for a storable spilled into its own slab (when its encoding
/// exceeds the inline threshold) or, in an account storage map, for a
/// domain storage map root.
#[derive(Debug, Clone, PartialEq)]
pub enum Storable {
    /// A boolean.
    Bool(bool),
    /// An unsigned integer.
    U64(u64),
    /// A signed integer.
    Int(i64),
    /// A string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// An array of storables, stored inline.
    Array(Vec<Storable>),
    /// A capability.
    Capability(Capability),
    /// A reference to another slab.
    SlabRef(SlabId),
}

impl Storable {
    /// The slab IDs this storable refers to, at any nesting depth.
    pub fn child_ids(&self) -> Vec<SlabId> {
        let mut ids = Vec::new();
        self.collect_child_ids(&mut ids);
        ids
    }

    fn collect_child_ids(&self, ids: &mut Vec<SlabId>) {
        match self {
            Storable::SlabRef(id) => ids.push(*id),
            Storable::Array(elements) => {
                for element in elements {
                    element.collect_child_ids(ids);
                }
            }
            Storable::Bool(_)
            | Storable::U64(_)
            | Storable::Int(_)
            | Storable::String(_)
            | Storable::Bytes(_)
            | Storable::Capability(_) => {}
        }
    }
}
