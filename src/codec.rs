//! CBOR codec for slabs and stored values.
//!
//! Slabs and storables are encoded as tagged CBOR. The tag space below is
//! private to the engine, except for the two legacy link tags, which are
//! reserved for decode-only compatibility with data written before links
//! were replaced by capabilities.
//!
//! NOTE: never change a tag number, only add; reserved numbers must not be
//! reused.

use ciborium::value::{Integer, Value};

use crate::error::{DecodeError, EncodeError};
use crate::slab::{Address, MapNode, Slab, SlabId, SlabIndex};
use crate::value::{Capability, MapKey, Storable};

pub(crate) const TAG_SLAB_REF: u64 = 224;
pub(crate) const TAG_CAPABILITY: u64 = 225;
pub(crate) const TAG_INT: u64 = 226;
pub(crate) const TAG_MAP_ROOT: u64 = 227;
pub(crate) const TAG_MAP_LEAF: u64 = 228;
pub(crate) const TAG_MAP_BRANCH: u64 = 229;
pub(crate) const TAG_OVERFLOW: u64 = 230;

// Legacy link values. Decoded for compatibility, never encoded.
pub(crate) const TAG_LEGACY_PATH_LINK: u64 = 231;
pub(crate) const TAG_LEGACY_ACCOUNT_LINK: u64 = 232;

const SLAB_ID_LENGTH: usize = 16;
const ACCOUNT_LINK_BORROW_TYPE: &str = "&Account";

/// Encodes a slab to its ledger register representation.
pub(crate) fn encode_slab(slab: &Slab) -> Result<Vec<u8>, EncodeError> {
    to_bytes(&slab_to_value(slab))
}

/// Decodes a slab from its ledger register representation.
pub(crate) fn decode_slab(bytes: &[u8]) -> Result<Slab, DecodeError> {
    value_to_slab(from_bytes(bytes)?)
}

/// Encodes a single storable. Used to decide whether a value spills out of
/// line.
pub(crate) fn encode_storable(storable: &Storable) -> Result<Vec<u8>, EncodeError> {
    to_bytes(&storable_to_value(storable))
}

/// Decodes a single storable.
#[cfg(test)]
pub(crate) fn decode_storable(bytes: &[u8]) -> Result<Storable, DecodeError> {
    value_to_storable(from_bytes(bytes)?)
}

fn to_bytes(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|err| EncodeError::Cbor(err.to_string()))?;
    Ok(bytes)
}

fn from_bytes(bytes: &[u8]) -> Result<Value, DecodeError> {
    ciborium::from_reader(bytes).map_err(|err: ciborium::de::Error<std::io::Error>| {
        DecodeError::Cbor(err.to_string())
    })
}

fn slab_to_value(slab: &Slab) -> Value {
    match slab {
        Slab::MapRoot { count, node } => Value::Tag(
            TAG_MAP_ROOT,
            Box::new(Value::Array(vec![
                Value::Integer(Integer::from(*count)),
                node_to_value(node),
            ])),
        ),
        Slab::MapNode(node) => node_to_value(node),
        Slab::Overflow(storable) => {
            Value::Tag(TAG_OVERFLOW, Box::new(storable_to_value(storable)))
        }
    }
}

fn value_to_slab(value: Value) -> Result<Slab, DecodeError> {
    match value {
        Value::Tag(TAG_MAP_ROOT, content) => {
            let (count, node) = into_pair(*content, "map root slab")?;
            Ok(Slab::MapRoot {
                count: value_to_u64(count, "map root count")?,
                node: value_to_node(node)?,
            })
        }
        Value::Tag(TAG_MAP_LEAF, _) | Value::Tag(TAG_MAP_BRANCH, _) => {
            Ok(Slab::MapNode(value_to_node(value)?))
        }
        Value::Tag(TAG_OVERFLOW, content) => Ok(Slab::Overflow(value_to_storable(*content)?)),
        Value::Tag(tag, _) => Err(DecodeError::UnknownTag(tag)),
        _ => Err(DecodeError::Malformed("slab")),
    }
}

fn node_to_value(node: &MapNode) -> Value {
    match node {
        MapNode::Leaf { entries } => Value::Tag(
            TAG_MAP_LEAF,
            Box::new(Value::Array(
                entries
                    .iter()
                    .map(|(key, storable)| {
                        Value::Array(vec![map_key_to_value(key), storable_to_value(storable)])
                    })
                    .collect(),
            )),
        ),
        MapNode::Branch { children } => Value::Tag(
            TAG_MAP_BRANCH,
            Box::new(Value::Array(
                children
                    .iter()
                    .map(|(separator, child)| {
                        Value::Array(vec![
                            map_key_to_value(separator),
                            Value::Bytes(slab_id_bytes(*child)),
                        ])
                    })
                    .collect(),
            )),
        ),
    }
}

fn value_to_node(value: Value) -> Result<MapNode, DecodeError> {
    match value {
        Value::Tag(TAG_MAP_LEAF, content) => {
            let mut entries = Vec::new();
            for pair in into_array(*content, "map leaf")? {
                let (key, value) = into_pair(pair, "map leaf entry")?;
                entries.push((value_to_map_key(key)?, value_to_storable(value)?));
            }
            Ok(MapNode::Leaf { entries })
        }
        Value::Tag(TAG_MAP_BRANCH, content) => {
            let mut children = Vec::new();
            for pair in into_array(*content, "map branch")? {
                let (separator, child) = into_pair(pair, "map branch child")?;
                let child = match child {
                    Value::Bytes(bytes) => bytes_to_slab_id(&bytes)?,
                    _ => return Err(DecodeError::Malformed("map branch child reference")),
                };
                children.push((value_to_map_key(separator)?, child));
            }
            Ok(MapNode::Branch { children })
        }
        Value::Tag(tag, _) => Err(DecodeError::UnknownTag(tag)),
        _ => Err(DecodeError::Malformed("map node")),
    }
}

fn storable_to_value(storable: &Storable) -> Value {
    match storable {
        Storable::Bool(value) => Value::Bool(*value),
        Storable::U64(value) => Value::Integer(Integer::from(*value)),
        // Tagged so that non-negative signed values survive a round trip.
        Storable::Int(value) => Value::Tag(
            TAG_INT,
            Box::new(Value::Integer(Integer::from(*value))),
        ),
        Storable::String(value) => Value::Text(value.clone()),
        Storable::Bytes(value) => Value::Bytes(value.clone()),
        Storable::Array(elements) => {
            Value::Array(elements.iter().map(storable_to_value).collect())
        }
        Storable::Capability(capability) => Value::Tag(
            TAG_CAPABILITY,
            Box::new(Value::Array(vec![
                Value::Text(capability.path.clone()),
                Value::Text(capability.borrow_type.clone()),
            ])),
        ),
        Storable::SlabRef(id) => Value::Tag(TAG_SLAB_REF, Box::new(Value::Bytes(slab_id_bytes(*id)))),
    }
}

fn value_to_storable(value: Value) -> Result<Storable, DecodeError> {
    match value {
        Value::Bool(value) => Ok(Storable::Bool(value)),
        Value::Integer(value) => match u64::try_from(value) {
            Ok(value) => Ok(Storable::U64(value)),
            Err(_) => i64::try_from(value)
                .map(Storable::Int)
                .map_err(|_| DecodeError::Malformed("integer storable out of range")),
        },
        Value::Text(value) => Ok(Storable::String(value)),
        Value::Bytes(value) => Ok(Storable::Bytes(value)),
        Value::Array(elements) => Ok(Storable::Array(
            elements
                .into_iter()
                .map(value_to_storable)
                .collect::<Result<_, _>>()?,
        )),
        Value::Tag(TAG_INT, content) => match *content {
            Value::Integer(value) => i64::try_from(value)
                .map(Storable::Int)
                .map_err(|_| DecodeError::Malformed("signed integer storable out of range")),
            _ => Err(DecodeError::Malformed("signed integer storable")),
        },
        Value::Tag(TAG_CAPABILITY, content) => {
            let (path, borrow_type) = into_pair(*content, "capability storable")?;
            Ok(Storable::Capability(Capability {
                path: into_text(path, "capability path")?,
                borrow_type: into_text(borrow_type, "capability borrow type")?,
            }))
        }
        Value::Tag(TAG_SLAB_REF, content) => match *content {
            Value::Bytes(bytes) => Ok(Storable::SlabRef(bytes_to_slab_id(&bytes)?)),
            _ => Err(DecodeError::Malformed("slab reference storable")),
        },
        Value::Tag(TAG_LEGACY_PATH_LINK, content) => {
            let (path, borrow_type) = into_pair(*content, "path link storable")?;
            Ok(Storable::Capability(Capability {
                path: into_text(path, "path link target")?,
                borrow_type: into_text(borrow_type, "path link type")?,
            }))
        }
        Value::Tag(TAG_LEGACY_ACCOUNT_LINK, content) => match *content {
            Value::Null => Ok(Storable::Capability(Capability {
                path: String::new(),
                borrow_type: ACCOUNT_LINK_BORROW_TYPE.to_owned(),
            })),
            _ => Err(DecodeError::Malformed("account link storable")),
        },
        Value::Tag(tag, _) => Err(DecodeError::UnknownTag(tag)),
        _ => Err(DecodeError::Malformed("storable")),
    }
}

fn map_key_to_value(key: &MapKey) -> Value {
    match key {
        MapKey::U64(key) => Value::Integer(Integer::from(*key)),
        MapKey::String(key) => Value::Text(key.clone()),
    }
}

fn value_to_map_key(value: Value) -> Result<MapKey, DecodeError> {
    match value {
        Value::Integer(key) => u64::try_from(key)
            .map(MapKey::U64)
            .map_err(|_| DecodeError::Malformed("integer map key out of range")),
        Value::Text(key) => Ok(MapKey::String(key)),
        _ => Err(DecodeError::Malformed("map key")),
    }
}

fn slab_id_bytes(id: SlabId) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SLAB_ID_LENGTH);
    bytes.extend_from_slice(id.address.as_bytes());
    bytes.extend_from_slice(&id.index.to_le_bytes());
    bytes
}

fn bytes_to_slab_id(bytes: &[u8]) -> Result<SlabId, DecodeError> {
    if bytes.len() != SLAB_ID_LENGTH {
        return Err(DecodeError::Malformed("slab ID length"));
    }
    let mut address = [0u8; 8];
    address.copy_from_slice(&bytes[..8]);
    let mut index = [0u8; 8];
    index.copy_from_slice(&bytes[8..]);
    Ok(SlabId::new(
        Address(address),
        SlabIndex::from_le_bytes(index),
    ))
}

fn into_array(value: Value, what: &'static str) -> Result<Vec<Value>, DecodeError> {
    match value {
        Value::Array(elements) => Ok(elements),
        _ => Err(DecodeError::Malformed(what)),
    }
}

fn into_pair(value: Value, what: &'static str) -> Result<(Value, Value), DecodeError> {
    let mut elements = into_array(value, what)?.into_iter();
    match (elements.next(), elements.next(), elements.next()) {
        (Some(first), Some(second), None) => Ok((first, second)),
        _ => Err(DecodeError::Malformed(what)),
    }
}

fn into_text(value: Value, what: &'static str) -> Result<String, DecodeError> {
    match value {
        Value::Text(text) => Ok(text),
        _ => Err(DecodeError::Malformed(what)),
    }
}

fn value_to_u64(value: Value, what: &'static str) -> Result<u64, DecodeError> {
    match value {
        Value::Integer(value) => u64::try_from(value).map_err(|_| DecodeError::Malformed(what)),
        _ => Err(DecodeError::Malformed(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(address: u8, index: u64) -> SlabId {
        SlabId::new(Address([address; 8]), SlabIndex(index))
    }

    #[test]
    fn storable_round_trips() {
        let storables = vec![
            Storable::Bool(true),
            Storable::U64(42),
            Storable::Int(-42),
            Storable::Int(42),
            Storable::String("hello".to_owned()),
            Storable::Bytes(vec![0, 1, 2]),
            Storable::Array(vec![Storable::U64(1), Storable::String("x".to_owned())]),
            Storable::Capability(Capability {
                path: "/public/counter".to_owned(),
                borrow_type: "&Counter".to_owned(),
            }),
            Storable::SlabRef(id(3, 17)),
        ];
        for storable in storables {
            let bytes = encode_storable(&storable).unwrap();
            assert_eq!(decode_storable(&bytes).unwrap(), storable);
        }
    }

    #[test]
    fn slab_round_trips() {
        let slabs = vec![
            Slab::MapRoot {
                count: 2,
                node: MapNode::Leaf {
                    entries: vec![
                        (MapKey::from(1u64), Storable::U64(10)),
                        (MapKey::from("k"), Storable::Bool(false)),
                    ],
                },
            },
            Slab::MapNode(MapNode::Branch {
                children: vec![
                    (MapKey::from("a"), id(1, 2)),
                    (MapKey::from("m"), id(1, 3)),
                ],
            }),
            Slab::Overflow(Storable::Bytes(vec![9; 64])),
        ];
        for slab in slabs {
            let bytes = encode_slab(&slab).unwrap();
            assert_eq!(decode_slab(&bytes).unwrap(), slab);
        }
    }

    #[test]
    fn legacy_path_link_decodes_to_capability() {
        let legacy = Value::Tag(
            TAG_LEGACY_PATH_LINK,
            Box::new(Value::Array(vec![
                Value::Text("/public/vault".to_owned()),
                Value::Text("&Vault".to_owned()),
            ])),
        );
        let mut bytes = Vec::new();
        ciborium::into_writer(&legacy, &mut bytes).unwrap();
        assert_eq!(
            decode_storable(&bytes).unwrap(),
            Storable::Capability(Capability {
                path: "/public/vault".to_owned(),
                borrow_type: "&Vault".to_owned(),
            })
        );
    }

    #[test]
    fn legacy_account_link_decodes_to_capability() {
        let legacy = Value::Tag(TAG_LEGACY_ACCOUNT_LINK, Box::new(Value::Null));
        let mut bytes = Vec::new();
        ciborium::into_writer(&legacy, &mut bytes).unwrap();
        assert_eq!(
            decode_storable(&bytes).unwrap(),
            Storable::Capability(Capability {
                path: String::new(),
                borrow_type: ACCOUNT_LINK_BORROW_TYPE.to_owned(),
            })
        );
    }

    #[test]
    fn encoding_never_emits_legacy_tags() {
        let capability = Storable::Capability(Capability {
            path: "/public/vault".to_owned(),
            borrow_type: "&Vault".to_owned(),
        });
        let bytes = encode_storable(&capability).unwrap();
        let value: Value = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert!(matches!(value, Value::Tag(TAG_CAPABILITY, _)));
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let tagged = Value::Tag(199, Box::new(Value::Null));
        let mut bytes = Vec::new();
        ciborium::into_writer(&tagged, &mut bytes).unwrap();
        assert_eq!(decode_storable(&bytes), Err(DecodeError::UnknownTag(199)));
        assert_eq!(decode_slab(&bytes), Err(DecodeError::UnknownTag(199)));
    }

    #[test]
    fn truncated_slab_is_a_decode_error() {
        let bytes = encode_slab(&Slab::Overflow(Storable::U64(7))).unwrap();
        assert!(matches!(
            decode_slab(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Cbor(_))
        ));
    }
}
