//! Off-chain decoding of the compacted proof grammar.
//!
//! Mirrors what the on-chain verifier does: rebuild every node bottom-up,
//! check each attached child against the reference it replaces, hash the
//! root and collect the proven values.

use std::collections::BTreeMap;

use bytes::Bytes;
use ethereum_types::{H256, U256};
use keccak_hash::keccak;
use rlp::{DecoderError, Rlp, RlpStream};
use thiserror::Error;

use super::{BRANCH_VALUE_SLOT, DELETION_MARKER};
use crate::{
    nibbles::Nibbles,
    node::{ChildRef, NodeDecodeError, TrieNode, BRANCH_WIDTH},
    utils::hashed_storage_key,
};

/// An error encountered when decoding a compacted proof.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The encoding is not valid RLP.
    #[error("Compacted proof is not valid RLP: {0}")]
    Rlp(#[from] DecoderError),

    /// An embedded trie node does not decode.
    #[error(transparent)]
    Node(#[from] NodeDecodeError),

    /// An item does not follow the grammar.
    #[error("Malformed item at {path}: {reason}")]
    Malformed {
        /// Path of the item in the trie.
        path: Nibbles,
        /// What is wrong with it.
        reason: String,
    },

    /// An attached child does not match the reference its parent holds.
    #[error("Child at {0} does not match its parent's reference")]
    ChildMismatch(Nibbles),

    /// A leaf's key does not hash to the path it sits at.
    #[error("Leaf for {key:#x} sits at {path}, which is not its key's path")]
    KeyPathMismatch {
        /// The key the leaf claims.
        key: H256,
        /// Where the leaf sits.
        path: Nibbles,
    },

    /// A deletion leaf replaces an existing child.
    #[error("Deletion leaf for {0:#x} occupies a non-empty slot")]
    MisplacedDeletion(H256),
}

/// A decoded compacted proof: the root it hashes to and every value it
/// proves.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CompactedProof {
    root_hash: H256,
    values: BTreeMap<H256, U256>,
}

enum Decoded {
    /// A node with this RLP.
    Node(Bytes),
    /// A leaf proving a key absent.
    Deletion(H256),
}

impl CompactedProof {
    /// Decodes `bytes`, recomputing the root hash and extracting every key's
    /// value.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let rlp = Rlp::new(bytes);
        let info = rlp.payload_info()?;
        if info.header_len + info.value_len != bytes.len() {
            return Err(DecodeError::Malformed {
                path: Nibbles::default(),
                reason: "trailing bytes".to_string(),
            });
        }

        let mut values = BTreeMap::new();
        let root_hash = match decode_item(&rlp, Nibbles::default(), &mut values)? {
            Decoded::Node(raw) => keccak(&raw),
            Decoded::Deletion(key) => return Err(DecodeError::MisplacedDeletion(key)),
        };

        Ok(Self { root_hash, values })
    }

    /// The root the proof hashes to.
    pub fn root_hash(&self) -> H256 {
        self.root_hash
    }

    /// The value proven for `key`, if the proof covers it.
    pub fn value(&self, key: H256) -> Option<U256> {
        self.values.get(&key).copied()
    }

    /// Every proven `key -> value` pair. Keys proven absent map to zero.
    pub fn values(&self) -> &BTreeMap<H256, U256> {
        &self.values
    }
}

fn malformed(path: &Nibbles, reason: impl Into<String>) -> DecodeError {
    DecodeError::Malformed {
        path: path.clone(),
        reason: reason.into(),
    }
}

fn decode_item(
    item: &Rlp,
    path: Nibbles,
    values: &mut BTreeMap<H256, U256>,
) -> Result<Decoded, DecodeError> {
    if !item.is_list() {
        return Err(malformed(&path, "expected a list"));
    }

    match item.item_count()? {
        3 => decode_leaf(item, path, values),
        2 => decode_inner(item, path, values),
        n => Err(malformed(&path, format!("list of {} items", n))),
    }
}

fn decode_leaf(
    item: &Rlp,
    path: Nibbles,
    values: &mut BTreeMap<H256, U256>,
) -> Result<Decoded, DecodeError> {
    let key = item.at(0)?.data()?;
    if key.len() != 32 {
        return Err(malformed(&path, format!("leaf key of {} bytes", key.len())));
    }
    let key = H256::from_slice(key);

    let encoded_path = item.at(1)?.data()?;
    let (leaf_path, is_leaf) = Nibbles::from_hex_prefix_encoding(encoded_path)
        .map_err(|err| malformed(&path, err.to_string()))?;
    if !is_leaf {
        return Err(malformed(&path, "leaf path without the leaf flag"));
    }

    let key_path = Nibbles::from_h256_be(hashed_storage_key(key));
    let value = item.at(2)?.data()?;
    if value == DELETION_MARKER {
        // Deletion leaves carry the key's path past its first nibble,
        // wherever they sit.
        if key_path.len() <= path.len()
            || !key_path.starts_with(&path)
            || leaf_path != key_path.truncate_n_nibbles_front(1)
        {
            return Err(DecodeError::KeyPathMismatch { key, path });
        }

        values.insert(key, U256::zero());
        return Ok(Decoded::Deletion(key));
    }

    let mut full_path = path.clone();
    for n in leaf_path.as_slice() {
        full_path.push_nibble_back(*n);
    }
    if full_path != key_path {
        return Err(DecodeError::KeyPathMismatch { key, path: full_path });
    }

    values.insert(key, decode_value(value, &path)?);

    let mut s = RlpStream::new_list(2);
    s.append(&encoded_path);
    s.append(&value);

    Ok(Decoded::Node(s.out().freeze()))
}

/// Decodes a branch or extension: `[[node], [children..]]`.
fn decode_inner(
    item: &Rlp,
    path: Nibbles,
    values: &mut BTreeMap<H256, U256>,
) -> Result<Decoded, DecodeError> {
    let wrapped = item.at(0)?;
    if !wrapped.is_list() || wrapped.item_count()? != 1 {
        return Err(malformed(&path, "node is not wrapped in a single item list"));
    }

    let raw = Bytes::copy_from_slice(wrapped.at(0)?.as_raw());
    let children = item.at(1)?;
    if !children.is_list() {
        return Err(malformed(&path, "children are not a list"));
    }

    match TrieNode::decode(&raw)? {
        TrieNode::Branch {
            children: refs,
            value,
        } => {
            if children.item_count()? != BRANCH_WIDTH + 1 {
                return Err(malformed(&path, "branch without 17 child slots"));
            }

            for (i, reference) in refs.iter().enumerate() {
                let mut child_path = path.clone();
                child_path.push_nibble_back(i as u8);
                attach_child(&children.at(i)?, reference, child_path, values)?;
            }

            decode_branch_value(&children.at(BRANCH_VALUE_SLOT)?, value, &path, values)?;
        }
        TrieNode::Extension {
            path: ext,
            child: reference,
        } => match children.item_count()? {
            0 => (),
            1 => {
                let mut child_path = path.clone();
                for n in ext.as_slice() {
                    child_path.push_nibble_back(*n);
                }
                attach_child(&children.at(0)?, &reference, child_path, values)?;
            }
            n => return Err(malformed(&path, format!("extension with {} children", n))),
        },
        TrieNode::Leaf { .. } => return Err(malformed(&path, "wrapped node is a leaf")),
    }

    Ok(Decoded::Node(raw))
}

fn attach_child(
    item: &Rlp,
    reference: &ChildRef,
    path: Nibbles,
    values: &mut BTreeMap<H256, U256>,
) -> Result<(), DecodeError> {
    if item.is_list() && item.item_count()? == 0 {
        return Ok(());
    }

    match (decode_item(item, path.clone(), values)?, reference) {
        (Decoded::Deletion(_), ChildRef::Empty) => Ok(()),
        (Decoded::Deletion(key), _) => Err(DecodeError::MisplacedDeletion(key)),
        (Decoded::Node(raw), reference) if reference.matches(&raw) => Ok(()),
        (Decoded::Node(_), _) => Err(DecodeError::ChildMismatch(path)),
    }
}

/// Slot 16 of a branch: `[key, "", value]` for a key ending at the branch.
fn decode_branch_value(
    item: &Rlp,
    value: Option<Bytes>,
    path: &Nibbles,
    values: &mut BTreeMap<H256, U256>,
) -> Result<(), DecodeError> {
    if !item.is_list() {
        return Err(malformed(path, "branch value slot is not a list"));
    }

    match (item.item_count()?, value) {
        (0, _) => Ok(()),
        (3, Some(value)) => {
            let key = item.at(0)?.data()?;
            if key.len() != 32 || !item.at(1)?.data()?.is_empty() {
                return Err(malformed(path, "malformed branch value leaf"));
            }
            let key = H256::from_slice(key);
            if *path != Nibbles::from_h256_be(hashed_storage_key(key)) {
                return Err(DecodeError::KeyPathMismatch {
                    key,
                    path: path.clone(),
                });
            }
            if item.at(2)?.data()? != &value[..] {
                return Err(DecodeError::ChildMismatch(path.clone()));
            }

            values.insert(key, decode_value(&value, path)?);
            Ok(())
        }
        _ => Err(malformed(path, "branch value slot does not match the branch")),
    }
}

fn decode_value(raw: &[u8], path: &Nibbles) -> Result<U256, DecodeError> {
    rlp::decode(raw).map_err(|err| malformed(path, format!("value does not decode: {}", err)))
}
