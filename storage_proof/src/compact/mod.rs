//! Merging of per-slot storage proofs into a single compacted proof.
//!
//! Proofs for many slots of the same storage trie share most of their upper
//! nodes. [`ProofCompactor`] merges a batch of them into one tree holding
//! every distinct node once, and [`CompactedTrie::encode`] serializes that
//! tree into the grammar an on-chain verifier walks bottom-up:
//!
//! - Leaf: `[key, path, value]` where `path` is the hex prefix encoded
//!   remainder of the key's path and `value` the RLP of the slot's value.
//! - Branch: `[[node], [child_0, .., child_16]]`, unreached slots being the
//!   empty list and slot 16 holding a leaf for a key ending at the branch.
//! - Extension: `[[node], [child]]`, or `[[node], []]` without a child.
//!
//! `node` is the raw RLP of the original trie node, embedded as is.
//!
//! A zero valued key whose proof ends at an empty slot of a branch gets a
//! deletion leaf in that slot: `[key, path, 0x00]` where `path` is the hex
//! prefix encoding of the key's path without its first nibble. A single
//! `0x00` byte is never the RLP of a value, so the two kinds of leaves cannot
//! be confused.

mod decode;

use bytes::Bytes;
use ethereum_types::H256;
use keccak_hash::keccak;
use log::{debug, trace};
use rlp::RlpStream;
use thiserror::Error;

pub use self::decode::{CompactedProof, DecodeError};
use crate::{
    nibbles::Nibbles,
    node::{TrieNode, BRANCH_WIDTH},
    proof::StorageProof,
    utils::{hashed_storage_key, EMPTY_TRIE_HASH},
    verify::{walk_storage_proof, Terminal, VerifyError},
};

/// Slot of a branch that holds the leaf of a key ending at the branch.
pub const BRANCH_VALUE_SLOT: usize = BRANCH_WIDTH;

/// Value of a deletion leaf.
pub const DELETION_MARKER: &[u8] = &[0x00];

/// An error encountered when compacting proofs.
#[derive(Debug, Error)]
pub enum CompactError {
    /// A proof does not start at the batch's storage root.
    #[error("Proof for {key:#x} starts at {found:#x} but the batch root is {expected:#x}")]
    RootMismatch {
        /// The slot whose proof is off.
        key: H256,
        /// Root of the batch (fixed by its first proof).
        expected: H256,
        /// Hash of the proof's first node.
        found: H256,
    },

    /// A proof failed verification.
    #[error(transparent)]
    Proof(#[from] VerifyError),

    /// The merged tree would take an impossible shape.
    #[error("Construction invariant violated while inserting {key:#x}: {reason}")]
    ConstructionInvariantViolation {
        /// The slot being inserted.
        key: H256,
        /// What went wrong.
        reason: String,
    },
}

/// A node of the compacted tree. Children are indices into the arena.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum CompactNode {
    Branch {
        raw: Bytes,
        children: [Option<usize>; BRANCH_WIDTH + 1],
    },
    Extension {
        raw: Bytes,
        child: Option<usize>,
    },
    Leaf {
        key: H256,
        /// Hex prefix encoded path (empty for a leaf in a branch value slot).
        path: Bytes,
        /// RLP of the slot's value ([`DELETION_MARKER`] for a deletion leaf).
        value: Bytes,
    },
}

impl CompactNode {
    fn name(&self) -> &'static str {
        match self {
            CompactNode::Branch { .. } => "Branch",
            CompactNode::Extension { .. } => "Extension",
            CompactNode::Leaf { .. } => "Leaf",
        }
    }

    /// Whether both stand for the same trie node. Attached children are not
    /// part of a node's identity.
    fn is_same_node(&self, other: &CompactNode) -> bool {
        match (self, other) {
            (CompactNode::Branch { raw: a, .. }, CompactNode::Branch { raw: b, .. })
            | (CompactNode::Extension { raw: a, .. }, CompactNode::Extension { raw: b, .. }) => {
                a == b
            }
            (a, b) => a == b,
        }
    }

    fn is_deletion(&self) -> bool {
        matches!(self, CompactNode::Leaf { value, .. } if value[..] == *DELETION_MARKER)
    }
}

/// Where a node hangs: the root, or a slot of an arena node.
#[derive(Copy, Clone, Debug)]
enum Position {
    Root,
    Slot { parent: usize, slot: usize },
}

/// Incrementally merges storage proofs sharing one root.
///
/// The root is fixed by the first proof inserted (or by
/// [`ProofCompactor::with_root`]). Every proof is verified before it is
/// merged.
#[derive(Debug, Default)]
pub struct ProofCompactor {
    storage_root: Option<H256>,
    nodes: Vec<CompactNode>,
    root: Option<usize>,
}

impl ProofCompactor {
    /// Creates a compactor whose root is taken from the first proof.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a compactor for proofs against `storage_root`.
    pub fn with_root(storage_root: H256) -> Self {
        Self {
            storage_root: Some(storage_root),
            ..Default::default()
        }
    }

    /// Verifies `proof` and merges its nodes into the tree.
    pub fn insert_proof(&mut self, proof: &StorageProof) -> Result<(), CompactError> {
        let found = proof
            .proof
            .first()
            .map(keccak)
            .unwrap_or(EMPTY_TRIE_HASH);
        let storage_root = *self.storage_root.get_or_insert(found);
        if found != storage_root {
            return Err(CompactError::RootMismatch {
                key: proof.key,
                expected: storage_root,
                found,
            });
        }

        let walk = walk_storage_proof(proof, storage_root)?;
        let key = proof.key;
        let path = Nibbles::from_h256_be(hashed_storage_key(key));
        trace!("Compacting proof for {:#x} ({} nodes)", key, walk.steps.len());

        let mut position = Position::Root;
        for (i, step) in walk.steps.iter().enumerate() {
            if i > 0 && matches!(position, Position::Root) {
                return Err(violation(key, "no parent path for a non-root node"));
            }

            let node = match &step.node {
                TrieNode::Branch { .. } => CompactNode::Branch {
                    raw: step.raw.clone(),
                    children: [None; BRANCH_WIDTH + 1],
                },
                TrieNode::Extension { .. } => CompactNode::Extension {
                    raw: step.raw.clone(),
                    child: None,
                },
                // A leaf of some other key only proves absence. The prefix
                // leading to it is all that gets attached.
                TrieNode::Leaf { .. } if walk.terminal == Terminal::Divergent => break,
                TrieNode::Leaf {
                    path: leaf_path,
                    value,
                } => CompactNode::Leaf {
                    key,
                    path: leaf_path.to_hex_prefix_encoding(true),
                    value: value.clone(),
                },
            };

            let idx = self.attach(position, node, key)?;
            position = match &step.node {
                TrieNode::Branch { .. } if step.depth < path.len() => Position::Slot {
                    parent: idx,
                    slot: path.get_nibble(step.depth) as usize,
                },
                TrieNode::Branch { .. } => Position::Slot {
                    parent: idx,
                    slot: BRANCH_VALUE_SLOT,
                },
                TrieNode::Extension { .. } => Position::Slot {
                    parent: idx,
                    slot: 0,
                },
                TrieNode::Leaf { .. } => Position::Root,
            };
        }

        let ends_at_branch = matches!(
            walk.steps.last(),
            Some(step) if matches!(step.node, TrieNode::Branch { .. })
        );
        if !ends_at_branch {
            return Ok(());
        }

        match (&walk.terminal, position) {
            (Terminal::Value(value), position @ Position::Slot { slot, .. })
                if slot == BRANCH_VALUE_SLOT =>
            {
                let leaf = CompactNode::Leaf {
                    key,
                    path: Bytes::new(),
                    value: value.clone(),
                };
                self.attach(position, leaf, key)?;
            }
            (Terminal::EmptySlot, position @ Position::Slot { slot, .. })
                if slot != BRANCH_VALUE_SLOT =>
            {
                self.attach_deletion_leaf(position, key, &path)?;
            }
            _ => (),
        }

        Ok(())
    }

    /// Records that `key` is absent from a slot its branch leaves empty.
    ///
    /// One deletion leaf proves the slot empty for every key routed through
    /// it. When several keys end at the same slot, the one with the smallest
    /// path keeps it.
    fn attach_deletion_leaf(
        &mut self,
        position: Position,
        key: H256,
        path: &Nibbles,
    ) -> Result<(), CompactError> {
        let leaf = CompactNode::Leaf {
            key,
            path: path.truncate_n_nibbles_front(1).to_hex_prefix_encoding(true),
            value: Bytes::from_static(DELETION_MARKER),
        };

        if let Some(existing) = self.slot(position, key)? {
            if let CompactNode::Leaf { key: other, .. } = &self.nodes[existing] {
                let other = *other;
                if other != key && self.nodes[existing].is_deletion() {
                    if hashed_storage_key(other) < hashed_storage_key(key) {
                        debug!(
                            "Empty slot already proven by {:#x}, not recording {:#x}",
                            other, key
                        );
                    } else {
                        debug!("Deletion leaf for {:#x} replaces the one for {:#x}", key, other);
                        self.nodes[existing] = leaf;
                    }
                    return Ok(());
                }
            }
        }

        debug!("Attaching deletion leaf for {:#x}", key);
        self.attach(position, leaf, key).map(|_| ())
    }

    fn slot(&self, position: Position, key: H256) -> Result<Option<usize>, CompactError> {
        match position {
            Position::Root => Ok(self.root),
            Position::Slot { parent, slot } => match &self.nodes[parent] {
                CompactNode::Branch { children, .. } => Ok(children[slot]),
                CompactNode::Extension { child, .. } if slot == 0 => Ok(*child),
                node => Err(violation(
                    key,
                    format!("slot {} of a {} cannot hold a child", slot, node.name()),
                )),
            },
        }
    }

    /// Places `node` at `position`, reusing the node already there if it is
    /// the same one.
    fn attach(
        &mut self,
        position: Position,
        node: CompactNode,
        key: H256,
    ) -> Result<usize, CompactError> {
        if let Some(existing) = self.slot(position, key)? {
            let current = &self.nodes[existing];
            return match (current, &node) {
                _ if current.is_same_node(&node) => {
                    trace!("Reusing {} at {:?}", node.name(), position);
                    Ok(existing)
                }
                (CompactNode::Leaf { key: other, .. }, CompactNode::Leaf { .. }) if *other != key => {
                    Err(violation(
                        key,
                        format!("leaf at {:?} already claimed by {:#x}", position, other),
                    ))
                }
                _ => Err(violation(
                    key,
                    format!(
                        "{} at {:?} conflicts with an existing {}",
                        node.name(),
                        position,
                        current.name()
                    ),
                )),
            };
        }

        trace!("Attaching {} at {:?}", node.name(), position);
        let idx = self.nodes.len();
        self.nodes.push(node);

        match position {
            Position::Root => self.root = Some(idx),
            Position::Slot { parent, slot } => match &mut self.nodes[parent] {
                CompactNode::Branch { children, .. } => children[slot] = Some(idx),
                CompactNode::Extension { child, .. } => *child = Some(idx),
                CompactNode::Leaf { .. } => {
                    return Err(violation(key, "leaves cannot have children"))
                }
            },
        }

        Ok(idx)
    }

    /// The keys among `unchanged_keys` whose proofs the receiving side needs
    /// to rebuild its trie once every other child of a branch has changed.
    ///
    /// A branch with all of its children but one attached is completed with
    /// the unchanged keys routed through that last child.
    pub fn missing_siblings(&self, unchanged_keys: &[H256]) -> Vec<H256> {
        let Some(root) = self.root else {
            return Vec::new();
        };

        let candidates: Vec<_> = unchanged_keys
            .iter()
            .map(|k| (*k, Nibbles::from_h256_be(hashed_storage_key(*k))))
            .collect();
        let mut keys = Vec::new();
        self.collect_missing_siblings(root, &Nibbles::default(), &candidates, &mut keys);

        keys
    }

    fn collect_missing_siblings(
        &self,
        idx: usize,
        path: &Nibbles,
        candidates: &[(H256, Nibbles)],
        keys: &mut Vec<H256>,
    ) {
        match &self.nodes[idx] {
            CompactNode::Branch { raw, children } => {
                let Ok(TrieNode::Branch { children: refs, .. }) = TrieNode::decode(raw) else {
                    return;
                };

                let unattached: Vec<_> = (0..BRANCH_WIDTH)
                    .filter(|i| !refs[*i].is_empty() && children[*i].is_none())
                    .collect();
                if let [slot] = unattached[..] {
                    for (key, hashed) in candidates {
                        let routed = hashed.len() > path.len()
                            && hashed.starts_with(path)
                            && hashed.get_nibble(path.len()) as usize == slot;
                        if routed && !keys.contains(key) {
                            keys.push(*key);
                        }
                    }
                    return;
                }

                for (i, child) in children[..BRANCH_WIDTH].iter().enumerate() {
                    if let Some(c) = child {
                        let mut child_path = path.clone();
                        child_path.push_nibble_back(i as u8);
                        self.collect_missing_siblings(*c, &child_path, candidates, keys);
                    }
                }
            }
            CompactNode::Extension {
                raw,
                child: Some(c),
            } => {
                let Ok(TrieNode::Extension { path: ext, .. }) = TrieNode::decode(raw) else {
                    return;
                };

                let mut child_path = path.clone();
                for n in ext.as_slice() {
                    child_path.push_nibble_back(*n);
                }
                self.collect_missing_siblings(*c, &child_path, candidates, keys);
            }
            _ => (),
        }
    }

    /// Freezes the tree. Returns `None` if no proof attached any node.
    pub fn build(self) -> Option<CompactedTrie> {
        let root = self.root?;

        Some(CompactedTrie {
            nodes: self.nodes,
            root,
            storage_root: self.storage_root.unwrap_or(EMPTY_TRIE_HASH),
        })
    }
}

fn violation(key: H256, reason: impl Into<String>) -> CompactError {
    CompactError::ConstructionInvariantViolation {
        key,
        reason: reason.into(),
    }
}

/// Compacts a batch of proofs sharing one storage root.
///
/// Returns `None` for an empty batch.
pub fn compact<'a>(
    proofs: impl IntoIterator<Item = &'a StorageProof>,
) -> Result<Option<CompactedTrie>, CompactError> {
    let mut compactor = ProofCompactor::new();
    for proof in proofs {
        compactor.insert_proof(proof)?;
    }

    Ok(compactor.build())
}

/// The merged tree of a batch of storage proofs.
#[derive(Clone, Debug)]
pub struct CompactedTrie {
    nodes: Vec<CompactNode>,
    root: usize,
    storage_root: H256,
}

impl CompactedTrie {
    /// The storage root all proofs were verified against.
    pub fn storage_root(&self) -> H256 {
        self.storage_root
    }

    /// Number of distinct nodes in the tree (leaves included).
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Keys of all leaves, in path order.
    pub fn keys(&self) -> Vec<H256> {
        let mut keys = Vec::new();
        self.collect_keys(self.root, &mut keys);

        keys
    }

    fn collect_keys(&self, idx: usize, keys: &mut Vec<H256>) {
        match &self.nodes[idx] {
            CompactNode::Branch { children, .. } => {
                // The value slot's key is a prefix of every other path here.
                if let Some(c) = children[BRANCH_VALUE_SLOT] {
                    self.collect_keys(c, keys);
                }
                for c in children[..BRANCH_WIDTH].iter().flatten() {
                    self.collect_keys(*c, keys);
                }
            }
            CompactNode::Extension { child, .. } => {
                if let Some(c) = child {
                    self.collect_keys(*c, keys);
                }
            }
            CompactNode::Leaf { key, .. } => keys.push(*key),
        }
    }

    /// Serializes the tree. The output only depends on the set of proofs
    /// merged, not on the order they were inserted in.
    pub fn encode(&self) -> Bytes {
        let mut stream = RlpStream::new();
        self.encode_node(self.root, &mut stream);

        stream.out().freeze()
    }

    fn encode_node(&self, idx: usize, s: &mut RlpStream) {
        match &self.nodes[idx] {
            CompactNode::Leaf { key, path, value } => {
                s.begin_list(3);
                s.append(key);
                s.append(path);
                s.append(value);
            }
            CompactNode::Branch { raw, children } => {
                s.begin_list(2);
                s.begin_list(1);
                s.append_raw(raw, 1);
                s.begin_list(BRANCH_WIDTH + 1);
                for c in children {
                    match c {
                        Some(c) => self.encode_node(*c, s),
                        None => {
                            s.begin_list(0);
                        }
                    }
                }
            }
            CompactNode::Extension { raw, child } => {
                s.begin_list(2);
                s.begin_list(1);
                s.append_raw(raw, 1);
                match child {
                    Some(c) => {
                        s.begin_list(1);
                        self.encode_node(*c, s);
                    }
                    None => {
                        s.begin_list(0);
                    }
                }
            }
        }
    }
}
