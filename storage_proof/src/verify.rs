//! Verification of single inclusion (and exclusion) proofs.
//!
//! A proof is walked from the root towards the key's path. Every node must
//! be the one its parent references, and the walk must end either at the
//! key's value or at a point that proves the key is absent.

use bytes::Bytes;
use ethereum_types::{Address, H256};
use log::trace;
use thiserror::Error;

use crate::{
    nibbles::Nibbles,
    node::{ChildRef, TrieNode},
    proof::{Account, AccountProof, StorageProof},
    utils::{hashed_address, hashed_storage_key, storage_value_rlp, EMPTY_TRIE_HASH},
};

/// An error encountered when verifying a proof.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The proof does not hash up to the root, is malformed or has nodes
    /// beyond its terminal node.
    #[error("Invalid proof for {key:#x}: {reason}")]
    InvalidProof {
        /// The slot (or left padded address) being proven.
        key: H256,
        /// What went wrong.
        reason: String,
    },

    /// The proof is well formed but ends at a different value than claimed.
    #[error("Value mismatch for {key:#x}: expected 0x{}, found 0x{}", hex::encode(.expected), hex::encode(.found))]
    ValueMismatch {
        /// The slot (or left padded address) being proven.
        key: H256,
        /// The RLP of the claimed value.
        expected: Bytes,
        /// The value held by the trie (empty if the key is absent).
        found: Bytes,
    },
}

/// A node visited while walking a proof.
#[derive(Clone, Debug)]
pub(crate) struct PathStep {
    /// The node's RLP.
    pub(crate) raw: Bytes,
    pub(crate) node: TrieNode,
    /// Number of key nibbles consumed before reaching this node.
    pub(crate) depth: usize,
}

/// How a proof walk ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Terminal {
    /// The key is present with this (RLP encoded) value.
    Value(Bytes),

    /// The last step is a branch whose slot for the key is empty.
    EmptySlot,

    /// The last step is an extension or leaf whose path leaves the key's.
    Divergent,

    /// The trie has no nodes at all.
    EmptyTrie,
}

impl Terminal {
    fn value(&self) -> Option<&Bytes> {
        match self {
            Terminal::Value(v) => Some(v),
            _ => None,
        }
    }
}

enum Next {
    Descend(ChildRef),
    Stop(Terminal),
}

#[derive(Clone, Debug)]
pub(crate) struct ProofWalk {
    pub(crate) steps: Vec<PathStep>,
    pub(crate) terminal: Terminal,
}

/// Walks `proof` from `root` along `path`.
///
/// Children that are embedded in their parent are descended into directly;
/// the node list may or may not repeat them.
pub(crate) fn walk_proof(root: H256, path: &Nibbles, proof: &[Bytes]) -> Result<ProofWalk, String> {
    if proof.is_empty() {
        return match root == EMPTY_TRIE_HASH {
            false => Err("empty proof for a non-empty trie".to_string()),
            true => Ok(ProofWalk {
                steps: Vec::new(),
                terminal: Terminal::EmptyTrie,
            }),
        };
    }

    let mut steps = Vec::new();
    let mut next_entry = 0;
    let mut depth = 0;
    let mut expected = ChildRef::Hash(root);

    let terminal = loop {
        let raw = match &expected {
            ChildRef::Hash(h) => {
                let raw = proof.get(next_entry).ok_or_else(|| {
                    format!("proof ends after {} nodes before reaching a terminal node", next_entry)
                })?;
                if !expected.matches(raw) {
                    return Err(format!("node {} does not hash to {:x}", next_entry, h));
                }

                next_entry += 1;
                raw.clone()
            }
            ChildRef::Inline(b) => {
                if proof.get(next_entry) == Some(b) {
                    next_entry += 1;
                }

                b.clone()
            }
            ChildRef::Empty => return Err("extension node without a child".to_string()),
        };

        let node = TrieNode::decode(&raw).map_err(|err| format!("node {}: {}", steps.len(), err))?;
        trace!("Proof step {} at depth {}: {}", steps.len(), depth, node.node_type());

        let step_depth = depth;
        let next = match &node {
            TrieNode::Branch { children, value } => match path.len() == depth {
                true => Next::Stop(
                    value
                        .clone()
                        .map(Terminal::Value)
                        .unwrap_or(Terminal::EmptySlot),
                ),
                false => {
                    let child = &children[path.get_nibble(depth) as usize];
                    depth += 1;
                    match child.is_empty() {
                        false => Next::Descend(child.clone()),
                        true => Next::Stop(Terminal::EmptySlot),
                    }
                }
            },
            TrieNode::Extension { path: ext, child } => {
                match path.truncate_n_nibbles_front(depth).starts_with(ext) {
                    false => Next::Stop(Terminal::Divergent),
                    true => {
                        depth += ext.len();
                        Next::Descend(child.clone())
                    }
                }
            }
            TrieNode::Leaf {
                path: leaf_path,
                value,
            } => match path.truncate_n_nibbles_front(depth) == *leaf_path {
                false => Next::Stop(Terminal::Divergent),
                true => Next::Stop(Terminal::Value(value.clone())),
            },
        };

        steps.push(PathStep {
            raw,
            node,
            depth: step_depth,
        });

        match next {
            Next::Descend(child) => expected = child,
            Next::Stop(terminal) => break terminal,
        }
    };

    if next_entry != proof.len() {
        return Err(format!(
            "{} trailing nodes after the terminal node",
            proof.len() - next_entry
        ));
    }

    Ok(ProofWalk { steps, terminal })
}

/// Checks that the terminal of a walk agrees with `expected` (the RLP of the
/// claimed value). An absent key agrees only with `absent_ok`.
fn check_terminal(
    key: H256,
    terminal: &Terminal,
    expected: Bytes,
    absent_ok: bool,
) -> Result<(), VerifyError> {
    match terminal.value() {
        Some(found) if *found == expected => Ok(()),
        None if absent_ok => Ok(()),
        found => Err(VerifyError::ValueMismatch {
            key,
            expected,
            found: found.cloned().unwrap_or_default(),
        }),
    }
}

/// Walks a storage proof against `storage_root` and returns the walk.
pub(crate) fn walk_storage_proof(
    proof: &StorageProof,
    storage_root: H256,
) -> Result<ProofWalk, VerifyError> {
    let path = Nibbles::from_h256_be(hashed_storage_key(proof.key));
    let walk = walk_proof(storage_root, &path, &proof.proof).map_err(|reason| {
        VerifyError::InvalidProof {
            key: proof.key,
            reason,
        }
    })?;

    check_terminal(
        proof.key,
        &walk.terminal,
        Bytes::from(storage_value_rlp(proof.value)),
        proof.value.is_zero(),
    )?;

    Ok(walk)
}

/// Verifies that `proof` proves its slot holds `proof.value` under
/// `storage_root`.
///
/// A proof that shows the slot is absent is accepted iff the claimed value is
/// zero.
pub fn verify_storage_proof(proof: &StorageProof, storage_root: H256) -> Result<(), VerifyError> {
    walk_storage_proof(proof, storage_root).map(|_| ())
}

/// Verifies that `proof` proves `account` is stored for `address` under
/// `state_root`, returning the account decoded from the trie.
///
/// A proof that shows the address is absent is accepted iff `account` is the
/// empty account.
pub fn verify_account_proof(
    address: Address,
    account: &Account,
    proof: &[Bytes],
    state_root: H256,
) -> Result<Account, VerifyError> {
    let key = H256::from(address);
    let path = Nibbles::from_h256_be(hashed_address(address));
    let walk = walk_proof(state_root, &path, proof)
        .map_err(|reason| VerifyError::InvalidProof { key, reason })?;

    let empty = Account {
        storage_root: EMPTY_TRIE_HASH,
        code_hash: keccak_hash::KECCAK_EMPTY,
        ..Default::default()
    };
    check_terminal(
        key,
        &walk.terminal,
        Bytes::from(rlp::encode(account).to_vec()),
        *account == empty,
    )?;

    match walk.terminal.value() {
        Some(found) => rlp::decode(found).map_err(|err| VerifyError::InvalidProof {
            key,
            reason: format!("account leaf does not decode: {}", err),
        }),
        None => Ok(empty),
    }
}

/// Verifies a whole `eth_getProof` response: the account against
/// `state_root`, then every storage proof against the account's storage
/// root.
pub fn verify_proof_response(
    response: &AccountProof,
    state_root: H256,
) -> Result<Account, VerifyError> {
    let account = verify_account_proof(
        response.address,
        &response.account(),
        &response.account_proof,
        state_root,
    )?;

    for proof in &response.storage_proof {
        verify_storage_proof(proof, account.storage_root)?;
    }

    Ok(account)
}
