//! The blob submitted on chain to port a contract's account and storage.
//!
//! It is the RLP list `[account, parent_nodes, storage]` where `account` is
//! the RLP encoded account record, `parent_nodes` the RLP list of the
//! account proof's nodes and `storage` the compacted storage proof. All three
//! are embedded as byte strings. `storage` is the empty list when no storage
//! is ported.

use alloy::rpc::types::BlockNumberOrTag;
use bytes::Bytes;
use ethereum_types::{Address, H256};
use rlp::{DecoderError, Rlp, RlpStream};
use storage_proof::{
    compact::{CompactError, CompactedProof, DecodeError, ProofCompactor},
    proof::{Account, AccountProof, StorageProof},
    verify::{verify_account_proof, VerifyError},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::provider::StorageProvider;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Compact(#[from] CompactError),

    #[error(transparent)]
    StorageProof(#[from] DecodeError),

    #[error("Migration proof is not valid RLP: {0}")]
    Rlp(#[from] DecoderError),

    #[error("Malformed migration proof: {0}")]
    Malformed(&'static str),

    #[error("Storage proof proves root {found:#x}, but the account's storage root is {expected:#x}")]
    StorageRootMismatch { expected: H256, found: H256 },

    #[error("RPC request failed: {0:#}")]
    RpcFailure(#[from] anyhow::Error),
}

/// The account record as stored in the world-state trie.
pub fn encode_account(account: &Account) -> Bytes {
    rlp::encode(account).freeze()
}

/// The account proof's nodes as one RLP list. Nodes are embedded as they
/// are, not wrapped into byte strings.
pub fn encode_parent_nodes(account_proof: &[Bytes]) -> Bytes {
    let mut s = RlpStream::new_list(account_proof.len());
    for node in account_proof {
        s.append_raw(node, 1);
    }

    s.out().freeze()
}

/// Verifies `proofs` against the account's storage root while merging them.
fn storage_compactor(
    account: &Account,
    proofs: &[StorageProof],
) -> Result<ProofCompactor, MigrationError> {
    let mut compactor = ProofCompactor::with_root(account.storage_root);
    for proof in proofs {
        compactor.insert_proof(proof)?;
    }

    Ok(compactor)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MigrationProof {
    account: Account,
    parent_nodes: Vec<Bytes>,
    storage_proof: Option<Bytes>,
}

impl MigrationProof {
    /// Verifies the account in `response` against `state_root` and, with
    /// `include_storage`, verifies and compacts its storage proofs.
    pub fn build(
        response: &AccountProof,
        state_root: H256,
        include_storage: bool,
    ) -> Result<Self, MigrationError> {
        let account = verify_account_proof(
            response.address,
            &response.account(),
            &response.account_proof,
            state_root,
        )?;

        let compactor = if include_storage {
            Some(storage_compactor(&account, &response.storage_proof)?)
        } else {
            None
        };

        Ok(Self::from_parts(
            account,
            response.account_proof.clone(),
            compactor,
        ))
    }

    fn from_parts(
        account: Account,
        parent_nodes: Vec<Bytes>,
        compactor: Option<ProofCompactor>,
    ) -> Self {
        let storage_proof = compactor.and_then(ProofCompactor::build).map(|trie| {
            debug!(
                "compacted {} storage keys into {} nodes",
                trie.keys().len(),
                trie.node_count()
            );
            trie.encode()
        });

        Self {
            account,
            parent_nodes,
            storage_proof,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn parent_nodes(&self) -> &[Bytes] {
        &self.parent_nodes
    }

    /// The compacted storage proof alone. This is what incremental updates
    /// of an already ported account submit.
    pub fn storage_proof(&self) -> Option<&Bytes> {
        self.storage_proof.as_ref()
    }

    pub fn encode(&self) -> Bytes {
        let mut s = RlpStream::new_list(3);
        s.append(&encode_account(&self.account));
        s.append(&encode_parent_nodes(&self.parent_nodes));
        match &self.storage_proof {
            Some(storage) => {
                s.append(storage);
            }
            None => {
                s.begin_list(0);
            }
        }

        s.out().freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MigrationError> {
        let blob = Rlp::new(bytes);
        let info = blob.payload_info()?;
        if info.header_len + info.value_len != bytes.len() {
            return Err(MigrationError::Malformed("trailing bytes"));
        }
        if !blob.is_list() || blob.item_count()? != 3 {
            return Err(MigrationError::Malformed("expected a list of 3 items"));
        }

        let account = rlp::decode(blob.at(0)?.data()?)?;

        let parent_nodes = Rlp::new(blob.at(1)?.data()?);
        if !parent_nodes.is_list() {
            return Err(MigrationError::Malformed("parent nodes are not a list"));
        }
        let parent_nodes = parent_nodes
            .iter()
            .map(|node| Bytes::copy_from_slice(node.as_raw()))
            .collect();

        let storage = blob.at(2)?;
        let storage_proof = if !storage.is_list() {
            Some(Bytes::copy_from_slice(storage.data()?))
        } else if storage.item_count()? == 0 {
            None
        } else {
            return Err(MigrationError::Malformed("storage entry is a non-empty list"));
        };

        Ok(Self {
            account,
            parent_nodes,
            storage_proof,
        })
    }

    /// Checks the blob the way the receiving chain does: the account against
    /// `state_root` and the storage proof against the account's storage root.
    /// Returns the decoded storage proof, if any.
    pub fn verify(
        &self,
        address: Address,
        state_root: H256,
    ) -> Result<Option<CompactedProof>, MigrationError> {
        let account = verify_account_proof(address, &self.account, &self.parent_nodes, state_root)?;

        let Some(storage) = &self.storage_proof else {
            return Ok(None);
        };
        let proof = CompactedProof::decode(storage)?;
        if proof.root_hash() != account.storage_root {
            return Err(MigrationError::StorageRootMismatch {
                expected: account.storage_root,
                found: proof.root_hash(),
            });
        }

        Ok(Some(proof))
    }
}

/// Fetches `eth_getProof` for `address` and `keys` at `block` and builds the
/// migration proof against that block's state root. Storage is only included
/// when `keys` is not empty.
///
/// `unchanged_keys` are keys whose value stays the same. When every child of
/// a branch but one is covered by `keys`, the unchanged keys routed through
/// that last child are proven too, so the receiving side can rebuild the
/// branch whatever the changed keys do to it.
pub async fn fetch_migration_proof<ProviderT: StorageProvider>(
    provider: &ProviderT,
    address: Address,
    keys: Vec<H256>,
    unchanged_keys: &[H256],
    block: BlockNumberOrTag,
) -> Result<MigrationProof, MigrationError> {
    let header = provider.block_header(block).await?;
    let include_storage = !keys.is_empty();

    info!(
        "fetching proof of {address:#x} and {} keys at block {}",
        keys.len(),
        header.number
    );
    let response = provider.get_proof(address, keys, header.number).await?;
    if !include_storage || unchanged_keys.is_empty() {
        return MigrationProof::build(&response, header.state_root, include_storage);
    }

    let account = verify_account_proof(
        response.address,
        &response.account(),
        &response.account_proof,
        header.state_root,
    )?;
    let mut compactor = storage_compactor(&account, &response.storage_proof)?;

    let siblings = compactor.missing_siblings(unchanged_keys);
    if !siblings.is_empty() {
        info!("fetching proof of {} unchanged sibling keys", siblings.len());
        let extra = provider.get_proof(address, siblings, header.number).await?;
        for proof in &extra.storage_proof {
            compactor.insert_proof(proof)?;
        }
    }

    Ok(MigrationProof::from_parts(
        account,
        response.account_proof,
        Some(compactor),
    ))
}
