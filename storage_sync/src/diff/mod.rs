//! Which storage slots of a contract differ between two snapshots.
//!
//! [`DiffHandler::diff_from_storage`] enumerates every key of both sides and
//! compares values. [`DiffHandler::diff_from_tx_replay`] only looks at what
//! the contract's transactions wrote in a block range; it is much cheaper
//! but cannot tell a freshly set slot from a changed one when the slot
//! existed before the range, so it classifies by the written value alone.

pub mod cli;

use std::collections::{BTreeMap, BTreeSet};

use alloy::rpc::types::BlockNumberOrTag;
use ethereum_types::{Address, H256, U256};
use futures::{stream, StreamExt as _, TryStreamExt as _};
use itertools::{EitherOrBoth, Itertools as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::provider::StorageProvider;

/// Keys fetched per `parity_listStorageKeys` call.
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Value lookups and replays kept in flight at once.
pub const DEFAULT_MAX_CONCURRENT_LOOKUPS: usize = 16;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error("{0:?} is not a valid address")]
    InvalidAddress(String),

    #[error("RPC request failed: {0:#}")]
    RpcFailure(#[from] anyhow::Error),

    #[error("no contract is deployed at {0:#x}")]
    NotDeployed(Address),
}

/// One slot that differs, seen from the source contract.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum StorageKeyDiff {
    /// The key only exists on the target side.
    Add { key: H256, value: U256 },
    /// The key only exists on the source side.
    Remove { key: H256, value: U256 },
    /// Both sides hold the key with different values.
    Change {
        key: H256,
        src_value: U256,
        target_value: U256,
    },
}

impl StorageKeyDiff {
    pub fn key(&self) -> H256 {
        match self {
            Self::Add { key, .. } | Self::Remove { key, .. } | Self::Change { key, .. } => *key,
        }
    }

    /// The same divergence seen from the target side.
    pub fn inverted(&self) -> Self {
        match *self {
            Self::Add { key, value } => Self::Remove { key, value },
            Self::Remove { key, value } => Self::Add { key, value },
            Self::Change {
                key,
                src_value,
                target_value,
            } => Self::Change {
                key,
                src_value: target_value,
                target_value: src_value,
            },
        }
    }
}

/// A set of [`StorageKeyDiff`]s, at most one per key, kept sorted by key.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StorageDiff {
    diffs: Vec<StorageKeyDiff>,
}

impl FromIterator<StorageKeyDiff> for StorageDiff {
    /// Later entries for a key replace earlier ones.
    fn from_iter<I: IntoIterator<Item = StorageKeyDiff>>(iter: I) -> Self {
        let by_key: BTreeMap<H256, StorageKeyDiff> =
            iter.into_iter().map(|diff| (diff.key(), diff)).collect();

        Self {
            diffs: by_key.into_values().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a StorageDiff {
    type Item = &'a StorageKeyDiff;
    type IntoIter = std::slice::Iter<'a, StorageKeyDiff>;

    fn into_iter(self) -> Self::IntoIter {
        self.diffs.iter()
    }
}

impl StorageDiff {
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageKeyDiff> {
        self.diffs.iter()
    }

    pub fn get(&self, key: H256) -> Option<&StorageKeyDiff> {
        self.diffs
            .binary_search_by_key(&key, StorageKeyDiff::key)
            .ok()
            .map(|i| &self.diffs[i])
    }

    /// Every key that differs, in ascending order. These are the keys that
    /// need a fresh proof.
    pub fn keys(&self) -> Vec<H256> {
        self.diffs.iter().map(StorageKeyDiff::key).collect()
    }

    pub fn adds(&self) -> impl Iterator<Item = &StorageKeyDiff> {
        self.iter()
            .filter(|diff| matches!(diff, StorageKeyDiff::Add { .. }))
    }

    pub fn removes(&self) -> impl Iterator<Item = &StorageKeyDiff> {
        self.iter()
            .filter(|diff| matches!(diff, StorageKeyDiff::Remove { .. }))
    }

    pub fn changes(&self) -> impl Iterator<Item = &StorageKeyDiff> {
        self.iter()
            .filter(|diff| matches!(diff, StorageKeyDiff::Change { .. }))
    }

    /// The diff with source and target swapped.
    pub fn inverted(&self) -> Self {
        self.iter().map(StorageKeyDiff::inverted).collect()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiffConfig {
    pub batch_size: usize,
    pub max_concurrent_lookups: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_lookups: DEFAULT_MAX_CONCURRENT_LOOKUPS,
        }
    }
}

/// Parses a `0x` prefixed, 40 hex digit address.
pub fn parse_address(s: &str) -> Result<Address, DiffError> {
    let invalid = || DiffError::InvalidAddress(s.to_string());

    let digits = s.strip_prefix("0x").ok_or_else(invalid)?;
    if digits.len() != 40 {
        return Err(invalid());
    }
    let bytes = hex::decode(digits).map_err(|_| invalid())?;

    Ok(Address::from_slice(&bytes))
}

/// Every storage key of `address` at `block`, paging through
/// `parity_listStorageKeys`. Each page starts after the last key of the
/// previous one; a short page ends the listing.
pub async fn all_storage_keys<ProviderT: StorageProvider>(
    provider: &ProviderT,
    address: Address,
    block: u64,
    batch_size: usize,
) -> anyhow::Result<Vec<H256>> {
    let batch_size = batch_size.max(1);
    let mut keys = Vec::new();
    let mut offset = None;

    loop {
        let page = provider
            .list_storage_keys(address, batch_size, offset, block)
            .await?;
        let done = page.len() < batch_size;

        offset = page.last().copied();
        keys.extend(page);

        if done || offset.is_none() {
            break;
        }
    }

    debug!("{address:#x} holds {} keys at block {block}", keys.len());
    Ok(keys)
}

/// The first block at which `address` has code, by binary search over
/// `0..=latest`.
pub async fn find_deployment_block<ProviderT: StorageProvider>(
    provider: &ProviderT,
    address: Address,
    latest: u64,
) -> Result<u64, DiffError> {
    if provider.code_at(address, latest).await?.is_empty() {
        return Err(DiffError::NotDeployed(address));
    }

    let (mut low, mut high) = (0, latest);
    while low < high {
        let mid = low + (high - low) / 2;
        if provider.code_at(address, mid).await?.is_empty() {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    debug!("{address:#x} was deployed in block {low}");
    Ok(low)
}

/// Computes storage diffs between a source chain and a target chain.
#[derive(Debug)]
pub struct DiffHandler<SrcT, TargetT> {
    src: SrcT,
    target: TargetT,
    config: DiffConfig,
}

impl<SrcT, TargetT> DiffHandler<SrcT, TargetT>
where
    SrcT: StorageProvider,
    TargetT: StorageProvider,
{
    pub fn new(src: SrcT, target: TargetT, config: DiffConfig) -> Self {
        Self {
            src,
            target,
            config,
        }
    }

    pub fn src(&self) -> &SrcT {
        &self.src
    }

    pub fn target(&self) -> &TargetT {
        &self.target
    }

    /// Compares the full storage of `src_addr` at `src_block` with that of
    /// `target_addr` at `target_block`.
    ///
    /// Comparing a contract with itself on the same node and block is empty
    /// without issuing any request.
    pub async fn diff_from_storage(
        &self,
        src_addr: &str,
        target_addr: &str,
        src_block: BlockNumberOrTag,
        target_block: BlockNumberOrTag,
    ) -> Result<StorageDiff, DiffError> {
        let src_address = parse_address(src_addr)?;
        let target_address = parse_address(target_addr)?;

        if src_address == target_address
            && self.src.endpoint() == self.target.endpoint()
            && src_block == target_block
        {
            debug!("{src_address:#x} compared with itself, nothing to fetch");
            return Ok(StorageDiff::default());
        }

        let (src_header, target_header) = futures::try_join!(
            self.src.block_header(src_block),
            self.target.block_header(target_block)
        )?;
        let (src_block, target_block) = (src_header.number, target_header.number);

        let batch_size = self.config.batch_size;
        let (src_keys, target_keys) = futures::try_join!(
            all_storage_keys(&self.src, src_address, src_block, batch_size),
            all_storage_keys(&self.target, target_address, target_block, batch_size)
        )?;
        let src_keys: BTreeSet<H256> = src_keys.into_iter().collect();
        let target_keys: BTreeSet<H256> = target_keys.into_iter().collect();

        info!(
            "comparing {} source keys of {src_address:#x}@{src_block} with {} target keys of {target_address:#x}@{target_block}",
            src_keys.len(),
            target_keys.len()
        );

        let lookups = src_keys
            .iter()
            .merge_join_by(target_keys.iter(), |a, b| a.cmp(b))
            .map(|keys| async move {
                anyhow::Ok(match keys {
                    EitherOrBoth::Both(&key, _) => {
                        let (src_value, target_value) = futures::try_join!(
                            self.src.storage_at(src_address, key, src_block),
                            self.target.storage_at(target_address, key, target_block)
                        )?;
                        (src_value != target_value).then_some(StorageKeyDiff::Change {
                            key,
                            src_value,
                            target_value,
                        })
                    }
                    EitherOrBoth::Left(&key) => Some(StorageKeyDiff::Remove {
                        key,
                        value: self.src.storage_at(src_address, key, src_block).await?,
                    }),
                    EitherOrBoth::Right(&key) => Some(StorageKeyDiff::Add {
                        key,
                        value: self
                            .target
                            .storage_at(target_address, key, target_block)
                            .await?,
                    }),
                })
            });

        let diffs: Vec<Option<StorageKeyDiff>> = stream::iter(lookups)
            .buffered(self.config.max_concurrent_lookups.max(1))
            .try_collect()
            .await?;

        Ok(diffs.into_iter().flatten().collect())
    }

    /// Replays every transaction that called or created `addr` in
    /// `from_block..=to_block` on the source chain and reports the last value
    /// each touched slot was set to.
    ///
    /// A slot absent before `from_block` is an `Add`. Otherwise a nonzero
    /// value is a `Change` and zero a `Remove`, both with an assumed source
    /// value of zero since the previous value is not looked up. An
    /// `earliest` start is replaced by the deployment block.
    pub async fn diff_from_tx_replay(
        &self,
        addr: &str,
        from_block: BlockNumberOrTag,
        to_block: BlockNumberOrTag,
    ) -> Result<StorageDiff, DiffError> {
        let address = parse_address(addr)?;

        let to = self.src.block_header(to_block).await?.number;
        let from = match from_block {
            BlockNumberOrTag::Earliest => find_deployment_block(&self.src, address, to).await?,
            tag => self.src.block_header(tag).await?.number,
        };

        if to < from {
            debug!("block range {from}..={to} is empty");
            return Ok(StorageDiff::default());
        }

        let txs = self.related_transactions(address, from, to).await?;
        info!(
            "replaying {} transactions of {address:#x} in blocks {from}..={to}",
            txs.len()
        );

        let old_keys: BTreeSet<H256> = match from {
            0 => BTreeSet::new(),
            _ => all_storage_keys(&self.src, address, from - 1, self.config.batch_size)
                .await?
                .into_iter()
                .collect(),
        };

        let mut written = BTreeMap::new();
        let mut replays = stream::iter(txs.iter().map(|&tx| self.src.replay_state_diff(tx)))
            .buffered(self.config.max_concurrent_lookups.max(1));
        while let Some(state_diff) = replays.try_next().await? {
            let Some(account) = state_diff.get(&address) else {
                continue;
            };
            for (key, delta) in &account.storage {
                if let Some(value) = delta.written_value() {
                    written.insert(*key, value);
                }
            }
        }

        Ok(written
            .into_iter()
            .map(|(key, value)| match (old_keys.contains(&key), value.is_zero()) {
                (false, _) => StorageKeyDiff::Add { key, value },
                (true, false) => StorageKeyDiff::Change {
                    key,
                    src_value: U256::zero(),
                    target_value: value,
                },
                (true, true) => StorageKeyDiff::Remove {
                    key,
                    value: U256::zero(),
                },
            })
            .collect())
    }

    /// Hashes of the transactions in `from..=to` that call `address` or
    /// deploy it, in chain order.
    async fn related_transactions(
        &self,
        address: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<H256>, DiffError> {
        let mut blocks = stream::iter((from..=to).map(|n| self.src.block_transactions(n)))
            .buffered(self.config.max_concurrent_lookups.max(1));

        let mut related = Vec::new();
        while let Some(txs) = blocks.try_next().await? {
            for tx in txs {
                let touches = match tx.to {
                    Some(to) => to == address,
                    None => self.src.created_contract(tx.hash).await? == Some(address),
                };
                if touches {
                    related.push(tx.hash);
                }
            }
        }

        Ok(related)
    }
}
