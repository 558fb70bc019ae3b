//! JSON-RPC wire types for the handful of methods the diff engine and the
//! migration proof need. Only the fields we read are modelled; serde skips
//! the rest.

use std::collections::BTreeMap;
use std::ops::Deref;

use ethereum_types::{Address, H256, U256, U64};
use serde::{Deserialize, Serialize};

/// `eth_getBlockByNumber` response, generic over the transaction shape
/// (hashes or full objects).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "TxT: Deserialize<'de>"))]
pub struct RpcBlock<TxT> {
    pub number: U64,
    pub hash: H256,
    pub state_root: H256,
    #[serde(default)]
    pub transactions: Vec<TxT>,
}

/// The parts of a block the diff engine cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub state_root: H256,
}

impl<TxT> From<&RpcBlock<TxT>> for BlockHeader {
    fn from(block: &RpcBlock<TxT>) -> Self {
        Self {
            number: block.number.as_u64(),
            hash: block.hash,
            state_root: block.state_root,
        }
    }
}

/// A transaction reduced to what is needed to find the ones touching a
/// contract.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TransactionSummary {
    pub hash: H256,
    /// `None` for contract creations.
    pub to: Option<Address>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub contract_address: Option<Address>,
}

/// A parity `stateDiff` change marker.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Delta<T> {
    #[default]
    #[serde(rename = "=")]
    Unchanged,
    #[serde(rename = "+")]
    Added(T),
    #[serde(rename = "-")]
    Removed(T),
    #[serde(rename = "*")]
    Changed(ChangedType<T>),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChangedType<T> {
    pub from: T,
    pub to: T,
}

impl Delta<H256> {
    /// The slot value after the transaction, if the transaction wrote it.
    pub fn written_value(&self) -> Option<U256> {
        match self {
            Delta::Unchanged => None,
            Delta::Added(value) => Some(U256::from_big_endian(value.as_bytes())),
            Delta::Changed(ChangedType { to, .. }) => Some(U256::from_big_endian(to.as_bytes())),
            Delta::Removed(_) => Some(U256::zero()),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccountDiff {
    #[serde(default)]
    pub storage: BTreeMap<H256, Delta<H256>>,
}

/// Per-account changes of one replayed transaction.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StateDiff(pub BTreeMap<Address, AccountDiff>);

impl Deref for StateDiff {
    type Target = BTreeMap<Address, AccountDiff>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// `trace_replayTransaction` response. Only the `stateDiff` trace is
/// requested.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceResults {
    #[serde(default)]
    pub state_diff: Option<StateDiff>,
}
