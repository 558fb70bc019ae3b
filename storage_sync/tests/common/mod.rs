#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use alloy::rpc::types::BlockNumberOrTag;
use anyhow::{anyhow, bail};
use bytes::Bytes;
use eth_trie::{EthTrie, MemoryDB, Trie};
use ethereum_types::{Address, H256, U256};
use storage_proof::{
    proof::{Account, AccountProof, StorageProof},
    utils::{hashed_address, hashed_storage_key, storage_value_rlp, EMPTY_TRIE_HASH},
};
use storage_sync::{
    provider::StorageProvider,
    rpc::{BlockHeader, StateDiff, TransactionSummary},
};

pub fn word(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

pub fn address_str(address: Address) -> String {
    format!("{address:#x}")
}

/// An in-memory chain answering [`StorageProvider`] requests. Every request
/// is counted per method.
#[derive(Default)]
pub struct FakeChain {
    endpoint: String,
    latest: u64,
    state_root: H256,
    /// Storage snapshots per contract, keyed by the block they start at.
    storage: BTreeMap<Address, BTreeMap<u64, BTreeMap<H256, U256>>>,
    deployed_at: BTreeMap<Address, u64>,
    blocks: BTreeMap<u64, Vec<TransactionSummary>>,
    created: BTreeMap<H256, Address>,
    replays: BTreeMap<H256, StateDiff>,
    proofs: BTreeMap<Address, AccountProof>,
    failing: Option<&'static str>,
    calls: Mutex<BTreeMap<&'static str, usize>>,
}

impl FakeChain {
    pub fn new(endpoint: &str, latest: u64) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            latest,
            ..Default::default()
        }
    }

    /// `slots` of `address` from `block` on. Zero values are dropped, as on
    /// chain.
    pub fn with_storage(
        mut self,
        address: Address,
        block: u64,
        slots: impl IntoIterator<Item = (u64, u64)>,
    ) -> Self {
        let slots = slots
            .into_iter()
            .filter(|(_, v)| *v != 0)
            .map(|(k, v)| (word(k), U256::from(v)))
            .collect();
        self.storage.entry(address).or_default().insert(block, slots);
        self
    }

    pub fn with_code(mut self, address: Address, deployed_at: u64) -> Self {
        self.deployed_at.insert(address, deployed_at);
        self
    }

    pub fn with_block(mut self, number: u64, txs: Vec<TransactionSummary>) -> Self {
        self.blocks.insert(number, txs);
        self
    }

    pub fn with_creation(mut self, tx: H256, contract: Address) -> Self {
        self.created.insert(tx, contract);
        self
    }

    pub fn with_replay(mut self, tx: H256, diff: StateDiff) -> Self {
        self.replays.insert(tx, diff);
        self
    }

    pub fn with_proof(mut self, state_root: H256, response: AccountProof) -> Self {
        self.state_root = state_root;
        self.proofs.insert(response.address, response);
        self
    }

    /// Makes every `method` request fail.
    pub fn failing(mut self, method: &'static str) -> Self {
        self.failing = Some(method);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or_default()
    }

    fn record(&self, method: &'static str) -> anyhow::Result<()> {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
        match self.failing {
            Some(failing) if failing == method => bail!("{method} is down"),
            _ => Ok(()),
        }
    }

    fn storage_at_block(&self, address: Address, block: u64) -> BTreeMap<H256, U256> {
        self.storage
            .get(&address)
            .and_then(|snapshots| snapshots.range(..=block).next_back())
            .map(|(_, slots)| slots.clone())
            .unwrap_or_default()
    }
}

impl StorageProvider for FakeChain {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn block_header(&self, block: BlockNumberOrTag) -> anyhow::Result<BlockHeader> {
        self.record("eth_getBlockByNumber")?;
        let number = match block {
            BlockNumberOrTag::Number(n) if n <= self.latest => n,
            BlockNumberOrTag::Number(n) => bail!("target block {n} does not exist"),
            BlockNumberOrTag::Earliest => 0,
            _ => self.latest,
        };

        Ok(BlockHeader {
            number,
            hash: word(number),
            state_root: self.state_root,
        })
    }

    async fn list_storage_keys(
        &self,
        address: Address,
        count: usize,
        offset: Option<H256>,
        block: u64,
    ) -> anyhow::Result<Vec<H256>> {
        self.record("parity_listStorageKeys")?;
        Ok(self
            .storage_at_block(address, block)
            .into_keys()
            .filter(|key| offset.map_or(true, |offset| *key > offset))
            .take(count)
            .collect())
    }

    async fn storage_at(&self, address: Address, key: H256, block: u64) -> anyhow::Result<U256> {
        self.record("eth_getStorageAt")?;
        Ok(self
            .storage_at_block(address, block)
            .get(&key)
            .copied()
            .unwrap_or_default())
    }

    async fn code_at(&self, address: Address, block: u64) -> anyhow::Result<Bytes> {
        self.record("eth_getCode")?;
        Ok(match self.deployed_at.get(&address) {
            Some(deployed_at) if *deployed_at <= block => Bytes::from_static(&[0x60, 0x00]),
            _ => Bytes::new(),
        })
    }

    async fn block_transactions(&self, block: u64) -> anyhow::Result<Vec<TransactionSummary>> {
        self.record("eth_getBlockByNumber")?;
        Ok(self.blocks.get(&block).cloned().unwrap_or_default())
    }

    async fn created_contract(&self, tx: H256) -> anyhow::Result<Option<Address>> {
        self.record("eth_getTransactionReceipt")?;
        Ok(self.created.get(&tx).copied())
    }

    async fn replay_state_diff(&self, tx: H256) -> anyhow::Result<StateDiff> {
        self.record("trace_replayTransaction")?;
        Ok(self.replays.get(&tx).cloned().unwrap_or_default())
    }

    async fn get_proof(
        &self,
        address: Address,
        keys: Vec<H256>,
        _block: u64,
    ) -> anyhow::Result<AccountProof> {
        self.record("eth_getProof")?;
        let mut response = self
            .proofs
            .get(&address)
            .cloned()
            .ok_or_else(|| anyhow!("no proof for {address:#x}"))?;
        response
            .storage_proof
            .retain(|proof| keys.contains(&proof.key));

        Ok(response)
    }
}

fn build_trie(entries: impl IntoIterator<Item = (H256, Vec<u8>)>) -> (EthTrie<MemoryDB>, H256) {
    let mut trie = EthTrie::new(Arc::new(MemoryDB::new(true)));
    for (path, value) in entries {
        trie.insert(path.as_bytes(), &value).unwrap();
    }
    let root = H256(trie.root_hash().unwrap().0);

    (trie, root)
}

fn trie_proof(trie: &mut EthTrie<MemoryDB>, path: H256) -> Vec<Bytes> {
    trie.get_proof(path.as_bytes())
        .unwrap()
        .into_iter()
        .map(Bytes::from)
        .collect()
}

/// Builds a small world state holding `address` with `slots` and returns its
/// state root with the `eth_getProof` response for `keys`.
pub fn proof_response(
    address: Address,
    slots: &[(u64, u64)],
    keys: &[u64],
) -> (H256, AccountProof) {
    let slots: BTreeMap<H256, U256> = slots
        .iter()
        .filter(|(_, v)| *v != 0)
        .map(|(k, v)| (word(*k), U256::from(*v)))
        .collect();
    let (mut storage, storage_root) = build_trie(
        slots
            .iter()
            .map(|(k, v)| (hashed_storage_key(*k), storage_value_rlp(*v))),
    );

    let contract = Account {
        nonce: U256::one(),
        balance: U256::from(1_000_000_007),
        storage_root,
        code_hash: H256::repeat_byte(0xc0),
    };
    let others = (1..=6).map(|i| {
        (
            Address::from_low_u64_be(i),
            Account {
                nonce: U256::from(i),
                storage_root: EMPTY_TRIE_HASH,
                code_hash: keccak_hash::KECCAK_EMPTY,
                ..Default::default()
            },
        )
    });
    let (mut state, state_root) = build_trie(
        others
            .chain([(address, contract.clone())])
            .map(|(a, acc)| (hashed_address(a), rlp::encode(&acc).to_vec())),
    );

    let storage_proof = keys
        .iter()
        .map(|k| StorageProof {
            key: word(*k),
            value: slots.get(&word(*k)).copied().unwrap_or_default(),
            proof: match slots.is_empty() {
                true => Vec::new(),
                false => trie_proof(&mut storage, hashed_storage_key(word(*k))),
            },
        })
        .collect();

    let response = AccountProof {
        address,
        account_proof: trie_proof(&mut state, hashed_address(address)),
        balance: contract.balance,
        code_hash: contract.code_hash,
        nonce: contract.nonce,
        storage_hash: contract.storage_root,
        storage_proof,
    };

    (state_root, response)
}
