use std::{cell::RefCell, collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use eth_trie::{EthTrie, MemoryDB, Trie};
use ethereum_types::{Address, H256, U256};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    proof::{Account, AccountProof, StorageProof},
    utils::{hashed_address, hashed_storage_key, storage_value_rlp, EMPTY_TRIE_HASH},
};

pub(crate) fn common_setup() {
    // Several tests share the process logger.
    let _ = pretty_env_logger::try_init();
}

/// A real trie built with the `eth_trie` crate, used as ground truth.
pub(crate) struct TruthTrie {
    trie: RefCell<EthTrie<MemoryDB>>,
    root: H256,
}

impl TruthTrie {
    pub(crate) fn new(entries: impl IntoIterator<Item = (H256, Vec<u8>)>) -> Self {
        let db = Arc::new(MemoryDB::new(true));
        let mut trie = EthTrie::new(db);

        for (path, v) in entries {
            trie.insert(path.as_bytes(), &v).unwrap();
        }

        // `eth_trie` has its own `H256`.
        let root = H256(trie.root_hash().unwrap().0);

        Self {
            trie: RefCell::new(trie),
            root,
        }
    }

    pub(crate) fn root(&self) -> H256 {
        self.root
    }

    pub(crate) fn proof(&self, path: H256) -> Vec<Bytes> {
        self.trie
            .borrow_mut()
            .get_proof(path.as_bytes())
            .unwrap()
            .into_iter()
            .map(Bytes::from)
            .collect()
    }
}

/// A contract's storage trie. Zero values are never inserted, as on chain.
pub(crate) struct TestStorage {
    trie: TruthTrie,
    slots: BTreeMap<H256, U256>,
}

impl TestStorage {
    pub(crate) fn from_entries(entries: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self::from_words(
            entries
                .into_iter()
                .map(|(k, v)| (H256::from_low_u64_be(k), U256::from(v))),
        )
    }

    pub(crate) fn from_words(entries: impl IntoIterator<Item = (H256, U256)>) -> Self {
        let slots: BTreeMap<_, _> = entries.into_iter().filter(|(_, v)| !v.is_zero()).collect();
        let trie = TruthTrie::new(
            slots
                .iter()
                .map(|(k, v)| (hashed_storage_key(*k), storage_value_rlp(*v))),
        );

        Self { trie, slots }
    }

    /// `n` random slots holding random nonzero values.
    pub(crate) fn random(seed: u64, n: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_words((0..n).map(|_| {
            (
                H256(rng.gen()),
                U256::from(rng.gen_range(1..u64::MAX)),
            )
        }))
    }

    pub(crate) fn root(&self) -> H256 {
        self.trie.root()
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = H256> + '_ {
        self.slots.keys().copied()
    }

    pub(crate) fn proof(&self, slot: u64) -> StorageProof {
        self.proof_for(H256::from_low_u64_be(slot))
    }

    pub(crate) fn proof_for(&self, key: H256) -> StorageProof {
        StorageProof {
            key,
            value: self.slots.get(&key).copied().unwrap_or_default(),
            proof: match self.slots.is_empty() {
                false => self.trie.proof(hashed_storage_key(key)),
                true => Vec::new(),
            },
        }
    }

    /// Places this storage under a contract in a small world state and returns
    /// that state along with the `eth_getProof` response for `slots`.
    pub(crate) fn get_proof_response(&self, slots: &[u64]) -> (TestState, AccountProof) {
        let address = Address::repeat_byte(0xcc);
        let contract = Account {
            nonce: U256::one(),
            balance: U256::from(10).pow(U256::from(18)),
            storage_root: self.root(),
            code_hash: H256::repeat_byte(0xc0),
        };

        let (_, mut accounts) = TestState::world_state(8);
        accounts.push((address, contract.clone()));
        let state = TestState::new(accounts);

        let response = AccountProof {
            address,
            account_proof: state.account_proof(address),
            balance: contract.balance,
            code_hash: contract.code_hash,
            nonce: contract.nonce,
            storage_hash: contract.storage_root,
            storage_proof: slots.iter().map(|s| self.proof(*s)).collect(),
        };

        (state, response)
    }
}

/// A world-state trie.
pub(crate) struct TestState {
    trie: TruthTrie,
}

impl TestState {
    pub(crate) fn new(accounts: impl IntoIterator<Item = (Address, Account)>) -> Self {
        Self {
            trie: TruthTrie::new(
                accounts
                    .into_iter()
                    .map(|(a, acc)| (hashed_address(a), rlp::encode(&acc).to_vec())),
            ),
        }
    }

    /// A state of `n` plain accounts.
    pub(crate) fn world_state(n: u64) -> (Self, Vec<(Address, Account)>) {
        let accounts: Vec<_> = (1..=n)
            .map(|i| {
                (
                    Address::from_low_u64_be(i),
                    Account {
                        nonce: U256::from(i),
                        balance: U256::from(i * 1_000_000_007),
                        storage_root: EMPTY_TRIE_HASH,
                        code_hash: keccak_hash::KECCAK_EMPTY,
                    },
                )
            })
            .collect();

        (Self::new(accounts.clone()), accounts)
    }

    pub(crate) fn root(&self) -> H256 {
        self.trie.root()
    }

    pub(crate) fn account_proof(&self, address: Address) -> Vec<Bytes> {
        self.trie.proof(hashed_address(address))
    }
}
