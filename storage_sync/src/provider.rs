use std::future::Future;
use std::num::NonZeroUsize;
use std::ops::Deref;
use std::sync::Arc;

use alloy::{
    primitives::Bytes as RpcBytes,
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::{client::ClientBuilder, types::BlockNumberOrTag},
    transports::{http::ReqwestTransport, Transport},
};
use anyhow::Context;
use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use storage_proof::proof::{parse_word, AccountProof};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tracing::debug;

use crate::rpc::{BlockHeader, RpcBlock, RpcReceipt, StateDiff, TraceResults, TransactionSummary};

const CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(size) => size,
    None => panic!("cache size must be non-zero"),
};
const MAX_NUMBER_OF_PARALLEL_REQUESTS: usize = 128;

/// Everything the diff engine and the migration proof read from a chain.
///
/// Block arguments are concrete numbers: tags are resolved once through
/// [`StorageProvider::block_header`] so that every read of one comparison
/// sees the same state.
pub trait StorageProvider {
    /// Identifies the node behind this provider. Two providers with the same
    /// endpoint are assumed to see the same chain.
    fn endpoint(&self) -> &str;

    fn block_header(
        &self,
        block: BlockNumberOrTag,
    ) -> impl Future<Output = anyhow::Result<BlockHeader>> + Send;

    /// One page of `parity_listStorageKeys`: at most `count` keys following
    /// `offset` (exclusive), in the node's order.
    fn list_storage_keys(
        &self,
        address: Address,
        count: usize,
        offset: Option<H256>,
        block: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<H256>>> + Send;

    fn storage_at(
        &self,
        address: Address,
        key: H256,
        block: u64,
    ) -> impl Future<Output = anyhow::Result<U256>> + Send;

    fn code_at(
        &self,
        address: Address,
        block: u64,
    ) -> impl Future<Output = anyhow::Result<Bytes>> + Send;

    fn block_transactions(
        &self,
        block: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<TransactionSummary>>> + Send;

    /// The contract a creation transaction deployed, from its receipt.
    fn created_contract(
        &self,
        tx: H256,
    ) -> impl Future<Output = anyhow::Result<Option<Address>>> + Send;

    /// The `stateDiff` trace of replaying `tx`.
    fn replay_state_diff(&self, tx: H256)
        -> impl Future<Output = anyhow::Result<StateDiff>> + Send;

    fn get_proof(
        &self,
        address: Address,
        keys: Vec<H256>,
        block: u64,
    ) -> impl Future<Output = anyhow::Result<AccountProof>> + Send;
}

/// An alloy provider over plain HTTP. Failed requests are not retried.
pub fn build_http_provider(rpc_url: url::Url) -> RootProvider<ReqwestTransport> {
    let client = ClientBuilder::default().http(rpc_url);
    ProviderBuilder::new().on_client(client)
}

/// Wrapper around alloy provider to cache blocks and bound the number of
/// requests in flight.
pub struct CachedProvider<ProviderT, TransportT> {
    provider: Arc<ProviderT>,
    endpoint: String,
    // The http transport keeps an unbounded connection pool, so parallel
    // requests are counted here.
    semaphore: Arc<Semaphore>,
    blocks_by_number: Arc<Mutex<lru::LruCache<u64, RpcBlock<TransactionSummary>>>>,
    _phantom: std::marker::PhantomData<TransportT>,
}

/// The inner provider, usable for one request while the permit is held.
pub struct PermittedProvider<'a, ProviderT> {
    provider: &'a ProviderT,
    _permit: SemaphorePermit<'a>,
}

impl<ProviderT> Deref for PermittedProvider<'_, ProviderT> {
    type Target = ProviderT;

    fn deref(&self) -> &ProviderT {
        self.provider
    }
}

impl<ProviderT, TransportT> CachedProvider<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    pub fn new(provider: ProviderT, endpoint: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
            semaphore: Arc::new(Semaphore::new(MAX_NUMBER_OF_PARALLEL_REQUESTS)),
            blocks_by_number: Arc::new(Mutex::new(lru::LruCache::new(CACHE_SIZE))),
            _phantom: std::marker::PhantomData,
        }
    }

    /// Waits for a free request slot.
    pub async fn acquire(&self) -> anyhow::Result<PermittedProvider<'_, ProviderT>> {
        Ok(PermittedProvider {
            provider: &self.provider,
            _permit: self.semaphore.acquire().await?,
        })
    }

    /// Retrieves a block with its transactions, caching it if it's not
    /// already cached.
    pub async fn get_block(&self, number: u64) -> anyhow::Result<RpcBlock<TransactionSummary>> {
        let cached_block = self.blocks_by_number.lock().await.get(&number).cloned();
        if let Some(block) = cached_block {
            return Ok(block);
        }

        let block = self
            .acquire()
            .await?
            .raw_request::<_, Option<RpcBlock<TransactionSummary>>>(
                "eth_getBlockByNumber".into(),
                (BlockNumberOrTag::Number(number), true),
            )
            .await?
            .context(format!("target block {number} does not exist"))?;

        self.blocks_by_number
            .lock()
            .await
            .put(block.number.as_u64(), block.clone());

        Ok(block)
    }
}

impl<ProviderT, TransportT> StorageProvider for CachedProvider<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn block_header(&self, block: BlockNumberOrTag) -> anyhow::Result<BlockHeader> {
        if let BlockNumberOrTag::Number(number) = block {
            if let Some(cached) = self.blocks_by_number.lock().await.get(&number) {
                return Ok(BlockHeader::from(cached));
            }
        }

        let header = self
            .acquire()
            .await?
            .raw_request::<_, Option<RpcBlock<H256>>>(
                "eth_getBlockByNumber".into(),
                (block, false),
            )
            .await?
            .map(|block| BlockHeader::from(&block))
            .context(format!("target block {block:?} does not exist"))?;

        debug!("resolved block {block:?} to {}", header.number);
        Ok(header)
    }

    async fn list_storage_keys(
        &self,
        address: Address,
        count: usize,
        offset: Option<H256>,
        block: u64,
    ) -> anyhow::Result<Vec<H256>> {
        Ok(self
            .acquire()
            .await?
            .raw_request::<_, Option<Vec<H256>>>(
                "parity_listStorageKeys".into(),
                (address, count, offset, BlockNumberOrTag::Number(block)),
            )
            .await?
            .unwrap_or_default())
    }

    async fn storage_at(&self, address: Address, key: H256, block: u64) -> anyhow::Result<U256> {
        let word = self
            .acquire()
            .await?
            .raw_request::<_, String>(
                "eth_getStorageAt".into(),
                (address, key, BlockNumberOrTag::Number(block)),
            )
            .await?;
        let word = parse_word(&word).context(format!("invalid storage word {word}"))?;

        Ok(U256::from_big_endian(word.as_bytes()))
    }

    async fn code_at(&self, address: Address, block: u64) -> anyhow::Result<Bytes> {
        let code = self
            .acquire()
            .await?
            .raw_request::<_, RpcBytes>(
                "eth_getCode".into(),
                (address, BlockNumberOrTag::Number(block)),
            )
            .await?;

        Ok(code.0)
    }

    async fn block_transactions(&self, block: u64) -> anyhow::Result<Vec<TransactionSummary>> {
        Ok(self.get_block(block).await?.transactions)
    }

    async fn created_contract(&self, tx: H256) -> anyhow::Result<Option<Address>> {
        let receipt = self
            .acquire()
            .await?
            .raw_request::<_, Option<RpcReceipt>>("eth_getTransactionReceipt".into(), (tx,))
            .await?
            .context(format!("no receipt for transaction {tx:#x}"))?;

        Ok(receipt.contract_address)
    }

    async fn replay_state_diff(&self, tx: H256) -> anyhow::Result<StateDiff> {
        let results = self
            .acquire()
            .await?
            .raw_request::<_, TraceResults>(
                "trace_replayTransaction".into(),
                (tx, ["stateDiff"]),
            )
            .await?;

        Ok(results.state_diff.unwrap_or_default())
    }

    async fn get_proof(
        &self,
        address: Address,
        keys: Vec<H256>,
        block: u64,
    ) -> anyhow::Result<AccountProof> {
        Ok(self
            .acquire()
            .await?
            .raw_request::<_, AccountProof>(
                "eth_getProof".into(),
                (address, keys, BlockNumberOrTag::Number(block)),
            )
            .await?)
    }
}
