//! The `BlockStore` contract: the only part of the on-disk store this
//! core depends on. Storage itself is an external collaborator.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::Result;
use crate::wire::message::SignedBlock;
use crate::wire::types::{Checksum256, Timestamp};

/// Number of recent blocks a conforming store is expected to keep handy.
/// Informational only; the core never reads `last_blocks` itself.
pub const LAST_BLOCKS_CAPACITY: usize = 64;

/// A snapshot of the store's state, sufficient to build a
/// [`crate::sync::HandshakeInfo`].
#[derive(Debug, Clone, Copy)]
pub struct BlockStoreState {
    pub chain_id: Checksum256,
    pub head_block_num: u32,
    pub head_block_id: Checksum256,
    pub head_block_time: Timestamp,
    pub last_irreversible_block_num: u32,
    pub last_irreversible_block_id: Checksum256,
}

/// External collaborator consumed by the sync engine. The storage
/// mechanism behind it is out of scope for this core.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    fn chain_id(&self) -> Checksum256;

    fn head_block_num(&self) -> u32;

    /// Applies `block`, possibly advancing head/last-irreversible.
    /// Commit failures are logged by the sync engine and do not by
    /// themselves tear the peer connection down.
    async fn commit_block(&self, block: SignedBlock) -> Result<()>;

    fn state(&self) -> BlockStoreState;

    /// Optional: only needed by implementations that also serve blocks
    /// to peers. The core itself never calls this (it is an outbound
    /// client, not a server).
    fn get_block_by_num(&self, _n: u32) -> Option<SignedBlock> {
        None
    }
}

struct Inner {
    chain_id: Checksum256,
    head_block_num: u32,
    head_block_id: Checksum256,
    head_block_time: Timestamp,
    last_irreversible_block_num: u32,
    last_irreversible_block_id: Checksum256,
    last_blocks: VecDeque<SignedBlock>,
}

/// A trivial in-memory `BlockStore`, useful for tests and for embedders
/// that don't need durable storage. Not exported as "the" store: real
/// deployments bring their own.
pub struct InMemoryBlockStore {
    inner: Mutex<Inner>,
}

impl InMemoryBlockStore {
    pub fn new(chain_id: Checksum256, head_block_num: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chain_id,
                head_block_num,
                head_block_id: Checksum256::zero(),
                head_block_time: Timestamp::zero(),
                last_irreversible_block_num: head_block_num,
                last_irreversible_block_id: Checksum256::zero(),
                last_blocks: VecDeque::with_capacity(LAST_BLOCKS_CAPACITY),
            }),
        }
    }
}

#[async_trait::async_trait]
impl BlockStore for InMemoryBlockStore {
    fn chain_id(&self) -> Checksum256 {
        self.inner.lock().chain_id
    }

    fn head_block_num(&self) -> u32 {
        self.inner.lock().head_block_num
    }

    async fn commit_block(&self, block: SignedBlock) -> Result<()> {
        let mut inner = self.inner.lock();
        if block.block_number > inner.head_block_num {
            inner.head_block_num = block.block_number;
            inner.head_block_id = block.block_id;
            inner.head_block_time = block.timestamp;
        }
        if inner.last_blocks.len() == LAST_BLOCKS_CAPACITY {
            inner.last_blocks.pop_front();
        }
        inner.last_blocks.push_back(block);
        Ok(())
    }

    fn state(&self) -> BlockStoreState {
        let inner = self.inner.lock();
        BlockStoreState {
            chain_id: inner.chain_id,
            head_block_num: inner.head_block_num,
            head_block_id: inner.head_block_id,
            head_block_time: inner.head_block_time,
            last_irreversible_block_num: inner.last_irreversible_block_num,
            last_irreversible_block_id: inner.last_irreversible_block_id,
        }
    }

    fn get_block_by_num(&self, n: u32) -> Option<SignedBlock> {
        self.inner
            .lock()
            .last_blocks
            .iter()
            .find(|b| b.block_number == n)
            .cloned()
    }
}
