//! Prefetching block fetcher.
//!
//! Pulls a fixed list of blocks through a [`ChunkBlockReader`], coalescing
//! adjacent indexes into one read and keeping at most a window's worth of
//! fetched-but-unconsumed bytes in flight. Consumers receive blocks in
//! list order and release window budget by dropping them.

use std::sync::Arc;

use anyhow::{format_err, Error};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

/// Disk/network access to one chunk's blocks, priority-tagged.
#[async_trait]
pub trait ChunkBlockReader: Send + Sync {
    async fn read_blocks(
        &self,
        first_block_index: u32,
        block_count: u32,
        priority: i64,
    ) -> Result<Vec<Bytes>, Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    pub block_index: u32,
    pub size: u64,
}

pub struct FetchedBlock {
    pub block_index: u32,
    pub data: Bytes,
    _window_permit: OwnedSemaphorePermit,
}

// window budget is accounted in KiB so it fits semaphore permits
fn permits_for(size: u64) -> u32 {
    (size / 1024 + 1).min(u32::MAX as u64) as u32
}

pub struct BlockFetcher {
    receiver: mpsc::UnboundedReceiver<Result<FetchedBlock, Error>>,
    task: tokio::task::JoinHandle<()>,
}

impl BlockFetcher {
    pub fn new(
        reader: Arc<dyn ChunkBlockReader>,
        blocks: Vec<BlockInfo>,
        window_size: u64,
        priority: i64,
    ) -> Self {
        let total_permits = permits_for(window_size).max(1);
        let semaphore = Arc::new(Semaphore::new(total_permits as usize));
        let (sender, receiver) = mpsc::unbounded_channel();

        // coalesce runs of adjacent block indexes, bounded by half the
        // window so two groups can overlap in flight
        let group_budget = (window_size / 2).max(1);
        let mut groups: Vec<Vec<BlockInfo>> = Vec::new();
        for info in blocks {
            match groups.last_mut() {
                Some(group)
                    if group.last().unwrap().block_index + 1 == info.block_index
                        && group.iter().map(|b| b.size).sum::<u64>() + info.size
                            <= group_budget =>
                {
                    group.push(info);
                }
                _ => groups.push(vec![info]),
            }
        }

        let task = tokio::spawn(async move {
            for group in groups {
                // reserve window budget per block before the group read;
                // a single block larger than the window is clamped so it
                // can still make progress alone
                let mut permits = Vec::with_capacity(group.len());
                for info in &group {
                    let wanted = permits_for(info.size).min(total_permits);
                    match Arc::clone(&semaphore).acquire_many_owned(wanted).await {
                        Ok(permit) => permits.push(permit),
                        Err(_) => return,
                    }
                }

                let first = group[0].block_index;
                let count = group.len() as u32;
                match reader.read_blocks(first, count, priority).await {
                    Ok(datas) => {
                        if datas.len() != group.len() {
                            let _ = sender.send(Err(format_err!(
                                "block fetch returned {} blocks instead of {}",
                                datas.len(),
                                group.len(),
                            )));
                            return;
                        }
                        for ((info, data), permit) in
                            group.iter().zip(datas).zip(permits.drain(..))
                        {
                            if sender
                                .send(Ok(FetchedBlock {
                                    block_index: info.block_index,
                                    data,
                                    _window_permit: permit,
                                }))
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        let _ = sender.send(Err(err));
                        return;
                    }
                }
            }
        });

        Self { receiver, task }
    }

    /// Next block in list order; `None` after the last one.
    pub async fn next_block(&mut self) -> Result<Option<FetchedBlock>, Error> {
        match self.receiver.recv().await {
            Some(Ok(block)) => Ok(Some(block)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

impl Drop for BlockFetcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
