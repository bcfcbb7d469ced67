//! Chunked work distribution over the shared store.
//!
//! A round's pending items are published into an ordered queue once, then
//! claimed in bounded chunks by any number of nodes. The claim itself is the
//! store-side atomic [`CoordStore::take_chunk`] operation, so no item is
//! ever handed out twice and none is lost, no matter how many nodes drain
//! the same queue concurrently.

use std::collections::HashSet;

use crate::error::{EngineError, Result};
use crate::keys;
use crate::store::{CoordStore, DRAINED};

/// Outcome of one atomic chunk claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkClaim {
    /// A chunk plus the post-decrement remaining-chunk count.
    Chunk { remaining: u64, items: Vec<String> },
    /// The queue is now empty. The claim that drained it still carries its
    /// final items; later claims carry none.
    Drained { items: Vec<String> },
}

/// Hands out a round's pending items in bounded chunks.
#[derive(Debug, Clone)]
pub struct WorkDistributor {
    chunk_size: usize,
}

impl WorkDistributor {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Materialize the round's pending set into the chunk queue and return
    /// the total chunk count. Re-publishing the same items before any claim
    /// is a no-op in effect: members are re-inserted with the same score.
    pub async fn publish<S: CoordStore>(
        &self,
        store: &S,
        items: &HashSet<String>,
    ) -> Result<u64> {
        let total = (items.len() as u64).div_ceil(self.chunk_size as u64);
        store.set(keys::TOTAL_CHUNKS, &total.to_string()).await?;
        store.set(keys::CHUNK_COUNT, &total.to_string()).await?;
        let members: Vec<String> = items.iter().cloned().collect();
        store
            .zadd_multi(keys::CHUNK_QUEUE, keys::INIT_SCORE, &members)
            .await?;
        tracing::debug!(items = items.len(), total_chunks = total, "published round work");
        Ok(total)
    }

    /// Atomically claim up to one chunk from `store`'s queue.
    pub async fn take_chunk<S: CoordStore>(&self, store: &S) -> Result<ChunkClaim> {
        let (remaining, items) = store
            .take_chunk(keys::CHUNK_QUEUE, keys::CHUNK_COUNT, self.chunk_size)
            .await?;
        match remaining {
            DRAINED => Ok(ChunkClaim::Drained { items }),
            n if n >= 0 => Ok(ChunkClaim::Chunk {
                remaining: n as u64,
                items,
            }),
            n => Err(EngineError::Protocol(format!(
                "take-chunk returned count {n}; peer speaks a different protocol version"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn pending(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn publish_persists_chunk_counts() {
        let store = MemoryStore::new();
        let dist = WorkDistributor::new(2);
        let total = dist.publish(&store, &pending(&["a", "b", "c", "d", "e"])).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(store.get(keys::TOTAL_CHUNKS).await.unwrap(), Some("3".into()));
        assert_eq!(store.get(keys::CHUNK_COUNT).await.unwrap(), Some("3".into()));
    }

    #[tokio::test]
    async fn three_chunk_drain_counts_down_to_sentinel() {
        let store = MemoryStore::new();
        let dist = WorkDistributor::new(2);
        dist.publish(&store, &pending(&["a", "b", "c", "d", "e"])).await.unwrap();

        let mut counts = Vec::new();
        let mut claimed = Vec::new();
        loop {
            match dist.take_chunk(&store).await.unwrap() {
                ChunkClaim::Chunk { remaining, items } => {
                    assert!(!items.is_empty() && items.len() <= 2);
                    counts.push(remaining as i64);
                    claimed.extend(items);
                }
                ChunkClaim::Drained { items } => {
                    counts.push(-1);
                    claimed.extend(items);
                    break;
                }
            }
        }
        assert_eq!(counts, vec![2, 1, -1]);
        claimed.sort();
        assert_eq!(claimed, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn drained_queue_keeps_returning_the_sentinel() {
        let store = MemoryStore::new();
        let dist = WorkDistributor::new(2);
        dist.publish(&store, &pending(&["a"])).await.unwrap();
        assert_eq!(
            dist.take_chunk(&store).await.unwrap(),
            ChunkClaim::Drained { items: vec!["a".into()] }
        );
        for _ in 0..3 {
            assert_eq!(
                dist.take_chunk(&store).await.unwrap(),
                ChunkClaim::Drained { items: vec![] }
            );
        }
    }

    #[tokio::test]
    async fn empty_publish_yields_immediate_sentinel() {
        let store = MemoryStore::new();
        let dist = WorkDistributor::new(4);
        let total = dist.publish(&store, &HashSet::new()).await.unwrap();
        assert_eq!(total, 0);
        assert_eq!(
            dist.take_chunk(&store).await.unwrap(),
            ChunkClaim::Drained { items: vec![] }
        );
    }

    #[tokio::test]
    async fn concurrent_claimers_take_each_item_exactly_once() {
        let store = MemoryStore::new();
        let dist = WorkDistributor::new(3);
        let published: HashSet<String> = (0..100).map(|i| format!("item-{i:03}")).collect();
        dist.publish(&store, &published).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let dist = dist.clone();
            handles.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                loop {
                    match dist.take_chunk(&store).await.unwrap() {
                        ChunkClaim::Chunk { items, .. } => taken.extend(items),
                        ChunkClaim::Drained { items } => {
                            taken.extend(items);
                            break;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                taken
            }));
        }

        let mut union = Vec::new();
        for handle in handles {
            union.extend(handle.await.unwrap());
        }
        assert_eq!(union.len(), 100, "an item was claimed twice or lost");
        let union: HashSet<String> = union.into_iter().collect();
        assert_eq!(union, published);
    }

    #[tokio::test]
    async fn unexpected_negative_count_is_a_protocol_error() {
        let store = MemoryStore::new();
        let dist = WorkDistributor::new(2);
        // Corrupt the counter so the next decrement lands below the sentinel.
        dist.publish(&store, &pending(&["a", "b", "c"])).await.unwrap();
        store.set(keys::CHUNK_COUNT, "-5").await.unwrap();
        let result = dist.take_chunk(&store).await;
        assert!(matches!(result, Err(EngineError::Protocol(_))));
    }
}
