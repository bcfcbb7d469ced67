//! Work stealing: claiming unfinished chunks from a lagging peer.
//!
//! Once a node's own queue is drained and the round's progress snapshot is
//! complete, it may take over remaining chunks from the slowest peer. The
//! steal runs against the *peer's* store with the same atomic take-chunk
//! protocol as the local drain, so stolen items are still claimed exactly
//! once. The peer learns it was stolen from via a marker on its own store,
//! blocks until the last stealer signals completion, and folds the recorded
//! outcomes into its continue-flag.

use std::time::Duration;

use crate::distributor::{ChunkClaim, WorkDistributor};
use crate::engine::{ChunkContext, ChunkProcessor};
use crate::error::{EngineError, Result};
use crate::keys;
use crate::progress::ProgressSnapshot;
use crate::store::CoordStore;

/// This node's role for one round, decided during the steal phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundRole {
    /// Neither stole nor was stolen from.
    Idle,
    /// Claimed chunks from a lagging peer's queue.
    Stealer { target: String },
    /// Had chunks claimed by at least one peer.
    Stealee,
}

pub struct WorkStealer {
    node: String,
    threshold: f64,
    distributor: WorkDistributor,
}

impl WorkStealer {
    pub fn new(node: String, threshold: f64, chunk_size: usize) -> Self {
        Self {
            node,
            threshold,
            distributor: WorkDistributor::new(chunk_size),
        }
    }

    /// The peer to steal from: lowest fractional completion among peers at
    /// least `threshold` behind this node, ties broken by address so every
    /// stealer picks the same victim. `None` when nobody lags enough.
    pub fn select_target<'a>(&self, snapshot: &'a ProgressSnapshot) -> Option<(&'a str, f64)> {
        let own = snapshot.fraction(&self.node).unwrap_or(1.0);
        snapshot
            .iter()
            .filter(|(node, _)| *node != self.node)
            .filter(|(_, fraction)| own - fraction >= self.threshold)
            .min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(b.0))
            })
    }

    /// Run the steal decision for a completed round snapshot. On a hit,
    /// drains the target's queue through `processor` and records the outcome
    /// on the target's store for it to observe.
    pub async fn check_and_steal<S, P>(
        &self,
        snapshot: &ProgressSnapshot,
        fleet: &[(String, S)],
        processor: &P,
        increment_band: Option<f64>,
        round: u64,
    ) -> Result<RoundRole>
    where
        S: CoordStore,
        P: ChunkProcessor,
    {
        debug_assert_eq!(snapshot.round(), round);
        let Some((target, fraction)) = self.select_target(snapshot) else {
            tracing::debug!(round, "no peer lagging enough to steal from");
            return Ok(RoundRole::Idle);
        };
        let target = target.to_string();
        let Some((_, store)) = fleet.iter().find(|(addr, _)| *addr == target) else {
            tracing::warn!(%target, "snapshot names a node outside the fleet topology");
            return Ok(RoundRole::Idle);
        };
        tracing::info!(%target, fraction, round, "stealing from lagging peer");

        // Mark the peer before touching its queue, so it waits for us if it
        // finishes its own drain first.
        store.set(keys::STEALER_MARKER, "1").await?;
        store.incr(keys::ACTIVE_STEALERS).await?;

        let outcome = self.drain_peer(store, processor, &target, increment_band, round).await;

        // Record the outcome and release the stealee even if a chunk failed;
        // the error still aborts this node's round afterwards.
        let flag = matches!(outcome, Ok(true));
        store
            .sadd(keys::STEALER_OUTCOMES, &format!("{}:{}", self.node, flag as u8))
            .await?;
        if store.decr(keys::ACTIVE_STEALERS).await? <= 0 {
            store.rpush(keys::STEALERS_DONE, "done").await?;
        }
        outcome?;
        Ok(RoundRole::Stealer { target })
    }

    async fn drain_peer<S, P>(
        &self,
        store: &S,
        processor: &P,
        target: &str,
        increment_band: Option<f64>,
        round: u64,
    ) -> Result<bool>
    where
        S: CoordStore,
        P: ChunkProcessor,
    {
        let mut produced = false;
        let mut chunks = 0u64;
        loop {
            let items = match self.distributor.take_chunk(store).await? {
                ChunkClaim::Chunk { items, .. } => items,
                ChunkClaim::Drained { items } => {
                    if !items.is_empty() {
                        chunks += 1;
                        produced |= self.process(processor, items, target, increment_band, round).await?;
                    }
                    break;
                }
            };
            chunks += 1;
            produced |= self.process(processor, items, target, increment_band, round).await?;
        }
        tracing::info!(%target, chunks, produced, round, "finished stolen work");
        Ok(produced)
    }

    async fn process<P: ChunkProcessor>(
        &self,
        processor: &P,
        items: Vec<String>,
        target: &str,
        increment_band: Option<f64>,
        round: u64,
    ) -> Result<bool> {
        let ctx = ChunkContext {
            round,
            increment_band,
            owner: Some(target.to_string()),
        };
        processor
            .process_chunk(items, &ctx)
            .await
            .map_err(EngineError::Compute)
    }

    /// Stealee side: block until the last stealer signals completion, then
    /// report whether any stealer completed work that produced new results.
    pub async fn await_stealers<S: CoordStore>(
        &self,
        local: &S,
        pop_timeout: Duration,
    ) -> Result<bool> {
        if local.blpop(keys::STEALERS_DONE, pop_timeout).await?.is_none() {
            return Err(EngineError::Stall(format!(
                "stealers did not signal completion within {pop_timeout:?}"
            )));
        }
        let outcomes = local.smembers(keys::STEALER_OUTCOMES).await?;
        let forced = outcomes.iter().any(|entry| {
            entry
                .rsplit_once(':')
                .map(|(_, flag)| flag == "1")
                .unwrap_or(false)
        });
        tracing::info!(stealers = outcomes.len(), forced, "stealers finished");
        Ok(forced)
    }
}
