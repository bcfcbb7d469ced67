//! The engine: one node's round coordinator and outer convergence loop.
//!
//! Each round the engine materializes the pending-item delta into the shared
//! chunk queue, drains it through the external per-chunk computation, runs
//! the steal phase, then broadcasts its produced-new-work flag and blocks
//! until the fleet agrees on continue-or-stop. Cleanup of per-round and
//! per-increment store state runs on every exit path, including fatal
//! errors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::cursor::CursorTracker;
use crate::distributor::{ChunkClaim, WorkDistributor};
use crate::error::{EngineError, Result};
use crate::fleet::FleetChannel;
use crate::keys;
use crate::progress::ProgressChannel;
use crate::stealer::{RoundRole, WorkStealer};
use crate::store::{CoordStore, StoreConnector};

/// Where a chunk came from and which score band applies to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkContext {
    pub round: u64,
    /// First-round chunks carry the current increment's score band; later
    /// rounds process against the whole key space (`None`).
    pub increment_band: Option<f64>,
    /// Set when the chunk was stolen from a peer's queue.
    pub owner: Option<String>,
}

/// The external per-chunk computation.
///
/// Returns whether processing the chunk produced new work anywhere in the
/// system; the fleet keeps iterating as long as any node reports true.
#[async_trait]
pub trait ChunkProcessor: Send + Sync + 'static {
    async fn process_chunk(
        &self,
        items: Vec<String>,
        ctx: &ChunkContext,
    ) -> std::result::Result<bool, Box<dyn std::error::Error + Send + Sync>>;
}

/// Store handles for every instance this node talks to.
pub struct Topology<S> {
    /// This node's own store: universe, chunk queue, steal state.
    pub local: S,
    /// Where the computation marks items updated between rounds.
    pub updates: S,
    /// Upstream producer stores feeding newly available items.
    pub upstream: Vec<(String, S)>,
    /// Every fleet node's store, including this one's.
    pub fleet: Vec<(String, S)>,
}

impl<S: CoordStore> Topology<S> {
    pub async fn connect<C>(config: &EngineConfig, connector: &C) -> Result<Self>
    where
        C: StoreConnector<Store = S>,
    {
        let local = connector.connect(&config.local_addr).await?;
        let updates = connector.connect(&config.updates_addr).await?;
        let mut upstream = Vec::with_capacity(config.upstream_addrs.len());
        for addr in &config.upstream_addrs {
            upstream.push((addr.clone(), connector.connect(addr).await?));
        }
        let mut fleet = Vec::with_capacity(config.fleet_addrs.len());
        for addr in &config.fleet_addrs {
            fleet.push((addr.clone(), connector.connect(addr).await?));
        }
        Ok(Self {
            local,
            updates,
            upstream,
            fleet,
        })
    }
}

/// Outcome of a completed engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Rounds executed before the fleet agreed to stop.
    pub rounds: u64,
}

pub struct Engine<S: CoordStore, P: ChunkProcessor> {
    config: EngineConfig,
    topology: Topology<S>,
    processor: Arc<P>,
    distributor: WorkDistributor,
    cursor: CursorTracker,
    fleet: FleetChannel<S>,
    progress: Option<ProgressChannel<S>>,
    stealer: WorkStealer,
}

impl<S: CoordStore, P: ChunkProcessor> Engine<S, P> {
    /// Build the topology through `connector` and start the engine's
    /// channels: the status subscription always, the progress listener only
    /// when work stealing is enabled.
    pub async fn connect<C>(config: EngineConfig, connector: &C, processor: P) -> Result<Self>
    where
        C: StoreConnector<Store = S>,
    {
        config.validate()?;
        let topology = Topology::connect(&config, connector).await?;
        Self::with_topology(config, topology, processor).await
    }

    /// Start the engine over pre-built store handles.
    pub async fn with_topology(
        config: EngineConfig,
        topology: Topology<S>,
        processor: P,
    ) -> Result<Self> {
        config.validate()?;
        let fleet = FleetChannel::subscribe(
            config.local_addr.clone(),
            &topology.local,
            topology.fleet.clone(),
            config.stall_log_interval,
        )
        .await?;
        let progress = if config.work_stealing {
            Some(
                ProgressChannel::spawn(
                    &topology.local,
                    topology.fleet.clone(),
                    config.local_addr.clone(),
                    config.stall_log_interval,
                )
                .await?,
            )
        } else {
            None
        };
        let stealer = WorkStealer::new(
            config.local_addr.clone(),
            config.steal_threshold,
            config.chunk_size,
        );
        let distributor = WorkDistributor::new(config.chunk_size);
        Ok(Self {
            config,
            topology,
            processor: Arc::new(processor),
            distributor,
            cursor: CursorTracker::new(),
            fleet,
            progress,
            stealer,
        })
    }

    /// Run rounds until the fleet-wide decision is "stop".
    ///
    /// Per-increment cleanup and listener shutdown run on every exit path;
    /// an error from the round loop takes precedence over cleanup errors.
    pub async fn run(mut self) -> Result<RunSummary> {
        let outcome = self.converge().await;
        let cleanup = self.finalize().await;
        match outcome {
            Ok(summary) => cleanup.map(|_| summary),
            Err(err) => {
                if let Err(cleanup_err) = cleanup {
                    tracing::warn!(%cleanup_err, "cleanup failed while handling a fatal error");
                }
                Err(err)
            }
        }
    }

    async fn converge(&mut self) -> Result<RunSummary> {
        if self.progress.is_some() {
            // All progress listeners must be live before any node publishes,
            // or early messages are lost.
            self.fleet.barrier().await?;
        }

        let increment = self.current_increment().await?;
        let universe: HashSet<String> = self
            .topology
            .local
            .zrange(keys::LOCAL_KEYS, 0, -1)
            .await?
            .into_iter()
            .collect();
        // Cold-start band: items scored exactly at the current increment.
        let mut pending: HashSet<String> = self
            .topology
            .local
            .zrange_by_score(keys::LOCAL_KEYS, increment, increment)
            .await?
            .into_iter()
            .collect();
        tracing::info!(
            node = %self.config.local_addr,
            universe = universe.len(),
            increment,
            "engine initialized"
        );

        let mut round = 1u64;
        loop {
            let round_started = Instant::now();
            if round > 1 {
                let mut delta = self
                    .cursor
                    .read_updated(&self.topology.updates, keys::KEYS_UPDATED)
                    .await?;
                delta.extend(
                    self.cursor
                        .read_upstream(&self.topology.upstream, keys::CURRENT_KEYS)
                        .await?,
                );
                delta.retain(|item| universe.contains(item));
                pending = delta;
            }
            let band = (round == 1).then_some(increment);

            let total = self.distributor.publish(&self.topology.local, &pending).await?;
            tracing::info!(round, pending = pending.len(), total_chunks = total, "round started");

            let mut produced = self.drain_chunks(total, band, round).await?;
            if self.progress.is_some() {
                produced = self.steal_phase(produced, band, round).await?;
            }

            self.fleet.broadcast_status(produced, round).await?;
            let proceed = self.fleet.await_decision(round).await?;
            self.cleanup_round().await?;
            tracing::info!(
                round,
                produced,
                proceed,
                elapsed_ms = round_started.elapsed().as_millis() as u64,
                "round finished"
            );
            if !proceed {
                return Ok(RunSummary { rounds: round });
            }
            if let Some(progress) = &mut self.progress {
                progress.reset(round + 1).await?;
            }
            round += 1;
        }
    }

    /// Claim and process chunks until the local queue reports drained.
    async fn drain_chunks(&mut self, total: u64, band: Option<f64>, round: u64) -> Result<bool> {
        if total == 0 {
            self.publish_progress(1.0, round).await?;
            return Ok(false);
        }
        let mut produced = false;
        loop {
            match self.distributor.take_chunk(&self.topology.local).await? {
                ChunkClaim::Chunk { remaining, items } => {
                    let claimed = total.saturating_sub(remaining);
                    self.publish_progress(claimed as f64 / total as f64, round).await?;
                    produced |= self.process_local(items, band, round).await?;
                }
                ChunkClaim::Drained { items } => {
                    if !items.is_empty() {
                        produced |= self.process_local(items, band, round).await?;
                    }
                    self.publish_progress(1.0, round).await?;
                    return Ok(produced);
                }
            }
        }
    }

    /// Stealee wait, then the steal decision over the completed snapshot.
    async fn steal_phase(&mut self, mut produced: bool, band: Option<f64>, round: u64) -> Result<bool> {
        let mut role = RoundRole::Idle;
        if self
            .topology
            .local
            .get(keys::STEALER_MARKER)
            .await?
            .is_some()
        {
            role = RoundRole::Stealee;
            tracing::info!(round, "marked as stealee; waiting for stealers to finish");
            produced |= self
                .stealer
                .await_stealers(&self.topology.local, self.config.pop_timeout)
                .await?;
        }

        let progress = self
            .progress
            .as_mut()
            .ok_or_else(|| EngineError::Config("steal phase without progress channel".into()))?;
        let snapshot = progress.snapshot(round).await?;
        if let RoundRole::Stealer { target } = self
            .stealer
            .check_and_steal(&snapshot, &self.topology.fleet, &*self.processor, band, round)
            .await?
        {
            // A stealee that caught up can itself turn stealer in the same
            // round; the later role wins for reporting purposes.
            role = RoundRole::Stealer { target };
        }
        tracing::debug!(round, ?role, "steal phase complete");
        Ok(produced)
    }

    async fn process_local(&self, items: Vec<String>, band: Option<f64>, round: u64) -> Result<bool> {
        let ctx = ChunkContext {
            round,
            increment_band: band,
            owner: None,
        };
        let count = items.len();
        let chunk_started = Instant::now();
        let produced = self
            .processor
            .process_chunk(items, &ctx)
            .await
            .map_err(EngineError::Compute)?;
        tracing::debug!(
            round,
            items = count,
            produced,
            elapsed_ms = chunk_started.elapsed().as_millis() as u64,
            "processed chunk"
        );
        Ok(produced)
    }

    async fn publish_progress(&self, fraction: f64, round: u64) -> Result<()> {
        match &self.progress {
            Some(progress) => progress.publish(fraction, round).await,
            None => Ok(()),
        }
    }

    async fn current_increment(&self) -> Result<f64> {
        match self.topology.local.get(keys::CURRENT_INCREMENT).await? {
            None => Ok(0.0),
            Some(raw) => raw.parse().map_err(|_| {
                EngineError::Protocol(format!("unreadable increment counter: {raw:?}"))
            }),
        }
    }

    /// Delete the round's transient shared keys.
    async fn cleanup_round(&self) -> Result<()> {
        self.topology
            .local
            .del(&[
                keys::CHUNK_QUEUE,
                keys::CHUNK_COUNT,
                keys::TOTAL_CHUNKS,
                keys::STEALER_MARKER,
                keys::ACTIVE_STEALERS,
                keys::STEALER_OUTCOMES,
                keys::STEALERS_DONE,
            ])
            .await
    }

    /// Cross-increment cleanup and listener teardown. Runs even after a
    /// fatal round error.
    async fn finalize(&mut self) -> Result<()> {
        if let Some(progress) = self.progress.take() {
            progress.shutdown(self.config.shutdown_wait).await;
        }
        self.cursor.reset();
        let next = self.topology.local.incr(keys::CURRENT_INCREMENT).await?;
        self.topology.local.del(&[keys::JOB_COUNT]).await?;
        tracing::info!(node = %self.config.local_addr, next_increment = next, "engine shut down");
        Ok(())
    }
}
