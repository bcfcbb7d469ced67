//! Progress broadcasting and the background peer-progress listener.
//!
//! Each node publishes its fractional round completion to every fleet
//! store's progress channel and runs one background task that buffers the
//! latest message per (round, peer). The main loop and the listener couple
//! only through one-shot rendezvous signals and a control channel: the
//! listener signals readiness once at startup, then delivers exactly one
//! completed [`ProgressSnapshot`] per round, replaced by an explicit
//! [`ProgressChannel::reset`] between rounds.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::keys;
use crate::protocol::ProgressMessage;
use crate::store::{CoordStore, Subscription};

/// Fractional completion of every known node for one round.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    round: u64,
    fractions: HashMap<String, f64>,
}

impl ProgressSnapshot {
    /// Assemble a snapshot directly. The listener is the production source;
    /// this is for callers driving the stealer in isolation.
    pub fn from_entries(round: u64, entries: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            round,
            fractions: entries.into_iter().collect(),
        }
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn fraction(&self, node: &str) -> Option<f64> {
        self.fractions.get(node).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.fractions.iter().map(|(n, f)| (n.as_str(), *f))
    }
}

enum Control {
    Reset {
        round: u64,
        ready: oneshot::Sender<ProgressSnapshot>,
    },
}

/// Main-loop handle to this node's progress plumbing.
pub struct ProgressChannel<S: CoordStore> {
    node: String,
    fleet: Vec<(String, S)>,
    ctl_tx: mpsc::Sender<Control>,
    snapshot_rx: Option<oneshot::Receiver<ProgressSnapshot>>,
    cancel: CancellationToken,
    task: Option<tokio::task::JoinHandle<()>>,
    stall_log_interval: Duration,
}

impl<S: CoordStore> ProgressChannel<S> {
    /// Subscribe on the local store, spawn the listener, and return once it
    /// has signalled readiness. The first snapshot rendezvous is armed for
    /// round 1.
    pub async fn spawn(
        local: &S,
        fleet: Vec<(String, S)>,
        node: String,
        stall_log_interval: Duration,
    ) -> Result<Self> {
        let nodes: HashSet<String> = fleet.iter().map(|(addr, _)| addr.clone()).collect();
        let sub = local.subscribe(keys::PROGRESS_CHANNEL).await?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (first_tx, first_rx) = oneshot::channel();
        let (ctl_tx, ctl_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(
            sub,
            nodes,
            first_tx,
            ctl_rx,
            ready_tx,
            cancel.clone(),
        ));
        ready_rx.await.map_err(|_| EngineError::ChannelClosed)?;
        Ok(Self {
            node,
            fleet,
            ctl_tx,
            snapshot_rx: Some(first_rx),
            cancel,
            task: Some(task),
            stall_log_interval,
        })
    }

    /// Publish this node's progress for `round` to every fleet store.
    pub async fn publish(&self, fraction: f64, round: u64) -> Result<()> {
        let payload = ProgressMessage {
            node: self.node.clone(),
            round,
            fraction,
        }
        .encode();
        for (_, store) in &self.fleet {
            store.publish(keys::PROGRESS_CHANNEL, &payload).await?;
        }
        Ok(())
    }

    /// Block until every known node has reported progress for `round`.
    /// Consumes the round's one-shot rendezvous; call [`Self::reset`] before
    /// the next round.
    pub async fn snapshot(&mut self, round: u64) -> Result<ProgressSnapshot> {
        let mut rx = self.snapshot_rx.take().ok_or_else(|| {
            EngineError::Stall(format!("progress snapshot for round {round} already consumed"))
        })?;
        loop {
            match tokio::time::timeout(self.stall_log_interval, &mut rx).await {
                Ok(Ok(snapshot)) => {
                    debug_assert_eq!(snapshot.round(), round);
                    return Ok(snapshot);
                }
                Ok(Err(_)) => return Err(EngineError::ChannelClosed),
                Err(_) => {
                    tracing::warn!(round, "still waiting for peer progress; peer may be stalled")
                }
            }
        }
    }

    /// Arm a fresh snapshot rendezvous for `round` and drop buffered state
    /// from earlier rounds.
    pub async fn reset(&mut self, round: u64) -> Result<()> {
        let (ready, rx) = oneshot::channel();
        self.ctl_tx
            .send(Control::Reset { round, ready })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        self.snapshot_rx = Some(rx);
        Ok(())
    }

    /// Stop the listener, waiting up to `wait` for it to acknowledge.
    /// Proceeds regardless after the bound; shutdown is best-effort.
    pub async fn shutdown(mut self, wait: Duration) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(wait, task).await.is_err() {
                tracing::warn!(?wait, "progress listener did not acknowledge shutdown in time");
            }
        }
    }
}

async fn listen<Sub: Subscription>(
    mut sub: Sub,
    nodes: HashSet<String>,
    first: oneshot::Sender<ProgressSnapshot>,
    mut ctl_rx: mpsc::Receiver<Control>,
    ready: oneshot::Sender<()>,
    cancel: CancellationToken,
) {
    let mut round = 1u64;
    let mut buffers: HashMap<u64, HashMap<String, f64>> = HashMap::new();
    let mut pending = Some(first);
    let _ = ready.send(());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ctl = ctl_rx.recv() => match ctl {
                Some(Control::Reset { round: next, ready }) => {
                    round = next;
                    buffers.retain(|r, _| *r >= next);
                    pending = Some(ready);
                    // Peers racing ahead may already have filled this round.
                    deliver_if_complete(&buffers, &nodes, round, &mut pending);
                }
                None => break,
            },
            msg = sub.next_message() => match msg {
                Ok(Some(payload)) => {
                    let Some(m) = ProgressMessage::decode(&payload) else { continue };
                    if m.round < round {
                        tracing::debug!(node = %m.node, msg_round = m.round, round, "dropping stale progress");
                        continue;
                    }
                    if !nodes.contains(&m.node) {
                        tracing::warn!(node = %m.node, "dropping progress from unknown node");
                        continue;
                    }
                    buffers.entry(m.round).or_default().insert(m.node, m.fraction);
                    deliver_if_complete(&buffers, &nodes, round, &mut pending);
                }
                Ok(None) => {
                    tracing::warn!("progress subscription closed");
                    break;
                }
                Err(err) => {
                    tracing::warn!(%err, "progress subscription failed");
                    break;
                }
            },
        }
    }
    let _ = sub.unsubscribe().await;
}

fn deliver_if_complete(
    buffers: &HashMap<u64, HashMap<String, f64>>,
    nodes: &HashSet<String>,
    round: u64,
    pending: &mut Option<oneshot::Sender<ProgressSnapshot>>,
) {
    if pending.is_none() {
        return;
    }
    let Some(buffer) = buffers.get(&round) else {
        return;
    };
    if !nodes.iter().all(|n| buffer.contains_key(n)) {
        return;
    }
    let snapshot = ProgressSnapshot {
        round,
        fractions: buffer.clone(),
    };
    if let Some(tx) = pending.take() {
        tracing::debug!(round, "progress snapshot complete");
        let _ = tx.send(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCluster;

    async fn two_node_channel(
        cluster: &MemoryCluster,
    ) -> ProgressChannel<crate::store::memory::MemoryStore> {
        let local = cluster.store("a:1");
        let fleet = vec![
            ("a:1".to_string(), cluster.store("a:1")),
            ("b:1".to_string(), cluster.store("b:1")),
        ];
        ProgressChannel::spawn(&local, fleet, "a:1".into(), Duration::from_secs(30))
            .await
            .unwrap()
    }

    fn peer_progress(node: &str, round: u64, fraction: f64) -> String {
        ProgressMessage {
            node: node.into(),
            round,
            fraction,
        }
        .encode()
    }

    #[tokio::test]
    async fn snapshot_waits_for_every_known_node() {
        let cluster = MemoryCluster::new();
        let mut channel = two_node_channel(&cluster).await;
        let local = cluster.store("a:1");

        channel.publish(1.0, 1).await.unwrap();
        // Only one of two nodes has reported; the rendezvous must stay open.
        let pending = tokio::time::timeout(Duration::from_millis(50), channel.snapshot(1)).await;
        assert!(pending.is_err(), "snapshot completed with a missing peer");

        // Recreate the consumed rendezvous, then complete the round.
        channel.reset(1).await.unwrap();
        local
            .publish(keys::PROGRESS_CHANNEL, &peer_progress("b:1", 1, 0.25))
            .await
            .unwrap();
        channel.publish(1.0, 1).await.unwrap();
        let snapshot = channel.snapshot(1).await.unwrap();
        assert_eq!(snapshot.round(), 1);
        assert_eq!(snapshot.fraction("a:1"), Some(1.0));
        assert_eq!(snapshot.fraction("b:1"), Some(0.25));
    }

    #[tokio::test]
    async fn later_message_overwrites_earlier_fraction() {
        let cluster = MemoryCluster::new();
        let mut channel = two_node_channel(&cluster).await;
        let local = cluster.store("a:1");

        local
            .publish(keys::PROGRESS_CHANNEL, &peer_progress("b:1", 1, 0.2))
            .await
            .unwrap();
        local
            .publish(keys::PROGRESS_CHANNEL, &peer_progress("b:1", 1, 0.8))
            .await
            .unwrap();
        channel.publish(1.0, 1).await.unwrap();
        let snapshot = channel.snapshot(1).await.unwrap();
        assert_eq!(snapshot.fraction("b:1"), Some(0.8));
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_are_dropped() {
        let cluster = MemoryCluster::new();
        let mut channel = two_node_channel(&cluster).await;
        let local = cluster.store("a:1");

        local.publish(keys::PROGRESS_CHANNEL, "not json").await.unwrap();
        local
            .publish(keys::PROGRESS_CHANNEL, &peer_progress("z:9", 1, 1.0))
            .await
            .unwrap();
        local
            .publish(keys::PROGRESS_CHANNEL, &peer_progress("b:1", 1, 0.5))
            .await
            .unwrap();
        channel.publish(1.0, 1).await.unwrap();
        let snapshot = channel.snapshot(1).await.unwrap();
        assert_eq!(snapshot.fraction("z:9"), None);
        assert_eq!(snapshot.fraction("b:1"), Some(0.5));
    }

    #[tokio::test]
    async fn early_next_round_messages_survive_reset() {
        let cluster = MemoryCluster::new();
        let mut channel = two_node_channel(&cluster).await;
        let local = cluster.store("a:1");

        // Round 1 completes.
        local
            .publish(keys::PROGRESS_CHANNEL, &peer_progress("b:1", 1, 1.0))
            .await
            .unwrap();
        channel.publish(1.0, 1).await.unwrap();
        channel.snapshot(1).await.unwrap();

        // Peer races into round 2 before our reset lands.
        local
            .publish(keys::PROGRESS_CHANNEL, &peer_progress("b:1", 2, 1.0))
            .await
            .unwrap();
        channel.reset(2).await.unwrap();
        channel.publish(1.0, 2).await.unwrap();
        let snapshot = channel.snapshot(2).await.unwrap();
        assert_eq!(snapshot.round(), 2);
        assert_eq!(snapshot.fraction("b:1"), Some(1.0));
    }

    #[tokio::test]
    async fn shutdown_stops_the_listener() {
        let cluster = MemoryCluster::new();
        let channel = two_node_channel(&cluster).await;
        channel.shutdown(Duration::from_secs(1)).await;
    }
}
