//! Round-termination protocol: broadcast-and-decide.
//!
//! There is no central coordinator. Each node publishes its own
//! produced-new-work flag for the round to every fleet store's status
//! channel, then blocks until it has observed one flag per known node and
//! reduces them with OR. Every node computes the same decision
//! independently, so the fleet either all continues or all stops.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::keys;
use crate::protocol::Message;
use crate::store::{CoordStore, Subscription};

pub struct FleetChannel<S: CoordStore> {
    node: String,
    nodes: Vec<String>,
    fleet: Vec<(String, S)>,
    sub: S::Subscription,
    ready: HashSet<String>,
    statuses: HashMap<u64, HashMap<String, bool>>,
    stall_log_interval: Duration,
}

impl<S: CoordStore> FleetChannel<S> {
    /// Subscribe on the local store's status channel. Must happen before any
    /// peer starts broadcasting, or this node misses messages; the engine
    /// subscribes during construction, before its round loop runs.
    pub async fn subscribe(
        node: String,
        local: &S,
        fleet: Vec<(String, S)>,
        stall_log_interval: Duration,
    ) -> Result<Self> {
        let sub = local.subscribe(keys::STATUS_CHANNEL).await?;
        let nodes = fleet.iter().map(|(addr, _)| addr.clone()).collect();
        Ok(Self {
            node,
            nodes,
            fleet,
            sub,
            ready: HashSet::new(),
            statuses: HashMap::new(),
            stall_log_interval,
        })
    }

    /// Startup rendezvous: announce readiness and wait until every node has
    /// announced, so no progress message is published before all listeners
    /// are live.
    pub async fn barrier(&mut self) -> Result<()> {
        self.broadcast(&Message::Ready {
            node: self.node.clone(),
        })
        .await?;
        while !self.nodes.iter().all(|n| self.ready.contains(n)) {
            self.pump("startup barrier").await?;
        }
        tracing::debug!(nodes = self.nodes.len(), "fleet startup barrier complete");
        Ok(())
    }

    /// Publish this node's produced-new-work flag for the round.
    pub async fn broadcast_status(&self, produced: bool, round: u64) -> Result<()> {
        self.broadcast(&Message::Status {
            node: self.node.clone(),
            round,
            produced,
        })
        .await
    }

    /// Block until every known node's flag for `round` is in, then reduce
    /// with OR. True means at least one node produced new work.
    pub async fn await_decision(&mut self, round: u64) -> Result<bool> {
        while !self.round_complete(round) {
            self.pump("fleet decision").await?;
        }
        let flags = self
            .statuses
            .remove(&round)
            .unwrap_or_default();
        // Flags for rounds at or below this one can never be consumed again.
        self.statuses.retain(|r, _| *r > round);
        let decision = flags.values().any(|produced| *produced);
        tracing::info!(round, decision, "fleet decision reached");
        Ok(decision)
    }

    fn round_complete(&self, round: u64) -> bool {
        self.statuses
            .get(&round)
            .map(|flags| self.nodes.iter().all(|n| flags.contains_key(n)))
            .unwrap_or(false)
    }

    async fn broadcast(&self, message: &Message) -> Result<()> {
        let payload = message.encode();
        for (_, store) in &self.fleet {
            store.publish(keys::STATUS_CHANNEL, &payload).await?;
        }
        Ok(())
    }

    /// Absorb one status-channel message, logging a stall warning while
    /// nothing arrives.
    async fn pump(&mut self, waiting_on: &str) -> Result<()> {
        loop {
            match tokio::time::timeout(self.stall_log_interval, self.sub.next_message()).await {
                Ok(Ok(Some(payload))) => {
                    if let Some(message) = Message::decode(&payload) {
                        self.absorb(message);
                    }
                    return Ok(());
                }
                Ok(Ok(None)) => return Err(EngineError::ChannelClosed),
                Ok(Err(err)) => return Err(err),
                Err(_) => tracing::warn!(waiting_on, "still waiting for peers; peer may be down"),
            }
        }
    }

    fn absorb(&mut self, message: Message) {
        match message {
            Message::Ready { node } => {
                if self.nodes.contains(&node) {
                    self.ready.insert(node);
                } else {
                    tracing::warn!(%node, "readiness ack from unknown node");
                }
            }
            Message::Status {
                node,
                round,
                produced,
            } => {
                if self.nodes.contains(&node) {
                    self.statuses.entry(round).or_default().insert(node, produced);
                } else {
                    tracing::warn!(%node, round, "status from unknown node");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryCluster, MemoryStore};

    const STALL: Duration = Duration::from_secs(30);

    async fn channels(
        cluster: &MemoryCluster,
        addrs: &[&str],
    ) -> Vec<FleetChannel<MemoryStore>> {
        let fleet: Vec<(String, MemoryStore)> = addrs
            .iter()
            .map(|a| (a.to_string(), cluster.store(a)))
            .collect();
        let mut channels = Vec::new();
        for addr in addrs {
            channels.push(
                FleetChannel::subscribe(
                    addr.to_string(),
                    &cluster.store(addr),
                    fleet.clone(),
                    STALL,
                )
                .await
                .unwrap(),
            );
        }
        channels
    }

    async fn decide(mut channels: Vec<FleetChannel<MemoryStore>>, flags: Vec<bool>) -> Vec<bool> {
        let mut handles = Vec::new();
        for (mut channel, flag) in channels.drain(..).zip(flags) {
            handles.push(tokio::spawn(async move {
                channel.broadcast_status(flag, 1).await.unwrap();
                channel.await_decision(1).await.unwrap()
            }));
        }
        let mut decisions = Vec::new();
        for handle in handles {
            decisions.push(handle.await.unwrap());
        }
        decisions
    }

    #[tokio::test]
    async fn all_false_means_stop_everywhere() {
        let cluster = MemoryCluster::new();
        let channels = channels(&cluster, &["a:1", "b:1", "c:1"]).await;
        let decisions = decide(channels, vec![false, false, false]).await;
        assert_eq!(decisions, vec![false, false, false]);
    }

    #[tokio::test]
    async fn single_true_means_continue_everywhere() {
        let cluster = MemoryCluster::new();
        let channels = channels(&cluster, &["a:1", "b:1", "c:1"]).await;
        let decisions = decide(channels, vec![false, true, false]).await;
        assert_eq!(decisions, vec![true, true, true]);
    }

    #[tokio::test]
    async fn decision_waits_for_every_node() {
        let cluster = MemoryCluster::new();
        let mut channels = channels(&cluster, &["a:1", "b:1"]).await;
        let mut b = channels.pop().unwrap();
        let a = channels.pop().unwrap();

        a.broadcast_status(true, 1).await.unwrap();
        // b has not broadcast; a's decision must not resolve early.
        let mut a = a;
        let early = tokio::time::timeout(Duration::from_millis(50), a.await_decision(1)).await;
        assert!(early.is_err(), "decision resolved with a missing node");

        b.broadcast_status(false, 1).await.unwrap();
        assert!(a.await_decision(1).await.unwrap());
        assert!(b.await_decision(1).await.unwrap());
    }

    #[tokio::test]
    async fn barrier_completes_once_all_nodes_announce() {
        let cluster = MemoryCluster::new();
        let mut channels = channels(&cluster, &["a:1", "b:1"]).await;
        let mut b = channels.pop().unwrap();
        let mut a = channels.pop().unwrap();
        let (ra, rb) = tokio::join!(a.barrier(), b.barrier());
        ra.unwrap();
        rb.unwrap();
    }

    #[tokio::test]
    async fn malformed_status_messages_are_ignored() {
        let cluster = MemoryCluster::new();
        let mut channels = channels(&cluster, &["a:1", "b:1"]).await;
        let b = channels.pop().unwrap();
        let mut a = channels.pop().unwrap();

        cluster
            .store("a:1")
            .publish(keys::STATUS_CHANNEL, "garbage")
            .await
            .unwrap();
        a.broadcast_status(false, 1).await.unwrap();
        b.broadcast_status(false, 1).await.unwrap();
        assert!(!a.await_decision(1).await.unwrap());
    }
}
