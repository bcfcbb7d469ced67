//! In-process coordination store with Redis-compatible semantics.
//!
//! A [`MemoryCluster`] hands out shared [`MemoryStore`] handles keyed by
//! address, letting several engine nodes run against "remote" stores inside
//! one process. Used throughout the test suite.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};

use super::{CoordStore, StoreConnector, Subscription, DRAINED};
use crate::error::Result;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    strings: HashMap<String, String>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
    channels: HashMap<String, broadcast::Sender<String>>,
    list_signals: HashMap<String, Arc<Notify>>,
}

impl Inner {
    fn channel(&mut self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn list_signal(&mut self, key: &str) -> Arc<Notify> {
        self.list_signals
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Members ordered by score, ties broken lexically, as Redis orders them.
    fn sorted_members(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64> {
        let mut inner = self.lock();
        let slot = inner.strings.entry(key.into()).or_insert_with(|| "0".into());
        let next = slot.parse::<i64>().unwrap_or(0) + delta;
        *slot = next.to_string();
        Ok(next)
    }
}

fn rank_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl CoordStore for MemoryStore {
    type Subscription = MemorySubscription;

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock().strings.insert(key.into(), value.into());
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.add(key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.add(key, -1)
    }

    async fn del(&self, keys: &[&str]) -> Result<()> {
        let mut inner = self.lock();
        for key in keys {
            inner.strings.remove(*key);
            inner.zsets.remove(*key);
            inner.sets.remove(*key);
            inner.lists.remove(*key);
        }
        Ok(())
    }

    async fn zadd_multi(&self, key: &str, score: f64, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        let zset = inner.zsets.entry(key.into()).or_default();
        for member in members {
            zset.insert(member.clone(), score);
        }
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .sorted_members(key)
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .map(|(m, _)| m)
            .collect())
    }

    async fn zrange_by_score_after(&self, key: &str, min: f64) -> Result<Vec<(String, f64)>> {
        Ok(self
            .lock()
            .sorted_members(key)
            .into_iter()
            .filter(|(_, s)| *s > min)
            .collect())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let members = self.lock().sorted_members(key);
        let Some((lo, hi)) = rank_bounds(members.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(members[lo..=hi].iter().map(|(m, _)| m.clone()).collect())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.lock().sets.entry(key.into()).or_default().insert(member.into());
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let signal = {
            let mut inner = self.lock();
            inner.lists.entry(key.into()).or_default().push_back(value.into());
            inner.list_signal(key)
        };
        signal.notify_one();
        Ok(())
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);
        loop {
            let signal = {
                let mut inner = self.lock();
                if let Some(value) = inner.lists.get_mut(key).and_then(VecDeque::pop_front) {
                    return Ok(Some(value));
                }
                inner.list_signal(key)
            };
            let notified = signal.notified();
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn take_chunk(
        &self,
        queue: &str,
        counter: &str,
        count: usize,
    ) -> Result<(i64, Vec<String>)> {
        let mut inner = self.lock();
        let members: Vec<String> = inner
            .sorted_members(queue)
            .into_iter()
            .take(count)
            .map(|(m, _)| m)
            .collect();
        if let Some(zset) = inner.zsets.get_mut(queue) {
            for member in &members {
                zset.remove(member);
            }
            if zset.is_empty() {
                inner.zsets.remove(queue);
            }
        }
        if !inner.zsets.contains_key(queue) {
            return Ok((DRAINED, members));
        }
        let slot = inner
            .strings
            .entry(counter.into())
            .or_insert_with(|| "0".into());
        let remaining = slot.parse::<i64>().unwrap_or(0) - 1;
        *slot = remaining.to_string();
        Ok((remaining, members))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let sender = self.lock().channel(channel);
        // No subscribers is fine; pub/sub is fire-and-forget.
        let _ = sender.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription> {
        let rx = self.lock().channel(channel).subscribe();
        Ok(MemorySubscription { rx: Some(rx) })
    }
}

pub struct MemorySubscription {
    rx: Option<broadcast::Receiver<String>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<String>> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        loop {
            match rx.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.rx = None;
        Ok(())
    }
}

/// Named in-process store instances sharing one address space.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    stores: Arc<Mutex<HashMap<String, MemoryStore>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the store instance at `addr`, created on first use.
    pub fn store(&self, addr: &str) -> MemoryStore {
        self.stores
            .lock()
            .expect("memory cluster lock poisoned")
            .entry(addr.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl StoreConnector for MemoryCluster {
    type Store = MemoryStore;

    async fn connect(&self, addr: &str) -> Result<Self::Store> {
        Ok(self.store(addr))
    }
}
