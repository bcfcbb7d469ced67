//! Coordination store client.
//!
//! The engine talks to one logical ordered key/value store per node through
//! the [`CoordStore`] trait: scalars, scored sets, plain sets, a blocking
//! list pop, pub/sub, and the one server-side atomic operation the chunk
//! protocol depends on ([`CoordStore::take_chunk`]).
//!
//! [`redis::RedisStore`] is the production adapter; [`memory::MemoryCluster`]
//! provides in-process store instances with the same semantics for tests.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Remaining-chunk value meaning the queue is fully drained.
pub const DRAINED: i64 = -1;

#[async_trait]
pub trait CoordStore: Clone + Send + Sync + 'static {
    type Subscription: Subscription + 'static;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn decr(&self, key: &str) -> Result<i64>;
    async fn del(&self, keys: &[&str]) -> Result<()>;

    /// Insert all members with the same score.
    async fn zadd_multi(&self, key: &str, score: f64, members: &[String]) -> Result<()>;
    /// Members with score in `[min, max]`, both inclusive.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>>;
    /// Members (with scores) whose score is strictly greater than `min`.
    async fn zrange_by_score_after(&self, key: &str, min: f64) -> Result<Vec<(String, f64)>>;
    /// Members by rank; negative indices count from the end, Redis-style.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn rpush(&self, key: &str, value: &str) -> Result<()>;
    /// Pop the head of the list, blocking until a value arrives.
    /// A zero timeout blocks indefinitely; `None` means the timeout expired.
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    /// Atomically remove up to `count` members from the queue and decrement
    /// the remaining-chunk counter, returning the post-decrement value and
    /// the removed members in one indivisible server-side step.
    ///
    /// The claim that empties the queue returns [`DRAINED`] together with
    /// its members; once empty, every further claim returns [`DRAINED`] and
    /// no members. This is the only place concurrent nodes mutate shared
    /// state, so implementations must not split it into separate calls.
    async fn take_chunk(&self, queue: &str, counter: &str, count: usize)
        -> Result<(i64, Vec<String>)>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription>;
}

/// A live pub/sub subscription on one channel.
#[async_trait]
pub trait Subscription: Send {
    /// Next payload, or `None` once the subscription is closed.
    async fn next_message(&mut self) -> Result<Option<String>>;
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Seam for building store handles from `host:port` addresses, so the
/// engine's topology can be backed by real or in-process stores.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: CoordStore;

    async fn connect(&self, addr: &str) -> Result<Self::Store>;
}
