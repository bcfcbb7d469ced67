//! Redis-backed coordination store adapter.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{CoordStore, StoreConnector, Subscription};
use crate::error::Result;

/// Removes up to ARGV[1] queue members and decrements the remaining-chunk
/// counter in one EVAL. The claim that empties the queue returns -1 with the
/// final members; later claims return -1 with none.
const TAKE_CHUNK_SCRIPT: &str = r#"
local members = redis.call('ZRANGE', KEYS[1], 0, ARGV[1] - 1)
if #members > 0 then
    redis.call('ZREMRANGEBYRANK', KEYS[1], 0, ARGV[1] - 1)
end
if redis.call('ZCARD', KEYS[1]) == 0 then
    return {-1, members}
end
local remaining = redis.call('DECR', KEYS[2])
return {remaining, members}
"#;

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    con: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to a store instance at `host:port`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{addr}"))?;
        let con = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, con })
    }
}

#[async_trait]
impl CoordStore for RedisStore {
    type Subscription = RedisSubscription;

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.con.clone().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.con.clone().set(key, value).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        Ok(self.con.clone().incr(key, 1i64).await?)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        Ok(self.con.clone().decr(key, 1i64).await?)
    }

    async fn del(&self, keys: &[&str]) -> Result<()> {
        Ok(self.con.clone().del(keys.to_vec()).await?)
    }

    async fn zadd_multi(&self, key: &str, score: f64, members: &[String]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let items: Vec<(f64, &String)> = members.iter().map(|m| (score, m)).collect();
        Ok(self.con.clone().zadd_multiple(key, &items).await?)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        Ok(self.con.clone().zrangebyscore(key, min, max).await?)
    }

    async fn zrange_by_score_after(&self, key: &str, min: f64) -> Result<Vec<(String, f64)>> {
        let exclusive_min = format!("({min}");
        Ok(self
            .con
            .clone()
            .zrangebyscore_withscores(key, exclusive_min, "+inf")
            .await?)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(self.con.clone().zrange(key, start, stop).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.con.clone().smembers(key).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        Ok(self.con.clone().sadd(key, member).await?)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.con.clone().rpush(key, value).await?)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let popped: Option<(String, String)> =
            self.con.clone().blpop(key, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn take_chunk(
        &self,
        queue: &str,
        counter: &str,
        count: usize,
    ) -> Result<(i64, Vec<String>)> {
        let mut con = self.con.clone();
        let claim: (i64, Vec<String>) = redis::Script::new(TAKE_CHUNK_SCRIPT)
            .key(queue)
            .key(counter)
            .arg(count)
            .invoke_async(&mut con)
            .await?;
        Ok(claim)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        Ok(self.con.clone().publish(channel, message).await?)
    }

    async fn subscribe(&self, channel: &str) -> Result<Self::Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(RedisSubscription {
            pubsub,
            channel: channel.to_string(),
        })
    }
}

pub struct RedisSubscription {
    pubsub: redis::aio::PubSub,
    channel: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<String>> {
        match self.pubsub.on_message().next().await {
            Some(msg) => Ok(Some(msg.get_payload()?)),
            None => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        Ok(self.pubsub.unsubscribe(&self.channel).await?)
    }
}

/// Connects [`RedisStore`] handles for the engine topology.
#[derive(Debug, Clone, Default)]
pub struct RedisConnector;

#[async_trait]
impl StoreConnector for RedisConnector {
    type Store = RedisStore;

    async fn connect(&self, addr: &str) -> Result<Self::Store> {
        RedisStore::connect(addr).await
    }
}
