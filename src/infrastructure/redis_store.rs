//! Redis-backed coordination store
//!
//! One `ConnectionManager` is shared by every clone of the store; it
//! multiplexes commands and reconnects on its own. The lease step runs as a
//! Lua script so selection and rescoring happen in one server-side operation.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use super::store::{CoordinationStore, StoreError};

/// Members rescored per `ZADD` inside the lease script. Lua's `unpack` is
/// bounded by the C stack (8000 slots) and each member takes two.
const LEASE_CHUNK: usize = 1_000;
const _: () = assert!(2 * LEASE_CHUNK < 8_000);

/// KEYS[1] queue; ARGV[1] now, ARGV[2] lease_until, ARGV[3] count, ARGV[4] chunk
const LEASE_SCRIPT: &str = r"
local ready = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
local chunk = tonumber(ARGV[4])
local args = {}
for _, member in ipairs(ready) do
    args[#args + 1] = ARGV[2]
    args[#args + 1] = member
    if #args >= 2 * chunk then
        redis.call('ZADD', KEYS[1], unpack(args))
        args = {}
    end
end
if #args > 0 then
    redis.call('ZADD', KEYS[1], unpack(args))
end
return ready
";

fn bound(score: i64) -> String {
    match score {
        i64::MIN => "-inf".to_string(),
        i64::MAX => "+inf".to_string(),
        other => other.to_string(),
    }
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    lease_script: redis::Script,
}

impl RedisStore {
    /// Opens a managed connection to `redis_url`
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        info!("🔗 Connected to coordination store at {}", redis_url);

        Ok(Self {
            connection,
            lease_script: redis::Script::new(LEASE_SCRIPT),
        })
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut con = self.connection();
        let reply: String = redis::cmd("PING").query_async(&mut con).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {reply}")))
        }
    }

    async fn zadd(&self, key: &str, member: &[u8], score: i64) -> Result<(), StoreError> {
        let mut con = self.connection();
        let _: i64 = con.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zadd_nx(&self, key: &str, member: &[u8], score: i64) -> Result<bool, StoreError> {
        let mut con = self.connection();
        let added: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("NX")
            .arg(score)
            .arg(member)
            .query_async(&mut con)
            .await?;
        Ok(added > 0)
    }

    async fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<i64>, StoreError> {
        let mut con = self.connection();
        let score: Option<f64> = con.zscore(key, member).await?;
        Ok(score.map(|value| value as i64))
    }

    async fn zrem(&self, key: &str, member: &[u8]) -> Result<bool, StoreError> {
        let mut con = self.connection();
        let removed: i64 = con.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError> {
        let mut con = self.connection();
        let count: u64 = con.zcount(key, bound(min), bound(max)).await?;
        Ok(count)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut con = self.connection();
        let count: u64 = con.zcard(key).await?;
        Ok(count)
    }

    async fn zpopmin(&self, key: &str, count: usize) -> Result<Vec<(Vec<u8>, i64)>, StoreError> {
        let mut con = self.connection();
        let popped: Vec<(Vec<u8>, f64)> = con.zpopmin(key, count as isize).await?;
        Ok(popped
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn lease(
        &self,
        key: &str,
        now: i64,
        lease_until: i64,
        count: usize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut con = self.connection();
        let leased: Vec<Vec<u8>> = self
            .lease_script
            .key(key)
            .arg(now)
            .arg(lease_until)
            .arg(count)
            .arg(LEASE_CHUNK)
            .invoke_async(&mut con)
            .await?;
        Ok(leased)
    }
}
