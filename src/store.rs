use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Key holding the current serialized snapshot
pub const SNAPSHOT_KEY: &str = "nodes:snapshot";

/// Key holding the geo record for one address
pub fn geo_key(address: &str) -> String {
    format!("geo:{}", address)
}

/// Key-value store used for the snapshot and the geo cache. Values are
/// serialized JSON documents; expiration is per key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), AppError>;
}

/// In-process store; entries expire on read.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, Some(deadline))) if Instant::now() >= *deadline => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), AppError> {
        let now = Instant::now();
        let deadline = ttl.map(|ttl| now + ttl);

        let mut entries = self.entries.lock();
        // Writes double as the sweep point, so entries for addresses
        // that left the peer set do not pile up until read again.
        entries.retain(|_, (_, deadline)| match deadline {
            Some(deadline) => now < *deadline,
            None => true,
        });
        entries.insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }
}

/// Redis-backed store so snapshots and geo records survive restarts
pub struct RedisStore {
    client: ConnectionManager,
}

impl RedisStore {
    pub async fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Cache(format!("Failed to create Redis client: {}", e)))?;

        // Connection manager handles reconnection for us
        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Cache(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!("Connected to Redis cache");

        Ok(Self {
            client: conn_manager,
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.client.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Cache(format!("Failed to read {} from Redis: {}", key, e)))?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), AppError> {
        let mut conn = self.client.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| AppError::Cache(format!("Failed to write {} to Redis: {}", key, e)))?;
        Ok(())
    }
}
