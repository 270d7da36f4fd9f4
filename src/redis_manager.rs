// Redis Manager - backing store for side-effect records
// Reservations map to a single `SET key value NX EX secs`, never GET-then-SET.

use anyhow::Result;
#[cfg(feature = "redis")]
use anyhow::Context;
#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::aio::ConnectionManager;
#[cfg(feature = "redis")]
use redis::{AsyncCommands, Client};
#[cfg(feature = "redis")]
use std::time::Duration;
use log::{debug, info};

#[cfg(feature = "redis")]
use crate::kv_store::{KvStore, StoreError};
use crate::settings::SideEffectSettings;

/// Configuration for the Redis connection.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// `COUNT` hint for each `SCAN` round trip
    pub scan_batch: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            scan_batch: 500,
        }
    }
}

impl From<&SideEffectSettings> for RedisConfig {
    fn from(settings: &SideEffectSettings) -> Self {
        Self {
            url: settings.redis_url.clone(),
            ..Self::default()
        }
    }
}

/// [`KvStore`](crate::kv_store::KvStore) over a multiplexed Redis connection.
///
/// `ConnectionManager` reconnects transparently and is cheap to clone, so each
/// command runs on its own clone and the store can be shared behind an `Arc`.
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    config: RedisConfig,
}

#[cfg(not(feature = "redis"))]
pub struct RedisStore {
    config: RedisConfig,
    // NOTE: conn field removed when redis feature is disabled
    _phantom: std::marker::PhantomData<()>,
}

impl RedisStore {
    /// Connect to Redis
    #[cfg(feature = "redis")]
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Redis side effect store connected to {}", config.url);

        Ok(Self { conn, config })
    }

    #[cfg(not(feature = "redis"))]
    pub async fn new(config: RedisConfig) -> Result<Self> {
        debug!("Refusing Redis connection to {}: feature disabled", config.url);
        Err(anyhow::anyhow!("Redis feature not enabled. Enable with 'redis' feature flag."))
    }

    /// Create with default localhost config
    pub async fn new_default() -> Result<Self> {
        Self::new(RedisConfig::default()).await
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    // ==================== HEALTH CHECK ====================

    /// Test Redis connection
    #[cfg(feature = "redis")]
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis health check failed")?;

        if pong == "PONG" {
            Ok(())
        } else {
            anyhow::bail!("Unexpected Redis response: {}", pong)
        }
    }

    #[cfg(not(feature = "redis"))]
    pub async fn health_check(&self) -> Result<()> {
        Err(anyhow::anyhow!("Redis feature not enabled"))
    }
}

#[cfg(feature = "redis")]
fn backend_error(command: &'static str, e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Unavailable(format!("{}: {}", command, e))
    } else {
        StoreError::Backend {
            command,
            reason: e.to_string(),
        }
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| backend_error("GET", e))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if only_if_absent {
            cmd.arg("NX");
        }
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }

        // NX replies nil when the key already exists
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("SET", e))?;
        let written = reply.is_some();
        debug!("SET {} nx={} written={}", key, only_if_absent, written);
        Ok(written)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.del::<_, usize>(keys)
            .await
            .map_err(|e| backend_error("DEL", e))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.config.scan_batch)
                .query_async(&mut conn)
                .await
                .map_err(|e| backend_error("SCAN", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        debug!("SCAN {} matched {} keys", pattern, keys.len());
        Ok(keys)
    }
}
