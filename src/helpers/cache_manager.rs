use std::time::Duration;

use redis::{AsyncCommands, Client as RedisClient};

/// Thin wrapper over the external key-value / pub-sub store. The engine
/// only relies on these abstract operations; the backing implementation is
/// not part of the core's contract.
pub struct CacheManager {
    client: RedisClient,
}

impl CacheManager {
    pub fn new(redis_url: &str) -> Result<Self, String> {
        let client = RedisClient::open(redis_url)
            .map_err(|e| format!("Failed to connect to Redis: {}", e))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, String> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| format!("Redis connection error: {}", e))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let mut conn = self.connection().await?;
        conn.get(key)
            .await
            .map_err(|e| format!("Redis get error: {}", e))
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), String> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs())
                .await
                .map_err(|e| format!("Redis setex error: {}", e)),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| format!("Redis set error: {}", e)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), String> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| format!("Redis del error: {}", e))
    }

    /// Delete every key matching a glob pattern, e.g. `status:acme-*`.
    pub async fn delete_by_pattern(&self, pattern: &str) -> Result<usize, String> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn
            .keys(pattern)
            .await
            .map_err(|e| format!("Redis keys error: {}", e))?;

        if keys.is_empty() {
            return Ok(0);
        }

        let count = keys.len();
        conn.del::<_, ()>(keys)
            .await
            .map_err(|e| format!("Redis del error: {}", e))?;

        tracing::debug!(pattern = %pattern, count = count, "Deleted cached keys");
        Ok(count)
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<(), String> {
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| format!("Redis publish error: {}", e))
    }

    /// Subscribe to a channel; the caller drives the returned pub/sub
    /// connection's message stream.
    pub async fn subscribe(&self, channel: &str) -> Result<redis::aio::PubSub, String> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("Redis pubsub error: {}", e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| format!("Redis subscribe error: {}", e))?;
        Ok(pubsub)
    }
}
