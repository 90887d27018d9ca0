//! Redis-backed coordination store.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CoordinationStore, StoreError};
use crate::BoxFuture;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Coordination store shared by every process connected to one Redis server.
///
/// Expiry is delegated to Redis (`EX`), and `set_if_absent` maps to
/// `SET key value NX EX ttl`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// Keys are stored under `prefix` so several caches can share a server.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            conn: client.get_connection_manager().await?,
            prefix: prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry.
    ttl.as_secs().max(1)
}

impl CoordinationStore for RedisStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        let key = self.key(key);
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let value: Option<String> = conn.get(&key).await?;
            Ok(value)
        })
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), StoreError>> {
        let key = self.key(key);
        let value = value.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let _: () = conn.set_ex(&key, value, ttl_secs(ttl)).await?;
            Ok(())
        })
    }

    fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = self.key(key);
        let value = value.to_string();
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<bool, StoreError>> {
        let key = self.key(key);
        let mut conn = self.conn.clone();
        Box::pin(async move {
            let removed: u64 = conn.del(&key).await?;
            Ok(removed > 0)
        })
    }
}
