use super::CacheBackend;
use crate::error::{ResolveError, Result, SetupError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

/// Hard cap on any single redis round-trip. The cache competes in a race
/// where it is given a 5 ms head start; a stalled backend must not hold a
/// query hostage.
const CALL_CAP: Duration = Duration::from_millis(10);

/// Redis cache backend over a managed (auto-reconnecting) connection.
pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> std::result::Result<Self, SetupError> {
        let client = redis::Client::open(url)
            .map_err(|e| SetupError::Config(format!("bad redis URL {url}: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| SetupError::Config(format!("cannot reach redis at {url}: {e}")))?;
        info!("cache backend: redis at {url}");
        Ok(Self { manager })
    }
}

async fn capped<T>(
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T> {
    timeout(CALL_CAP, fut)
        .await
        .map_err(|_| ResolveError::Cache("redis call timed out".to_string()))?
        .map_err(|e| ResolveError::Cache(e.to_string()))
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        capped(conn.get::<_, Option<Vec<u8>>>(key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut conn = self.manager.clone();
        capped(conn.set::<_, _, ()>(key, value)).await
    }

    async fn expire_at(&self, key: &str, unix: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: bool = capped(conn.expire_at(key, unix as i64)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        capped(conn.del::<_, ()>(key)).await
    }
}
