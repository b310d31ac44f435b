use super::CacheBackend;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

struct Stored {
    bytes: Vec<u8>,
    /// Absolute unix expiry, set by `expire_at`. `None` until then.
    expires_at: Option<u64>,
}

/// In-process cache backend: a mutex-guarded map with the same
/// get/set/expireat/delete contract as the redis backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Stored>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.expires_at.is_some_and(|at| at <= unix_now()) => {
                entries.remove(key);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.bytes.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            Stored {
                bytes: value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn expire_at(&self, key: &str, unix: u64) -> Result<()> {
        if let Some(stored) = self.entries.lock().get_mut(key) {
            stored.expires_at = Some(unix);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
