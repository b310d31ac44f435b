//! TTL-merging answer cache, indexed by question name.
//!
//! The cache participates in the query race as just another resolver: hits
//! synthesize a complete [`DnsAnswer`], misses are quiet declines. Storage is
//! behind the pluggable [`CacheBackend`] trait so the same merge/lookup
//! semantics run against the in-process map or redis.

pub mod memory_backend;
pub mod redis_backend;

pub use memory_backend::MemoryBackend;
pub use redis_backend::RedisBackend;

use crate::answer::{DnsAnswer, DnsQuery, JsonQuestion, JsonRecord, TYPE_ANY, TYPE_CNAME};
use crate::error::{ResolveError, Result};
use crate::race::Resolver;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Records older than this are expired regardless of their advertised TTL.
const MAX_ENTRY_LIFETIME: u64 = 86_400;

/// Storage backend contract: a string-keyed byte store with absolute expiry.
/// Keys are `"dns:<qname>"`; values are serialized [`CacheEntry`]s.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn expire_at(&self, key: &str, unix: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[async_trait]
impl<B: CacheBackend + ?Sized> CacheBackend for std::sync::Arc<B> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        (**self).set(key, value).await
    }

    async fn expire_at(&self, key: &str, unix: u64) -> Result<()> {
        (**self).expire_at(key, unix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}

/// One cached entry: `(type, expiry, data)` triples for a single qname.
/// An entry with no records must not exist; it is deleted instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "Answer")]
    pub records: Vec<(u16, u64, String)>,
    #[serde(rename = "Expiry", default)]
    pub hard_expiry: u64,
}

pub struct Cache {
    backend: Box<dyn CacheBackend>,
    /// Serializes read-modify-write cycles in [`Cache::store`] so merges on
    /// the same key are linearizable across backend round-trips.
    lock: tokio::sync::Mutex<()>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn cache_key(qname: &str) -> String {
    format!("dns:{qname}")
}

impl Cache {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Look up `qname`/`qtype`, chasing CNAMEs one level deep.
    ///
    /// Fails with `NotCached` on a missing entry, `NoSuitableRecords` when
    /// the entry exists but nothing passes the type filter. ANY is always
    /// rejected; it is answered by upstreams only.
    pub async fn lookup(&self, qname: &str, qtype: u16) -> Result<DnsAnswer> {
        if qtype == TYPE_ANY {
            return Err(ResolveError::wont_resolve(
                "ANY queries are answered by upstreams only",
            ));
        }
        let answer = match self.lookup_records(qname, qtype, true).await {
            Ok(records) => records,
            Err(e) if e.is_decline() => return Err(e),
            // Backend trouble falls through to the upstreams.
            Err(e) => {
                warn!("cache lookup for {qname} failed: {e}");
                return Err(ResolveError::wont_resolve(format!("cache unavailable: {e}")));
            }
        };
        if answer.is_empty() {
            return Err(ResolveError::NoSuitableRecords);
        }
        Ok(DnsAnswer {
            status: 0,
            rd: true,
            ra: true,
            question: vec![JsonQuestion {
                name: qname.to_string(),
                rtype: qtype,
            }],
            answer,
            name_client: "Cache".to_string(),
            comment: Some("Response from hermod cache.".to_string()),
            ..DnsAnswer::default()
        })
    }

    /// The record-level lookup. `chase` allows exactly one further level of
    /// CNAME expansion; the chased lookup runs with `chase = false`.
    async fn lookup_records(
        &self,
        qname: &str,
        qtype: u16,
        chase: bool,
    ) -> Result<Vec<JsonRecord>> {
        let bytes = self
            .backend
            .get(&cache_key(qname))
            .await?
            .ok_or_else(|| ResolveError::NotCached(qname.to_string()))?;
        let entry: CacheEntry = serde_json::from_slice(&bytes)
            .map_err(|e| ResolveError::Cache(format!("undecodable entry for {qname}: {e}")))?;

        let now = unix_now();
        let mut answer: Vec<JsonRecord> = entry
            .records
            .iter()
            .filter(|(rtype, expiry, _)| {
                *expiry > now && (qtype == TYPE_ANY || *rtype == qtype || *rtype == TYPE_CNAME)
            })
            .map(|(rtype, expiry, data)| JsonRecord {
                name: qname.to_string(),
                rtype: *rtype,
                ttl: (expiry - now) as u32,
                data: data.clone(),
            })
            .collect();

        if chase {
            let targets: Vec<String> = {
                let mut t: Vec<String> = answer
                    .iter()
                    .filter(|r| r.rtype == TYPE_CNAME)
                    .map(|r| r.data.clone())
                    .collect();
                t.sort();
                t.dedup();
                t
            };
            for target in targets {
                let chased = Box::pin(self.lookup_records(&target, qtype, false)).await?;
                answer.extend(chased);
            }
        }
        Ok(answer)
    }

    /// Insert/merge an answer. Idempotent; answers with no `Answer` records
    /// are ignored. Backend failures are logged and swallowed so a cache
    /// outage never breaks resolution.
    pub async fn store(&self, answer: &DnsAnswer) {
        if let Err(e) = self.try_store(answer).await {
            warn!("cache store failed: {e}");
        }
    }

    async fn try_store(&self, answer: &DnsAnswer) -> Result<()> {
        let Some(qname) = answer.qname().filter(|n| !n.is_empty()) else {
            return Ok(());
        };
        if answer.answer.is_empty() {
            return Ok(());
        }
        let qname = qname.to_string();
        let key = cache_key(&qname);
        let now = unix_now();

        let _guard = self.lock.lock().await;

        let existing: CacheEntry = match self.backend.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => CacheEntry::default(),
        };
        let mut merger: HashMap<(u16, String), u64> = existing
            .records
            .into_iter()
            .map(|(rtype, expiry, data)| ((rtype, data), expiry))
            .collect();

        for record in &answer.answer {
            if record.name != qname {
                continue;
            }
            let expiry = now + u64::from(record.ttl);
            let slot = merger.entry((record.rtype, record.data.clone())).or_insert(0);
            if *slot < expiry {
                *slot = expiry;
            }
        }

        let mut records: Vec<(u16, u64, String)> = merger
            .into_iter()
            .filter(|(_, expiry)| *expiry > now)
            .map(|((rtype, data), expiry)| (rtype, expiry, data))
            .collect();
        if records.is_empty() {
            debug!("cache entry for {qname} fully expired, deleting");
            return self.backend.delete(&key).await;
        }
        records.sort();

        let max_expiry = records.iter().map(|(_, e, _)| *e).max().unwrap_or(now);
        let hard_expiry = (now + MAX_ENTRY_LIFETIME).min(max_expiry);
        let entry = CacheEntry {
            records,
            hard_expiry,
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| ResolveError::Cache(format!("unencodable entry for {qname}: {e}")))?;
        self.backend.set(&key, bytes).await?;
        self.backend.expire_at(&key, hard_expiry).await
    }
}

#[async_trait]
impl Resolver for Cache {
    fn name(&self) -> &str {
        "Cache"
    }

    // The cache never answers ANY.
    fn refuses_any(&self) -> bool {
        true
    }

    // The cache is local, so the race moves on quickly when it stalls.
    fn stagger(&self) -> Duration {
        Duration::from_millis(5)
    }

    async fn resolve(&self, query: &DnsQuery) -> Result<DnsAnswer> {
        self.lookup(&query.qname, query.qtype).await
    }
}
