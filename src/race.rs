//! The racing dispatcher: fans one downstream query out to the cache and
//! every eligible provider with Happy-Eyeballs staggered starts, returns the
//! first answer, and drains the stragglers into the cache.

use crate::answer::{DnsAnswer, DnsQuery};
use crate::cache::Cache;
use crate::error::{ResolveError, Result};
use crate::stats::StatsRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Anything that can enter the race: the cache and each provider client.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &str;

    /// Resolvers that must be skipped for ANY (qtype 255) queries.
    fn refuses_any(&self) -> bool {
        false
    }

    /// How long the starter waits for this resolver before moving on to the
    /// next entrant.
    fn stagger(&self) -> Duration {
        Duration::from_millis(100)
    }

    async fn resolve(&self, query: &DnsQuery) -> Result<DnsAnswer>;
}

/// Overall race deadline for normal queries.
const RACE_DEADLINE: Duration = Duration::from_millis(950);
/// Overall race deadline for ANY queries, which only some upstreams serve.
const RACE_DEADLINE_ANY: Duration = Duration::from_secs(5);
/// Cap on a single worker's resolver call; longer than the race deadline so
/// late answers can still be collected for the cache.
const WORKER_DEADLINE: Duration = Duration::from_secs(5);
/// How long the cacher keeps reading stragglers after a winner was sent.
const CACHER_DRAIN: Duration = Duration::from_secs(10);

pub struct RaceDispatcher {
    resolvers: Vec<Arc<dyn Resolver>>,
    cache: Arc<Cache>,
    stats: Arc<StatsRegistry>,
}

impl RaceDispatcher {
    /// `resolvers` is the full field: the cache entrant plus one entrant per
    /// provider. The cache is additionally used directly for the post-race
    /// drain.
    pub fn new(
        resolvers: Vec<Arc<dyn Resolver>>,
        cache: Arc<Cache>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            resolvers,
            cache,
            stats,
        }
    }

    /// Race all eligible resolvers for `query` and return the first answer,
    /// or `Timeout` if the race deadline fires with no winner.
    pub async fn resolve(&self, query: &DnsQuery) -> Result<DnsAnswer> {
        let entrants = self.entrants(query);
        if entrants.is_empty() {
            return Err(ResolveError::Timeout);
        }
        let deadline = if query.is_any() {
            RACE_DEADLINE_ANY
        } else {
            RACE_DEADLINE
        };

        // One slot per worker plus one for the winner's re-send below; no
        // send ever blocks.
        let (tx, mut rx) = mpsc::channel::<DnsAnswer>(entrants.len() + 1);

        let starter_tx = tx.clone();
        let starter_query = query.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            stagger_workers(entrants, starter_query, starter_tx, stats).await;
        });

        match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(Some(winner)) => {
                self.stats.record_win(&winner.name_client);
                trace!(
                    "winner for {} {}: {}",
                    query.qname, query.qtype, winner.name_client
                );
                // Feed the winner back so the cacher sees it too, then close
                // our handle; stragglers keep writing through their clones.
                let _ = tx.send(winner.clone()).await;
                drop(tx);
                let cache = self.cache.clone();
                tokio::spawn(async move {
                    drain_into_cache(&mut rx, &cache).await;
                });
                Ok(winner)
            }
            Ok(None) => Err(ResolveError::Timeout),
            Err(_) => {
                debug!("race deadline for {} {}", query.qname, query.qtype);
                Err(ResolveError::Timeout)
            }
        }
    }

    /// The field for one race: cache first, then providers by ascending
    /// moving-average latency; ANY drops the cache and ANY-refusing
    /// providers.
    fn entrants(&self, query: &DnsQuery) -> Vec<Arc<dyn Resolver>> {
        let mut entrants = self.resolvers.clone();
        let stats = &self.stats;
        // The cache entrant stays in front; only providers are reordered.
        if entrants.len() > 1 {
            entrants[1..].sort_by_key(|r| stats.ordering_latency(r.name()));
        }
        if query.is_any() {
            entrants.retain(|r| !r.refuses_any());
        }
        entrants
    }
}

/// Launch one worker per entrant; wait for each worker's first committed
/// action (answer, decline, failure) or its stagger delay before launching
/// the next. Workers outlive the race so their answers reach the cacher.
async fn stagger_workers(
    entrants: Vec<Arc<dyn Resolver>>,
    query: DnsQuery,
    tx: mpsc::Sender<DnsAnswer>,
    stats: Arc<StatsRegistry>,
) {
    for resolver in entrants {
        let stagger = resolver.stagger();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let worker_tx = tx.clone();
        let worker_query = query.clone();
        let worker_stats = stats.clone();
        tokio::spawn(async move {
            run_worker(resolver, worker_query, worker_tx, worker_stats).await;
            drop(done_tx);
        });
        let _ = tokio::time::timeout(stagger, done_rx).await;
    }
}

async fn run_worker(
    resolver: Arc<dyn Resolver>,
    query: DnsQuery,
    tx: mpsc::Sender<DnsAnswer>,
    stats: Arc<StatsRegistry>,
) {
    let name = resolver.name().to_string();
    stats.record_query(&name);
    let started = Instant::now();
    match tokio::time::timeout(WORKER_DEADLINE, resolver.resolve(&query)).await {
        Ok(Ok(answer)) => {
            stats.record_success(&name, started.elapsed());
            // A closed channel means we are late and no-one's listening.
            let _ = tx.send(answer).await;
        }
        Ok(Err(e)) if e.is_decline() => {
            trace!("[{name}] declined {} {}: {e}", query.qname, query.qtype);
        }
        Ok(Err(e)) => {
            debug!("[{name}] failed {} {}: {e}", query.qname, query.qtype);
        }
        Err(_) => {
            debug!("[{name}] gave no answer for {} {}", query.qname, query.qtype);
            stats.record_timeout(&name);
        }
    }
}

/// Post-race cacher: reads what remains in the mailbox (the winner's clone
/// plus any late arrivals) and merges each answer into the cache.
async fn drain_into_cache(rx: &mut mpsc::Receiver<DnsAnswer>, cache: &Cache) {
    let drain = async {
        while let Some(answer) = rx.recv().await {
            cache.store(&answer).await;
        }
    };
    if tokio::time::timeout(CACHER_DRAIN, drain).await.is_err() {
        debug!("cacher drain window expired");
    }
}
