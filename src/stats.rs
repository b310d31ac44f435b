//! Per-resolver counters feeding the race dispatcher's start ordering and
//! the `--debug` status display.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Latency clamp for the moving average; ordering only cares about the
/// sub-second range.
const LATENCY_CLAMP: Duration = Duration::from_secs(1);
/// Moving-average latency assumed for resolvers we know nothing about.
const UNKNOWN_LATENCY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct ResolverStats {
    /// Workers started for this resolver.
    pub queries: AtomicU64,
    /// Successful answers.
    pub successes: AtomicU64,
    /// Workers that never completed within their deadline.
    pub timeouts: AtomicU64,
    /// Races this resolver won.
    pub wins: AtomicU64,
    /// Exponential moving average of clamped latency, microseconds.
    /// Zero means "unknown" (never answered, or reset after a timeout).
    avg_micros: AtomicU64,
}

impl ResolverStats {
    fn record_success(&self, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let sample = elapsed.min(LATENCY_CLAMP).as_micros() as u64;
        let old = self.avg_micros.load(Ordering::Relaxed);
        let new = (old as f64 * 0.9 + sample as f64 * 0.1) as u64;
        self.avg_micros.store(new, Ordering::Relaxed);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.avg_micros.store(0, Ordering::Relaxed);
    }

    /// Moving-average latency as used for start ordering.
    pub fn ordering_latency(&self) -> Duration {
        match self.avg_micros.load(Ordering::Relaxed) {
            0 => UNKNOWN_LATENCY,
            micros => Duration::from_micros(micros),
        }
    }
}

/// Registry of per-resolver counters, keyed by resolver name.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    resolvers: DashMap<String, Arc<ResolverStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<ResolverStats> {
        self.resolvers
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn record_query(&self, name: &str) {
        self.entry(name).queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, name: &str, elapsed: Duration) {
        self.entry(name).record_success(elapsed);
    }

    pub fn record_timeout(&self, name: &str) {
        self.entry(name).record_timeout();
    }

    pub fn record_win(&self, name: &str) {
        self.entry(name).wins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ordering_latency(&self, name: &str) -> Duration {
        self.resolvers
            .get(name)
            .map(|s| s.ordering_latency())
            .unwrap_or(UNKNOWN_LATENCY)
    }

    /// One-line summary for the in-place status display.
    pub fn status_line(&self) -> String {
        let mut parts: Vec<String> = self
            .resolvers
            .iter()
            .map(|entry| {
                let s = entry.value();
                format!(
                    "{} q={} win={} to={} avg={}ms",
                    entry.key(),
                    s.queries.load(Ordering::Relaxed),
                    s.wins.load(Ordering::Relaxed),
                    s.timeouts.load(Ordering::Relaxed),
                    s.ordering_latency().as_millis(),
                )
            })
            .collect();
        parts.sort();
        parts.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_resolver_is_assumed_slow() {
        let stats = StatsRegistry::new();
        assert_eq!(stats.ordering_latency("google"), Duration::from_secs(1));
    }

    #[test]
    fn moving_average_tracks_latency() {
        let stats = StatsRegistry::new();
        for _ in 0..50 {
            stats.record_success("google", Duration::from_millis(40));
        }
        let avg = stats.ordering_latency("google");
        assert!(avg < Duration::from_millis(45), "avg converged to {avg:?}");
        assert!(avg > Duration::from_millis(10));
    }

    #[test]
    fn samples_are_clamped_to_one_second() {
        let stats = StatsRegistry::new();
        for _ in 0..100 {
            stats.record_success("slow", Duration::from_secs(30));
        }
        assert!(stats.ordering_latency("slow") <= Duration::from_secs(1));
    }

    #[test]
    fn timeout_resets_the_average() {
        let stats = StatsRegistry::new();
        stats.record_success("google", Duration::from_millis(40));
        assert!(stats.ordering_latency("google") < Duration::from_secs(1));
        stats.record_timeout("google");
        // Reset average reads as unknown, i.e. assumed slow.
        assert_eq!(stats.ordering_latency("google"), Duration::from_secs(1));
    }

    #[test]
    fn counters_accumulate() {
        let stats = StatsRegistry::new();
        stats.record_query("cloudflare");
        stats.record_query("cloudflare");
        stats.record_win("cloudflare");
        let entry = stats.entry("cloudflare");
        assert_eq!(entry.queries.load(Ordering::Relaxed), 2);
        assert_eq!(entry.wins.load(Ordering::Relaxed), 1);
        assert!(stats.status_line().contains("cloudflare q=2 win=1"));
    }
}
