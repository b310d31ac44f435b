//! Per-provider client: keeps a warm pool of HTTP/2 connections to the
//! provider's endpoints and offers a provider-level `resolve()` that retries
//! across connections with staggered starts.

use super::connection::DohConnection;
use crate::answer::DnsAnswer;
use crate::config::ProviderConfig;
use crate::error::{ResolveError, Result};
use crate::race::Resolver;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Connections kept warm per provider.
const WARM_POOL: usize = 2;
/// Cap on a single request attempt against one connection.
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(300);
/// Launch offsets for retry attempts, milliseconds from the first attempt.
const LAUNCH_OFFSETS: [u64; 5] = [0, 200, 1000, 2000, 4000];
/// Pool maintenance poll interval; a died connection is replaced within this.
const POOL_POLL: Duration = Duration::from_secs(1);
/// Budget for each connection's teardown at shutdown.
const TEARDOWN_BUDGET: Duration = Duration::from_secs(1);

pub struct ProviderClient {
    config: ProviderConfig,
    tls: Arc<rustls::ClientConfig>,
    connections: Arc<Mutex<Vec<Arc<DohConnection>>>>,
    /// Set when a connection exits without ever completing an exchange; the
    /// next redial backs off instead of hammering a dead endpoint.
    cold_exit: Arc<AtomicBool>,
}

impl ProviderClient {
    pub fn new(config: ProviderConfig, tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            config,
            tls,
            connections: Arc::new(Mutex::new(Vec::new())),
            cold_exit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn live_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Keep the warm pool topped up until shutdown, rotating through the
    /// provider's endpoints (IPv6 first). Dial failures sleep a jittered
    /// 0..1 s; a connection that died cold adds one extra second.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let endpoints = self.config.endpoints();
        if endpoints.is_empty() {
            warn!("[{}] no endpoints configured", self.config.name);
            return;
        }
        let mut next_endpoint = 0usize;

        'serving: loop {
            while self.connections.lock().len() < WARM_POOL {
                if shutdown.try_recv().is_ok() {
                    break 'serving;
                }
                if self.cold_exit.swap(false, Ordering::Relaxed) {
                    tokio::time::sleep(
                        Duration::from_secs(1).mul_f64(1.0 + rand::random::<f64>()),
                    )
                    .await;
                }
                let ip = endpoints[next_endpoint % endpoints.len()];
                next_endpoint += 1;

                match DohConnection::connect(
                    &self.config.name,
                    &self.config.host,
                    &self.config.path,
                    ip,
                    self.tls.clone(),
                )
                .await
                {
                    Ok((connection, driver)) => {
                        self.connections.lock().push(connection.clone());
                        let registry = self.connections.clone();
                        let cold_exit = self.cold_exit.clone();
                        tokio::spawn(async move {
                            connection.clone().run(driver, registry).await;
                            if connection.successes() == 0 {
                                cold_exit.store(true, Ordering::Relaxed);
                            }
                        });
                    }
                    Err(e) => {
                        debug!("[{}] dial {ip} failed: {e}", self.config.name);
                        tokio::time::sleep(Duration::from_secs(1).mul_f64(rand::random::<f64>()))
                            .await;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(POOL_POLL) => {}
            }
        }

        // Structured teardown: cancel every connection, then wait for each
        // to finish its shielded cleanup.
        let connections: Vec<_> = self.connections.lock().clone();
        for connection in &connections {
            connection.cancel();
        }
        for connection in connections {
            if timeout(TEARDOWN_BUDGET, connection.wait_exited()).await.is_err() {
                warn!(
                    "[{}] {} did not exit within teardown budget",
                    self.config.name,
                    connection.peer(),
                );
            }
        }
    }

    /// Pick a random live connection not yet tried during this resolve call.
    fn pick_untried(&self, tried: &[usize]) -> Option<Arc<DohConnection>> {
        let connections = self.connections.lock();
        let candidates: Vec<Arc<DohConnection>> = connections
            .iter()
            .filter(|c| !c.is_exited() && !tried.contains(&(Arc::as_ptr(c) as *const () as usize)))
            .cloned()
            .collect();
        drop(connections);
        candidates.choose(&mut rand::rng()).cloned()
    }

    async fn resolve_inner(&self, query: &crate::answer::DnsQuery) -> Result<DnsAnswer> {
        if query.is_any() && self.config.refuses_any() {
            return Err(ResolveError::wont_resolve(format!(
                "{} won't answer */ANY requests",
                self.config.name
            )));
        }

        let started = Instant::now();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<DnsAnswer>>(LAUNCH_OFFSETS.len());
        let mut handles: Vec<tokio::task::JoinHandle<()>> = Vec::new();
        let mut tried: Vec<usize> = Vec::new();
        let mut attempt_errors: Vec<String> = Vec::new();
        let mut next_launch = 0usize;
        let mut outstanding = 0usize;

        loop {
            // Launch every attempt slot that has come due. A slot with no
            // free connection is forfeited; later slots recheck the pool.
            while next_launch < LAUNCH_OFFSETS.len()
                && started.elapsed() >= Duration::from_millis(LAUNCH_OFFSETS[next_launch])
            {
                if let Some(connection) = self.pick_untried(&tried) {
                    tried.push(Arc::as_ptr(&connection) as *const () as usize);
                    let tx = tx.clone();
                    let query = query.clone();
                    outstanding += 1;
                    handles.push(tokio::spawn(async move {
                        let result = match timeout(ATTEMPT_TIMEOUT, connection.resolve(&query)).await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ResolveError::Timeout),
                        };
                        let _ = tx.send(result).await;
                    }));
                }
                next_launch += 1;
            }

            let wake = if next_launch < LAUNCH_OFFSETS.len() {
                started + Duration::from_millis(LAUNCH_OFFSETS[next_launch])
            } else if outstanding > 0 {
                // All slots spent; grace period for in-flight attempts.
                Instant::now() + ATTEMPT_TIMEOUT
            } else {
                break;
            };

            match timeout_at(wake, rx.recv()).await {
                Ok(Some(Ok(answer))) => {
                    for handle in &handles {
                        handle.abort();
                    }
                    return Ok(answer);
                }
                Ok(Some(Err(e))) => {
                    outstanding -= 1;
                    attempt_errors.push(e.to_string());
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }

        for handle in &handles {
            handle.abort();
        }
        Err(ResolveError::WontResolve {
            reason: format!("[{}] no connection answered", self.config.name),
            attempts: attempt_errors,
        })
    }
}

#[async_trait]
impl Resolver for ProviderClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn refuses_any(&self) -> bool {
        self.config.refuses_any()
    }

    async fn resolve(&self, query: &crate::answer::DnsQuery) -> Result<DnsAnswer> {
        self.resolve_inner(query).await
    }
}
