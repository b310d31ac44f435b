//! Supervisor: wires the cache, providers, dispatcher and listeners
//! together, runs them under a shared shutdown scope, and tears everything
//! down in order on Ctrl-C.

use crate::cache::{Cache, MemoryBackend, RedisBackend};
use crate::config::Config;
use crate::doh::{tls, ProviderClient};
use crate::race::{RaceDispatcher, Resolver};
use crate::server;
use crate::stats::StatsRegistry;
use crate::error::SetupError;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// How long shutdown waits for the provider pools to finish their own
/// connection teardown before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);
/// Refresh interval for the `--debug` status line.
const STATUS_INTERVAL: Duration = Duration::from_millis(500);

/// Run the whole service until Ctrl-C. Fails fast when the configuration is
/// unusable or no UDP listener could be bound.
pub async fn run(config: Config) -> Result<(), SetupError> {
    let tls = tls::client_config()?;

    let cache = Arc::new(match &config.redis_url {
        Some(url) => match RedisBackend::connect(url).await {
            Ok(backend) => Cache::new(Box::new(backend)),
            // A dead backend must not keep DNS down; fall back and serve
            // from upstreams plus the in-process cache.
            Err(e) => {
                warn!("redis backend unavailable, using in-process cache: {e}");
                Cache::new(Box::new(MemoryBackend::new()))
            }
        },
        None => Cache::new(Box::new(MemoryBackend::new())),
    });

    let providers: Vec<Arc<ProviderClient>> = config
        .providers
        .iter()
        .map(|p| Arc::new(ProviderClient::new(p.clone(), tls.clone())))
        .collect();

    let stats = Arc::new(StatsRegistry::new());
    let mut resolvers: Vec<Arc<dyn Resolver>> = vec![cache.clone() as Arc<dyn Resolver>];
    resolvers.extend(providers.iter().map(|p| p.clone() as Arc<dyn Resolver>));
    let dispatcher = Arc::new(RaceDispatcher::new(resolvers, cache, stats.clone()));

    // Both address families; partial failure is tolerated, total failure is
    // fatal.
    let bind_addrs = [
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, config.port)),
    ];
    let mut listeners = Vec::new();
    for addr in bind_addrs {
        match server::bind_udp(addr) {
            Ok(socket) => listeners.push(socket),
            Err(e) => warn!("{e}"),
        }
    }
    if listeners.is_empty() {
        error!("could not bind any listener on port {}", config.port);
        return Err(SetupError::NoListeners);
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(8);
    let mut tasks = Vec::new();

    for socket in listeners {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(server::serve(socket, dispatcher, shutdown)));
    }
    for provider in &providers {
        let provider = provider.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(provider.run(shutdown)));
    }
    if config.debug {
        let stats = stats.clone();
        let providers = providers.clone();
        let shutdown = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(status_display(stats, providers, shutdown)));
    }

    tokio::signal::ctrl_c().await.map_err(|e| SetupError::Config(format!("no signal handler: {e}")))?;
    info!("Ctrl-C, shutting down");
    let _ = shutdown_tx.send(());

    let drain = futures::future::join_all(tasks);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("some tasks did not stop within the shutdown grace period");
    }
    info!("bye");
    Ok(())
}

/// Debug-mode status line, rewritten in place on stderr.
async fn status_display(
    stats: Arc<StatsRegistry>,
    providers: Vec<Arc<ProviderClient>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                eprintln!();
                break;
            }
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                let pools: Vec<String> = providers
                    .iter()
                    .map(|p| format!("{} conns={}", p.name(), p.live_connections()))
                    .collect();
                eprint!("\r{} | {}\x1b[K", pools.join(" "), stats.status_line());
            }
        }
    }
}
