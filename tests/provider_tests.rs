//! Provider-level behavior that needs no live upstream: ANY refusal and the
//! staggered retry schedule running out against an empty pool.

use hermod::answer::DnsQuery;
use hermod::config::default_providers;
use hermod::doh::{tls, ProviderClient};
use hermod::error::ResolveError;
use hermod::race::Resolver;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn cloudflare_declines_any_immediately() {
    let config = default_providers()
        .into_iter()
        .find(|p| p.name == "cloudflare")
        .unwrap();
    let client = ProviderClient::new(config, tls::client_config().unwrap());

    let started = Instant::now();
    let err = client
        .resolve(&DnsQuery::new("example.com.", 255))
        .await
        .unwrap_err();
    assert!(err.is_decline());
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn empty_pool_exhausts_the_retry_schedule() {
    let config = default_providers()
        .into_iter()
        .find(|p| p.name == "google")
        .unwrap();
    let client = ProviderClient::new(config, tls::client_config().unwrap());

    let started = Instant::now();
    let err = client
        .resolve(&DnsQuery::new("example.com.", 1))
        .await
        .unwrap_err();
    match err {
        ResolveError::WontResolve { attempts, .. } => assert!(attempts.is_empty()),
        other => panic!("unexpected error {other:?}"),
    }
    // The schedule rechecks the pool at 0.2, 1, 2 and 4 seconds before
    // giving up.
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(started.elapsed() < Duration::from_secs(6));
}
