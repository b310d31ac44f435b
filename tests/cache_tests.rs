use hermod::answer::{DnsAnswer, JsonQuestion, JsonRecord};
use hermod::cache::{Cache, CacheBackend, CacheEntry, MemoryBackend};
use hermod::error::ResolveError;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A cache plus a handle onto its backend for direct inspection.
fn test_cache() -> (Cache, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    (Cache::new(Box::new(backend.clone())), backend)
}

fn answer_with(qname: &str, records: &[(u16, u32, &str)]) -> DnsAnswer {
    DnsAnswer {
        status: 0,
        rd: true,
        ra: true,
        question: vec![JsonQuestion {
            name: qname.to_string(),
            rtype: 1,
        }],
        answer: records
            .iter()
            .map(|(rtype, ttl, data)| JsonRecord {
                name: qname.to_string(),
                rtype: *rtype,
                ttl: *ttl,
                data: (*data).to_string(),
            })
            .collect(),
        name_client: "google".to_string(),
        ..DnsAnswer::default()
    }
}

#[tokio::test]
async fn miss_is_not_cached() {
    let (cache, _) = test_cache();
    let err = cache.lookup("example.com.", 1).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotCached(_)));
    assert!(err.is_decline());
}

#[tokio::test]
async fn hit_returns_cache_provenance_and_remaining_ttl() {
    let (cache, _) = test_cache();
    cache
        .store(&answer_with("example.com.", &[(1, 3600, "93.184.216.34")]))
        .await;

    let answer = cache.lookup("example.com.", 1).await.unwrap();
    assert_eq!(answer.name_client, "Cache");
    assert_eq!(answer.status, 0);
    assert!(answer.rd && answer.ra);
    assert_eq!(answer.question[0].name, "example.com.");
    assert_eq!(answer.answer.len(), 1);
    assert_eq!(answer.answer[0].data, "93.184.216.34");
    assert!(answer.answer[0].ttl <= 3600 && answer.answer[0].ttl > 3590);
}

#[tokio::test]
async fn type_filter_keeps_matches_and_cnames_only() {
    let (cache, _) = test_cache();
    cache
        .store(&answer_with(
            "example.com.",
            &[(1, 3600, "93.184.216.34"), (28, 3600, "2606:2800:220:1::")],
        ))
        .await;

    let a = cache.lookup("example.com.", 1).await.unwrap();
    assert_eq!(a.answer.len(), 1);
    assert_eq!(a.answer[0].rtype, 1);

    let aaaa = cache.lookup("example.com.", 28).await.unwrap();
    assert_eq!(aaaa.answer.len(), 1);
    assert_eq!(aaaa.answer[0].rtype, 28);

    let err = cache.lookup("example.com.", 16).await.unwrap_err();
    assert!(matches!(err, ResolveError::NoSuitableRecords));
}

#[tokio::test]
async fn any_is_rejected() {
    let (cache, _) = test_cache();
    cache
        .store(&answer_with("example.com.", &[(1, 3600, "93.184.216.34")]))
        .await;
    let err = cache.lookup("example.com.", 255).await.unwrap_err();
    assert!(err.is_decline());
}

#[tokio::test]
async fn merge_keeps_the_later_expiry() {
    let (cache, _) = test_cache();
    cache
        .store(&answer_with("example.com.", &[(1, 300, "93.184.216.34")]))
        .await;
    // A shorter TTL for the same (type, data) must not shorten the entry.
    cache
        .store(&answer_with("example.com.", &[(1, 30, "93.184.216.34")]))
        .await;
    let answer = cache.lookup("example.com.", 1).await.unwrap();
    assert!(answer.answer[0].ttl > 290, "ttl was {}", answer.answer[0].ttl);

    // A longer TTL extends it.
    cache
        .store(&answer_with("example.com.", &[(1, 900, "93.184.216.34")]))
        .await;
    let answer = cache.lookup("example.com.", 1).await.unwrap();
    assert!(answer.answer[0].ttl > 890, "ttl was {}", answer.answer[0].ttl);
}

#[tokio::test]
async fn store_is_idempotent() {
    let (cache, _) = test_cache();
    let answer = answer_with("example.com.", &[(1, 3600, "93.184.216.34")]);
    cache.store(&answer).await;
    cache.store(&answer).await;
    let hit = cache.lookup("example.com.", 1).await.unwrap();
    assert_eq!(hit.answer.len(), 1);
}

#[tokio::test]
async fn records_for_other_names_are_ignored() {
    let (cache, _) = test_cache();
    let mut answer = answer_with("example.com.", &[]);
    answer.answer.push(JsonRecord {
        name: "other.com.".to_string(),
        rtype: 1,
        ttl: 3600,
        data: "1.2.3.4".to_string(),
    });
    cache.store(&answer).await;
    let err = cache.lookup("example.com.", 1).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotCached(_)));
}

#[tokio::test]
async fn empty_answers_are_not_stored() {
    let (cache, backend) = test_cache();
    cache.store(&answer_with("example.com.", &[])).await;
    assert!(backend.get("dns:example.com.").await.unwrap().is_none());
}

#[tokio::test]
async fn answers_merge_across_providers() {
    let (cache, _) = test_cache();
    cache
        .store(&answer_with("example.com.", &[(1, 3600, "93.184.216.34")]))
        .await;
    let mut second = answer_with("example.com.", &[(1, 3600, "93.184.216.35")]);
    second.name_client = "cloudflare".to_string();
    cache.store(&second).await;

    let hit = cache.lookup("example.com.", 1).await.unwrap();
    let mut data: Vec<&str> = hit.answer.iter().map(|r| r.data.as_str()).collect();
    data.sort();
    assert_eq!(data, vec!["93.184.216.34", "93.184.216.35"]);
}

#[tokio::test]
async fn cname_chase_returns_both_links() {
    let (cache, _) = test_cache();
    cache
        .store(&answer_with("www.x.com.", &[(5, 3600, "x.com.")]))
        .await;
    cache
        .store(&answer_with("x.com.", &[(1, 3600, "1.2.3.4")]))
        .await;

    let hit = cache.lookup("www.x.com.", 1).await.unwrap();
    assert_eq!(hit.answer.len(), 2);
    let cname = hit.answer.iter().find(|r| r.rtype == 5).unwrap();
    assert_eq!(cname.name, "www.x.com.");
    assert_eq!(cname.data, "x.com.");
    let a = hit.answer.iter().find(|r| r.rtype == 1).unwrap();
    assert_eq!(a.name, "x.com.");
    assert_eq!(a.data, "1.2.3.4");
}

#[tokio::test]
async fn cname_chains_are_chased_one_level_only() {
    let (cache, _) = test_cache();
    cache
        .store(&answer_with("www.x.com.", &[(5, 3600, "a.x.com.")]))
        .await;
    cache
        .store(&answer_with("a.x.com.", &[(5, 3600, "b.x.com.")]))
        .await;
    cache
        .store(&answer_with("b.x.com.", &[(1, 3600, "1.2.3.4")]))
        .await;

    let hit = cache.lookup("www.x.com.", 1).await.unwrap();
    // Two CNAME links come back; the address behind the second is not
    // followed.
    assert_eq!(hit.answer.len(), 2);
    assert!(hit.answer.iter().all(|r| r.rtype == 5));
    assert!(hit.answer.iter().all(|r| r.data != "1.2.3.4"));
}

#[tokio::test]
async fn chase_with_missing_target_declines() {
    let (cache, _) = test_cache();
    cache
        .store(&answer_with("www.x.com.", &[(5, 3600, "gone.x.com.")]))
        .await;
    let err = cache.lookup("www.x.com.", 1).await.unwrap_err();
    assert!(err.is_decline());
}

#[tokio::test]
async fn hard_expiry_purges_the_entry() {
    let (cache, backend) = test_cache();
    cache
        .store(&answer_with("example.com.", &[(1, 3600, "93.184.216.34")]))
        .await;
    assert!(cache.lookup("example.com.", 1).await.is_ok());

    // Simulate the hard expiry passing.
    backend
        .expire_at("dns:example.com.", unix_now() - 1)
        .await
        .unwrap();
    let err = cache.lookup("example.com.", 1).await.unwrap_err();
    assert!(matches!(err, ResolveError::NotCached(_)));
}

#[tokio::test]
async fn stale_records_never_leak() {
    let (cache, backend) = test_cache();
    // Entry whose records expired a minute ago but whose key still exists.
    let entry = CacheEntry {
        records: vec![(1, unix_now() - 60, "93.184.216.34".to_string())],
        hard_expiry: unix_now() + 3600,
    };
    backend
        .set("dns:example.com.", serde_json::to_vec(&entry).unwrap())
        .await
        .unwrap();

    let err = cache.lookup("example.com.", 1).await.unwrap_err();
    assert!(matches!(err, ResolveError::NoSuitableRecords));
}

#[tokio::test]
async fn merging_only_expired_records_deletes_the_entry() {
    let (cache, backend) = test_cache();
    // TTL 0 records expire immediately; nothing survives the merge.
    cache
        .store(&answer_with("example.com.", &[(1, 0, "93.184.216.34")]))
        .await;
    assert!(backend.get("dns:example.com.").await.unwrap().is_none());
}

#[tokio::test]
async fn hard_expiry_is_capped_at_one_day() {
    let (cache, backend) = test_cache();
    cache
        .store(&answer_with("example.com.", &[(1, 7 * 86_400, "93.184.216.34")]))
        .await;
    let bytes = backend.get("dns:example.com.").await.unwrap().unwrap();
    let entry: CacheEntry = serde_json::from_slice(&bytes).unwrap();
    assert!(entry.hard_expiry <= unix_now() + 86_400);
    // The record itself keeps its full expiry.
    assert!(entry.records[0].1 > unix_now() + 6 * 86_400);
}
