use windowguard::ratelimit::Clock;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use windowguard::config::EngineConfig;
use windowguard::ratelimit::{
    Decision, MockClock, RateLimit, RateLimitStorage, RateLimiter, RequestContext, RouteRules,
    TooManyRequests,
};
use windowguard::storage::InMemoryStorage;

fn setup() -> (RateLimiter, Arc<InMemoryStorage>, MockClock) {
    let clock = MockClock::new(Utc.with_ymd_and_hms(2020, 6, 1, 12, 0, 0).unwrap());
    let storage = Arc::new(InMemoryStorage::with_clock(Arc::new(clock.clone())));
    let limiter = RateLimiter::with_clock(storage.clone(), Arc::new(clock.clone()));
    (limiter, storage, clock)
}

fn get_limit(limit: i64, period: i64) -> RateLimit {
    let mut rate_limit = RateLimit::new(limit, period).unwrap();
    rate_limit.vary_on("method", "GET").unwrap();
    rate_limit
}

#[tokio::test]
async fn test_window_lifecycle() {
    let (limiter, _, clock) = setup();
    let rate_limit = get_limit(2, 60);

    let decisions: Vec<(Decision, u64)> = {
        let mut out = Vec::new();
        for _ in 0..4 {
            let verdict = limiter.enforce(&rate_limit).await.unwrap();
            out.push((verdict.decision, verdict.stored.hits()));
        }
        out
    };
    assert_eq!(
        decisions,
        vec![
            (Decision::Allow, 1),
            (Decision::Allow, 2),
            (Decision::Deny, 3),
            (Decision::Deny, 4),
        ]
    );

    clock.advance(Duration::seconds(59));
    assert!(!limiter.enforce(&rate_limit).await.unwrap().is_allowed());

    clock.advance(Duration::seconds(1));
    let verdict = limiter.enforce(&rate_limit).await.unwrap();
    assert!(verdict.is_allowed());
    assert_eq!(verdict.stored.hits(), 1);
    assert_eq!(verdict.stored.valid_until(), clock.now() + Duration::seconds(60));
}

#[tokio::test]
async fn test_expired_window_is_deleted_before_recreation() {
    let (limiter, storage, clock) = setup();
    let rate_limit = get_limit(1, 10);

    for _ in 0..5 {
        limiter.enforce(&rate_limit).await.unwrap();
    }
    assert_eq!(storage.get_stored(&rate_limit).await.unwrap().unwrap().hits(), 5);

    clock.advance(Duration::seconds(11));
    let verdict = limiter.enforce(&rate_limit).await.unwrap();
    assert_eq!((verdict.decision, verdict.stored.hits()), (Decision::Allow, 1));
    assert_eq!(storage.len(), 1);
}

#[tokio::test]
async fn test_dimensions_are_counted_separately() {
    let (limiter, _, _) = setup();
    let get = get_limit(1, 60);
    let mut post = RateLimit::new(1, 60).unwrap();
    post.vary_on("method", "POST").unwrap();

    assert!(limiter.enforce(&get).await.unwrap().is_allowed());
    assert!(limiter.enforce(&post).await.unwrap().is_allowed());
    assert!(!limiter.enforce(&get).await.unwrap().is_allowed());
}

#[tokio::test]
async fn test_request_without_rate_limit_passes_through() {
    let (limiter, storage, _) = setup();

    assert!(limiter.check(None).await.unwrap().is_none());
    assert!(storage.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hits_are_all_counted() {
    let (limiter, storage, _) = setup();
    let limiter = Arc::new(limiter);
    let rate_limit = get_limit(10, 60);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let limiter = limiter.clone();
            let rate_limit = rate_limit.clone();
            tokio::spawn(async move { limiter.enforce(&rate_limit).await })
        })
        .collect();

    let mut allowed = 0;
    for handle in futures::future::join_all(handles).await {
        if handle.unwrap().unwrap().is_allowed() {
            allowed += 1;
        }
    }

    let stored = storage.get_stored(&rate_limit).await.unwrap().unwrap();
    assert_eq!(stored.hits(), 50);
    assert!(allowed >= 10, "at least the first {} hits are allowed, got {}", 10, allowed);
}

#[tokio::test]
async fn test_configured_route_end_to_end() {
    let config = EngineConfig::from_yaml(
        r#"
display_headers: true
routes:
  create_order:
    limit: 1
    period: 30
attribute_modifiers: [tenant]
"#,
    )
    .unwrap();
    let rules = RouteRules::from_config(&config);
    let (limiter, _, clock) = setup();

    let acme = RequestContext::new("POST")
        .with_route("create_order")
        .with_attribute("tenant", "acme");
    let globex = RequestContext::new("POST")
        .with_route("create_order")
        .with_attribute("tenant", "globex");

    let first = limiter
        .check(rules.resolve(&acme).unwrap().as_ref())
        .await
        .unwrap()
        .unwrap();
    assert!(first.is_allowed());
    assert!(TooManyRequests::from_verdict(&first, config.display_headers).is_none());

    let other_tenant = limiter
        .check(rules.resolve(&globex).unwrap().as_ref())
        .await
        .unwrap()
        .unwrap();
    assert!(other_tenant.is_allowed());

    clock.advance(Duration::seconds(10));
    let second = limiter
        .check(rules.resolve(&acme).unwrap().as_ref())
        .await
        .unwrap()
        .unwrap();
    let rejection = TooManyRequests::from_verdict(&second, config.display_headers).unwrap();
    assert_eq!(rejection.status, 429);
    assert_eq!(
        rejection.body["vary"],
        r#"{"_route":"create_order","http_method":"POST","tenant":"acme"}"#
    );

    let headers = second.headers(clock.now());
    assert_eq!(headers.hits, 2);
    assert_eq!(headers.retry_after, 20);
}

#[tokio::test]
async fn test_unconfigured_route_is_not_limited() {
    let rules = RouteRules::from_config(&EngineConfig::default());
    let (limiter, storage, _) = setup();

    let request = RequestContext::new("GET").with_route("home");
    let rate_limit = rules.resolve(&request).unwrap();

    assert!(limiter.check(rate_limit.as_ref()).await.unwrap().is_none());
    assert!(storage.is_empty());
}

#[tokio::test]
async fn test_limited_routes_share_or_split_counters() {
    let yaml = r#"
limit: 2
period: 60
limited_routes:
  order_export:
    limit: 5
  order_import: {}
"#;

    for (limit_by_route, expected) in [
        (false, vec![Decision::Allow, Decision::Allow, Decision::Deny, Decision::Deny]),
        (true, vec![Decision::Allow, Decision::Allow, Decision::Allow, Decision::Allow]),
    ] {
        let config =
            EngineConfig::from_yaml(&format!("limit_by_route: {}\n{}", limit_by_route, yaml)).unwrap();
        let rules = RouteRules::from_config(&config);
        let (limiter, storage, _) = setup();

        let mut decisions = Vec::new();
        for route in ["order_export", "order_import", "order_export", "order_import"] {
            let request = RequestContext::new("POST").with_route(route);
            let verdict = limiter
                .check(rules.resolve(&request).unwrap().as_ref())
                .await
                .unwrap()
                .unwrap();
            decisions.push(verdict.decision);
        }

        assert_eq!(decisions, expected, "limit_by_route: {}", limit_by_route);
        assert_eq!(storage.len(), if limit_by_route { 2 } else { 1 });
    }
}
