use super::*;
use crate::test_support::FakeGateway;
use std::time::Duration;

async fn memory_storage() -> Arc<Storage> {
    Arc::new(Storage::new("sqlite::memory:").await.expect("sqlite"))
}

fn ids() -> (UserId, UserId) {
    (UserId::new("patient-1"), UserId::new("doctor-1"))
}

#[test]
fn pair_key_ignores_argument_order() {
    let (a, b) = ids();
    assert_eq!(PairKey::new(&a, &b), PairKey::new(&b, &a));
    assert_eq!(PairKey::new(&a, &b).as_str(), "8:doctor-1|patient-1");
    assert_ne!(PairKey::new(&a, &b), PairKey::new(&a, &UserId::new("doctor-2")));
}

#[test]
fn pair_key_separates_ids_that_contain_the_separator() {
    let split_left = PairKey::new(&UserId::new("a|b"), &UserId::new("c"));
    let split_right = PairKey::new(&UserId::new("a"), &UserId::new("b|c"));
    assert_ne!(split_left, split_right);

    let colon_left = PairKey::new(&UserId::new("1:a"), &UserId::new("b"));
    let colon_right = PairKey::new(&UserId::new("1:a|b"), &UserId::new("c"));
    assert_ne!(colon_left, colon_right);
}

#[tokio::test]
async fn colliding_looking_pairs_resolve_to_their_own_sessions() {
    let gateway = Arc::new(FakeGateway::new());
    let resolver = SessionResolver::new(gateway.clone(), memory_storage().await, 1);

    let first = resolver
        .resolve(&UserId::new("a|b"), &UserId::new("c"))
        .await
        .expect("first pair");
    let second = resolver
        .resolve(&UserId::new("a"), &UserId::new("b|c"))
        .await
        .expect("second pair");

    assert_ne!(first, second);
    assert_eq!(FakeGateway::calls(&gateway.resolve_calls), 2);
}

#[tokio::test]
async fn concurrent_resolves_converge_on_one_creation_call() {
    let gateway = Arc::new(FakeGateway::new().with_resolve_delay(Duration::from_millis(50)));
    let resolver = SessionResolver::new(gateway.clone(), memory_storage().await, 1);
    let (me, other) = ids();

    let (first, second) = tokio::join!(resolver.resolve(&me, &other), resolver.resolve(&me, &other));
    let first = first.expect("first");
    assert_eq!(second.expect("second"), first);
    assert_eq!(FakeGateway::calls(&gateway.resolve_calls), 1);
    assert!(resolver.inflight().is_empty());
}

#[tokio::test]
async fn cached_session_is_returned_after_a_successful_probe() {
    let gateway = Arc::new(FakeGateway::new());
    let resolver = SessionResolver::new(gateway.clone(), memory_storage().await, 1);
    let (me, other) = ids();

    let first = resolver.resolve(&me, &other).await.expect("create");
    let again = resolver.resolve(&other, &me).await.expect("cached");
    assert_eq!(first, again);
    assert_eq!(FakeGateway::calls(&gateway.resolve_calls), 1);
    assert_eq!(FakeGateway::calls(&gateway.probe_calls), 1);
}

#[tokio::test]
async fn failed_probe_evicts_both_tiers_and_resolves_again() {
    let gateway = Arc::new(FakeGateway::new());
    let storage = memory_storage().await;
    let resolver = SessionResolver::new(gateway.clone(), storage.clone(), 1);
    let (me, other) = ids();

    let stale = resolver.resolve(&me, &other).await.expect("create");
    gateway.forget_session(&stale);

    let fresh = resolver.resolve(&me, &other).await.expect("recreate");
    assert_ne!(fresh, stale);
    assert_eq!(FakeGateway::calls(&gateway.resolve_calls), 2);
    assert_eq!(resolver.cached(&me, &other).await, Some(fresh.clone()));
    let key = PairKey::new(&me, &other);
    assert_eq!(storage.cached_session(key.as_str()).await.expect("read"), Some(fresh));
}

#[tokio::test]
async fn persistent_hit_is_promoted_to_memory() {
    let gateway = Arc::new(FakeGateway::new());
    let storage = memory_storage().await;
    let (me, other) = ids();
    let persisted = SessionId::new("session-from-disk");
    storage
        .store_cached_session(PairKey::new(&me, &other).as_str(), &persisted)
        .await
        .expect("seed");
    gateway.know_session(&persisted);

    let resolver = SessionResolver::new(gateway.clone(), storage, 1);
    assert_eq!(resolver.cached(&me, &other).await, None);
    let resolved = resolver.resolve(&me, &other).await.expect("resolve");

    assert_eq!(resolved, persisted);
    assert_eq!(FakeGateway::calls(&gateway.resolve_calls), 0);
    assert_eq!(resolver.cached(&me, &other).await, Some(persisted));
}

#[tokio::test]
async fn resolution_failure_is_wrapped_and_caches_nothing() {
    let gateway = Arc::new(FakeGateway::new());
    gateway.fail_resolve(ChatError::NetworkTimeout);
    let storage = memory_storage().await;
    let resolver = SessionResolver::new(gateway.clone(), storage.clone(), 1);
    let (me, other) = ids();

    let err = resolver.resolve(&me, &other).await.expect_err("failure");
    assert_eq!(
        err,
        ChatError::SessionResolutionFailure(Box::new(ChatError::NetworkTimeout))
    );
    assert_eq!(resolver.cached(&me, &other).await, None);
    assert!(storage.list_cached_sessions().await.expect("list").is_empty());
}

#[tokio::test]
async fn resolving_with_yourself_is_rejected() {
    let gateway = Arc::new(FakeGateway::new());
    let resolver = SessionResolver::new(gateway.clone(), Arc::new(NoPersistentCache), 1);
    let me = UserId::new("patient-1");
    let err = resolver.resolve(&me, &me).await.expect_err("self");
    assert!(matches!(err, ChatError::Validation(_)));
    assert_eq!(FakeGateway::calls(&gateway.resolve_calls), 0);
}

#[tokio::test]
async fn invalidate_and_clear_empty_both_tiers() {
    let gateway = Arc::new(FakeGateway::new());
    let storage = memory_storage().await;
    let resolver = SessionResolver::new(gateway.clone(), storage.clone(), 1);
    let (me, other) = ids();
    let third = UserId::new("admin-1");

    resolver.resolve(&me, &other).await.expect("first pair");
    resolver.resolve(&me, &third).await.expect("second pair");

    assert!(resolver.invalidate(&other, &me).await.expect("invalidate"));
    assert!(!resolver.invalidate(&other, &me).await.expect("invalidate again"));
    assert_eq!(resolver.cached(&me, &other).await, None);
    assert_eq!(storage.list_cached_sessions().await.expect("list").len(), 1);

    resolver.clear().await.expect("clear");
    assert_eq!(resolver.cached(&me, &third).await, None);
    assert!(storage.list_cached_sessions().await.expect("list").is_empty());
}
