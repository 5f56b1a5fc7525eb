//! Timeouts against a store that never answers

mod common;

use common::{endpoints, StalledStore};
use coordkv::{Coordinator, Error, GetOptions, LeaseId, PutOptions, StoreHandle};
use std::sync::Arc;
use std::time::Duration;

fn stalled_coordinator() -> Coordinator {
    Coordinator::with_handle(StoreHandle::new(
        Arc::new(StalledStore),
        endpoints(),
        Duration::from_secs(3),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_requests_return_annotated_deadline() {
    let coord = stalled_coordinator();

    let started = tokio::time::Instant::now();
    let err = coord.get("k", GetOptions::new()).await.unwrap_err();
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert!(err.is_deadline_exceeded());
    match &err {
        Error::DeadlineExceeded { endpoints } => {
            assert_eq!(endpoints, &vec!["127.0.0.1:2379".to_string()])
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err.to_string().contains("127.0.0.1:2379"));

    assert!(coord
        .put("k", "v", PutOptions::new())
        .await
        .unwrap_err()
        .is_deadline_exceeded());
    assert!(coord
        .acquire_lock("job", LeaseId(1))
        .await
        .unwrap_err()
        .is_deadline_exceeded());
    assert!(coord
        .put_with_expected_revision("k", "v", Some(4))
        .await
        .unwrap_err()
        .is_deadline_exceeded());
}

#[tokio::test(start_paused = true)]
async fn test_put_with_lease_stops_at_grant_deadline() {
    let coord = stalled_coordinator();
    let started = tokio::time::Instant::now();
    let err = coord.put_with_lease("k", "v", 10).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded { .. }));
    // Only the grant ran; the put was never attempted.
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_revoke_uses_plain_timeout() {
    let coord = stalled_coordinator();
    let err = coord.revoke(LeaseId(9)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(err.is_deadline_exceeded());
}

#[tokio::test(start_paused = true)]
async fn test_watch_is_not_deadline_bound() {
    use futures_util::StreamExt;

    let coord = stalled_coordinator();
    let mut events = coord
        .watch("k", coordkv::WatchOptions::new())
        .await
        .unwrap();
    let next = tokio::time::timeout(Duration::from_secs(60), events.next()).await;
    assert!(next.is_err(), "watch should still be waiting");
}
