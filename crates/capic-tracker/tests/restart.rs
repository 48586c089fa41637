//! Request tracking across controller restarts

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use capic_cloud::{CloudError, MockCloudClient, MutationOutcome, RequestStatus};
use capic_tracker::{
    MemoryRequestStore, OperationKind, PollResult, RequestState, RequestStore, RequestTracker,
    ResourceKey,
};

fn key() -> ResourceKey {
    ResourceKey::machine("default", "m1")
}

/// Story: the controller crashes right after submitting a create
///
/// The restarted controller rebuilds its tracker over the same durable store.
/// Every subsequent pass must find the recorded request and poll it; the
/// create call reaches the cloud exactly once.
#[tokio::test]
async fn story_restart_after_submit_never_recreates() {
    let store = MemoryRequestStore::new();
    let creates = Arc::new(AtomicU32::new(0));

    let issue = |creates: Arc<AtomicU32>| {
        move || async move {
            creates.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CloudError>(MutationOutcome::Accepted {
                request_id: "req-1".to_string(),
                resource_id: Some("srv-1".to_string()),
            })
        }
    };

    let before_crash = RequestTracker::new(Arc::new(store.clone()));
    let first = before_crash
        .submit(&key(), OperationKind::CreateServer, issue(creates.clone()))
        .await
        .expect("submit");
    assert!(first.is_new);
    drop(before_crash);

    for _ in 0..5 {
        let after_restart = RequestTracker::new(Arc::new(store.clone()));
        let again = after_restart
            .submit(&key(), OperationKind::CreateServer, issue(creates.clone()))
            .await
            .expect("submit");
        assert!(!again.is_new);
        assert_eq!(again.request.cloud_request_id, "req-1");
    }

    assert_eq!(creates.load(Ordering::SeqCst), 1);
}

/// Story: a finished request is cleared and the next mutation of another kind proceeds
#[tokio::test]
async fn story_succeeded_request_is_cleared_after_use() {
    let store = MemoryRequestStore::new();
    let tracker = RequestTracker::new(Arc::new(store.clone()));

    let sub = tracker
        .submit(&key(), OperationKind::AllocateIp, || async {
            Ok(MutationOutcome::Accepted {
                request_id: "req-9".to_string(),
                resource_id: Some("ipb-1".to_string()),
            })
        })
        .await
        .expect("submit");

    let mut cloud = MockCloudClient::new();
    cloud
        .expect_request_status()
        .withf(|id| id == "req-9")
        .times(1)
        .returning(|_| Ok(RequestStatus::Done));

    let polled = tracker.poll(&cloud, &sub.request).await.expect("poll");
    assert_eq!(
        polled.result,
        PollResult::Succeeded {
            resource_id: Some("ipb-1".to_string())
        }
    );
    assert_eq!(polled.request.last_observed_state, RequestState::Succeeded);

    tracker
        .clear(&key(), OperationKind::AllocateIp)
        .await
        .expect("clear");
    assert!(store.list(&key()).await.expect("list").is_empty());
}

/// Distinct kinds and distinct resources never share an entry
#[tokio::test]
async fn test_entries_are_per_resource_and_kind() {
    let store = MemoryRequestStore::new();
    let tracker = RequestTracker::new(Arc::new(store.clone()));
    let other = ResourceKey::machine("default", "m2");

    for (k, kind) in [
        (key(), OperationKind::AttachNic),
        (key(), OperationKind::AllocateIp),
        (other.clone(), OperationKind::AttachNic),
    ] {
        let sub = tracker
            .submit(&k, kind, || async {
                Ok(MutationOutcome::Accepted {
                    request_id: "req".to_string(),
                    resource_id: None,
                })
            })
            .await
            .expect("submit");
        assert!(sub.is_new);
    }

    assert_eq!(tracker.outstanding(&key()).await.expect("list").len(), 2);
    assert_eq!(tracker.outstanding(&other).await.expect("list").len(), 1);
}
