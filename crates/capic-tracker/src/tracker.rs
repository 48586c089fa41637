//! Submit / poll / clear of tracked cloud requests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use capic_cloud::error::classify_request_failure;
use capic_cloud::{CloudClient, CloudError, MutationOutcome, RequestStatus};
use capic_common::crd::{OperationKind, ProvisioningRequest, RequestState, ResourceKey};
use capic_common::{Error, ErrorClass, ReconcileConfig};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::store::RequestStore;

/// Result of [`RequestTracker::submit`]
#[derive(Clone, Debug, PartialEq)]
pub struct Submission {
    /// The tracked request (new or pre-existing)
    pub request: ProvisioningRequest,
    /// False when an existing entry was returned and nothing was issued
    pub is_new: bool,
}

/// Outcome of polling a tracked request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollResult {
    /// Still queued or running
    Pending,
    /// Finished; carries the created/acted-on resource id when known
    Succeeded {
        /// Cloud resource id
        resource_id: Option<String>,
    },
    /// Finished with an error
    Failed {
        /// Classification of the failure
        class: ErrorClass,
        /// Message reported by the cloud
        message: String,
    },
}

/// Result of [`RequestTracker::poll`]
#[derive(Clone, Debug, PartialEq)]
pub struct Polled {
    /// The entry after the poll was recorded
    pub request: ProvisioningRequest,
    /// What the poll observed
    pub result: PollResult,
}

/// Where a driven request stands after one pass
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Still in flight; poll again later
    Waiting {
        /// The recorded request
        request: ProvisioningRequest,
    },
    /// Finished successfully
    Done {
        /// Cloud resource id, when known
        resource_id: Option<String>,
    },
}

/// Deduplicates cloud mutations per `(resource, operation kind)`
#[derive(Clone)]
pub struct RequestTracker {
    store: Arc<dyn RequestStore>,
}

impl RequestTracker {
    /// Create a tracker over the given store
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    /// Return the outstanding request for `(key, kind)`, or issue a new one
    ///
    /// `issue` runs at most once, and only when no entry exists. A new
    /// asynchronous request is persisted before this returns. When `issue`
    /// fails nothing is recorded and the classified error is returned.
    pub async fn submit<F, Fut>(
        &self,
        key: &ResourceKey,
        kind: OperationKind,
        issue: F,
    ) -> Result<Submission, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MutationOutcome, CloudError>>,
    {
        if let Some(existing) = self.store.get(key, kind).await? {
            debug!(
                resource = %key,
                kind = %kind,
                request_id = %existing.cloud_request_id,
                "Found outstanding request, polling instead of re-issuing"
            );
            return Ok(Submission {
                request: existing,
                is_new: false,
            });
        }

        let outcome = issue()
            .await
            .map_err(|e| e.into_error(&key.to_string(), kind.as_str()))?;

        match outcome {
            MutationOutcome::Accepted {
                request_id,
                resource_id,
            } => {
                let request = ProvisioningRequest::new(key.clone(), kind, request_id, resource_id);
                self.store.put(&request).await?;
                info!(
                    resource = %key,
                    kind = %kind,
                    request_id = %request.cloud_request_id,
                    target = ?request.target_id,
                    "Cloud request submitted"
                );
                Ok(Submission {
                    request,
                    is_new: true,
                })
            }
            MutationOutcome::Completed { resource_id } => {
                let mut request = ProvisioningRequest::new(key.clone(), kind, "", resource_id);
                request.last_observed_state = RequestState::Succeeded;
                debug!(resource = %key, kind = %kind, "Cloud mutation completed synchronously");
                Ok(Submission {
                    request,
                    is_new: true,
                })
            }
        }
    }

    /// Look up the outstanding request for `(key, kind)` without issuing anything
    pub async fn lookup(
        &self,
        key: &ResourceKey,
        kind: OperationKind,
    ) -> Result<Option<ProvisioningRequest>, Error> {
        self.store.get(key, kind).await
    }

    /// All tracked requests of a resource
    pub async fn outstanding(&self, key: &ResourceKey) -> Result<Vec<ProvisioningRequest>, Error> {
        self.store.list(key).await
    }

    /// Ask the cloud for the request's state and record what was observed
    ///
    /// Already-terminal handles are answered from the record. A request id the
    /// cloud does not know is reported as failed with [`ErrorClass::NotFound`].
    /// Transport failures are returned as errors and leave the record untouched.
    pub async fn poll(
        &self,
        cloud: &dyn CloudClient,
        handle: &ProvisioningRequest,
    ) -> Result<Polled, Error> {
        if handle.is_terminal() || handle.cloud_request_id.is_empty() {
            return Ok(Polled {
                request: handle.clone(),
                result: recorded_result(handle),
            });
        }

        let result = match cloud.request_status(&handle.cloud_request_id).await {
            Ok(RequestStatus::Queued) | Ok(RequestStatus::Running) => PollResult::Pending,
            Ok(RequestStatus::Done) => PollResult::Succeeded {
                resource_id: handle.target_id.clone(),
            },
            Ok(RequestStatus::Failed { message }) => PollResult::Failed {
                class: classify_request_failure(&message),
                message,
            },
            Err(e) if e.is_not_found() => PollResult::Failed {
                class: ErrorClass::NotFound,
                message: format!("request {} is unknown to the cloud", handle.cloud_request_id),
            },
            Err(e) => {
                return Err(e.into_error(&handle.resource_key.to_string(), "request_status"));
            }
        };

        let mut request = handle.clone();
        request.last_polled_at = Some(Utc::now());
        request.poll_count = request.poll_count.saturating_add(1);
        match &result {
            PollResult::Pending => request.last_observed_state = RequestState::Pending,
            PollResult::Succeeded { .. } => request.last_observed_state = RequestState::Succeeded,
            PollResult::Failed { class, message } => {
                request.last_observed_state = RequestState::Failed;
                request.failure_class = Some(*class);
                request.failure_message = Some(message.clone());
                warn!(
                    resource = %request.resource_key,
                    kind = %request.operation_kind,
                    request_id = %request.cloud_request_id,
                    class = %class,
                    message = %message,
                    "Cloud request failed"
                );
            }
        }
        self.store.put(&request).await?;

        Ok(Polled { request, result })
    }

    /// Forget the request for `(key, kind)`; clearing a missing entry succeeds
    pub async fn clear(&self, key: &ResourceKey, kind: OperationKind) -> Result<(), Error> {
        self.store.remove(key, kind).await
    }

    /// Submit-or-find the request for `(key, kind)`, then poll it once
    ///
    /// A request that finished with an error is cleared, so a later pass may
    /// issue a fresh one, and its classified failure is returned as the error.
    /// A succeeded entry is left in place; the caller clears it once the
    /// result is recorded elsewhere.
    pub async fn drive<F, Fut>(
        &self,
        cloud: &dyn CloudClient,
        key: &ResourceKey,
        kind: OperationKind,
        issue: F,
    ) -> Result<Step, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MutationOutcome, CloudError>>,
    {
        let submission = self.submit(key, kind, issue).await?;
        self.resolve(cloud, &submission.request).await
    }

    /// Poll an already recorded request once, with the same clearing rules as [`drive`](Self::drive)
    pub async fn resolve(
        &self,
        cloud: &dyn CloudClient,
        request: &ProvisioningRequest,
    ) -> Result<Step, Error> {
        let polled = self.poll(cloud, request).await?;
        match polled.result {
            PollResult::Pending => Ok(Step::Waiting {
                request: polled.request,
            }),
            PollResult::Succeeded { resource_id } => Ok(Step::Done { resource_id }),
            PollResult::Failed { class, message } => {
                let key = &request.resource_key;
                let kind = request.operation_kind;
                self.clear(key, kind).await?;
                Err(Error::cloud(key.to_string(), kind.as_str(), class, message))
            }
        }
    }

    /// Delay before polling `request` again, and whether it has gone stale
    ///
    /// Stale requests are still polled, but back off on their poll count
    /// instead of using the fixed poll interval.
    pub fn next_poll(
        request: &ProvisioningRequest,
        config: &ReconcileConfig,
        now: DateTime<Utc>,
    ) -> (Duration, bool) {
        request.next_poll(config, now)
    }

    /// Whether a still-pending request is older than `threshold`
    pub fn is_stale(request: &ProvisioningRequest, threshold: Duration, now: DateTime<Utc>) -> bool {
        request.is_stale(threshold, now)
    }
}

fn recorded_result(handle: &ProvisioningRequest) -> PollResult {
    match handle.last_observed_state {
        RequestState::Succeeded => PollResult::Succeeded {
            resource_id: handle.target_id.clone(),
        },
        RequestState::Failed => PollResult::Failed {
            class: handle.failure_class.unwrap_or(ErrorClass::Permanent),
            message: handle
                .failure_message
                .clone()
                .unwrap_or_else(|| "request failed".to_string()),
        },
        // Nothing to ask the cloud about without a request id
        RequestState::Pending => PollResult::Succeeded {
            resource_id: handle.target_id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRequestStore;
    use capic_cloud::MockCloudClient;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> ResourceKey {
        ResourceKey::machine("default", "m1")
    }

    fn tracker() -> (RequestTracker, MemoryRequestStore) {
        let store = MemoryRequestStore::new();
        (RequestTracker::new(Arc::new(store.clone())), store)
    }

    fn accepted(request_id: &str, resource_id: &str) -> MutationOutcome {
        MutationOutcome::Accepted {
            request_id: request_id.to_string(),
            resource_id: Some(resource_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_drive_clears_failed_request() {
        let (tracker, store) = tracker();
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_request_status()
            .times(1)
            .returning(|_| {
                Ok(RequestStatus::Failed {
                    message: "image not found".to_string(),
                })
            });

        let err = tracker
            .drive(&cloud, &key(), OperationKind::CreateServer, || async {
                Ok(accepted("req-1", "srv-1"))
            })
            .await
            .expect_err("failed request");
        assert!(err.is_permanent());
        assert_eq!(err.reason(), "image not found");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_drive_reports_waiting_then_done() {
        let (tracker, store) = tracker();
        let polls = Arc::new(AtomicU32::new(0));
        let mut cloud = MockCloudClient::new();
        let seen = polls.clone();
        cloud.expect_request_status().times(2).returning(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(RequestStatus::Running)
            } else {
                Ok(RequestStatus::Done)
            }
        });

        let first = tracker
            .drive(&cloud, &key(), OperationKind::AttachNic, || async {
                Ok(accepted("req-1", "nic-1"))
            })
            .await
            .expect("drive");
        assert!(matches!(first, Step::Waiting { ref request } if request.poll_count == 1));

        let second = tracker
            .drive(&cloud, &key(), OperationKind::AttachNic, || async {
                Ok(accepted("req-2", "nic-2"))
            })
            .await
            .expect("drive");
        assert_eq!(
            second,
            Step::Done {
                resource_id: Some("nic-1".to_string())
            }
        );
        // Kept until the caller has recorded the result
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_next_poll_backs_off_when_stale() {
        let config = ReconcileConfig::default();
        let mut request =
            ProvisioningRequest::new(key(), OperationKind::CreateServer, "req-1", None);
        request.poll_count = 2;

        let (delay, stale) = RequestTracker::next_poll(&request, &config, Utc::now());
        assert_eq!(delay, config.poll_interval);
        assert!(!stale);

        let later = Utc::now() + chrono::Duration::seconds(3600);
        let (delay, stale) = RequestTracker::next_poll(&request, &config, later);
        assert!(stale);
        assert_eq!(delay, config.backoff.delay_for(2));
    }

    #[tokio::test]
    async fn test_submit_issues_once_and_persists() {
        let (tracker, store) = tracker();
        let calls = AtomicU32::new(0);

        let first = tracker
            .submit(&key(), OperationKind::CreateServer, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(accepted("req-1", "srv-1"))
            })
            .await
            .expect("submit");
        assert!(first.is_new);
        assert_eq!(store.len(), 1);

        let second = tracker
            .submit(&key(), OperationKind::CreateServer, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(accepted("req-2", "srv-2"))
            })
            .await
            .expect("submit");
        assert!(!second.is_new);
        assert_eq!(second.request.cloud_request_id, "req-1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_issue_records_nothing() {
        let (tracker, store) = tracker();
        let err = tracker
            .submit(&key(), OperationKind::CreateServer, || async {
                Err(CloudError::from_status(422, "image not found"))
            })
            .await
            .expect_err("rejected");
        assert!(err.is_permanent());
        assert_eq!(err.reason(), "image not found");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_completed_outcome_is_terminal_and_not_persisted() {
        let (tracker, store) = tracker();
        let sub = tracker
            .submit(&key(), OperationKind::ReleaseIp, || async {
                Ok(MutationOutcome::Completed {
                    resource_id: Some("ipb-1".to_string()),
                })
            })
            .await
            .expect("submit");
        assert!(sub.request.is_terminal());
        assert!(store.is_empty());

        let polled = tracker
            .poll(&MockCloudClient::new(), &sub.request)
            .await
            .expect("poll");
        assert_eq!(
            polled.result,
            PollResult::Succeeded {
                resource_id: Some("ipb-1".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_poll_updates_record() {
        let (tracker, store) = tracker();
        let sub = tracker
            .submit(&key(), OperationKind::CreateServer, || async {
                Ok(accepted("req-1", "srv-1"))
            })
            .await
            .expect("submit");

        let mut cloud = MockCloudClient::new();
        let mut seq = mockall::Sequence::new();
        cloud
            .expect_request_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(RequestStatus::Running));
        cloud
            .expect_request_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(RequestStatus::Done));

        let polled = tracker.poll(&cloud, &sub.request).await.expect("poll");
        assert_eq!(polled.result, PollResult::Pending);
        assert_eq!(polled.request.poll_count, 1);
        assert!(polled.request.last_polled_at.is_some());

        let polled = tracker.poll(&cloud, &polled.request).await.expect("poll");
        assert_eq!(
            polled.result,
            PollResult::Succeeded {
                resource_id: Some("srv-1".to_string())
            }
        );
        let stored = store
            .get(&key(), OperationKind::CreateServer)
            .await
            .expect("get")
            .expect("still recorded until cleared");
        assert_eq!(stored.last_observed_state, RequestState::Succeeded);
        assert_eq!(stored.poll_count, 2);
    }

    #[tokio::test]
    async fn test_failed_request_is_classified_from_message() {
        let (tracker, _) = tracker();
        let sub = tracker
            .submit(&key(), OperationKind::CreateServer, || async {
                Ok(accepted("req-1", "srv-1"))
            })
            .await
            .expect("submit");

        let mut cloud = MockCloudClient::new();
        cloud.expect_request_status().returning(|_| {
            Ok(RequestStatus::Failed {
                message: "insufficient capacity".to_string(),
            })
        });

        let polled = tracker.poll(&cloud, &sub.request).await.expect("poll");
        assert!(matches!(
            polled.result,
            PollResult::Failed {
                class: ErrorClass::Transient,
                ..
            }
        ));
        // A second poll is answered from the record
        let again = tracker
            .poll(&MockCloudClient::new(), &polled.request)
            .await
            .expect("poll");
        assert_eq!(again.result, polled.result);
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_not_found() {
        let (tracker, _) = tracker();
        let handle = ProvisioningRequest::new(key(), OperationKind::DeleteServer, "gone", None);
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_request_status()
            .returning(|_| Err(CloudError::not_found("no such request")));

        let polled = tracker.poll(&cloud, &handle).await.expect("poll");
        assert!(matches!(
            polled.result,
            PollResult::Failed {
                class: ErrorClass::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transient_poll_error_leaves_record_untouched() {
        let (tracker, store) = tracker();
        let sub = tracker
            .submit(&key(), OperationKind::AttachNic, || async {
                Ok(accepted("req-1", "nic-1"))
            })
            .await
            .expect("submit");

        let mut cloud = MockCloudClient::new();
        cloud
            .expect_request_status()
            .returning(|_| Err(CloudError::transient("connection reset")));

        let err = tracker.poll(&cloud, &sub.request).await.expect_err("transient");
        assert!(err.is_retryable());
        let stored = store
            .get(&key(), OperationKind::AttachNic)
            .await
            .expect("get")
            .expect("kept");
        assert_eq!(stored.poll_count, 0);
    }

    #[test]
    fn test_staleness() {
        let mut req = ProvisioningRequest::new(key(), OperationKind::CreateServer, "r", None);
        let now = req.created_at + chrono::Duration::minutes(11);
        assert!(RequestTracker::is_stale(&req, Duration::from_secs(600), now));
        assert!(!RequestTracker::is_stale(&req, Duration::from_secs(3600), now));

        req.last_observed_state = RequestState::Succeeded;
        assert!(!RequestTracker::is_stale(&req, Duration::from_secs(600), now));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let (tracker, store) = tracker();
        tracker
            .submit(&key(), OperationKind::CreateServer, || async {
                Ok(accepted("req-1", "srv-1"))
            })
            .await
            .expect("submit");
        tracker.clear(&key(), OperationKind::CreateServer).await.expect("clear");
        tracker.clear(&key(), OperationKind::CreateServer).await.expect("clear again");
        assert!(store.is_empty());
    }
}
