//! What a phase handler decided
//!
//! Handlers never write to the API server themselves. They return the next
//! status as a value plus the follow-up work; the controller applies it in a
//! fixed order: status write, ledger cleanup, finalizer removal.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::warn;

use crate::crd::{
    clear_condition, condition_types, find_condition, set_condition, Condition, ConditionStatus,
    OperationKind, ProvisioningRequest,
};
use crate::events::{actions, reasons, EventPublisher};
use crate::ReconcileConfig;

/// Status fields every provider resource carries
pub trait ResourceStatus {
    /// Replace the human-readable message
    fn set_message(&mut self, message: String);
    /// Conditions as stored
    fn conditions(&self) -> &[Condition];
    /// Conditions, for in-place updates
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Result of one reconcile pass over a single resource
#[derive(Debug, Clone)]
pub struct Outcome<S> {
    /// Status to write, `None` to leave it untouched
    pub status: Option<S>,
    /// When to come back
    pub action: Action,
    /// Tracked requests whose result is captured in `status` and can be forgotten
    pub settled: Vec<OperationKind>,
    /// Drop the finalizer once the status is written
    pub remove_finalizer: bool,
}

impl<S> Outcome<S> {
    /// Requeue after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self {
            status: None,
            action: Action::requeue(delay),
            settled: Vec::new(),
            remove_finalizer: false,
        }
    }

    /// Wait for the next change event
    pub fn await_change() -> Self {
        Self {
            status: None,
            action: Action::await_change(),
            settled: Vec::new(),
            remove_finalizer: false,
        }
    }

    /// Write `status` as part of this outcome
    pub fn with_status(mut self, status: S) -> Self {
        self.status = Some(status);
        self
    }

    /// Forget the tracked request of `kind` after the status write
    pub fn settle(mut self, kind: OperationKind) -> Self {
        if !self.settled.contains(&kind) {
            self.settled.push(kind);
        }
        self
    }

    /// Remove the finalizer after the status write
    pub fn finalize(mut self) -> Self {
        self.remove_finalizer = true;
        self
    }
}

/// Requeue while `request` is in flight
///
/// Past the staleness threshold the RequestStale condition is raised (with
/// a Warning event the first time) and polling backs off.
pub async fn in_flight<S: ResourceStatus>(
    events: &dyn EventPublisher,
    object: &ObjectReference,
    config: &ReconcileConfig,
    mut status: S,
    request: &ProvisioningRequest,
    message: &str,
) -> Outcome<S> {
    let (delay, stale) = request.next_poll(config, Utc::now());
    status.set_message(message.to_string());
    if !stale {
        clear_condition(status.conditions_mut(), condition_types::REQUEST_STALE);
        return Outcome::requeue(delay).with_status(status);
    }

    let note = format!(
        "{} request {} pending after {} polls",
        request.operation_kind, request.cloud_request_id, request.poll_count
    );
    warn!(
        kind = %request.operation_kind,
        request_id = %request.cloud_request_id,
        polls = request.poll_count,
        "cloud request is stale"
    );
    if find_condition(status.conditions(), condition_types::REQUEST_STALE).is_none() {
        events
            .publish(
                object,
                EventType::Warning,
                reasons::REQUEST_STALE,
                actions::PROVISION,
                Some(note.clone()),
            )
            .await;
    }
    set_condition(
        status.conditions_mut(),
        Condition::new(
            condition_types::REQUEST_STALE,
            ConditionStatus::True,
            request.operation_kind.as_str(),
            note,
        ),
    );
    Outcome::requeue(delay).with_status(status)
}
