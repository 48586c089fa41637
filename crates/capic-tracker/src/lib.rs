//! Request Tracker
//!
//! Maps a logical cloud mutation (resource + operation kind) to the cloud's
//! asynchronous request id and its last observed state. A reconcile pass
//! that finds an outstanding entry polls it instead of issuing the mutation
//! again, which is what keeps retried and restarted reconciles from creating
//! duplicate servers.

#![deny(missing_docs)]

pub mod store;
pub mod tracker;

pub use capic_common::crd::{OperationKind, ProvisioningRequest, RequestState, ResourceKey, ResourceKind};
pub use store::{KubeRequestStore, MemoryRequestStore, RequestStore};
pub use tracker::{PollResult, Polled, RequestTracker, Step, Submission};
