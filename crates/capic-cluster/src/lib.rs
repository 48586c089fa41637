//! IonosCloudCluster controller
//!
//! Validates credentials and location, publishes the control-plane endpoint
//! (user supplied, or derived from a reserved IP block) and tears the cluster
//! down once all of its machines are gone.
//!
//! Related crates:
//! - `capic-machine`: IonosCloudMachine controller
//! - `capic-tracker`: deduplication of asynchronous cloud requests

pub mod controller;
mod phases;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};

pub use capic_common::{Error, Result};
