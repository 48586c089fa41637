//! IonosCloudMachine controller
//!
//! Drives one cloud server per machine through creation, network attachment
//! and bootstrap, and releases everything it created on deletion. Every cloud
//! mutation goes through the request tracker, so a retried or restarted pass
//! polls the outstanding request instead of issuing a second one.
//!
//! Related crates:
//! - `capic-cluster`: IonosCloudCluster controller
//! - `capic-tracker`: deduplication of asynchronous cloud requests

pub mod controller;
mod phases;

pub use controller::{
    cluster_of, error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl,
};

pub use capic_common::{Error, Result};
