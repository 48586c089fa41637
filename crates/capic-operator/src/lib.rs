//! IONOS Cloud infrastructure provider for Cluster API

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod cli;
/// Controller construction for IonosCloudCluster and IonosCloudMachine
pub mod controller_runner;
/// Startup utilities (CRD installation)
pub mod startup;
