//! Cloud Provisioning Client for IONOS Cloud
//!
//! A thin, mockable adapter over the asynchronous cloud API. Mutations hand
//! back a request handle to poll; reads complete synchronously. Failures are
//! classified here so callers only see [`capic_common::ErrorClass`].

#![deny(missing_docs)]

pub mod adopt;
pub mod client;
pub mod error;
pub mod http;
pub mod types;

pub use adopt::{ensure_ip_block, ensure_server};
pub use client::{CloudClient, CloudClientFactory};
pub use error::{CloudError, CloudResult};
pub use http::{HttpClientFactory, HttpConfig, IonosCloudHttpClient};
pub use types::{
    IpBlockInfo, IpBlockSpec, MutationOutcome, NicInfo, NicSpec, RequestStatus, ResourceState,
    ServerInfo, ServerSpec,
};

#[cfg(any(test, feature = "mock"))]
pub use client::{MockCloudClient, MockCloudClientFactory};
