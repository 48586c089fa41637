//! Command line interface
//!
//! Every timing knob of the reconcilers is a flag with a `CAPIC_*`
//! environment fallback; unset values keep the defaults in
//! [`ReconcileConfig`].

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use capic_cloud::http::DEFAULT_API_URL;
use capic_cloud::HttpConfig;
use capic_common::telemetry::{LogFormat, TelemetryConfig, DEFAULT_FILTER};
use capic_common::{BackoffConfig, ReconcileConfig};

/// capic - Cluster API infrastructure provider for IONOS Cloud
#[derive(Parser, Debug)]
#[command(name = "capic", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Log output format (json or pretty)
    #[arg(long, env = "CAPIC_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Controller settings
    #[command(flatten)]
    pub controller: ControllerArgs,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the IonosCloudCluster and IonosCloudMachine controllers (default)
    Controller,
}

/// Controller mode arguments
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Only watch resources in this namespace
    #[arg(long, env = "CAPIC_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Requeue interval while a cloud request is in flight
    #[arg(long, env = "CAPIC_POLL_INTERVAL_SECS", default_value = "10")]
    pub poll_interval_secs: u64,

    /// Requeue interval while waiting on another object
    #[arg(long, env = "CAPIC_WAITING_INTERVAL_SECS", default_value = "15")]
    pub waiting_interval_secs: u64,

    /// Drift-check interval for Ready clusters and Running machines
    #[arg(long, env = "CAPIC_RESYNC_INTERVAL_SECS", default_value = "300")]
    pub resync_interval_secs: u64,

    /// Age after which a pending cloud request is reported as stale
    #[arg(long, env = "CAPIC_STALENESS_THRESHOLD_SECS", default_value = "600")]
    pub staleness_threshold_secs: u64,

    /// First retry delay after a transient failure
    #[arg(long, env = "CAPIC_BACKOFF_INITIAL_SECS", default_value = "5")]
    pub backoff_initial_secs: u64,

    /// Upper bound for retry delays
    #[arg(long, env = "CAPIC_BACKOFF_MAX_SECS", default_value = "300")]
    pub backoff_max_secs: u64,

    /// Growth factor of retry delays
    #[arg(long, env = "CAPIC_BACKOFF_MULTIPLIER", default_value = "2.0")]
    pub backoff_multiplier: f64,

    /// Attempts for a status write that keeps conflicting
    #[arg(long, env = "CAPIC_CONFLICT_RETRIES", default_value = "5")]
    pub conflict_retries: u32,

    /// Concurrent reconciles per controller (0 = unbounded)
    #[arg(long, env = "CAPIC_CONCURRENCY", default_value = "8")]
    pub concurrency: u16,

    /// Cloud API base URL
    #[arg(long, env = "CAPIC_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Per-request timeout for cloud API calls
    #[arg(long, env = "CAPIC_HTTP_TIMEOUT_SECS", default_value = "30")]
    pub http_timeout_secs: u64,
}

impl ControllerArgs {
    /// Timing policy for both reconcilers
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            waiting_interval: Duration::from_secs(self.waiting_interval_secs),
            ready_resync: Duration::from_secs(self.resync_interval_secs),
            staleness_threshold: Duration::from_secs(self.staleness_threshold_secs),
            backoff: BackoffConfig {
                initial: Duration::from_secs(self.backoff_initial_secs),
                max: Duration::from_secs(self.backoff_max_secs),
                multiplier: self.backoff_multiplier,
            },
            conflict_retries: self.conflict_retries,
            concurrency: self.concurrency,
        }
    }

    /// Settings of the cloud HTTP client
    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            api_url: self.api_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..HttpConfig::default()
        }
    }
}

impl Cli {
    /// Logging setup selected on the command line
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            default_filter: DEFAULT_FILTER.to_string(),
            format: self.log_format,
        }
    }
}
