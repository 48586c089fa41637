//! capic - Cluster API infrastructure provider for IONOS Cloud

use clap::Parser;
use kube::Client;

use capic_common::telemetry::init_telemetry;
use capic_operator::cli::{Cli, Commands, ControllerArgs};
use capic_operator::controller_runner::build_controllers;
use capic_operator::startup::{crd_manifests, ensure_crds_installed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(cli.telemetry_config())
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

/// Run in controller mode
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "capic controller starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let config = args.reconcile_config();
    tracing::info!(
        poll_interval = ?config.poll_interval,
        staleness_threshold = ?config.staleness_threshold,
        concurrency = config.concurrency,
        "starting controllers"
    );
    let controllers = build_controllers(client, config, args.http_config(), args.watch_namespace);

    // Each controller stops on SIGTERM/SIGINT once its in-flight reconciles finish
    futures::future::join_all(controllers).await;

    tracing::info!("capic controller shutting down");
    Ok(())
}
