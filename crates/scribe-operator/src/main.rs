//! Scribe - scheduled replication of PersistentVolumeClaims

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service, ServiceAccount};
use kube::api::DynamicObject;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use scribe_common::crd::ReplicationSource;
use scribe_common::kube_utils::HasApiResource;
use scribe_common::telemetry::{init_telemetry, TelemetryConfig};
use scribe_common::volume_snapshot::VolumeSnapshot;
use scribe_mover::{error_policy, reconcile, MoverContext, MoverImages};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Scribe - asynchronous replication of PersistentVolumeClaims
#[derive(Parser, Debug)]
#[command(name = "scribe", version, about, long_about = None)]
struct Cli {
    /// Print the ReplicationSource CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the ReplicationSource controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifest()?);
        return Ok(());
    }

    let telemetry = init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;
    if telemetry.is_exporting() {
        tracing::info!("OTLP export enabled");
    }

    let result = match cli.command {
        Some(Commands::Controller) | None => run_controller().await,
    };

    telemetry.shutdown();
    result
}

fn crd_manifest() -> anyhow::Result<String> {
    serde_yaml::to_string(&ReplicationSource::crd())
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))
}

async fn run_controller() -> anyhow::Result<()> {
    tracing::info!("Scribe controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let images = MoverImages::from_env();
    tracing::info!(
        rsync = %images.rsync,
        rclone = %images.rclone,
        restic = %images.restic,
        "mover images"
    );
    let ctx = Arc::new(MoverContext::from_client(client.clone(), images));

    let sources: Api<ReplicationSource> = Api::all(client.clone());
    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let snapshots = VolumeSnapshot::api_resource();

    tracing::info!("- ReplicationSource controller");
    Controller::new(sources, watcher())
        .owns(Api::<Job>::all(client.clone()), watcher())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), watcher())
        .owns(Api::<Secret>::all(client.clone()), watcher())
        .owns(Api::<Service>::all(client.clone()), watcher())
        .owns(Api::<ServiceAccount>::all(client.clone()), watcher())
        .owns_with(
            Api::<DynamicObject>::all_with(client, &snapshots),
            snapshots.clone(),
            watcher(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("ReplicationSource"))
        .await;

    tracing::info!("Scribe controller stopped");
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
