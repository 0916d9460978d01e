//! Process supervisor for the update operator.
//!
//! Reads configuration, acquires leadership, then runs the reconciler on a
//! fixed tick until a stop signal arrives. Configuration errors and
//! leadership loss exit non-zero so the orchestrator restarts the process
//! and it re-contends for the lease.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use kube::runtime::events::EventType;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use update_operator::constants;
use update_operator::events::{
    actions, lease_reference, reasons, EventPublisher, KubeEventPublisher,
};
use update_operator::leader_election::LeaderElector;
use update_operator::node_store::{create_client, KubeNodeStore};
use update_operator::operator::{Config as OperatorConfig, Operator, RECONCILIATION_PERIOD};
use update_operator::reboot_window::RebootWindow;

/// Coordinates Flatcar Container Linux reboots across a Kubernetes cluster.
#[derive(Parser, Debug)]
#[command(name = "update-operator", version, about)]
struct Cli {
    /// Path to a kubeconfig; the in-cluster service account is used when
    /// unset
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Annotations that must be "true" before a node may reboot
    #[arg(long = "before-reboot-annotations", value_delimiter = ',')]
    before_reboot_annotations: Vec<String>,

    /// Annotations that must be "true" before a reboot cycle is closed
    #[arg(long = "after-reboot-annotations", value_delimiter = ',')]
    after_reboot_annotations: Vec<String>,

    /// Start of the reboot window in UTC, e.g. "02:00" or "Thu 02:00"
    #[arg(long = "reboot-window-start", requires = "reboot_window_length")]
    reboot_window_start: Option<String>,

    /// Length of the reboot window, e.g. "1h30m"
    #[arg(long = "reboot-window-length", requires = "reboot_window_start")]
    reboot_window_length: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let namespace = env::var("POD_NAMESPACE").context(
        "unable to determine operator namespace: please ensure the POD_NAMESPACE \
         environment variable is set",
    )?;
    let identity = env::var("POD_NAME")
        .or_else(|_| env::var("HOSTNAME"))
        .context("unable to determine identity: neither POD_NAME nor HOSTNAME is set")?;

    let reboot_window = match (&cli.reboot_window_start, &cli.reboot_window_length) {
        (Some(start), Some(length)) => Some(RebootWindow::parse(start, length)?),
        _ => None,
    };

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    let store = Arc::new(KubeNodeStore::new(client.clone()));
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), "update-operator"));

    let operator = Operator::new(
        store,
        events.clone(),
        OperatorConfig {
            before_reboot_annotations: cli.before_reboot_annotations,
            after_reboot_annotations: cli.after_reboot_annotations,
            reboot_window,
            max_rebooting_nodes: 1,
        },
    );

    let elector = Arc::new(LeaderElector::new(
        client,
        constants::LEADER_ELECTION_LEASE_NAME,
        &namespace,
        &identity,
    ));
    let mut guard = elector.acquire().await?;

    let lease_ref = lease_reference(&namespace, constants::LEADER_ELECTION_LEASE_NAME);
    events
        .publish(
            &lease_ref,
            EventType::Normal,
            reasons::LEADER_ELECTED,
            actions::ELECT,
            Some(format!("{identity} became leader")),
        )
        .await;

    info!(identity = %identity, "Starting reconciliation");

    let mut ticker = tokio::time::interval(RECONCILIATION_PERIOD);
    let lost = guard.lost();
    tokio::pin!(lost);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => operator.process(Utc::now()).await,
            _ = &mut lost => {
                events
                    .publish(
                        &lease_ref,
                        EventType::Warning,
                        reasons::LEADERSHIP_LOST,
                        actions::ELECT,
                        Some(format!("{identity} lost the leader lease")),
                    )
                    .await;
                error!(identity = %identity, "Leader election lost, exiting");
                anyhow::bail!("leader election lost");
            }
            _ = &mut shutdown => {
                info!("Stop signal received, shutting down");
                return Ok(());
            }
        }
    }
}

/// Resolve on SIGTERM (sent by the kubelet) or ctrl-c.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
