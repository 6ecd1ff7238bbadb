//! Keel operator - reconciles Applications into platform resources

use clap::Parser;
use kube::Client;

use keel_common::telemetry::{init_telemetry, TelemetryConfig};
use keel_operator::cli::{Cli, Commands};
use keel_operator::controller_runner::run_application_controller;
use keel_operator::crds::{application_crd_yaml, ensure_crds};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.command == Some(Commands::Crd) {
        println!("{}", application_crd_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
        default_filter: None,
    })?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    if cli.install_crds {
        ensure_crds(&client).await?;
    }

    let settings = cli.settings();
    tracing::info!(
        system_namespace = %settings.system_namespace,
        identity_config = %settings.identity_config_name,
        ingress_gateway_namespace = %settings.ingress_gateway_namespace,
        step_timeout_secs = settings.step_timeout.as_secs(),
        "Starting Keel controller"
    );

    run_application_controller(client, settings).await;

    tracing::info!("Keel controller shutting down");
    Ok(())
}
