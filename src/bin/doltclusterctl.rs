use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dolt_cluster_ctl::config::{Args, Invocation};
use dolt_cluster_ctl::kubernetes::{ApiClient, KubernetesCluster};
use dolt_cluster_ctl::mysql::{Credentials, MySqlConnector};
use dolt_cluster_ctl::{telemetry, ControlError, Controller};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let telemetry = telemetry::init()?;

    let Invocation {
        command,
        statefulset,
        config,
    } = args.into_invocation(Credentials::from_env());
    info!(
        %command,
        namespace = %config.namespace,
        %statefulset,
        "running command"
    );

    let connector = Arc::new(MySqlConnector::new(
        config.tls.clone(),
        config.credentials.clone(),
    ));
    let controller = Controller::new(config.clone(), connector);
    let deadline = controller.deadline();

    let result = async {
        let client = Arc::new(ApiClient::in_cluster()?);
        let cluster = tokio::time::timeout_at(
            deadline,
            KubernetesCluster::load(client, &config.namespace, &statefulset),
        )
        .await
        .map_err(|_| ControlError::DeadlineExceeded(config.timeout))
        .context("timed out loading the statefulset")??;

        controller.run_until(command, &cluster, deadline).await
    }
    .await;

    match &result {
        Ok(()) => info!(%command, "command finished"),
        Err(error) => error!(%command, error = %format!("{error:#}"), "command failed"),
    }
    telemetry.shutdown();
    result
}
