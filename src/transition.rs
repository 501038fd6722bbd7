use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::client::{Connector, ReplicaRole};
use crate::cluster::Instance;
use crate::selection::most_caught_up_standby;
use crate::snapshot::ClusterSnapshot;
use crate::ControlError;

/// Instructs `instance` to take `role` at `epoch`. Any non-zero status from
/// the server is a failure. Catch-up of standbys is not checked.
pub async fn assume_role(
    connector: &dyn Connector,
    instance: &dyn Instance,
    role: ReplicaRole,
    epoch: u64,
) -> Result<()> {
    let mut conn = connector
        .connect(&instance.hostname(), instance.port())
        .await
        .with_context(|| format!("error connecting to {}", instance.name()))?;

    let status = conn
        .assume_cluster_role(&role, epoch)
        .await
        .with_context(|| {
            format!(
                "error calling dolt_assume_cluster_role {role} on {}",
                instance.name()
            )
        })?;
    if status != 0 {
        return Err(ControlError::AssumeRoleRejected {
            role: role.as_str().to_string(),
            epoch,
            status,
        }
        .into());
    }

    info!(instance = %instance.name(), %role, epoch, "assumed cluster role");
    Ok(())
}

/// Moves the primary `instance` to standby at `epoch` once at least
/// `min_caught_up` standbys have caught up on every database, and returns the
/// index in `snapshot` of the standby which was caught up on the most
/// databases.
pub async fn transition_to_standby(
    connector: &dyn Connector,
    instance: &dyn Instance,
    epoch: u64,
    min_caught_up: usize,
    snapshot: &ClusterSnapshot,
) -> Result<usize> {
    let mut conn = connector
        .connect(&instance.hostname(), instance.port())
        .await
        .with_context(|| format!("error connecting to {}", instance.name()))?;

    let rows = conn
        .transition_to_standby(epoch, min_caught_up)
        .await
        .with_context(|| {
            format!(
                "error calling dolt_cluster_transition_to_standby on {}",
                instance.name()
            )
        })?;
    debug!(instance = %instance.name(), rows = rows.len(), "transition to standby reported catch-up");

    let next = most_caught_up_standby(&rows, snapshot.states())?;
    info!(
        instance = %instance.name(),
        epoch,
        next_primary = %snapshot[next].instance.name(),
        "transitioned to standby"
    );
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::client::TransitionRow;
    use crate::snapshot::load_snapshot;
    use crate::test_support::fake::{FakeCluster, FakeFleet};
    use crate::Cluster;

    #[tokio::test]
    async fn assume_role_updates_role_and_epoch() {
        let fleet = FakeFleet::default();
        let cluster = FakeCluster::new(&fleet, "doltdb", 1);
        let instance = cluster.instance(0);

        assume_role(&fleet, instance.as_ref(), ReplicaRole::Primary, 3)
            .await
            .expect("assume primary");

        let server = fleet.server(&cluster.hostname(0));
        assert_eq!(server.role, "primary");
        assert_eq!(server.epoch, 3);
    }

    #[tokio::test]
    async fn non_zero_status_is_rejected() {
        let fleet = FakeFleet::default();
        let cluster = FakeCluster::new(&fleet, "doltdb", 1);
        fleet.update(&cluster.hostname(0), |server| server.assume_status = 1);

        let error = assume_role(&fleet, cluster.instance(0).as_ref(), ReplicaRole::Standby, 2)
            .await
            .expect_err("status 1");
        assert!(matches!(
            error.downcast_ref::<ControlError>(),
            Some(ControlError::AssumeRoleRejected { status: 1, epoch: 2, .. })
        ));
        assert_eq!(fleet.server(&cluster.hostname(0)).epoch, 0);
    }

    #[tokio::test]
    async fn transition_reports_most_caught_up_standby() {
        let fleet = FakeFleet::default();
        let cluster = FakeCluster::new(&fleet, "doltdb", 3);
        let standby_one = cluster.hostname(1);
        let standby_two = cluster.hostname(2);
        fleet.update(&cluster.hostname(0), |server| {
            server.role = "primary".into();
            server.transition_rows = vec![
                TransitionRow {
                    caught_up: false,
                    database: "appdb".into(),
                    remote: "standby".into(),
                    remote_url: format!("http://{standby_one}:50051/appdb"),
                },
                TransitionRow {
                    caught_up: true,
                    database: "appdb".into(),
                    remote: "standby".into(),
                    remote_url: format!("http://{standby_two}:50051/appdb"),
                },
            ];
        });

        let snapshot = load_snapshot(&BackoffPolicy::default(), &fleet, &cluster).await;
        let next = transition_to_standby(&fleet, cluster.instance(0).as_ref(), 5, 1, &snapshot)
            .await
            .expect("transition");
        assert_eq!(next, 2);

        let server = fleet.server(&cluster.hostname(0));
        assert_eq!(server.role, "standby");
        assert_eq!(server.epoch, 5);
    }
}
