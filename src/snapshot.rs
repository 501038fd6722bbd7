use std::collections::BTreeSet;
use std::ops::Index;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tracing::{debug, info_span, warn, Instrument};

use crate::backoff::BackoffPolicy;
use crate::client::{Connector, RemoteUrl, ReplicaRole, StatusRow};
use crate::cluster::{Cluster, SharedInstance};
use crate::ControlError;

/// Replication state read from one reachable instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DbState {
    pub role: ReplicaRole,
    pub epoch: u64,
    pub status: Vec<StatusRow>,
    pub remotes: Vec<RemoteUrl>,
    pub version: String,
}

pub type SnapshotError = Arc<anyhow::Error>;

/// One entry of a snapshot: the instance together with either its state or
/// the error which prevented reading it.
#[derive(Clone)]
pub struct InstanceState {
    pub instance: SharedInstance,
    pub state: Result<DbState, SnapshotError>,
}

impl InstanceState {
    pub fn reachable(instance: SharedInstance, state: DbState) -> Self {
        Self {
            instance,
            state: Ok(state),
        }
    }

    pub fn unreachable(instance: SharedInstance, error: anyhow::Error) -> Self {
        Self {
            instance,
            state: Err(Arc::new(error)),
        }
    }

    pub fn db(&self) -> Option<&DbState> {
        self.state.as_ref().ok()
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.state.as_ref().err().map(|error| error.as_ref())
    }

    pub fn is_role(&self, role: &ReplicaRole) -> bool {
        self.db().is_some_and(|db| &db.role == role)
    }
}

/// Point-in-time, possibly partial view of a cluster, ordered by instance
/// index.
#[derive(Clone, Default)]
pub struct ClusterSnapshot {
    states: Vec<InstanceState>,
}

impl ClusterSnapshot {
    pub fn new(states: Vec<InstanceState>) -> Self {
        Self { states }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[InstanceState] {
        &self.states
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceState> {
        self.states.iter()
    }

    /// Entries whose state could not be loaded, in index order.
    pub fn failures(&self) -> impl Iterator<Item = (&InstanceState, &anyhow::Error)> {
        self.states
            .iter()
            .filter_map(|entry| entry.error().map(|error| (entry, error)))
    }

    /// Highest epoch over the entries that reported one.
    pub fn highest_epoch(&self) -> Option<u64> {
        self.states
            .iter()
            .filter_map(|entry| entry.db().map(|db| db.epoch))
            .max()
    }

    /// The index of the unique reachable primary together with the highest
    /// epoch observed anywhere in the snapshot.
    pub fn current_primary_and_epoch(&self) -> Result<(usize, u64), ControlError> {
        current_primary_and_epoch(&self.states)
    }
}

impl Index<usize> for ClusterSnapshot {
    type Output = InstanceState;

    fn index(&self, index: usize) -> &Self::Output {
        &self.states[index]
    }
}

pub fn current_primary_and_epoch(states: &[InstanceState]) -> Result<(usize, u64), ControlError> {
    let mut highest_epoch = 0;
    let mut primary: Option<usize> = None;
    for (index, entry) in states.iter().enumerate() {
        let Some(db) = entry.db() else {
            continue;
        };
        if db.role == ReplicaRole::Primary {
            if let Some(existing) = primary {
                return Err(ControlError::AmbiguousPrimary {
                    first: states[existing].instance.name(),
                    second: entry.instance.name(),
                });
            }
            primary = Some(index);
        }
        highest_epoch = highest_epoch.max(db.epoch);
    }
    primary
        .map(|index| (index, highest_epoch))
        .ok_or(ControlError::NoPrimary)
}

/// Reads every instance of `cluster` concurrently. Each instance is retried as
/// a unit under `policy`; a persistent failure is recorded on that entry only.
pub async fn load_snapshot(
    policy: &BackoffPolicy,
    connector: &dyn Connector,
    cluster: &dyn Cluster,
) -> ClusterSnapshot {
    let loads = (0..cluster.num_replicas()).map(|index| {
        let instance = cluster.instance(index);
        let span = info_span!("snapshot.instance", index, instance = %instance.name());
        load_instance_state(policy, connector, instance).instrument(span)
    });
    ClusterSnapshot::new(join_all(loads).await)
}

pub async fn load_instance_state(
    policy: &BackoffPolicy,
    connector: &dyn Connector,
    instance: SharedInstance,
) -> InstanceState {
    let result = policy
        .retry(|| fetch_db_state(connector, instance.clone()))
        .await
        .with_context(|| format!("error loading role and epoch for {}", instance.name()));
    match result {
        Ok(state) => {
            debug!(role = %state.role, epoch = state.epoch, version = %state.version, "loaded instance state");
            InstanceState::reachable(instance, state)
        }
        Err(error) => {
            warn!(error = %format!("{error:#}"), "instance state unavailable");
            InstanceState::unreachable(instance, error)
        }
    }
}

async fn fetch_db_state(connector: &dyn Connector, instance: SharedInstance) -> Result<DbState> {
    let mut conn = connector
        .connect(&instance.hostname(), instance.port())
        .await?;

    let (role, epoch) = conn.load_role_and_epoch().await?;
    let version = conn
        .load_version()
        .await
        .context("error loading dolt_version")?;
    let status = conn
        .load_status_rows()
        .await
        .context("error loading dolt_cluster_status")?;

    let pairs: BTreeSet<(&str, &str)> = status
        .iter()
        .map(|row| (row.database.as_str(), row.standby_remote.as_str()))
        .collect();
    let mut remotes = Vec::with_capacity(pairs.len());
    for (database, remote) in pairs {
        let url = conn.load_remote_url(database, remote).await.with_context(|| {
            format!("error loading remote url for database {database}, remote {remote}")
        })?;
        remotes.push(RemoteUrl {
            database: database.to_string(),
            name: remote.to_string(),
            url,
        });
    }

    Ok(DbState {
        role,
        epoch,
        status,
        remotes,
        version,
    })
}
