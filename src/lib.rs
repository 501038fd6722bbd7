use std::time::Duration;

use thiserror::Error;

pub mod backoff;
pub mod client;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod kubernetes;
pub mod mysql;
pub mod selection;
pub mod snapshot;
pub mod telemetry;
pub mod test_support;
pub mod transition;
pub mod version;

pub use client::{Connection, Connector, ReplicaRole, SharedConnector, StatusRow, TransitionRow};
pub use cluster::{Cluster, Instance, Role, SharedInstance};
pub use commands::{Command, Controller};
pub use config::{Config, TlsMode};
pub use snapshot::{ClusterSnapshot, InstanceState};

/// Failures that abort a command on their own merit, as opposed to
/// connectivity or protocol errors which travel as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no reachable instance was in role primary")]
    NoPrimary,
    #[error("more than one reachable instance was in role primary: {first} and {second}")]
    AmbiguousPrimary { first: String, second: String },
    #[error("failed to find a reachable standby to promote")]
    NoReachableStandby,
    #[error("cluster {cluster} has {replicas} instance(s); graceful failover needs at least two")]
    TooFewInstances { cluster: String, replicas: usize },
    #[error(
        "invalid min-caughtup-standbys of {requested}: only {replicas} instances are in the cluster, so at most {possible} standbys can ever be caught up"
    )]
    InvalidMinCaughtUp {
        requested: usize,
        replicas: usize,
        possible: usize,
    },
    #[error(
        "could not reach enough standbys to catch up {required}: out of {replicas} instances, {unreachable} were unreachable (for example {example}: {cause})"
    )]
    InsufficientStandbys {
        required: usize,
        replicas: usize,
        unreachable: usize,
        example: String,
        cause: String,
    },
    #[error(
        "version {version} on current primary {instance} does not support dolt_cluster_transition_to_standby"
    )]
    UnsupportedVersion { instance: String, version: String },
    #[error("instance {0} is in detected_broken_config")]
    BrokenConfig(String),
    #[error("no standby was reported as caught up by dolt_cluster_transition_to_standby")]
    NoCaughtUpStandby,
    #[error("did not find an instance for caught up host {0}")]
    CaughtUpHostNotFound(String),
    #[error("result from dolt_assume_cluster_role('{role}', {epoch}) was {status}, not 0")]
    AssumeRoleRejected {
        role: String,
        epoch: u64,
        status: i64,
    },
    #[error("current primary changed from {before} to {after} while restarting standbys")]
    PrimaryChanged { before: String, after: String },
    #[error("instance {instance} did not become ready within {timeout:?}")]
    RestartTimedOut { instance: String, timeout: Duration },
    #[error("command did not complete within {0:?}")]
    DeadlineExceeded(Duration),
}
