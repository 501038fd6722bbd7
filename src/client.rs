use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ReplicaRole {
    Primary,
    Standby,
    DetectedBrokenConfig,
    #[default]
    Unknown,
}

impl ReplicaRole {
    pub fn parse(value: &str) -> Self {
        match value {
            "primary" => ReplicaRole::Primary,
            "standby" => ReplicaRole::Standby,
            "detected_broken_config" => ReplicaRole::DetectedBrokenConfig,
            _ => ReplicaRole::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaRole::Primary => "primary",
            ReplicaRole::Standby => "standby",
            ReplicaRole::DetectedBrokenConfig => "detected_broken_config",
            ReplicaRole::Unknown => "",
        }
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `dolt_cluster_status`: replication state of a single database
/// towards a single standby remote.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct StatusRow {
    pub database: String,
    pub role: String,
    pub epoch: u64,
    pub standby_remote: String,
    pub replication_lag_millis: Option<i64>,
    pub last_update: Option<DateTime<Utc>>,
    pub current_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteUrl {
    pub database: String,
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionRow {
    pub caught_up: bool,
    pub database: String,
    pub remote: String,
    pub remote_url: String,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, hostname: &str, port: u16) -> Result<Box<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send {
    async fn ping(&mut self) -> Result<()>;

    async fn load_role_and_epoch(&mut self) -> Result<(ReplicaRole, u64)>;

    async fn load_version(&mut self) -> Result<String>;

    async fn load_status_rows(&mut self) -> Result<Vec<StatusRow>>;

    async fn load_remote_url(&mut self, database: &str, remote: &str) -> Result<String>;

    /// Returns the status code reported by the server; zero means success.
    async fn assume_cluster_role(&mut self, role: &ReplicaRole, epoch: u64) -> Result<i64>;

    /// Blocks on the server until `min_caught_up` standbys are caught up on
    /// every database, then moves the server to standby at `epoch`.
    async fn transition_to_standby(
        &mut self,
        epoch: u64,
        min_caught_up: usize,
    ) -> Result<Vec<TransitionRow>>;
}

pub type SharedConnector = Arc<dyn Connector>;
