use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::{ReplicaRole, SharedConnector};
use crate::cluster::{Cluster, Instance, Role, SharedInstance};
use crate::config::Config;
use crate::selection::{pick_next_primary, round_robin_successor};
use crate::snapshot::{load_snapshot, ClusterSnapshot};
use crate::transition::{assume_role, transition_to_standby};
use crate::version::supports_transition_to_standby;
use crate::ControlError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum Command {
    /// Label the instance reporting primary as primary and every other one
    /// standby.
    #[value(name = "applyprimarylabels")]
    ApplyPrimaryLabels,
    /// Hand the primary role from a healthy primary to a standby.
    #[value(name = "gracefulfailover")]
    GracefulFailover,
    /// Promote the best caught up reachable standby.
    #[value(name = "promotestandby")]
    PromoteStandby,
    /// Restart every instance, failing over the primary before its restart.
    #[value(name = "rollingrestart")]
    RollingRestart,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::ApplyPrimaryLabels => "applyprimarylabels",
            Command::GracefulFailover => "gracefulfailover",
            Command::PromoteStandby => "promotestandby",
            Command::RollingRestart => "rollingrestart",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs commands against a cluster. Holds no state between commands.
#[derive(Clone)]
pub struct Controller {
    config: Config,
    connector: SharedConnector,
}

impl Controller {
    pub fn new(config: Config, connector: SharedConnector) -> Self {
        Self { config, connector }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `command` to completion or until the configured timeout, whichever
    /// comes first. Outstanding I/O is dropped on expiry.
    pub async fn run(&self, command: Command, cluster: &dyn Cluster) -> Result<()> {
        self.run_until(command, cluster, self.deadline()).await
    }

    /// The instant a command started now has to finish by.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.config.timeout
    }

    /// Like [`Controller::run`], but bounded by a deadline taken earlier, so
    /// that work done before the command (loading the cluster) counts too.
    pub async fn run_until(&self, command: Command, cluster: &dyn Cluster, deadline: Instant) -> Result<()> {
        let span = info_span!("command", %command, cluster = %cluster.name());
        let work = async {
            match command {
                Command::ApplyPrimaryLabels => self.apply_primary_labels(cluster).await,
                Command::GracefulFailover => self.graceful_failover(cluster).await,
                Command::PromoteStandby => self.promote_standby(cluster).await,
                Command::RollingRestart => self.rolling_restart(cluster).await,
            }
        }
        .instrument(span);

        match timeout_at(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::DeadlineExceeded(self.config.timeout).into()),
        }
    }

    pub async fn apply_primary_labels(&self, cluster: &dyn Cluster) -> Result<()> {
        let snapshot = self.snapshot(cluster).await;
        for (entry, error) in snapshot.failures() {
            warn!(instance = %entry.instance.name(), error = %format!("{error:#}"), "error loading role and epoch");
        }

        let (primary, _) = snapshot
            .current_primary_and_epoch()
            .context("cannot apply primary labels")?;

        for (index, entry) in snapshot.iter().enumerate() {
            let instance = &entry.instance;
            let wanted = if index == primary {
                Role::Primary
            } else {
                Role::Standby
            };
            if instance.role() == wanted {
                continue;
            }
            match wanted {
                Role::Primary => instance.mark_role_primary().await?,
                _ => instance.mark_role_standby().await?,
            }
            info!(instance = %instance.name(), role = %wanted, "applied label");
        }
        Ok(())
    }

    pub async fn graceful_failover(&self, cluster: &dyn Cluster) -> Result<()> {
        let replicas = cluster.num_replicas();
        if replicas < 2 {
            return Err(ControlError::TooFewInstances {
                cluster: cluster.name(),
                replicas,
            }
            .into());
        }
        let min_caught_up = self.config.min_caught_up_standbys;
        if let Some(required) = min_caught_up {
            if required > replicas - 1 {
                return Err(ControlError::InvalidMinCaughtUp {
                    requested: required,
                    replicas,
                    possible: replicas - 1,
                }
                .into());
            }
        }

        let snapshot = self.snapshot(cluster).await;
        let failures: Vec<_> = snapshot.failures().collect();
        match (min_caught_up, failures.first()) {
            (None, Some((_, error))) => {
                // Every standby has to be reachable when nothing is waited on.
                bail!("cannot perform graceful failover: {error:#}");
            }
            (Some(required), Some((entry, error))) => {
                let reachable_standbys = (replicas - 1).saturating_sub(failures.len());
                if reachable_standbys < required {
                    return Err(ControlError::InsufficientStandbys {
                        required,
                        replicas,
                        unreachable: failures.len(),
                        example: entry.instance.name(),
                        cause: format!("{error:#}"),
                    }
                    .into());
                }
            }
            (_, None) => {}
        }

        let (current, highest_epoch) = snapshot
            .current_primary_and_epoch()
            .context("cannot perform graceful failover")?;
        let next_epoch = highest_epoch + 1;
        let old_primary = snapshot[current].instance.clone();

        if min_caught_up.is_some() {
            let version = snapshot[current]
                .db()
                .map(|db| db.version.clone())
                .unwrap_or_default();
            if !supports_transition_to_standby(&version) {
                return Err(ControlError::UnsupportedVersion {
                    instance: old_primary.name(),
                    version,
                }
                .into());
            }
        }

        info!(from = %old_primary.name(), epoch = next_epoch, "failing over");

        for entry in snapshot.iter() {
            entry.instance.mark_role_standby().await?;
        }
        info!("labeled all instances standby");

        let transitioned = match min_caught_up {
            None => assume_role(
                self.connector.as_ref(),
                old_primary.as_ref(),
                ReplicaRole::Standby,
                next_epoch,
            )
            .await
            .map(|()| round_robin_successor(current, replicas)),
            Some(required) => {
                transition_to_standby(
                    self.connector.as_ref(),
                    old_primary.as_ref(),
                    next_epoch,
                    required,
                    &snapshot,
                )
                .await
            }
        };
        let next = match transitioned {
            Ok(next) => next,
            Err(transition_error) => {
                warn!(instance = %old_primary.name(), "failed to transition primary to standby; labeling old primary as primary");
                if let Err(label_error) = old_primary.mark_role_primary().await {
                    error!(
                        instance = %old_primary.name(),
                        error = %format!("{label_error:#}"),
                        "failed to label old primary as primary; the read-write endpoint is broken until applyprimarylabels runs"
                    );
                }
                return Err(transition_error);
            }
        };

        let new_primary = snapshot[next].instance.clone();
        info!(to = %new_primary.name(), "failing over");

        assume_role(
            self.connector.as_ref(),
            new_primary.as_ref(),
            ReplicaRole::Primary,
            next_epoch,
        )
        .await?;
        new_primary.mark_role_primary().await?;
        info!(instance = %new_primary.name(), epoch = next_epoch, "added primary label");
        Ok(())
    }

    pub async fn promote_standby(&self, cluster: &dyn Cluster) -> Result<()> {
        let snapshot = self.snapshot(cluster).await;
        for (entry, error) in snapshot.failures() {
            debug!(instance = %entry.instance.name(), error = %format!("{error:#}"), "ignoring unreachable instance");
        }

        let next = pick_next_primary(snapshot.states()).ok_or(ControlError::NoReachableStandby)?;
        let next_epoch = snapshot.highest_epoch().unwrap_or_default() + 1;
        let new_primary = snapshot[next].instance.clone();
        info!(instance = %new_primary.name(), "found standby to promote");

        for entry in snapshot.iter() {
            entry.instance.mark_role_standby().await?;
        }
        info!("labeled all instances standby");

        assume_role(
            self.connector.as_ref(),
            new_primary.as_ref(),
            ReplicaRole::Primary,
            next_epoch,
        )
        .await?;
        new_primary.mark_role_primary().await?;
        info!(instance = %new_primary.name(), epoch = next_epoch, "applied primary label");
        Ok(())
    }

    pub async fn rolling_restart(&self, cluster: &dyn Cluster) -> Result<()> {
        let snapshot = self.snapshot(cluster).await;
        ensure_restartable(&snapshot)?;
        let (current, _) = snapshot
            .current_primary_and_epoch()
            .context("cannot perform rolling restart")?;
        let old_primary = snapshot[current].instance.clone();

        for index in (0..snapshot.len()).rev() {
            if index == current {
                continue;
            }
            self.restart_instance(&snapshot[index].instance).await?;
        }

        // Standbys came back from a restart; choose from what they report now.
        let refreshed = self.snapshot(cluster).await;
        ensure_restartable(&refreshed)?;
        let (still_current, highest_epoch) = refreshed
            .current_primary_and_epoch()
            .context("cannot perform rolling restart")?;
        if still_current != current {
            return Err(ControlError::PrimaryChanged {
                before: old_primary.name(),
                after: refreshed[still_current].instance.name(),
            }
            .into());
        }
        let next_epoch = highest_epoch + 1;
        let next = pick_next_primary(refreshed.states()).ok_or(ControlError::NoReachableStandby)?;
        let new_primary = refreshed[next].instance.clone();
        info!(instance = %new_primary.name(), "decided next primary");

        old_primary.mark_role_standby().await?;
        info!(instance = %old_primary.name(), "labeled existing primary standby");

        assume_role(
            self.connector.as_ref(),
            old_primary.as_ref(),
            ReplicaRole::Standby,
            next_epoch,
        )
        .await?;
        assume_role(
            self.connector.as_ref(),
            new_primary.as_ref(),
            ReplicaRole::Primary,
            next_epoch,
        )
        .await?;
        new_primary.mark_role_primary().await?;
        info!(instance = %new_primary.name(), epoch = next_epoch, "labeled new primary");

        self.restart_instance(&old_primary).await
    }

    async fn snapshot(&self, cluster: &dyn Cluster) -> ClusterSnapshot {
        load_snapshot(&self.config.snapshot_retry, self.connector.as_ref(), cluster).await
    }

    /// Restarts `instance`, waits for its sql-server to answer and labels it
    /// standby again, all within `wait_for_ready`.
    async fn restart_instance(&self, instance: &SharedInstance) -> Result<()> {
        let deadline = self.config.wait_for_ready;
        info!(instance = %instance.name(), "restarting");
        let restarted = timeout(deadline, async {
            instance
                .restart()
                .await
                .with_context(|| format!("error restarting {}", instance.name()))?;
            self.wait_for_db_ready(instance.as_ref()).await;
            instance.mark_role_standby().await
        })
        .await;
        match restarted {
            Ok(result) => result?,
            Err(_) => {
                return Err(ControlError::RestartTimedOut {
                    instance: instance.name(),
                    timeout: deadline,
                }
                .into())
            }
        }
        info!(instance = %instance.name(), "instance is ready");
        Ok(())
    }

    async fn wait_for_db_ready(&self, instance: &dyn Instance) {
        loop {
            match self
                .connector
                .connect(&instance.hostname(), instance.port())
                .await
            {
                Ok(mut conn) => match conn.ping().await {
                    Ok(()) => return,
                    Err(error) => debug!(instance = %instance.name(), %error, "ping failed"),
                },
                Err(error) => debug!(instance = %instance.name(), %error, "not accepting connections yet"),
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}

fn ensure_restartable(snapshot: &ClusterSnapshot) -> Result<()> {
    if let Some((_, error)) = snapshot.failures().next() {
        bail!("cannot perform rolling restart: {error:#}");
    }
    if let Some(entry) = snapshot
        .iter()
        .find(|entry| entry.is_role(&ReplicaRole::DetectedBrokenConfig))
    {
        return Err(ControlError::BrokenConfig(entry.instance.name()).into());
    }
    Ok(())
}
