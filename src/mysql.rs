use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow, MySqlSslMode};
use sqlx::{ConnectOptions, Row};
use tracing::debug;

use crate::client::{Connection, Connector, ReplicaRole, StatusRow, TransitionRow};
use crate::config::TlsMode;

const CLUSTER_DATABASE: &str = "dolt_cluster";

/// Account used against every sql-server in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "root".into(),
            password: None,
        }
    }
}

impl Credentials {
    /// `DOLT_USERNAME` (default `root`) and `DOLT_PASSWORD`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());
        Self {
            username: non_empty("DOLT_USERNAME").unwrap_or_else(|| "root".into()),
            password: non_empty("DOLT_PASSWORD"),
        }
    }
}

pub fn ssl_mode(tls: &TlsMode) -> MySqlSslMode {
    match tls {
        TlsMode::Disabled => MySqlSslMode::Disabled,
        TlsMode::Insecure => MySqlSslMode::Required,
        TlsMode::Verified | TlsMode::Custom { .. } => MySqlSslMode::VerifyIdentity,
    }
}

/// Opens one MySQL-protocol connection per call to the `dolt_cluster`
/// database of an instance.
#[derive(Clone, Debug)]
pub struct MySqlConnector {
    tls: TlsMode,
    credentials: Credentials,
}

impl MySqlConnector {
    pub fn new(tls: TlsMode, credentials: Credentials) -> Self {
        Self { tls, credentials }
    }

    pub fn connect_options(&self, hostname: &str, port: u16) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(hostname)
            .port(port)
            .username(&self.credentials.username)
            .database(CLUSTER_DATABASE)
            .ssl_mode(ssl_mode(&self.tls));
        if let Some(password) = &self.credentials.password {
            options = options.password(password);
        }
        if let TlsMode::Custom { ca } = &self.tls {
            options = options.ssl_ca(ca);
        }
        options.disable_statement_logging()
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, hostname: &str, port: u16) -> Result<Box<dyn Connection>> {
        let conn = self
            .connect_options(hostname, port)
            .connect()
            .await
            .with_context(|| format!("failed to connect to {hostname}:{port}"))?;
        debug!(hostname, port, "connected to sql-server");
        Ok(Box::new(MySqlInstanceConnection { conn }))
    }
}

pub struct MySqlInstanceConnection {
    conn: MySqlConnection,
}

#[async_trait]
impl Connection for MySqlInstanceConnection {
    async fn ping(&mut self) -> Result<()> {
        sqlx::Connection::ping(&mut self.conn).await?;
        Ok(())
    }

    async fn load_role_and_epoch(&mut self) -> Result<(ReplicaRole, u64)> {
        let row = sqlx::query("SELECT @@global.dolt_cluster_role, @@global.dolt_cluster_role_epoch")
            .fetch_optional(&mut self.conn)
            .await?
            .ok_or_else(|| anyhow!("no rows in dolt_cluster_role query"))?;
        let role = text_column(&row, 0)?.unwrap_or_default();
        let epoch = int_column(&row, 1)?.unwrap_or_default();
        Ok((ReplicaRole::parse(&role), u64::try_from(epoch)?))
    }

    async fn load_version(&mut self) -> Result<String> {
        let row = sqlx::query("SELECT dolt_version()")
            .fetch_optional(&mut self.conn)
            .await?
            .ok_or_else(|| anyhow!("no rows in dolt_version query"))?;
        Ok(text_column(&row, 0)?.unwrap_or_default())
    }

    async fn load_status_rows(&mut self) -> Result<Vec<StatusRow>> {
        let rows = sqlx::query(
            "SELECT `database`, role, epoch, standby_remote, replication_lag_millis, last_update, current_error \
             FROM dolt_cluster.dolt_cluster_status",
        )
        .fetch_all(&mut self.conn)
        .await?;

        let mut status = Vec::with_capacity(rows.len());
        for row in rows {
            status.push(StatusRow {
                database: text_column(&row, 0)?.unwrap_or_default(),
                role: text_column(&row, 1)?.unwrap_or_default(),
                epoch: u64::try_from(int_column(&row, 2)?.unwrap_or_default())?,
                standby_remote: text_column(&row, 3)?.unwrap_or_default(),
                replication_lag_millis: int_column(&row, 4)?,
                last_update: timestamp_column(&row, 5)?,
                current_error: text_column(&row, 6)?,
            });
        }
        Ok(status)
    }

    async fn load_remote_url(&mut self, database: &str, remote: &str) -> Result<String> {
        let query = format!(
            "SELECT url FROM {}.dolt_remotes WHERE name = ?",
            quote_identifier(database)
        );
        let rows = sqlx::query(&query)
            .bind(remote)
            .fetch_all(&mut self.conn)
            .await?;
        match rows.as_slice() {
            [row] => Ok(text_column(row, 0)?.unwrap_or_default()),
            [] => bail!("did not find remote {remote} in database {database}"),
            _ => bail!("found more than one remote named {remote} in database {database}"),
        }
    }

    async fn assume_cluster_role(&mut self, role: &ReplicaRole, epoch: u64) -> Result<i64> {
        let row = sqlx::query("CALL DOLT_ASSUME_CLUSTER_ROLE(?, ?)")
            .bind(role.as_str())
            .bind(epoch)
            .fetch_optional(&mut self.conn)
            .await?;
        match row {
            Some(row) => Ok(int_column(&row, 0)?.unwrap_or_default()),
            None => Ok(0),
        }
    }

    async fn transition_to_standby(
        &mut self,
        epoch: u64,
        min_caught_up: usize,
    ) -> Result<Vec<TransitionRow>> {
        let rows = sqlx::query("CALL DOLT_CLUSTER_TRANSITION_TO_STANDBY(?, ?)")
            .bind(epoch)
            .bind(u64::try_from(min_caught_up)?)
            .fetch_all(&mut self.conn)
            .await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(TransitionRow {
                caught_up: int_column(&row, 0)?.unwrap_or_default() != 0,
                database: text_column(&row, 1)?.unwrap_or_default(),
                remote: text_column(&row, 2)?.unwrap_or_default(),
                remote_url: text_column(&row, 3)?.unwrap_or_default(),
            });
        }
        Ok(results)
    }
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

// Dolt reports several integer columns and system variables with varying
// signedness or as text depending on the server version.
fn int_column(row: &MySqlRow, index: usize) -> Result<Option<i64>> {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value);
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return value.map(i64::try_from).transpose().map_err(Into::into);
    }
    let text: Option<String> = row
        .try_get(index)
        .with_context(|| format!("column {index} is not an integer"))?;
    text.map(|text| {
        text.trim()
            .parse::<i64>()
            .with_context(|| format!("column {index} is not an integer: {text}"))
    })
    .transpose()
}

fn text_column(row: &MySqlRow, index: usize) -> Result<Option<String>> {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return Ok(value);
    }
    let bytes: Option<Vec<u8>> = row
        .try_get(index)
        .with_context(|| format!("column {index} is not text"))?;
    Ok(bytes.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

fn timestamp_column(row: &MySqlRow, index: usize) -> Result<Option<DateTime<Utc>>> {
    if let Ok(value) = row.try_get::<Option<DateTime<Utc>>, _>(index) {
        return Ok(value);
    }
    let naive: Option<NaiveDateTime> = row
        .try_get(index)
        .with_context(|| format!("column {index} is not a timestamp"))?;
    Ok(naive.map(|naive| naive.and_utc()))
}
