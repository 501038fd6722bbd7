use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::backoff::BackoffPolicy;
use crate::commands::Command;
use crate::mysql::Credentials;

/// How connections to the sql-servers are secured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TlsMode {
    #[default]
    Disabled,
    /// TLS with verification against the system roots.
    Verified,
    /// TLS without any verification of the server certificate.
    Insecure,
    /// Verified TLS against the roots in a PEM file.
    Custom { ca: PathBuf },
}

/// Everything a command needs besides the cluster itself.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub namespace: String,
    pub tls: TlsMode,
    /// Deadline for the whole command.
    pub timeout: Duration,
    /// Deadline for one restarted instance to come back and accept queries.
    pub wait_for_ready: Duration,
    /// `None` runs graceful failover without waiting for standbys to catch up.
    pub min_caught_up_standbys: Option<usize>,
    pub snapshot_retry: BackoffPolicy,
    pub credentials: Credentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            tls: TlsMode::Disabled,
            timeout: Duration::from_secs(30),
            wait_for_ready: Duration::from_secs(120),
            min_caught_up_standbys: None,
            snapshot_retry: BackoffPolicy::default(),
            credentials: Credentials::default(),
        }
    }
}

const SUBCOMMANDS: &str = "\
SUBCOMMANDS:
  applyprimarylabels  label the pod that reports primary as primary and the others standby
  gracefulfailover    demote the current primary and promote the next replica in the set
  promotestandby      promote the most caught up reachable standby
  rollingrestart      restart every pod one at a time, failing over the primary before it is restarted";

#[derive(Debug, Parser)]
#[command(name = "doltclusterctl")]
#[command(about = "Operates role changes and restarts for a Dolt sql-server cluster", long_about = None)]
#[command(after_help = SUBCOMMANDS)]
pub struct Args {
    /// Namespace of the StatefulSet to operate on.
    #[arg(short = 'n', long, default_value = "default")]
    pub namespace: String,

    /// Require verified TLS when talking to the sql-servers.
    #[arg(long)]
    pub tls: bool,

    /// Require TLS but do not verify the server certificate.
    #[arg(long, conflicts_with_all = ["tls", "tls_ca", "tls_server_name"])]
    pub tls_insecure: bool,

    /// PEM file with the roots used to verify the server certificate.
    #[arg(long, value_name = "PATH", value_parser = parse_ca_file)]
    pub tls_ca: Option<PathBuf>,

    /// Name to verify the server certificate against. Not supported by the
    /// MySQL driver; always rejected.
    #[arg(long, value_name = "NAME", value_parser = reject_server_name)]
    pub tls_server_name: Option<String>,

    /// Time the entire command has to run before it fails.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Time to wait for a single restarted pod to become ready.
    #[arg(long, default_value = "120s", value_parser = parse_duration)]
    pub wait_for_ready: Duration,

    /// Standbys which must be caught up for a graceful failover to proceed;
    /// -1 does not wait for any.
    #[arg(
        long = "min-caughtup-standbys",
        default_value_t = -1,
        allow_negative_numbers = true,
        value_parser = clap::value_parser!(i64).range(-1..)
    )]
    pub min_caughtup_standbys: i64,

    #[arg(value_enum)]
    pub command: Command,

    /// Name of the StatefulSet.
    pub statefulset: String,
}

/// A fully parsed command line.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub command: Command,
    pub statefulset: String,
    pub config: Config,
}

impl Args {
    pub fn tls_mode(&self) -> TlsMode {
        if self.tls_insecure {
            TlsMode::Insecure
        } else if let Some(ca) = &self.tls_ca {
            TlsMode::Custom { ca: ca.clone() }
        } else if self.tls {
            TlsMode::Verified
        } else {
            TlsMode::Disabled
        }
    }

    pub fn into_invocation(self, credentials: Credentials) -> Invocation {
        let config = Config {
            namespace: self.namespace.clone(),
            tls: self.tls_mode(),
            timeout: self.timeout,
            wait_for_ready: self.wait_for_ready,
            min_caught_up_standbys: usize::try_from(self.min_caughtup_standbys).ok(),
            snapshot_retry: BackoffPolicy::default(),
            credentials,
        };
        Invocation {
            command: self.command,
            statefulset: self.statefulset,
            config,
        }
    }
}

/// Parses durations such as `500ms`, `30s`, `5m`, `1h` or `1m30s`. A bare
/// number is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = 0f64;
    let mut rest = value;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration {value}"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid duration {value}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in duration {value}")),
            unit => return Err(format!("unknown unit {unit} in duration {value}")),
        };
        total += number * scale;
        rest = &rest[unit_len..];
    }
    Duration::try_from_secs_f64(total).map_err(|_| format!("duration {value} out of range"))
}

fn reject_server_name(value: &str) -> Result<String, String> {
    Err(format!(
        "cannot verify certificates against {value}: the server certificate is always \
         checked against the pod hostname; use --tls-ca to supply custom roots"
    ))
}

fn parse_ca_file(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    let pem = std::fs::read_to_string(&path)
        .map_err(|error| format!("failed to read tls-ca {value}: {error}"))?;
    if count_pem_certificates(&pem) == 0 {
        return Err(format!("failed to append PEM from {value}"));
    }
    Ok(path)
}

/// Number of well-formed `CERTIFICATE` blocks in `pem`. Any malformed block
/// makes the whole file count as empty.
fn count_pem_certificates(pem: &str) -> usize {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let mut count = 0;
    let mut rest = pem;
    while let Some(start) = rest.find(BEGIN) {
        let body_start = start + BEGIN.len();
        let Some(body_len) = rest[body_start..].find(END) else {
            return 0;
        };
        let body: String = rest[body_start..body_start + body_len]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let base64 = body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='));
        if body.is_empty() || body.len() % 4 != 0 || !base64 {
            return 0;
        }
        count += 1;
        rest = &rest[body_start + body_len + END.len()..];
    }
    count
}
