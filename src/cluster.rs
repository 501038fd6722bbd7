use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Routing label in the service registry, not the sql-server's own role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Unknown,
    Primary,
    Standby,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Unknown => "unknown",
            Role::Primary => "primary",
            Role::Standby => "standby",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Instance: Send + Sync + 'static {
    fn name(&self) -> String;

    fn hostname(&self) -> String;

    fn port(&self) -> u16;

    fn role(&self) -> Role;

    async fn mark_role_primary(&self) -> Result<()>;

    async fn mark_role_standby(&self) -> Result<()>;

    async fn mark_role_unknown(&self) -> Result<()>;

    // Unbounded; callers apply their own deadline.
    async fn restart(&self) -> Result<()>;
}

pub type SharedInstance = Arc<dyn Instance>;

/// Instances are identified by index for the duration of one command.
pub trait Cluster: Send + Sync {
    fn name(&self) -> String;

    fn num_replicas(&self) -> usize;

    fn instance(&self, index: usize) -> SharedInstance;
}
