pub mod fake {
    //! Scriptable in-memory stand-ins for a cluster and its sql-servers.
    //!
    //! A `FakeFleet` owns the server side of every instance, keyed by
    //! hostname, and records an ordered event log of everything the control
    //! plane did: label changes, role transitions and restarts.

    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;
    use tokio::time::sleep;

    use crate::client::{Connection, Connector, ReplicaRole, StatusRow, TransitionRow};
    use crate::cluster::{Cluster, Instance, Role, SharedInstance};

    #[derive(Clone, Debug)]
    pub struct FakeServer {
        pub role: String,
        pub epoch: u64,
        pub version: String,
        pub status: Vec<StatusRow>,
        pub remotes: HashMap<(String, String), String>,
        pub reachable: bool,
        /// Number of upcoming connection attempts which fail before the
        /// server answers again.
        pub connect_failures: u32,
        pub assume_status: i64,
        pub fail_assume: bool,
        pub fail_transition: bool,
        pub transition_rows: Vec<TransitionRow>,
    }

    impl Default for FakeServer {
        fn default() -> Self {
            Self {
                role: "standby".into(),
                epoch: 0,
                version: "1.6.0".into(),
                status: Vec::new(),
                remotes: HashMap::new(),
                reachable: true,
                connect_failures: 0,
                assume_status: 0,
                fail_assume: false,
                fail_transition: false,
                transition_rows: Vec::new(),
            }
        }
    }

    #[derive(Default)]
    struct FleetState {
        servers: BTreeMap<String, FakeServer>,
        events: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub struct FakeFleet {
        inner: Arc<Mutex<FleetState>>,
    }

    impl FakeFleet {
        fn with_state<T>(&self, f: impl FnOnce(&mut FleetState) -> T) -> T {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        }

        pub fn add_server(&self, hostname: &str, server: FakeServer) {
            self.with_state(|state| {
                state.servers.insert(hostname.to_string(), server);
            });
        }

        /// Copy of the current server-side state for `hostname`.
        pub fn server(&self, hostname: &str) -> FakeServer {
            self.with_state(|state| state.servers.get(hostname).cloned().unwrap_or_default())
        }

        pub fn update(&self, hostname: &str, f: impl FnOnce(&mut FakeServer)) {
            self.with_state(|state| f(state.servers.entry(hostname.to_string()).or_default()));
        }

        pub fn record(&self, event: impl Into<String>) {
            let event = event.into();
            self.with_state(|state| state.events.push(event));
        }

        pub fn events(&self) -> Vec<String> {
            self.with_state(|state| state.events.clone())
        }

        pub fn events_with_prefix(&self, prefix: &str) -> Vec<String> {
            self.events()
                .into_iter()
                .filter(|event| event.starts_with(prefix))
                .collect()
        }

        fn with_server<T>(
            &self,
            hostname: &str,
            f: impl FnOnce(&mut FakeServer, &mut Vec<String>) -> Result<T>,
        ) -> Result<T> {
            self.with_state(|state| {
                let server = state
                    .servers
                    .get_mut(hostname)
                    .ok_or_else(|| anyhow!("unknown host {hostname}"))?;
                if !server.reachable {
                    bail!("connection refused: {hostname}");
                }
                f(server, &mut state.events)
            })
        }
    }

    #[async_trait]
    impl Connector for FakeFleet {
        async fn connect(&self, hostname: &str, _port: u16) -> Result<Box<dyn Connection>> {
            self.with_server(hostname, |server, _| {
                if server.connect_failures > 0 {
                    server.connect_failures -= 1;
                    bail!("transient connection failure: {hostname}");
                }
                Ok(())
            })?;
            Ok(Box::new(FakeConnection {
                fleet: self.clone(),
                hostname: hostname.to_string(),
            }))
        }
    }

    pub struct FakeConnection {
        fleet: FakeFleet,
        hostname: String,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn ping(&mut self) -> Result<()> {
            self.fleet.with_server(&self.hostname, |_, _| Ok(()))
        }

        async fn load_role_and_epoch(&mut self) -> Result<(ReplicaRole, u64)> {
            self.fleet.with_server(&self.hostname, |server, _| {
                Ok((ReplicaRole::parse(&server.role), server.epoch))
            })
        }

        async fn load_version(&mut self) -> Result<String> {
            self.fleet
                .with_server(&self.hostname, |server, _| Ok(server.version.clone()))
        }

        async fn load_status_rows(&mut self) -> Result<Vec<StatusRow>> {
            self.fleet
                .with_server(&self.hostname, |server, _| Ok(server.status.clone()))
        }

        async fn load_remote_url(&mut self, database: &str, remote: &str) -> Result<String> {
            self.fleet.with_server(&self.hostname, |server, _| {
                server
                    .remotes
                    .get(&(database.to_string(), remote.to_string()))
                    .cloned()
                    .ok_or_else(|| anyhow!("did not find remote {remote} in database {database}"))
            })
        }

        async fn assume_cluster_role(&mut self, role: &ReplicaRole, epoch: u64) -> Result<i64> {
            let hostname = self.hostname.clone();
            self.fleet.with_server(&self.hostname, |server, events| {
                if server.fail_assume {
                    bail!("lost connection to {hostname} during dolt_assume_cluster_role");
                }
                if server.assume_status != 0 {
                    return Ok(server.assume_status);
                }
                if epoch < server.epoch {
                    bail!("epoch {epoch} is older than current epoch {}", server.epoch);
                }
                server.role = role.as_str().to_string();
                server.epoch = epoch;
                events.push(format!("assume:{hostname}:{role}:{epoch}"));
                Ok(0)
            })
        }

        async fn transition_to_standby(
            &mut self,
            epoch: u64,
            min_caught_up: usize,
        ) -> Result<Vec<TransitionRow>> {
            let hostname = self.hostname.clone();
            self.fleet.with_server(&self.hostname, |server, events| {
                if server.fail_transition {
                    bail!("failed to catch up {min_caught_up} standbys");
                }
                server.role = ReplicaRole::Standby.as_str().to_string();
                server.epoch = epoch;
                events.push(format!("transition:{hostname}:{epoch}:{min_caught_up}"));
                Ok(server.transition_rows.clone())
            })
        }
    }

    type RestartHook = Box<dyn Fn(&FakeFleet) + Send + Sync>;

    pub struct FakeInstance {
        name: String,
        hostname: String,
        fleet: FakeFleet,
        label: Mutex<Role>,
        label_updates: AtomicUsize,
        fail_restart: Mutex<bool>,
        down_after_restart: Mutex<bool>,
        fail_label: Mutex<Option<Role>>,
        label_delay: Mutex<Duration>,
        restart_hook: Mutex<Option<RestartHook>>,
    }

    impl FakeInstance {
        pub fn new(name: &str, hostname: &str, fleet: &FakeFleet) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                hostname: hostname.to_string(),
                fleet: fleet.clone(),
                label: Mutex::new(Role::Unknown),
                label_updates: AtomicUsize::new(0),
                fail_restart: Mutex::new(false),
                down_after_restart: Mutex::new(false),
                fail_label: Mutex::new(None),
                label_delay: Mutex::new(Duration::ZERO),
                restart_hook: Mutex::new(None),
            })
        }

        /// An instance with no server behind it, for pure selection logic.
        pub fn detached(name: &str) -> Arc<Self> {
            Self::with_hostname(name, name)
        }

        pub fn with_hostname(name: &str, hostname: &str) -> Arc<Self> {
            Self::new(name, hostname, &FakeFleet::default())
        }

        /// Number of label mutations requested, including no-op ones.
        pub fn label_updates(&self) -> usize {
            self.label_updates.load(Ordering::SeqCst)
        }

        pub fn set_label(&self, role: Role) {
            *self.label.lock().unwrap_or_else(PoisonError::into_inner) = role;
        }

        pub fn fail_restarts(&self) {
            *self.fail_restart.lock().unwrap_or_else(PoisonError::into_inner) = true;
        }

        /// The server stops answering once the instance has been restarted.
        pub fn stay_down_after_restart(&self) {
            *self.down_after_restart.lock().unwrap_or_else(PoisonError::into_inner) = true;
        }

        /// Makes every attempt to apply `role` as a label fail.
        pub fn fail_label(&self, role: Role) {
            *self.fail_label.lock().unwrap_or_else(PoisonError::into_inner) = Some(role);
        }

        /// Every label mutation waits `delay` before it is applied.
        pub fn delay_labels(&self, delay: Duration) {
            *self.label_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
        }

        /// Runs `hook` against the fleet each time this instance restarts,
        /// after the pod is recreated and before it is polled for readiness.
        pub fn on_restart(&self, hook: impl Fn(&FakeFleet) + Send + Sync + 'static) {
            *self.restart_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
        }

        async fn apply_label(&self, role: Role) -> Result<()> {
            let delay = *self.label_delay.lock().unwrap_or_else(PoisonError::into_inner);
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let failing = *self.fail_label.lock().unwrap_or_else(PoisonError::into_inner);
            if failing == Some(role) {
                bail!("registry rejected {role} label on {}", self.name);
            }
            self.label_updates.fetch_add(1, Ordering::SeqCst);
            let mut label = self.label.lock().unwrap_or_else(PoisonError::into_inner);
            if *label != role {
                *label = role;
                self.fleet.record(format!("label:{}:{role}", self.name));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Instance for FakeInstance {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn hostname(&self) -> String {
            self.hostname.clone()
        }

        fn port(&self) -> u16 {
            3306
        }

        fn role(&self) -> Role {
            *self.label.lock().unwrap_or_else(PoisonError::into_inner)
        }

        async fn mark_role_primary(&self) -> Result<()> {
            self.apply_label(Role::Primary).await
        }

        async fn mark_role_standby(&self) -> Result<()> {
            self.apply_label(Role::Standby).await
        }

        async fn mark_role_unknown(&self) -> Result<()> {
            self.apply_label(Role::Unknown).await
        }

        async fn restart(&self) -> Result<()> {
            if *self.fail_restart.lock().unwrap_or_else(PoisonError::into_inner) {
                bail!("pod {} was not recreated", self.name);
            }
            // A recreated pod comes back without the routing label.
            *self.label.lock().unwrap_or_else(PoisonError::into_inner) = Role::Unknown;
            self.fleet.record(format!("restart:{}", self.name));
            if let Some(hook) = &*self.restart_hook.lock().unwrap_or_else(PoisonError::into_inner) {
                hook(&self.fleet);
            }
            if *self.down_after_restart.lock().unwrap_or_else(PoisonError::into_inner) {
                self.fleet.update(&self.hostname, |server| server.reachable = false);
            }
            Ok(())
        }
    }

    /// A StatefulSet-like cluster named `name` in namespace `default`, with
    /// one standby server at epoch 0 per replica.
    pub struct FakeCluster {
        name: String,
        instances: Vec<Arc<FakeInstance>>,
    }

    impl FakeCluster {
        pub fn new(fleet: &FakeFleet, name: &str, replicas: usize) -> Self {
            let instances = (0..replicas)
                .map(|i| {
                    let pod = format!("{name}-{i}");
                    let hostname = format!("{pod}.{name}.default");
                    fleet.add_server(&hostname, FakeServer::default());
                    FakeInstance::new(&format!("default/{pod}"), &hostname, fleet)
                })
                .collect();
            Self {
                name: format!("default/{name}"),
                instances,
            }
        }

        pub fn fake(&self, index: usize) -> Arc<FakeInstance> {
            self.instances[index].clone()
        }

        pub fn hostname(&self, index: usize) -> String {
            self.instances[index].hostname()
        }

        pub fn instance_name(&self, index: usize) -> String {
            self.instances[index].name()
        }

        /// Current routing labels, by index.
        pub fn labels(&self) -> Vec<Role> {
            self.instances.iter().map(|instance| instance.role()).collect()
        }
    }

    impl Cluster for FakeCluster {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn num_replicas(&self) -> usize {
            self.instances.len()
        }

        fn instance(&self, index: usize) -> SharedInstance {
            self.instances[index].clone()
        }
    }
}
