//! `Cluster` backed by a Kubernetes StatefulSet.
//!
//! Talks to the API server directly over HTTPS with the pod's service account.
//! Routing is done with the `dolthub.com/cluster_role` pod label, which the
//! `-rw` and `-ro` Services select on.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::cluster::{Cluster, Instance, Role, SharedInstance};

pub const ROLE_LABEL: &str = "dolthub.com/cluster_role";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const DEFAULT_PORT: u16 = 3306;
const POD_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub deletion_timestamp: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StatefulSet {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: StatefulSetSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatefulSetSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PodTemplateSpec {
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default)]
    pub name: Option<String>,
    pub container_port: u16,
}

impl StatefulSet {
    /// `spec.replicas`, which the API server defaults to one.
    pub fn replicas(&self) -> usize {
        self.spec
            .replicas
            .map_or(1, |replicas| usize::try_from(replicas).unwrap_or(0))
    }

    /// The `dolt` port of the `dolt` container.
    pub fn dolt_port(&self) -> u16 {
        self.spec
            .template
            .spec
            .containers
            .iter()
            .filter(|container| container.name == "dolt")
            .flat_map(|container| container.ports.iter())
            .find(|port| port.name.as_deref() == Some("dolt"))
            .map_or(DEFAULT_PORT, |port| port.container_port)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContainerStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}

impl Pod {
    pub fn role(&self) -> Role {
        match self.metadata.labels.get(ROLE_LABEL).map(String::as_str) {
            Some("primary") => Role::Primary,
            Some("standby") => Role::Standby,
            _ => Role::Unknown,
        }
    }

    /// Whether the pod already carries the label for `role`. Any value,
    /// recognised or not, has to be removed before it counts as unknown.
    pub fn has_role_label(&self, role: Role) -> bool {
        match role {
            Role::Unknown => !self.metadata.labels.contains_key(ROLE_LABEL),
            role => self.role() == role,
        }
    }

    /// Running, not being deleted and every container reports ready.
    pub fn is_ready(&self) -> bool {
        self.metadata.deletion_timestamp.is_none()
            && !self.status.container_statuses.is_empty()
            && self.status.container_statuses.iter().all(|status| status.ready)
    }
}

/// JSON merge patch which sets the routing label, or removes it for
/// `Role::Unknown`.
pub fn role_label_patch(role: Role) -> Value {
    let value = match role {
        Role::Unknown => Value::Null,
        role => Value::String(role.as_str().to_string()),
    };
    json!({ "metadata": { "labels": { ROLE_LABEL: value } } })
}

/// Minimal Kubernetes REST client.
pub struct ApiClient {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(http: Client, base: Url, token: Option<String>) -> Self {
        Self { http, base, token }
    }

    /// Client for the API server this pod runs under, authenticated with the
    /// mounted service account.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set; not running inside a cluster")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let base = Url::parse(&format!("https://{host}:{port}"))
            .with_context(|| format!("invalid api server address {host}:{port}"))?;

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .context("failed to read service account token")?;
        let ca = std::fs::read(dir.join("ca.crt")).context("failed to read service account ca")?;
        let http = Client::builder()
            .add_root_certificate(Certificate::from_pem(&ca)?)
            .build()
            .context("failed to build kubernetes http client")?;
        Ok(Self::new(http, base, Some(token.trim().to_string())))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = self
            .base
            .join(path)
            .with_context(|| format!("invalid api path {path}"))?;
        let builder = self.http.request(method, url);
        Ok(match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| anyhow!("{path} not found"))
    }

    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.request(reqwest::Method::GET, path)?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(checked(response).await?.json().await?))
    }

    pub async fn merge_patch<T: DeserializeOwned>(&self, path: &str, patch: &Value) -> Result<T> {
        let response = self
            .request(reqwest::Method::PATCH, path)?
            .header(CONTENT_TYPE, "application/merge-patch+json")
            .body(serde_json::to_vec(patch)?)
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self.request(reqwest::Method::DELETE, path)?.send().await?;
        checked(response).await?;
        Ok(())
    }
}

async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.text().await.unwrap_or_default();
    bail!("{url} returned {status}: {}", body.trim())
}

fn pod_path(namespace: &str, name: &str) -> String {
    format!("/api/v1/namespaces/{namespace}/pods/{name}")
}

pub struct KubernetesCluster {
    name: String,
    instances: Vec<Arc<KubernetesInstance>>,
}

impl KubernetesCluster {
    /// Loads the StatefulSet `namespace/name` and each of its pods.
    pub async fn load(client: Arc<ApiClient>, namespace: &str, name: &str) -> Result<Self> {
        let statefulset: StatefulSet = client
            .get(&format!("/apis/apps/v1/namespaces/{namespace}/statefulsets/{name}"))
            .await
            .with_context(|| format!("error loading StatefulSet {namespace}/{name}"))?;
        let port = statefulset.dolt_port();
        let service = statefulset.spec.service_name.clone();

        let mut instances = Vec::with_capacity(statefulset.replicas());
        for ordinal in 0..statefulset.replicas() {
            let pod_name = format!("{name}-{ordinal}");
            let pod: Pod = client
                .get(&pod_path(namespace, &pod_name))
                .await
                .with_context(|| {
                    format!("error loading Pod {namespace}/{pod_name} for StatefulSet {namespace}/{name}")
                })?;
            instances.push(Arc::new(KubernetesInstance {
                client: client.clone(),
                namespace: namespace.to_string(),
                hostname: format!("{pod_name}.{service}.{namespace}"),
                pod_name,
                port,
                pod: RwLock::new(pod),
            }));
        }
        debug!(statefulset = %name, replicas = instances.len(), port, "loaded statefulset");

        Ok(Self {
            name: format!("{namespace}/{name}"),
            instances,
        })
    }
}

impl Cluster for KubernetesCluster {
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

pub struct KubernetesInstance {
    client: Arc<ApiClient>,
    namespace: String,
    pod_name: String,
    hostname: String,
    port: u16,
    pod: RwLock<Pod>,
}

impl KubernetesInstance {
    fn cached(&self) -> Pod {
        self.pod
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, pod: Pod) {
        *self.pod.write().unwrap_or_else(PoisonError::into_inner) = pod;
    }

    async fn set_role_label(&self, role: Role) -> Result<()> {
        if self.cached().has_role_label(role) {
            return Ok(());
        }
        let pod: Pod = self
            .client
            .merge_patch(&pod_path(&self.namespace, &self.pod_name), &role_label_patch(role))
            .await
            .with_context(|| {
                format!("error updating pod {} to set {ROLE_LABEL}={role}", self.name())
            })?;
        self.store(pod);
        Ok(())
    }
}

#[async_trait]
impl Instance for KubernetesInstance {
    fn name(&self) -> String {
        format!("{}/{}", self.namespace, self.pod_name)
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn role(&self) -> Role {
        self.pod
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .role()
    }

    async fn mark_role_primary(&self) -> Result<()> {
        self.set_role_label(Role::Primary).await
    }

    async fn mark_role_standby(&self) -> Result<()> {
        self.set_role_label(Role::Standby).await
    }

    async fn mark_role_unknown(&self) -> Result<()> {
        self.set_role_label(Role::Unknown).await
    }

    async fn restart(&self) -> Result<()> {
        let path = pod_path(&self.namespace, &self.pod_name);
        let old_uid = self.cached().metadata.uid;

        info!(instance = %self.name(), "deleting pod");
        self.client
            .delete(&path)
            .await
            .with_context(|| format!("error deleting pod {}", self.name()))?;

        loop {
            sleep(POD_POLL_INTERVAL).await;
            let pod: Option<Pod> = match self.client.get_optional(&path).await {
                Ok(pod) => pod,
                Err(error) => {
                    debug!(instance = %self.name(), error = %format!("{error:#}"), "polling pod failed");
                    continue;
                }
            };
            let Some(pod) = pod else {
                continue;
            };
            if pod.metadata.uid != old_uid && pod.is_ready() {
                info!(instance = %self.name(), uid = %pod.metadata.uid, "pod recreated and ready");
                self.store(pod);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statefulset(value: Value) -> StatefulSet {
        serde_json::from_value(value).expect("statefulset json")
    }

    fn pod(value: Value) -> Pod {
        serde_json::from_value(value).expect("pod json")
    }

    #[test]
    fn reads_replicas_service_and_port() {
        let set = statefulset(json!({
            "metadata": { "name": "doltdb", "namespace": "dolt" },
            "spec": {
                "replicas": 3,
                "serviceName": "doltdb-internal",
                "template": { "spec": { "containers": [
                    { "name": "sidecar", "ports": [{ "name": "dolt", "containerPort": 9000 }] },
                    { "name": "dolt", "ports": [
                        { "name": "remotesapi", "containerPort": 50051 },
                        { "name": "dolt", "containerPort": 13306 }
                    ] }
                ] } }
            }
        }));
        assert_eq!(set.replicas(), 3);
        assert_eq!(set.spec.service_name, "doltdb-internal");
        assert_eq!(set.dolt_port(), 13306);
    }

    #[test]
    fn defaults_replicas_and_port() {
        let set = statefulset(json!({
            "metadata": { "name": "doltdb" },
            "spec": { "serviceName": "doltdb", "template": { "spec": { "containers": [{ "name": "dolt" }] } } }
        }));
        assert_eq!(set.replicas(), 1);
        assert_eq!(set.dolt_port(), DEFAULT_PORT);
    }

    #[test]
    fn role_comes_from_label() {
        let labeled = |value: &str| {
            pod(json!({ "metadata": { "name": "doltdb-0", "labels": { ROLE_LABEL: value } } }))
        };
        assert_eq!(labeled("primary").role(), Role::Primary);
        assert_eq!(labeled("standby").role(), Role::Standby);
        assert_eq!(labeled("something-else").role(), Role::Unknown);
        assert_eq!(pod(json!({ "metadata": { "name": "doltdb-0" } })).role(), Role::Unknown);
    }

    #[test]
    fn unrecognised_role_label_still_needs_removal() {
        let stray = pod(json!({ "metadata": { "name": "doltdb-0", "labels": { ROLE_LABEL: "leader" } } }));
        assert_eq!(stray.role(), Role::Unknown);
        assert!(!stray.has_role_label(Role::Unknown));
        assert!(!stray.has_role_label(Role::Standby));

        let unlabeled = pod(json!({ "metadata": { "name": "doltdb-0" } }));
        assert!(unlabeled.has_role_label(Role::Unknown));

        let primary = pod(json!({ "metadata": { "name": "doltdb-0", "labels": { ROLE_LABEL: "primary" } } }));
        assert!(primary.has_role_label(Role::Primary));
        assert!(!primary.has_role_label(Role::Unknown));
    }

    #[test]
    fn readiness_requires_every_container() {
        let ready = pod(json!({
            "metadata": { "name": "doltdb-0", "uid": "b" },
            "status": { "containerStatuses": [
                { "name": "dolt", "ready": true },
                { "name": "exporter", "ready": true }
            ] }
        }));
        assert!(ready.is_ready());

        let partial = pod(json!({
            "metadata": { "name": "doltdb-0" },
            "status": { "containerStatuses": [
                { "name": "dolt", "ready": true },
                { "name": "exporter", "ready": false }
            ] }
        }));
        assert!(!partial.is_ready());

        let pending = pod(json!({ "metadata": { "name": "doltdb-0" }, "status": {} }));
        assert!(!pending.is_ready());

        let terminating = pod(json!({
            "metadata": { "name": "doltdb-0", "deletionTimestamp": "2024-01-01T00:00:00Z" },
            "status": { "containerStatuses": [{ "name": "dolt", "ready": true }] }
        }));
        assert!(!terminating.is_ready());
    }

    #[test]
    fn label_patches() {
        assert_eq!(
            role_label_patch(Role::Primary),
            json!({ "metadata": { "labels": { "dolthub.com/cluster_role": "primary" } } })
        );
        assert_eq!(
            role_label_patch(Role::Standby),
            json!({ "metadata": { "labels": { "dolthub.com/cluster_role": "standby" } } })
        );
        assert_eq!(
            role_label_patch(Role::Unknown),
            json!({ "metadata": { "labels": { "dolthub.com/cluster_role": null } } })
        );
    }

    #[test]
    fn pod_paths() {
        assert_eq!(pod_path("dolt", "doltdb-1"), "/api/v1/namespaces/dolt/pods/doltdb-1");
    }
}
