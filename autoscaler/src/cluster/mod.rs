use std::{collections::HashMap, env, fs};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{header, Certificate};
use resources::objects::{
    metrics::{
        CrossVersionObjectReference, ExternalMetricValueList, MetricValue, PodMetricsList,
        MetricValueList,
    },
    pod::Pod,
    selector::Selector,
    target::{Scale, Target, TargetRef},
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value as JsonValue};

pub mod metrics;

const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
/// Development override; in-cluster detection wins when both are set.
const API_SERVER_ENV: &str = "KUBE_API_SERVER";
const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Everything the pipeline needs from the cluster. The control loop,
/// gatherer, evaluator and REST API all go through this seam.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch the scale target itself.
    async fn get_target(&self, target: &TargetRef, namespace: &str) -> Result<Target>;
    /// Fetch the target's `/scale` subresource.
    async fn get_scale(&self, target: &TargetRef, namespace: &str) -> Result<Scale>;
    /// Merge-patch `spec.replicas` on the `/scale` subresource.
    async fn patch_scale(
        &self,
        target: &TargetRef,
        namespace: &str,
        replicas: i32,
    ) -> Result<Scale>;
    /// Pods in `namespace` matching `selector`.
    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>>;
    /// Per-pod usage from the resource metrics API.
    async fn pod_usage(&self, namespace: &str, selector: &Selector)
        -> Result<PodMetricsList>;
    /// Per-pod values from the custom metrics API.
    async fn pod_custom_metrics(
        &self,
        namespace: &str,
        metric: &str,
        selector: &Selector,
    ) -> Result<MetricValueList>;
    /// A single object's value from the custom metrics API.
    async fn object_metric(
        &self,
        namespace: &str,
        object: &CrossVersionObjectReference,
        metric: &str,
    ) -> Result<MetricValue>;
    /// Values from the external metrics API.
    async fn external_metrics(
        &self,
        namespace: &str,
        metric: &str,
        selector: &Selector,
    ) -> Result<ExternalMetricValueList>;
}

#[derive(Debug, Deserialize, Clone, Default)]
struct ApiResourceList {
    #[serde(default)]
    resources: Vec<ApiResource>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ApiResource {
    /// Plural REST name, e.g. `deployments` or `logstashes`.
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub namespaced: bool,
}

#[derive(Debug, Deserialize, Default)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// Talks to the Kubernetes API server over plain REST. Kinds resolve to
/// their REST names through discovery, so irregular plurals come from
/// the server rather than from guessing.
pub struct Cluster {
    http: reqwest::Client,
    base: String,
    discovery: RwLock<HashMap<String, Vec<ApiResource>>>,
}

impl Cluster {
    /// In-cluster configuration when the service environment is
    /// present, otherwise `KUBE_API_SERVER` or a local proxy.
    pub fn connect() -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        let base = if let Ok(host) = env::var(SERVICE_HOST_ENV) {
            let port =
                env::var(SERVICE_PORT_ENV).unwrap_or_else(|_| "443".to_owned());
            let token = fs::read_to_string(TOKEN_PATH)
                .context("failed to read service account token")?;
            let mut authorization =
                header::HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                    .context("malformed service account token")?;
            authorization.set_sensitive(true);
            let mut headers = header::HeaderMap::new();
            headers.insert(header::AUTHORIZATION, authorization);
            builder = builder.default_headers(headers);

            let ca = fs::read(CA_PATH).context("failed to read cluster CA certificate")?;
            builder = builder.add_root_certificate(
                Certificate::from_pem(&ca).context("invalid cluster CA certificate")?,
            );
            format!("https://{}:{}", host, port)
        } else {
            env::var(API_SERVER_ENV).unwrap_or_else(|_| "http://127.0.0.1:8001".to_owned())
        };
        Ok(Self::with_base(
            builder.build().context("failed to build API client")?,
            base,
        ))
    }

    pub fn with_base(http: reqwest::Client, base: String) -> Self {
        Self {
            http,
            base,
            discovery: RwLock::new(HashMap::new()),
        }
    }

    fn group_version_path(&self, api_version: &str) -> String {
        if api_version == "v1" {
            format!("{}/api/v1", self.base)
        } else {
            format!("{}/apis/{}", self.base, api_version)
        }
    }

    async fn discover(&self, api_version: &str) -> Result<Vec<ApiResource>> {
        if let Some(resources) = self.discovery.read().get(api_version) {
            return Ok(resources.clone());
        }
        let url = self.group_version_path(api_version);
        let list: ApiResourceList = self
            .get_json(&url, &[])
            .await
            .with_context(|| format!("failed to discover resources of {}", api_version))?;
        self.discovery
            .write()
            .insert(api_version.to_owned(), list.resources.clone());
        Ok(list.resources)
    }

    pub(crate) async fn resource_for(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<ApiResource> {
        let resources = self.discover(api_version).await?;
        resources
            .iter()
            .find(|resource| resource.kind == kind && !resource.name.contains('/'))
            .cloned()
            .ok_or_else(|| anyhow!("kind {} is not served by {}", kind, api_version))
    }

    async fn scale_url(&self, target: &TargetRef, namespace: &str) -> Result<String> {
        let resource = self.resource_for(&target.api_version, &target.kind).await?;
        let subresource = format!("{}/scale", resource.name);
        let resources = self.discover(&target.api_version).await?;
        if !resources.iter().any(|entry| entry.name == subresource) {
            bail!("{} does not expose a scale subresource", target.kind);
        }
        Ok(format!(
            "{}/scale",
            self.object_url(target, &resource, namespace)
        ))
    }

    fn object_url(
        &self,
        target: &TargetRef,
        resource: &ApiResource,
        namespace: &str,
    ) -> String {
        if resource.namespaced {
            format!(
                "{}/namespaces/{}/{}/{}",
                self.group_version_path(&target.api_version),
                namespace,
                resource.name,
                target.name
            )
        } else {
            format!(
                "{}/{}/{}",
                self.group_version_path(&target.api_version),
                resource.name,
                target.name
            )
        }
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GET {} returned {}: {}", url, status, body);
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("invalid response from {}", url))
    }

    pub(crate) fn selector_query(selector: &Selector) -> Vec<(&'static str, String)> {
        if selector.is_empty() {
            Vec::new()
        } else {
            vec![("labelSelector", selector.to_string())]
        }
    }
}

#[async_trait]
impl ClusterApi for Cluster {
    async fn get_target(&self, target: &TargetRef, namespace: &str) -> Result<Target> {
        let resource = self.resource_for(&target.api_version, &target.kind).await?;
        let url = self.object_url(target, &resource, namespace);
        let object: JsonValue = self.get_json(&url, &[]).await?;
        Target::from_json(&target.kind, object)
    }

    async fn get_scale(&self, target: &TargetRef, namespace: &str) -> Result<Scale> {
        let url = self.scale_url(target, namespace).await?;
        self.get_json(&url, &[]).await
    }

    async fn patch_scale(
        &self,
        target: &TargetRef,
        namespace: &str,
        replicas: i32,
    ) -> Result<Scale> {
        let url = self.scale_url(target, namespace).await?;
        let response = self
            .http
            .patch(&url)
            .header(header::CONTENT_TYPE, "application/merge-patch+json")
            .json(&json!({"spec": {"replicas": replicas}}))
            .send()
            .await
            .with_context(|| format!("PATCH {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("PATCH {} returned {}: {}", url, status, body);
        }
        response
            .json::<Scale>()
            .await
            .with_context(|| format!("invalid scale response from {}", url))
    }

    async fn list_pods(&self, namespace: &str, selector: &Selector) -> Result<Vec<Pod>> {
        let url = format!("{}/api/v1/namespaces/{}/pods", self.base, namespace);
        let list: PodList = self.get_json(&url, &[]).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|pod| selector.matches(&pod.metadata.labels))
            .collect())
    }

    async fn pod_usage(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<PodMetricsList> {
        self.query_pod_usage(namespace, selector).await
    }

    async fn pod_custom_metrics(
        &self,
        namespace: &str,
        metric: &str,
        selector: &Selector,
    ) -> Result<MetricValueList> {
        self.query_pod_custom_metrics(namespace, metric, selector).await
    }

    async fn object_metric(
        &self,
        namespace: &str,
        object: &CrossVersionObjectReference,
        metric: &str,
    ) -> Result<MetricValue> {
        self.query_object_metric(namespace, object, metric).await
    }

    async fn external_metrics(
        &self,
        namespace: &str,
        metric: &str,
        selector: &Selector,
    ) -> Result<ExternalMetricValueList> {
        self.query_external_metrics(namespace, metric, selector).await
    }
}
