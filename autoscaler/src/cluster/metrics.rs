use anyhow::{anyhow, Context, Result};
use resources::objects::{
    metrics::{
        CrossVersionObjectReference, ExternalMetricValueList, MetricValue, MetricValueList,
        PodMetricsList,
    },
    selector::Selector,
};

use super::Cluster;

const RESOURCE_METRICS_GROUP: &str = "metrics.k8s.io/v1beta1";
const CUSTOM_METRICS_GROUP: &str = "custom.metrics.k8s.io/v1beta2";
const EXTERNAL_METRICS_GROUP: &str = "external.metrics.k8s.io/v1beta1";

impl Cluster {
    pub(crate) async fn query_pod_usage(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<PodMetricsList> {
        let url = format!(
            "{}/apis/{}/namespaces/{}/pods",
            self.base(),
            RESOURCE_METRICS_GROUP,
            namespace
        );
        self.get_json(&url, &Cluster::selector_query(selector))
            .await
            .context("failed to query the resource metrics API")
    }

    pub(crate) async fn query_pod_custom_metrics(
        &self,
        namespace: &str,
        metric: &str,
        selector: &Selector,
    ) -> Result<MetricValueList> {
        let url = format!(
            "{}/apis/{}/namespaces/{}/pods/*/{}",
            self.base(),
            CUSTOM_METRICS_GROUP,
            namespace,
            metric
        );
        self.get_json(&url, &Cluster::selector_query(selector))
            .await
            .with_context(|| format!("failed to query custom metric {} for pods", metric))
    }

    /// Namespaced kinds are addressed by their discovered REST name;
    /// the root-scoped `Namespace` kind uses the metrics form instead.
    pub(crate) async fn query_object_metric(
        &self,
        namespace: &str,
        object: &CrossVersionObjectReference,
        metric: &str,
    ) -> Result<MetricValue> {
        let url = if object.kind == "Namespace" {
            format!(
                "{}/apis/{}/namespaces/{}/metrics/{}",
                self.base(),
                CUSTOM_METRICS_GROUP,
                object.name,
                metric
            )
        } else {
            let api_version = object.api_version.as_deref().unwrap_or("v1");
            let resource = self
                .resource_for(api_version, &object.kind)
                .await
                .with_context(|| format!("cannot resolve described object {}", object.kind))?;
            format!(
                "{}/apis/{}/namespaces/{}/{}/{}/{}",
                self.base(),
                CUSTOM_METRICS_GROUP,
                namespace,
                resource.name,
                object.name,
                metric
            )
        };
        let list: MetricValueList = self
            .get_json(&url, &[])
            .await
            .with_context(|| format!("failed to query object metric {}", metric))?;
        list.items
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no value returned for object metric {}", metric))
    }

    pub(crate) async fn query_external_metrics(
        &self,
        namespace: &str,
        metric: &str,
        selector: &Selector,
    ) -> Result<ExternalMetricValueList> {
        let url = format!(
            "{}/apis/{}/namespaces/{}/{}",
            self.base(),
            EXTERNAL_METRICS_GROUP,
            namespace,
            metric
        );
        self.get_json(&url, &Cluster::selector_query(selector))
            .await
            .with_context(|| format!("failed to query external metric {}", metric))
    }

    fn base(&self) -> &str {
        &self.base
    }
}
