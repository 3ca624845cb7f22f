use anyhow::{bail, Result};
use resources::{
    config::Config,
    objects::{
        metrics::{
            MetricSourceType, PodMetric, PodMetricsInfo, PodsMetricSource,
            PodsMetricStatus, StandardMetric,
        },
        quantity,
        selector::Selector,
    },
};

use crate::cluster::ClusterApi;

/// Per-pod custom metrics. The metric's own selector wins when set,
/// otherwise the target's pods are queried.
pub(super) async fn gather(
    cluster: &dyn ClusterApi,
    config: &Config,
    source: &PodsMetricSource,
    selector: &Selector,
) -> Result<StandardMetric> {
    let metric_selector = match &source.metric.selector {
        Some(selector) => Selector::try_from(selector)?,
        None => selector.to_owned(),
    };
    let values = cluster
        .pod_custom_metrics(config.target_namespace(), &source.metric.name, &metric_selector)
        .await?;
    if values.items.is_empty() {
        bail!("no values returned for pods metric {}", source.metric.name);
    }

    let timestamp = values.items[0].timestamp;
    let mut samples = PodMetricsInfo::new();
    for item in &values.items {
        samples.insert(
            item.described_object.name.to_owned(),
            PodMetric {
                timestamp: item.timestamp,
                window: 0,
                value: quantity::parse_milli(&item.value)?,
            },
        );
    }

    Ok(StandardMetric {
        type_: MetricSourceType::Pods,
        resource: None,
        pods: Some(PodsMetricStatus {
            metric_name: source.metric.name.to_owned(),
            pod_metrics: samples,
            timestamp,
        }),
        object: None,
        external: None,
    })
}
