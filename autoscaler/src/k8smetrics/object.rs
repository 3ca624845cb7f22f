use anyhow::{bail, Result};
use resources::{
    config::Config,
    objects::{
        metrics::{
            MetricSourceType, MetricTargetType, MetricValueStatus, ObjectMetricSource,
            ObjectMetricStatus, StandardMetric,
        },
        quantity,
        selector::Selector,
    },
};

use crate::cluster::ClusterApi;

/// A single object's custom metric. `Value` targets also report how
/// many of the target's pods are ready, as the platform autoscaler
/// does when normalizing object metrics by pod count.
pub(super) async fn gather(
    cluster: &dyn ClusterApi,
    config: &Config,
    source: &ObjectMetricSource,
    selector: &Selector,
) -> Result<StandardMetric> {
    let value = cluster
        .object_metric(config.target_namespace(), &source.described_object, &source.metric.name)
        .await?;
    let milli = quantity::parse_milli(&value.value)?;

    let (current, ready_pod_count) = match source.target.type_ {
        MetricTargetType::Value => (
            MetricValueStatus {
                value: Some(milli),
                average_value: None,
            },
            Some(super::ready_pod_count(cluster, config, selector).await?),
        ),
        MetricTargetType::AverageValue => (
            MetricValueStatus {
                value: None,
                average_value: Some(milli),
            },
            None,
        ),
        MetricTargetType::Utilization => {
            bail!("object metrics do not support utilization targets")
        },
    };

    Ok(StandardMetric {
        type_: MetricSourceType::Object,
        resource: None,
        pods: None,
        object: Some(ObjectMetricStatus {
            metric_name: source.metric.name.to_owned(),
            current,
            ready_pod_count,
            timestamp: value.timestamp,
        }),
        external: None,
    })
}
