use anyhow::{bail, Result};
use resources::{
    config::Config,
    objects::{
        metrics::{
            ExternalMetricSource, ExternalMetricStatus, MetricSourceType,
            MetricTargetType, MetricValueStatus, StandardMetric,
        },
        quantity,
        selector::Selector,
    },
};

use crate::cluster::ClusterApi;

/// External metrics: the values matched by the metric selector are
/// summed; `Value` targets also carry the ready-pod count.
pub(super) async fn gather(
    cluster: &dyn ClusterApi,
    config: &Config,
    source: &ExternalMetricSource,
    selector: &Selector,
) -> Result<StandardMetric> {
    let metric_selector = match &source.metric.selector {
        Some(selector) => Selector::try_from(selector)?,
        None => Selector::default(),
    };
    let values = cluster
        .external_metrics(config.target_namespace(), &source.metric.name, &metric_selector)
        .await?;
    if values.items.is_empty() {
        bail!("no values returned for external metric {}", source.metric.name);
    }

    let timestamp = values.items[0].timestamp;
    let mut total = 0;
    for item in &values.items {
        total += quantity::parse_milli(&item.value)?;
    }

    let (current, ready_pod_count) = match source.target.type_ {
        MetricTargetType::Value => (
            MetricValueStatus {
                value: Some(total),
                average_value: None,
            },
            Some(super::ready_pod_count(cluster, config, selector).await?),
        ),
        MetricTargetType::AverageValue => (
            MetricValueStatus {
                value: None,
                average_value: Some(total),
            },
            None,
        ),
        MetricTargetType::Utilization => {
            bail!("external metrics do not support utilization targets")
        },
    };

    Ok(StandardMetric {
        type_: MetricSourceType::External,
        resource: None,
        pods: None,
        object: None,
        external: Some(ExternalMetricStatus {
            metric_name: source.metric.name.to_owned(),
            current,
            ready_pod_count,
            timestamp,
        }),
    })
}
