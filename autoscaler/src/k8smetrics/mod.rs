use anyhow::{bail, Result};
use resources::{
    config::Config,
    objects::{
        metrics::{K8sMetricSpec, MetricSourceType, StandardMetric},
        selector::Selector,
    },
};

use crate::cluster::ClusterApi;

mod external;
mod object;
mod pods;
mod resource;

/// Compute every configured standard-metric spec.
///
/// Failing specs are logged and skipped unless
/// `requireKubernetesMetrics` is set, in which case any failure aborts
/// with the first underlying error.
pub async fn gather(
    cluster: &dyn ClusterApi,
    config: &Config,
    selector: &Selector,
) -> Result<Vec<StandardMetric>> {
    let specs = &config.kubernetes_metric_specs;
    let mut metrics = Vec::with_capacity(specs.len());
    let mut failures = Vec::new();
    for spec in specs {
        match gather_spec(cluster, config, spec, selector).await {
            Ok(metric) => metrics.push(metric),
            Err(error) => {
                tracing::warn!("Failed to gather standard metric: {:#}", error);
                failures.push(error);
            },
        }
    }
    if !failures.is_empty() && config.require_kubernetes_metrics {
        let invalid = failures.len();
        return Err(failures.swap_remove(0).context(format!(
            "{} invalid out of {} metric specs",
            invalid,
            specs.len()
        )));
    }
    Ok(metrics)
}

async fn gather_spec(
    cluster: &dyn ClusterApi,
    config: &Config,
    spec: &K8sMetricSpec,
    selector: &Selector,
) -> Result<StandardMetric> {
    match spec.type_ {
        MetricSourceType::Resource => match &spec.resource {
            Some(source) => resource::gather(cluster, config, source, selector).await,
            None => bail!("Resource metric spec has no resource block"),
        },
        MetricSourceType::Pods => match &spec.pods {
            Some(source) => pods::gather(cluster, config, source, selector).await,
            None => bail!("Pods metric spec has no pods block"),
        },
        MetricSourceType::Object => match &spec.object {
            Some(source) => object::gather(cluster, config, source, selector).await,
            None => bail!("Object metric spec has no object block"),
        },
        MetricSourceType::External => match &spec.external {
            Some(source) => external::gather(cluster, config, source, selector).await,
            None => bail!("External metric spec has no external block"),
        },
    }
}

/// Ready pods matching the selector; `Value`-targeted object and
/// external metrics report this alongside the reading.
async fn ready_pod_count(
    cluster: &dyn ClusterApi,
    config: &Config,
    selector: &Selector,
) -> Result<i64> {
    let pods = cluster.list_pods(config.target_namespace(), selector).await?;
    Ok(pods.iter().filter(|pod| pod.is_ready()).count() as i64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use resources::objects::metrics::MetricTargetType;
    use serde_json::json;

    use super::*;
    use crate::mocks::MockCluster;

    fn config_with_specs(require: bool) -> Config {
        let mut config = Config::default();
        config.require_kubernetes_metrics = require;
        config.kubernetes_metric_specs = vec![
            serde_json::from_value(json!({
                "type": "External",
                "external": {
                    "metric": {"name": "queue_depth"},
                    "target": {"type": "AverageValue", "averageValue": "10"}
                }
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "type": "Pods",
                "pods": {
                    "metric": {"name": "requests_per_second"},
                    "target": {"type": "AverageValue", "averageValue": "100"}
                }
            }))
            .unwrap(),
        ];
        config
    }

    #[tokio::test]
    async fn failing_specs_are_skipped_when_not_required() {
        let cluster = Arc::new(MockCluster::default().with_external_values(&[4000, 2000]));
        // No custom pod metrics configured in the mock, so the Pods
        // spec fails while the External one succeeds.
        let config = config_with_specs(false);
        let metrics = gather(cluster.as_ref(), &config, &Selector::default())
            .await
            .unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].type_, MetricSourceType::External);
        let external = metrics[0].external.as_ref().unwrap();
        assert_eq!(external.current.average_value, Some(6_000_000));
        assert_eq!(external.metric_name, "queue_depth");
    }

    #[tokio::test]
    async fn any_failure_aborts_when_required() {
        let cluster = Arc::new(MockCluster::default().with_external_values(&[4000]));
        let config = config_with_specs(true);
        let error = gather(cluster.as_ref(), &config, &Selector::default())
            .await
            .unwrap_err();
        assert!(
            format!("{:#}", error).contains("1 invalid out of 2 metric specs"),
            "unexpected error: {:#}",
            error
        );
    }

    #[tokio::test]
    async fn no_specs_produce_no_metrics() {
        let cluster = Arc::new(MockCluster::default());
        let config = Config::default();
        let metrics = gather(cluster.as_ref(), &config, &Selector::default())
            .await
            .unwrap();
        assert!(metrics.is_empty());
    }

    #[test]
    fn value_targets_parse() {
        let target: resources::objects::metrics::MetricTarget =
            serde_json::from_value(json!({"type": "Value", "value": "500m"})).unwrap();
        assert_eq!(target.type_, MetricTargetType::Value);
        assert_eq!(target.milli_value().unwrap(), Some(500));
    }
}
