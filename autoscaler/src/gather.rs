use std::sync::Arc;

use anyhow::{Context, Result};
use resources::{
    config::{Config, RunMode},
    models::{Metric, RunType},
    objects::{
        metrics::StandardMetric,
        target::{Scale, Target},
    },
};
use serde_json::json;

use crate::{cluster::ClusterApi, execute::Execute, k8smetrics};

/// Turns the target into custom metric records, optionally joined with
/// the configured standard metrics.
pub struct Gatherer {
    cluster: Arc<dyn ClusterApi>,
    executor: Arc<dyn Execute>,
    config: Arc<Config>,
}

impl Gatherer {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        executor: Arc<dyn Execute>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cluster,
            executor,
            config,
        }
    }

    pub async fn gather(
        &self,
        target: &Target,
        scale: &Scale,
        run_type: RunType,
    ) -> Result<(Vec<Metric>, Vec<StandardMetric>)> {
        let spec_payload = json!({
            "resource": target.object,
            "runType": run_type,
        })
        .to_string();

        if let Some(hook) = &self.config.pre_metric {
            self.executor
                .execute(hook, &spec_payload)
                .await
                .context("pre-metric hook failed")?;
        }

        let method = self
            .config
            .metric
            .as_ref()
            .context("no metric method configured")?;
        let mut metrics = Vec::new();
        match self.config.run_mode {
            RunMode::PerPod => {
                let selector = scale.selector()?;
                let pods = self
                    .cluster
                    .list_pods(self.config.target_namespace(), &selector)
                    .await
                    .context("failed to list the target's pods")?;
                if pods.is_empty() {
                    tracing::debug!("No pods matched the target selector");
                }
                for pod in &pods {
                    let payload = json!({
                        "resource": pod,
                        "runType": run_type,
                    })
                    .to_string();
                    let value = self
                        .executor
                        .execute(method, &payload)
                        .await
                        .with_context(|| {
                            format!("metric method failed for pod {}", pod.name())
                        })?;
                    metrics.push(Metric {
                        resource: pod.name().to_owned(),
                        value,
                    });
                }
            },
            RunMode::PerResource => {
                let value = self
                    .executor
                    .execute(method, &spec_payload)
                    .await
                    .context("metric method failed")?;
                metrics.push(Metric {
                    resource: target.name(),
                    value,
                });
            },
        }

        let kubernetes_metrics = if self.config.kubernetes_metric_specs.is_empty() {
            Vec::new()
        } else {
            let selector = scale.selector()?;
            k8smetrics::gather(self.cluster.as_ref(), &self.config, &selector).await?
        };

        if let Some(hook) = &self.config.post_metric {
            let payload = json!({
                "spec": {"resource": target.object, "runType": run_type},
                "metrics": metrics,
            })
            .to_string();
            self.executor
                .execute(hook, &payload)
                .await
                .context("post-metric hook failed")?;
        }

        Ok((metrics, kubernetes_metrics))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use resources::objects::target::Scale;

    use super::*;
    use crate::mocks::{deployment, shell_method, MockCluster, MockExecute};

    fn config(run_mode: RunMode) -> Config {
        let mut config = Config::default();
        config.run_mode = run_mode;
        config.metric = Some(shell_method("/metric.sh"));
        config.evaluate = Some(shell_method("/evaluate.sh"));
        config
    }

    fn scale() -> Scale {
        serde_json::from_value(serde_json::json!({
            "spec": {"replicas": 3},
            "status": {"replicas": 3, "selector": "app=web"}
        }))
        .unwrap()
    }

    fn gatherer(
        cluster: MockCluster,
        executor: MockExecute,
        config: Config,
    ) -> (Gatherer, Arc<MockCluster>, Arc<MockExecute>) {
        let cluster = Arc::new(cluster);
        let executor = Arc::new(executor);
        let gatherer = Gatherer::new(
            cluster.clone(),
            executor.clone(),
            Arc::new(config),
        );
        (gatherer, cluster, executor)
    }

    #[tokio::test]
    async fn per_pod_invokes_the_method_for_every_pod() {
        let (gatherer, _, executor) = gatherer(
            MockCluster::default().with_pods(&["a", "b", "c"]),
            MockExecute::returning("v"),
            config(RunMode::PerPod),
        );
        let (metrics, standard) = gatherer
            .gather(&deployment(), &scale(), RunType::Scaler)
            .await
            .unwrap();

        assert_eq!(standard.len(), 0);
        let mut resources: Vec<_> = metrics.iter().map(|m| m.resource.as_str()).collect();
        resources.sort_unstable();
        assert_eq!(resources, vec!["a", "b", "c"]);
        assert!(metrics.iter().all(|m| m.value == "v"));

        let payloads = executor.calls_to("/metric.sh");
        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].contains(r#""runType":"scaler""#));
        assert!(payloads[0].contains(r#""name":"a""#));
    }

    #[tokio::test]
    async fn per_resource_invokes_the_method_once() {
        let (gatherer, _, executor) = gatherer(
            MockCluster::default().with_pods(&["a", "b"]),
            MockExecute::returning("42"),
            config(RunMode::PerResource),
        );
        let (metrics, _) = gatherer
            .gather(&deployment(), &scale(), RunType::Api)
            .await
            .unwrap();

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].resource, "web");
        assert_eq!(metrics[0].value, "42");
        let payloads = executor.calls_to("/metric.sh");
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains(r#""runType":"api""#));
        assert!(payloads[0].contains(r#""kind":"Deployment""#));
    }

    #[tokio::test]
    async fn no_matching_pods_yield_an_empty_list() {
        let (gatherer, _, executor) = gatherer(
            MockCluster::default(),
            MockExecute::returning("v"),
            config(RunMode::PerPod),
        );
        let (metrics, _) = gatherer
            .gather(&deployment(), &scale(), RunType::Scaler)
            .await
            .unwrap();
        assert!(metrics.is_empty());
        assert!(executor.calls_to("/metric.sh").is_empty());
    }

    #[tokio::test]
    async fn failing_pre_metric_hook_aborts() {
        let mut config = config(RunMode::PerPod);
        config.pre_metric = Some(shell_method("/pre.sh"));
        let (gatherer, _, executor) = gatherer(
            MockCluster::default().with_pods(&["a"]),
            MockExecute::with(|method, _| {
                if MockExecute::method_name(method) == "/pre.sh" {
                    bail!("hook refused");
                }
                Ok("v".to_owned())
            }),
            config,
        );
        let error = gatherer
            .gather(&deployment(), &scale(), RunType::Scaler)
            .await
            .unwrap_err();
        assert!(format!("{:#}", error).contains("pre-metric hook failed"));
        assert!(executor.calls_to("/metric.sh").is_empty());
    }

    #[tokio::test]
    async fn post_metric_hook_receives_the_gathered_metrics() {
        let mut config = config(RunMode::PerPod);
        config.post_metric = Some(shell_method("/post.sh"));
        let (gatherer, _, executor) = gatherer(
            MockCluster::default().with_pods(&["a"]),
            MockExecute::returning("v"),
            config,
        );
        gatherer
            .gather(&deployment(), &scale(), RunType::Scaler)
            .await
            .unwrap();
        let payloads = executor.calls_to("/post.sh");
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains(r#""metrics":[{"resource":"a","value":"v"}]"#));
    }

    #[tokio::test]
    async fn unparseable_scale_selector_aborts() {
        let mut scale = scale();
        scale.status.selector = "tier in (web".to_owned();
        let (gatherer, _, _) = gatherer(
            MockCluster::default(),
            MockExecute::returning("v"),
            config(RunMode::PerPod),
        );
        assert!(gatherer
            .gather(&deployment(), &scale, RunType::Scaler)
            .await
            .is_err());
    }
}
