use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use resources::{
    config::Config,
    models::{Evaluation, Metric, RunType},
    objects::{metrics::StandardMetric, target::Target},
};
use serde_json::json;

use crate::execute::{truncate, Execute};

/// Runs the user evaluation method on the gathered data and extracts
/// its replica decision.
pub struct Evaluator {
    executor: Arc<dyn Execute>,
    config: Arc<Config>,
}

impl Evaluator {
    pub fn new(executor: Arc<dyn Execute>, config: Arc<Config>) -> Self {
        Self { executor, config }
    }

    pub async fn evaluate(
        &self,
        target: &Target,
        metrics: &[Metric],
        kubernetes_metrics: &[StandardMetric],
        run_type: RunType,
    ) -> Result<Evaluation> {
        let payload = json!({
            "metrics": metrics,
            "kubernetesMetrics": kubernetes_metrics,
            "resource": target.object,
            "runType": run_type,
        });

        if let Some(hook) = &self.config.pre_evaluate {
            self.executor
                .execute(hook, &payload.to_string())
                .await
                .context("pre-evaluate hook failed")?;
        }

        let method = self
            .config
            .evaluate
            .as_ref()
            .context("no evaluate method configured")?;
        let output = self
            .executor
            .execute(method, &payload.to_string())
            .await
            .context("evaluate method failed")?;
        let evaluation: Evaluation =
            serde_json::from_str(output.trim()).map_err(|error| {
                anyhow!(
                    "unparseable evaluation {:?}: {}",
                    truncate(output.trim()),
                    error
                )
            })?;

        if let Some(hook) = &self.config.post_evaluate {
            let mut payload = payload;
            payload["evaluation"] = json!(evaluation);
            self.executor
                .execute(hook, &payload.to_string())
                .await
                .context("post-evaluate hook failed")?;
        }

        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::mocks::{deployment, shell_method, MockExecute};

    fn config() -> Config {
        let mut config = Config::default();
        config.metric = Some(shell_method("/metric.sh"));
        config.evaluate = Some(shell_method("/evaluate.sh"));
        config
    }

    fn evaluator(executor: MockExecute, config: Config) -> (Evaluator, Arc<MockExecute>) {
        let executor = Arc::new(executor);
        (
            Evaluator::new(executor.clone(), Arc::new(config)),
            executor,
        )
    }

    #[tokio::test]
    async fn parses_the_replica_decision() {
        let (evaluator, executor) = evaluator(
            MockExecute::returning(r#"{"targetReplicas": 4, "reason": "queue is deep"}"#),
            config(),
        );
        let metrics = vec![Metric {
            resource: "a".to_owned(),
            value: "v".to_owned(),
        }];
        let evaluation = evaluator
            .evaluate(&deployment(), &metrics, &[], RunType::Scaler)
            .await
            .unwrap();
        // Extra fields in the method's output are dropped.
        assert_eq!(evaluation.target_replicas, 4);

        let payloads = executor.calls_to("/evaluate.sh");
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains(r#""metrics":[{"resource":"a","value":"v"}]"#));
        assert!(payloads[0].contains(r#""kubernetesMetrics":[]"#));
        assert!(payloads[0].contains(r#""runType":"scaler""#));
    }

    #[tokio::test]
    async fn unparseable_output_quotes_the_literal() {
        let (evaluator, _) = evaluator(MockExecute::returning("not-json"), config());
        let error = evaluator
            .evaluate(&deployment(), &[], &[], RunType::Api)
            .await
            .unwrap_err();
        assert!(format!("{:#}", error).contains("not-json"));
    }

    #[tokio::test]
    async fn missing_target_replicas_is_an_error() {
        let (evaluator, _) = evaluator(MockExecute::returning(r#"{"replicas": 2}"#), config());
        assert!(evaluator
            .evaluate(&deployment(), &[], &[], RunType::Scaler)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn failing_pre_evaluate_hook_aborts() {
        let mut config = config();
        config.pre_evaluate = Some(shell_method("/pre.sh"));
        let (evaluator, executor) = evaluator(
            MockExecute::with(|method, _| {
                if MockExecute::method_name(method) == "/pre.sh" {
                    bail!("hook refused");
                }
                Ok(r#"{"targetReplicas": 1}"#.to_owned())
            }),
            config,
        );
        let error = evaluator
            .evaluate(&deployment(), &[], &[], RunType::Scaler)
            .await
            .unwrap_err();
        assert!(format!("{:#}", error).contains("pre-evaluate hook failed"));
        assert!(executor.calls_to("/evaluate.sh").is_empty());
    }

    #[tokio::test]
    async fn post_evaluate_hook_receives_the_evaluation() {
        let mut config = config();
        config.post_evaluate = Some(shell_method("/post.sh"));
        let (evaluator, executor) = evaluator(
            MockExecute::returning(r#"{"targetReplicas": 7}"#),
            config,
        );
        evaluator
            .evaluate(&deployment(), &[], &[], RunType::Scaler)
            .await
            .unwrap();
        let payloads = executor.calls_to("/post.sh");
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].contains(r#""evaluation":{"targetReplicas":7}"#));
    }

    #[tokio::test]
    async fn failing_post_evaluate_hook_aborts() {
        let mut config = config();
        config.post_evaluate = Some(shell_method("/post.sh"));
        let (evaluator, _) = evaluator(
            MockExecute::with(|method, _| {
                if MockExecute::method_name(method) == "/post.sh" {
                    bail!("hook refused");
                }
                Ok(r#"{"targetReplicas": 1}"#.to_owned())
            }),
            config,
        );
        assert!(evaluator
            .evaluate(&deployment(), &[], &[], RunType::Scaler)
            .await
            .is_err());
    }
}
