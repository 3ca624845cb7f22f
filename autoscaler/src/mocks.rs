//! Shared fakes for pipeline tests: an in-memory cluster and a
//! scriptable user-method executor.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use resources::{
    config::Method,
    objects::{
        metrics::{
            CrossVersionObjectReference, ExternalMetricValue, ExternalMetricValueList,
            MetricValue, MetricValueList, PodMetricsList,
        },
        pod::Pod,
        selector::Selector,
        target::{Scale, Target, TargetRef},
    },
};
use serde_json::json;

use crate::{cluster::ClusterApi, execute::Execute};

pub fn target_ref() -> TargetRef {
    TargetRef {
        api_version: "apps/v1".to_owned(),
        kind: "Deployment".to_owned(),
        name: "web".to_owned(),
        namespace: None,
    }
}

pub fn deployment() -> Target {
    Target::from_json(
        "Deployment",
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default", "labels": {"app": "web"}},
            "spec": {"replicas": 3, "selector": {"matchLabels": {"app": "web"}}}
        }),
    )
    .unwrap()
}

pub fn ready_pod(name: &str) -> Pod {
    serde_json::from_value(json!({
        "metadata": {"name": name, "namespace": "default", "labels": {"app": "web"}},
        "spec": {"containers": [{"name": "app"}]},
        "status": {
            "phase": "Running",
            "startTime": "2022-05-01T11:00:00Z",
            "conditions": [{"type": "Ready", "status": "True", "lastTransitionTime": "2022-05-01T11:00:30Z"}]
        }
    }))
    .unwrap()
}

pub struct MockCluster {
    pub target: Target,
    pub scale: Mutex<Scale>,
    pub pods: Vec<Pod>,
    pub usage: PodMetricsList,
    pub custom: MetricValueList,
    pub external: ExternalMetricValueList,
    pub object: Option<MetricValue>,
    pub fail_patch: bool,
    pub patches: Mutex<Vec<i32>>,
}

impl Default for MockCluster {
    fn default() -> Self {
        let scale: Scale = serde_json::from_value(json!({
            "spec": {"replicas": 3},
            "status": {"replicas": 3, "selector": "app=web"}
        }))
        .unwrap();
        Self {
            target: deployment(),
            scale: Mutex::new(scale),
            pods: Vec::new(),
            usage: PodMetricsList::default(),
            custom: MetricValueList::default(),
            external: ExternalMetricValueList::default(),
            object: None,
            fail_patch: false,
            patches: Mutex::new(Vec::new()),
        }
    }
}

impl MockCluster {
    pub fn with_replicas(self, replicas: i32) -> Self {
        {
            let mut scale = self.scale.lock();
            scale.spec.replicas = replicas;
            scale.status.replicas = replicas;
        }
        self
    }

    pub fn with_pods(mut self, names: &[&str]) -> Self {
        self.pods = names.iter().map(|name| ready_pod(name)).collect();
        self
    }

    pub fn with_external_values(mut self, values: &[i64]) -> Self {
        self.external = ExternalMetricValueList {
            items: values
                .iter()
                .map(|value| ExternalMetricValue {
                    metric_name: "queue_depth".to_owned(),
                    timestamp: Utc.ymd(2022, 5, 1).and_hms(12, 0, 0),
                    value: value.to_string(),
                })
                .collect(),
        };
        self
    }

    pub fn recorded_patches(&self) -> Vec<i32> {
        self.patches.lock().clone()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_target(&self, _target: &TargetRef, _namespace: &str) -> Result<Target> {
        Ok(self.target.clone())
    }

    async fn get_scale(&self, _target: &TargetRef, _namespace: &str) -> Result<Scale> {
        Ok(self.scale.lock().clone())
    }

    async fn patch_scale(
        &self,
        _target: &TargetRef,
        _namespace: &str,
        replicas: i32,
    ) -> Result<Scale> {
        if self.fail_patch {
            bail!("patch refused");
        }
        self.patches.lock().push(replicas);
        let mut scale = self.scale.lock();
        scale.spec.replicas = replicas;
        Ok(scale.clone())
    }

    async fn list_pods(&self, _namespace: &str, selector: &Selector) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .iter()
            .filter(|pod| selector.matches(&pod.metadata.labels))
            .cloned()
            .collect())
    }

    async fn pod_usage(
        &self,
        _namespace: &str,
        _selector: &Selector,
    ) -> Result<PodMetricsList> {
        Ok(self.usage.clone())
    }

    async fn pod_custom_metrics(
        &self,
        _namespace: &str,
        _metric: &str,
        _selector: &Selector,
    ) -> Result<MetricValueList> {
        Ok(self.custom.clone())
    }

    async fn object_metric(
        &self,
        _namespace: &str,
        _object: &CrossVersionObjectReference,
        metric: &str,
    ) -> Result<MetricValue> {
        self.object
            .clone()
            .ok_or_else(|| anyhow!("no value configured for object metric {}", metric))
    }

    async fn external_metrics(
        &self,
        _namespace: &str,
        _metric: &str,
        _selector: &Selector,
    ) -> Result<ExternalMetricValueList> {
        Ok(self.external.clone())
    }
}

type Script = Box<dyn Fn(&Method, &str) -> Result<String> + Send + Sync>;

/// Scriptable [`Execute`] recording every call as
/// `(method name, payload)`; methods are told apart by their shell
/// entrypoint or HTTP url.
pub struct MockExecute {
    pub calls: Mutex<Vec<(String, String)>>,
    script: Script,
}

impl MockExecute {
    pub fn with(script: impl Fn(&Method, &str) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
        }
    }

    pub fn returning(value: &str) -> Self {
        let value = value.to_owned();
        Self::with(move |_, _| Ok(value.to_owned()))
    }

    pub fn method_name(method: &Method) -> String {
        method
            .shell
            .as_ref()
            .map(|shell| shell.entrypoint.to_owned())
            .or_else(|| method.http.as_ref().map(|http| http.url.to_owned()))
            .unwrap_or_default()
    }

    pub fn calls_to(&self, name: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(method, _)| method == name)
            .map(|(_, payload)| payload.to_owned())
            .collect()
    }
}

#[async_trait]
impl Execute for MockExecute {
    async fn execute(&self, method: &Method, payload: &str) -> Result<String> {
        self.calls
            .lock()
            .push((Self::method_name(method), payload.to_owned()));
        (self.script)(method, payload)
    }
}

/// A shell method stub; tests only care about the entrypoint name.
pub fn shell_method(entrypoint: &str) -> Method {
    serde_json::from_value(json!({
        "type": "shell",
        "timeout": 1000,
        "shell": {"entrypoint": entrypoint, "command": []}
    }))
    .unwrap()
}
