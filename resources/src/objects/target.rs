use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::{
    selector::{LabelSelector, Selector},
    Labels, Metadata,
};

/// Identifies the workload being scaled. The namespace is optional
/// here; the top-level `namespace` config key is the fallback.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// The `/scale` subresource of a workload.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Scale {
    #[serde(default)]
    pub spec: ScaleSpec,
    #[serde(default)]
    pub status: ScaleStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ScaleSpec {
    #[serde(default)]
    pub replicas: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ScaleStatus {
    #[serde(default)]
    pub replicas: i32,
    /// Serialized label selector for the workload's pods.
    #[serde(default)]
    pub selector: String,
}

impl Scale {
    pub fn selector(&self) -> Result<Selector> {
        Selector::parse(&self.status.selector)
            .with_context(|| format!("invalid scale selector {:?}", self.status.selector))
    }
}

/// The parts of a workload spec the autoscaler reads. Anything else in
/// the object is carried opaquely in [`Target::object`].
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Workload {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: WorkloadSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct WorkloadSpec {
    #[serde(default)]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub selector: Option<SelectorField>,
}

/// Workload kinds disagree on the selector shape: most carry the
/// structured form, replication controllers a bare label map.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum SelectorField {
    Structured(LabelSelector),
    Equality(BTreeMap<String, String>),
}

impl SelectorField {
    pub fn to_selector(&self) -> Result<Selector> {
        match self {
            SelectorField::Structured(selector) => Selector::try_from(selector),
            SelectorField::Equality(labels) => Ok(Selector::from(labels)),
        }
    }
}

/// The scale target, as a tagged variant over the kinds with a known
/// shape. Anything else stays unstructured; the pipeline only needs the
/// capability accessors on [`Target`].
#[derive(Debug, Clone, PartialEq)]
pub enum TargetResource {
    Deployment(Workload),
    ReplicaSet(Workload),
    StatefulSet(Workload),
    ReplicationController(Workload),
    Rollout(Workload),
    Unstructured,
}

impl TargetResource {
    pub fn kind(&self) -> &'static str {
        match self {
            TargetResource::Deployment(_) => "Deployment",
            TargetResource::ReplicaSet(_) => "ReplicaSet",
            TargetResource::StatefulSet(_) => "StatefulSet",
            TargetResource::ReplicationController(_) => "ReplicationController",
            TargetResource::Rollout(_) => "Rollout",
            TargetResource::Unstructured => "Unstructured",
        }
    }

    fn workload(&self) -> Option<&Workload> {
        match self {
            TargetResource::Deployment(workload)
            | TargetResource::ReplicaSet(workload)
            | TargetResource::StatefulSet(workload)
            | TargetResource::ReplicationController(workload)
            | TargetResource::Rollout(workload) => Some(workload),
            TargetResource::Unstructured => None,
        }
    }
}

/// A fetched scale target: the verbatim object (forwarded to user
/// methods) plus the typed view over it.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub resource: TargetResource,
    pub object: JsonValue,
}

impl Target {
    pub fn from_json(kind: &str, object: JsonValue) -> Result<Self> {
        let resource = match kind {
            "Deployment" | "ReplicaSet" | "StatefulSet" | "ReplicationController"
            | "Rollout" => {
                let workload: Workload = serde_json::from_value(object.clone())
                    .with_context(|| format!("malformed {} object", kind))?;
                match kind {
                    "Deployment" => TargetResource::Deployment(workload),
                    "ReplicaSet" => TargetResource::ReplicaSet(workload),
                    "StatefulSet" => TargetResource::StatefulSet(workload),
                    "ReplicationController" => {
                        TargetResource::ReplicationController(workload)
                    },
                    _ => TargetResource::Rollout(workload),
                }
            },
            _ => TargetResource::Unstructured,
        };
        Ok(Target { resource, object })
    }

    pub fn name(&self) -> String {
        match self.resource.workload() {
            Some(workload) => workload.metadata.name.to_owned(),
            None => self
                .object
                .pointer("/metadata/name")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_owned(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self.resource.workload() {
            Some(workload) => workload.metadata.namespace.to_owned(),
            None => self
                .object
                .pointer("/metadata/namespace")
                .and_then(JsonValue::as_str)
                .map(str::to_owned),
        }
    }

    pub fn labels(&self) -> Labels {
        match self.resource.workload() {
            Some(workload) => workload.metadata.labels.to_owned(),
            None => self
                .object
                .pointer("/metadata/labels")
                .and_then(|labels| serde_json::from_value(labels.to_owned()).ok())
                .unwrap_or_default(),
        }
    }

    pub fn replicas(&self) -> Option<i32> {
        match self.resource.workload() {
            Some(workload) => workload.spec.replicas,
            None => self
                .object
                .pointer("/spec/replicas")
                .and_then(JsonValue::as_i64)
                .map(|replicas| replicas as i32),
        }
    }

    pub fn selector(&self) -> Result<Option<Selector>> {
        match self.resource.workload() {
            Some(workload) => match &workload.spec.selector {
                Some(field) => Ok(Some(field.to_selector()?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_kinds_are_parsed() {
        let object = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default", "labels": {"app": "web"}},
            "spec": {
                "replicas": 3,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {"spec": {"containers": []}}
            }
        });
        let target = Target::from_json("Deployment", object).unwrap();
        assert_eq!(target.resource.kind(), "Deployment");
        assert_eq!(target.name(), "web");
        assert_eq!(target.namespace().as_deref(), Some("default"));
        assert_eq!(target.replicas(), Some(3));
        let selector = target.selector().unwrap().unwrap();
        assert!(selector.matches(&Labels::from([("app", "web")])));
    }

    #[test]
    fn replication_controller_equality_selector() {
        let object = json!({
            "kind": "ReplicationController",
            "metadata": {"name": "rc"},
            "spec": {"replicas": 2, "selector": {"app": "legacy"}}
        });
        let target = Target::from_json("ReplicationController", object).unwrap();
        let selector = target.selector().unwrap().unwrap();
        assert!(selector.matches(&Labels::from([("app", "legacy")])));
        assert!(!selector.matches(&Labels::from([("app", "web")])));
    }

    #[test]
    fn unknown_kinds_stay_unstructured() {
        let object = json!({
            "apiVersion": "logstash.k8s.elastic.co/v1",
            "kind": "Logstash",
            "metadata": {"name": "ls", "namespace": "logging"},
            "spec": {"replicas": 1}
        });
        let target = Target::from_json("Logstash", object).unwrap();
        assert_eq!(target.resource.kind(), "Unstructured");
        assert_eq!(target.name(), "ls");
        assert_eq!(target.namespace().as_deref(), Some("logging"));
        assert_eq!(target.replicas(), Some(1));
    }

    #[test]
    fn scale_selector_parses() {
        let scale: Scale = serde_json::from_value(json!({
            "spec": {"replicas": 3},
            "status": {"replicas": 3, "selector": "app=web,tier in (frontend)"}
        }))
        .unwrap();
        let selector = scale.selector().unwrap();
        assert!(selector.matches(&Labels::from([("app", "web"), ("tier", "frontend")])));
    }
}
