use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{selector::LabelSelector, Metadata};

// ---------------------------------------------------------------------
// Metric API payloads
// ---------------------------------------------------------------------

/// Usage of all containers in one pod, as served by the resource
/// metrics API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodMetrics {
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
    /// Sampling window as a duration string, e.g. `30s`.
    #[serde(default)]
    pub window: String,
    #[serde(default)]
    pub containers: Vec<ContainerMetrics>,
}

impl PodMetrics {
    /// The sampling window in seconds; the API serves `15s`-style
    /// durations, occasionally `1m30s`.
    pub fn window_seconds(&self) -> i64 {
        let mut total = 0;
        let mut digits = String::new();
        for character in self.window.chars() {
            if character.is_ascii_digit() {
                digits.push(character);
                continue;
            }
            let value: i64 = match digits.parse() {
                Ok(value) => value,
                Err(_) => return 0,
            };
            digits.clear();
            total += match character {
                'h' => value * 3600,
                'm' => value * 60,
                's' => value,
                _ => return 0,
            };
        }
        total
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerMetrics {
    #[serde(default)]
    pub name: String,
    /// Usage per resource name, as quantity strings.
    #[serde(default)]
    pub usage: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodMetricsList {
    #[serde(default)]
    pub items: Vec<PodMetrics>,
}

/// One value from the custom metrics API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricValue {
    #[serde(default)]
    pub described_object: DescribedObject,
    #[serde(default)]
    pub metric: MetricIdentifier,
    pub timestamp: DateTime<Utc>,
    /// Quantity string.
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DescribedObject {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct MetricValueList {
    #[serde(default)]
    pub items: Vec<MetricValue>,
}

/// One value from the external metrics API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricValue {
    #[serde(default)]
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    /// Quantity string.
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ExternalMetricValueList {
    #[serde(default)]
    pub items: Vec<ExternalMetricValue>,
}

// ---------------------------------------------------------------------
// Metric specs (configuration side)
// ---------------------------------------------------------------------

/// One standard-metric spec from `kubernetesMetricSpecs`, mirroring the
/// platform's autoscaling v2 shape.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct K8sMetricSpec {
    #[serde(rename = "type")]
    pub type_: MetricSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMetricSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<PodsMetricSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectMetricSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalMetricSource>,
}

impl K8sMetricSpec {
    /// Ensure the block matching `type` is present.
    pub fn validate(&self) -> Result<()> {
        let present = match self.type_ {
            MetricSourceType::Resource => self.resource.is_some(),
            MetricSourceType::Pods => self.pods.is_some(),
            MetricSourceType::Object => self.object.is_some(),
            MetricSourceType::External => self.external.is_some(),
        };
        if !present {
            bail!("metric spec of type {:?} is missing its source block", self.type_);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum MetricSourceType {
    Resource,
    Pods,
    Object,
    External,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceMetricSource {
    /// Resource name, `cpu` or `memory`.
    pub name: String,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PodsMetricSource {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ObjectMetricSource {
    pub described_object: CrossVersionObjectReference,
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExternalMetricSource {
    pub metric: MetricIdentifier,
    pub target: MetricTarget,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricIdentifier {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CrossVersionObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MetricTarget {
    #[serde(rename = "type")]
    pub type_: MetricTargetType,
    /// Quantity string, for `Value` targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Quantity string, for `AverageValue` targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<String>,
    /// Percentage of requested, for `Utilization` targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_utilization: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum MetricTargetType {
    Utilization,
    Value,
    AverageValue,
}

// ---------------------------------------------------------------------
// Computed records
// ---------------------------------------------------------------------

/// One pod's metric sample, in milli-units.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodMetric {
    pub timestamp: DateTime<Utc>,
    /// Sampling window in seconds.
    pub window: i64,
    pub value: i64,
}

/// A mapping from pod names to samples.
pub type PodMetricsInfo = BTreeMap<String, PodMetric>;

/// One computed standard metric, handed to the user evaluation method
/// under `kubernetesMetrics`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StandardMetric {
    #[serde(rename = "type")]
    pub type_: MetricSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMetricStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<PodsMetricStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectMetricStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalMetricStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetricStatus {
    pub name: String,
    pub target_type: MetricTargetType,
    /// Usage per ready pod.
    pub pod_metrics: PodMetricsInfo,
    /// Request totals per pod, only for `Utilization` targets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, i64>,
    pub ready_pod_count: i64,
    pub ignored_pods: BTreeSet<String>,
    pub missing_pods: BTreeSet<String>,
    pub total_pods: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodsMetricStatus {
    pub metric_name: String,
    pub pod_metrics: PodMetricsInfo,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetricStatus {
    pub metric_name: String,
    pub current: MetricValueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_pod_count: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricStatus {
    pub metric_name: String,
    pub current: MetricValueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_pod_count: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Milli-valued current reading.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricValueStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_value: Option<i64>,
}

impl MetricTarget {
    /// The configured quantity for this target, in milli-units.
    pub fn milli_value(&self) -> Result<Option<i64>> {
        let raw = match self.type_ {
            MetricTargetType::Value => self.value.as_ref(),
            MetricTargetType::AverageValue => self.average_value.as_ref(),
            MetricTargetType::Utilization => return Ok(None),
        };
        raw.map(|raw| {
            super::quantity::parse_milli(raw)
                .with_context(|| format!("invalid target quantity {:?}", raw))
        })
        .transpose()
    }
}
