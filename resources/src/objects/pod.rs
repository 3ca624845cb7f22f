use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{quantity, Metadata};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Pod {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ResourceRequirements {
    /// Requested amounts, as quantity strings keyed by resource name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    /// When the pod was acknowledged by its kubelet. Unset until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl Default for PodPhase {
    fn default() -> Self {
        PodPhase::Unknown
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub type_: PodConditionType,
    /// "True", "False" or "Unknown", as the platform reports it.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PodConditionType {
    ContainersReady,
    Initialized,
    PodScheduled,
    Ready,
    #[serde(other)]
    Other,
}

impl Pod {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The `Ready` condition, if the pod reports one.
    pub fn ready_condition(&self) -> Option<&PodCondition> {
        self.status.as_ref().and_then(|status| {
            status
                .conditions
                .iter()
                .find(|condition| condition.type_ == PodConditionType::Ready)
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .map_or(false, |condition| condition.status == "True")
    }

    /// Sum of the pod's container requests for `resource`, in
    /// milli-units. Every container must carry the request.
    pub fn requests_milli(&self, resource: &str) -> Result<i64> {
        let mut total = 0;
        for container in &self.spec.containers {
            let request = container.resources.requests.get(resource).ok_or_else(|| {
                anyhow!(
                    "missing {} request for container {} in pod {}",
                    resource,
                    container.name,
                    self.metadata.name
                )
            })?;
            total += quantity::parse_milli(request)?;
        }
        Ok(total)
    }
}
