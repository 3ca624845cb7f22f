use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use resources::{
    config::Config,
    objects::{
        metrics::{
            MetricSourceType, MetricTargetType, PodMetric, PodMetrics, PodMetricsInfo,
            ResourceMetricSource, ResourceMetricStatus, StandardMetric,
        },
        pod::{Pod, PodPhase},
        selector::Selector,
    },
};

use crate::cluster::ClusterApi;

/// Resource (CPU / memory) metrics, reproducing the platform
/// autoscaler's pod partitioning: pods are `ready`, `ignored` or
/// `missing`; samples of ignored pods are dropped; request totals are
/// needed only for utilization targets.
pub(super) async fn gather(
    cluster: &dyn ClusterApi,
    config: &Config,
    source: &ResourceMetricSource,
    selector: &Selector,
) -> Result<StandardMetric> {
    let usage = cluster.pod_usage(config.target_namespace(), selector).await?;
    if usage.items.is_empty() {
        bail!(
            "no usage returned from the resource metrics API for {}",
            source.name
        );
    }
    let pods = cluster.list_pods(config.target_namespace(), selector).await?;
    if pods.is_empty() {
        bail!("no pods matched the target selector");
    }

    let timestamp = usage.items[0].timestamp;
    let mut samples = PodMetricsInfo::new();
    for item in &usage.items {
        // A pod with containers lacking this resource's sample counts
        // as missing, not as partially present.
        if let Some(value) = sum_container_usage(item, &source.name) {
            samples.insert(
                item.metadata.name.to_owned(),
                PodMetric {
                    timestamp: item.timestamp,
                    window: item.window_seconds(),
                    value,
                },
            );
        }
    }

    let grouped = group_pods(
        &pods,
        &samples,
        &source.name,
        Duration::seconds(config.cpu_initialization_period as i64),
        Duration::seconds(config.initial_readiness_delay as i64),
        Utc::now(),
    );
    for name in &grouped.ignored {
        samples.remove(name);
    }

    let requests = if source.target.type_ == MetricTargetType::Utilization {
        let mut requests = BTreeMap::new();
        for pod in &pods {
            requests.insert(pod.name().to_owned(), pod.requests_milli(&source.name)?);
        }
        requests
    } else {
        BTreeMap::new()
    };

    Ok(StandardMetric {
        type_: MetricSourceType::Resource,
        resource: Some(ResourceMetricStatus {
            name: source.name.to_owned(),
            target_type: source.target.type_,
            pod_metrics: samples,
            requests,
            ready_pod_count: grouped.ready,
            ignored_pods: grouped.ignored,
            missing_pods: grouped.missing,
            total_pods: pods.len() as i64,
            timestamp,
        }),
        pods: None,
        object: None,
        external: None,
    })
}

fn sum_container_usage(metrics: &PodMetrics, resource: &str) -> Option<i64> {
    if metrics.containers.is_empty() {
        return None;
    }
    let mut total = 0;
    for container in &metrics.containers {
        let quantity = container.usage.get(resource)?;
        total += resources::objects::quantity::parse_milli(quantity).ok()?;
    }
    Some(total)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct GroupedPods {
    ready: i64,
    ignored: BTreeSet<String>,
    missing: BTreeSet<String>,
}

/// Partition pods the way the platform autoscaler does.
///
/// Deleted and failed pods are dropped outright. Pending pods are
/// ignored. Pods without a usage sample are missing. For CPU, pods
/// still inside `cpu_initialization_period` are ignored unless ready
/// with a sample taken a full window after their last ready
/// transition; after that period a pod is only ignored while not ready
/// and never ready since `initial_readiness_delay` of its start.
fn group_pods(
    pods: &[Pod],
    samples: &PodMetricsInfo,
    resource: &str,
    cpu_initialization_period: Duration,
    initial_readiness_delay: Duration,
    now: DateTime<Utc>,
) -> GroupedPods {
    let mut grouped = GroupedPods::default();
    for pod in pods {
        let name = pod.name().to_owned();
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let status = match &pod.status {
            Some(status) => status,
            None => {
                grouped.ignored.insert(name);
                continue;
            },
        };
        if status.phase == PodPhase::Failed {
            continue;
        }
        if status.phase == PodPhase::Pending {
            grouped.ignored.insert(name);
            continue;
        }
        let sample = match samples.get(&name) {
            Some(sample) => sample,
            None => {
                grouped.missing.insert(name);
                continue;
            },
        };
        if resource == "cpu" && is_cpu_unready(
            pod,
            sample,
            cpu_initialization_period,
            initial_readiness_delay,
            now,
        ) {
            grouped.ignored.insert(name);
            continue;
        }
        grouped.ready += 1;
    }
    grouped
}

fn is_cpu_unready(
    pod: &Pod,
    sample: &PodMetric,
    cpu_initialization_period: Duration,
    initial_readiness_delay: Duration,
    now: DateTime<Utc>,
) -> bool {
    let status = match &pod.status {
        Some(status) => status,
        None => return true,
    };
    let (condition, start_time) = match (pod.ready_condition(), status.start_time) {
        (Some(condition), Some(start_time)) => (condition, start_time),
        _ => return true,
    };
    let ready = condition.status == "True";
    if start_time + cpu_initialization_period > now {
        // Start-up window: the sample must postdate the last ready
        // transition by a full sampling window.
        let window = Duration::seconds(sample.window.max(0));
        !ready
            || condition
                .last_transition_time
                .map_or(true, |transition| sample.timestamp < transition + window)
    } else {
        // Past start-up: only pods that never became ready are ignored.
        !ready
            && condition.last_transition_time.map_or(true, |transition| {
                start_time + initial_readiness_delay > transition
            })
    }
}
