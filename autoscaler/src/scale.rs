use std::{collections::VecDeque, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use resources::{
    config::Config,
    models::{Evaluation, RunType},
    objects::target::{Scale, Target},
};
use serde_json::json;

use crate::{cluster::ClusterApi, execute::Execute};

#[derive(Debug, Clone)]
struct Recommendation {
    replicas: i32,
    time: DateTime<Utc>,
}

/// Applies an evaluation to the target: records it, damps downscales
/// against the recent-target window, clamps, runs the scale hooks and
/// patches the scale subresource.
///
/// The recommendation history lives here and is shared between the
/// control loop and the REST API write path, so both stabilize against
/// the same window.
pub struct Scaler {
    cluster: Arc<dyn ClusterApi>,
    executor: Arc<dyn Execute>,
    config: Arc<Config>,
    recommendations: Mutex<VecDeque<Recommendation>>,
}

impl Scaler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        executor: Arc<dyn Execute>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            cluster,
            executor,
            config,
            recommendations: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the replica count in effect after this run, whether or
    /// not a write happened. At most one patch is issued per call.
    pub async fn scale(
        &self,
        target: &Target,
        scale: &Scale,
        evaluation: &Evaluation,
        run_type: RunType,
    ) -> Result<i32> {
        let target_ref = self
            .config
            .scale_target_ref
            .as_ref()
            .context("no scaleTargetRef configured")?;
        let current = scale.spec.replicas;
        let proposed = evaluation.target_replicas;

        let stabilized = self.stabilize_at(Utc::now(), current, proposed);
        if stabilized != proposed {
            tracing::info!(
                "Stabilized target for {} from {} to {}",
                target.name(),
                proposed,
                stabilized
            );
        }
        // An explicit zero is honored as-is; everything else is clamped
        // into bounds.
        let target_replicas = if proposed == 0 {
            0
        } else {
            stabilized.clamp(self.config.min_replicas, self.config.max_replicas)
        };

        let hook_payload = json!({
            "minReplicas": self.config.min_replicas,
            "maxReplicas": self.config.max_replicas,
            "currentReplicas": current,
            "targetReplicas": target_replicas,
            "resource": target.object,
            "runType": run_type,
        });
        if let Some(hook) = &self.config.pre_scale {
            self.executor
                .execute(hook, &hook_payload.to_string())
                .await
                .context("pre-scale hook failed")?;
        }

        if target_replicas != current {
            self.cluster
                .patch_scale(target_ref, self.config.target_namespace(), target_replicas)
                .await
                .context("failed to patch the scale subresource")?;
            tracing::info!(
                "Scaled {} from {} to {}",
                target.name(),
                current,
                target_replicas
            );
        } else {
            tracing::debug!("Replica count for {} is unchanged", target.name());
        }

        if let Some(hook) = &self.config.post_scale {
            let mut payload = hook_payload;
            payload["preStabilizedTargetReplicas"] = json!(proposed);
            // The write already happened; a failing hook is only noted.
            if let Err(error) = self.executor.execute(hook, &payload.to_string()).await {
                tracing::warn!("Post-scale hook failed: {:#}", error);
            }
        }

        Ok(target_replicas)
    }

    /// Record the proposal, prune the window, and take the window max
    /// when the proposal would scale down. Scale-ups pass through.
    fn stabilize_at(&self, now: DateTime<Utc>, current: i32, proposed: i32) -> i32 {
        let cutoff = now - Duration::seconds(self.config.downscale_stabilization as i64);
        let mut recommendations = self.recommendations.lock();
        recommendations.push_back(Recommendation {
            replicas: proposed,
            time: now,
        });
        while recommendations
            .front()
            .map_or(false, |recommendation| recommendation.time < cutoff)
        {
            recommendations.pop_front();
        }
        if proposed < current {
            recommendations
                .iter()
                .map(|recommendation| recommendation.replicas)
                .max()
                .unwrap_or(proposed)
        } else {
            proposed
        }
    }
}
