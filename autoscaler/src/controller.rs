use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use resources::{config::Config, models::RunType};
use tokio::{
    select,
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{cluster::ClusterApi, evaluate::Evaluator, gather::Gatherer, scale::Scaler};

/// The periodic control loop: gather, evaluate, scale, repeat.
pub struct Controller {
    config: Arc<Config>,
    cluster: Arc<dyn ClusterApi>,
    gatherer: Arc<Gatherer>,
    evaluator: Arc<Evaluator>,
    scaler: Arc<Scaler>,
    shutdown: watch::Receiver<bool>,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        cluster: Arc<dyn ClusterApi>,
        gatherer: Arc<Gatherer>,
        evaluator: Arc<Evaluator>,
        scaler: Arc<Scaler>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            cluster,
            gatherer,
            evaluator,
            scaler,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let delay = first_tick_delay(self.config.start_time, unix_now_ms());
        let mut ticker = interval_at(
            Instant::now() + delay,
            Duration::from_millis(self.config.interval.max(1)),
        );
        // Overrunning ticks drift to the next boundary instead of
        // queueing up behind it.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "Autoscaler started, first tick in {}ms, then every {}ms",
            delay.as_millis(),
            self.config.interval
        );

        loop {
            select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.tick().await {
                        tracing::error!("Tick failed: {:#}", error);
                    }
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                },
            }
        }
        tracing::info!("Autoscaler exited");
    }

    async fn tick(&self) -> Result<()> {
        let target_ref = self
            .config
            .scale_target_ref
            .as_ref()
            .context("no scaleTargetRef configured")?;
        let target = self
            .cluster
            .get_target(target_ref, self.config.target_namespace())
            .await
            .context("failed to get the scale target")?;
        if self.config.min_replicas == 0 {
            tracing::info!("Autoscaling is disabled (minReplicas is 0), skipping tick");
            return Ok(());
        }
        let scale = self
            .cluster
            .get_scale(target_ref, self.config.target_namespace())
            .await
            .context("failed to get the scale subresource")?;

        let (metrics, kubernetes_metrics) = self
            .gatherer
            .gather(&target, &scale, RunType::Scaler)
            .await?;
        let evaluation = self
            .evaluator
            .evaluate(&target, &metrics, &kubernetes_metrics, RunType::Scaler)
            .await?;
        let applied = self
            .scaler
            .scale(&target, &scale, &evaluation, RunType::Scaler)
            .await?;
        tracing::debug!("Tick complete, target replicas {}", applied);
        Ok(())
    }
}

fn unix_now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0)
}

/// Delay until the next multiple of `start_time` milliseconds, so that
/// e.g. `60000` produces whole-minute ticks.
fn first_tick_delay(start_time: u64, now_ms: u128) -> Duration {
    if start_time <= 1 {
        return Duration::from_millis(0);
    }
    let remainder = (now_ms % start_time as u128) as u64;
    if remainder == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis(start_time - remainder)
    }
}
