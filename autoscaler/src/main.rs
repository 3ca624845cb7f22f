use std::{env, path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use resources::config::{Config, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use tokio::{sync::watch, time::timeout};

use crate::{
    api::AppState,
    cluster::{Cluster, ClusterApi},
    controller::Controller,
    evaluate::Evaluator,
    execute::{Execute, Executor},
    gather::Gatherer,
    scale::Scaler,
};

mod api;
mod cluster;
mod controller;
mod evaluate;
mod execute;
mod gather;
mod k8smetrics;
#[cfg(test)]
mod mocks;
mod scale;

/// How long the control loop may finish its current tick on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
    let config = Config::load(Path::new(&config_path))
        .with_context(|| format!("failed to load configuration from {}", config_path))?;
    init_tracing(&config);
    let config = Arc::new(config);

    let cluster: Arc<dyn ClusterApi> =
        Arc::new(Cluster::connect().context("failed to build the cluster client")?);
    let executor: Arc<dyn Execute> = Arc::new(Executor::new());
    let gatherer = Arc::new(Gatherer::new(
        cluster.clone(),
        executor.clone(),
        config.clone(),
    ));
    let evaluator = Arc::new(Evaluator::new(executor.clone(), config.clone()));
    let scaler = Arc::new(Scaler::new(cluster.clone(), executor, config.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let controller = Controller::new(
        config.clone(),
        cluster.clone(),
        gatherer.clone(),
        evaluator.clone(),
        scaler.clone(),
        shutdown_rx.clone(),
    );
    let control_loop = tokio::spawn(controller.run());

    if config.api_config.enabled {
        let state = Arc::new(AppState {
            config: config.clone(),
            cluster,
            gatherer,
            evaluator,
            scaler,
        });
        api::serve(state, shutdown_rx).await?;
    } else {
        tracing::info!("REST API is disabled");
        let mut shutdown_rx = shutdown_rx;
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    }

    if timeout(SHUTDOWN_GRACE, control_loop).await.is_err() {
        tracing::warn!("Control loop did not stop within the grace period");
    }
    tracing::info!("Shut down cleanly");
    Ok(())
}

fn init_tracing(config: &Config) {
    // An explicit RUST_LOG wins over the configured verbosity.
    if env::var("RUST_LOG").is_err() {
        let level = match config.log_verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        env::set_var("RUST_LOG", level);
    }
    tracing_subscriber::fmt::init();
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        )
        .expect("failed to install the SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
