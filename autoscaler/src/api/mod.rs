use std::{
    collections::HashMap, fs::File, io::BufReader, net::SocketAddr, sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::{Extension, OriginalUri, Query},
    http::{header, HeaderValue, Method, Request},
    middleware::{self, Next},
    response::Response,
    routing::any,
    Json, Router,
};
use hyper::server::conn::Http;
use resources::{
    config::Config,
    models::{ApiError, Evaluation, Metric, RunType},
    objects::target::{Scale, Target},
};
use tokio::{net::TcpListener, select, sync::watch};
use tokio_rustls::{rustls, TlsAcceptor};

use crate::{cluster::ClusterApi, evaluate::Evaluator, gather::Gatherer, scale::Scaler};

/// How long outstanding requests may run after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct AppState {
    pub config: Arc<Config>,
    pub cluster: Arc<dyn ClusterApi>,
    pub gatherer: Arc<Gatherer>,
    pub evaluator: Arc<Evaluator>,
    pub scaler: Arc<Scaler>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/metrics", any(metrics))
        .route("/api/v1/evaluation", any(evaluation))
        .fallback(any(not_found))
        .layer(middleware::from_fn(set_response_headers))
        .layer(Extension(state))
}

/// Serve the REST API until shutdown. Binds eagerly so startup fails
/// loudly on an occupied port or bad TLS material.
pub async fn serve(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let api = state.config.api_config.clone();
    let addr: SocketAddr = format!("{}:{}", api.host, api.port)
        .parse()
        .with_context(|| format!("invalid API address {}:{}", api.host, api.port))?;
    let app = router(state);

    if api.use_https {
        serve_tls(addr, app, &api.cert_file, &api.key_file, shutdown).await
    } else {
        let builder = axum::Server::try_bind(&addr)
            .with_context(|| format!("failed to bind API server to {}", addr))?;
        tracing::info!("API listening on http://{}", addr);
        let mut grace = shutdown.clone();
        let mut signal = shutdown;
        let server = builder
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = signal.changed().await;
            });
        tokio::pin!(server);
        select! {
            result = &mut server => result.context("API server failed"),
            _ = async {
                let _ = grace.changed().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                tracing::warn!("API requests still in flight after the grace period");
                Ok(())
            },
        }
    }
}

async fn serve_tls(
    addr: SocketAddr,
    app: Router,
    cert_file: &str,
    key_file: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let tls_config = tls_config(cert_file, key_file)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API server to {}", addr))?;
    tracing::info!("API listening on https://{}", addr);

    let mut connections = Vec::new();
    loop {
        select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        tracing::warn!("Failed to accept connection: {}", error);
                        continue;
                    },
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                connections.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());
                connections.push(tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            if let Err(error) =
                                Http::new().serve_connection(tls_stream, app).await
                            {
                                tracing::debug!("Connection from {} ended: {}", peer, error);
                            }
                        },
                        Err(error) => {
                            tracing::warn!("TLS handshake with {} failed: {}", peer, error)
                        },
                    }
                }));
            },
        }
    }

    let drain = async {
        for handle in connections {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("API requests still in flight after the grace period");
    }
    Ok(())
}

fn tls_config(cert_file: &str, key_file: &str) -> Result<rustls::ServerConfig> {
    let mut cert_reader = BufReader::new(
        File::open(cert_file)
            .with_context(|| format!("failed to read certificate file {}", cert_file))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("invalid certificate file {}", cert_file))?;
    let mut key_reader = BufReader::new(
        File::open(key_file)
            .with_context(|| format!("failed to read key file {}", key_file))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("invalid key file {}", key_file))?
        .ok_or_else(|| anyhow!("no private key found in {}", key_file))?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS material")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

async fn set_response_headers(request: Request<Body>, next: Next<Body>) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    response
}

async fn metrics(
    Extension(state): Extension<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Metric>>, ApiError> {
    if method != Method::GET {
        return Err(ApiError::method_not_allowed(method.as_str(), uri.path()));
    }
    // Reading metrics defaults to not scaling anything.
    let dry_run = parse_dry_run(&params, true)?;
    let run_type = if dry_run {
        RunType::ApiDryRun
    } else {
        RunType::Api
    };
    let (target, scale) = load_target(&state).await?;
    let (metrics, _) = state
        .gatherer
        .gather(&target, &scale, run_type)
        .await
        .map_err(internal)?;
    Ok(Json(metrics))
}

async fn evaluation(
    Extension(state): Extension<Arc<AppState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Evaluation>, ApiError> {
    if method != Method::POST {
        return Err(ApiError::method_not_allowed(method.as_str(), uri.path()));
    }
    let dry_run = parse_dry_run(&params, false)?;
    let run_type = if dry_run {
        RunType::ApiDryRun
    } else {
        RunType::Api
    };
    let (target, scale) = load_target(&state).await?;
    let (metrics, kubernetes_metrics) = state
        .gatherer
        .gather(&target, &scale, run_type)
        .await
        .map_err(internal)?;
    let evaluation = state
        .evaluator
        .evaluate(&target, &metrics, &kubernetes_metrics, run_type)
        .await
        .map_err(internal)?;
    if !dry_run {
        state
            .scaler
            .scale(&target, &scale, &evaluation, run_type)
            .await
            .map_err(internal)?;
    }
    Ok(Json(evaluation))
}

async fn not_found(OriginalUri(uri): OriginalUri) -> ApiError {
    ApiError::not_found(uri.path())
}

async fn load_target(state: &AppState) -> Result<(Target, Scale), ApiError> {
    let target_ref = state
        .config
        .scale_target_ref
        .as_ref()
        .ok_or_else(|| ApiError::internal("no scaleTargetRef configured".to_owned()))?;
    let target = state
        .cluster
        .get_target(target_ref, state.config.target_namespace())
        .await
        .map_err(internal)?;
    let scale = state
        .cluster
        .get_scale(target_ref, state.config.target_namespace())
        .await
        .map_err(internal)?;
    Ok((target, scale))
}

fn parse_dry_run(
    params: &HashMap<String, String>,
    default: bool,
) -> Result<bool, ApiError> {
    match params.get("dry_run") {
        None => Ok(default),
        Some(raw) => raw.parse::<bool>().map_err(|_| {
            ApiError::bad_request(format!(
                "Invalid value '{}' for dry_run, expected 'true' or 'false'",
                raw
            ))
        }),
    }
}

fn internal(error: anyhow::Error) -> ApiError {
    tracing::error!("API request failed: {:#}", error);
    ApiError::internal(format!("{:#}", error))
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use resources::config::RunMode;
    use serde_json::Value as JsonValue;

    use super::*;
    use crate::{
        execute::Execute,
        mocks::{shell_method, target_ref, MockCluster, MockExecute},
    };

    fn config() -> Config {
        let mut config = Config::default();
        config.scale_target_ref = Some(target_ref());
        config.run_mode = RunMode::PerPod;
        config.metric = Some(shell_method("/metric.sh"));
        config.evaluate = Some(shell_method("/evaluate.sh"));
        config.min_replicas = 1;
        config.max_replicas = 10;
        config
    }

    fn state(cluster: MockCluster, executor: MockExecute, config: Config) -> (Arc<AppState>, Arc<MockCluster>) {
        let cluster = Arc::new(cluster);
        let executor = Arc::new(executor);
        let config = Arc::new(config);
        let cluster_api: Arc<dyn ClusterApi> = cluster.clone();
        let executor_api: Arc<dyn Execute> = executor;
        let state = Arc::new(AppState {
            config: config.clone(),
            cluster: cluster_api.clone(),
            gatherer: Arc::new(Gatherer::new(
                cluster_api.clone(),
                executor_api.clone(),
                config.clone(),
            )),
            evaluator: Arc::new(Evaluator::new(executor_api.clone(), config.clone())),
            scaler: Arc::new(Scaler::new(cluster_api, executor_api, config)),
        });
        (state, cluster)
    }

    async fn spawn_api(state: Arc<AppState>) -> SocketAddr {
        let app = router(state);
        let server = axum::Server::bind(&"127.0.0.1:0".parse().unwrap())
            .serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn pipeline_executor() -> MockExecute {
        MockExecute::with(|method, _| {
            Ok(match MockExecute::method_name(method).as_str() {
                "/metric.sh" => "v".to_owned(),
                _ => r#"{"targetReplicas": 4}"#.to_owned(),
            })
        })
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_per_pod_records_without_writing() {
        let (state, cluster) = state(
            MockCluster::default().with_pods(&["a", "b", "c"]),
            pipeline_executor(),
            config(),
        );
        let addr = spawn_api(state).await;

        let response = reqwest::get(format!("http://{}/api/v1/metrics?dry_run=true", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        let metrics: Vec<Metric> = response.json().await.unwrap();
        assert_eq!(metrics.len(), 3);
        let mut resources: Vec<_> = metrics.iter().map(|m| m.resource.as_str()).collect();
        resources.sort_unstable();
        assert_eq!(resources, vec!["a", "b", "c"]);
        assert!(metrics.iter().all(|m| m.value == "v"));
        assert!(cluster.recorded_patches().is_empty());
    }

    #[tokio::test]
    async fn evaluation_scales_by_default() {
        let (state, cluster) = state(
            MockCluster::default().with_pods(&["a"]),
            pipeline_executor(),
            config(),
        );
        let addr = spawn_api(state).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/api/v1/evaluation", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let evaluation: Evaluation = response.json().await.unwrap();
        assert_eq!(evaluation.target_replicas, 4);
        assert_eq!(cluster.recorded_patches(), vec![4]);
    }

    #[tokio::test]
    async fn dry_run_evaluation_never_writes() {
        let (state, cluster) = state(
            MockCluster::default().with_pods(&["a"]),
            pipeline_executor(),
            config(),
        );
        let addr = spawn_api(state).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/api/v1/evaluation?dry_run=true", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let evaluation: Evaluation = response.json().await.unwrap();
        assert_eq!(evaluation.target_replicas, 4);
        assert!(cluster.recorded_patches().is_empty());
    }

    #[tokio::test]
    async fn invalid_dry_run_is_a_bad_request() {
        let (state, _) = state(MockCluster::default(), pipeline_executor(), config());
        let addr = spawn_api(state).await;

        let response = reqwest::get(format!("http://{}/api/v1/metrics?dry_run=yes", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: JsonValue = response.json().await.unwrap();
        assert_eq!(body["code"], 400);
        assert!(body["message"].as_str().unwrap().contains("dry_run"));
    }

    #[tokio::test]
    async fn unknown_paths_get_the_json_not_found_shape() {
        let (state, _) = state(MockCluster::default(), pipeline_executor(), config());
        let addr = spawn_api(state).await;

        let response = reqwest::get(format!("http://{}/api/v1/nope", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let body: JsonValue = response.json().await.unwrap();
        assert_eq!(body["message"], "Resource '/api/v1/nope' not found");
        assert_eq!(body["code"], 404);
    }

    #[tokio::test]
    async fn disallowed_methods_get_the_json_shape() {
        let (state, _) = state(MockCluster::default(), pipeline_executor(), config());
        let addr = spawn_api(state).await;

        let client = reqwest::Client::new();
        let response = client
            .delete(format!("http://{}/api/v1/metrics", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 405);
        let body: JsonValue = response.json().await.unwrap();
        assert_eq!(
            body["message"],
            "Method 'DELETE' not allowed on resource '/api/v1/metrics'"
        );
        assert_eq!(body["code"], 405);
    }

    #[tokio::test]
    async fn unparseable_evaluation_is_a_500_with_the_literal() {
        let (state, _) = state(
            MockCluster::default().with_pods(&["a"]),
            MockExecute::with(|method, _| {
                Ok(match MockExecute::method_name(method).as_str() {
                    "/metric.sh" => "v".to_owned(),
                    _ => "not-json".to_owned(),
                })
            }),
            config(),
        );
        let addr = spawn_api(state).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/api/v1/evaluation", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        let body: JsonValue = response.json().await.unwrap();
        assert_eq!(body["code"], 500);
        assert!(body["message"].as_str().unwrap().contains("not-json"));
    }

    #[tokio::test]
    async fn pipeline_failures_are_500s() {
        let (state, _) = state(
            MockCluster::default().with_pods(&["a"]),
            MockExecute::with(|_, _| bail!("metric method exploded")),
            config(),
        );
        let addr = spawn_api(state).await;

        let response = reqwest::get(format!("http://{}/api/v1/metrics", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        let body: JsonValue = response.json().await.unwrap();
        assert!(body["message"].as_str().unwrap().contains("metric method exploded"));
    }
}
