use axum::{
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use strum::Display;

/// A single gathered metric value.
///
/// `resource` names the pod the value was gathered for (per-pod mode) or
/// the scale target itself (per-resource mode); `value` is whatever the
/// user metric method wrote to its standard out.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Metric {
    pub resource: String,
    pub value: String,
}

/// The decision produced by the user evaluation method.
/// Any other field in its output is ignored.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub target_replicas: i32,
}

/// How a pipeline run was triggered. Forwarded in every user method
/// payload so user logic can branch on it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunType {
    /// Periodic run triggered by the control loop.
    Scaler,
    /// Run triggered through the REST API, scale may be applied.
    Api,
    /// Run triggered through the REST API, never writes.
    ApiDryRun,
}

/// Error body returned by every failing REST API endpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub message: String,
    pub code: u16,
}

impl ApiError {
    pub fn new(code: StatusCode, message: String) -> Self {
        Self {
            message,
            code: code.as_u16(),
        }
    }

    pub fn bad_request(message: String) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("Resource '{}' not found", path),
        )
    }

    pub fn method_not_allowed(method: &str, path: &str) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("Method '{}' not allowed on resource '{}'", method, path),
        )
    }

    pub fn internal(message: String) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Json(&self).into_response();
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        response.headers_mut().insert(
            "X-Content-Type-Options",
            HeaderValue::from_static("nosniff"),
        );
        response
    }
}
