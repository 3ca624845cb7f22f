use std::{fs, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Certificate, Identity};
use resources::config::{Http, Method, ParameterMode};

use super::{truncate, Execute};

/// Calls the method as an HTTP endpoint, with the payload either in the
/// request body or url-encoded as the `value` query parameter.
#[derive(Debug, Default)]
pub struct HttpExecute;

impl HttpExecute {
    /// The client is built per call: TLS material is method-specific
    /// and may change on disk between invocations.
    fn build_client(&self, http: &Http, deadline: Duration) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(deadline);
        if let Some(path) = &http.ca_cert {
            let pem = fs::read(path)
                .with_context(|| format!("failed to read CA certificate {}", path))?;
            let certificate =
                Certificate::from_pem(&pem).context("invalid CA certificate")?;
            builder = builder.add_root_certificate(certificate);
        }
        match (&http.client_cert, &http.client_key) {
            (Some(cert_path), Some(key_path)) => {
                // The identity wants one PEM bundle holding both halves.
                let mut bundle = fs::read(cert_path).with_context(|| {
                    format!("failed to read client certificate {}", cert_path)
                })?;
                bundle.push(b'\n');
                let key = fs::read(key_path)
                    .with_context(|| format!("failed to read client key {}", key_path))?;
                bundle.extend_from_slice(&key);
                let identity =
                    Identity::from_pem(&bundle).context("invalid client identity")?;
                builder = builder.identity(identity);
            },
            (None, None) => {},
            _ => bail!("clientCert and clientKey must be configured together"),
        }
        builder.build().context("failed to build HTTP client")
    }
}

#[async_trait]
impl Execute for HttpExecute {
    async fn execute(&self, method: &Method, payload: &str) -> Result<String> {
        let http = method
            .http
            .as_ref()
            .ok_or_else(|| anyhow!("http method has no http block"))?;
        let client = self.build_client(http, Duration::from_millis(method.timeout))?;
        let verb = reqwest::Method::from_bytes(http.method.as_bytes())
            .with_context(|| format!("invalid HTTP method {:?}", http.method))?;

        let mut request = client.request(verb, &http.url);
        for (name, value) in &http.headers {
            request = request.header(name, value);
        }
        request = match http.parameter_mode {
            ParameterMode::Body => request.body(payload.to_owned()),
            ParameterMode::Query => request.query(&[("value", payload)]),
        };

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", http.url))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if !http.success_codes.contains(&status) {
            bail!(
                "{} returned unexpected status {}: {}",
                http.url,
                status,
                truncate(&body)
            );
        }
        Ok(body)
    }
}
