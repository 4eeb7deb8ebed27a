//! Forwards tunnelled requests to the local service

use burrow_proto::{ForwardRequest, ForwardResponse};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ClientError;

/// Headers that only describe the relay hop
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub struct LocalForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl LocalForwarder {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Replay `request` against the local service.
    ///
    /// Never fails: an unreachable service becomes a `502` answer so the
    /// public caller is not left waiting for the relay deadline.
    pub async fn forward(&self, request: &ForwardRequest) -> ForwardResponse {
        match self.try_forward(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Local service failed {} {}: {}",
                    request.method, request.path, e
                );
                ForwardResponse::new(request.request_id, 502)
                    .with_header("content-type", "text/plain")
                    .with_body(format!("burrow: local service unavailable: {}", e))
            }
        }
    }

    async fn try_forward(&self, request: &ForwardRequest) -> Result<ForwardResponse, ClientError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| ClientError::Config(format!("invalid method {}", request.method)))?;
        let url = format!("{}{}", self.base_url, request.path);

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        debug!("Forwarding {} {} to {}", request.method, request.path, url);

        let mut builder = self.client.request(method, &url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| !SKIPPED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(ForwardResponse {
            request_id: request.request_id,
            status,
            headers,
            body: (!body.is_empty()).then(|| body.to_vec()),
        })
    }
}
