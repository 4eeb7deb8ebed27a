//! Public traffic for `<subdomain>.<public_domain>`
//!
//! Every request whose `Host` names a tunnel is forwarded through the
//! subdomain's transport and recorded. Requests for unclaimed subdomains get a
//! 404 and an `unknown_requests` row. Record keeping runs in background tasks
//! and never delays or changes the answer.

use axum::{
    body::{self, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use burrow_control::{InboundRequest, RequestCorrelator, TransportError};
use burrow_proto::{ForwardResponse, RequestId};
use burrow_relay_db::{
    CompletedRequest, NewCapturedRequest, NewUnknownRequest, RecordKind, RequestOutcome,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::api_error;
use crate::AppState;

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Sends tunnel hosts to [`forward`], everything else to the relay routes
pub async fn route_by_host(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let subdomain = request_host(&request)
        .and_then(|host| state.config.subdomain_for_host(&host));

    match subdomain {
        Some(subdomain) => forward(state, subdomain, request).await,
        None => next.run(request).await,
    }
}

/// Forward one public request through the subdomain's transport
pub async fn forward(state: Arc<AppState>, subdomain: String, request: Request) -> Response {
    let client_ip = client_ip(&request);
    let host = request_host(&request);
    let (parts, body) = request.into_parts();

    let method = parts.method.to_string();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = forwardable_headers(&parts.headers);

    let Some(transport) = state.registry.lookup(&subdomain) else {
        debug!("No tunnel for {} ({} {})", subdomain, method, path);
        record_unknown(
            &state,
            NewUnknownRequest {
                id: Uuid::new_v4().to_string(),
                subdomain: subdomain.clone(),
                client_ip,
                method,
                path,
                host,
                headers,
                created_at: Utc::now(),
            },
        );
        return api_error(
            StatusCode::NOT_FOUND,
            format!("Tunnel '{}' not found", subdomain),
            "TUNNEL_NOT_FOUND",
        )
        .into_response();
    };

    let body = match body::to_bytes(body, state.config.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Rejected body for {}: {}", subdomain, e);
            return api_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "Request body exceeds {} bytes or could not be read",
                    state.config.max_body_size
                ),
                "BODY_TOO_LARGE",
            )
            .into_response();
        }
    };
    let body = (!body.is_empty()).then(|| body.to_vec());

    let correlator = state.registry.correlator().clone();
    let request_id = correlator.begin(InboundRequest {
        subdomain: subdomain.clone(),
        session_id: transport.session_id(),
        client_ip: client_ip.clone(),
        method: method.clone(),
        path: path.clone(),
        headers: headers.clone(),
        body: body.clone(),
    });
    let _guard = PendingGuard {
        correlator: &correlator,
        request_id,
    };

    let completion_tx = record_request(
        &state,
        NewCapturedRequest {
            id: request_id.to_string(),
            subdomain: subdomain.clone(),
            client_ip,
            method,
            path,
            host,
            headers,
            body,
            created_at: correlator.created_at(request_id).unwrap_or_else(Utc::now),
        },
    );

    let result = transport.deliver(request_id).await;

    let (completion, response) = match result {
        Ok(response) => (
            CompletedRequest {
                outcome: RequestOutcome::Fulfilled,
                status: Some(response.status),
                headers: response.headers.clone(),
                body: response.body.clone(),
                responded_at: Utc::now(),
            },
            into_http_response(response),
        ),
        Err(e) => {
            let (outcome, status, code) = match e {
                TransportError::Timeout => (
                    RequestOutcome::TimedOut,
                    StatusCode::GATEWAY_TIMEOUT,
                    "TUNNEL_TIMEOUT",
                ),
                TransportError::Disconnected | TransportError::Correlation(_) => (
                    RequestOutcome::Disconnected,
                    StatusCode::BAD_GATEWAY,
                    "TUNNEL_DISCONNECTED",
                ),
            };
            debug!("Request {} for {} failed: {}", request_id, subdomain, e);
            (
                CompletedRequest {
                    outcome,
                    status: None,
                    headers: Vec::new(),
                    body: None,
                    responded_at: Utc::now(),
                },
                api_error(status, e.to_string(), code).into_response(),
            )
        }
    };

    // The record task may have failed already; the caller is answered anyway
    let _ = completion_tx.send(completion);

    response
}

/// Write the record for a forwarded request off the request path.
///
/// The row is created first, then handed to enrichment, then completed with
/// whatever is sent on the returned channel. A dropped sender (the public
/// caller went away) leaves the row without an outcome.
fn record_request(
    state: &Arc<AppState>,
    request: NewCapturedRequest,
) -> oneshot::Sender<CompletedRequest> {
    let (completion_tx, completion_rx) = oneshot::channel();
    let store = state.store.clone();
    let enrichment = state.enrichment.clone();

    tokio::spawn(async move {
        let id = request.id.clone();
        let client_ip = request.client_ip.clone();

        if let Err(e) = store.create_request(request).await {
            warn!("Failed to record request {}: {}", id, e);
            return;
        }
        if let Some(queue) = enrichment {
            queue.submit(&id, &client_ip, RecordKind::KnownRequest);
        }

        let Ok(completion) = completion_rx.await else {
            debug!("Request {} abandoned before completion", id);
            return;
        };
        if let Err(e) = store.complete_request(&id, completion).await {
            warn!("Failed to complete record {}: {}", id, e);
        }
    });

    completion_tx
}

/// Drops the pending entry when the public caller goes away mid-flight
struct PendingGuard<'a> {
    correlator: &'a RequestCorrelator,
    request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.abandon(self.request_id);
    }
}

fn record_unknown(state: &Arc<AppState>, request: NewUnknownRequest) {
    let store = state.store.clone();
    let enrichment = state.enrichment.clone();

    tokio::spawn(async move {
        let id = request.id.clone();
        let client_ip = request.client_ip.clone();

        if let Err(e) = store.create_unknown_request(request).await {
            warn!("Failed to record unknown request {}: {}", id, e);
            return;
        }
        if let Some(queue) = enrichment {
            queue.submit(&id, &client_ip, RecordKind::UnknownRequest);
        }
    });
}

fn request_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| request.uri().host())
        .map(str::to_string)
}

/// First `X-Forwarded-For` hop, else the peer address
fn client_ip(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty());

    forwarded
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn into_http_response(forwarded: ForwardResponse) -> Response {
    let status = StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut response = Response::new(Body::from(forwarded.body.unwrap_or_default()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in forwarded.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!("Dropping invalid response header {}", name),
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwardable_headers_skip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("host", HeaderValue::from_static("abc.burrow.dev"));

        let forwarded = forwardable_headers(&headers);
        let names: Vec<&str> = forwarded.iter().map(|(n, _)| n.as_str()).collect();

        assert!(names.contains(&"accept"));
        assert!(names.contains(&"host"));
        assert!(!names.contains(&"connection"));
        assert!(!names.contains(&"transfer-encoding"));
    }

    #[test]
    fn test_into_http_response() {
        let forwarded = ForwardResponse::new(RequestId::new(), 201)
            .with_header("content-type", "text/plain")
            .with_header("Content-Length", "999")
            .with_header("bad header", "x")
            .with_body("created");

        let response = into_http_response(forwarded);

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.headers().len(), 1);
    }

    #[test]
    fn test_invalid_status_is_bad_gateway() {
        let response = into_http_response(ForwardResponse::new(RequestId::new(), 42));
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request), "203.0.113.9");

        let mut request = Request::builder().body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 4], 5555))));
        assert_eq!(client_ip(&request), "198.51.100.4");

        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&request), "unknown");
    }
}
