//! HTTP surface of the burrow relay
//!
//! One listener serves three audiences, told apart by `Host` and path:
//! - public traffic for `<subdomain>.<public_domain>`, forwarded to tunnels
//! - tunnel clients: `/tunnel/connect`, `/tunnel/ws`, `/tunnel/poll`, `/tunnel/response`
//! - account holders: `/api/subdomains` with a bearer account token

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod proxy;

pub use config::{EnrichmentSettings, RelayConfig, DEFAULT_LOOKUP_URL};

use axum::{
    http::StatusCode,
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use burrow_auth::{Capability, CapabilityCheck, SessionTokens};
use burrow_control::TunnelRegistry;
use burrow_enrich::EnrichmentQueue;
use burrow_relay_db::RecordStore;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::middleware::CapabilityGuard;
use crate::models::api_error;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<TunnelRegistry>,
    pub session_tokens: SessionTokens,
    pub capability_check: Option<Arc<dyn CapabilityCheck>>,
    pub store: Arc<dyn RecordStore>,
    pub enrichment: Option<EnrichmentQueue>,
    pub config: RelayConfig,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Burrow Relay API",
        version = "0.1.0",
        description = "Tunnel registration, transports and subdomain management for the burrow relay"
    ),
    paths(
        handlers::health_check,
        handlers::connect,
        handlers::tunnel_socket,
        handlers::poll,
        handlers::respond,
        handlers::list_subdomains,
        handlers::release_subdomain,
    ),
    components(
        schemas(
            burrow_proto::ConnectRequest,
            burrow_proto::ConnectResponse,
            burrow_proto::ForwardRequest,
            burrow_proto::ForwardResponse,
            burrow_proto::TransportKind,
            models::ErrorResponse,
            models::ClaimStatus,
            models::SubdomainClaim,
            models::SubdomainList,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "tunnel", description = "Tunnel client registration and transports"),
        (name = "subdomains", description = "Subdomain management for account holders"),
        (name = "system", description = "System health endpoints")
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "session_token",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "account_token",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Relay HTTP server
pub struct RelayServer {
    state: Arc<AppState>,
}

impl RelayServer {
    pub fn new(
        config: RelayConfig,
        registry: Arc<TunnelRegistry>,
        capability_check: Option<Arc<dyn CapabilityCheck>>,
        store: Arc<dyn RecordStore>,
        enrichment: Option<EnrichmentQueue>,
    ) -> Self {
        let session_tokens =
            SessionTokens::new(config.session_secret.as_bytes(), config.session_token_ttl);

        let state = Arc::new(AppState {
            registry,
            session_tokens,
            capability_check,
            store,
            enrichment,
            config,
        });

        Self { state }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let state = self.state.clone();

        // No authentication
        let public_router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/tunnel/connect", post(handlers::connect))
            .route("/api/openapi.json", get(handlers::openapi_json))
            .with_state(state.clone());

        // Session token of the calling tunnel client
        let session_router = Router::new()
            .route("/tunnel/ws", get(handlers::tunnel_socket))
            .route("/tunnel/poll", get(handlers::poll))
            .route("/tunnel/response", post(handlers::respond))
            .route_layer(axum_middleware::from_fn_with_state(
                state.clone(),
                middleware::require_session,
            ))
            .with_state(state.clone());

        // Account token with a per-route capability
        let check = state.capability_check.clone();
        let account_router = Router::new()
            .route(
                "/api/subdomains",
                get(handlers::list_subdomains).route_layer(axum_middleware::from_fn_with_state(
                    CapabilityGuard::new(check.clone(), Capability::ListSubdomains),
                    middleware::require_capability,
                )),
            )
            .route(
                "/api/subdomains/{subdomain}",
                delete(handlers::release_subdomain).route_layer(
                    axum_middleware::from_fn_with_state(
                        CapabilityGuard::new(check, Capability::ReleaseSubdomain),
                        middleware::require_capability,
                    ),
                ),
            )
            .with_state(state.clone());

        Router::new()
            .merge(public_router)
            .merge(session_router)
            .merge(account_router)
            .fallback(not_found)
            .layer(axum_middleware::from_fn_with_state(
                state,
                proxy::route_by_host,
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// Every tunnel session is closed as soon as `shutdown` resolves, before
    /// in-flight HTTP requests are drained. Socket sessions and blocked polls
    /// end right away and their pending public requests fail.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = self.state.registry.clone();
        let shutdown = async move {
            shutdown.await;
            registry.shutdown();
        };

        let router = self.build_router();
        let addr = listener.local_addr()?;

        info!("Relay listening on {}", addr);
        info!(
            "Tunnels served at {}",
            self.state.config.public_url("<subdomain>")
        );
        info!("OpenAPI spec: http://{}/api/openapi.json", addr);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

async fn not_found() -> impl IntoResponse {
    api_error(StatusCode::NOT_FOUND, "Not Found", "NOT_FOUND")
}
