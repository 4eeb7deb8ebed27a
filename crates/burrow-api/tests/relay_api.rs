//! Integration tests for the relay HTTP surface

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use burrow_api::{models::ErrorResponse, RelayConfig, RelayServer};
use burrow_auth::{encode_bytes, JwtClaims, JwtValidator, Keypair};
use burrow_control::{RequestCorrelator, TunnelRegistry};
use burrow_proto::{
    signing_payload, ConnectRequest, ConnectResponse, ForwardRequest, ForwardResponse, RequestId,
    TransportKind,
};
use burrow_auth::async_trait;
use burrow_relay_db::{
    connect,
    entities::{captured_request, unknown_request, UnknownRequest},
    migrate, CompletedRequest, DbRecordStore, Enrichment, NewCapturedRequest, NewUnknownRequest,
    RecordKind, RecordStore, StoreError,
};
use sea_orm::EntityTrait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tower::ServiceExt; // For `oneshot` method

const ACCOUNT_SECRET: &str = "account-secret";

fn test_config() -> RelayConfig {
    RelayConfig {
        public_domain: "burrow.test".to_string(),
        session_secret: "session-secret".to_string(),
        account_secret: Some(ACCOUNT_SECRET.to_string()),
        ..Default::default()
    }
}

async fn memory_store() -> DbRecordStore {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    migrate(&db).await.expect("Failed to run migrations");
    DbRecordStore::new(db)
}

/// Helper to create a relay over an in-memory database
async fn create_test_server(config: RelayConfig) -> (RelayServer, Arc<DbRecordStore>) {
    let store = Arc::new(memory_store().await);
    let server = create_server_with_store(config, store.clone());
    (server, store)
}

fn create_server_with_store(config: RelayConfig, store: Arc<dyn RecordStore>) -> RelayServer {
    let correlator = Arc::new(RequestCorrelator::new(config.request_timeout));
    let check = config.account_check();
    let mut registry = TunnelRegistry::new(correlator, config.registry_config());
    if let Some(check) = check.clone() {
        registry = registry.with_capability_check(check);
    }

    RelayServer::new(config, Arc::new(registry), check, store, None)
}

fn signed_connect(
    keypair: &Keypair,
    subdomain: &str,
    nonce: &str,
    transport: TransportKind,
) -> ConnectRequest {
    let timestamp = chrono::Utc::now().timestamp();
    ConnectRequest {
        subdomain: subdomain.to_string(),
        public_key: keypair.public_key_base64(),
        nonce: nonce.to_string(),
        timestamp,
        signature: encode_bytes(&keypair.sign(&signing_payload(nonce, timestamp))),
        transport,
        auth_token: None,
    }
}

fn account_token(user_id: &str, capabilities: &[&str]) -> String {
    let claims = JwtClaims::new(
        user_id.to_string(),
        "burrow-accounts".to_string(),
        "burrow-relay".to_string(),
        chrono::Duration::hours(1),
    )
    .with_user_id(user_id)
    .with_token_type("api")
    .with_capabilities(capabilities.iter().map(|c| c.to_string()).collect());

    JwtValidator::encode(ACCOUNT_SECRET.as_bytes(), &claims).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn bearer_request(method: &str, uri: &str, bearer: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header("authorization", format!("Bearer {}", bearer))
        .body(Body::empty())
        .unwrap()
}

fn public_request(host: &str, path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .method("GET")
        .header("host", host)
        .header("x-forwarded-for", "203.0.113.7")
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn register(app: &Router, request: &ConnectRequest) -> Response {
    app.clone()
        .oneshot(json_request(
            "POST",
            "/tunnel/connect",
            serde_json::to_value(request).unwrap(),
            None,
        ))
        .await
        .unwrap()
}

async fn register_ok(app: &Router, request: &ConnectRequest) -> ConnectResponse {
    let response = register(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn test_health_check() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"ok");
}

#[tokio::test]
async fn test_connect_success() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();
    let keypair = Keypair::generate();

    let connected = register_ok(
        &app,
        &signed_connect(&keypair, "abc", "n1", TransportKind::Polling),
    )
    .await;

    assert_eq!(connected.subdomain, "abc");
    assert_eq!(connected.public_url, "http://abc.burrow.test");
    assert_eq!(connected.transport, TransportKind::Polling);
    assert!(!connected.session_token.is_empty());
}

#[tokio::test]
async fn test_connect_rejections() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();
    let owner = Keypair::generate();
    let intruder = Keypair::generate();

    // Invalid subdomain
    let response = register(
        &app,
        &signed_connect(&owner, "Not_Valid", "n0", TransportKind::Polling),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("INVALID_SUBDOMAIN"));

    // Signature by a different key
    let mut forged = signed_connect(&intruder, "abc", "n1", TransportKind::Polling);
    forged.public_key = owner.public_key_base64();
    let response = register(&app, &forged).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("AUTH_FAILED"));

    // Stale timestamp
    let mut stale = signed_connect(&owner, "abc", "n2", TransportKind::Polling);
    stale.timestamp -= 3600;
    stale.signature = encode_bytes(&owner.sign(&stale.signing_payload()));
    let response = register(&app, &stale).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Claim, then replay the same nonce
    let claim = signed_connect(&owner, "abc", "n3", TransportKind::Polling);
    register_ok(&app, &claim).await;
    let response = register(&app, &claim).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("REPLAY_REJECTED"));

    // Another key wants the claimed subdomain
    let response = register(
        &app,
        &signed_connect(&intruder, "abc", "n4", TransportKind::Polling),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("SUBDOMAIN_CONFLICT"));
}

#[tokio::test]
async fn test_reconnect_supersedes_old_session() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();
    let keypair = Keypair::generate();

    let first = register_ok(
        &app,
        &signed_connect(&keypair, "abc", "n1", TransportKind::Polling),
    )
    .await;
    let second = register_ok(
        &app,
        &signed_connect(&keypair, "abc", "n2", TransportKind::Polling),
    )
    .await;

    let response = app
        .clone()
        .oneshot(bearer_request("GET", "/tunnel/poll?wait=0", &first.session_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("SESSION_SUPERSEDED"));

    let response = app
        .oneshot(bearer_request("GET", "/tunnel/poll?wait=0", &second.session_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_polling_round_trip() {
    let (server, store) = create_test_server(test_config()).await;
    let app = server.build_router();
    let keypair = Keypair::generate();

    let session = register_ok(
        &app,
        &signed_connect(&keypair, "abc", "n1", TransportKind::Polling),
    )
    .await;

    let caller = tokio::spawn({
        let app = app.clone();
        async move {
            app.oneshot(public_request("abc.burrow.test", "/hello?name=burrow"))
                .await
                .unwrap()
        }
    });

    let response = app
        .clone()
        .oneshot(bearer_request("GET", "/tunnel/poll?wait=5", &session.session_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let forwarded: ForwardRequest = body_json(response).await;
    assert_eq!(forwarded.method, "GET");
    assert_eq!(forwarded.path, "/hello?name=burrow");

    let answer = ForwardResponse::new(forwarded.request_id, 200)
        .with_header("content-type", "text/plain")
        .with_body("hello");
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tunnel/response",
            serde_json::to_value(&answer).unwrap(),
            Some(&session.session_token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let public = caller.await.unwrap();
    assert_eq!(public.status(), StatusCode::OK);
    assert_eq!(public.headers()["content-type"], "text/plain");
    assert_eq!(body_bytes(public).await, b"hello");

    // The record is completed in the background
    let id = forwarded.request_id.to_string();
    let mut record = None;
    for _ in 0..50 {
        record = store.get_request(&id).await.unwrap();
        if record.as_ref().and_then(|r| r.outcome.as_ref()).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = record.expect("request should be recorded");
    assert_eq!(record.subdomain, "abc");
    assert_eq!(record.client_ip, "203.0.113.7");
    assert_eq!(record.status, Some(200));
    assert_eq!(record.outcome.as_deref(), Some("fulfilled"));
}

#[tokio::test]
async fn test_response_for_unknown_request_is_not_found() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();
    let keypair = Keypair::generate();

    let session = register_ok(
        &app,
        &signed_connect(&keypair, "abc", "n1", TransportKind::Polling),
    )
    .await;

    let answer = ForwardResponse::new(RequestId::new(), 200);
    let response = app
        .oneshot(json_request(
            "POST",
            "/tunnel/response",
            serde_json::to_value(&answer).unwrap(),
            Some(&session.session_token),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("REQUEST_NOT_FOUND"));
}

#[tokio::test]
async fn test_tunnel_endpoints_require_session_token() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/tunnel/poll").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("MISSING_AUTH"));

    // An account token is not a session token
    let response = app
        .oneshot(bearer_request(
            "GET",
            "/tunnel/poll",
            &account_token("user-1", &[]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("INVALID_TOKEN"));
}

#[tokio::test]
async fn test_unknown_subdomain_is_recorded() {
    let (server, store) = create_test_server(test_config()).await;
    let app = server.build_router();

    let response = app
        .oneshot(public_request("nobody.burrow.test", "/favicon.ico"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("TUNNEL_NOT_FOUND"));

    let mut rows = Vec::new();
    for _ in 0..50 {
        rows = UnknownRequest::find().all(store.connection()).await.unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].subdomain, "nobody");
    assert_eq!(rows[0].path, "/favicon.ico");
    assert_eq!(rows[0].client_ip, "203.0.113.7");
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let config = RelayConfig {
        request_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (server, _) = create_test_server(config).await;
    let app = server.build_router();
    let keypair = Keypair::generate();

    register_ok(
        &app,
        &signed_connect(&keypair, "abc", "n1", TransportKind::Polling),
    )
    .await;

    let response = app
        .oneshot(public_request("abc.burrow.test", "/slow"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("TUNNEL_TIMEOUT"));
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let config = RelayConfig {
        max_body_size: 16,
        ..test_config()
    };
    let (server, _) = create_test_server(config).await;
    let app = server.build_router();
    let keypair = Keypair::generate();

    register_ok(
        &app,
        &signed_connect(&keypair, "abc", "n1", TransportKind::Polling),
    )
    .await;

    let request = Request::builder()
        .uri("/upload")
        .method("POST")
        .header("host", "abc.burrow.test")
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_subdomain_management() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();
    let keypair = Keypair::generate();
    let owner_token = account_token("user-1", &[]);

    let mut claim = signed_connect(&keypair, "owned", "n1", TransportKind::Polling);
    claim.auth_token = Some(owner_token.clone());
    register_ok(&app, &claim).await;

    // Unowned claims never show up in a listing
    register_ok(
        &app,
        &signed_connect(&Keypair::generate(), "anon", "n1", TransportKind::Polling),
    )
    .await;

    let response = app
        .clone()
        .oneshot(bearer_request("GET", "/api/subdomains", &owner_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let listing: serde_json::Value = body_json(response).await;
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["subdomains"][0]["subdomain"], "owned");
    assert_eq!(listing["subdomains"][0]["status"], "active");
    assert_eq!(
        listing["subdomains"][0]["public_url"],
        json!("http://owned.burrow.test")
    );

    // Someone else's token
    let response = app
        .clone()
        .oneshot(bearer_request(
            "DELETE",
            "/api/subdomains/owned",
            &account_token("user-2", &[]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Owner without the release capability
    let response = app
        .clone()
        .oneshot(bearer_request(
            "DELETE",
            "/api/subdomains/owned",
            &account_token("user-1", &["list_subdomains"]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("MISSING_CAPABILITY"));

    let response = app
        .clone()
        .oneshot(bearer_request("DELETE", "/api/subdomains/owned", &owner_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(server.state().registry.lookup("owned").is_none());

    let response = app
        .oneshot(bearer_request("DELETE", "/api/subdomains/owned", &owner_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_subdomain_listing_requires_account_token() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/subdomains").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(bearer_request("GET", "/api/subdomains", "not-a-jwt"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error: ErrorResponse = body_json(response).await;
    assert_eq!(error.code.as_deref(), Some("INVALID_TOKEN"));
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let doc: serde_json::Value = body_json(response).await;
    assert!(doc["paths"]["/tunnel/connect"].is_object());
}

#[tokio::test]
async fn test_unknown_path_on_relay_host() {
    let (server, _) = create_test_server(test_config()).await;
    let app = server.build_router();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/nope")
                .header("host", "burrow.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Record store whose inserts wait for a permit, logging every write
struct GatedStore {
    inner: DbRecordStore,
    gate: Semaphore,
    writes: Mutex<Vec<&'static str>>,
}

impl GatedStore {
    fn log(&self, write: &'static str) {
        self.writes.lock().unwrap().push(write);
    }

    fn writes(&self) -> Vec<&'static str> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for GatedStore {
    async fn create_request(&self, request: NewCapturedRequest) -> Result<(), StoreError> {
        let _permit = self.gate.acquire().await.unwrap();
        self.log("create");
        self.inner.create_request(request).await
    }

    async fn complete_request(
        &self,
        id: &str,
        completion: CompletedRequest,
    ) -> Result<(), StoreError> {
        self.log("complete");
        self.inner.complete_request(id, completion).await
    }

    async fn create_unknown_request(&self, request: NewUnknownRequest) -> Result<(), StoreError> {
        self.inner.create_unknown_request(request).await
    }

    async fn apply_enrichment(
        &self,
        kind: RecordKind,
        id: &str,
        enrichment: &Enrichment,
    ) -> Result<(), StoreError> {
        self.inner.apply_enrichment(kind, id, enrichment).await
    }

    async fn get_request(&self, id: &str) -> Result<Option<captured_request::Model>, StoreError> {
        self.inner.get_request(id).await
    }

    async fn get_unknown_request(
        &self,
        id: &str,
    ) -> Result<Option<unknown_request::Model>, StoreError> {
        self.inner.get_unknown_request(id).await
    }
}

#[tokio::test]
async fn test_slow_store_does_not_delay_forwarding() {
    let store = Arc::new(GatedStore {
        inner: memory_store().await,
        gate: Semaphore::new(0),
        writes: Mutex::new(Vec::new()),
    });
    let server = create_server_with_store(test_config(), store.clone());
    let app = server.build_router();
    let keypair = Keypair::generate();

    let session = register_ok(
        &app,
        &signed_connect(&keypair, "abc", "n1", TransportKind::Polling),
    )
    .await;

    let caller = tokio::spawn({
        let app = app.clone();
        async move {
            app.oneshot(public_request("abc.burrow.test", "/slow-db"))
                .await
                .unwrap()
        }
    });

    let response = app
        .clone()
        .oneshot(bearer_request("GET", "/tunnel/poll?wait=5", &session.session_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let forwarded: ForwardRequest = body_json(response).await;

    let answer = ForwardResponse::new(forwarded.request_id, 200).with_body("fast");
    app.clone()
        .oneshot(json_request(
            "POST",
            "/tunnel/response",
            serde_json::to_value(&answer).unwrap(),
            Some(&session.session_token),
        ))
        .await
        .unwrap();

    // Answered while the insert is still blocked
    let public = tokio::time::timeout(Duration::from_secs(5), caller)
        .await
        .expect("public request blocked on the record store")
        .unwrap();
    assert_eq!(public.status(), StatusCode::OK);
    assert_eq!(body_bytes(public).await, b"fast");
    assert!(store.writes().is_empty());

    // Once the insert goes through, the completion follows it
    store.gate.add_permits(1);
    let id = forwarded.request_id.to_string();
    let mut record = None;
    for _ in 0..50 {
        record = store.get_request(&id).await.unwrap();
        if record.as_ref().and_then(|r| r.outcome.as_ref()).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(record.unwrap().outcome.as_deref(), Some("fulfilled"));
    assert_eq!(store.writes(), vec!["create", "complete"]);
}
