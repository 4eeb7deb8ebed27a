//! Record storage used by the public proxy and the enrichment pipeline

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::entities::{captured_request, unknown_request};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Which table an enrichment result lands on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A request forwarded through an active tunnel
    KnownRequest,
    /// A request for a subdomain nobody had claimed
    UnknownRequest,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::KnownRequest => write!(f, "known_request"),
            RecordKind::UnknownRequest => write!(f, "unknown_request"),
        }
    }
}

/// How a forwarded request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Fulfilled,
    TimedOut,
    Disconnected,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Fulfilled => "fulfilled",
            RequestOutcome::TimedOut => "timed_out",
            RequestOutcome::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCapturedRequest {
    pub id: String,
    pub subdomain: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompletedRequest {
    pub outcome: RequestOutcome,
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub responded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUnknownRequest {
    pub id: String,
    pub subdomain: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub headers: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
}

/// Geolocation metadata attached to a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
}

/// Simple create/update/read operations over request records
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_request(&self, request: NewCapturedRequest) -> Result<(), StoreError>;

    async fn complete_request(
        &self,
        id: &str,
        completion: CompletedRequest,
    ) -> Result<(), StoreError>;

    async fn create_unknown_request(&self, request: NewUnknownRequest)
        -> Result<(), StoreError>;

    async fn apply_enrichment(
        &self,
        kind: RecordKind,
        id: &str,
        enrichment: &Enrichment,
    ) -> Result<(), StoreError>;

    async fn get_request(&self, id: &str) -> Result<Option<captured_request::Model>, StoreError>;

    async fn get_unknown_request(
        &self,
        id: &str,
    ) -> Result<Option<unknown_request::Model>, StoreError>;
}

/// Database-backed record store
#[derive(Clone)]
pub struct DbRecordStore {
    db: Arc<DatabaseConnection>,
}

impl DbRecordStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }
}

fn encode_headers(headers: &[(String, String)]) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "[]".to_string())
}

#[async_trait]
impl RecordStore for DbRecordStore {
    async fn create_request(&self, request: NewCapturedRequest) -> Result<(), StoreError> {
        let model = captured_request::ActiveModel {
            id: Set(request.id),
            subdomain: Set(request.subdomain),
            client_ip: Set(request.client_ip),
            method: Set(request.method),
            path: Set(request.path),
            host: Set(request.host),
            headers: Set(encode_headers(&request.headers)),
            body: Set(request.body.map(|b| STANDARD.encode(b))),
            status: Set(None),
            response_headers: Set(None),
            response_body: Set(None),
            created_at: Set(request.created_at),
            responded_at: Set(None),
            latency_ms: Set(None),
            outcome: Set(None),
            country: Set(None),
            region: Set(None),
            city: Set(None),
            latitude: Set(None),
            longitude: Set(None),
            isp: Set(None),
            enriched_at: Set(None),
        };

        model.insert(self.db.as_ref()).await?;
        Ok(())
    }

    async fn complete_request(
        &self,
        id: &str,
        completion: CompletedRequest,
    ) -> Result<(), StoreError> {
        let found = captured_request::Entity::find_by_id(id.to_string())
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let latency_ms = (completion.responded_at - found.created_at)
            .num_milliseconds()
            .clamp(0, i32::MAX as i64) as i32;

        let mut active: captured_request::ActiveModel = found.into();
        active.outcome = Set(Some(completion.outcome.as_str().to_string()));
        active.status = Set(completion.status.map(i32::from));
        active.response_headers = Set(completion
            .status
            .map(|_| encode_headers(&completion.headers)));
        active.response_body = Set(completion.body.map(|b| STANDARD.encode(b)));
        active.responded_at = Set(Some(completion.responded_at));
        active.latency_ms = Set(Some(latency_ms));

        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    async fn create_unknown_request(
        &self,
        request: NewUnknownRequest,
    ) -> Result<(), StoreError> {
        let model = unknown_request::ActiveModel {
            id: Set(request.id),
            subdomain: Set(request.subdomain),
            client_ip: Set(request.client_ip),
            method: Set(request.method),
            path: Set(request.path),
            host: Set(request.host),
            headers: Set(encode_headers(&request.headers)),
            created_at: Set(request.created_at),
            country: Set(None),
            region: Set(None),
            city: Set(None),
            latitude: Set(None),
            longitude: Set(None),
            isp: Set(None),
            enriched_at: Set(None),
        };

        model.insert(self.db.as_ref()).await?;
        Ok(())
    }

    async fn apply_enrichment(
        &self,
        kind: RecordKind,
        id: &str,
        enrichment: &Enrichment,
    ) -> Result<(), StoreError> {
        let now = Utc::now();

        match kind {
            RecordKind::KnownRequest => {
                let found = captured_request::Entity::find_by_id(id.to_string())
                    .one(self.db.as_ref())
                    .await?
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

                let mut active: captured_request::ActiveModel = found.into();
                active.country = Set(enrichment.country.clone());
                active.region = Set(enrichment.region.clone());
                active.city = Set(enrichment.city.clone());
                active.latitude = Set(enrichment.latitude);
                active.longitude = Set(enrichment.longitude);
                active.isp = Set(enrichment.isp.clone());
                active.enriched_at = Set(Some(now));
                active.update(self.db.as_ref()).await?;
            }
            RecordKind::UnknownRequest => {
                let found = unknown_request::Entity::find_by_id(id.to_string())
                    .one(self.db.as_ref())
                    .await?
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

                let mut active: unknown_request::ActiveModel = found.into();
                active.country = Set(enrichment.country.clone());
                active.region = Set(enrichment.region.clone());
                active.city = Set(enrichment.city.clone());
                active.latitude = Set(enrichment.latitude);
                active.longitude = Set(enrichment.longitude);
                active.isp = Set(enrichment.isp.clone());
                active.enriched_at = Set(Some(now));
                active.update(self.db.as_ref()).await?;
            }
        }

        Ok(())
    }

    async fn get_request(&self, id: &str) -> Result<Option<captured_request::Model>, StoreError> {
        Ok(captured_request::Entity::find_by_id(id.to_string())
            .one(self.db.as_ref())
            .await?)
    }

    async fn get_unknown_request(
        &self,
        id: &str,
    ) -> Result<Option<unknown_request::Model>, StoreError> {
        Ok(unknown_request::Entity::find_by_id(id.to_string())
            .one(self.db.as_ref())
            .await?)
    }
}
