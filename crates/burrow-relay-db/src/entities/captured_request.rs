//! CapturedRequest entity for public requests forwarded through a tunnel

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "captured_requests")]
pub struct Model {
    /// Request id shared with the tunnel frames
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub subdomain: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub host: Option<String>,

    /// JSON-encoded headers: Vec<(String, String)>
    #[sea_orm(column_type = "Text")]
    pub headers: String,

    /// Request body, base64
    #[sea_orm(column_type = "Text", nullable)]
    pub body: Option<String>,

    /// Response status code
    pub status: Option<i32>,

    /// JSON-encoded response headers
    #[sea_orm(column_type = "Text", nullable)]
    pub response_headers: Option<String>,

    /// Response body, base64
    #[sea_orm(column_type = "Text", nullable)]
    pub response_body: Option<String>,

    pub created_at: ChronoDateTimeUtc,
    pub responded_at: Option<ChronoDateTimeUtc>,

    /// Latency in milliseconds
    pub latency_ms: Option<i32>,

    /// "fulfilled", "timed_out" or "disconnected"; unset while in flight
    pub outcome: Option<String>,

    // Filled in by the enrichment pipeline
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
    pub enriched_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
