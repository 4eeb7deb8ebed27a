//! UnknownRequest entity for public requests to subdomains nobody has claimed

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "unknown_requests")]
pub struct Model {
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

    pub created_at: ChronoDateTimeUtc,

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
