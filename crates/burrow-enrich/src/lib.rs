//! Best-effort request enrichment
//!
//! Public requests are annotated with geolocation metadata out of band. Jobs
//! go through a bounded queue, coalesce by request id, and are retried with
//! exponential backoff before being dropped. Nothing here ever gates the
//! response path.

pub mod lookup;
pub mod queue;

pub use lookup::{HttpGeoLookup, MetadataLookup};
pub use queue::{EnrichmentConfig, EnrichmentJob, EnrichmentQueue};

pub use burrow_relay_db::{Enrichment, RecordKind};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("Lookup failed: {0}")]
    Lookup(String),

    #[error("Lookup timed out")]
    Timeout,

    /// Retrying cannot help (private or malformed address)
    #[error("Address cannot be enriched: {0}")]
    Unroutable(String),

    #[error("Store error: {0}")]
    Store(#[from] burrow_relay_db::StoreError),
}

impl EnrichmentError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EnrichmentError::Unroutable(_))
    }
}
