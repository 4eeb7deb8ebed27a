//! Metadata lookup backends

use async_trait::async_trait;
use burrow_relay_db::Enrichment;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use crate::EnrichmentError;

/// Resolves an IP address to enrichment metadata
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, client_ip: &str) -> Result<Enrichment, EnrichmentError>;
}

/// Geolocation over an ip-api.com compatible JSON endpoint.
///
/// `url_template` contains `{ip}`, e.g.
/// `http://ip-api.com/json/{ip}?fields=status,message,country,regionName,city,lat,lon,isp`.
pub struct HttpGeoLookup {
    client: reqwest::Client,
    url_template: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    region_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    isp: Option<String>,
}

impl HttpGeoLookup {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, EnrichmentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EnrichmentError::Lookup(e.to_string()))?;

        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }
}

#[async_trait]
impl MetadataLookup for HttpGeoLookup {
    async fn lookup(&self, client_ip: &str) -> Result<Enrichment, EnrichmentError> {
        check_routable(client_ip)?;

        let url = self.url_template.replace("{ip}", client_ip);
        debug!("Looking up {}", client_ip);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                EnrichmentError::Timeout
            } else {
                EnrichmentError::Lookup(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(EnrichmentError::Lookup(format!(
                "lookup returned {}",
                response.status()
            )));
        }

        let geo: GeoResponse = response
            .json()
            .await
            .map_err(|e| EnrichmentError::Lookup(e.to_string()))?;

        geo.into_enrichment()
    }
}

impl GeoResponse {
    fn into_enrichment(self) -> Result<Enrichment, EnrichmentError> {
        if self.status != "success" {
            return Err(EnrichmentError::Lookup(
                self.message.unwrap_or_else(|| self.status.clone()),
            ));
        }

        Ok(Enrichment {
            country: self.country,
            region: self.region_name,
            city: self.city,
            latitude: self.lat,
            longitude: self.lon,
            isp: self.isp,
        })
    }
}

/// Loopback, private and link-local addresses have no public location
fn check_routable(client_ip: &str) -> Result<(), EnrichmentError> {
    let ip: IpAddr = client_ip
        .parse()
        .map_err(|_| EnrichmentError::Unroutable(client_ip.to_string()))?;

    let private = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    };

    if private {
        Err(EnrichmentError::Unroutable(client_ip.to_string()))
    } else {
        Ok(())
    }
}
