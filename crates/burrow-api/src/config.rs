//! Relay configuration

use burrow_auth::{CapabilityCheck, JwtCapabilityCheck};
use burrow_control::RegistryConfig;
use burrow_enrich::EnrichmentConfig;
use burrow_proto::{DEFAULT_REQUEST_TIMEOUT_SECS, ENRICHMENT_DEDUP_WINDOW_SECS, MAX_POLL_WAIT_SECS};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default geolocation endpoint (ip-api.com JSON format)
pub const DEFAULT_LOOKUP_URL: &str =
    "http://ip-api.com/json/{ip}?fields=status,message,country,regionName,city,lat,lon,isp";

/// Everything the relay needs to run
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the HTTP listener binds to
    pub bind_addr: SocketAddr,
    /// Tunnels are served at `<subdomain>.<public_domain>`
    pub public_domain: String,
    /// Scheme used when building public URLs
    pub public_scheme: String,
    /// Deadline for a forwarded request, measured from arrival
    pub request_timeout: Duration,
    /// Accepted clock skew for handshake timestamps
    pub handshake_window: Duration,
    /// Upper bound for a single `GET /tunnel/poll`
    pub poll_max_wait: Duration,
    /// Expected interval between polls
    pub poll_interval: Duration,
    /// Missed poll intervals before a polling session is reaped
    pub poll_miss_limit: u32,
    /// Time a socket session may stay pending before it is released
    pub pending_attach_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// How often expired requests and dead sessions are swept
    pub sweep_interval: Duration,
    pub session_token_ttl: Duration,
    /// HS256 secret for session tokens issued by this relay
    pub session_secret: String,
    /// HS256 secret shared with the account service. Without it account
    /// tokens are rejected.
    pub account_secret: Option<String>,
    /// Largest public request body forwarded through a tunnel
    pub max_body_size: usize,
    /// Outbound frame queue per session
    pub queue_capacity: usize,
    pub enrichment: EnrichmentSettings,
}

/// Background metadata enrichment
#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    pub enabled: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    pub dedup_window: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub lookup_timeout: Duration,
    /// Lookup URL, `{ip}` is replaced by the client address
    pub lookup_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_domain: "localhost".to_string(),
            public_scheme: "http".to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            handshake_window: Duration::from_secs(30),
            poll_max_wait: Duration::from_secs(MAX_POLL_WAIT_SECS),
            poll_interval: Duration::from_secs(30),
            poll_miss_limit: 3,
            pending_attach_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(1),
            session_token_ttl: Duration::from_secs(24 * 60 * 60),
            session_secret: String::new(),
            account_secret: None,
            max_body_size: 10 * 1024 * 1024,
            queue_capacity: 256,
            enrichment: EnrichmentSettings::default(),
        }
    }
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 4,
            queue_capacity: 1024,
            dedup_window: Duration::from_secs(ENRICHMENT_DEDUP_WINDOW_SECS),
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            lookup_timeout: Duration::from_secs(5),
            lookup_url: DEFAULT_LOOKUP_URL.to_string(),
        }
    }
}

impl RelayConfig {
    /// Silence after which a polling session counts as gone
    pub fn poll_idle_limit(&self) -> Duration {
        self.poll_interval * self.poll_miss_limit
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            handshake_window_secs: self.handshake_window.as_secs() as i64,
            pending_attach_timeout: self.pending_attach_timeout,
            poll_idle_limit: self.poll_idle_limit(),
            poll_max_wait: self.poll_max_wait,
            heartbeat_interval: self.heartbeat_interval,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn enrichment_config(&self) -> EnrichmentConfig {
        EnrichmentConfig {
            workers: self.enrichment.workers,
            queue_capacity: self.enrichment.queue_capacity,
            dedup_window: self.enrichment.dedup_window,
            max_attempts: self.enrichment.max_attempts,
            base_backoff: self.enrichment.base_backoff,
        }
    }

    /// Account token check backed by the shared secret, if configured
    pub fn account_check(&self) -> Option<Arc<dyn CapabilityCheck>> {
        self.account_secret.as_ref().map(|secret| {
            Arc::new(JwtCapabilityCheck::new(secret.as_bytes())) as Arc<dyn CapabilityCheck>
        })
    }

    /// Public URL of a tunnel
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("{}://{}.{}", self.public_scheme, subdomain, self.public_domain)
    }

    /// Tunnel subdomain addressed by a `Host` value, if any.
    ///
    /// The port is ignored. The apex domain and foreign hosts yield `None`.
    pub fn subdomain_for_host(&self, host: &str) -> Option<String> {
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        let suffix = format!(".{}", self.public_domain.to_ascii_lowercase());

        host.strip_suffix(&suffix)
            .filter(|label| !label.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_idle_limit(), Duration::from_secs(90));
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
        assert_eq!(config.registry_config().handshake_window_secs, 30);
        assert_eq!(config.enrichment_config().workers, 4);
    }

    #[test]
    fn test_subdomain_for_host() {
        let config = RelayConfig {
            public_domain: "burrow.dev".to_string(),
            ..Default::default()
        };

        assert_eq!(config.subdomain_for_host("abc.burrow.dev"), Some("abc".to_string()));
        assert_eq!(
            config.subdomain_for_host("ABC.Burrow.dev:8080"),
            Some("abc".to_string())
        );
        assert_eq!(config.subdomain_for_host("burrow.dev"), None);
        assert_eq!(config.subdomain_for_host("burrow.dev:8080"), None);
        assert_eq!(config.subdomain_for_host("abc.example.com"), None);
        assert_eq!(config.subdomain_for_host(".burrow.dev"), None);
    }

    #[test]
    fn test_public_url() {
        let config = RelayConfig {
            public_domain: "burrow.dev".to_string(),
            public_scheme: "https".to_string(),
            ..Default::default()
        };
        assert_eq!(config.public_url("abc"), "https://abc.burrow.dev");
    }
}
