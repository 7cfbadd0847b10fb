//! DNS-01 record management.
//!
//! A [`DnsProvider`] publishes and withdraws the `_acme-challenge` TXT
//! record through the DNS host's API. [`PropagationCheck`] then polls a
//! public resolver until the record is visible, since the CA validates
//! against public DNS rather than the provider's API.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::error::AcmeError;

/// Cloudflare API v4 root.
pub const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

const CHALLENGE_TTL: u32 = 120;

/// Name of the TXT record validated for `host`.
pub fn challenge_record_name(host: &str) -> String {
    format!("_acme-challenge.{}", host.trim_end_matches('.'))
}

/// A TXT record created at the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub zone_id: String,
    pub record_id: String,
    pub name: String,
}

/// TXT record API of a DNS host.
#[async_trait]
pub trait DnsProvider: Send + Sync + fmt::Debug {
    /// Create a TXT record `name` with `value` in the zone holding `host`.
    async fn create_txt(&self, host: &str, name: &str, value: &str) -> Result<DnsRecord, AcmeError>;

    async fn delete_txt(&self, record: &DnsRecord) -> Result<(), AcmeError>;
}

// ============================================================================
// Cloudflare
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Identified {
    id: String,
}

impl<T> Envelope<T> {
    fn into_result(self, action: &str) -> Result<Option<T>, AcmeError> {
        if self.success {
            return Ok(self.result);
        }
        let errors = self
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ");
        Err(AcmeError::Dns(format!("{action}: {errors}")))
    }
}

/// Cloudflare DNS, authenticated with a scoped API token.
#[derive(Clone)]
pub struct CloudflareDns {
    client: reqwest::Client,
    token: String,
    api_base: String,
}

impl fmt::Debug for CloudflareDns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudflareDns")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl CloudflareDns {
    pub fn new(token: impl Into<String>) -> Result<Self, AcmeError> {
        Self::with_api_base(token, CLOUDFLARE_API)
    }

    /// Client against a different API root.
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Result<Self, AcmeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AcmeError::Dns(e.to_string()))?;
        Ok(Self {
            client,
            token: token.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn zone_id(&self, host: &str) -> Result<String, AcmeError> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let zone = psl::domain_str(&host)
            .ok_or_else(|| AcmeError::Dns(format!("no registrable domain for {host}")))?;

        let envelope: Envelope<Vec<Identified>> = self
            .client
            .get(format!("{}/zones", self.api_base))
            .query(&[("name", zone)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| AcmeError::Dns(e.to_string()))?
            .json()
            .await
            .map_err(|e| AcmeError::Dns(e.to_string()))?;

        envelope
            .into_result("zone lookup")?
            .and_then(|zones| zones.into_iter().next())
            .map(|zone| zone.id)
            .ok_or_else(|| AcmeError::Dns(format!("zone {zone} not found")))
    }
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    async fn create_txt(&self, host: &str, name: &str, value: &str) -> Result<DnsRecord, AcmeError> {
        let zone_id = self.zone_id(host).await?;
        let body = serde_json::json!({
            "type": "TXT",
            "name": name,
            "content": value,
            "ttl": CHALLENGE_TTL,
        });

        let envelope: Envelope<Identified> = self
            .client
            .post(format!("{}/zones/{zone_id}/dns_records", self.api_base))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AcmeError::Dns(e.to_string()))?
            .json()
            .await
            .map_err(|e| AcmeError::Dns(e.to_string()))?;

        let record = envelope
            .into_result("create TXT record")?
            .ok_or_else(|| AcmeError::Dns("create TXT record: empty result".to_string()))?;

        info!(name = %name, zone_id = %zone_id, "Created DNS-01 TXT record");
        Ok(DnsRecord {
            zone_id,
            record_id: record.id,
            name: name.to_string(),
        })
    }

    async fn delete_txt(&self, record: &DnsRecord) -> Result<(), AcmeError> {
        let envelope: Envelope<Identified> = self
            .client
            .delete(format!(
                "{}/zones/{}/dns_records/{}",
                self.api_base, record.zone_id, record.record_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| AcmeError::Dns(e.to_string()))?
            .json()
            .await
            .map_err(|e| AcmeError::Dns(e.to_string()))?;

        envelope.into_result("delete TXT record")?;
        debug!(name = %record.name, "Deleted DNS-01 TXT record");
        Ok(())
    }
}

// ============================================================================
// Propagation
// ============================================================================

/// Polls public DNS until a TXT value shows up.
#[derive(Clone)]
pub struct PropagationCheck {
    resolver: TokioAsyncResolver,
    attempts: u32,
    interval: Duration,
}

impl fmt::Debug for PropagationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagationCheck")
            .field("attempts", &self.attempts)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl PropagationCheck {
    /// Checker against Cloudflare's public resolvers, without caching.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        let mut options = ResolverOpts::default();
        options.cache_size = 0;
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), options),
            attempts,
            interval,
        }
    }

    /// Whether `value` became visible at `name` within the attempt budget.
    pub async fn wait_for(&self, name: &str, value: &str) -> bool {
        for attempt in 1..=self.attempts {
            match self.resolver.txt_lookup(name).await {
                Ok(lookup) => {
                    let found = lookup.iter().any(|txt| {
                        let data: Vec<u8> = txt.txt_data().iter().flat_map(|part| part.iter().copied()).collect();
                        data == value.as_bytes()
                    });
                    if found {
                        debug!(name = %name, attempt, "TXT record visible");
                        return true;
                    }
                }
                Err(e) => trace!(name = %name, attempt, error = %e, "TXT lookup failed"),
            }
            tokio::time::sleep(self.interval).await;
        }
        false
    }
}

impl Default for PropagationCheck {
    fn default() -> Self {
        Self::new(30, Duration::from_secs(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_record_name() {
        assert_eq!(challenge_record_name("chat.example.com"), "_acme-challenge.chat.example.com");
        assert_eq!(challenge_record_name("chat.example.com."), "_acme-challenge.chat.example.com");
    }

    async fn mock_zone(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/zones"))
            .and(query_param("name", "example.com"))
            .and(header("authorization", "Bearer cf-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errors": [],
                "result": [{ "id": "zone-1" }]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_create_and_delete_txt() {
        let server = MockServer::start().await;
        mock_zone(&server).await;

        Mock::given(method("POST"))
            .and(path("/zones/zone-1/dns_records"))
            .and(body_partial_json(serde_json::json!({
                "type": "TXT",
                "name": "_acme-challenge.chat.example.com",
                "content": "digest",
                "ttl": 120
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": { "id": "rec-9" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("DELETE"))
            .and(path("/zones/zone-1/dns_records/rec-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": { "id": "rec-9" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dns = CloudflareDns::with_api_base("cf-token", server.uri()).unwrap();
        let record = dns
            .create_txt("chat.example.com", "_acme-challenge.chat.example.com", "digest")
            .await
            .unwrap();
        assert_eq!(
            record,
            DnsRecord {
                zone_id: "zone-1".to_string(),
                record_id: "rec-9".to_string(),
                name: "_acme-challenge.chat.example.com".to_string(),
            }
        );

        dns.delete_txt(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_reported() {
        let server = MockServer::start().await;
        mock_zone(&server).await;

        Mock::given(method("POST"))
            .and(path("/zones/zone-1/dns_records"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "success": false,
                "errors": [{ "code": 10000, "message": "Authentication error" }],
                "result": null
            })))
            .mount(&server)
            .await;

        let dns = CloudflareDns::with_api_base("cf-token", server.uri()).unwrap();
        let err = dns
            .create_txt("chat.example.com", "_acme-challenge.chat.example.com", "digest")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Authentication error"), "{err}");
    }

    #[tokio::test]
    async fn test_unknown_zone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zones"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": []
            })))
            .mount(&server)
            .await;

        let dns = CloudflareDns::with_api_base("cf-token", server.uri()).unwrap();
        let err = dns.create_txt("chat.example.com", "n", "v").await.unwrap_err();
        assert!(err.to_string().contains("zone example.com not found"), "{err}");
    }
}
