//! Certificate manager: the in-process cache in front of the durable store.
//!
//! Lookups go memory, then disk, then the issuer. At most one issuance per
//! host is in flight; concurrent callers for the same host await the same
//! shared future and observe the same certificate or the same failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use rustls::sign::CertifiedKey;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::client::{IssuedCertificate, Issuer};
use super::error::{AcmeError, IssuanceFailure};
use super::storage::{CertificateMeta, CertificateStore, StoredCertificate};
use crate::tls::{certified_key_from_pem, CertificateSource, TlsError};

/// A parsed certificate ready for handshakes.
pub struct CertificateRecord {
    pub cert_pem: String,
    pub key_pem: String,
    pub expires: DateTime<Utc>,
    pub certified: Arc<CertifiedKey>,
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("expires", &self.expires)
            .finish_non_exhaustive()
    }
}

fn not_after(cert_pem: &str) -> Result<DateTime<Utc>, AcmeError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| AcmeError::Certificate(format!("PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| AcmeError::Certificate(format!("X.509: {e}")))?;
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| AcmeError::Certificate("expiry out of range".to_string()))
}

impl CertificateRecord {
    pub fn from_pem(cert_pem: String, key_pem: String) -> Result<Self, AcmeError> {
        let expires = not_after(&cert_pem)?;
        let certified = certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
            .map_err(|e| AcmeError::Certificate(e.to_string()))?;
        Ok(Self {
            cert_pem,
            key_pem,
            expires,
            certified: Arc::new(certified),
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires <= Utc::now()
    }

    /// Whether the certificate expires within `window` from now.
    pub fn expires_within(&self, window: chrono::Duration) -> bool {
        self.expires - Utc::now() <= window
    }

    pub fn to_stored(&self, host: &str) -> StoredCertificate {
        StoredCertificate {
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.clone(),
            meta: CertificateMeta {
                host: host.to_string(),
                expires: self.expires,
                issued: Utc::now(),
            },
        }
    }
}

type Issuance = Shared<BoxFuture<'static, Result<Arc<CertificateRecord>, IssuanceFailure>>>;

struct ManagerInner {
    issuer: Arc<dyn Issuer>,
    store: CertificateStore,
    allowed: HashSet<String>,
    records: DashMap<String, Arc<CertificateRecord>>,
    in_flight: DashMap<String, Issuance>,
    renew_before: chrono::Duration,
}

/// Per-host certificate cache restricted to a declared host list.
#[derive(Clone)]
pub struct CertManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for CertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertManager")
            .field("hosts", &self.hosts())
            .field("cached", &self.inner.records.len())
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

impl CertManager {
    pub fn new(
        issuer: Arc<dyn Issuer>,
        store: CertificateStore,
        hosts: &[String],
        renew_before_days: u32,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                issuer,
                store,
                allowed: hosts.iter().map(|h| normalize(h)).collect(),
                records: DashMap::new(),
                in_flight: DashMap::new(),
                renew_before: chrono::Duration::days(i64::from(renew_before_days)),
            }),
        }
    }

    /// Declared hosts, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.inner.allowed.iter().cloned().collect();
        hosts.sort();
        hosts
    }

    fn check_allowed(&self, host: &str) -> Result<(), IssuanceFailure> {
        if self.inner.allowed.contains(host) {
            Ok(())
        } else {
            Err(IssuanceFailure::new(host, "host is not in the declared host list"))
        }
    }

    /// Certificate for `host`, issuing one if nothing usable is cached or stored.
    pub async fn get(&self, host: &str) -> Result<Arc<CertificateRecord>, IssuanceFailure> {
        let host = normalize(host);
        self.check_allowed(&host)?;

        if let Some(record) = self.cached(&host) {
            return Ok(record);
        }
        if let Some(record) = self.load_stored(&host) {
            return Ok(record);
        }
        self.issuance(&host, false).await
    }

    /// Issue a fresh certificate even if a valid one is cached.
    pub async fn renew(&self, host: &str) -> Result<Arc<CertificateRecord>, IssuanceFailure> {
        let host = normalize(host);
        self.check_allowed(&host)?;
        self.issuance(&host, true).await
    }

    /// Whether `host` has no certificate, or one inside the renew window.
    pub fn needs_renewal(&self, host: &str) -> bool {
        let host = normalize(host);
        match self.cached(&host).or_else(|| self.load_stored(&host)) {
            Some(record) => record.expires_within(self.inner.renew_before),
            None => true,
        }
    }

    /// Whether a usable certificate for `host` is cached or stored.
    pub fn has_certificate(&self, host: &str) -> bool {
        let host = normalize(host);
        self.cached(&host).or_else(|| self.load_stored(&host)).is_some()
    }

    /// Obtain certificates for every declared host. Returns the failures.
    pub async fn issue_all(&self) -> Vec<IssuanceFailure> {
        let hosts = self.hosts();
        info!(hosts = ?hosts, "Issuing certificates for declared hosts");
        let results = future::join_all(hosts.iter().map(|host| self.get(host))).await;
        results.into_iter().filter_map(Result::err).collect()
    }

    fn cached(&self, host: &str) -> Option<Arc<CertificateRecord>> {
        self.inner
            .records
            .get(host)
            .map(|entry| entry.value().clone())
            .filter(|record| !record.is_expired())
    }

    fn load_stored(&self, host: &str) -> Option<Arc<CertificateRecord>> {
        let stored = match self.inner.store.load(host) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!(host = %host, error = %e, "Failed to read stored certificate");
                return None;
            }
        };
        match CertificateRecord::from_pem(stored.cert_pem, stored.key_pem) {
            Ok(record) if !record.is_expired() => {
                debug!(host = %host, expires = %record.expires, "Using stored certificate");
                let record = Arc::new(record);
                self.inner.records.insert(host.to_string(), record.clone());
                Some(record)
            }
            Ok(_) => {
                debug!(host = %host, "Stored certificate has expired");
                None
            }
            Err(e) => {
                warn!(host = %host, error = %e, "Stored certificate is unusable");
                None
            }
        }
    }

    /// Join the in-flight issuance for `host`, or start one.
    fn issuance(&self, host: &str, force: bool) -> Issuance {
        match self.inner.in_flight.entry(host.to_string()) {
            Entry::Occupied(entry) => {
                debug!(host = %host, "Joining in-flight issuance");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // An issuance may have finished between the cache miss and here.
                if !force {
                    if let Some(record) = self.cached(host) {
                        return future::ready(Ok(record)).boxed().shared();
                    }
                }

                let manager = self.clone();
                let host = host.to_string();
                let issuance = async move {
                    let result = manager.obtain(&host).await;
                    match &result {
                        Ok(record) => {
                            manager.inner.records.insert(host.clone(), record.clone());
                        }
                        Err(failure) => warn!(host = %host, error = %failure, "Certificate issuance failed"),
                    }
                    manager.inner.in_flight.remove(&host);
                    result
                }
                .boxed()
                .shared();

                entry.insert(issuance.clone());
                issuance
            }
        }
    }

    async fn obtain(&self, host: &str) -> Result<Arc<CertificateRecord>, IssuanceFailure> {
        info!(host = %host, "Requesting certificate");
        let failure = |e: AcmeError| IssuanceFailure::new(host, e.to_string());

        let IssuedCertificate { cert_pem, key_pem } =
            self.inner.issuer.issue(host).await.map_err(failure)?;
        let record = CertificateRecord::from_pem(cert_pem, key_pem).map_err(failure)?;

        if let Err(e) = self.inner.store.save(&record.to_stored(host)) {
            warn!(host = %host, error = %e, "Issued certificate was not persisted");
        }
        info!(host = %host, expires = %record.expires, "Certificate issued");
        Ok(Arc::new(record))
    }
}

#[async_trait]
impl CertificateSource for CertManager {
    async fn certificate_for(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, TlsError> {
        let host = server_name.ok_or_else(|| TlsError::Unavailable {
            host: "<none>".to_string(),
            message: "client sent no server name".to_string(),
        })?;
        self.get(host)
            .await
            .map(|record| record.certified.clone())
            .map_err(|failure| TlsError::Unavailable {
                host: failure.host,
                message: failure.message,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct FakeIssuer {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
        /// Validity in days; None means rcgen's far-future default.
        valid_days: Option<i64>,
    }

    #[async_trait]
    impl Issuer for FakeIssuer {
        async fn issue(&self, host: &str) -> Result<IssuedCertificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AcmeError::Challenge {
                    host: host.to_string(),
                    message: "rate limited".to_string(),
                });
            }

            let key = rcgen::KeyPair::generate().unwrap();
            let mut params = rcgen::CertificateParams::new(vec![host.to_string()]).unwrap();
            if let Some(days) = self.valid_days {
                let when = Utc::now() + chrono::Duration::days(days);
                params.not_after = rcgen::date_time_ymd(when.year(), when.month() as u8, when.day() as u8);
            }
            let cert = params.self_signed(&key).unwrap();
            Ok(IssuedCertificate {
                cert_pem: cert.pem(),
                key_pem: key.serialize_pem(),
            })
        }
    }

    fn manager(dir: &TempDir, issuer: Arc<FakeIssuer>) -> CertManager {
        let store = CertificateStore::open(dir.path().join("acme")).unwrap();
        CertManager::new(
            issuer,
            store,
            &["chat.example.com".to_string(), "blog.example.com".to_string()],
            30,
        )
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_issuance() {
        let dir = TempDir::new().unwrap();
        let issuer = Arc::new(FakeIssuer {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let manager = manager(&dir, issuer.clone());

        let callers = (0..8).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get("chat.example.com").await })
        });
        let records: Vec<_> = future::join_all(callers)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert!(records.iter().all(|r| Arc::ptr_eq(r, &records[0])));

        // Served from memory afterwards.
        manager.get("CHAT.example.com.").await.unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let dir = TempDir::new().unwrap();
        let issuer = Arc::new(FakeIssuer {
            delay: Duration::from_millis(50),
            fail: true,
            ..Default::default()
        });
        let manager = manager(&dir, issuer.clone());

        let (a, b) = tokio::join!(manager.get("chat.example.com"), manager.get("chat.example.com"));
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert_eq!(a, b);
        assert_eq!(a.host, "chat.example.com");
        assert!(a.message.contains("rate limited"));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);

        // A later attempt retries.
        manager.get("chat.example.com").await.unwrap_err();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_undeclared_host_is_refused() {
        let dir = TempDir::new().unwrap();
        let issuer = Arc::new(FakeIssuer::default());
        let manager = manager(&dir, issuer.clone());

        let failure = manager.get("evil.example.net").await.unwrap_err();
        assert_eq!(failure.host, "evil.example.net");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);

        let err = manager.certificate_for(None).await.unwrap_err();
        assert!(matches!(err, TlsError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_certificates_survive_restart() {
        let dir = TempDir::new().unwrap();
        let first = Arc::new(FakeIssuer::default());
        manager(&dir, first.clone()).get("chat.example.com").await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);

        let second = Arc::new(FakeIssuer::default());
        let restarted = manager(&dir, second.clone());
        restarted.certificate_for(Some("chat.example.com")).await.unwrap();
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_renew_forces_issuance() {
        let dir = TempDir::new().unwrap();
        let issuer = Arc::new(FakeIssuer::default());
        let manager = manager(&dir, issuer.clone());

        let original = manager.get("chat.example.com").await.unwrap();
        let renewed = manager.renew("chat.example.com").await.unwrap();
        assert!(!Arc::ptr_eq(&original, &renewed));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);

        let current = manager.get("chat.example.com").await.unwrap();
        assert!(Arc::ptr_eq(&current, &renewed));
    }

    #[tokio::test]
    async fn test_needs_renewal() {
        let dir = TempDir::new().unwrap();
        let short = Arc::new(FakeIssuer {
            valid_days: Some(10),
            ..Default::default()
        });
        let short_lived = manager(&dir, short);

        assert!(short_lived.needs_renewal("chat.example.com"));
        short_lived.get("chat.example.com").await.unwrap();
        // Ten days left is inside the thirty day window.
        assert!(short_lived.needs_renewal("chat.example.com"));

        let other = TempDir::new().unwrap();
        let long = manager(&other, Arc::new(FakeIssuer::default()));
        long.get("blog.example.com").await.unwrap();
        assert!(!long.needs_renewal("blog.example.com"));
    }

    #[tokio::test]
    async fn test_issue_all_reports_failures() {
        let dir = TempDir::new().unwrap();
        let issuer = Arc::new(FakeIssuer {
            fail: true,
            ..Default::default()
        });
        let failures = manager(&dir, issuer.clone()).issue_all().await;
        assert_eq!(failures.len(), 2);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }
}
