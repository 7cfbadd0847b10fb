//! Background certificate renewal.
//!
//! Wakes on an interval and re-issues every declared host whose certificate
//! is inside the renew window. Hosts without a certificate are issued too,
//! unless the scheduler only renews (lazy HTTP-01 issuance).

use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::CertManager;

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Delay before the first check, so startup issuance settles first.
const INITIAL_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct RenewalScheduler {
    manager: CertManager,
    check_interval: Duration,
    initial_delay: Duration,
    issue_missing: bool,
}

impl RenewalScheduler {
    pub fn new(manager: CertManager) -> Self {
        Self {
            manager,
            check_interval: DEFAULT_CHECK_INTERVAL,
            initial_delay: INITIAL_DELAY,
            issue_missing: true,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Leave hosts without a certificate to on-demand issuance.
    pub fn renew_only(mut self) -> Self {
        self.issue_missing = false;
        self
    }

    /// Run until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Starting certificate renewal scheduler"
        );

        let mut ticks = interval_at(Instant::now() + self.initial_delay, self.check_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Renewal scheduler stopped");
                    return;
                }
                _ = ticks.tick() => {
                    let renewed = self.check_renewals().await;
                    debug!(renewed, "Renewal check finished");
                }
            }
        }
    }

    /// Renew what needs renewing. Returns the number of hosts renewed.
    pub async fn check_renewals(&self) -> usize {
        let mut renewed = 0;
        for host in self.manager.hosts() {
            if !self.issue_missing && !self.manager.has_certificate(&host) {
                debug!(host = %host, "No certificate yet, waiting for first handshake");
                continue;
            }
            if !self.manager.needs_renewal(&host) {
                debug!(host = %host, "Certificate is still valid");
                continue;
            }

            info!(host = %host, "Certificate needs renewal");
            match self.manager.renew(&host).await {
                Ok(record) => {
                    info!(host = %host, expires = %record.expires, "Certificate renewed");
                    renewed += 1;
                }
                // Other hosts still get their turn.
                Err(e) => warn!(host = %host, error = %e, "Certificate renewal failed"),
            }
        }
        renewed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::client::{IssuedCertificate, Issuer};
    use crate::acme::error::AcmeError;
    use crate::acme::storage::CertificateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct CountingIssuer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Issuer for CountingIssuer {
        async fn issue(&self, host: &str) -> Result<IssuedCertificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = rcgen::KeyPair::generate().unwrap();
            let cert = rcgen::CertificateParams::new(vec![host.to_string()])
                .unwrap()
                .self_signed(&key)
                .unwrap();
            Ok(IssuedCertificate {
                cert_pem: cert.pem(),
                key_pem: key.serialize_pem(),
            })
        }
    }

    fn manager(dir: &tempfile::TempDir, issuer: Arc<CountingIssuer>) -> CertManager {
        let store = CertificateStore::open(dir.path()).unwrap();
        CertManager::new(issuer, store, &["chat.example.com".to_string()], 30)
    }

    #[tokio::test]
    async fn test_renews_only_what_is_due() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let scheduler = RenewalScheduler::new(manager(&dir, issuer.clone()));

        // Missing certificate is due.
        assert_eq!(scheduler.check_renewals().await, 1);
        // Far-future expiry is not.
        assert_eq!(scheduler.check_renewals().await, 0);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renew_only_leaves_missing_hosts_alone() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let certificates = manager(&dir, issuer.clone());
        let scheduler = RenewalScheduler::new(certificates.clone()).renew_only();

        assert_eq!(scheduler.check_renewals().await, 0);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);

        // Once a handshake issued it, the host is tracked like any other.
        certificates.get("chat.example.com").await.unwrap();
        assert!(certificates.has_certificate("chat.example.com"));
        assert_eq!(scheduler.check_renewals().await, 0);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(CountingIssuer::default());
        let scheduler = RenewalScheduler::new(manager(&dir, issuer.clone()))
            .with_initial_delay(Duration::ZERO)
            .with_interval(Duration::from_secs(3600));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }
}
