//! Challenge solvers: make a challenge answerable, then tidy up.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use super::challenge::ChallengeStore;
use super::dns::{challenge_record_name, DnsProvider, DnsRecord, PropagationCheck};
use super::error::AcmeError;

/// Challenge type a solver answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
}

impl ChallengeKind {
    pub fn acme_type(self) -> instant_acme::ChallengeType {
        match self {
            Self::Http01 => instant_acme::ChallengeType::Http01,
            Self::Dns01 => instant_acme::ChallengeType::Dns01,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One challenge to answer for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    pub host: String,
    pub token: String,
    /// HTTP-01 response body
    pub key_authorization: String,
    /// DNS-01 TXT value (digest of the key authorization)
    pub dns_value: String,
}

#[async_trait]
pub trait ChallengeSolver: Send + Sync + fmt::Debug {
    fn kind(&self) -> ChallengeKind;

    /// Publish the answer. Returns once the CA can be told to validate.
    async fn present(&self, challenge: &PendingChallenge) -> Result<(), AcmeError>;

    /// Withdraw the answer. Failures are logged, not returned.
    async fn cleanup(&self, challenge: &PendingChallenge);
}

/// Answers HTTP-01 from the challenge listener's token table.
#[derive(Debug, Clone)]
pub struct Http01Solver {
    store: ChallengeStore,
}

impl Http01Solver {
    pub fn new(store: ChallengeStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChallengeSolver for Http01Solver {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn present(&self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        self.store.insert(&challenge.token, &challenge.key_authorization);
        Ok(())
    }

    async fn cleanup(&self, challenge: &PendingChallenge) {
        self.store.remove(&challenge.token);
    }
}

/// Answers DNS-01 with a TXT record at the DNS provider.
#[derive(Debug)]
pub struct Dns01Solver {
    provider: Arc<dyn DnsProvider>,
    propagation: Option<PropagationCheck>,
    records: DashMap<String, DnsRecord>,
}

impl Dns01Solver {
    pub fn new(provider: Arc<dyn DnsProvider>) -> Self {
        Self {
            provider,
            propagation: None,
            records: DashMap::new(),
        }
    }

    /// Wait for the record to be publicly visible before validation.
    pub fn with_propagation(mut self, check: PropagationCheck) -> Self {
        self.propagation = Some(check);
        self
    }

    fn key(challenge: &PendingChallenge) -> String {
        format!("{}/{}", challenge.host, challenge.token)
    }
}

#[async_trait]
impl ChallengeSolver for Dns01Solver {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    async fn present(&self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        let name = challenge_record_name(&challenge.host);
        let record = self
            .provider
            .create_txt(&challenge.host, &name, &challenge.dns_value)
            .await?;
        self.records.insert(Self::key(challenge), record);

        if let Some(check) = &self.propagation {
            if !check.wait_for(&name, &challenge.dns_value).await {
                // the caller only cleans up challenges that were presented
                self.cleanup(challenge).await;
                return Err(AcmeError::Timeout {
                    host: challenge.host.clone(),
                    what: "TXT record propagation",
                });
            }
        }
        Ok(())
    }

    async fn cleanup(&self, challenge: &PendingChallenge) {
        let Some((_, record)) = self.records.remove(&Self::key(challenge)) else {
            return;
        };
        if let Err(e) = self.provider.delete_txt(&record).await {
            warn!(host = %challenge.host, record = %record.name, error = %e, "Failed to delete DNS-01 record");
        }
    }
}
