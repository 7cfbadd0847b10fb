//! ACME protocol client.
//!
//! Drives one order per host against the configured directory: register or
//! restore the account, answer the challenge through a [`ChallengeSolver`],
//! finalize with a fresh key and collect the chain.

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, Identifier, NewAccount, NewOrder, Order,
    OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::error::AcmeError;
use super::solver::{ChallengeSolver, PendingChallenge};
use super::storage::CertificateStore;

/// Polls of the order state before giving up.
const MAX_POLLS: u32 = 20;

const MAX_POLL_DELAY: Duration = Duration::from_secs(10);

/// PEM output of a successful order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Obtains a fresh certificate for one host.
#[async_trait]
pub trait Issuer: Send + Sync + fmt::Debug {
    async fn issue(&self, host: &str) -> Result<IssuedCertificate, AcmeError>;
}

pub struct AcmeClient {
    directory_url: String,
    contact: Option<String>,
    store: CertificateStore,
    solver: Arc<dyn ChallengeSolver>,
    account: OnceCell<Account>,
}

impl fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .field("solver", &self.solver.kind())
            .field("has_account", &self.account.initialized())
            .finish()
    }
}

impl AcmeClient {
    pub fn new(
        directory_url: impl Into<String>,
        contact: Option<String>,
        store: CertificateStore,
        solver: Arc<dyn ChallengeSolver>,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact,
            store,
            solver,
            account: OnceCell::new(),
        }
    }

    /// The account, restored from storage or registered on first use.
    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| async {
                if let Some(credentials) = self.store.load_credentials::<AccountCredentials>()? {
                    let account = Account::from_credentials(credentials)
                        .await
                        .map_err(|e| AcmeError::Account(e.to_string()))?;
                    info!("Restored ACME account");
                    return Ok(account);
                }

                let contact: Vec<String> = self.contact.iter().map(|email| format!("mailto:{email}")).collect();
                let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contact,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await
                .map_err(|e| AcmeError::Account(e.to_string()))?;

                self.store.save_credentials(&credentials)?;
                info!(directory = %self.directory_url, "Registered ACME account");
                Ok::<_, AcmeError>(account)
            })
            .await
    }

    /// Answer every pending authorization and wait for the order to be ready.
    async fn authorize(
        &self,
        order: &mut Order,
        host: &str,
        presented: &mut Vec<PendingChallenge>,
    ) -> Result<(), AcmeError> {
        let order_error = |e: instant_acme::Error| AcmeError::Order {
            host: host.to_string(),
            message: e.to_string(),
        };

        let authorizations = order.authorizations().await.map_err(order_error)?;
        let kind = self.solver.kind();

        for authorization in &authorizations {
            match &authorization.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AcmeError::Challenge {
                        host: host.to_string(),
                        message: format!("authorization is {status:?}"),
                    })
                }
            }

            let challenge = authorization
                .challenges
                .iter()
                .find(|c| c.r#type == kind.acme_type())
                .ok_or_else(|| AcmeError::NoChallenge {
                    host: host.to_string(),
                    kind: kind.as_str(),
                })?;

            let key_authorization = order.key_authorization(challenge);
            let pending = PendingChallenge {
                host: host.to_string(),
                token: challenge.token.clone(),
                key_authorization: key_authorization.as_str().to_string(),
                dns_value: key_authorization.dns_value(),
            };
            presented.push(pending.clone());
            self.solver.present(&pending).await?;

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(order_error)?;
            debug!(host = %host, challenge = %kind, "Challenge ready");
        }

        let mut delay = Duration::from_millis(250);
        for _ in 0..MAX_POLLS {
            let state = order.refresh().await.map_err(order_error)?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(AcmeError::Challenge {
                        host: host.to_string(),
                        message: "order became invalid".to_string(),
                    })
                }
                _ => {}
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        Err(AcmeError::Timeout {
            host: host.to_string(),
            what: "challenge validation",
        })
    }

    async fn finalize(&self, order: &mut Order, host: &str) -> Result<IssuedCertificate, AcmeError> {
        let order_error = |e: instant_acme::Error| AcmeError::Order {
            host: host.to_string(),
            message: e.to_string(),
        };
        let csr_error = |e: rcgen::Error| AcmeError::Csr(e.to_string());

        let key_pair = KeyPair::generate().map_err(csr_error)?;
        let csr = CertificateParams::new(vec![host.to_string()])
            .map_err(csr_error)?
            .serialize_request(&key_pair)
            .map_err(csr_error)?;

        order.finalize(csr.der()).await.map_err(order_error)?;

        let mut delay = Duration::from_millis(250);
        for _ in 0..MAX_POLLS {
            if let Some(cert_pem) = order.certificate().await.map_err(order_error)? {
                return Ok(IssuedCertificate {
                    cert_pem,
                    key_pem: key_pair.serialize_pem(),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        Err(AcmeError::Timeout {
            host: host.to_string(),
            what: "certificate download",
        })
    }
}

#[async_trait]
impl Issuer for AcmeClient {
    async fn issue(&self, host: &str) -> Result<IssuedCertificate, AcmeError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::Order {
                host: host.to_string(),
                message: e.to_string(),
            })?;
        debug!(host = %host, "Created ACME order");

        let mut presented = Vec::new();
        let authorized = self.authorize(&mut order, host, &mut presented).await;
        for challenge in &presented {
            self.solver.cleanup(challenge).await;
        }
        authorized?;

        self.finalize(&mut order, host).await
    }
}
