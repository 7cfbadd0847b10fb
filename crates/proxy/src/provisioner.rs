//! Certificate provisioning for the main listener.
//!
//! One strategy is chosen at startup and kept for the life of the process:
//! cleartext, static PEM files, or ACME (HTTP-01 or DNS-01). ACME wins over
//! static files when both are configured.

use http::{header, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use waypoint_config::{AcmeConfig, AcmeProvider, ConfigError, WaypointConfig, CLOUDFLARE_TOKEN_ENV};

use crate::acme::{
    AcmeClient, AcmeError, CertManager, CertificateStore, ChallengeSolver, ChallengeStore, CloudflareDns,
    Dns01Solver, Http01Solver, PropagationCheck, RenewalScheduler, StorageError,
};
use crate::http_helpers::{empty_response, redirect, text_response, ProxyBody};
use crate::tls::{CertificateSource, StaticCertificate, TlsError};

/// The only DNS challenge provider with an implementation.
const CLOUDFLARE: &str = "cloudflare";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("certificate storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error("failed to bind challenge listener on {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
}

/// ACME state shared by the listener and the background tasks.
#[derive(Debug, Clone)]
pub struct AcmeProvisioning {
    provider: AcmeProvider,
    manager: CertManager,
    /// HTTP-01 only
    challenges: Option<ChallengeStore>,
    challenge_address: SocketAddr,
}

impl AcmeProvisioning {
    pub fn manager(&self) -> &CertManager {
        &self.manager
    }

    pub fn provider(&self) -> AcmeProvider {
        self.provider
    }
}

#[derive(Debug, Clone)]
pub enum CertificateProvisioner {
    Cleartext,
    Static(Arc<StaticCertificate>),
    Acme(AcmeProvisioning),
}

impl CertificateProvisioner {
    pub fn from_config(config: &WaypointConfig) -> Result<Self, ProvisionError> {
        if config.acme.enabled {
            if config.tls.is_some() {
                warn!("ACME is enabled, ignoring the static TLS certificate");
            }
            return Ok(Self::Acme(acme_from_config(&config.acme)?));
        }

        match &config.tls {
            Some(tls) => {
                let certificate = StaticCertificate::from_files(&tls.cert_file, &tls.key_file)?;
                info!(cert = %tls.cert_file.display(), "Serving a static TLS certificate");
                Ok(Self::Static(Arc::new(certificate)))
            }
            None => Ok(Self::Cleartext),
        }
    }

    /// Certificates for the main listener; `None` serves cleartext.
    pub fn certificate_source(&self) -> Option<Arc<dyn CertificateSource>> {
        match self {
            Self::Cleartext => None,
            Self::Static(certificate) => Some(certificate.clone()),
            Self::Acme(acme) => Some(Arc::new(acme.manager.clone())),
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Self::Cleartext)
    }

    /// Start the challenge listener, startup issuance and renewals.
    pub async fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, ProvisionError> {
        let Self::Acme(acme) = self else {
            return Ok(Vec::new());
        };
        let mut tasks = Vec::new();

        match acme.provider {
            AcmeProvider::Http01 => {
                if let Some(challenges) = &acme.challenges {
                    let listener = TcpListener::bind(acme.challenge_address)
                        .await
                        .map_err(|source| ProvisionError::Bind {
                            address: acme.challenge_address,
                            source,
                        })?;
                    info!(address = %acme.challenge_address, "ACME challenge listener started");
                    tasks.push(tokio::spawn(serve_challenges(listener, challenges.clone(), cancel.clone())));
                }
            }
            AcmeProvider::Dns01 => {
                let manager = acme.manager.clone();
                tasks.push(tokio::spawn(async move {
                    for failure in manager.issue_all().await {
                        error!(host = %failure.host, error = %failure.message, "Startup issuance failed");
                    }
                }));
            }
        }

        let mut scheduler = RenewalScheduler::new(acme.manager.clone());
        if acme.provider == AcmeProvider::Http01 {
            scheduler = scheduler.renew_only();
        }
        tasks.push(tokio::spawn(scheduler.run(cancel)));
        Ok(tasks)
    }
}

fn acme_from_config(acme: &AcmeConfig) -> Result<AcmeProvisioning, ProvisionError> {
    if acme.hosts.is_empty() {
        return Err(ConfigError::NoAcmeHosts.into());
    }

    let (solver, challenges): (Arc<dyn ChallengeSolver>, Option<ChallengeStore>) = match acme.provider {
        AcmeProvider::Http01 => {
            let challenges = ChallengeStore::new();
            (Arc::new(Http01Solver::new(challenges.clone())), Some(challenges))
        }
        AcmeProvider::Dns01 => {
            if !acme.challenge_provider.eq_ignore_ascii_case(CLOUDFLARE) {
                return Err(ConfigError::UnsupportedChallengeProvider(acme.challenge_provider.clone()).into());
            }
            let token = acme
                .dns_api_token
                .as_deref()
                .ok_or(ConfigError::MissingCredential(CLOUDFLARE_TOKEN_ENV))?;
            let dns = CloudflareDns::new(token)?;
            let solver = Dns01Solver::new(Arc::new(dns)).with_propagation(PropagationCheck::default());
            (Arc::new(solver), None)
        }
    };

    let store = CertificateStore::open(&acme.storage)?;
    let client = AcmeClient::new(&acme.ca, acme.email.clone(), store.clone(), solver);
    let manager = CertManager::new(Arc::new(client), store, &acme.hosts, acme.renew_before_days);

    info!(
        provider = %acme.provider,
        ca = %acme.ca,
        hosts = ?manager.hosts(),
        "ACME certificate provisioning enabled"
    );

    Ok(AcmeProvisioning {
        provider: acme.provider,
        manager,
        challenges,
        challenge_address: acme.challenge_bind_address()?,
    })
}

/// Answer for a request on the cleartext challenge listener.
///
/// Known tokens get their key authorization, unknown tokens a 404, and every
/// other request a redirect to the same URL over https.
pub fn challenge_response<B>(challenges: &ChallengeStore, req: &Request<B>) -> Response<ProxyBody> {
    let path = req.uri().path();
    if ChallengeStore::is_challenge_path(path) {
        return match challenges.response_for(path) {
            Some(key_authorization) => text_response(StatusCode::OK, key_authorization),
            None => empty_response(StatusCode::NOT_FOUND),
        };
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host());
    let Some(host) = host else {
        return empty_response(StatusCode::BAD_REQUEST);
    };
    let host = host.split(':').next().unwrap_or(host);
    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    redirect(StatusCode::FOUND, &format!("https://{host}{path_and_query}"))
}

async fn serve_challenges(listener: TcpListener, challenges: ChallengeStore, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Challenge listener stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Challenge listener accept failed");
                    continue;
                }
            },
        };

        let challenges = challenges.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = challenge_response(&challenges, &req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(peer = %peer, error = %e, "Challenge connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use waypoint_config::TlsConfig;

    fn request(host: &str, path: &str) -> Request<()> {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_challenge_tokens() {
        let challenges = ChallengeStore::new();
        challenges.insert("tok", "tok.thumb");

        let found = challenge_response(&challenges, &request("chat.example.com", "/.well-known/acme-challenge/tok"));
        assert_eq!(found.status(), StatusCode::OK);

        let missing = challenge_response(&challenges, &request("chat.example.com", "/.well-known/acme-challenge/nope"));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_other_requests_redirect_to_https() {
        let challenges = ChallengeStore::new();
        let response = challenge_response(&challenges, &request("chat.example.com:80", "/messages?page=2"));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://chat.example.com/messages?page=2"
        );
    }

    #[test]
    fn test_cleartext_by_default() {
        let provisioner = CertificateProvisioner::from_config(&WaypointConfig::default()).unwrap();
        assert!(!provisioner.is_tls());
        assert!(provisioner.certificate_source().is_none());
    }

    #[test]
    fn test_dns01_without_token_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WaypointConfig::default();
        config.acme.enabled = true;
        config.acme.provider = AcmeProvider::Dns01;
        config.acme.hosts = vec!["chat.example.com".to_string()];
        config.acme.storage = dir.path().to_path_buf();

        let err = CertificateProvisioner::from_config(&config).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(ConfigError::MissingCredential(_))));
    }

    #[test]
    fn test_unsupported_dns_provider_is_fatal() {
        let mut config = WaypointConfig::default();
        config.acme.enabled = true;
        config.acme.provider = AcmeProvider::Dns01;
        config.acme.challenge_provider = "route53".to_string();
        config.acme.hosts = vec!["chat.example.com".to_string()];
        config.acme.dns_api_token = Some("token".to_string());

        let err = CertificateProvisioner::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Config(ConfigError::UnsupportedChallengeProvider(_))
        ));
    }

    #[test]
    fn test_acme_without_hosts_is_fatal() {
        let mut config = WaypointConfig::default();
        config.acme.enabled = true;
        let err = CertificateProvisioner::from_config(&config).unwrap_err();
        assert!(matches!(err, ProvisionError::Config(ConfigError::NoAcmeHosts)));
    }

    #[test]
    fn test_acme_takes_precedence_over_static_tls() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WaypointConfig::default();
        config.acme.enabled = true;
        config.acme.hosts = vec!["chat.example.com".to_string()];
        config.acme.storage = dir.path().join("acme");
        config.tls = Some(TlsConfig {
            cert_file: PathBuf::from("/nonexistent/cert.pem"),
            key_file: PathBuf::from("/nonexistent/key.pem"),
        });

        let provisioner = CertificateProvisioner::from_config(&config).unwrap();
        let CertificateProvisioner::Acme(acme) = provisioner else {
            panic!("expected ACME provisioning");
        };
        assert_eq!(acme.provider(), AcmeProvider::Http01);
        assert_eq!(acme.manager().hosts(), vec!["chat.example.com"]);
    }

    #[test]
    fn test_missing_static_files_are_fatal() {
        let mut config = WaypointConfig::default();
        config.tls = Some(TlsConfig {
            cert_file: PathBuf::from("/nonexistent/cert.pem"),
            key_file: PathBuf::from("/nonexistent/key.pem"),
        });
        assert!(matches!(
            CertificateProvisioner::from_config(&config),
            Err(ProvisionError::Tls(TlsError::Io { .. }))
        ));
    }
}
