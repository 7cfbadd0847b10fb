//! ACME errors.

use std::path::PathBuf;
use thiserror::Error;

/// Failure in the certificate store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("refusing to store certificate for invalid host {0:?}")]
    InvalidHost(String),
}

/// Failure while obtaining a certificate.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME account: {0}")]
    Account(String),

    #[error("ACME order for {host}: {message}")]
    Order { host: String, message: String },

    #[error("no {kind} challenge offered for {host}")]
    NoChallenge { host: String, kind: &'static str },

    #[error("challenge for {host} failed: {message}")]
    Challenge { host: String, message: String },

    #[error("timed out waiting for {what} for {host}")]
    Timeout { host: String, what: &'static str },

    #[error("DNS provider: {0}")]
    Dns(String),

    #[error("CSR generation: {0}")]
    Csr(String),

    #[error("issued certificate unusable: {0}")]
    Certificate(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-host issuance failure as seen by handshake callers.
///
/// Cloneable so that every caller waiting on the same issuance receives
/// the same failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("certificate issuance for {host} failed: {message}")]
pub struct IssuanceFailure {
    pub host: String,
    pub message: String,
}

impl IssuanceFailure {
    pub fn new(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            message: message.into(),
        }
    }
}
