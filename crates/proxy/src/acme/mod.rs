//! Automatic certificates over ACME.
//!
//! # Components
//!
//! - [`AcmeClient`] runs one order per host through `instant-acme`
//! - [`ChallengeSolver`] answers the challenge: [`Http01Solver`] from the
//!   challenge listener's [`ChallengeStore`], [`Dns01Solver`] through a
//!   [`DnsProvider`] such as [`CloudflareDns`]
//! - [`CertificateStore`] keeps certificates and the account on disk
//! - [`CertManager`] caches per host, restricted to the declared hosts, with
//!   at most one issuance in flight per host
//! - [`RenewalScheduler`] re-issues certificates nearing expiry
//!
//! # Issuance flow
//!
//! 1. A TLS handshake (HTTP-01) or the startup sweep (DNS-01) asks the
//!    [`CertManager`] for a host
//! 2. Memory, then disk, are consulted; on a miss the [`AcmeClient`] creates
//!    an order
//! 3. The solver presents the challenge and the CA validates it
//! 4. The order is finalized with a fresh key and the chain is stored

mod cache;
mod challenge;
mod client;
mod dns;
mod error;
mod scheduler;
mod solver;
mod storage;

pub use cache::{CertManager, CertificateRecord};
pub use challenge::{ChallengeStore, ACME_CHALLENGE_PREFIX};
pub use client::{AcmeClient, IssuedCertificate, Issuer};
pub use dns::{challenge_record_name, CloudflareDns, DnsProvider, DnsRecord, PropagationCheck};
pub use error::{AcmeError, IssuanceFailure, StorageError};
pub use scheduler::RenewalScheduler;
pub use solver::{ChallengeKind, ChallengeSolver, Dns01Solver, Http01Solver, PendingChallenge};
pub use storage::{CertificateMeta, CertificateStore, StoredCertificate};
