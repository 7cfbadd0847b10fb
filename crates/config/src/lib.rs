//! Waypoint configuration
//!
//! One immutable [`WaypointConfig`] is built at startup, validated, and then
//! handed by reference to every component constructor. There is no other
//! process-wide configuration state.
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. a KDL file (`--config`)
//! 3. command-line flags and their environment variables (applied by the binary)
//!
//! # Example
//!
//! ```kdl
//! server {
//!     address ":8082"
//!     namespace "go.micro"
//!     resolver "path"
//!     login-url "/login"
//! }
//!
//! acme {
//!     enabled #true
//!     provider "dns01"
//!     challenge-provider "cloudflare"
//!     hosts "chat.example.com" "blog.example.com"
//!     storage "/var/lib/waypoint/acme"
//! }
//!
//! directory {
//!     service "go.micro.web.chat" {
//!         node "10.0.0.7:9000" id="chat-1"
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use waypoint_common::{Namespace, Service};

pub mod kdl;
pub mod validate;

pub use validate::{ValidationResult, ValidationWarning};

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory.
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Header carrying the routing prefix to backends.
pub const DEFAULT_BASE_PATH_HEADER: &str = "X-Micro-Web-Base-Path";

/// Environment variable holding the Cloudflare API token.
pub const CLOUDFLARE_TOKEN_ENV: &str = "CF_API_TOKEN";

// ============================================================================
// Errors
// ============================================================================

/// Configuration errors. Every variant is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("'{0}' is not a valid ACME provider (expected http01 or dns01)")]
    UnknownAcmeProvider(String),

    #[error("the only implemented DNS challenge provider is cloudflare, got '{0}'")]
    UnsupportedChallengeProvider(String),

    #[error("env variable {0} must be set for the DNS-01 challenge")]
    MissingCredential(&'static str),

    #[error("ACME is enabled but no hosts were declared")]
    NoAcmeHosts,

    #[error("'{0}' is not a valid resolver (expected path or subdomain)")]
    UnknownResolver(String),

    #[error("'{0}' is not a valid selector (expected round-robin or random)")]
    UnknownSelector(String),

    #[error("invalid bind address '{0}'")]
    BindAddress(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

// ============================================================================
// Enumerations
// ============================================================================

/// How a request is mapped to a service short name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    /// First path segment: `/chat/messages` routes to `chat`
    #[default]
    Path,
    /// Leftmost host labels: `chat.example.com` routes to `chat`
    Subdomain,
}

impl FromStr for ResolverKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "path" => Ok(Self::Path),
            "subdomain" | "domain" => Ok(Self::Subdomain),
            other => Err(ConfigError::UnknownResolver(other.to_string())),
        }
    }
}

impl fmt::Display for ResolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path => write!(f, "path"),
            Self::Subdomain => write!(f, "subdomain"),
        }
    }
}

/// ACME issuance strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcmeProvider {
    /// HTTP-01 challenge, issued lazily per whitelisted host
    #[default]
    Http01,
    /// DNS-01 challenge through a DNS provider API, issued eagerly
    Dns01,
}

impl FromStr for AcmeProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http01" | "http-01" | "autocert" => Ok(Self::Http01),
            "dns01" | "dns-01" | "certmagic" => Ok(Self::Dns01),
            other => Err(ConfigError::UnknownAcmeProvider(other.to_string())),
        }
    }
}

impl fmt::Display for AcmeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http01 => write!(f, "http01"),
            Self::Dns01 => write!(f, "dns01"),
        }
    }
}

/// Instance selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorKind {
    #[default]
    RoundRobin,
    Random,
}

impl FromStr for SelectorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(ConfigError::UnknownSelector(other.to_string())),
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Listener and routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name the edge registers itself under
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Bind address; `:8082` binds all interfaces
    #[serde(default = "default_address")]
    pub address: String,
    /// Registry namespace, e.g. `go.micro`
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Service type, e.g. `web`
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub resolver: ResolverKind,
    /// Where unauthenticated callers are redirected
    #[serde(default)]
    pub login_url: Option<String>,
    #[serde(default = "default_base_path_header")]
    pub base_path_header: String,
    #[serde(default)]
    pub enable_stats: bool,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Resolved socket address of the main listener.
    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind_address(&self.address)
    }

    /// `<namespace>.<type>` routing prefix.
    pub fn routing_namespace(&self) -> Namespace {
        Namespace::new(&self.namespace, &self.service_type)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            address: default_address(),
            namespace: default_namespace(),
            service_type: default_service_type(),
            resolver: ResolverKind::default(),
            login_url: None,
            base_path_header: default_base_path_header(),
            enable_stats: false,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// Outbound proxy transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Time allowed until the backend sends response headers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Static certificate and key files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Automatic certificate management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: AcmeProvider,
    /// DNS API used by the DNS-01 strategy
    #[serde(default = "default_challenge_provider")]
    pub challenge_provider: String,
    /// ACME directory URL
    #[serde(default = "default_ca")]
    pub ca: String,
    /// Hosts certificates may be issued for; nothing else is ever issued
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_acme_storage")]
    pub storage: PathBuf,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
    #[serde(default)]
    pub email: Option<String>,
    /// Cleartext listener answering HTTP-01 challenges
    #[serde(default = "default_challenge_address")]
    pub challenge_address: String,
    /// DNS provider credential, read from the environment
    #[serde(skip)]
    pub dns_api_token: Option<String>,
}

impl AcmeConfig {
    pub fn challenge_bind_address(&self) -> Result<SocketAddr, ConfigError> {
        parse_bind_address(&self.challenge_address)
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: AcmeProvider::default(),
            challenge_provider: default_challenge_provider(),
            ca: default_ca(),
            hosts: Vec::new(),
            storage: default_acme_storage(),
            renew_before_days: default_renew_before_days(),
            email: None,
            challenge_address: default_challenge_address(),
            dns_api_token: None,
        }
    }
}

/// Statically declared services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub selector: SelectorKind,
    /// How long service listings are cached; zero disables caching
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl DirectoryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            selector: SelectorKind::default(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Static token table for the access gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// token -> account id
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
    /// Short service names that require an authenticated account
    #[serde(default)]
    pub protected: Vec<String>,
}

impl AuthConfig {
    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty() || !self.protected.is_empty()
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete edge router configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaypointConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub acme: AcmeConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl WaypointConfig {
    /// Load a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Loading configuration file");
        Self::from_kdl_str(&content)
    }

    /// Parse configuration from KDL text.
    pub fn from_kdl_str(content: &str) -> Result<Self, ConfigError> {
        kdl::parse_config(content).map_err(|e| {
            // typed errors raised inside the parser survive the anyhow round trip
            match e.downcast::<ConfigError>() {
                Ok(config_error) => config_error,
                Err(other) => ConfigError::Invalid(format!("{other:#}")),
            }
        })
    }

    /// Pull secrets that only ever live in the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.acme.dns_api_token.is_none() {
            self.acme.dns_api_token = lookup(CLOUDFLARE_TOKEN_ENV).filter(|v| !v.is_empty());
        }
        debug!(
            dns_credential_present = self.acme.dns_api_token.is_some(),
            "Applied environment to configuration"
        );
    }

    /// Check everything that must hold before any listener binds.
    ///
    /// Errors are fatal; warnings are returned for the caller to log.
    pub fn validate(&self) -> Result<Vec<ValidationWarning>, ConfigError> {
        self.server.bind_address()?;
        validate::acme::validate_acme(&self.acme)?;

        let mut warnings = Vec::new();
        if let Some(warning) = validate::certs::validate_static_tls(self)? {
            warnings.push(warning);
        }
        warnings.extend(validate::lint::lint_config(self).warnings);
        Ok(warnings)
    }
}

/// Parse `:8082`, `0.0.0.0:8082` or `[::1]:8082`.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr, ConfigError> {
    let normalized = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    normalized
        .parse()
        .map_err(|_| ConfigError::BindAddress(address.to_string()))
}

// ============================================================================
// Defaults
// ============================================================================

fn default_server_name() -> String {
    "go.micro.web".to_string()
}

fn default_address() -> String {
    ":8082".to_string()
}

fn default_namespace() -> String {
    waypoint_common::names::DEFAULT_NAMESPACE.to_string()
}

fn default_service_type() -> String {
    waypoint_common::names::DEFAULT_SERVICE_TYPE.to_string()
}

fn default_base_path_header() -> String {
    DEFAULT_BASE_PATH_HEADER.to_string()
}

pub(crate) fn default_shutdown_timeout() -> u64 {
    30
}

pub(crate) fn default_connect_timeout() -> u64 {
    10
}

pub(crate) fn default_request_timeout() -> u64 {
    30
}

pub(crate) fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_challenge_provider() -> String {
    "cloudflare".to_string()
}

fn default_ca() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_acme_storage() -> PathBuf {
    PathBuf::from("/var/lib/waypoint/acme")
}

pub(crate) fn default_renew_before_days() -> u32 {
    30
}

fn default_challenge_address() -> String {
    ":80".to_string()
}

pub(crate) fn default_cache_ttl() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WaypointConfig::default();
        assert_eq!(config.server.address, ":8082");
        assert_eq!(config.server.resolver, ResolverKind::Path);
        assert_eq!(config.server.routing_namespace().prefix(), "go.micro.web");
        assert_eq!(config.server.base_path_header, "X-Micro-Web-Base-Path");
        assert!(!config.acme.enabled);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_bind_address_forms() {
        assert_eq!(
            parse_bind_address(":8082").unwrap(),
            "0.0.0.0:8082".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_bind_address("127.0.0.1:9000").is_ok());
        assert!(parse_bind_address("[::1]:443").is_ok());
        assert!(matches!(
            parse_bind_address("nope"),
            Err(ConfigError::BindAddress(_))
        ));
    }

    #[test]
    fn test_provider_names() {
        assert_eq!("autocert".parse::<AcmeProvider>().unwrap(), AcmeProvider::Http01);
        assert_eq!("certmagic".parse::<AcmeProvider>().unwrap(), AcmeProvider::Dns01);
        assert_eq!("DNS01".parse::<AcmeProvider>().unwrap(), AcmeProvider::Dns01);
        assert!(matches!(
            "letsencrypt".parse::<AcmeProvider>(),
            Err(ConfigError::UnknownAcmeProvider(_))
        ));
    }

    #[test]
    fn test_resolver_names() {
        assert_eq!("path".parse::<ResolverKind>().unwrap(), ResolverKind::Path);
        assert_eq!(
            "subdomain".parse::<ResolverKind>().unwrap(),
            ResolverKind::Subdomain
        );
        assert!("host".parse::<ResolverKind>().is_err());
    }

    #[test]
    fn test_apply_env_reads_token() {
        let mut config = WaypointConfig::default();
        config.apply_env(|key| (key == CLOUDFLARE_TOKEN_ENV).then(|| "tok".to_string()));
        assert_eq!(config.acme.dns_api_token.as_deref(), Some("tok"));

        let mut config = WaypointConfig::default();
        config.apply_env(|_| Some(String::new()));
        assert!(config.acme.dns_api_token.is_none());
    }

    #[test]
    fn test_validate_rejects_dns01_without_token() {
        let mut config = WaypointConfig::default();
        config.acme.enabled = true;
        config.acme.provider = AcmeProvider::Dns01;
        config.acme.hosts = vec!["chat.example.com".to_string()];

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential(CLOUDFLARE_TOKEN_ENV))
        ));
    }
}
