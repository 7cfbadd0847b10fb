//! Waypoint - edge router entry point.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use waypoint_config::{validate, TlsConfig, WaypointConfig};
use waypoint_proxy::shutdown::shutdown_signal;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Waypoint - the public HTTP(S) entry point of a service mesh
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (KDL)
    #[arg(short = 'c', long = "config", env = "WAYPOINT_CONFIG")]
    config: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Bind address, e.g. 0.0.0.0:8082
    #[arg(long, env = "MICRO_WEB_ADDRESS")]
    address: Option<String>,

    /// Namespace services are looked up in, e.g. go.micro
    #[arg(long, env = "MICRO_WEB_NAMESPACE")]
    namespace: Option<String>,

    /// Service type infix, e.g. web
    #[arg(long = "type")]
    service_type: Option<String>,

    /// Resolver mapping requests to services: path or subdomain
    #[arg(long, env = "MICRO_WEB_RESOLVER")]
    resolver: Option<String>,

    /// URL unauthenticated users are redirected to
    #[arg(long = "login-url", env = "MICRO_AUTH_LOGIN_URL")]
    login_url: Option<String>,

    /// Count requests and serve them at /stats
    #[arg(long = "enable-stats", env = "MICRO_ENABLE_STATS")]
    enable_stats: bool,

    /// Obtain certificates automatically over ACME
    #[arg(long = "enable-acme", env = "MICRO_ENABLE_ACME")]
    enable_acme: bool,

    /// ACME strategy: http01 (autocert) or dns01 (certmagic)
    #[arg(long = "acme-provider", env = "MICRO_ACME_PROVIDER")]
    acme_provider: Option<String>,

    /// DNS API for the dns01 strategy
    #[arg(long = "acme-challenge-provider", env = "MICRO_ACME_CHALLENGE_PROVIDER")]
    acme_challenge_provider: Option<String>,

    /// ACME directory URL
    #[arg(long = "acme-ca", env = "MICRO_ACME_CA")]
    acme_ca: Option<String>,

    /// Hosts certificates may be issued for
    #[arg(long = "acme-hosts", env = "MICRO_ACME_HOSTS", value_delimiter = ',')]
    acme_hosts: Vec<String>,

    /// Directory for certificates and the ACME account
    #[arg(long = "acme-storage", env = "MICRO_ACME_STORAGE")]
    acme_storage: Option<PathBuf>,

    /// Static TLS certificate chain (PEM)
    #[arg(long = "tls-cert-file", env = "MICRO_TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// Static TLS private key (PEM)
    #[arg(long = "tls-key-file", env = "MICRO_TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = load_config(&cli)?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to start the async runtime")?;

    if cli.test {
        return runtime.block_on(test_config(&config, cli.config.as_deref()));
    }

    for warning in config.validate().context("Configuration validation failed")? {
        warn!("{warning}");
    }

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        tokio::spawn(shutdown_signal(cancel.clone()));
        waypoint_proxy::run(&config, cancel)
            .await
            .context("Edge router failed")
    })
}

fn init_logging(verbose: bool, format: LogFormat) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// File (or defaults), then flags, then environment-only secrets.
fn load_config(cli: &Cli) -> Result<WaypointConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            WaypointConfig::from_file(path).context("Failed to load configuration file")?
        }
        None => WaypointConfig::default(),
    };

    let server = &mut config.server;
    if let Some(address) = &cli.address {
        server.address = address.clone();
    }
    if let Some(namespace) = &cli.namespace {
        server.namespace = namespace.clone();
    }
    if let Some(service_type) = &cli.service_type {
        server.service_type = service_type.clone();
    }
    if let Some(resolver) = &cli.resolver {
        server.resolver = resolver.parse().context("Invalid --resolver")?;
    }
    if let Some(login_url) = &cli.login_url {
        server.login_url = Some(login_url.clone()).filter(|url| !url.is_empty());
    }
    if cli.enable_stats {
        server.enable_stats = true;
    }

    let acme = &mut config.acme;
    if cli.enable_acme {
        acme.enabled = true;
    }
    if let Some(provider) = &cli.acme_provider {
        acme.provider = provider.parse().context("Invalid --acme-provider")?;
    }
    if let Some(challenge_provider) = &cli.acme_challenge_provider {
        acme.challenge_provider = challenge_provider.clone();
    }
    if let Some(ca) = &cli.acme_ca {
        acme.ca = ca.clone();
    }
    if !cli.acme_hosts.is_empty() {
        acme.hosts = cli
            .acme_hosts
            .iter()
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .collect();
    }
    if let Some(storage) = &cli.acme_storage {
        acme.storage = storage.clone();
    }

    match (&cli.tls_cert_file, &cli.tls_key_file) {
        (Some(cert_file), Some(key_file)) => {
            config.tls = Some(TlsConfig {
                cert_file: cert_file.clone(),
                key_file: key_file.clone(),
            });
        }
        (None, None) => {}
        _ => bail!("--tls-cert-file and --tls-key-file must be given together"),
    }

    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

async fn test_config(config: &WaypointConfig, path: Option<&std::path::Path>) -> Result<()> {
    let result = validate::check_config(config).await;

    for warning in &result.warnings {
        warn!("{warning}");
    }
    if !result.is_ok() {
        for e in &result.errors {
            error!("{e}");
        }
        bail!("Configuration test failed with {} error(s)", result.errors.len());
    }

    info!(
        services = config.directory.services.len(),
        resolver = %config.server.resolver,
        acme = config.acme.enabled,
        "Configuration test successful"
    );
    println!(
        "waypoint: configuration {} test is successful",
        path.map(|p| p.display().to_string())
            .unwrap_or_else(|| "(defaults)".to_string())
    );
    Ok(())
}
