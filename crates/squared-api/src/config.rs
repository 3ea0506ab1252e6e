use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use squared_core::{StoreConfig, validate_component};

use crate::telemetry::LogFormat;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "gitops-squared",
    version,
    about = "Versioned OCI artifacts and a Flux catalog for declared platform resources"
)]
pub struct Cli {
    /// Registry `host[:port]`, reached over plain HTTP
    #[arg(long, env = "REGISTRY_HOST", default_value = "localhost:5000")]
    pub registry_host: String,

    /// Address to serve the API on; `:8080` binds every interface
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Repository prefix for resources and the catalog
    #[arg(long, env = "REPO_PREFIX", default_value = "gitops-squared")]
    pub repo_prefix: String,

    /// Namespace assigned to resources created through the API
    #[arg(long = "namespace", env = "DEFAULT_NAMESPACE", default_value = "default")]
    pub default_namespace: String,

    /// Upper bound for each registry call
    #[arg(
        long,
        env = "REGISTRY_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub registry_timeout: Duration,

    /// Deadline for each API request
    #[arg(
        long,
        env = "REQUEST_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub request_timeout: Duration,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub store: StoreConfig,
    pub default_namespace: String,
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        validate_component(&cli.default_namespace)
            .with_context(|| format!("namespace `{}` is not usable", cli.default_namespace))?;
        let store = StoreConfig {
            registry_host: cli.registry_host.clone(),
            repo_prefix: cli.repo_prefix.clone(),
            timeout: cli.registry_timeout,
        };
        store.endpoint()?;
        Ok(Self {
            listen_addr: parse_listen_addr(&cli.listen_addr)?,
            store,
            default_namespace: cli.default_namespace.clone(),
            request_timeout: cli.request_timeout,
        })
    }
}

/// Accepts `host:port` or a bare `:port`.
pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    let full = match raw.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => raw.to_string(),
    };
    full.parse()
        .with_context(|| format!("listen address `{raw}` is not host:port"))
}
