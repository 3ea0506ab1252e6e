use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use url::Url;

const DEFAULT_REGISTRY_HOST: &str = "localhost:5000";
const DEFAULT_REPO_PREFIX: &str = "gitops-squared";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment-driven configuration for the registry client.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `host[:port]` of the registry, reached over plain HTTP.
    pub registry_host: String,
    /// Top-level path under which resources and the catalog live.
    pub repo_prefix: String,
    /// Upper bound for every individual registry call.
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            registry_host: DEFAULT_REGISTRY_HOST.to_string(),
            repo_prefix: DEFAULT_REPO_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl StoreConfig {
    pub fn new(registry_host: impl Into<String>) -> Self {
        Self {
            registry_host: registry_host.into(),
            ..Self::default()
        }
    }

    /// Build a [`StoreConfig`] from `REGISTRY_HOST`, `REPO_PREFIX` and
    /// `REGISTRY_TIMEOUT`, falling back to defaults for unset or empty
    /// variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(host) = env::var("REGISTRY_HOST").ok().filter(|v| !v.is_empty()) {
            cfg.registry_host = host;
        }
        if let Some(prefix) = env::var("REPO_PREFIX").ok().filter(|v| !v.is_empty()) {
            cfg.repo_prefix = prefix;
        }
        if let Some(raw) = env::var("REGISTRY_TIMEOUT").ok().filter(|v| !v.trim().is_empty()) {
            cfg.timeout = humantime::parse_duration(raw.trim())
                .with_context(|| format!("REGISTRY_TIMEOUT `{raw}` is not a valid duration"))?;
        }
        Ok(cfg)
    }

    /// Base URL of the registry's distribution API.
    pub fn endpoint(&self) -> Result<Url> {
        let host = self.registry_host.trim().trim_end_matches('/');
        if host.starts_with("https://") {
            bail!("registry `{host}` uses TLS; only plain HTTP registries are supported");
        }
        let host = host.strip_prefix("http://").unwrap_or(host);
        if host.is_empty() || host.contains('/') {
            bail!("registry host `{}` must be of the form host[:port]", self.registry_host);
        }
        Url::parse(&format!("http://{host}/"))
            .with_context(|| format!("registry host `{host}` is not a valid address"))
    }
}
