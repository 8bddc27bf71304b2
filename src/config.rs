//! Configuration management

use std::{path::Path, time::Duration};

use axum::http::HeaderName;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Client-certificate gate
    pub gate: GateConfig,
    /// Validation cache
    pub cache: CacheConfig,
    /// Upstream forwarding
    pub forwarding: ForwardingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
        }
    }
}

/// Client-certificate gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Verify forwarded client certificates. Disable only for local/test deployments.
    pub enabled: bool,

    /// Trusted CA: PEM text, base64-encoded PEM, or base64-encoded DER
    pub ca_certificate: Option<String>,

    /// Header carrying the forwarded client certificate
    pub client_cert_header: String,

    /// Header set to `"true"` on requests whose certificate verified
    pub verified_header: String,

    /// Paths that bypass the gate entirely (exact match)
    pub excluded_paths: Vec<String>,
}

fn default_excluded_paths() -> Vec<String> {
    vec!["/".to_string(), "/ping".to_string(), "/health".to_string()]
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_certificate: None,
            client_cert_header: "x-forwarded-client-cert".to_string(),
            verified_header: "x-client-certificate-verified".to_string(),
            excluded_paths: default_excluded_paths(),
        }
    }
}

/// Validation cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memoize verdicts
    pub enabled: bool,
    /// How long a verdict stays valid
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum number of entries before eviction
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
            max_entries: 10_000,
        }
    }
}

/// Upstream forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Upstream base URLs. One target is used as-is; several are round-robined.
    pub targets: Vec<String>,
    /// Rewrite `Host`/`Origin` to the target instead of preserving the client's
    pub change_origin: bool,
    /// Add `X-Forwarded-For`/`-Host`/`-Proto`
    pub xfwd: bool,
    /// Upstream connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upstream socket inactivity timeout. Resets on every read, so a
    /// response that keeps streaming is never cut off.
    #[serde(with = "humantime_serde", alias = "request_timeout")]
    pub read_timeout: Duration,
    /// Concurrent upstream requests; further requests wait up to
    /// `connect_timeout` for a slot
    pub max_connections: usize,
    /// Idle keep-alive sockets kept per upstream host
    pub pool_max_idle_per_host: usize,
    /// Idle sockets are closed after this long
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
    /// TCP keep-alive interval
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,
    /// Parse JSON/form bodies before forwarding (re-encoded on the way out)
    pub parse_bodies: bool,
    /// Largest request body buffered for forwarding
    pub max_body_bytes: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            change_origin: false,
            xfwd: false,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            max_connections: 40,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(60),
            parse_bodies: false,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ForwardingConfig {
    /// Parse the configured targets
    pub fn target_urls(&self) -> Result<Vec<Url>> {
        self.targets
            .iter()
            .map(|t| {
                let url = Url::parse(t.trim())
                    .map_err(|e| Error::Config(format!("Invalid proxy target '{t}': {e}")))?;
                match url.scheme() {
                    "http" | "https" => Ok(url),
                    other => Err(Error::Config(format!(
                        "Unsupported proxy target scheme '{other}' in '{t}'"
                    ))),
                }
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Precedence, lowest first: defaults, YAML file, `CERTGATE_*` variables
    /// (nested with `__`), then the flat legacy deployment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("CERTGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.apply_legacy_env(|name| std::env::var(name).ok());

        Ok(config)
    }

    /// Overlay the flat variables used by existing deployments.
    pub fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(ca) = var("GAD_CA_CERTIFICATE_BASE64") {
            self.gate.ca_certificate = Some(ca);
        }
        if let Some(header) = var("GAD_CLIENT_CERTIFICATE_VERIFIED_HEADER") {
            self.gate.verified_header = header;
        }
        if let Some(targets) = var("GAD_PROXY_TARGET") {
            self.forwarding.targets = targets
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(change_origin) = var("GAD_PROXY_CHANGE_ORIGIN") {
            self.forwarding.change_origin = change_origin == "true";
        }
        if var("DISABLE_CLIENT_CERTIFICATE_VERIFICATION").as_deref() == Some("true") {
            self.gate.enabled = false;
        }
        if let Some(port) = var("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Check the configuration is complete enough to serve traffic
    pub fn validate(&self) -> Result<()> {
        if self.forwarding.targets.is_empty() {
            return Err(Error::Config(
                "At least one proxy target is required (forwarding.targets)".to_string(),
            ));
        }
        self.forwarding.target_urls()?;

        for (field, name) in [
            ("gate.client_cert_header", &self.gate.client_cert_header),
            ("gate.verified_header", &self.gate.verified_header),
        ] {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Config(format!("{field} '{name}' is not a valid header name")))?;
        }

        if self.gate.enabled
            && self
                .gate
                .ca_certificate
                .as_deref()
                .is_none_or(|ca| ca.trim().is_empty())
        {
            return Err(Error::Config(
                "gate.ca_certificate is required while verification is enabled".to_string(),
            ));
        }

        if self.forwarding.max_connections == 0 {
            return Err(Error::Config(
                "forwarding.max_connections must be greater than zero".to_string(),
            ));
        }

        if self.forwarding.max_body_bytes == 0 {
            return Err(Error::Config(
                "forwarding.max_body_bytes must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
