//! Server configuration.
//!
//! Every section derives serde traits and falls back to its `Default`, so a
//! TOML file only needs the keys it changes:
//!
//! ```toml
//! listen = "0.0.0.0:8443"
//!
//! [protocols]
//! http1 = true
//! http2 = true
//! quic  = true
//!
//! [tls]
//! cert_path = "certs/server.pem"
//! key_path  = "certs/server.key"
//!
//! [[tenants]]
//! id    = "tenant-acme"
//! hosts = ["acme.example.com", "www.acme.example.com"]
//! config = { plan = "enterprise" }
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to load or validate a [`ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// Root configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address for HTTP/1.1 and HTTP/2.
    pub listen: String,
    pub protocols: ProtocolConfig,
    pub timeouts: TimeoutConfig,
    pub limits: LimitConfig,
    /// Applied by the server to TLS and QUIC responses.
    pub hsts: HstsConfig,
    /// Default certificate. Required for `quic` and for TLS on TCP.
    pub tls: Option<TlsConfig>,
    pub quic: QuicConfig,
    pub host_matching: HostMatching,
    /// Tenants registered at startup.
    pub tenants: Vec<TenantConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_owned(),
            protocols: ProtocolConfig::default(),
            timeouts: TimeoutConfig::default(),
            limits: LimitConfig::default(),
            hsts: HstsConfig::default(),
            tls: None,
            quic: QuicConfig::default(),
            host_matching: HostMatching::default(),
            tenants: Vec::new(),
        }
    }
}

/// Which wire protocols are served.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub http1: bool,
    /// HTTP/2 over TLS (ALPN `h2`) or, without TLS, prior-knowledge h2c.
    pub http2: bool,
    /// HTTP/3 over QUIC. Needs TLS and the `quic` cargo feature.
    pub quic: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { http1: true, http2: true, quic: false }
    }
}

/// Timeouts in seconds. `0` disables a timeout.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed for a client to send request headers (HTTP/1.1).
    pub read_secs: u64,
    /// Deadline for producing a response. Cancels the request context when hit.
    pub request_secs: u64,
    /// HTTP/2 keep-alive ping interval and QUIC idle timeout.
    pub idle_secs: u64,
    /// How long graceful shutdown waits for in-flight connections.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { read_secs: 30, request_secs: 0, idle_secs: 60, shutdown_grace_secs: 30 }
    }
}

fn secs(n: u64) -> Option<Duration> {
    (n > 0).then(|| Duration::from_secs(n))
}

impl TimeoutConfig {
    pub fn read(&self) -> Option<Duration> { secs(self.read_secs) }
    pub fn request(&self) -> Option<Duration> { secs(self.request_secs) }
    pub fn idle(&self) -> Option<Duration> { secs(self.idle_secs) }
    pub fn shutdown_grace(&self) -> Option<Duration> { secs(self.shutdown_grace_secs) }
}

/// Size and concurrency limits.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Maximum size of the request head in bytes.
    pub max_header_size: usize,
    /// Read buffer size per connection in bytes.
    pub buffer_size: usize,
    /// Concurrent connections before `accept` waits.
    pub max_connections: usize,
    /// Largest request body accepted; larger bodies get `413`.
    pub max_body_size: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_header_size: 64 * 1024,
            buffer_size: 400 * 1024,
            max_connections: 10_000,
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// `Strict-Transport-Security` parameters. [`Server`](crate::Server) applies them to every
/// route when `enabled`; [`middleware::hsts`](crate::middleware::hsts) takes them directly.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct HstsConfig {
    pub enabled: bool,
    pub max_age_secs: u64,
    pub include_subdomains: bool,
    pub preload: bool,
}

impl Default for HstsConfig {
    fn default() -> Self {
        Self { enabled: false, max_age_secs: 31_536_000, include_subdomains: false, preload: false }
    }
}

impl HstsConfig {
    /// The header value, e.g. `max-age=31536000; includeSubDomains`.
    pub fn header_value(&self) -> String {
        let mut v = format!("max-age={}", self.max_age_secs);
        if self.include_subdomains {
            v.push_str("; includeSubDomains");
        }
        if self.preload {
            v.push_str("; preload");
        }
        v
    }
}

/// PEM certificate chain and private key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// QUIC listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuicConfig {
    /// UDP bind address. Defaults to the TCP `listen` address.
    pub listen: Option<String>,
    /// Accept 0-RTT data on resumed connections.
    pub enable_0rtt: bool,
    pub max_concurrent_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self { listen: None, enable_0rtt: true, max_concurrent_streams: 100 }
    }
}

/// How request hosts are compared against registered hostnames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HostMatching {
    /// Compare ASCII-case-insensitively (DNS semantics).
    pub case_insensitive: bool,
    /// Ignore a `:port` suffix on the request host.
    pub strip_port: bool,
}

impl Default for HostMatching {
    fn default() -> Self {
        Self { case_insensitive: true, strip_port: true }
    }
}

/// A tenant registered at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantConfig {
    pub id: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Opaque per-tenant settings exposed through `Context::tenant_config`.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Per-host certificates selected by SNI.
    #[serde(default)]
    pub tls_hosts: Vec<HostTlsConfig>,
}

/// A certificate for one tenant host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostTlsConfig {
    pub host: String,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

impl ServerConfig {
    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Collects every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.listen.parse::<SocketAddr>().is_err() {
            problems.push(format!("listen `{}` is not a socket address", self.listen));
        }
        if let Some(addr) = &self.quic.listen {
            if addr.parse::<SocketAddr>().is_err() {
                problems.push(format!("quic.listen `{addr}` is not a socket address"));
            }
        }
        let p = self.protocols;
        if !p.http1 && !p.http2 && !p.quic {
            problems.push("at least one protocol must be enabled".to_owned());
        }
        if p.quic && self.tls.is_none() {
            problems.push("quic requires [tls]".to_owned());
        }
        if let Some(tls) = &self.tls {
            if tls.cert_path.is_empty() || tls.key_path.is_empty() {
                problems.push("tls.cert_path and tls.key_path must be set".to_owned());
            }
        }
        if self.limits.max_connections == 0 {
            problems.push("limits.max_connections must be greater than 0".to_owned());
        }
        if self.limits.max_header_size < 1024 {
            problems.push("limits.max_header_size must be at least 1024".to_owned());
        }
        if self.limits.buffer_size < 8192 {
            problems.push("limits.buffer_size must be at least 8192".to_owned());
        }

        let mut seen = std::collections::HashSet::new();
        for t in &self.tenants {
            if t.id.trim().is_empty() {
                problems.push("tenant id must not be empty".to_owned());
            } else if !seen.insert(t.id.as_str()) {
                problems.push(format!("tenant `{}` declared twice", t.id));
            }
            for h in &t.tls_hosts {
                if !t.hosts.iter().any(|x| x.eq_ignore_ascii_case(&h.host)) {
                    problems.push(format!("tls host `{}` is not a host of tenant `{}`", h.host, t.id));
                }
            }
        }

        if problems.is_empty() { Ok(()) } else { Err(ConfigError::Invalid(problems)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_the_default() {
        let cfg = ServerConfig::from_toml("").unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert!(cfg.protocols.http1 && cfg.protocols.http2 && !cfg.protocols.quic);
        assert_eq!(cfg.timeouts.request(), None);
        assert_eq!(cfg.timeouts.read(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn parses_tenants_with_opaque_config() {
        let cfg = ServerConfig::from_toml(
            r#"
            [[tenants]]
            id = "tenant-acme"
            hosts = ["acme.example.com"]
            config = { plan = "enterprise", seats = 50 }

            [[tenants.tls_hosts]]
            host = "acme.example.com"
            cert_path = "acme.pem"
            key_path = "acme.key"
            "#,
        )
        .unwrap();
        let t = &cfg.tenants[0];
        assert_eq!(t.config["seats"], 50);
        assert_eq!(t.tls_hosts[0].tls.key_path, "acme.key");
    }

    #[test]
    fn validation_reports_every_problem() {
        let err = ServerConfig::from_toml(
            r#"
            listen = "nowhere"
            [protocols]
            http1 = false
            http2 = false
            quic = true
            [limits]
            max_connections = 0
            "#,
        )
        .unwrap_err();
        let ConfigError::Invalid(problems) = err else { panic!("expected validation error") };
        assert_eq!(problems.len(), 3, "{problems:?}");
    }

    #[test]
    fn hsts_header_value() {
        let h = HstsConfig { enabled: true, max_age_secs: 600, include_subdomains: true, preload: true };
        assert_eq!(h.header_value(), "max-age=600; includeSubDomains; preload");
    }
}
