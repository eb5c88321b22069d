//! TLS material and per-host certificate selection.
//!
//! Each handshake picks a certificate by SNI: the tenant host's own
//! certificate when the registry currently has one, the server-wide `[tls]`
//! certificate otherwise. Host certificates registered while the server runs
//! are loaded on their first handshake and cached by file path.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, info, warn};

use crate::config::{ProtocolConfig, TlsConfig};
use crate::error::Error;
use crate::tenant::TenantRegistry;

// ── PEM loading ───────────────────────────────────────────────────────────────

fn open(path: &str) -> Result<BufReader<File>, Error> {
    File::open(Path::new(path))
        .map(BufReader::new)
        .map_err(|e| Error::Tls(format!("cannot open `{path}`: {e}")))
}

/// Reads every certificate in a PEM file, leaf first.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid certificate PEM in `{path}`: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in `{path}`")));
    }
    Ok(certs)
}

/// Reads the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| Error::Tls(format!("invalid key PEM in `{path}`: {e}")))?
        .ok_or_else(|| Error::Tls(format!("no private key found in `{path}`")))
}

/// Loads a certificate chain and its key as one signing identity.
pub fn load_certified_key(tls: &TlsConfig) -> Result<Arc<CertifiedKey>, Error> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_key(&tls.key_path)?;
    let signing_key = ring::sign::any_supported_type(&key)
        .map_err(|e| Error::Tls(format!("unsupported key in `{}`: {e}", tls.key_path)))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

// ── SNI ───────────────────────────────────────────────────────────────────────

/// Chooses a certificate by the SNI hostname of each handshake, reading the
/// registry as it is at that moment.
pub struct SniResolver {
    registry: Arc<TenantRegistry>,
    default: Option<Arc<CertifiedKey>>,
    loaded: RwLock<HashMap<TlsConfig, Arc<CertifiedKey>>>,
}

impl SniResolver {
    /// Loads the server-wide certificate (if any) and every host certificate
    /// currently in `registry`, so bad files fail at startup.
    pub fn from_registry(default: Option<&TlsConfig>, registry: Arc<TenantRegistry>) -> Result<Self, Error> {
        let default = default.map(load_certified_key).transpose()?;
        let mut loaded = HashMap::new();
        for (host, tls) in registry.tls_hosts() {
            debug!(host = %host, cert = %tls.cert_path, "loading host certificate");
            let key = load_certified_key(&tls)?;
            loaded.insert(tls, key);
        }
        if default.is_none() && loaded.is_empty() {
            return Err(Error::Tls("no certificates configured".to_owned()));
        }
        info!(hosts = loaded.len(), default = default.is_some(), "tls certificates loaded");
        Ok(Self { registry, default, loaded: RwLock::new(loaded) })
    }

    fn pick(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(tls) = server_name.and_then(|name| self.registry.host_config(name)).and_then(|c| c.tls) else {
            return self.default.clone();
        };
        match self.certified(&tls) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(cert = %tls.cert_path, error = %e, "host certificate unusable, using default");
                self.default.clone()
            }
        }
    }

    fn certified(&self, tls: &TlsConfig) -> Result<Arc<CertifiedKey>, Error> {
        if let Some(key) = self.loaded.read().unwrap_or_else(PoisonError::into_inner).get(tls) {
            return Ok(Arc::clone(key));
        }
        let key = load_certified_key(tls)?;
        debug!(cert = %tls.cert_path, "host certificate loaded on demand");

        let live: HashSet<TlsConfig> = self.registry.tls_hosts().into_iter().map(|(_, t)| t).collect();
        let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
        loaded.retain(|t, _| live.contains(t));
        loaded.insert(tls.clone(), Arc::clone(&key));
        Ok(key)
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("SniResolver")
            .field("default", &self.default.is_some())
            .field("loaded", &loaded)
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.pick(client_hello.server_name())
    }
}

// ── Server configs ────────────────────────────────────────────────────────────

/// ALPN identifiers for the enabled TCP protocols, preferred first.
pub(crate) fn alpn_for(protocols: ProtocolConfig) -> Vec<Vec<u8>> {
    let mut alpn = Vec::new();
    if protocols.http2 {
        alpn.push(b"h2".to_vec());
    }
    if protocols.http1 {
        alpn.push(b"http/1.1".to_vec());
    }
    alpn
}

/// rustls configuration for the TCP listener (TLS 1.2 and 1.3).
pub fn server_config(resolver: Arc<SniResolver>, protocols: ProtocolConfig) -> Result<rustls::ServerConfig, Error> {
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn_for(protocols);
    Ok(config)
}

/// rustls configuration for QUIC: TLS 1.3 only, ALPN `h3`, optional 0-RTT.
#[cfg(feature = "quic")]
pub fn quic_server_config(resolver: Arc<SniResolver>, enable_0rtt: bool) -> Result<rustls::ServerConfig, Error> {
    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h3".to_vec()];
    // QUIC accepts only 0 or u32::MAX here.
    config.max_early_data_size = if enable_0rtt { u32::MAX } else { 0 };
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
    }

    fn host_tls(host: &str) -> TlsConfig {
        TlsConfig { cert_path: fixture(&format!("{host}.pem")), key_path: fixture(&format!("{host}.key")) }
    }

    #[test]
    fn loads_pem_fixtures() {
        assert_eq!(load_certs(&fixture("a.example.com.pem")).unwrap().len(), 1);
        assert!(load_certified_key(&host_tls("a.example.com")).is_ok());
    }

    #[test]
    fn missing_and_empty_files_are_errors() {
        assert!(matches!(load_certs("/nonexistent/cert.pem"), Err(Error::Tls(_))));

        let empty = tempfile::NamedTempFile::new().unwrap();
        let path = empty.path().to_str().unwrap();
        assert!(matches!(load_certs(path), Err(Error::Tls(m)) if m.contains("no certificates")));
        assert!(matches!(load_key(path), Err(Error::Tls(m)) if m.contains("no private key")));
    }

    #[test]
    fn picks_host_certificate_then_default() {
        let registry = TenantRegistry::new();
        registry.register_tenant("t1", ["a.example.com"]).unwrap();
        registry.set_host_tls("a.example.com", Some(host_tls("a.example.com"))).unwrap();

        let resolver = SniResolver::from_registry(Some(&host_tls("localhost")), Arc::new(registry)).unwrap();
        let a = resolver.pick(Some("A.example.com")).unwrap();
        let fallback = resolver.pick(Some("other.example.com")).unwrap();
        let no_sni = resolver.pick(None).unwrap();

        assert_eq!(a.cert[0], load_certs(&fixture("a.example.com.pem")).unwrap()[0]);
        assert_eq!(fallback.cert[0], load_certs(&fixture("localhost.pem")).unwrap()[0]);
        assert_eq!(no_sni.cert, fallback.cert);
    }

    #[test]
    fn no_certificates_at_all_is_an_error() {
        assert!(SniResolver::from_registry(None, Arc::new(TenantRegistry::new())).is_err());
    }

    #[test]
    fn follows_registry_changes_after_startup() {
        let registry = Arc::new(TenantRegistry::new());
        registry.register_tenant("t1", ["a.example.com"]).unwrap();
        let resolver = SniResolver::from_registry(Some(&host_tls("localhost")), Arc::clone(&registry)).unwrap();
        let default_cert = load_certs(&fixture("localhost.pem")).unwrap()[0].clone();
        let a_cert = load_certs(&fixture("a.example.com.pem")).unwrap()[0].clone();

        assert_eq!(resolver.pick(Some("a.example.com")).unwrap().cert[0], default_cert);

        registry.set_host_tls("a.example.com", Some(host_tls("a.example.com"))).unwrap();
        assert_eq!(resolver.pick(Some("a.example.com")).unwrap().cert[0], a_cert);

        registry.deregister_host("a.example.com");
        assert_eq!(resolver.pick(Some("a.example.com")).unwrap().cert[0], default_cert);
    }

    #[test]
    fn unreadable_late_certificate_falls_back_to_default() {
        let registry = Arc::new(TenantRegistry::new());
        registry.register_tenant("t1", ["a.example.com"]).unwrap();
        let resolver = SniResolver::from_registry(Some(&host_tls("localhost")), Arc::clone(&registry)).unwrap();

        let missing = TlsConfig { cert_path: "/nonexistent.pem".into(), key_path: "/nonexistent.key".into() };
        registry.set_host_tls("a.example.com", Some(missing)).unwrap();
        let picked = resolver.pick(Some("a.example.com")).unwrap();
        assert_eq!(picked.cert[0], load_certs(&fixture("localhost.pem")).unwrap()[0]);
    }

    #[test]
    fn alpn_follows_enabled_protocols() {
        let both = ProtocolConfig { http1: true, http2: true, quic: false };
        assert_eq!(alpn_for(both), vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        let h1 = ProtocolConfig { http1: true, http2: false, quic: false };
        assert_eq!(alpn_for(h1), vec![b"http/1.1".to_vec()]);
    }
}
