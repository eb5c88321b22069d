//! Host-based tenant registry.
//!
//! Maps hostnames to tenants. Many hosts may point at one tenant; one host
//! points at most at one tenant.
//!
//! | Operation | Conflict |
//! |---|---|
//! | [`register_tenant`](TenantRegistry::register_tenant) | host owned by another tenant → `DuplicateHost` |
//! | [`register_host`](TenantRegistry::register_host) | host already registered → `DuplicateHost`, tenant absent → `UnknownTenant` |
//!
//! Every mutation takes the write half of one `RwLock` covering both the
//! host map and the tenant map, so a concurrent [`resolve_host`](TenantRegistry::resolve_host)
//! observes the registry either entirely before or entirely after it.
//!
//! ```rust
//! use portico::{HostConfig, TenantId, TenantRegistry};
//!
//! let registry = TenantRegistry::new();
//! registry.register_tenant("tenant-acme", ["acme.example.com"]).unwrap();
//! registry.register_host("api.acme.example.com", HostConfig::new(TenantId::new("tenant-acme").unwrap())).unwrap();
//!
//! assert_eq!(registry.resolve_host("API.acme.example.com:8443").unwrap(), "tenant-acme");
//! assert!(registry.resolve_host("unknown.example.com").is_none());
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{HostMatching, TenantConfig, TlsConfig};
use crate::error::RegistryError;

// ── Identifiers ───────────────────────────────────────────────────────────────

/// A non-empty tenant identifier.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self, RegistryError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RegistryError::InvalidTenantId);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl TryFrom<String> for TenantId {
    type Error = RegistryError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Self::new(s) }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> String { id.0 }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for TenantId {
    fn eq(&self, other: &str) -> bool { self.0 == other }
}

impl PartialEq<&str> for TenantId {
    fn eq(&self, other: &&str) -> bool { self.0 == *other }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// One hostname's registration: its tenant and optional TLS material used
/// for SNI certificate selection.
#[derive(Clone, Debug, PartialEq)]
pub struct HostConfig {
    pub tenant: TenantId,
    pub tls: Option<TlsConfig>,
}

impl HostConfig {
    pub fn new(tenant: TenantId) -> Self {
        Self { tenant, tls: None }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// A read-only snapshot of one tenant.
#[derive(Clone, Debug)]
pub struct TenantInfo {
    pub id: TenantId,
    pub hosts: BTreeSet<String>,
    pub config: Arc<serde_json::Value>,
}

struct TenantEntry {
    hosts: BTreeSet<String>,
    config: Arc<serde_json::Value>,
}

#[derive(Default)]
struct Inner {
    hosts: HashMap<String, HostConfig>,
    tenants: HashMap<TenantId, TenantEntry>,
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Hostname → tenant mapping shared by every connection.
///
/// Build one at startup, wrap it in an `Arc`, and hand it to the
/// [`Dispatcher`](crate::Dispatcher). It can keep being mutated while
/// traffic flows.
pub struct TenantRegistry {
    matching: HostMatching,
    inner: RwLock<Inner>,
}

impl TenantRegistry {
    /// An empty registry with default host matching (case-insensitive,
    /// port-stripping).
    pub fn new() -> Self {
        Self::with_matching(HostMatching::default())
    }

    pub fn with_matching(matching: HostMatching) -> Self {
        Self { matching, inner: RwLock::new(Inner::default()) }
    }

    /// Builds a registry from configuration, registering every tenant in order.
    pub fn from_config(tenants: &[TenantConfig], matching: HostMatching) -> Result<Self, RegistryError> {
        let registry = Self::with_matching(matching);
        registry.register_config(tenants)?;
        Ok(registry)
    }

    /// Registers (or replaces) every tenant in `tenants`, in order, with
    /// their configuration blobs and host certificates.
    pub fn register_config(&self, tenants: &[TenantConfig]) -> Result<(), RegistryError> {
        for t in tenants {
            self.register_tenant_with_config(&t.id, &t.hosts, t.config.clone())?;
            for host in &t.tls_hosts {
                self.set_host_tls(&host.host, Some(host.tls.clone()))?;
            }
        }
        Ok(())
    }

    pub fn matching(&self) -> HostMatching { self.matching }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn normalize_or_err(&self, host: &str) -> Result<String, RegistryError> {
        normalize_host(host, self.matching).ok_or_else(|| RegistryError::InvalidHostname(host.to_owned()))
    }

    // ── Writes ────────────────────────────────────────────────────────────────

    /// Creates or replaces a tenant's host set. The tenant's configuration
    /// blob is kept (or `null` for a new tenant).
    pub fn register_tenant<I>(&self, id: &str, hosts: I) -> Result<(), RegistryError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.upsert_tenant(id, hosts, None)
    }

    /// Like [`register_tenant`](Self::register_tenant), also replacing the
    /// configuration blob.
    pub fn register_tenant_with_config<I>(&self, id: &str, hosts: I, config: serde_json::Value) -> Result<(), RegistryError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        self.upsert_tenant(id, hosts, Some(config))
    }

    fn upsert_tenant<I>(&self, id: &str, hosts: I, config: Option<serde_json::Value>) -> Result<(), RegistryError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let id = TenantId::new(id)?;
        let wanted = hosts
            .into_iter()
            .map(|h| self.normalize_or_err(h.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()?;

        let mut inner = self.write();

        // Validate everything before touching either map.
        for host in &wanted {
            if let Some(existing) = inner.hosts.get(host) {
                if existing.tenant != id {
                    return Err(RegistryError::DuplicateHost {
                        host: host.clone(),
                        tenant: existing.tenant.to_string(),
                    });
                }
            }
        }

        let previous = inner.tenants.remove(&id);
        let (old_hosts, old_config) = match previous {
            Some(entry) => (entry.hosts, Some(entry.config)),
            None => (BTreeSet::new(), None),
        };

        for stale in old_hosts.difference(&wanted) {
            inner.hosts.remove(stale);
        }
        for host in &wanted {
            inner.hosts
                .entry(host.clone())
                .or_insert_with(|| HostConfig::new(id.clone()));
        }

        let config = match (config, old_config) {
            (Some(new), _) => Arc::new(new),
            (None, Some(old)) => old,
            (None, None) => Arc::new(serde_json::Value::Null),
        };

        info!(tenant = %id, hosts = wanted.len(), "tenant registered");
        inner.tenants.insert(id, TenantEntry { hosts: wanted, config });
        Ok(())
    }

    /// Adds one host to an existing tenant.
    pub fn register_host(&self, hostname: &str, config: HostConfig) -> Result<(), RegistryError> {
        let host = self.normalize_or_err(hostname)?;
        let mut inner = self.write();

        if let Some(existing) = inner.hosts.get(&host) {
            return Err(RegistryError::DuplicateHost {
                host,
                tenant: existing.tenant.to_string(),
            });
        }
        let Some(entry) = inner.tenants.get_mut(&config.tenant) else {
            return Err(RegistryError::UnknownTenant(config.tenant.to_string()));
        };
        entry.hosts.insert(host.clone());

        info!(host = %host, tenant = %config.tenant, "host registered");
        inner.hosts.insert(host, config);
        Ok(())
    }

    /// Replaces the TLS material of an already registered host.
    pub fn set_host_tls(&self, hostname: &str, tls: Option<TlsConfig>) -> Result<(), RegistryError> {
        let host = self.normalize_or_err(hostname)?;
        let mut inner = self.write();
        match inner.hosts.get_mut(&host) {
            Some(cfg) => {
                cfg.tls = tls;
                Ok(())
            }
            None => Err(RegistryError::InvalidHostname(host)),
        }
    }

    /// Removes one host. Its tenant stays registered.
    pub fn deregister_host(&self, hostname: &str) -> Option<HostConfig> {
        let host = normalize_host(hostname, self.matching)?;
        let mut inner = self.write();
        let removed = inner.hosts.remove(&host)?;
        if let Some(entry) = inner.tenants.get_mut(&removed.tenant) {
            entry.hosts.remove(&host);
        }
        Some(removed)
    }

    /// Removes a tenant and every host pointing at it.
    pub fn remove_tenant(&self, id: &str) -> Option<TenantInfo> {
        let id = TenantId::new(id).ok()?;
        let mut inner = self.write();
        let entry = inner.tenants.remove(&id)?;
        for host in &entry.hosts {
            inner.hosts.remove(host);
        }
        info!(tenant = %id, "tenant removed");
        Some(TenantInfo { id, hosts: entry.hosts, config: entry.config })
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    /// Exact-match lookup after normalisation.
    pub fn resolve_host(&self, hostname: &str) -> Option<TenantId> {
        let host = normalize_host(hostname, self.matching)?;
        self.read().hosts.get(&host).map(|c| c.tenant.clone())
    }

    /// Resolves a host to its tenant and the tenant's configuration in one
    /// read.
    pub(crate) fn resolve(&self, hostname: &str) -> Option<(TenantId, Arc<serde_json::Value>)> {
        let host = normalize_host(hostname, self.matching)?;
        let inner = self.read();
        let Some(cfg) = inner.hosts.get(&host) else {
            debug!(host = %host, "host not registered");
            return None;
        };
        let config = inner.tenants.get(&cfg.tenant).map(|e| Arc::clone(&e.config))?;
        Some((cfg.tenant.clone(), config))
    }

    pub fn host_config(&self, hostname: &str) -> Option<HostConfig> {
        let host = normalize_host(hostname, self.matching)?;
        self.read().hosts.get(&host).cloned()
    }

    pub fn tenant_info(&self, id: &str) -> Option<TenantInfo> {
        let id = TenantId::new(id).ok()?;
        let inner = self.read();
        let entry = inner.tenants.get(&id)?;
        Some(TenantInfo {
            id,
            hosts: entry.hosts.clone(),
            config: Arc::clone(&entry.config),
        })
    }

    /// Every registered tenant id, sorted.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut ids: Vec<_> = self.read().tenants.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every host with TLS material, for building the SNI certificate resolver.
    pub fn tls_hosts(&self) -> Vec<(String, TlsConfig)> {
        self.read()
            .hosts
            .iter()
            .filter_map(|(h, c)| c.tls.clone().map(|t| (h.clone(), t)))
            .collect()
    }
}

impl Default for TenantRegistry {
    fn default() -> Self { Self::new() }
}

// ── Normalisation ─────────────────────────────────────────────────────────────

/// Applies `matching` to a raw host value. Returns `None` for an empty host.
///
/// Port stripping understands bracketed IPv6 literals (`[::1]:8080`); a bare
/// IPv6 address (more than one colon, no brackets) is left intact.
pub fn normalize_host(raw: &str, matching: HostMatching) -> Option<String> {
    let mut host = raw.trim();
    if matching.strip_port {
        if host.starts_with('[') {
            if let Some(end) = host.find(']') {
                host = &host[..=end];
            }
        } else if host.matches(':').count() == 1 {
            host = host.split(':').next().unwrap_or(host);
        }
    }
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some(if matching.case_insensitive {
        host.to_ascii_lowercase()
    } else {
        host.to_owned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    #[test]
    fn normalisation() {
        let on = HostMatching::default();
        assert_eq!(normalize_host("Acme.Example.com:8080", on).as_deref(), Some("acme.example.com"));
        assert_eq!(normalize_host("[::1]:443", on).as_deref(), Some("[::1]"));
        assert_eq!(normalize_host("::1", on).as_deref(), Some("::1"));
        assert_eq!(normalize_host("example.com.", on).as_deref(), Some("example.com"));
        assert_eq!(normalize_host("  ", on), None);
        assert_eq!(normalize_host(":80", on), None);

        let exact = HostMatching { case_insensitive: false, strip_port: false };
        assert_eq!(normalize_host("Acme.example.com:8080", exact).as_deref(), Some("Acme.example.com:8080"));
    }

    #[test]
    fn resolve_registered_and_unknown_hosts() {
        let r = TenantRegistry::new();
        r.register_tenant("t1", ["a.example.com"]).unwrap();
        assert_eq!(r.resolve_host("a.example.com"), Some(tid("t1")));
        assert_eq!(r.resolve_host("unknown.example.com"), None);
    }

    #[test]
    fn reregistering_a_tenant_replaces_its_hosts() {
        let r = TenantRegistry::new();
        r.register_tenant_with_config("t1", ["a.example.com", "b.example.com"], serde_json::json!({"plan": "pro"}))
            .unwrap();
        r.register_tenant("t1", ["b.example.com", "c.example.com"]).unwrap();

        assert_eq!(r.resolve_host("a.example.com"), None);
        assert_eq!(r.resolve_host("b.example.com"), Some(tid("t1")));
        assert_eq!(r.resolve_host("c.example.com"), Some(tid("t1")));

        let info = r.tenant_info("t1").unwrap();
        assert_eq!(info.hosts.iter().map(String::as_str).collect::<Vec<_>>(), ["b.example.com", "c.example.com"]);
        assert_eq!(info.config["plan"], "pro");
    }

    #[test]
    fn kept_hosts_retain_tls_on_reregistration() {
        let r = TenantRegistry::new();
        r.register_tenant("t1", ["a.example.com"]).unwrap();
        let tls = TlsConfig { cert_path: "a.pem".into(), key_path: "a.key".into() };
        r.set_host_tls("a.example.com", Some(tls.clone())).unwrap();
        r.register_tenant("t1", ["a.example.com", "b.example.com"]).unwrap();
        assert_eq!(r.host_config("a.example.com").unwrap().tls, Some(tls));
        assert_eq!(r.tls_hosts().len(), 1);
    }

    #[test]
    fn registration_conflicts() {
        let r = TenantRegistry::new();
        assert_eq!(r.register_tenant("", ["x.example.com"]), Err(RegistryError::InvalidTenantId));
        assert_eq!(
            r.register_host("x.example.com", HostConfig::new(tid("ghost"))),
            Err(RegistryError::UnknownTenant("ghost".into()))
        );

        r.register_tenant("t1", ["a.example.com"]).unwrap();
        r.register_tenant("t2", Vec::<String>::new()).unwrap();
        assert!(matches!(
            r.register_host("A.example.com", HostConfig::new(tid("t2"))),
            Err(RegistryError::DuplicateHost { tenant, .. }) if tenant == "t1"
        ));
        assert!(matches!(
            r.register_tenant("t2", ["a.example.com"]),
            Err(RegistryError::DuplicateHost { .. })
        ));
        // A rejected upsert leaves the previous state intact.
        assert_eq!(r.resolve_host("a.example.com"), Some(tid("t1")));
        assert!(r.tenant_info("t2").unwrap().hosts.is_empty());

        r.register_host("b.example.com", HostConfig::new(tid("t2"))).unwrap();
        assert_eq!(r.resolve_host("b.example.com"), Some(tid("t2")));
        assert!(r.tenant_info("t2").unwrap().hosts.contains("b.example.com"));
    }

    #[test]
    fn removal() {
        let r = TenantRegistry::new();
        r.register_tenant("t1", ["a.example.com", "b.example.com"]).unwrap();
        assert!(r.deregister_host("a.example.com").is_some());
        assert_eq!(r.resolve_host("a.example.com"), None);
        assert_eq!(r.tenant_info("t1").unwrap().hosts.len(), 1);

        let removed = r.remove_tenant("t1").unwrap();
        assert_eq!(removed.hosts.len(), 1);
        assert_eq!(r.resolve_host("b.example.com"), None);
        assert!(r.tenants().is_empty());
    }

    #[test]
    fn builds_from_config() {
        let tenants = vec![TenantConfig {
            id: "tenant-acme".into(),
            hosts: vec!["acme.example.com".into()],
            config: serde_json::json!({"theme": "dark"}),
            tls_hosts: Vec::new(),
        }];
        let r = TenantRegistry::from_config(&tenants, HostMatching::default()).unwrap();
        let (id, cfg) = r.resolve("ACME.example.com").unwrap();
        assert_eq!(id, "tenant-acme");
        assert_eq!(cfg["theme"], "dark");
    }
}
