//! Concurrent route table mapping virtual hosts to backend endpoints
//!
//! The table is written by the discovery reconciler and read on the hot path of
//! every inbound connection. Writers update individual entries, so readers are
//! never blocked for the duration of a full reconciliation pass.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Protocol qualifier distinguishing non-default routes that share a hostname
/// (e.g. SSH tunneling on port 22).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Qualifier {
    pub scheme: String,
    pub port: u16,
}

impl Qualifier {
    pub fn new(scheme: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into().to_ascii_lowercase(),
            port,
        }
    }
}

/// Lookup unit of the route table: a virtual host plus an optional qualifier.
///
/// An unqualified key never matches a qualified one, even for the same host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    host: String,
    qualifier: Option<Qualifier>,
}

impl RoutingKey {
    /// Key for plain HTTP routing by Host header
    pub fn host(host: impl AsRef<str>) -> Self {
        Self {
            host: host.as_ref().to_ascii_lowercase(),
            qualifier: None,
        }
    }

    pub fn qualified(host: impl AsRef<str>, qualifier: Qualifier) -> Self {
        Self {
            host: host.as_ref().to_ascii_lowercase(),
            qualifier: Some(qualifier),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.host
    }

    pub fn qualifier(&self) -> Option<&Qualifier> {
        self.qualifier.as_ref()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}://{}:{}", q.scheme, self.host, q.port),
            None => f.write_str(&self.host),
        }
    }
}

/// Backend network address a route resolves to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form suitable for dialing and for URI authorities.
    /// IPv6 literals are bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Base URL used when forwarding HTTP requests to this endpoint
    pub fn http_base(&self) -> String {
        format!("http://{}", self.authority())
    }

    fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// A single route: key plus the endpoint it resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub key: RoutingKey,
    pub target: Endpoint,
}

impl RouteEntry {
    pub fn new(key: RoutingKey, target: Endpoint) -> Self {
        Self { key, target }
    }
}

/// Shared handle to the route table
pub type SharedRouteTable = Arc<RouteTable>;

/// Outcome of a [`RouteTable::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No entry existed for the key
    Inserted,
    /// An entry existed and pointed elsewhere
    Updated,
    /// An identical entry already existed
    Unchanged,
    /// Endpoint had an empty host or port 0 and was not stored
    Rejected,
}

/// Concurrent map of routing keys to endpoints.
///
/// Each entry is replaced atomically: a reader sees either the old or the new
/// endpoint, never a host from one write and a port from another.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<RoutingKey, Endpoint>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    pub fn shared() -> SharedRouteTable {
        Arc::new(Self::new())
    }

    /// Insert or overwrite the entry for `key` (last write wins)
    pub fn put(&self, key: RoutingKey, endpoint: Endpoint) -> PutOutcome {
        if !endpoint.is_valid() {
            return PutOutcome::Rejected;
        }
        match self.routes.insert(key, endpoint.clone()) {
            None => PutOutcome::Inserted,
            Some(previous) if previous == endpoint => PutOutcome::Unchanged,
            Some(_) => PutOutcome::Updated,
        }
    }

    pub fn put_entry(&self, entry: RouteEntry) -> PutOutcome {
        self.put(entry.key, entry.target)
    }

    pub fn get(&self, key: &RoutingKey) -> Option<Endpoint> {
        self.routes.get(key).map(|entry| entry.value().clone())
    }

    pub fn has(&self, key: &RoutingKey) -> bool {
        self.routes.contains_key(key)
    }

    /// Remove a route. Only used by the opt-in eviction policy.
    pub fn remove(&self, key: &RoutingKey) -> Option<Endpoint> {
        self.routes.remove(key).map(|(_, endpoint)| endpoint)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Point-in-time copy of all routes, sorted by key for stable output
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        let mut entries: Vec<RouteEntry> = self
            .routes
            .iter()
            .map(|entry| RouteEntry::new(entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by_cached_key(|entry| entry.key.to_string());
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh() -> Qualifier {
        Qualifier::new("ssh", 22)
    }

    #[test]
    fn test_put_then_get() {
        let table = RouteTable::new();
        let key = RoutingKey::host("app.example.com");

        assert_eq!(
            table.put(key.clone(), Endpoint::new("127.0.0.1", 9000)),
            PutOutcome::Inserted
        );
        assert_eq!(table.get(&key), Some(Endpoint::new("127.0.0.1", 9000)));
        assert!(table.has(&key));
        assert!(!table.has(&RoutingKey::host("other.example.com")));
    }

    #[test]
    fn test_overwrite_is_last_write_wins() {
        let table = RouteTable::new();
        let key = RoutingKey::host("app");

        table.put(key.clone(), Endpoint::new("172.17.0.2", 8080));
        assert_eq!(
            table.put(key.clone(), Endpoint::new("172.17.0.2", 8080)),
            PutOutcome::Unchanged
        );
        assert_eq!(
            table.put(key.clone(), Endpoint::new("172.17.0.3", 8080)),
            PutOutcome::Updated
        );
        assert_eq!(table.get(&key), Some(Endpoint::new("172.17.0.3", 8080)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_qualifier_isolation() {
        let table = RouteTable::new();
        table.put(RoutingKey::host("a"), Endpoint::new("10.0.0.1", 8080));
        table.put(
            RoutingKey::qualified("a", ssh()),
            Endpoint::new("10.0.0.1", 22),
        );

        assert_eq!(
            table.get(&RoutingKey::host("a")),
            Some(Endpoint::new("10.0.0.1", 8080))
        );
        assert_eq!(
            table.get(&RoutingKey::qualified("a", ssh())),
            Some(Endpoint::new("10.0.0.1", 22))
        );
        // Same scheme, different port is a different key
        assert_eq!(
            table.get(&RoutingKey::qualified("a", Qualifier::new("ssh", 2222))),
            None
        );
    }

    #[test]
    fn test_unqualified_lookup_ignores_qualified_routes() {
        let table = RouteTable::new();
        table.put(
            RoutingKey::qualified("box", ssh()),
            Endpoint::new("10.0.0.9", 22),
        );

        assert!(!table.has(&RoutingKey::host("box")));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let table = RouteTable::new();
        table.put(RoutingKey::host("App.Example.COM"), Endpoint::new("h", 1));
        assert!(table.has(&RoutingKey::host("app.example.com")));

        table.put(RoutingKey::qualified("Box", Qualifier::new("SSH", 22)), Endpoint::new("h", 22));
        assert!(table.has(&RoutingKey::qualified("box", Qualifier::new("ssh", 22))));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let table = RouteTable::new();
        assert_eq!(
            table.put(RoutingKey::host("a"), Endpoint::new("", 80)),
            PutOutcome::Rejected
        );
        assert_eq!(
            table.put(RoutingKey::host("a"), Endpoint::new("10.0.0.1", 0)),
            PutOutcome::Rejected
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove() {
        let table = RouteTable::new();
        let key = RoutingKey::host("gone");
        table.put(key.clone(), Endpoint::new("10.0.0.1", 80));
        assert_eq!(table.remove(&key), Some(Endpoint::new("10.0.0.1", 80)));
        assert_eq!(table.remove(&key), None);
    }

    #[test]
    fn test_snapshot_sorted() {
        let table = RouteTable::new();
        table.put(RoutingKey::host("b"), Endpoint::new("h", 2));
        table.put(RoutingKey::host("a"), Endpoint::new("h", 1));
        let keys: Vec<String> = table
            .snapshot()
            .into_iter()
            .map(|e| e.key.to_string())
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_display() {
        assert_eq!(RoutingKey::host("a.b").to_string(), "a.b");
        assert_eq!(
            RoutingKey::qualified("a.b", ssh()).to_string(),
            "ssh://a.b:22"
        );
        assert_eq!(Endpoint::new("10.0.0.1", 22).to_string(), "10.0.0.1:22");
        assert_eq!(Endpoint::new("fd00::1", 80).authority(), "[fd00::1]:80");
    }

    #[test]
    fn test_concurrent_readers_see_whole_endpoints() {
        let table = RouteTable::shared();
        let key = RoutingKey::host("race");
        let a = Endpoint::new("10.0.0.1", 1111);
        let b = Endpoint::new("10.0.0.2", 2222);
        table.put(key.clone(), a.clone());

        let writer = {
            let table = Arc::clone(&table);
            let key = key.clone();
            let (a, b) = (a.clone(), b.clone());
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    let next = if i % 2 == 0 { b.clone() } else { a.clone() };
                    table.put(key.clone(), next);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                let key = key.clone();
                let (a, b) = (a.clone(), b.clone());
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        let seen = table.get(&key).expect("route present");
                        assert!(seen == a || seen == b, "torn read: {}", seen);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
