use dg_common::AppError;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::upstream::parse_server_addr;

/// Policy file layout (YAML). Map-valued sections keep document order.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Resolver addresses; required, only the first is used
    #[serde(default)]
    pub upstream: Vec<String>,
    /// Domain suffixes answered with an empty reply
    #[serde(default)]
    pub nxdomain: Vec<String>,
    /// destination → domain suffixes resolved as that destination
    #[serde(default, deserialize_with = "ordered_map")]
    pub redirect: Vec<(String, Vec<String>)>,
    /// domain suffix → fixed addresses
    #[serde(default, rename = "const", deserialize_with = "ordered_map")]
    pub constants: Vec<(String, Vec<IpAddr>)>,
    /// Domain suffixes answered with the querying client's own address
    #[serde(default)]
    pub echo: Vec<String>,
    #[serde(default = "default_listen_addresses")]
    pub listen_addresses: Vec<String>,
    #[serde(default = "default_dns_port")]
    pub port: u16,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_ms: u64,
    /// Query types answered empty without forwarding
    #[serde(default = "default_unsupported_qtypes")]
    pub unsupported_qtypes: Vec<u16>,
    #[serde(default)]
    pub query_log_path: String,
}

// Default functions
fn default_listen_addresses() -> Vec<String> {
    vec!["0.0.0.0".to_string()]
}
fn default_dns_port() -> u16 {
    53
}
fn default_upstream_timeout() -> u64 {
    2000
}
fn default_unsupported_qtypes() -> Vec<u16> {
    vec![65279]
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            upstream: Vec::new(),
            nxdomain: Vec::new(),
            redirect: Vec::new(),
            constants: Vec::new(),
            echo: Vec::new(),
            listen_addresses: default_listen_addresses(),
            port: default_dns_port(),
            upstream_timeout_ms: default_upstream_timeout(),
            unsupported_qtypes: default_unsupported_qtypes(),
            query_log_path: String::new(),
        }
    }
}

impl DnsConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, AppError> {
        serde_yaml::from_str(content).map_err(|e| AppError::Serialization(e.to_string()))
    }

    /// Socket addresses to bind, one per listen address.
    pub fn listen_socket_addrs(&self, port_override: Option<u16>) -> Result<Vec<SocketAddr>, AppError> {
        let port = port_override.unwrap_or(self.port);
        self.listen_addresses
            .iter()
            .map(|addr| {
                // IPv6 addresses need brackets: [addr]:port
                let formatted = if addr.contains(':') {
                    format!("[{}]:{}", addr, port)
                } else {
                    format!("{}:{}", addr, port)
                };
                formatted
                    .parse()
                    .map_err(|_| AppError::Config(format!("invalid listen address: {}", addr)))
            })
            .collect()
    }
}

/// Deserialize a YAML mapping into a list of entries, keeping document order.
fn ordered_map<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct OrderedVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }

        fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_map(OrderedVisitor(PhantomData))
}

/// Where the addresses of a constant answer come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstSource {
    /// Fixed addresses from the policy file
    Static(Vec<IpAddr>),
    /// The address of the client that asked
    Client,
}

/// Immutable policy snapshot shared by every query for the process lifetime.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    upstreams: Vec<SocketAddr>,
    blocklist: FxHashSet<String>,
    /// suffix → destination FQDN
    redirects: FxHashMap<String, String>,
    constants: FxHashMap<String, ConstSource>,
    unsupported_qtypes: FxHashSet<u16>,
    upstream_timeout_ms: u64,
}

impl PolicyConfig {
    pub fn from_config(config: &DnsConfig) -> Result<Self, AppError> {
        let upstreams = config
            .upstream
            .iter()
            .map(|s| {
                parse_server_addr(s)
                    .ok_or_else(|| AppError::Config(format!("invalid upstream address: {}", s)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if upstreams.is_empty() {
            return Err(AppError::Config("no upstream configured".to_string()));
        }

        let blocklist = config
            .nxdomain
            .iter()
            .map(|d| domain_key(d))
            .collect::<Result<FxHashSet<_>, _>>()?;

        // First-listed destination wins when a suffix appears under several
        let mut redirects = FxHashMap::default();
        for (destination, domains) in &config.redirect {
            let destination = fqdn(destination)?;
            for domain in domains {
                redirects.entry(domain_key(domain)?).or_insert_with(|| destination.clone());
            }
        }

        let mut constants = FxHashMap::default();
        for (domain, ips) in &config.constants {
            constants
                .entry(domain_key(domain)?)
                .or_insert_with(|| ConstSource::Static(ips.clone()));
        }
        for domain in &config.echo {
            constants.entry(domain_key(domain)?).or_insert(ConstSource::Client);
        }

        Ok(Self {
            upstreams,
            blocklist,
            redirects,
            constants,
            unsupported_qtypes: config.unsupported_qtypes.iter().copied().collect(),
            upstream_timeout_ms: config.upstream_timeout_ms,
        })
    }

    /// The resolver every forwarded query goes to. Further entries are never used.
    pub fn upstream(&self) -> SocketAddr {
        self.upstreams[0]
    }

    pub fn upstream_timeout_ms(&self) -> u64 {
        self.upstream_timeout_ms
    }

    pub fn is_unsupported_type(&self, qtype: u16) -> bool {
        self.unsupported_qtypes.contains(&qtype)
    }

    pub fn is_blocked(&self, name: &str) -> bool {
        match_suffix(name, |suffix| self.blocklist.contains(suffix).then_some(())).is_some()
    }

    /// Destination FQDN of the longest redirect suffix matching `name`.
    pub fn redirect_for(&self, name: &str) -> Option<&str> {
        match_suffix(name, |suffix| self.redirects.get(suffix)).map(String::as_str)
    }

    pub fn const_for(&self, name: &str) -> Option<&ConstSource> {
        match_suffix(name, |suffix| self.constants.get(suffix))
    }

    pub fn blocked_count(&self) -> usize {
        self.blocklist.len()
    }
}

/// Walk the label suffixes of `name` from longest to shortest:
/// `a.b.example.` → `a.b.example`, `b.example`, `example`.
/// Matches only on label boundaries, case-insensitively.
fn match_suffix<T>(name: &str, mut lookup: impl FnMut(&str) -> Option<T>) -> Option<T> {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }

    let mut check = name.as_str();
    loop {
        if let Some(hit) = lookup(check) {
            return Some(hit);
        }
        match check.find('.') {
            Some(pos) => check = &check[pos + 1..],
            None => return None,
        }
    }
}

/// Configured name without its trailing dot. Rejects names that could not
/// go on the wire: empty labels, labels over 63 bytes, over 253 bytes total.
fn checked_name(domain: &str) -> Result<&str, AppError> {
    let name = domain.trim().trim_end_matches('.');
    let valid = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| !label.is_empty() && label.len() <= 63);
    if !valid {
        return Err(AppError::Config(format!("invalid domain: {:?}", domain)));
    }
    Ok(name)
}

/// Lookup key for a configured domain: lowercase, no trailing dot.
fn domain_key(domain: &str) -> Result<String, AppError> {
    checked_name(domain).map(str::to_ascii_lowercase)
}

/// Configured name as a fully-qualified name, case kept.
fn fqdn(domain: &str) -> Result<String, AppError> {
    checked_name(domain).map(|name| format!("{}.", name))
}
