//! Root hints: the bootstrap nameserver set used when the cache holds no
//! deeper zone cut.

use crate::cache::CacheDb;
use crate::rdataset::Rdataset;
use compact_str::CompactString;
use hickory_proto::rr::Name;
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use taproot_domain::{HintServer, ResolverError};

const HINT_TTL: u32 = 518400;

/// Built-in root server set, used when the configuration supplies no hints.
const ROOT_SERVERS: &[(&str, &[&str])] = &[
    ("a.root-servers.net.", &["198.41.0.4", "2001:503:ba3e::2:30"]),
    ("b.root-servers.net.", &["170.247.170.2", "2801:1b8:10::b"]),
    ("c.root-servers.net.", &["192.33.4.12", "2001:500:2::c"]),
    ("d.root-servers.net.", &["199.7.91.13", "2001:500:2d::d"]),
    ("e.root-servers.net.", &["192.203.230.10", "2001:500:a8::e"]),
    ("f.root-servers.net.", &["192.5.5.241", "2001:500:2f::f"]),
    ("g.root-servers.net.", &["192.112.36.4", "2001:500:12::d0d"]),
    ("h.root-servers.net.", &["198.97.190.53", "2001:500:1::53"]),
    ("i.root-servers.net.", &["192.36.148.17", "2001:7fe::53"]),
    ("j.root-servers.net.", &["192.58.128.30", "2001:503:c27::2:30"]),
    ("k.root-servers.net.", &["193.0.14.129", "2001:7fd::1"]),
    ("l.root-servers.net.", &["199.7.83.42", "2001:500:9f::42"]),
    ("m.root-servers.net.", &["202.12.27.33", "2001:dc3::35"]),
];

pub struct Hints {
    zone: Name,
    ns: Rdataset,
    addresses: HashMap<CompactString, Vec<IpAddr>>,
}

impl Hints {
    /// Hints for an arbitrary zone apex. Used directly by tests, which point
    /// the resolver at mock servers instead of the real root.
    pub fn new(zone: Name, servers: &[(Name, Vec<IpAddr>)]) -> Self {
        let ns_names: Vec<Name> = servers.iter().map(|(n, _)| n.clone()).collect();
        let ns = Rdataset::from_ns_names(zone.clone(), HINT_TTL, &ns_names);
        let addresses = servers
            .iter()
            .map(|(n, addrs)| (CacheDb::name_key(n), addrs.clone()))
            .collect();
        Self {
            zone,
            ns,
            addresses,
        }
    }

    pub fn builtin_root() -> Self {
        let servers: Vec<(Name, Vec<IpAddr>)> = ROOT_SERVERS
            .iter()
            .map(|(name, addrs)| {
                let name = Name::from_str(name).expect("builtin hint name");
                let addrs = addrs
                    .iter()
                    .map(|a| a.parse().expect("builtin hint address"))
                    .collect();
                (name, addrs)
            })
            .collect();
        Self::new(Name::root(), &servers)
    }

    /// Hints from the `[[hints]]` configuration section, rooted at `.`.
    pub fn from_config(servers: &[HintServer]) -> Result<Self, ResolverError> {
        if servers.is_empty() {
            return Ok(Self::builtin_root());
        }
        let mut parsed = Vec::with_capacity(servers.len());
        for server in servers {
            let name = Name::from_str(&server.name)
                .map_err(|e| ResolverError::InvalidName(format!("{}: {}", server.name, e)))?;
            parsed.push((name, server.addresses.clone()));
        }
        Ok(Self::new(Name::root(), &parsed))
    }

    pub fn zone(&self) -> &Name {
        &self.zone
    }

    pub fn ns(&self) -> &Rdataset {
        &self.ns
    }

    pub fn addresses_for(&self, name: &Name) -> &[IpAddr] {
        self.addresses
            .get(&CacheDb::name_key(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
