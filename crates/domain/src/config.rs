use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::errors::ResolverError;

/// What role forwarders play in resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardPolicy {
    /// Forwarders are ignored.
    #[default]
    None,
    /// Try forwarders first, fall back to iterative resolution.
    First,
    /// Use forwarders exclusively; never walk the delegation tree.
    Only,
}

/// Per-zone forwarder override. The deepest matching zone wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForwardZone {
    pub domain: String,

    pub servers: Vec<SocketAddr>,
}

impl ForwardZone {
    pub fn matches_domain(&self, query_domain: &str) -> bool {
        let query_lower = query_domain.trim_end_matches('.').to_lowercase();
        let rule_lower = self.domain.trim_end_matches('.').to_lowercase();

        if rule_lower.is_empty() {
            return true;
        }
        if query_lower == rule_lower {
            return true;
        }
        query_lower.ends_with(&format!(".{}", rule_lower))
    }
}

/// One hint nameserver: the name it answers to and its glue addresses.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HintServer {
    pub name: String,

    pub addresses: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverConfig {
    #[serde(default = "default_nbuckets")]
    pub nbuckets: usize,

    #[serde(default)]
    pub forwarders: Vec<SocketAddr>,

    #[serde(default)]
    pub forward_policy: ForwardPolicy,

    #[serde(default)]
    pub forward_zones: Vec<ForwardZone>,

    /// Absolute lifetime bound of one fetch, in seconds.
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_lame_ttl_secs")]
    pub lame_ttl_secs: u64,

    /// Cap applied to SOA-derived negative TTLs.
    #[serde(default = "default_ncache_max_ttl")]
    pub ncache_max_ttl: u32,

    /// UDP payload size advertised in the EDNS0 OPT pseudo-RR.
    #[serde(default = "default_edns_udp_size")]
    pub edns_udp_size: u16,

    /// Remote port queried on discovered nameservers.
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,

    /// First UDP source port tried when binding the shared dispatchers.
    #[serde(default = "default_query_port_min")]
    pub query_port_min: u16,

    /// Last UDP source port tried (inclusive).
    #[serde(default = "default_query_port_max")]
    pub query_port_max: u16,

    #[serde(default = "default_true")]
    pub bind_ipv4: bool,

    #[serde(default = "default_true")]
    pub bind_ipv6: bool,

    /// Names at or below which cached data must pass the validator hook.
    #[serde(default)]
    pub security_roots: Vec<String>,

    /// Root hints. Empty means the built-in root server set.
    #[serde(default)]
    pub hints: Vec<HintServer>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            nbuckets: default_nbuckets(),
            forwarders: Vec::new(),
            forward_policy: ForwardPolicy::default(),
            forward_zones: Vec::new(),
            lifetime_secs: default_lifetime_secs(),
            max_restarts: default_max_restarts(),
            lame_ttl_secs: default_lame_ttl_secs(),
            ncache_max_ttl: default_ncache_max_ttl(),
            edns_udp_size: default_edns_udp_size(),
            dns_port: default_dns_port(),
            query_port_min: default_query_port_min(),
            query_port_max: default_query_port_max(),
            bind_ipv4: true,
            bind_ipv6: true,
            security_roots: Vec::new(),
            hints: Vec::new(),
        }
    }
}

impl ResolverConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ResolverError> {
        let config: ResolverConfig =
            toml::from_str(s).map_err(|e| ResolverError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ResolverError> {
        if self.nbuckets == 0 {
            return Err(ResolverError::InvalidConfig(
                "nbuckets must be at least 1".into(),
            ));
        }
        if self.query_port_min > self.query_port_max {
            return Err(ResolverError::InvalidConfig(format!(
                "query port range is empty: {}..{}",
                self.query_port_min, self.query_port_max
            )));
        }
        if self.lifetime_secs == 0 {
            return Err(ResolverError::InvalidConfig(
                "lifetime_secs must be nonzero".into(),
            ));
        }
        if !self.bind_ipv4 && !self.bind_ipv6 {
            return Err(ResolverError::InvalidConfig(
                "at least one of bind_ipv4/bind_ipv6 must be enabled".into(),
            ));
        }
        if self.forward_policy == ForwardPolicy::Only
            && self.forwarders.is_empty()
            && self.forward_zones.is_empty()
        {
            return Err(ResolverError::InvalidConfig(
                "forward policy 'only' requires forwarders".into(),
            ));
        }
        Ok(())
    }

    /// Forwarders for a query name: deepest matching forward zone, else the
    /// default list.
    pub fn forwarders_for(&self, query_domain: &str) -> &[SocketAddr] {
        let mut best: Option<&ForwardZone> = None;
        for zone in &self.forward_zones {
            if zone.matches_domain(query_domain) {
                let better = match best {
                    None => true,
                    Some(b) => zone.domain.len() > b.domain.len(),
                };
                if better {
                    best = Some(zone);
                }
            }
        }
        match best {
            Some(zone) => &zone.servers,
            None => &self.forwarders,
        }
    }
}

fn default_nbuckets() -> usize {
    31
}

fn default_lifetime_secs() -> u64 {
    90
}

fn default_max_restarts() -> u32 {
    10
}

fn default_lame_ttl_secs() -> u64 {
    600
}

fn default_ncache_max_ttl() -> u32 {
    10800
}

fn default_edns_udp_size() -> u16 {
    2048
}

fn default_dns_port() -> u16 {
    53
}

fn default_query_port_min() -> u16 {
    5353
}

fn default_query_port_max() -> u16 {
    5399
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResolverConfig::default();
        assert_eq!(config.nbuckets, 31);
        assert_eq!(config.lifetime_secs, 90);
        assert_eq!(config.max_restarts, 10);
        assert_eq!(config.edns_udp_size, 2048);
        assert_eq!(config.query_port_min, 5353);
        assert_eq!(config.query_port_max, 5399);
        assert_eq!(config.forward_policy, ForwardPolicy::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = ResolverConfig::from_toml_str(
            r#"
            nbuckets = 4
            forwarders = ["192.0.2.1:53"]
            forward_policy = "first"

            [[forward_zones]]
            domain = "corp.example"
            servers = ["192.0.2.53:53"]
            "#,
        )
        .unwrap();

        assert_eq!(config.nbuckets, 4);
        assert_eq!(config.forward_policy, ForwardPolicy::First);
        assert_eq!(config.forwarders.len(), 1);
        assert_eq!(config.forward_zones.len(), 1);
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let mut config = ResolverConfig::default();
        config.query_port_min = 6000;
        config.query_port_max = 5999;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_forward_only_requires_servers() {
        let mut config = ResolverConfig::default();
        config.forward_policy = ForwardPolicy::Only;
        assert!(config.validate().is_err());

        config.forwarders = vec!["192.0.2.1:53".parse().unwrap()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_forwarders_for_prefers_deepest_zone() {
        let mut config = ResolverConfig::default();
        config.forwarders = vec!["198.51.100.1:53".parse().unwrap()];
        config.forward_zones = vec![
            ForwardZone {
                domain: "example".into(),
                servers: vec!["192.0.2.1:53".parse().unwrap()],
            },
            ForwardZone {
                domain: "corp.example".into(),
                servers: vec!["192.0.2.2:53".parse().unwrap()],
            },
        ];

        let servers = config.forwarders_for("host.corp.example.");
        assert_eq!(servers[0], "192.0.2.2:53".parse().unwrap());

        let servers = config.forwarders_for("www.example.");
        assert_eq!(servers[0], "192.0.2.1:53".parse().unwrap());

        let servers = config.forwarders_for("other.test.");
        assert_eq!(servers[0], "198.51.100.1:53".parse().unwrap());
    }
}
