use taproot_domain::{ForwardPolicy, ResolverConfig};

#[test]
fn test_config_default_values() {
    let config = ResolverConfig::default();

    assert_eq!(config.nbuckets, 31);
    assert!(config.forwarders.is_empty());
    assert_eq!(config.forward_policy, ForwardPolicy::None);
    assert!(config.forward_zones.is_empty());
    assert_eq!(config.lifetime_secs, 90);
    assert_eq!(config.max_restarts, 10);
    assert_eq!(config.lame_ttl_secs, 600);
    assert_eq!(config.ncache_max_ttl, 10800);
    assert_eq!(config.edns_udp_size, 2048);
    assert_eq!(config.dns_port, 53);
    assert_eq!(config.query_port_min, 5353);
    assert_eq!(config.query_port_max, 5399);
    assert!(config.bind_ipv4);
    assert!(config.bind_ipv6);
    assert!(config.security_roots.is_empty());
    assert!(config.hints.is_empty());
}

#[test]
fn test_config_deserialization_with_all_sections() {
    let toml_str = r#"
        nbuckets = 8
        forwarders = ["192.0.2.1:53", "[2001:db8::1]:53"]
        forward_policy = "first"
        lifetime_secs = 30
        max_restarts = 5
        edns_udp_size = 1232
        bind_ipv6 = false
        security_roots = ["example."]

        [[forward_zones]]
        domain = "corp.example"
        servers = ["192.0.2.53:53"]

        [[hints]]
        name = "a.root-servers.net."
        addresses = ["198.41.0.4"]
    "#;

    let config = ResolverConfig::from_toml_str(toml_str).expect("config should parse");
    assert_eq!(config.nbuckets, 8);
    assert_eq!(config.forwarders.len(), 2);
    assert_eq!(config.forward_policy, ForwardPolicy::First);
    assert_eq!(config.lifetime_secs, 30);
    assert_eq!(config.edns_udp_size, 1232);
    assert!(!config.bind_ipv6);
    assert_eq!(config.forward_zones[0].domain, "corp.example");
    assert_eq!(config.hints[0].name, "a.root-servers.net.");
}

#[test]
fn test_config_rejects_invalid_combinations() {
    assert!(ResolverConfig::from_toml_str("nbuckets = 0").is_err());
    assert!(ResolverConfig::from_toml_str(
        r#"
        query_port_min = 6000
        query_port_max = 5999
        "#
    )
    .is_err());
    assert!(ResolverConfig::from_toml_str(r#"forward_policy = "only""#).is_err());
}

#[test]
fn test_forward_zone_matching_is_suffix_based() {
    let config = ResolverConfig::from_toml_str(
        r#"
        forwarders = ["198.51.100.1:53"]
        forward_policy = "first"

        [[forward_zones]]
        domain = "internal.example"
        servers = ["192.0.2.10:53"]
        "#,
    )
    .unwrap();

    let zone_server: std::net::SocketAddr = "192.0.2.10:53".parse().unwrap();
    let default_server: std::net::SocketAddr = "198.51.100.1:53".parse().unwrap();

    assert_eq!(
        config.forwarders_for("host.internal.example.")[0],
        zone_server
    );
    assert_eq!(config.forwarders_for("INTERNAL.EXAMPLE")[0], zone_server);
    // Suffix matching respects label boundaries.
    assert_eq!(
        config.forwarders_for("notinternal.example.")[0],
        default_server
    );
    assert_eq!(config.forwarders_for("www.example.org.")[0], default_server);
}
