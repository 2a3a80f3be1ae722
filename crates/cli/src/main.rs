use anyhow::{bail, Context};
use clap::Parser;
use hickory_proto::rr::{Name, RecordType};
use std::net::SocketAddr;
use std::str::FromStr;
use taproot_domain::{FetchOptions, ForwardPolicy, ResolverConfig};
use taproot_resolver::{Hints, Resolver};
use tracing::info;

#[derive(Parser)]
#[command(name = "taproot")]
#[command(version)]
#[command(about = "Taproot - iterative DNS resolution from the root down")]
struct Cli {
    /// Name to resolve
    name: String,

    /// Record type to ask for
    #[arg(short = 't', long = "type", default_value = "A")]
    rrtype: String,

    /// Forward to this server instead of iterating (repeatable).
    /// Port defaults to 53.
    #[arg(short = 'f', long = "forward")]
    forward: Vec<String>,

    /// With forwarders configured: try them first, then iterate
    #[arg(long, conflicts_with = "forward_only")]
    forward_first: bool,

    /// With forwarders configured: never iterate (default)
    #[arg(long)]
    forward_only: bool,

    /// Force TCP for the first query
    #[arg(long)]
    tcp: bool,

    /// Never advertise EDNS0
    #[arg(long)]
    no_edns: bool,

    /// Configuration file path (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn parse_server(s: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = s.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    bail!("not an address: {}", s)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = cli.log_level.parse().unwrap_or(tracing::Level::WARN);
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_max_level(log_level)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path))?;
            ResolverConfig::from_toml_str(&raw)?
        }
        None => ResolverConfig::default(),
    };

    if !cli.forward.is_empty() {
        config.forwarders = cli
            .forward
            .iter()
            .map(|s| parse_server(s))
            .collect::<anyhow::Result<Vec<_>>>()?;
        config.forward_policy = if cli.forward_first {
            ForwardPolicy::First
        } else {
            ForwardPolicy::Only
        };
    }

    let mut qname = cli.name.clone();
    if !qname.ends_with('.') {
        qname.push('.');
    }
    let name = Name::from_str(&qname).with_context(|| format!("invalid name {}", qname))?;
    let qtype =
        RecordType::from_str(&cli.rrtype.to_uppercase()).context("invalid record type")?;

    let hints = Hints::from_config(&config.hints)?;
    let resolver = Resolver::new(config, hints).await?;
    let on_shutdown = resolver.when_shutdown()?;
    resolver.freeze();

    let mut options = FetchOptions::empty();
    if cli.tcp {
        options |= FetchOptions::TCP;
    }
    if cli.no_edns {
        options |= FetchOptions::NOEDNS0;
    }

    info!(name = %name, ?qtype, "Starting fetch");
    let started = std::time::Instant::now();
    let mut fetch = resolver.create_fetch(&name, qtype, options)?;
    let reply = fetch.result().await;
    let elapsed = started.elapsed();

    match reply {
        Ok(response) => {
            println!(";; result: {}", response.outcome);
            if let Some(rdataset) = &response.rdataset {
                println!("{}", rdataset);
            }
            if let Some(sig) = &response.sigrdataset {
                println!("{}", sig);
            }
        }
        Err(e) => {
            println!(";; fetch failed: {}", e);
        }
    }

    let stats = resolver.cache().stats();
    println!(
        ";; time: {:?}  cache: {} hits / {} misses / {} negative / {} stored",
        elapsed, stats.hits, stats.misses, stats.negative_hits, stats.insertions
    );

    drop(fetch);
    resolver.shutdown();
    let _ = on_shutdown.await;
    Ok(())
}
