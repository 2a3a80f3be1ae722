//! Address database: maps nameserver names to addresses with smoothed RTT
//! accounting, EDNS0 capability flags, and per-zone lame marks.
//!
//! Addresses come from the cache DB and the hints. When neither knows the
//! name, the ADB launches a subsidiary A/AAAA fetch through the resolver and
//! notifies the waiting fetch context once it settles. A fetch context that
//! is itself a subsidiary fetch passes `NO_FETCH` so the recursion bottoms
//! out.

use crate::cache::CacheDb;
use crate::fetch::{BucketMsg, FctxId, ResolverInner};
use crate::hints::Hints;
use compact_str::CompactString;
use dashmap::DashMap;
use hickory_proto::rr::{Name, RecordType};
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use taproot_domain::FetchOptions;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Smoothed RTT ceiling, in microseconds.
const MAX_SRTT_US: u64 = 10_000_000;

/// Shared per-server state. One entry exists per socket address, shared by
/// every find and forwarder referencing it.
pub struct AddrEntry {
    addr: SocketAddr,
    srtt_us: AtomicU64,
    flags: AtomicU32,
    lame: Mutex<Vec<(Name, Instant)>>,
}

/// The server has answered in a way that rules out EDNS0.
pub const ENTRY_NOEDNS0: u32 = 0x0001;

impl AddrEntry {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            srtt_us: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            lame: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn srtt_us(&self) -> u64 {
        self.srtt_us.load(Ordering::Relaxed)
    }

    pub fn no_edns0(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & ENTRY_NOEDNS0 != 0
    }

    fn is_lame(&self, domain: &Name, now: Instant) -> bool {
        let mut lame = self.lame.lock().unwrap();
        lame.retain(|(_, expire)| *expire > now);
        lame.iter().any(|(zone, _)| zone == domain)
    }
}

const AI_MARK: u32 = 0x0001;
const AI_FORWARDER: u32 = 0x0002;

/// One candidate address as seen by a single fetch context. The `MARK` bit
/// is local to the holding fctx's current round; everything durable lives in
/// the shared entry.
#[derive(Clone)]
pub struct AddrInfo {
    entry: Arc<AddrEntry>,
    flags: u32,
}

impl AddrInfo {
    pub fn entry(&self) -> &Arc<AddrEntry> {
        &self.entry
    }

    pub fn addr(&self) -> SocketAddr {
        self.entry.addr
    }

    pub fn srtt_us(&self) -> u64 {
        self.entry.srtt_us()
    }

    pub fn is_marked(&self) -> bool {
        self.flags & AI_MARK != 0
    }

    pub fn mark(&mut self) {
        self.flags |= AI_MARK;
    }

    pub fn is_forwarder(&self) -> bool {
        self.flags & AI_FORWARDER != 0
    }

    pub fn no_edns0(&self) -> bool {
        self.entry.no_edns0()
    }
}

impl std::fmt::Debug for AddrInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddrInfo")
            .field("addr", &self.entry.addr)
            .field("srtt_us", &self.entry.srtt_us())
            .field("marked", &self.is_marked())
            .field("forwarder", &self.is_forwarder())
            .finish()
    }
}

/// Addresses discovered for one nameserver name, best SRTT first.
pub struct Find {
    pub ns_name: Name,
    pub addrs: SmallVec<[AddrInfo; 8]>,
}

impl Find {
    /// First unmarked, non-lame address. Lame entries are marked in passing
    /// so a round cannot revisit them.
    pub fn next_unmarked(&mut self, domain: &Name, now: Instant) -> Option<AddrInfo> {
        for ai in self.addrs.iter_mut() {
            if ai.is_marked() {
                continue;
            }
            ai.mark();
            if ai.entry.is_lame(domain, now) {
                trace!(addr = %ai.addr(), domain = %domain, "Skipping lame server");
                continue;
            }
            return Some(ai.clone());
        }
        None
    }
}

/// Options for `create_find`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub inet: bool,
    pub inet6: bool,
    /// The nameserver name lives under the zone it serves; a subsidiary
    /// fetch for it must start from the hints apex or it would be stranded
    /// beneath its own zone cut.
    pub start_at_root: bool,
    /// Never launch a subsidiary fetch (set by subsidiary fetches).
    pub no_fetch: bool,
}

/// Result of `create_find`.
pub enum FindOutcome {
    /// Addresses were available immediately.
    Found(Find),
    /// A subsidiary fetch was started or joined; a `FindDone` event will be
    /// posted to the caller's bucket.
    Pending,
    /// Nothing known and no fetch possible.
    Empty,
}

/// RTT blend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustFactor {
    /// Blend the sample into the smoothed value.
    Default,
    /// Replace the smoothed value outright (known non-responses).
    Replace,
}

struct FindWaiter {
    tx: UnboundedSender<BucketMsg>,
    fctx: FctxId,
}

pub struct Adb {
    entries: DashMap<SocketAddr, Arc<AddrEntry>, FxBuildHasher>,
    cache: Arc<CacheDb>,
    hints: Arc<Hints>,
    fetches: Mutex<HashMap<CompactString, Vec<FindWaiter>>>,
    resolver: OnceLock<Weak<ResolverInner>>,
    lame_ttl: Duration,
    dns_port: u16,
}

impl Adb {
    pub fn new(cache: Arc<CacheDb>, hints: Arc<Hints>, lame_ttl: Duration, dns_port: u16) -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher),
            cache,
            hints,
            fetches: Mutex::new(HashMap::new()),
            resolver: OnceLock::new(),
            lame_ttl,
            dns_port,
        }
    }

    /// Wires the back-reference used for subsidiary fetches. Called once,
    /// after the resolver is frozen.
    pub(crate) fn set_resolver(&self, resolver: Weak<ResolverInner>) {
        let _ = self.resolver.set(resolver);
    }

    fn entry_for(&self, addr: SocketAddr) -> Arc<AddrEntry> {
        self.entries
            .entry(addr)
            .or_insert_with(|| Arc::new(AddrEntry::new(addr)))
            .clone()
    }

    /// An addrinfo for a statically configured forwarder address.
    pub fn find_addrinfo(&self, addr: SocketAddr) -> AddrInfo {
        AddrInfo {
            entry: self.entry_for(addr),
            flags: AI_FORWARDER,
        }
    }

    fn known_addresses(&self, name: &Name, options: FindOptions, now: Instant) -> Vec<IpAddr> {
        let mut out = Vec::new();
        if options.inet {
            if let Some(rds) = self.cache.find(now, name, RecordType::A) {
                out.extend(rds.addresses());
            }
        }
        if options.inet6 {
            if let Some(rds) = self.cache.find(now, name, RecordType::AAAA) {
                out.extend(rds.addresses());
            }
        }
        for addr in self.hints.addresses_for(name) {
            let family_ok = match addr {
                IpAddr::V4(_) => options.inet,
                IpAddr::V6(_) => options.inet6,
            };
            if family_ok && !out.contains(addr) {
                out.push(*addr);
            }
        }
        out
    }

    /// Resolves a nameserver name to addresses. When nothing is known and
    /// fetching is allowed, starts (or joins) a subsidiary fetch and promises
    /// a `FindDone` event to the caller's bucket.
    pub fn create_find(
        self: &Arc<Self>,
        ns_name: &Name,
        qdomain: &Name,
        options: FindOptions,
        tx: UnboundedSender<BucketMsg>,
        fctx: FctxId,
    ) -> FindOutcome {
        let now = Instant::now();
        let addresses = self.known_addresses(ns_name, options, now);
        if !addresses.is_empty() {
            let mut addrs: SmallVec<[AddrInfo; 8]> = addresses
                .into_iter()
                .map(|ip| AddrInfo {
                    entry: self.entry_for(SocketAddr::new(ip, self.dns_port)),
                    flags: 0,
                })
                .collect();
            addrs.sort_by_key(|ai| ai.srtt_us());
            return FindOutcome::Found(Find {
                ns_name: ns_name.clone(),
                addrs,
            });
        }

        if options.no_fetch {
            return FindOutcome::Empty;
        }
        let Some(resolver) = self.resolver.get().and_then(Weak::upgrade) else {
            return FindOutcome::Empty;
        };

        let key = CacheDb::name_key(ns_name);
        let mut fetches = self.fetches.lock().unwrap();
        let waiter = FindWaiter { tx, fctx };
        if let Some(waiters) = fetches.get_mut(&key) {
            waiters.push(waiter);
            return FindOutcome::Pending;
        }
        fetches.insert(key.clone(), vec![waiter]);
        drop(fetches);

        debug!(ns = %ns_name, zone = %qdomain, "Starting subsidiary address fetch");
        let adb = Arc::clone(self);
        let ns_name = ns_name.clone();
        let start_at_root = options.start_at_root;
        let want_v6 = options.inet6;
        tokio::spawn(async move {
            let mut found = false;
            let mut types = vec![RecordType::A];
            if want_v6 {
                types.push(RecordType::AAAA);
            }
            for rrtype in types {
                match resolver.create_fetch_internal(
                    &ns_name,
                    rrtype,
                    FetchOptions::NOVALIDATE,
                    start_at_root,
                ) {
                    Ok(mut fetch) => {
                        if fetch.result().await.is_ok() {
                            found = true;
                        }
                    }
                    Err(_) => break,
                }
            }
            adb.finish_fetch(&ns_name, found);
        });
        FindOutcome::Pending
    }

    fn finish_fetch(&self, ns_name: &Name, found: bool) {
        let key = CacheDb::name_key(ns_name);
        let waiters = self.fetches.lock().unwrap().remove(&key).unwrap_or_default();
        debug!(ns = %ns_name, found, waiters = waiters.len(), "Subsidiary fetch settled");
        for waiter in waiters {
            let _ = waiter.tx.send(BucketMsg::FindDone {
                fctx: waiter.fctx,
                found,
            });
        }
    }

    /// Feeds one RTT sample into the smoothed value.
    pub fn adjust_srtt(&self, ai: &AddrInfo, rtt: Duration, factor: AdjustFactor) {
        let sample = (rtt.as_micros() as u64).min(MAX_SRTT_US);
        let entry = &ai.entry;
        match factor {
            AdjustFactor::Replace => entry.srtt_us.store(sample, Ordering::Relaxed),
            AdjustFactor::Default => {
                let old = entry.srtt_us.load(Ordering::Relaxed);
                let new = if old == 0 {
                    sample
                } else {
                    (old * 7 + sample) / 8
                };
                entry.srtt_us.store(new, Ordering::Relaxed);
            }
        }
    }

    /// RTT to record for a query we gave up on: the current estimate plus a
    /// penalty that grows with the fetch's restart count.
    pub fn timeout_rtt(&self, ai: &AddrInfo, restarts: u32) -> Duration {
        let us = (ai.srtt_us() + 100_000 * u64::from(restarts)).min(MAX_SRTT_US);
        Duration::from_micros(us)
    }

    pub fn change_flags(&self, ai: &AddrInfo, bits: u32, mask: u32) {
        let entry = &ai.entry;
        let mut current = entry.flags.load(Ordering::Relaxed);
        loop {
            let new = (current & !mask) | (bits & mask);
            match entry.flags.compare_exchange_weak(
                current,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Marks a server lame for `domain` until the configured lifetime runs
    /// out. Lame-marking never fails; a conflicting mark just extends.
    pub fn mark_lame(&self, ai: &AddrInfo, domain: &Name, now: Instant) {
        let expire = now + self.lame_ttl;
        let mut lame = ai.entry.lame.lock().unwrap();
        lame.retain(|(zone, _)| zone != domain);
        lame.push((domain.clone(), expire));
        debug!(addr = %ai.addr(), domain = %domain, "Marked server lame");
    }

    pub fn is_lame(&self, ai: &AddrInfo, domain: &Name, now: Instant) -> bool {
        ai.entry.is_lame(domain, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdataset::Rdataset;
    use hickory_proto::rr::{RData, Record};
    use std::str::FromStr;
    use taproot_domain::Trust;
    use tokio::sync::mpsc;

    fn adb_with_hints() -> Arc<Adb> {
        let cache = Arc::new(CacheDb::new());
        let hints = Arc::new(Hints::builtin_root());
        Arc::new(Adb::new(cache, hints, Duration::from_secs(600), 53))
    }

    #[test]
    fn test_srtt_blend_and_replace() {
        let adb = adb_with_hints();
        let ai = adb.find_addrinfo("192.0.2.1:53".parse().unwrap());

        adb.adjust_srtt(&ai, Duration::from_micros(8000), AdjustFactor::Default);
        assert_eq!(ai.srtt_us(), 8000);

        adb.adjust_srtt(&ai, Duration::from_micros(16000), AdjustFactor::Default);
        assert_eq!(ai.srtt_us(), (8000 * 7 + 16000) / 8);

        adb.adjust_srtt(&ai, Duration::from_secs(30), AdjustFactor::Replace);
        assert_eq!(ai.srtt_us(), MAX_SRTT_US);
    }

    #[test]
    fn test_timeout_rtt_penalty_is_clamped() {
        let adb = adb_with_hints();
        let ai = adb.find_addrinfo("192.0.2.1:53".parse().unwrap());
        adb.adjust_srtt(&ai, Duration::from_micros(500), AdjustFactor::Replace);

        assert_eq!(adb.timeout_rtt(&ai, 3), Duration::from_micros(500 + 300_000));
        assert_eq!(adb.timeout_rtt(&ai, 1000), Duration::from_micros(MAX_SRTT_US));
    }

    #[test]
    fn test_lame_mark_applies_per_domain() {
        let adb = adb_with_hints();
        let ai = adb.find_addrinfo("192.0.2.1:53".parse().unwrap());
        let zone = Name::from_str("example.org.").unwrap();
        let other = Name::from_str("example.net.").unwrap();
        let now = Instant::now();

        adb.mark_lame(&ai, &zone, now);
        assert!(adb.is_lame(&ai, &zone, now));
        assert!(!adb.is_lame(&ai, &other, now));
        assert!(!adb.is_lame(&ai, &zone, now + Duration::from_secs(601)));
    }

    #[test]
    fn test_noedns0_flag_round_trip() {
        let adb = adb_with_hints();
        let ai = adb.find_addrinfo("192.0.2.1:53".parse().unwrap());
        assert!(!ai.no_edns0());

        adb.change_flags(&ai, ENTRY_NOEDNS0, ENTRY_NOEDNS0);
        assert!(ai.no_edns0());

        // The flag is on the shared entry, not the local addrinfo.
        let again = adb.find_addrinfo("192.0.2.1:53".parse().unwrap());
        assert!(again.no_edns0());
    }

    #[tokio::test]
    async fn test_create_find_from_hints() {
        let adb = adb_with_hints();
        let (tx, _rx) = mpsc::unbounded_channel();
        let root = Name::root();
        let ns = Name::from_str("a.root-servers.net.").unwrap();

        let options = FindOptions {
            inet: true,
            inet6: false,
            ..Default::default()
        };
        match adb.create_find(&ns, &root, options, tx, 1) {
            FindOutcome::Found(find) => {
                assert_eq!(find.ns_name, ns);
                assert!(find.addrs.iter().all(|ai| ai.addr().is_ipv4()));
                assert!(!find.addrs.is_empty());
            }
            _ => panic!("hints should resolve a root server"),
        }
    }

    #[tokio::test]
    async fn test_create_find_from_cache() {
        let cache = Arc::new(CacheDb::new());
        let hints = Arc::new(Hints::builtin_root());
        let adb = Arc::new(Adb::new(Arc::clone(&cache), hints, Duration::from_secs(600), 53));

        let ns = Name::from_str("ns1.example.org.").unwrap();
        let record = Record::from_rdata(
            ns.clone(),
            300,
            RData::A(hickory_proto::rr::rdata::A("192.0.2.10".parse().unwrap())),
        );
        cache.add_rdataset(
            Instant::now(),
            Rdataset::new(ns.clone(), RecordType::A, None, Trust::Glue, vec![record]),
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        let options = FindOptions {
            inet: true,
            ..Default::default()
        };
        match adb.create_find(&ns, &Name::from_str("example.org.").unwrap(), options, tx, 1) {
            FindOutcome::Found(find) => {
                assert_eq!(find.addrs[0].addr(), "192.0.2.10:53".parse().unwrap());
            }
            _ => panic!("cached glue should resolve"),
        }
    }

    #[tokio::test]
    async fn test_create_find_without_resolver_is_empty() {
        let adb = adb_with_hints();
        let (tx, _rx) = mpsc::unbounded_channel();
        let unknown = Name::from_str("ns.unknown.test.").unwrap();

        let options = FindOptions {
            inet: true,
            ..Default::default()
        };
        match adb.create_find(&unknown, &Name::root(), options, tx, 1) {
            FindOutcome::Empty => {}
            _ => panic!("no resolver handle means no fetch"),
        }
    }

    #[test]
    fn test_find_next_unmarked_never_repeats() {
        let adb = adb_with_hints();
        let mut find = Find {
            ns_name: Name::from_str("ns1.example.org.").unwrap(),
            addrs: SmallVec::from_vec(vec![
                adb.find_addrinfo("192.0.2.1:53".parse().unwrap()),
                adb.find_addrinfo("192.0.2.2:53".parse().unwrap()),
            ]),
        };
        // Clear the forwarder flag noise for this test.
        for ai in &mut find.addrs {
            ai.flags = 0;
        }

        let domain = Name::from_str("example.org.").unwrap();
        let now = Instant::now();
        let first = find.next_unmarked(&domain, now).unwrap();
        let second = find.next_unmarked(&domain, now).unwrap();
        assert_ne!(first.addr(), second.addr());
        assert!(find.next_unmarked(&domain, now).is_none());
    }
}
