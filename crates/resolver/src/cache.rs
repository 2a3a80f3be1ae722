//! In-memory cache database.
//!
//! Content-addressed by owner name. Each node stores positive rdatasets
//! keyed by (type, covers) and negative entries keyed by the covered type
//! (`ANY` for a whole-name negative). Every entry carries a trust level and
//! the cache refuses downgrades: weaker data never replaces stronger data
//! that has not expired.

use crate::rdataset::Rdataset;
use compact_str::CompactString;
use dashmap::DashMap;
use hickory_proto::rr::{Name, RecordType};
use rustc_hash::FxBuildHasher;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use taproot_domain::Trust;

/// Outcome of a positive insertion.
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// Stored; the returned rdataset is the canonical cached copy.
    Added(Rdataset),
    /// An existing entry of equal or higher trust was kept.
    Unchanged(Rdataset),
    /// A stored negative entry of equal or higher trust blocks this data.
    NegativeUnchanged { covers: RecordType },
}

/// Outcome of a negative insertion.
#[derive(Debug, Clone)]
pub enum NcacheOutcome {
    Added,
    /// An existing negative entry was kept; its covered type sharpens the
    /// caller's result.
    UnchangedNegative { covers: RecordType },
    /// A positive entry of equal or higher trust exists for the type.
    UnchangedPositive(Rdataset),
}

struct Stored {
    rdataset: Rdataset,
    expires: Instant,
}

struct NegStored {
    trust: Trust,
    expires: Instant,
}

#[derive(Default)]
struct NodeData {
    positive: HashMap<(RecordType, Option<RecordType>), Stored>,
    negative: HashMap<RecordType, NegStored>,
}

impl NodeData {
    fn purge_expired(&mut self, now: Instant) {
        self.positive.retain(|_, s| s.expires > now);
        self.negative.retain(|_, n| n.expires > now);
    }

    fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub insertions: u64,
}

pub struct CacheDb {
    nodes: DashMap<CompactString, NodeData, FxBuildHasher>,
    hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    insertions: AtomicU64,
}

impl Default for CacheDb {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheDb {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::with_hasher(FxBuildHasher),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            insertions: AtomicU64::new(0),
        }
    }

    pub fn name_key(name: &Name) -> CompactString {
        let mut s = name.to_lowercase().to_utf8();
        if !s.ends_with('.') {
            s.push('.');
        }
        CompactString::from(s)
    }

    /// Adds a positive rdataset, honoring the trust hierarchy.
    pub fn add_rdataset(&self, now: Instant, rdataset: Rdataset) -> AddOutcome {
        let key = Self::name_key(&rdataset.name);
        let mut node = self.nodes.entry(key).or_default();
        node.purge_expired(now);

        // A whole-name negative (covers ANY) blocks every type; a typed
        // negative blocks only its own type.
        for covers in [RecordType::ANY, rdataset.rrtype] {
            if let Some(neg) = node.negative.get(&covers) {
                if neg.trust >= rdataset.trust {
                    return AddOutcome::NegativeUnchanged { covers };
                }
            }
        }
        // This data outranks any remaining negative claim about its type.
        node.negative
            .retain(|covers, neg| !(neg.trust < rdataset.trust && *covers == RecordType::ANY));
        node.negative.remove(&rdataset.rrtype);

        let slot = (rdataset.rrtype, rdataset.covers);
        if let Some(existing) = node.positive.get(&slot) {
            if existing.rdataset.trust > rdataset.trust {
                return AddOutcome::Unchanged(existing.rdataset.clone());
            }
        }

        let expires = now + Duration::from_secs(u64::from(rdataset.ttl));
        let stored = rdataset.clone();
        node.positive.insert(
            slot,
            Stored {
                rdataset: stored.clone(),
                expires,
            },
        );
        self.insertions.fetch_add(1, Ordering::Relaxed);
        AddOutcome::Added(stored)
    }

    /// Adds a negative entry at `name` covering `covers` (`ANY` = the whole
    /// name does not exist).
    pub fn add_ncache(
        &self,
        now: Instant,
        name: &Name,
        covers: RecordType,
        trust: Trust,
        ttl: u32,
    ) -> NcacheOutcome {
        let key = Self::name_key(name);
        let mut node = self.nodes.entry(key).or_default();
        node.purge_expired(now);

        if covers != RecordType::ANY {
            if let Some(existing) = node.positive.get(&(covers, None)) {
                if existing.rdataset.trust >= trust {
                    return NcacheOutcome::UnchangedPositive(existing.rdataset.clone());
                }
            }
        }
        for (existing_covers, neg) in node.negative.iter() {
            let applies = *existing_covers == RecordType::ANY || *existing_covers == covers;
            if applies && neg.trust > trust {
                return NcacheOutcome::UnchangedNegative {
                    covers: *existing_covers,
                };
            }
        }

        if covers == RecordType::ANY {
            // The whole name is gone; typed entries are subsumed.
            node.negative.retain(|_, neg| neg.trust > trust);
            node.positive.retain(|_, s| s.rdataset.trust > trust);
        } else {
            node.positive
                .retain(|(t, _), s| *t != covers || s.rdataset.trust > trust);
        }
        node.negative.insert(
            covers,
            NegStored {
                trust,
                expires: now + Duration::from_secs(u64::from(ttl)),
            },
        );
        self.insertions.fetch_add(1, Ordering::Relaxed);
        NcacheOutcome::Added
    }

    /// Looks up a positive rdataset, TTL-adjusted to the remaining time.
    pub fn find(&self, now: Instant, name: &Name, rrtype: RecordType) -> Option<Rdataset> {
        let key = Self::name_key(name);
        let found = self.nodes.get(&key).and_then(|node| {
            node.positive.get(&(rrtype, None)).and_then(|stored| {
                if stored.expires > now {
                    let remaining = stored.expires.duration_since(now).as_secs() as u32;
                    Some(stored.rdataset.with_ttl(remaining))
                } else {
                    None
                }
            })
        });
        match found {
            Some(rds) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(rds)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Looks up a negative claim applying to (name, rrtype). Returns the
    /// covered type (`ANY` for NXDOMAIN) and the remaining TTL.
    pub fn find_negative(
        &self,
        now: Instant,
        name: &Name,
        rrtype: RecordType,
    ) -> Option<(RecordType, u32)> {
        let key = Self::name_key(name);
        let node = self.nodes.get(&key)?;
        for covers in [RecordType::ANY, rrtype] {
            if let Some(neg) = node.negative.get(&covers) {
                if neg.expires > now {
                    self.negative_hits.fetch_add(1, Ordering::Relaxed);
                    let remaining = neg.expires.duration_since(now).as_secs() as u32;
                    return Some((covers, remaining));
                }
            }
        }
        None
    }

    /// Deepest cached NS rdataset at or above `name`, for zone-cut lookups.
    pub fn find_deepest_ns(&self, now: Instant, name: &Name) -> Option<(Name, Rdataset)> {
        let mut cursor = name.clone();
        loop {
            if let Some(rds) = self.find(now, &cursor, RecordType::NS) {
                return Some((cursor, rds));
            }
            if cursor.is_root() {
                return None;
            }
            cursor = cursor.base_name();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drops fully expired nodes. Callers run this opportunistically; the
    /// cache does not own a maintenance task.
    pub fn compact(&self, now: Instant) {
        self.nodes.retain(|_, node| {
            node.purge_expired(now);
            !node.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::{RData, Record};
    use std::str::FromStr;

    fn a_rdataset(name: &str, addr: &str, ttl: u32, trust: Trust) -> Rdataset {
        let owner = Name::from_str(name).unwrap();
        let record = Record::from_rdata(
            owner.clone(),
            ttl,
            RData::A(hickory_proto::rr::rdata::A(addr.parse().unwrap())),
        );
        Rdataset::new(owner, RecordType::A, None, trust, vec![record])
    }

    #[test]
    fn test_add_and_find() {
        let cache = CacheDb::new();
        let now = Instant::now();
        let rds = a_rdataset("www.example.org.", "192.0.2.1", 300, Trust::Answer);

        assert!(matches!(
            cache.add_rdataset(now, rds),
            AddOutcome::Added(_)
        ));
        let found = cache
            .find(now, &Name::from_str("WWW.EXAMPLE.ORG.").unwrap(), RecordType::A)
            .expect("lookup should be case-insensitive");
        assert_eq!(found.addresses(), vec!["192.0.2.1".parse::<std::net::IpAddr>().unwrap()]);
    }

    #[test]
    fn test_trust_downgrade_refused() {
        let cache = CacheDb::new();
        let now = Instant::now();

        let strong = a_rdataset("www.example.org.", "192.0.2.1", 300, Trust::AuthAnswer);
        cache.add_rdataset(now, strong);

        let weak = a_rdataset("www.example.org.", "203.0.113.9", 300, Trust::Additional);
        match cache.add_rdataset(now, weak) {
            AddOutcome::Unchanged(kept) => {
                assert_eq!(
                    kept.addresses(),
                    vec!["192.0.2.1".parse::<std::net::IpAddr>().unwrap()]
                );
            }
            other => panic!("expected Unchanged, got {:?}", other),
        }
    }

    #[test]
    fn test_equal_trust_replaces() {
        let cache = CacheDb::new();
        let now = Instant::now();

        cache.add_rdataset(now, a_rdataset("a.example.", "192.0.2.1", 300, Trust::Answer));
        cache.add_rdataset(now, a_rdataset("a.example.", "192.0.2.2", 300, Trust::Answer));

        let found = cache
            .find(now, &Name::from_str("a.example.").unwrap(), RecordType::A)
            .unwrap();
        assert_eq!(
            found.addresses(),
            vec!["192.0.2.2".parse::<std::net::IpAddr>().unwrap()]
        );
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let cache = CacheDb::new();
        let now = Instant::now();

        cache.add_rdataset(now, a_rdataset("a.example.", "192.0.2.1", 1, Trust::Answer));
        let later = now + Duration::from_secs(5);
        assert!(cache
            .find(later, &Name::from_str("a.example.").unwrap(), RecordType::A)
            .is_none());
    }

    #[test]
    fn test_negative_blocks_weaker_positive() {
        let cache = CacheDb::new();
        let now = Instant::now();
        let name = Name::from_str("gone.example.").unwrap();

        cache.add_ncache(now, &name, RecordType::ANY, Trust::AuthAuthority, 600);

        let weak = a_rdataset("gone.example.", "192.0.2.1", 300, Trust::Additional);
        match cache.add_rdataset(now, weak) {
            AddOutcome::NegativeUnchanged { covers } => assert_eq!(covers, RecordType::ANY),
            other => panic!("expected NegativeUnchanged, got {:?}", other),
        }
    }

    #[test]
    fn test_stronger_positive_overrides_negative() {
        let cache = CacheDb::new();
        let now = Instant::now();
        let name = Name::from_str("back.example.").unwrap();

        cache.add_ncache(now, &name, RecordType::A, Trust::Additional, 600);
        let strong = a_rdataset("back.example.", "192.0.2.1", 300, Trust::AuthAnswer);
        assert!(matches!(
            cache.add_rdataset(now, strong),
            AddOutcome::Added(_)
        ));
        assert!(cache.find_negative(now, &name, RecordType::A).is_none());
    }

    #[test]
    fn test_ncache_conflict_with_positive() {
        let cache = CacheDb::new();
        let now = Instant::now();
        let name = Name::from_str("alive.example.").unwrap();

        cache.add_rdataset(now, a_rdataset("alive.example.", "192.0.2.1", 300, Trust::AuthAnswer));
        match cache.add_ncache(now, &name, RecordType::A, Trust::Additional, 600) {
            NcacheOutcome::UnchangedPositive(rds) => assert_eq!(rds.rrtype, RecordType::A),
            other => panic!("expected UnchangedPositive, got {:?}", other),
        }
    }

    #[test]
    fn test_ncache_conflict_with_negative_sharpens() {
        let cache = CacheDb::new();
        let now = Instant::now();
        let name = Name::from_str("void.example.").unwrap();

        cache.add_ncache(now, &name, RecordType::ANY, Trust::AuthAuthority, 600);
        match cache.add_ncache(now, &name, RecordType::A, Trust::Additional, 600) {
            NcacheOutcome::UnchangedNegative { covers } => assert_eq!(covers, RecordType::ANY),
            other => panic!("expected UnchangedNegative, got {:?}", other),
        }
    }

    #[test]
    fn test_find_deepest_ns() {
        let cache = CacheDb::new();
        let now = Instant::now();

        let org = Name::from_str("org.").unwrap();
        let ns = Rdataset::from_ns_names(
            org.clone(),
            172800,
            &[Name::from_str("a0.org.afilias-nst.info.").unwrap()],
        );
        cache.add_rdataset(now, ns);

        let (cut, rds) = cache
            .find_deepest_ns(now, &Name::from_str("www.isc.org.").unwrap())
            .unwrap();
        assert_eq!(cut, org);
        assert_eq!(rds.rrtype, RecordType::NS);
    }
}
