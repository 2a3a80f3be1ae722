//! Zone-cut lookup over the cache with a hints fallback, plus the security
//! root check consulted before caching.

use crate::cache::CacheDb;
use crate::hints::Hints;
use crate::rdataset::Rdataset;
use hickory_proto::rr::Name;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use taproot_domain::ResolverError;

pub struct View {
    cache: Arc<CacheDb>,
    hints: Arc<Hints>,
    security_roots: Vec<Name>,
}

impl View {
    pub fn new(
        cache: Arc<CacheDb>,
        hints: Arc<Hints>,
        security_roots: &[String],
    ) -> Result<Self, ResolverError> {
        let mut roots = Vec::with_capacity(security_roots.len());
        for root in security_roots {
            let name = Name::from_str(root)
                .map_err(|e| ResolverError::InvalidName(format!("{}: {}", root, e)))?;
            roots.push(name);
        }
        Ok(Self {
            cache,
            hints,
            security_roots: roots,
        })
    }

    /// The deepest known delegation point for `name`: the deepest cached NS
    /// rdataset, or the hints apex when nothing deeper is known.
    pub fn find_zonecut(&self, name: &Name, now: Instant) -> (Name, Rdataset) {
        if let Some((cut, rds)) = self.cache.find_deepest_ns(now, name) {
            // A cached cut above the hints apex would be a step backwards.
            if self.hints.zone().zone_of(&cut) {
                return (cut, rds);
            }
        }
        (self.hints.zone().clone(), self.hints.ns().clone())
    }

    /// True when `name` sits at or below a configured security root, which
    /// routes cached data through the validator hook.
    pub fn in_security_root(&self, name: &Name) -> bool {
        self.security_roots.iter().any(|root| root.zone_of(name))
    }

    pub fn cache(&self) -> &Arc<CacheDb> {
        &self.cache
    }

    pub fn hints(&self) -> &Arc<Hints> {
        &self.hints
    }
}
