use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::IpAddr;
use std::sync::Arc;
use taproot_domain::Trust;

/// A set of records sharing one (owner, type, covers) tuple, plus the trust
/// level it was learned at.
///
/// Records are behind an `Arc` so the canonical copy handed to the head
/// waiter and the clones fanned out to the other waiters alias the same
/// data.
#[derive(Debug, Clone)]
pub struct Rdataset {
    pub name: Name,
    pub rrtype: RecordType,
    /// For RRSIG sets, the covered type.
    pub covers: Option<RecordType>,
    pub ttl: u32,
    pub records: Arc<[Record]>,
    pub trust: Trust,
}

impl Rdataset {
    pub fn new(
        name: Name,
        rrtype: RecordType,
        covers: Option<RecordType>,
        trust: Trust,
        records: Vec<Record>,
    ) -> Self {
        let ttl = records.iter().map(Record::ttl).min().unwrap_or(0);
        Self {
            name,
            rrtype,
            covers,
            ttl,
            records: records.into(),
            trust,
        }
    }

    /// Builds an NS rdataset from scratch, used for hints and tests.
    pub fn from_ns_names(owner: Name, ttl: u32, ns_names: &[Name]) -> Self {
        let records: Vec<Record> = ns_names
            .iter()
            .map(|ns| {
                Record::from_rdata(
                    owner.clone(),
                    ttl,
                    RData::NS(hickory_proto::rr::rdata::NS(ns.clone())),
                )
            })
            .collect();
        Self::new(owner, RecordType::NS, None, Trust::Glue, records)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Nameserver names carried by an NS rdataset.
    pub fn ns_names(&self) -> Vec<Name> {
        self.records
            .iter()
            .filter_map(|r| match r.data() {
                RData::NS(ns) => Some(ns.0.clone()),
                _ => None,
            })
            .collect()
    }

    /// Addresses carried by an A/AAAA rdataset.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.records
            .iter()
            .filter_map(|r| match r.data() {
                RData::A(a) => Some(IpAddr::V4(a.0)),
                RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect()
    }

    /// The single target of a CNAME/DNAME rdataset, if that is what this is.
    pub fn chain_target(&self) -> Option<Name> {
        self.records.iter().find_map(|r| match r.data() {
            RData::CNAME(c) => Some(c.0.clone()),
            RData::DNAME(d) => Some(d.0.clone()),
            _ => None,
        })
    }

    /// Re-stamps the remaining TTL on a cached copy.
    pub fn with_ttl(&self, ttl: u32) -> Self {
        let mut out = self.clone();
        out.ttl = ttl;
        out
    }
}

impl std::fmt::Display for Rdataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{} {} IN {} {}",
                record.name(),
                self.ttl,
                record.record_type(),
                record.data()
            )?;
        }
        Ok(())
    }
}
