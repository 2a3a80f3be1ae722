//! Response classification.
//!
//! A parsed message is regrouped into per-name rdatasets, then a single
//! pass marks what is cacheable (and at which trust), follows CNAME/DNAME
//! chains, and decides whether the response is an answer, a referral, or a
//! negative.

use super::context::{FetchMachine, FCTX_GLUING, FCTX_WANT_CACHE, FCTX_WANT_NCACHE};
use crate::rdataset::Rdataset;
use hickory_proto::dnssec::rdata::DNSSECRData;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use taproot_domain::Trust;
use tracing::trace;

pub(crate) const RDS_CACHE: u32 = 0x0001;
pub(crate) const RDS_ANSWER: u32 = 0x0002;
pub(crate) const RDS_ANSWERSIG: u32 = 0x0004;
pub(crate) const RDS_EXTERNAL: u32 = 0x0008;
pub(crate) const RDS_CHAINING: u32 = 0x0010;
pub(crate) const RDS_NCACHE: u32 = 0x0020;

/// One (type, covers) group under an owner name, with classification marks.
pub(crate) struct MarkedRdataset {
    pub rrtype: RecordType,
    pub covers: Option<RecordType>,
    pub records: Vec<Record>,
    pub trust: Trust,
    pub attrs: u32,
}

impl MarkedRdataset {
    pub(crate) fn is(&self, rrtype: RecordType) -> bool {
        self.rrtype == rrtype && self.covers.is_none()
    }

    pub(crate) fn is_sig_covering(&self, covered: RecordType) -> bool {
        self.rrtype == RecordType::RRSIG && self.covers == Some(covered)
    }

    /// Target of the first CNAME/DNAME record in the set.
    pub(crate) fn chain_target(&self) -> Option<Name> {
        self.records.iter().find_map(|r| match r.data() {
            RData::CNAME(c) => Some(c.0.clone()),
            RData::DNAME(d) => Some(d.0.clone()),
            _ => None,
        })
    }
}

pub(crate) struct SectionName {
    pub name: Name,
    pub rdatasets: Vec<MarkedRdataset>,
}

pub(crate) struct ClassifiedMessage {
    pub aa: bool,
    pub rcode: ResponseCode,
    pub answer: Vec<SectionName>,
    pub authority: Vec<SectionName>,
    pub additional: Vec<SectionName>,
}

impl ClassifiedMessage {
    pub(crate) fn build(message: &Message) -> Self {
        Self {
            aa: message.authoritative(),
            rcode: message.response_code(),
            answer: group_section(message.answers()),
            authority: group_section(message.name_servers()),
            additional: group_section(message.additionals()),
        }
    }
}

fn covers_of(record: &Record) -> Option<RecordType> {
    match record.data() {
        RData::DNSSEC(DNSSECRData::RRSIG(rrsig)) => Some(rrsig.input().type_covered),
        _ => None,
    }
}

/// Groups a section's records into per-name rdatasets, preserving message
/// order of first appearance. Names are lowercased so equality and zone
/// checks need no further normalization.
fn group_section(records: &[Record]) -> Vec<SectionName> {
    let mut section: Vec<SectionName> = Vec::new();
    for record in records {
        if record.record_type() == RecordType::OPT {
            continue;
        }
        let name = record.name().to_lowercase();
        let rrtype = record.record_type();
        let covers = covers_of(record);

        let entry = match section.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry,
            None => {
                section.push(SectionName {
                    name,
                    rdatasets: Vec::new(),
                });
                section.last_mut().unwrap()
            }
        };
        match entry
            .rdatasets
            .iter_mut()
            .find(|r| r.rrtype == rrtype && r.covers == covers)
        {
            Some(rds) => rds.records.push(record.clone()),
            None => entry.rdatasets.push(MarkedRdataset {
                rrtype,
                covers,
                records: vec![record.clone()],
                trust: Trust::Additional,
                attrs: 0,
            }),
        }
    }
    section
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClassifyError {
    /// The message is malformed for our question; mark the server and move
    /// on.
    FormErr,
    /// The server does not actually serve the zone it was asked about.
    Lame,
}

#[derive(Debug)]
pub(crate) enum Classified {
    /// The response answers the question (directly or via a chain); commit
    /// with `cache_message`.
    Answer,
    /// The response denies existence; commit with `ncache_message`.
    Negative,
    /// The response delegates to a deeper zone cut.
    Delegation {
        domain: Name,
        nameservers: Rdataset,
    },
}

fn answer_trust(aa: bool, chaining: bool) -> Trust {
    if aa && !chaining {
        Trust::AuthAnswer
    } else {
        Trust::Answer
    }
}

/// Builds the DNAME-synthesized name: the prefix of `qname` relative to the
/// DNAME owner, appended to the target. Overflow means the synthesized name
/// is unrepresentable and chaining simply stops.
fn synthesize_dname(qname: &Name, owner: &Name, target: &Name) -> Option<Name> {
    let prefix_len = usize::from(qname.num_labels()) - usize::from(owner.num_labels());
    let prefix = Name::from_labels(qname.iter().take(prefix_len)).ok()?;
    prefix.append_domain(target).ok()
}

impl FetchMachine {
    /// Walks the answer section from the question name, following CNAME and
    /// DNAME chains and marking everything cacheable along the way.
    pub(crate) fn answer_response(
        &mut self,
        cm: &mut ClassifiedMessage,
        from_forwarder: bool,
    ) -> Result<Classified, ClassifyError> {
        let aa = cm.aa;
        let mut qname = self.name.clone();
        let mut chaining = false;
        let mut want_chaining;
        let mut found_answer = false;
        let mut steps = 0usize;
        let chain_limit = cm.answer.len() + 1;

        loop {
            want_chaining = false;
            let external = !self.domain.zone_of(&qname);
            let mut next_qname: Option<Name> = None;

            if let Some(idx) = cm.answer.iter().position(|e| e.name == qname) {
                let entry = &mut cm.answer[idx];
                for rds in entry.rdatasets.iter_mut() {
                    if rds.rrtype == RecordType::RRSIG {
                        let Some(covered) = rds.covers else { continue };
                        let relevant = covered == self.qtype
                            || self.qtype == RecordType::ANY
                            || covered == RecordType::CNAME;
                        if relevant {
                            rds.attrs |= RDS_CACHE | RDS_ANSWERSIG;
                            rds.trust = answer_trust(aa, chaining);
                            if external {
                                rds.attrs |= RDS_EXTERNAL;
                            }
                        }
                        continue;
                    }
                    if rds.rrtype == self.qtype || self.qtype == RecordType::ANY {
                        found_answer = true;
                        rds.attrs |= RDS_CACHE | RDS_ANSWER;
                        rds.trust = answer_trust(aa, chaining);
                        if external {
                            rds.attrs |= RDS_EXTERNAL;
                        }
                        continue;
                    }
                    if rds.rrtype == RecordType::CNAME {
                        // A CNAME can never stand in for these types.
                        if matches!(
                            self.qtype,
                            RecordType::SIG
                                | RecordType::RRSIG
                                | RecordType::KEY
                                | RecordType::DNSKEY
                                | RecordType::NSEC
                        ) {
                            return Err(ClassifyError::FormErr);
                        }
                        rds.attrs |= RDS_CACHE | RDS_ANSWER | RDS_CHAINING;
                        rds.trust = answer_trust(aa, chaining);
                        if external {
                            rds.attrs |= RDS_EXTERNAL;
                        }
                        next_qname = rds.chain_target();
                    }
                }
                if found_answer {
                    break;
                }
                if let Some(target) = next_qname {
                    chaining = true;
                    want_chaining = true;
                    qname = target.to_lowercase();
                    steps += 1;
                    if steps > chain_limit {
                        return Err(ClassifyError::FormErr);
                    }
                    continue;
                }
                break;
            }

            // No direct entry for qname; a DNAME on an ancestor may cover it.
            let dname_idx = cm.answer.iter().position(|e| {
                e.name != qname
                    && e.name.zone_of(&qname)
                    && e.rdatasets.iter().any(|r| r.is(RecordType::DNAME))
            });
            let Some(idx) = dname_idx else { break };
            let owner_external = !self.domain.zone_of(&cm.answer[idx].name);
            if owner_external && !chaining {
                return Err(ClassifyError::FormErr);
            }
            let entry = &mut cm.answer[idx];
            let owner = entry.name.clone();
            let mut target: Option<Name> = None;
            for rds in entry.rdatasets.iter_mut() {
                if rds.is(RecordType::DNAME) {
                    rds.attrs |= RDS_CACHE | RDS_ANSWER | RDS_CHAINING;
                    rds.trust = answer_trust(aa, chaining);
                    if owner_external {
                        rds.attrs |= RDS_EXTERNAL;
                    }
                    target = rds.chain_target();
                } else if rds.is_sig_covering(RecordType::DNAME) {
                    rds.attrs |= RDS_CACHE | RDS_ANSWERSIG;
                    rds.trust = answer_trust(aa, chaining);
                    if owner_external {
                        rds.attrs |= RDS_EXTERNAL;
                    }
                }
            }
            let Some(target) = target else { break };
            match synthesize_dname(&qname, &owner, &target) {
                Some(synthesized) => {
                    chaining = true;
                    want_chaining = true;
                    qname = synthesized.to_lowercase();
                    steps += 1;
                    if steps > chain_limit {
                        return Err(ClassifyError::FormErr);
                    }
                }
                // The prefix does not fit; the chain ends here.
                None => {
                    want_chaining = false;
                    break;
                }
            }
        }

        // One inspection of the authority section: NS on an in-zone name is
        // worth keeping, anything else stops the scan.
        'authority: for entry in cm.authority.iter_mut() {
            if !self.domain.zone_of(&entry.name) {
                continue;
            }
            for rds in entry.rdatasets.iter_mut() {
                if rds.is(RecordType::NS) || rds.is_sig_covering(RecordType::NS) {
                    rds.attrs |= RDS_CACHE;
                    rds.trust = if aa && !chaining {
                        Trust::AuthAuthority
                    } else {
                        Trust::Additional
                    };
                } else {
                    break 'authority;
                }
            }
        }

        self.check_related(cm);
        self.attrs |= FCTX_WANT_CACHE;

        if want_chaining {
            trace!(fctx = self.id, tail = %qname, "Chain continues past answer section");
            self.noanswer_response(cm, Some(&qname), from_forwarder)?;
            return Ok(Classified::Answer);
        }
        if found_answer {
            return Ok(Classified::Answer);
        }
        Err(ClassifyError::FormErr)
    }

    /// Classifies a response without a usable answer section: referral,
    /// negative, or (when reached from a chain) an acceptable loose end.
    pub(crate) fn noanswer_response(
        &mut self,
        cm: &mut ClassifiedMessage,
        oqname: Option<&Name>,
        from_forwarder: bool,
    ) -> Result<Classified, ClassifyError> {
        let aa = cm.aa;
        let mut negative = cm.rcode == ResponseCode::NXDomain
            || (cm.answer.is_empty() && cm.authority.is_empty());

        // A server that should be authoritative but whose authority section
        // points at or above our current zone cut does not serve this zone.
        if !from_forwarder && !aa && oqname.is_none() {
            let points_elsewhere = cm.authority.iter().any(|entry| {
                !self.domain.zone_of(&entry.name)
                    && entry.rdatasets.iter().any(|r| r.is(RecordType::NS))
            });
            if points_elsewhere {
                return Err(ClassifyError::Lame);
            }
        }

        let mut ns_name: Option<Name> = None;
        let mut soa_name: Option<Name> = None;
        for entry in cm.authority.iter_mut() {
            if !self.domain.zone_of(&entry.name) {
                continue;
            }
            for rds in entry.rdatasets.iter_mut() {
                if rds.is(RecordType::NS) {
                    match &ns_name {
                        Some(existing) if *existing != entry.name => {
                            return Err(ClassifyError::FormErr)
                        }
                        _ => ns_name = Some(entry.name.clone()),
                    }
                    rds.attrs |= RDS_CACHE;
                    rds.trust = Trust::Glue;
                } else if rds.is_sig_covering(RecordType::NS) {
                    rds.attrs |= RDS_CACHE;
                    rds.trust = Trust::Glue;
                } else if rds.is(RecordType::SOA)
                    || rds.is(RecordType::NSEC)
                    || rds.is_sig_covering(RecordType::SOA)
                    || rds.is_sig_covering(RecordType::NSEC)
                {
                    if rds.is(RecordType::SOA) {
                        match &soa_name {
                            Some(existing) if *existing != entry.name => {
                                return Err(ClassifyError::FormErr)
                            }
                            _ => soa_name = Some(entry.name.clone()),
                        }
                    }
                    rds.attrs |= RDS_NCACHE;
                    rds.trust = if aa {
                        Trust::AuthAuthority
                    } else {
                        Trust::Additional
                    };
                    negative = true;
                }
            }
        }

        if let (Some(ns), Some(soa)) = (&ns_name, &soa_name) {
            if ns != soa {
                return Err(ClassifyError::FormErr);
            }
        }

        if negative {
            if oqname.is_none() {
                self.attrs |= FCTX_WANT_NCACHE;
                return Ok(Classified::Negative);
            }
            // The denial applies to the chain tail, not our question name;
            // the chain result stands and the tail is left uncached.
            return Ok(Classified::Answer);
        }

        if let Some(ns) = ns_name {
            if oqname.is_none() {
                // Referral: pick up in-bailiwick glue at glue trust.
                self.attrs |= FCTX_GLUING;
                self.check_related(cm);
                self.attrs &= !FCTX_GLUING;

                let records = cm
                    .authority
                    .iter()
                    .find(|e| e.name == ns)
                    .and_then(|e| e.rdatasets.iter().find(|r| r.is(RecordType::NS)))
                    .map(|r| r.records.clone())
                    .unwrap_or_default();
                let nameservers =
                    Rdataset::new(ns.clone(), RecordType::NS, None, Trust::Glue, records);
                self.attrs |= FCTX_WANT_CACHE;
                return Ok(Classified::Delegation {
                    domain: ns,
                    nameservers,
                });
            }
        }

        if oqname.is_some() {
            // Chained into nothing definite; non-fatal.
            return Ok(Classified::Answer);
        }
        Err(ClassifyError::FormErr)
    }

    /// Marks A/AAAA glue (and covering RRSIGs) in the additional section for
    /// every name referenced by an already-accepted rdataset. Under
    /// `GLUING` the marks carry glue trust.
    pub(crate) fn check_related(&self, cm: &mut ClassifiedMessage) {
        let mut targets: Vec<Name> = Vec::new();
        for entry in cm.answer.iter().chain(cm.authority.iter()) {
            for rds in &entry.rdatasets {
                if rds.attrs & RDS_CACHE == 0 {
                    continue;
                }
                for record in &rds.records {
                    match record.data() {
                        RData::NS(ns) => targets.push(ns.0.to_lowercase()),
                        RData::MX(mx) => targets.push(mx.exchange().to_lowercase()),
                        RData::SRV(srv) => targets.push(srv.target().to_lowercase()),
                        _ => {}
                    }
                }
            }
        }
        if targets.is_empty() {
            return;
        }
        let gluing = self.attrs & FCTX_GLUING != 0;
        let trust = if gluing { Trust::Glue } else { Trust::Additional };
        for entry in cm.additional.iter_mut() {
            if !targets.contains(&entry.name) {
                continue;
            }
            for rds in entry.rdatasets.iter_mut() {
                let applies = rds.is(RecordType::A)
                    || rds.is(RecordType::AAAA)
                    || rds.is_sig_covering(RecordType::A)
                    || rds.is_sig_covering(RecordType::AAAA);
                if applies {
                    rds.attrs |= RDS_CACHE;
                    rds.trust = trust;
                }
            }
        }
    }
}
