//! Committing a classified response to the cache and deriving the result
//! handed to the waiters.

use super::classify::{ClassifiedMessage, RDS_ANSWER, RDS_ANSWERSIG, RDS_CACHE, RDS_EXTERNAL};
use super::context::FetchMachine;
use super::ResolverInner;
use crate::cache::{AddOutcome, NcacheOutcome};
use crate::rdataset::Rdataset;
use crate::validate::ValidationOutcome;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Name, RData, RecordType};
use std::sync::Arc;
use std::time::Instant;
use taproot_domain::{FetchOptions, FetchOutcome, ResolverError, Trust};
use tracing::{debug, trace};

/// The canonical result bound for the head waiter.
pub(crate) struct CachedAnswer {
    pub outcome: FetchOutcome,
    pub name: Name,
    pub rdataset: Option<Rdataset>,
    pub sigrdataset: Option<Rdataset>,
}

impl FetchMachine {
    /// Walks every name marked cacheable and commits it, binding the first
    /// answer rdataset as the canonical result. Data under a security root
    /// passes the validator hook first; glue is exempt.
    pub(crate) async fn cache_message(
        &mut self,
        res: &Arc<ResolverInner>,
        cm: &ClassifiedMessage,
    ) -> Result<Option<CachedAnswer>, ResolverError> {
        let now = Instant::now();
        let mut answer: Option<CachedAnswer> = None;
        let mut sharpened: Option<FetchOutcome> = None;

        for entry in cm
            .answer
            .iter()
            .chain(cm.authority.iter())
            .chain(cm.additional.iter())
        {
            if !entry.rdatasets.iter().any(|r| r.attrs & RDS_CACHE != 0) {
                continue;
            }
            let need_validation = !self.options.contains(FetchOptions::NOVALIDATE)
                && res.view.in_security_root(&entry.name);

            for rds in &entry.rdatasets {
                if rds.attrs & RDS_CACHE == 0 || rds.attrs & RDS_EXTERNAL != 0 {
                    continue;
                }
                let rdataset = Rdataset::new(
                    entry.name.clone(),
                    rds.rrtype,
                    rds.covers,
                    rds.trust,
                    rds.records.clone(),
                );

                if need_validation && rds.trust != Trust::Glue {
                    let sig = entry
                        .rdatasets
                        .iter()
                        .find(|s| s.is_sig_covering(rds.rrtype))
                        .map(|s| {
                            Rdataset::new(
                                entry.name.clone(),
                                s.rrtype,
                                s.covers,
                                s.trust,
                                s.records.clone(),
                            )
                        });
                    self.validating += 1;
                    let verdict = res
                        .validator
                        .validate(&rdataset, sig.as_ref(), rds.attrs & RDS_ANSWER != 0)
                        .await;
                    self.validating -= 1;
                    match verdict {
                        ValidationOutcome::Secure | ValidationOutcome::Insecure => {}
                        ValidationOutcome::Bogus => {
                            debug!(fctx = self.id, name = %entry.name, "Validator rejected rdataset");
                            continue;
                        }
                    }
                }

                match res.cache.add_rdataset(now, rdataset) {
                    AddOutcome::Added(stored) | AddOutcome::Unchanged(stored) => {
                        trace!(fctx = self.id, name = %entry.name, rrtype = ?rds.rrtype, trust = %stored.trust, "Cached rdataset");
                        if rds.attrs & RDS_ANSWER != 0 && answer.is_none() {
                            let outcome = chain_outcome(self.qtype, stored.rrtype);
                            answer = Some(CachedAnswer {
                                outcome,
                                name: entry.name.clone(),
                                rdataset: Some(stored),
                                sigrdataset: None,
                            });
                        }
                    }
                    AddOutcome::NegativeUnchanged { covers } => {
                        // A fresher negative with higher trust already
                        // claims this name; that claim wins.
                        if rds.attrs & RDS_ANSWER != 0 && sharpened.is_none() {
                            sharpened = Some(if covers == RecordType::ANY {
                                FetchOutcome::NcacheNxDomain
                            } else {
                                FetchOutcome::NcacheNxRrset
                            });
                        }
                    }
                }
            }
        }

        if let Some(mut bound) = answer {
            // Attach the answer's signature set if one came with it.
            for entry in cm.answer.iter() {
                if entry.name != bound.name {
                    continue;
                }
                if let Some(sig) = entry
                    .rdatasets
                    .iter()
                    .find(|s| s.attrs & RDS_ANSWERSIG != 0 && s.attrs & RDS_EXTERNAL == 0)
                {
                    bound.sigrdataset = Some(Rdataset::new(
                        entry.name.clone(),
                        sig.rrtype,
                        sig.covers,
                        sig.trust,
                        sig.records.clone(),
                    ));
                }
                break;
            }
            return Ok(Some(bound));
        }
        if let Some(outcome) = sharpened {
            return Ok(Some(CachedAnswer {
                outcome,
                name: self.name.clone(),
                rdataset: None,
                sigrdataset: None,
            }));
        }
        Ok(None)
    }

    /// Writes the single negative entry for this response and derives the
    /// negative outcome (or success when a stronger positive wins).
    pub(crate) fn ncache_message(
        &mut self,
        res: &Arc<ResolverInner>,
        cm: &ClassifiedMessage,
    ) -> (FetchOutcome, Option<Rdataset>) {
        let covers = if cm.rcode == ResponseCode::NXDomain {
            RecordType::ANY
        } else {
            self.qtype
        };
        let trust = if cm.aa {
            Trust::AuthAuthority
        } else {
            Trust::Additional
        };
        let max_ttl = res.config().ncache_max_ttl;
        let ttl = negative_ttl(cm).min(max_ttl);

        match res
            .cache
            .add_ncache(Instant::now(), &self.name, covers, trust, ttl)
        {
            NcacheOutcome::Added => {
                debug!(fctx = self.id, name = %self.name, ?covers, ttl, "Cached negative entry");
                (negative_outcome(covers), None)
            }
            NcacheOutcome::UnchangedNegative { covers } => (negative_outcome(covers), None),
            NcacheOutcome::UnchangedPositive(rdataset) => (FetchOutcome::Success, Some(rdataset)),
        }
    }
}

fn negative_outcome(covers: RecordType) -> FetchOutcome {
    if covers == RecordType::ANY {
        FetchOutcome::NcacheNxDomain
    } else {
        FetchOutcome::NcacheNxRrset
    }
}

fn chain_outcome(qtype: RecordType, answer_type: RecordType) -> FetchOutcome {
    match answer_type {
        RecordType::CNAME if qtype != RecordType::CNAME && qtype != RecordType::ANY => {
            FetchOutcome::Cname
        }
        RecordType::DNAME if qtype != RecordType::DNAME && qtype != RecordType::ANY => {
            FetchOutcome::Dname
        }
        _ => FetchOutcome::Success,
    }
}

/// Negative TTL per RFC 2308: the authority SOA's TTL or its MINIMUM field,
/// whichever is smaller. Without a SOA the denial is not cached for long.
fn negative_ttl(cm: &ClassifiedMessage) -> u32 {
    for entry in &cm.authority {
        for rds in &entry.rdatasets {
            if !rds.is(RecordType::SOA) {
                continue;
            }
            for record in &rds.records {
                if let RData::SOA(soa) = record.data() {
                    return record.ttl().min(soa.minimum());
                }
            }
        }
    }
    0
}
