//! Per-question fetch state machine.

use super::query::ResQuery;
use super::{BucketMsg, FctxId, FetchReply, ResolverInner};
use crate::adb::{AddrInfo, Find, FindOptions, FindOutcome};
use crate::rdataset::Rdataset;
use hickory_proto::rr::{Name, RecordType};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taproot_domain::{FetchOptions, ResolverError};
use tracing::{debug, trace};

pub(crate) const FCTX_HAVE_ANSWER: u32 = 0x0001;
pub(crate) const FCTX_GLUING: u32 = 0x0002;
pub(crate) const FCTX_ADDR_WAIT: u32 = 0x0004;
pub(crate) const FCTX_SHUTTING_DOWN: u32 = 0x0008;
pub(crate) const FCTX_WANT_CACHE: u32 = 0x0010;
pub(crate) const FCTX_WANT_NCACHE: u32 = 0x0020;

/// Everything the bucket worker needs to build the machine. Assembled by
/// `create_fetch` under the bucket lock, consumed on the worker.
pub(crate) struct FctxInit {
    pub name: Name,
    pub qtype: RecordType,
    pub options: FetchOptions,
    pub domain: Name,
    pub nameservers: Rdataset,
    pub fwd_servers: Vec<SocketAddr>,
    pub forward_only: bool,
    pub lifetime: Duration,
    pub internal: bool,
}

pub(crate) enum AddrState {
    Success,
    Wait,
    Fail(ResolverError),
}

pub(crate) struct FetchMachine {
    pub(crate) id: FctxId,
    pub(crate) bucket: usize,
    pub(crate) name: Name,
    pub(crate) qtype: RecordType,
    pub(crate) options: FetchOptions,

    /// Current zone cut; moves strictly downward on referral.
    pub(crate) domain: Name,
    pub(crate) nameservers: Rdataset,
    pub(crate) fwd_servers: Vec<SocketAddr>,
    pub(crate) forward_only: bool,
    pub(crate) internal: bool,

    pub(crate) attrs: u32,
    pub(crate) expiry: Instant,
    pub(crate) retry_interval: Duration,
    pub(crate) restarts: u32,
    pub(crate) timer_epoch: u64,

    pub(crate) queries: HashMap<u64, ResQuery>,
    pub(crate) next_query_seq: u64,
    pub(crate) finds: Vec<Find>,
    pub(crate) forwarders: Vec<AddrInfo>,
    pub(crate) find_cursor: usize,
    pub(crate) pending: usize,
    pub(crate) validating: usize,

    pub(crate) done: bool,
}

impl FetchMachine {
    pub(crate) fn new(id: FctxId, bucket: usize, init: FctxInit) -> Self {
        Self {
            id,
            bucket,
            name: init.name,
            qtype: init.qtype,
            options: init.options,
            domain: init.domain,
            nameservers: init.nameservers,
            fwd_servers: init.fwd_servers,
            forward_only: init.forward_only,
            internal: init.internal,
            attrs: 0,
            expiry: Instant::now() + init.lifetime,
            retry_interval: Duration::from_secs(2),
            restarts: 0,
            timer_epoch: 0,
            queries: HashMap::new(),
            next_query_seq: 1,
            finds: Vec::new(),
            forwarders: Vec::new(),
            find_cursor: 0,
            pending: 0,
            validating: 0,
            done: false,
        }
    }

    pub(crate) async fn on_start(&mut self, res: &Arc<ResolverInner>) {
        if res.want_shutdown(self.bucket, self.id) {
            self.doshutdown(res);
            return;
        }
        res.activate_fctx(self.bucket, self.id);
        trace!(fctx = self.id, name = %self.name, "Fetch started");
        self.try_next(res).await;
    }

    pub(crate) fn on_control(&mut self, res: &Arc<ResolverInner>) {
        if res.want_shutdown(self.bucket, self.id) {
            self.doshutdown(res);
        }
    }

    fn doshutdown(&mut self, res: &Arc<ResolverInner>) {
        self.attrs |= FCTX_SHUTTING_DOWN;
        self.finish(res, Err(ResolverError::Canceled));
    }

    pub(crate) async fn on_timeout(&mut self, res: &Arc<ResolverInner>, epoch: u64) {
        if self.done || epoch != self.timer_epoch {
            return;
        }
        if Instant::now() >= self.expiry {
            debug!(fctx = self.id, name = %self.name, "Fetch lifetime expired");
            self.finish(res, Err(ResolverError::TimedOut));
            return;
        }
        // Idle tick: give up on the outstanding queries and try the next
        // server. The penalty keeps unresponsive servers at the back of the
        // SRTT ordering.
        trace!(fctx = self.id, outstanding = self.queries.len(), "Retry timer fired");
        self.cancel_queries(res, true);
        self.try_next(res).await;
    }

    pub(crate) async fn on_find_done(&mut self, res: &Arc<ResolverInner>, found: bool) {
        if self.done {
            return;
        }
        self.pending = self.pending.saturating_sub(1);
        trace!(fctx = self.id, found, pending = self.pending, "Address find settled");
        if self.attrs & FCTX_ADDR_WAIT == 0 {
            return;
        }
        if found || (self.pending == 0 && self.queries.is_empty()) {
            self.attrs &= !FCTX_ADDR_WAIT;
            self.try_next(res).await;
        }
    }

    /// Picks the next candidate address and sends a query to it, starting a
    /// fresh address round when the current one is exhausted.
    pub(crate) async fn try_next(&mut self, res: &Arc<ResolverInner>) {
        loop {
            if self.done || self.attrs & FCTX_SHUTTING_DOWN != 0 {
                return;
            }
            match self.next_address(Instant::now()) {
                Some(addrinfo) => {
                    match self.send_query(res, addrinfo, self.options).await {
                        Ok(()) => return,
                        Err(e) => {
                            debug!(fctx = self.id, error = %e, "Query send failed, trying next address");
                            continue;
                        }
                    }
                }
                None => {
                    self.cleanup_round();
                    match self.get_addresses(res) {
                        AddrState::Success => continue,
                        AddrState::Wait => {
                            self.attrs |= FCTX_ADDR_WAIT;
                            trace!(fctx = self.id, pending = self.pending, "Waiting for addresses");
                            return;
                        }
                        AddrState::Fail(e) => {
                            self.finish(res, Err(e));
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Assembles the candidate address set: forwarders first, then the
    /// delegation nameservers through the ADB.
    pub(crate) fn get_addresses(&mut self, res: &Arc<ResolverInner>) -> AddrState {
        self.restarts += 1;
        if self.restarts > res.config().max_restarts {
            debug!(fctx = self.id, restarts = self.restarts, "Restart cap exceeded");
            return AddrState::Fail(ResolverError::ServFail);
        }

        self.forwarders = self
            .fwd_servers
            .iter()
            .map(|&addr| res.adb.find_addrinfo(addr))
            .collect();

        if !self.forward_only {
            let tx = res.buckets[self.bucket].tx.clone();
            for ns_name in self.nameservers.ns_names() {
                let ns_name = ns_name.to_lowercase();
                let options = FindOptions {
                    inet: res.disp_v4.is_some(),
                    inet6: res.disp_v6.is_some(),
                    // An in-zone nameserver with expired glue cannot be
                    // resolved beneath its own cut.
                    start_at_root: self.domain.zone_of(&ns_name),
                    no_fetch: self.internal,
                };
                match res
                    .adb
                    .create_find(&ns_name, &self.domain, options, tx.clone(), self.id)
                {
                    FindOutcome::Found(find) => self.finds.push(find),
                    FindOutcome::Pending => self.pending += 1,
                    FindOutcome::Empty => {}
                }
            }
        }
        // Best-first across finds by the SRTT of each find's head.
        self.finds
            .sort_by_key(|find| find.addrs.first().map(|ai| ai.srtt_us()).unwrap_or(u64::MAX));
        self.find_cursor = 0;

        let have_addresses = !self.forwarders.is_empty()
            || self.finds.iter().any(|find| !find.addrs.is_empty());
        if have_addresses {
            AddrState::Success
        } else if self.pending > 0 {
            AddrState::Wait
        } else {
            debug!(fctx = self.id, name = %self.name, "No candidate addresses");
            AddrState::Fail(ResolverError::ServFail)
        }
    }

    /// Yields addresses in priority order, marking each one returned.
    /// Returns `None` once everything in the round is marked.
    pub(crate) fn next_address(&mut self, now: Instant) -> Option<AddrInfo> {
        for addrinfo in self.forwarders.iter_mut() {
            if !addrinfo.is_marked() {
                addrinfo.mark();
                return Some(addrinfo.clone());
            }
        }
        let nfinds = self.finds.len();
        if nfinds == 0 {
            return None;
        }
        for offset in 0..nfinds {
            let idx = (self.find_cursor + offset) % nfinds;
            if let Some(addrinfo) = self.finds[idx].next_unmarked(&self.domain, now) {
                self.find_cursor = (idx + 1) % nfinds;
                return Some(addrinfo);
            }
        }
        None
    }

    /// Begins a new address round; dropping the finds clears every MARK.
    pub(crate) fn cleanup_round(&mut self) {
        self.finds.clear();
        self.forwarders.clear();
        self.find_cursor = 0;
    }

    pub(crate) fn arm_timer(&mut self, res: &Arc<ResolverInner>) {
        self.timer_epoch += 1;
        let epoch = self.timer_epoch;
        let fire = std::cmp::min(Instant::now() + self.retry_interval, self.expiry);
        let tx = res.buckets[self.bucket].tx.clone();
        let fctx = self.id;
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(fire)).await;
            let _ = tx.send(BucketMsg::Timeout { fctx, epoch });
        });
    }

    pub(crate) fn stop_timer(&mut self) {
        self.timer_epoch += 1;
    }

    /// Drops every outstanding query, optionally recording the
    /// known-non-response RTT penalty against each server.
    pub(crate) fn cancel_queries(&mut self, res: &Arc<ResolverInner>, penalize: bool) {
        let restarts = self.restarts;
        for (_, mut query) in self.queries.drain() {
            if penalize {
                let rtt = res.adb.timeout_rtt(&query.addrinfo, restarts);
                res.adb.adjust_srtt(
                    &query.addrinfo,
                    rtt,
                    crate::adb::AdjustFactor::Replace,
                );
            }
            query.cleanup(res);
        }
    }

    fn stop_everything(&mut self, res: &Arc<ResolverInner>) {
        self.stop_timer();
        self.cancel_queries(res, false);
        self.cleanup_round();
    }

    /// Terminal transition: stop all activity and fan the reply out to every
    /// waiter under the bucket lock.
    pub(crate) fn finish(&mut self, res: &Arc<ResolverInner>, reply: FetchReply) {
        if self.done {
            return;
        }
        if reply.is_ok() {
            self.attrs |= FCTX_HAVE_ANSWER;
        }
        self.stop_everything(res);
        self.done = true;
        let result = match &reply {
            Ok(response) => response.outcome.to_string(),
            Err(e) => e.to_string(),
        };
        debug!(fctx = self.id, name = %self.name, %result, "Fetch finished");
        res.finish_fctx(self.bucket, self.id, reply);
    }
}
