//! Outbound query issuance and the response entry point.

use super::classify::{Classified, ClassifiedMessage, ClassifyError};
use super::context::{FetchMachine, FCTX_WANT_CACHE, FCTX_WANT_NCACHE};
use super::{BucketMsg, FetchResponse, ResolverInner, ResponseEvent};
use crate::adb::{AddrInfo, AdjustFactor, ENTRY_NOEDNS0};
use crate::dispatch;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use std::sync::Arc;
use std::time::Instant;
use taproot_domain::{FetchOptions, ResolverError};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Outbound UDP queries must fit the classic 512-byte message bound.
const UDP_SEND_LIMIT: usize = 512;

/// One outstanding outbound query.
pub(crate) struct ResQuery {
    pub wire_id: u16,
    pub addrinfo: AddrInfo,
    pub start: Instant,
    pub options: FetchOptions,
    /// Whether an OPT record went out with this query.
    pub edns: bool,
    pub udp_route: Option<UdpRoute>,
    pub tcp_task: Option<AbortHandle>,
}

pub(crate) struct UdpRoute {
    pub v6: bool,
    pub id: u16,
}

impl ResQuery {
    /// Releases the dispatcher slot or aborts a connecting TCP exchange.
    pub(crate) fn cleanup(&mut self, res: &Arc<ResolverInner>) {
        if let Some(route) = self.udp_route.take() {
            if let Some(dispatcher) = res.dispatcher(route.v6) {
                dispatcher.remove_response(route.id);
            }
        }
        if let Some(task) = self.tcp_task.take() {
            task.abort();
        }
    }
}

impl FetchMachine {
    /// Retry interval: the doubled SRTT or the restart schedule, whichever
    /// is longer, clamped to 30 s. The schedule is 2 s for the first three
    /// rounds and doubles afterwards.
    fn compute_retry_interval(&mut self, srtt_us: u64) {
        let doubled_secs = (2 * srtt_us) / 1_000_000;
        let schedule = if self.restarts <= 2 {
            2
        } else {
            1u64 << self.restarts.min(30)
        };
        let seconds = doubled_secs.max(schedule).min(30);
        self.retry_interval = std::time::Duration::from_secs(seconds);
    }

    pub(crate) async fn send_query(
        &mut self,
        res: &Arc<ResolverInner>,
        addrinfo: AddrInfo,
        options: FetchOptions,
    ) -> Result<(), ResolverError> {
        self.compute_retry_interval(addrinfo.srtt_us());
        self.arm_timer(res);

        let seq = self.next_query_seq;
        self.next_query_seq += 1;

        let use_tcp = options.contains(FetchOptions::TCP);
        let use_edns = !options.contains(FetchOptions::NOEDNS0) && !addrinfo.no_edns0();
        let recursion = self.options.contains(FetchOptions::RECURSIVE) || addrinfo.is_forwarder();
        let peer = addrinfo.addr();
        let edns_size = res.config().edns_udp_size;

        if use_tcp {
            let wire_id = fastrand::u16(..);
            let buf = build_query(wire_id, &self.name, self.qtype, recursion, use_edns, edns_size)?;
            let tx = res.buckets[self.bucket].tx.clone();
            let fctx = self.id;
            let handle = tokio::spawn(async move {
                match dispatch::tcp_exchange(peer, &buf).await {
                    Ok(bytes) => {
                        let _ = tx.send(BucketMsg::Response {
                            fctx,
                            query: seq,
                            event: ResponseEvent::Packet {
                                bytes,
                                via_tcp: true,
                            },
                        });
                    }
                    Err(e) => {
                        let _ = tx.send(BucketMsg::Response {
                            fctx,
                            query: seq,
                            event: ResponseEvent::TcpError(e.to_string()),
                        });
                    }
                }
            });
            trace!(fctx = self.id, %peer, wire_id, "TCP query sent");
            self.queries.insert(
                seq,
                ResQuery {
                    wire_id,
                    addrinfo,
                    start: Instant::now(),
                    options,
                    edns: use_edns,
                    udp_route: None,
                    tcp_task: Some(handle.abort_handle()),
                },
            );
            Ok(())
        } else {
            let v6 = peer.is_ipv6();
            let dispatcher = res
                .dispatcher(v6)
                .ok_or_else(|| ResolverError::Io("no dispatcher for address family".into()))?;
            let tx = res.buckets[self.bucket].tx.clone();
            let wire_id = dispatcher.add_response(peer, tx, self.id, seq)?;

            let buf = build_query(wire_id, &self.name, self.qtype, recursion, use_edns, edns_size)?;
            if buf.len() > UDP_SEND_LIMIT {
                dispatcher.remove_response(wire_id);
                return Err(ResolverError::Encode(format!(
                    "query too large for UDP: {} bytes",
                    buf.len()
                )));
            }
            if let Err(e) = dispatcher.send(&buf, peer).await {
                dispatcher.remove_response(wire_id);
                return Err(e);
            }
            trace!(fctx = self.id, %peer, wire_id, edns = use_edns, "UDP query sent");
            self.queries.insert(
                seq,
                ResQuery {
                    wire_id,
                    addrinfo,
                    start: Instant::now(),
                    options,
                    edns: use_edns,
                    udp_route: Some(UdpRoute { v6, id: wire_id }),
                    tcp_task: None,
                },
            );
            Ok(())
        }
    }

    fn remove_query(&mut self, res: &Arc<ResolverInner>, seq: u64) -> Option<ResQuery> {
        let mut query = self.queries.remove(&seq)?;
        query.cleanup(res);
        Some(query)
    }

    pub(crate) async fn on_response(
        &mut self,
        res: &Arc<ResolverInner>,
        seq: u64,
        event: ResponseEvent,
    ) {
        if self.done || !self.queries.contains_key(&seq) {
            return;
        }
        match event {
            ResponseEvent::Packet { bytes, via_tcp } => {
                self.process_packet(res, seq, bytes, via_tcp).await;
            }
            ResponseEvent::TcpError(error) => {
                // Connect or stream failure; never fatal for the fetch.
                let Some(query) = self.remove_query(res, seq) else {
                    return;
                };
                warn!(fctx = self.id, addr = %query.addrinfo.addr(), %error, "TCP exchange failed");
                let rtt = res.adb.timeout_rtt(&query.addrinfo, self.restarts);
                res.adb.adjust_srtt(&query.addrinfo, rtt, AdjustFactor::Replace);
                self.try_next(res).await;
            }
        }
    }

    async fn process_packet(
        &mut self,
        res: &Arc<ResolverInner>,
        seq: u64,
        bytes: Vec<u8>,
        via_tcp: bool,
    ) {
        let (wire_id, edns, is_forwarder) = match self.queries.get(&seq) {
            Some(query) => {
                res.adb
                    .adjust_srtt(&query.addrinfo, query.start.elapsed(), AdjustFactor::Default);
                (query.wire_id, query.edns, query.addrinfo.is_forwarder())
            }
            None => return,
        };

        let message = match Message::from_vec(&bytes) {
            Ok(message) => message,
            Err(error) => {
                debug!(fctx = self.id, %error, via_tcp, "Unparseable response");
                if !via_tcp && tc_bit_set(&bytes) && question_scans(&bytes) {
                    // Enough survived to recognize truncation.
                    self.retry_tcp(res, seq).await;
                } else if edns {
                    self.disable_edns_and_resend(res, seq).await;
                } else {
                    self.broken_server(res, seq, "unparseable response").await;
                }
                return;
            }
        };

        if message.id() != wire_id {
            trace!(fctx = self.id, got = message.id(), want = wire_id, "Response id mismatch");
            return;
        }
        if message.op_code() != OpCode::Query {
            self.broken_server(res, seq, "unexpected opcode").await;
            return;
        }
        let rcode = message.response_code();
        if rcode == ResponseCode::FormErr && edns {
            self.disable_edns_and_resend(res, seq).await;
            return;
        }
        if !matches!(rcode, ResponseCode::NoError | ResponseCode::NXDomain) {
            self.broken_server(res, seq, "error rcode").await;
            return;
        }
        if !same_question(&message, &self.name, self.qtype) {
            self.broken_server(res, seq, "question mismatch").await;
            return;
        }
        if message.truncated() && !via_tcp {
            debug!(fctx = self.id, "Truncated response, retrying over TCP");
            self.retry_tcp(res, seq).await;
            return;
        }

        self.attrs &= !(FCTX_WANT_CACHE | FCTX_WANT_NCACHE);
        let mut classified = ClassifiedMessage::build(&message);
        let result = if !classified.answer.is_empty() {
            self.answer_response(&mut classified, is_forwarder)
        } else {
            self.noanswer_response(&mut classified, None, is_forwarder)
        };

        match result {
            Err(ClassifyError::FormErr) => {
                self.broken_server(res, seq, "malformed response").await;
            }
            Err(ClassifyError::Lame) => {
                let Some(query) = self.remove_query(res, seq) else {
                    return;
                };
                debug!(fctx = self.id, addr = %query.addrinfo.addr(), domain = %self.domain, "Lame server");
                res.adb
                    .mark_lame(&query.addrinfo, &self.domain, Instant::now());
                self.try_next(res).await;
            }
            Ok(Classified::Answer) => {
                self.remove_query(res, seq);
                self.stop_timer();
                let cached = if self.attrs & FCTX_WANT_CACHE != 0 {
                    self.cache_message(res, &classified).await
                } else {
                    Ok(None)
                };
                match cached {
                    Ok(Some(answer)) => {
                        self.finish(
                            res,
                            Ok(FetchResponse {
                                outcome: answer.outcome,
                                name: answer.name,
                                rdataset: answer.rdataset,
                                sigrdataset: answer.sigrdataset,
                            }),
                        );
                    }
                    // Classification promised an answer the cache pass could
                    // not bind; nothing useful to hand the waiters.
                    Ok(None) => self.finish(res, Err(ResolverError::ServFail)),
                    Err(e) => self.finish(res, Err(e)),
                }
            }
            Ok(Classified::Negative) => {
                self.remove_query(res, seq);
                self.stop_timer();
                debug_assert!(self.attrs & FCTX_WANT_NCACHE != 0);
                let (outcome, rdataset) = self.ncache_message(res, &classified);
                self.finish(
                    res,
                    Ok(FetchResponse {
                        outcome,
                        name: self.name.clone(),
                        rdataset,
                        sigrdataset: None,
                    }),
                );
            }
            Ok(Classified::Delegation {
                domain,
                nameservers,
            }) => {
                self.remove_query(res, seq);
                // Commit the referral's NS set and glue before moving on.
                if self.attrs & FCTX_WANT_CACHE != 0 {
                    let _ = self.cache_message(res, &classified).await;
                }
                debug!(fctx = self.id, old = %self.domain, new = %domain, "Following referral");
                self.domain = domain;
                self.nameservers = nameservers;
                self.cleanup_round();
                self.try_next(res).await;
            }
        }
    }

    async fn broken_server(&mut self, res: &Arc<ResolverInner>, seq: u64, reason: &str) {
        let Some(query) = self.remove_query(res, seq) else {
            return;
        };
        debug!(fctx = self.id, addr = %query.addrinfo.addr(), reason, "Broken server, trying next");
        self.try_next(res).await;
    }

    /// EDNS0 negotiation failure: remember it on the server entry and retry
    /// the same address without OPT.
    async fn disable_edns_and_resend(&mut self, res: &Arc<ResolverInner>, seq: u64) {
        let Some(query) = self.remove_query(res, seq) else {
            return;
        };
        debug!(fctx = self.id, addr = %query.addrinfo.addr(), "Disabling EDNS0 for server");
        res.adb
            .change_flags(&query.addrinfo, ENTRY_NOEDNS0, ENTRY_NOEDNS0);
        let addrinfo = query.addrinfo.clone();
        let options = query.options;
        if self.send_query(res, addrinfo, options).await.is_err() {
            self.try_next(res).await;
        }
    }

    async fn retry_tcp(&mut self, res: &Arc<ResolverInner>, seq: u64) {
        let Some(query) = self.remove_query(res, seq) else {
            return;
        };
        if query.options.contains(FetchOptions::TCP) {
            debug!(fctx = self.id, addr = %query.addrinfo.addr(), "Truncation over TCP");
            self.try_next(res).await;
            return;
        }
        let addrinfo = query.addrinfo.clone();
        let options = query.options | FetchOptions::TCP;
        if self.send_query(res, addrinfo, options).await.is_err() {
            self.try_next(res).await;
        }
    }
}

/// Renders the outbound question, appending an EDNS0 OPT pseudo-RR at the
/// wire level when negotiation is on.
fn build_query(
    wire_id: u16,
    name: &Name,
    qtype: RecordType,
    recursion: bool,
    edns: bool,
    edns_udp_size: u16,
) -> Result<Vec<u8>, ResolverError> {
    let mut question = Query::new();
    question.set_name(name.clone());
    question.set_query_type(qtype);
    question.set_query_class(DNSClass::IN);

    let mut message = Message::new(wire_id, MessageType::Query, OpCode::Query);
    message.set_recursion_desired(recursion);
    message.add_query(question);

    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    message
        .emit(&mut encoder)
        .map_err(|e| ResolverError::Encode(e.to_string()))?;

    if edns {
        append_opt(&mut buf, edns_udp_size);
    }
    Ok(buf)
}

/// Appends a minimal OPT record (RFC 6891 §6.1.1) and bumps ARCOUNT.
/// The rendered question carries no other additional records.
fn append_opt(buf: &mut Vec<u8>, udp_size: u16) {
    buf[10] = 0;
    buf[11] = 1;
    buf.push(0x00); // root owner
    buf.extend_from_slice(&[0x00, 0x29]); // TYPE 41
    buf.extend_from_slice(&udp_size.to_be_bytes()); // CLASS = payload size
    buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // ext-RCODE/version/flags
    buf.extend_from_slice(&[0x00, 0x00]); // RDLEN 0
}

fn tc_bit_set(bytes: &[u8]) -> bool {
    bytes.len() > 2 && bytes[2] & 0x02 != 0
}

/// Minimal question-section scan for responses hickory rejects: one
/// question whose labels and fixed fields fit in the datagram.
fn question_scans(bytes: &[u8]) -> bool {
    if bytes.len() < 12 {
        return false;
    }
    let qdcount = u16::from_be_bytes([bytes[4], bytes[5]]);
    if qdcount != 1 {
        return false;
    }
    let mut pos = 12usize;
    loop {
        if pos >= bytes.len() {
            return false;
        }
        let len = bytes[pos] as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xc0 != 0 {
            return false;
        }
        pos += 1 + len;
    }
    pos + 4 <= bytes.len()
}

fn same_question(message: &Message, name: &Name, qtype: RecordType) -> bool {
    let queries = message.queries();
    if queries.len() != 1 {
        return false;
    }
    let q = &queries[0];
    q.query_class() == DNSClass::IN
        && q.query_type() == qtype
        && q.name().to_lowercase() == *name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::context::FctxInit;
    use crate::rdataset::Rdataset;
    use std::str::FromStr;
    use std::time::Duration;

    fn machine(restarts: u32) -> FetchMachine {
        let domain = Name::from_str("example.").unwrap();
        let init = FctxInit {
            name: Name::from_str("www.example.").unwrap(),
            qtype: RecordType::A,
            options: FetchOptions::empty(),
            domain: domain.clone(),
            nameservers: Rdataset::from_ns_names(domain, 3600, &[]),
            fwd_servers: Vec::new(),
            forward_only: false,
            lifetime: Duration::from_secs(90),
            internal: false,
        };
        let mut m = FetchMachine::new(1, 0, init);
        m.restarts = restarts;
        m
    }

    #[test]
    fn test_retry_interval_stays_within_bounds() {
        // Fresh server, early round: the 2 s floor.
        let mut m = machine(0);
        m.compute_retry_interval(0);
        assert_eq!(m.retry_interval, Duration::from_secs(2));

        // A slow server doubles its SRTT.
        let mut m = machine(1);
        m.compute_retry_interval(4_000_000);
        assert_eq!(m.retry_interval, Duration::from_secs(8));

        // Late rounds back off exponentially.
        let mut m = machine(4);
        m.compute_retry_interval(0);
        assert_eq!(m.retry_interval, Duration::from_secs(16));

        // Everything clamps to the 30 s ceiling.
        let mut m = machine(10);
        m.compute_retry_interval(60_000_000);
        assert_eq!(m.retry_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_build_query_sets_rd_and_question() {
        let name = Name::from_str("www.example.org.").unwrap();
        let buf = build_query(0x1234, &name, RecordType::A, true, false, 2048).unwrap();

        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 0x1234);
        assert_eq!(buf[2] & 0x01, 0x01, "RD must be set");
        assert_eq!(u16::from_be_bytes([buf[10], buf[11]]), 0, "no additionals");

        let parsed = Message::from_vec(&buf).unwrap();
        assert!(same_question(&parsed, &name, RecordType::A));
        assert!(!same_question(&parsed, &name, RecordType::AAAA));
    }

    #[test]
    fn test_build_query_appends_opt() {
        let name = Name::from_str("example.org.").unwrap();
        let plain = build_query(1, &name, RecordType::A, false, false, 2048).unwrap();
        let with_opt = build_query(1, &name, RecordType::A, false, true, 2048).unwrap();

        assert_eq!(with_opt.len(), plain.len() + 11);
        assert_eq!(u16::from_be_bytes([with_opt[10], with_opt[11]]), 1);

        // The OPT record advertises our payload size.
        let opt = &with_opt[plain.len()..];
        assert_eq!(opt[0], 0x00);
        assert_eq!(u16::from_be_bytes([opt[1], opt[2]]), 41);
        assert_eq!(u16::from_be_bytes([opt[3], opt[4]]), 2048);

        // Still a valid message to the codec.
        let parsed = Message::from_vec(&with_opt).unwrap();
        assert_eq!(parsed.id(), 1);
    }

    #[test]
    fn test_question_scan_tolerates_garbage_tail() {
        let name = Name::from_str("big.example.").unwrap();
        let mut buf = build_query(7, &name, RecordType::TXT, false, false, 2048).unwrap();
        // Simulate a truncated-but-flagged response: set QR+TC, chop the tail.
        buf[2] |= 0x82;
        assert!(tc_bit_set(&buf));
        assert!(question_scans(&buf));

        let runt = &buf[..8];
        assert!(!question_scans(runt));
    }

    #[test]
    fn test_same_question_is_case_insensitive() {
        let lower = Name::from_str("www.example.org.").unwrap();
        let buf = build_query(9, &Name::from_str("WWW.EXAMPLE.ORG.").unwrap(), RecordType::A, false, false, 2048).unwrap();
        let parsed = Message::from_vec(&buf).unwrap();
        assert!(same_question(&parsed, &lower, RecordType::A));
    }
}
