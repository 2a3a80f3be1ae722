#![allow(dead_code)]
//! Scripted in-process DNS server answering over UDP and TCP on one port.
//!
//! The handler sees the parsed query, the raw datagram, and the transport,
//! and decides the response (or `None` to stay silent).

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, CNAME, NS, SOA, TXT};
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

pub type Handler = Arc<dyn Fn(&Message, &[u8], Transport) -> Option<Message> + Send + Sync>;

pub struct MockDnsServer {
    addr: SocketAddr,
    udp_queries: Arc<AtomicUsize>,
    tcp_queries: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockDnsServer {
    /// Binds UDP and TCP on an OS-assigned loopback port.
    pub async fn start(handler: Handler) -> std::io::Result<Self> {
        Self::start_at("127.0.0.1".parse().unwrap(), 0, handler).await
    }

    /// Binds a specific (ip, port); used to stand up several servers on the
    /// same port across loopback aliases.
    pub async fn start_at(ip: IpAddr, port: u16, handler: Handler) -> std::io::Result<Self> {
        let tcp = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let addr = tcp.local_addr()?;
        let udp = UdpSocket::bind(addr).await?;

        let udp_queries = Arc::new(AtomicUsize::new(0));
        let tcp_queries = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        {
            let handler = Arc::clone(&handler);
            let count = Arc::clone(&udp_queries);
            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                        break;
                    };
                    count.fetch_add(1, Ordering::SeqCst);
                    let raw = &buf[..len];
                    let Ok(query) = Message::from_vec(raw) else {
                        continue;
                    };
                    if let Some(response) = handler(&query, raw, Transport::Udp) {
                        let _ = udp.send_to(&serialize(&response), peer).await;
                    }
                }
            }));
        }

        {
            let handler = Arc::clone(&handler);
            let count = Arc::clone(&tcp_queries);
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((mut stream, _)) = tcp.accept().await else {
                        break;
                    };
                    let handler = Arc::clone(&handler);
                    let count = Arc::clone(&count);
                    tokio::spawn(async move {
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() {
                            return;
                        }
                        let len = u16::from_be_bytes(len_buf) as usize;
                        let mut raw = vec![0u8; len];
                        if stream.read_exact(&mut raw).await.is_err() {
                            return;
                        }
                        count.fetch_add(1, Ordering::SeqCst);
                        let Ok(query) = Message::from_vec(&raw) else {
                            return;
                        };
                        if let Some(response) = handler(&query, &raw, Transport::Tcp) {
                            let bytes = serialize(&response);
                            let _ = stream
                                .write_all(&(bytes.len() as u16).to_be_bytes())
                                .await;
                            let _ = stream.write_all(&bytes).await;
                        }
                    });
                }
            }));
        }

        Ok(Self {
            addr,
            udp_queries,
            tcp_queries,
            tasks,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn udp_queries(&self) -> usize {
        self.udp_queries.load(Ordering::SeqCst)
    }

    pub fn tcp_queries(&self) -> usize {
        self.tcp_queries.load(Ordering::SeqCst)
    }
}

impl Drop for MockDnsServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn serialize(message: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    message.emit(&mut encoder).expect("serialize mock response");
    buf
}

pub fn name(s: &str) -> Name {
    Name::from_str(s).expect("test name")
}

/// Response skeleton echoing the question.
pub fn respond_to(query: &Message) -> Message {
    let mut response = Message::new(query.id(), MessageType::Response, OpCode::Query);
    if let Some(q) = query.queries().first() {
        response.add_query(q.clone());
    }
    response
}

pub fn answer(query: &Message, aa: bool, records: Vec<Record>) -> Message {
    let mut response = respond_to(query);
    response.set_authoritative(aa);
    for record in records {
        response.add_answer(record);
    }
    response
}

pub fn referral(query: &Message, zone: &str, servers: &[(&str, Option<IpAddr>)]) -> Message {
    let mut response = respond_to(query);
    for (ns_name, glue) in servers {
        response.add_name_server(ns_record(zone, ns_name));
        if let Some(ip) = glue {
            match ip {
                IpAddr::V4(v4) => {
                    response.add_additional(Record::from_rdata(
                        name(ns_name),
                        172800,
                        RData::A(A(*v4)),
                    ));
                }
                IpAddr::V6(_) => {}
            }
        }
    }
    response
}

pub fn negative(query: &Message, rcode: ResponseCode, zone: &str, minimum: u32) -> Message {
    let mut response = respond_to(query);
    response.set_authoritative(true);
    response.set_response_code(rcode);
    response.add_name_server(soa_record(zone, minimum));
    response
}

pub fn truncated(query: &Message) -> Message {
    let mut response = respond_to(query);
    response.set_truncated(true);
    response
}

pub fn rcode_only(query: &Message, rcode: ResponseCode) -> Message {
    let mut response = respond_to(query);
    response.set_response_code(rcode);
    response
}

pub fn a_record(owner: &str, ip: &str, ttl: u32) -> Record {
    Record::from_rdata(name(owner), ttl, RData::A(A(ip.parse().unwrap())))
}

pub fn cname_record(owner: &str, target: &str, ttl: u32) -> Record {
    Record::from_rdata(name(owner), ttl, RData::CNAME(CNAME(name(target))))
}

pub fn ns_record(owner: &str, target: &str) -> Record {
    Record::from_rdata(name(owner), 172800, RData::NS(NS(name(target))))
}

pub fn txt_record(owner: &str, text: &str, ttl: u32) -> Record {
    Record::from_rdata(
        name(owner),
        ttl,
        RData::TXT(TXT::new(vec![text.to_string()])),
    )
}

pub fn soa_record(zone: &str, minimum: u32) -> Record {
    Record::from_rdata(
        name(zone),
        3600,
        RData::SOA(SOA::new(
            name(&format!("ns1.{}", zone.trim_start_matches('.'))),
            name(&format!("hostmaster.{}", zone.trim_start_matches('.'))),
            2026080100,
            7200,
            3600,
            604800,
            minimum,
        )),
    )
}

/// True when the raw query carries an EDNS0 OPT record (queries never carry
/// any other additional record).
pub fn has_opt(raw: &[u8]) -> bool {
    raw.len() >= 12 && u16::from_be_bytes([raw[10], raw[11]]) > 0
}
