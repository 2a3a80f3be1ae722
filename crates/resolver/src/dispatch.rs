//! Query dispatch: shared UDP sockets multiplexing in-flight queries by
//! wire id, and one-shot TCP exchanges with RFC 1035 length framing.

use crate::fetch::{BucketMsg, FctxId, ResponseEvent};
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use taproot_domain::ResolverError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Largest response accepted from the UDP socket. We advertise 2048 in the
/// OPT record; the extra headroom tolerates servers that ignore it.
const UDP_RECV_SIZE: usize = 4096;

/// Largest response accepted from the TCP framer.
const TCP_RECV_CAP: usize = 4096;

/// A registered response slot: which bucket gets the packet for an id, and
/// which peer is allowed to fill it.
pub(crate) struct Route {
    pub peer: SocketAddr,
    pub tx: UnboundedSender<BucketMsg>,
    pub fctx: FctxId,
    pub query: u64,
}

/// A shared UDP socket with per-id response routing.
pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    routes: Arc<DashMap<u16, Route, FxBuildHasher>>,
    reader: JoinHandle<()>,
}

impl Dispatcher {
    /// Binds within the configured source-port range, walking upward from
    /// `port_min` until a bind succeeds.
    pub async fn bind(
        ip: IpAddr,
        port_min: u16,
        port_max: u16,
    ) -> Result<Dispatcher, ResolverError> {
        for port in port_min..=port_max {
            match UdpSocket::bind(SocketAddr::new(ip, port)).await {
                Ok(socket) => {
                    let local = socket.local_addr()?;
                    debug!(%local, "Dispatcher bound");
                    return Ok(Self::from_socket(socket, local));
                }
                Err(_) => continue,
            }
        }
        Err(ResolverError::PortRangeExhausted)
    }

    fn from_socket(socket: UdpSocket, local: SocketAddr) -> Dispatcher {
        let socket = Arc::new(socket);
        let routes: Arc<DashMap<u16, Route, FxBuildHasher>> =
            Arc::new(DashMap::with_hasher(FxBuildHasher));

        let reader_socket = Arc::clone(&socket);
        let reader_routes = Arc::clone(&routes);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; UDP_RECV_SIZE];
            loop {
                let (len, from) = match reader_socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "Dispatcher receive failed");
                        continue;
                    }
                };
                if len < 12 {
                    trace!(from = %from, len, "Runt datagram dropped");
                    continue;
                }
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                let Some(route) = reader_routes.get(&id) else {
                    trace!(from = %from, id, "No route for response id");
                    continue;
                };
                if route.peer != from {
                    warn!(expected = %route.peer, from = %from, id, "Response from unexpected source");
                    continue;
                }
                let _ = route.tx.send(BucketMsg::Response {
                    fctx: route.fctx,
                    query: route.query,
                    event: ResponseEvent::Packet {
                        bytes: buf[..len].to_vec(),
                        via_tcp: false,
                    },
                });
            }
        });

        Dispatcher {
            socket,
            local,
            routes,
            reader,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Reserves a wire id routed to the given bucket for responses from
    /// `peer`.
    pub(crate) fn add_response(
        &self,
        peer: SocketAddr,
        tx: UnboundedSender<BucketMsg>,
        fctx: FctxId,
        query: u64,
    ) -> Result<u16, ResolverError> {
        for _ in 0..64 {
            let id = fastrand::u16(..);
            match self.routes.entry(id) {
                dashmap::Entry::Occupied(_) => continue,
                dashmap::Entry::Vacant(slot) => {
                    slot.insert(Route {
                        peer,
                        tx,
                        fctx,
                        query,
                    });
                    return Ok(id);
                }
            }
        }
        Err(ResolverError::NoFreeIds)
    }

    pub(crate) fn remove_response(&self, id: u16) {
        self.routes.remove(&id);
    }

    pub async fn send(&self, buf: &[u8], peer: SocketAddr) -> Result<(), ResolverError> {
        self.socket.send_to(buf, peer).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.reader.abort();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// One length-prefixed DNS exchange over a private TCP connection.
pub(crate) async fn tcp_exchange(peer: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(peer).await?;

    let length = (payload.len() as u16).to_be_bytes();
    stream.write_all(&length).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let response_len = u16::from_be_bytes(len_buf) as usize;
    if response_len > TCP_RECV_CAP {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("TCP response too large: {} bytes", response_len),
        ));
    }

    let mut response = vec![0u8; response_len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_bind_walks_port_range() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let first = Dispatcher::bind(ip, 15353, 15360).await.unwrap();
        let second = Dispatcher::bind(ip, 15353, 15360).await.unwrap();

        assert_ne!(first.local_addr().port(), second.local_addr().port());
        assert!(first.local_addr().port() >= 15353);
        assert!(second.local_addr().port() <= 15360);
    }

    #[tokio::test]
    async fn test_bind_exhausted_range() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let _hold = Dispatcher::bind(ip, 15400, 15400).await.unwrap();
        let result = Dispatcher::bind(ip, 15400, 15400).await;
        assert!(matches!(result, Err(ResolverError::PortRangeExhausted)));
    }

    #[tokio::test]
    async fn test_response_routed_by_id_and_peer() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let dispatcher = Dispatcher::bind(ip, 15500, 15599).await.unwrap();

        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = peer_socket.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = dispatcher.add_response(peer, tx, 7, 42).unwrap();

        // A datagram from the right peer with the right id gets through.
        let mut packet = vec![0u8; 12];
        packet[0..2].copy_from_slice(&id.to_be_bytes());
        peer_socket
            .send_to(&packet, dispatcher.local_addr())
            .await
            .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            BucketMsg::Response { fctx, query, .. } => {
                assert_eq!(fctx, 7);
                assert_eq!(query, 42);
            }
            _ => panic!("expected a response event"),
        }

        // The wrong id is dropped.
        let mut wrong = vec![0u8; 12];
        wrong[0..2].copy_from_slice(&id.wrapping_add(1).to_be_bytes());
        peer_socket
            .send_to(&wrong, dispatcher.local_addr())
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );

        dispatcher.remove_response(id);
    }

    #[tokio::test]
    async fn test_tcp_exchange_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut request = vec![0u8; len];
            stream.read_exact(&mut request).await.unwrap();

            // Echo the request back, framed.
            stream.write_all(&len_buf).await.unwrap();
            stream.write_all(&request).await.unwrap();
        });

        let payload = b"\x12\x34hello dns";
        let response = tcp_exchange(addr, payload).await.unwrap();
        assert_eq!(response, payload);
    }
}
