use std::{
    error, fmt, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use log::{debug, trace};
use tokio::{
    net::UdpSocket,
    time::{self, Instant},
};

use crate::logger::fmt_slice_hex;

use super::crypto;

pub const IKE_PORT: u16 = 500;
pub const NAT_TRAVERSAL_PORT: u16 = 4500;

const MAX_DATAGRAM_SIZE: usize = 4096;
const INITIAL_TIMEOUT: Duration = Duration::from_millis(5000);
const FAST_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2000);
const MAX_ATTEMPTS: u32 = 6;
const NON_ESP_MARKER: [u8; 4] = [0u8; 4];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EncapsulationMode {
    Tunnel,
    UdpTunnel,
    UdpTunnelDraft,
}

impl EncapsulationMode {
    pub fn ipsec_id(&self) -> u16 {
        match self {
            EncapsulationMode::Tunnel => 1,
            EncapsulationMode::UdpTunnel => 3,
            EncapsulationMode::UdpTunnelDraft => 61443,
        }
    }

    pub fn is_udp_encapsulated(&self) -> bool {
        *self != EncapsulationMode::Tunnel
    }
}

impl fmt::Display for EncapsulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncapsulationMode::Tunnel => write!(f, "tunnel"),
            EncapsulationMode::UdpTunnel => write!(f, "UDP tunnel"),
            EncapsulationMode::UdpTunnelDraft => write!(f, "UDP tunnel (draft)"),
        }
    }
}

/// Poll timeouts used while waiting for a response; a send fails after the
/// last one expires.
pub fn retransmission_schedule(base: Duration) -> impl Iterator<Item = Duration> {
    (0..MAX_ATTEMPTS).map(move |attempt| base * (1 << attempt))
}

/// Single-peer ISAKMP datagram transport with retransmission and duplicate
/// suppression.
pub struct Transport {
    socket: UdpSocket,
    local_address: SocketAddrV4,
    peer: SocketAddrV4,
    // Redirects keep the port of the configured gateway.
    gateway_port: u16,
    // Set when NAT-T moved the local port from 500 to 4500.
    moved_local_port: bool,
    encapsulation: EncapsulationMode,
    timeout: Duration,
    last_received_hash: Option<[u8; 20]>,
    last_sent: Option<Vec<u8>>,
}

impl Transport {
    pub async fn bind(
        local_address: SocketAddrV4,
        peer: SocketAddrV4,
    ) -> Result<Transport, TransportError> {
        let socket = UdpSocket::bind(local_address).await?;
        let local_address = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => return Err("Socket is not bound to an IPv4 address".into()),
        };
        debug!("Bound ISAKMP socket to {}, peer is {}", local_address, peer);
        Ok(Transport {
            socket,
            local_address,
            peer,
            gateway_port: peer.port(),
            moved_local_port: false,
            encapsulation: EncapsulationMode::Tunnel,
            timeout: INITIAL_TIMEOUT,
            last_received_hash: None,
            last_sent: None,
        })
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn local_port(&self) -> u16 {
        self.local_address.port()
    }

    pub fn encapsulation(&self) -> EncapsulationMode {
        self.encapsulation
    }

    /// Address the gateway sees as the source of our datagrams, before any NAT.
    pub async fn source_address(&self) -> Result<Ipv4Addr, TransportError> {
        if !self.local_address.ip().is_unspecified() {
            return Ok(*self.local_address.ip());
        }
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(self.peer).await?;
        match socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(*addr.ip()),
            SocketAddr::V6(_) => Err("Routing socket has no IPv4 source address".into()),
        }
    }

    async fn rebind(&mut self, port: u16) -> Result<(), TransportError> {
        let local_address = SocketAddrV4::new(*self.local_address.ip(), port);
        debug!("Moving ISAKMP socket to {}", local_address);
        self.socket = UdpSocket::bind(local_address).await?;
        self.local_address = local_address;
        Ok(())
    }

    /// Switches to NAT-T: UDP encapsulation, peer port 4500 and a local port
    /// move from 500 to 4500.
    pub async fn enable_nat_traversal(
        &mut self,
        encapsulation: EncapsulationMode,
    ) -> Result<(), TransportError> {
        self.encapsulation = encapsulation;
        self.peer.set_port(NAT_TRAVERSAL_PORT);
        if self.local_address.port() == IKE_PORT {
            self.rebind(NAT_TRAVERSAL_PORT).await?;
            self.moved_local_port = true;
        }
        Ok(())
    }

    /// Points the transport at a new gateway, undoing any NAT-T port move.
    pub async fn redirect(&mut self, gateway: Ipv4Addr) -> Result<(), TransportError> {
        self.peer = SocketAddrV4::new(gateway, self.gateway_port);
        self.encapsulation = EncapsulationMode::Tunnel;
        self.last_received_hash = None;
        self.last_sent = None;
        if self.moved_local_port {
            self.rebind(IKE_PORT).await?;
            self.moved_local_port = false;
        }
        Ok(())
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.sendrecv(Some(data), true).await?;
        Ok(())
    }

    pub async fn send_receive(&mut self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.sendrecv(Some(data), false)
            .await?
            .ok_or(TransportError::Internal("No response returned"))
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        self.sendrecv(None, false)
            .await?
            .ok_or(TransportError::Internal("No response returned"))
    }

    pub async fn resend_last(&mut self) -> Result<Vec<u8>, TransportError> {
        let last_sent = self.last_sent.take();
        let result = self.sendrecv(last_sent.as_deref(), false).await;
        if self.last_sent.is_none() {
            self.last_sent = last_sent;
        }
        result?.ok_or(TransportError::Internal("No response returned"))
    }

    pub async fn sendrecv(
        &mut self,
        outbound: Option<&[u8]>,
        send_only: bool,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let start = Instant::now();
        for (attempt, timeout) in retransmission_schedule(self.timeout).enumerate() {
            if let Some(data) = outbound {
                if attempt > 0 {
                    debug!(
                        "No response from {} after {:?}, retransmitting",
                        self.peer, timeout
                    );
                }
                self.transmit(data).await?;
                if send_only {
                    return Ok(None);
                }
                if attempt == 0 {
                    self.last_sent = Some(data.to_vec());
                }
            }
            match time::timeout(timeout, self.receive_valid()).await {
                Ok(Ok(data)) => {
                    let round_trip = start.elapsed();
                    self.timeout = if round_trip < Duration::from_secs(1) {
                        FAST_RESPONSE_TIMEOUT
                    } else {
                        round_trip * 4
                    };
                    return Ok(Some(data));
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    debug!("Timed out after {:?} waiting for {}", timeout, self.peer);
                }
            }
        }
        Err(TransportError::NoResponse)
    }

    async fn transmit(&self, data: &[u8]) -> Result<(), TransportError> {
        trace!("Sending to {}: {}", self.peer, fmt_slice_hex(data));
        if self.encapsulation.is_udp_encapsulated() {
            let mut datagram = Vec::with_capacity(NON_ESP_MARKER.len() + data.len());
            datagram.extend_from_slice(&NON_ESP_MARKER);
            datagram.extend_from_slice(data);
            self.socket.send_to(&datagram, self.peer).await?;
        } else {
            self.socket.send_to(data, self.peer).await?;
        }
        Ok(())
    }

    async fn receive_valid(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, remote_addr) = match self.socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if remote_addr != SocketAddr::V4(self.peer) {
                debug!(
                    "Ignoring datagram from unexpected sender {}, expecting {}",
                    remote_addr, self.peer
                );
                continue;
            }
            let datagram = &buf[..len];
            let hash = crypto::hash_sha1(datagram);
            if self.last_received_hash == Some(hash) {
                debug!("Ignoring duplicate datagram from {}", remote_addr);
                continue;
            }
            let data = if self.encapsulation.is_udp_encapsulated() {
                if len < NON_ESP_MARKER.len() || datagram[..NON_ESP_MARKER.len()] != NON_ESP_MARKER
                {
                    debug!("Ignoring datagram without non-ESP marker");
                    continue;
                }
                &datagram[NON_ESP_MARKER.len()..]
            } else {
                datagram
            };
            self.last_received_hash = Some(hash);
            trace!("Received from {}: {}", remote_addr, fmt_slice_hex(data));
            return Ok(data.to_vec());
        }
    }
}

pub enum TransportError {
    NoResponse,
    Internal(&'static str),
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NoResponse => write!(f, "No response from target"),
            Self::Internal(msg) => f.write_str(msg),
            Self::Io(ref e) => write!(f, "IO error: {}", e),
        }
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for TransportError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::NoResponse => None,
            Self::Internal(_msg) => None,
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for TransportError {
    fn from(msg: &'static str) -> TransportError {
        Self::Internal(msg)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> TransportError {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_pair() -> (Transport, UdpSocket, SocketAddrV4) {
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = match peer.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("Peer is not IPv4"),
        };
        let transport = Transport::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), peer_addr)
            .await
            .unwrap();
        let transport_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, transport.local_port());
        (transport, peer, transport_addr)
    }

    #[test]
    fn backoff_schedule() {
        let t = Duration::from_millis(5000);
        let schedule = retransmission_schedule(t).collect::<Vec<_>>();
        assert_eq!(schedule, vec![t, t * 2, t * 4, t * 8, t * 16, t * 32]);
    }

    #[tokio::test(start_paused = true)]
    async fn retransmits_until_no_response() {
        let peer = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let peer_addr = match peer.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("Peer is not IPv4"),
        };
        let mut transport = Transport::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), peer_addr)
            .await
            .unwrap();

        let start = Instant::now();
        let result = transport.send_receive(b"proposal").await;
        assert!(matches!(result, Err(TransportError::NoResponse)));
        let elapsed = start.elapsed();
        let expected = Duration::from_millis(5000 * 63);
        assert!(elapsed >= expected, "elapsed {:?}", elapsed);
        assert!(elapsed < expected + Duration::from_secs(1), "elapsed {:?}", elapsed);

        peer.set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 64];
        let mut sent = 0;
        while let Ok((len, _)) = peer.recv_from(&mut buf) {
            assert_eq!(&buf[..len], b"proposal");
            sent += 1;
        }
        assert_eq!(sent, 6);
    }

    #[tokio::test]
    async fn send_only_does_not_wait() {
        let (mut transport, peer, _) = bind_pair().await;
        transport.send(b"ack").await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ack");
        assert!(transport.last_sent.is_none());
    }

    #[tokio::test]
    async fn duplicate_datagram_is_ignored() {
        let (mut transport, peer, transport_addr) = bind_pair().await;
        peer.send_to(b"first", transport_addr).await.unwrap();
        peer.send_to(b"first", transport_addr).await.unwrap();
        peer.send_to(b"second", transport_addr).await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), b"first");
        assert_eq!(transport.receive().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn unexpected_sender_is_ignored() {
        let (mut transport, peer, transport_addr) = bind_pair().await;
        let intruder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        intruder.send_to(b"spoofed", transport_addr).await.unwrap();
        peer.send_to(b"genuine", transport_addr).await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), b"genuine");
    }

    #[tokio::test]
    async fn nat_traversal_marker_and_adaptive_timeout() {
        let (mut transport, peer, _) = bind_pair().await;
        transport.encapsulation = EncapsulationMode::UdpTunnel;

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, remote_addr) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"\0\0\0\0request");
            peer.send_to(b"\0\0\0\0response", remote_addr).await.unwrap();
        });

        let response = transport.send_receive(b"request").await.unwrap();
        assert_eq!(response, b"response");
        assert_eq!(transport.timeout, FAST_RESPONSE_TIMEOUT);
        assert_eq!(transport.last_sent.as_deref(), Some(&b"request"[..]));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn resend_last_message() {
        let (mut transport, peer, _) = bind_pair().await;
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, remote_addr) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"request");
            peer.send_to(b"wrong cookie", remote_addr).await.unwrap();
            let (len, remote_addr) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"request");
            peer.send_to(b"response", remote_addr).await.unwrap();
        });

        assert_eq!(transport.send_receive(b"request").await.unwrap(), b"wrong cookie");
        assert_eq!(transport.resend_last().await.unwrap(), b"response");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn nat_detection_moves_peer_port() {
        let (mut transport, peer, _) = bind_pair().await;
        let peer_addr = match peer.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("Peer is not IPv4"),
        };
        let local_port = transport.local_port();
        transport
            .enable_nat_traversal(EncapsulationMode::UdpTunnelDraft)
            .await
            .unwrap();
        assert_eq!(transport.peer().port(), NAT_TRAVERSAL_PORT);
        assert_eq!(transport.encapsulation(), EncapsulationMode::UdpTunnelDraft);
        assert_eq!(transport.local_port(), local_port);

        transport
            .redirect(Ipv4Addr::new(192, 0, 2, 7))
            .await
            .unwrap();
        assert_eq!(
            transport.peer(),
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 7), peer_addr.port())
        );
        assert_eq!(transport.encapsulation(), EncapsulationMode::Tunnel);
        assert_eq!(transport.local_port(), local_port);
    }

    #[tokio::test]
    async fn configured_nat_traversal_port_is_kept() {
        let local_address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, NAT_TRAVERSAL_PORT);
        let gateway = SocketAddrV4::new(Ipv4Addr::LOCALHOST, IKE_PORT);
        let mut transport = match Transport::bind(local_address, gateway).await {
            Ok(transport) => transport,
            // Port 4500 is taken on this host.
            Err(TransportError::Io(err)) if err.kind() == io::ErrorKind::AddrInUse => return,
            Err(err) => panic!("Failed to bind transport: {}", err),
        };
        transport
            .enable_nat_traversal(EncapsulationMode::UdpTunnel)
            .await
            .unwrap();
        assert!(!transport.moved_local_port);
        transport
            .redirect(Ipv4Addr::new(127, 0, 0, 2))
            .await
            .unwrap();
        assert_eq!(transport.local_port(), NAT_TRAVERSAL_PORT);
        assert_eq!(
            transport.peer(),
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 2), IKE_PORT)
        );
    }

    #[tokio::test]
    async fn source_address_of_bound_socket() {
        let (transport, _peer, _) = bind_pair().await;
        assert_eq!(transport.source_address().await.unwrap(), Ipv4Addr::LOCALHOST);
    }
}
