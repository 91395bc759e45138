use log::{debug, info, warn};
use std::{
    error, fmt, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
};
use tokio::net::{self, UdpSocket};

mod algorithms;
mod crypto;
mod dh;
mod message;
mod modecfg;
mod notice;
mod phase1;
mod quick;
mod session;
mod terminal;
mod transport;
mod xauth;

pub use modecfg::ModeConfig;
pub use quick::EspSa;
pub use terminal::TerminalPrompt;
pub use transport::EncapsulationMode;

use algorithms::{Algorithm, DEFAULT_DH_GROUP, DH_GROUPS};
use crypto::{CryptoError, InitError};
use dh::Group;
use message::{FormatError, NotifyType};
use session::Session;
use transport::{Transport, TransportError, IKE_PORT};

const DEFAULT_UDP_ENCAP_PORT: u16 = 10000;
const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Which DH group, if any, protects Quick Mode keys.
#[derive(Clone, Copy)]
pub enum PfsPolicy {
    /// Follow the gateway's DO_PFS Mode-Config attribute.
    Server,
    Group(&'static Algorithm<Option<Group>>),
}

impl FromStr for PfsPolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<PfsPolicy, Self::Err> {
        if s.eq_ignore_ascii_case("server") {
            return Ok(PfsPolicy::Server);
        }
        DH_GROUPS
            .by_name(s)
            .map(PfsPolicy::Group)
            .ok_or("Unsupported PFS group, expected nopfs, dh1, dh2, dh5 or server")
    }
}

impl fmt::Display for PfsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PfsPolicy::Server => f.write_str("server"),
            PfsPolicy::Group(group) => write!(f, "{}", group),
        }
    }
}

pub struct Config {
    pub gateway: String,
    pub local_address: SocketAddrV4,
    pub identity: String,
    pub secret: String,
    pub interface_name: String,
    pub domain: Option<String>,
    pub xauth_username: Option<String>,
    pub xauth_password: Option<String>,
    pub xauth_interactive: bool,
    pub script: Option<String>,
    pub pid_file: Option<String>,
    pub ike_dh_group: &'static Algorithm<Option<Group>>,
    pub pfs: PfsPolicy,
    pub disable_natt: bool,
    pub version_string: String,
    pub hostname: String,
    pub enable_1des: bool,
    pub udp_encap: bool,
    pub udp_encap_port: u16,
    pub ignore_unknown_notices: bool,
    pub max_redirects: usize,
}

impl Config {
    pub fn new(gateway: &str, identity: &str, secret: &str) -> Config {
        Config {
            gateway: gateway.to_string(),
            local_address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, IKE_PORT),
            identity: identity.to_string(),
            secret: secret.to_string(),
            interface_name: "tun0".to_string(),
            domain: None,
            xauth_username: None,
            xauth_password: None,
            xauth_interactive: false,
            script: None,
            pid_file: None,
            ike_dh_group: DEFAULT_DH_GROUP,
            pfs: PfsPolicy::Server,
            disable_natt: false,
            version_string: format!(
                "Cisco Systems VPN Client {}:Linux",
                env!("CARGO_PKG_VERSION")
            ),
            hostname: "localhost".to_string(),
            enable_1des: false,
            udp_encap: false,
            udp_encap_port: DEFAULT_UDP_ENCAP_PORT,
            ignore_unknown_notices: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    pub fn set_ike_dh_group(&mut self, name: &str) -> Result<(), IKEv1Error> {
        match DH_GROUPS.by_name(name) {
            Some(group) if group.id.is_some() => {
                self.ike_dh_group = group;
                Ok(())
            }
            Some(_) => Err(IKEv1Error::Configuration(
                "Phase 1 requires a DH group, nopfs is not allowed",
            )),
            None => Err(IKEv1Error::Configuration(
                "Unsupported IKE DH group, expected dh1, dh2 or dh5",
            )),
        }
    }
}

/// Source of answers that were not provided in the configuration.
pub trait Prompt {
    fn read_line(&mut self, prompt: &str) -> io::Result<String>;

    /// Like `read_line`, but the answer is not shown while typing.
    fn read_secret(&mut self, prompt: &str) -> io::Result<String>;
}

/// Result of a sub-machine: finished, or the gateway redirected us and the
/// handshake must start over.
pub enum Flow<T> {
    Done(T),
    Redirect,
}

/// Everything the data plane needs to carry ESP traffic for the negotiated
/// IPsec SA pair.
pub struct Handoff {
    transport: Transport,
    kill_packet: Vec<u8>,
    /// Separate socket for Cisco UDP encapsulation; otherwise ESP shares the
    /// ISAKMP socket when NAT-T is active.
    pub esp_socket: Option<UdpSocket>,
    pub esp_peer: SocketAddrV4,
    pub encapsulation: EncapsulationMode,
    pub interface_name: String,
    pub outbound: EspSa,
    pub inbound: EspSa,
    pub cipher: &'static str,
    pub cipher_id: u16,
    pub hash: &'static str,
    pub hash_id: u16,
    pub mode_config: ModeConfig,
    pub pid_file: Option<String>,
    pub script: Option<String>,
}

impl Handoff {
    pub fn gateway(&self) -> SocketAddrV4 {
        self.transport.peer()
    }

    /// Tells the gateway to delete both the IPsec and ISAKMP SAs.
    pub async fn send_kill_packet(&mut self) -> Result<(), IKEv1Error> {
        self.transport.send(&self.kill_packet).await?;
        Ok(())
    }
}

/// Drives one connection attempt: phase 1, optional XAUTH, Mode-Config and
/// Quick Mode, restarting on load-balance redirects.
pub struct Client<P: Prompt> {
    config: Config,
    prompt: P,
}

impl<P: Prompt> Client<P> {
    pub fn new(config: Config, prompt: P) -> Client<P> {
        Client { config, prompt }
    }

    pub async fn connect(mut self) -> Result<Handoff, IKEv1Error> {
        let peer = resolve_gateway(&self.config.gateway).await?;
        let mut transport = Transport::bind(self.config.local_address, peer).await?;
        let mut redirects = 0;
        loop {
            let mut session = Session::new();
            info!("Connecting to {}", transport.peer());
            match self.negotiate(&mut session, &mut transport).await {
                Ok(Flow::Done(established)) => {
                    return self.handoff(transport, established).await
                }
                Ok(Flow::Redirect) => {
                    redirects += 1;
                    if redirects > self.config.max_redirects {
                        return Err("Gateway sent too many load balance redirects".into());
                    }
                }
                Err(err) => {
                    teardown(&mut session, &mut transport, &err).await;
                    return Err(err);
                }
            }
        }
    }

    async fn negotiate(
        &mut self,
        session: &mut Session,
        transport: &mut Transport,
    ) -> Result<Flow<Established>, IKEv1Error> {
        let established = phase1::aggressive_mode(&self.config, session, transport).await?;
        if let Some(request) = established.xauth_request {
            let policy = self.notice_policy();
            let flow = xauth::authenticate(
                &self.config,
                &mut self.prompt,
                session,
                transport,
                request,
                policy,
            )
            .await?;
            if let Flow::Redirect = flow {
                return Ok(Flow::Redirect);
            }
        }

        let mode_config =
            match modecfg::request(&self.config, session, transport, self.notice_policy()).await? {
                Flow::Done(mode_config) => mode_config,
                Flow::Redirect => return Ok(Flow::Redirect),
            };
        info!("Assigned address {}", mode_config.address);

        let udp_encap_port = match session.peer_udp_encap_port {
            Some(port) if self.config.udp_encap => Some(port),
            _ => None,
        };
        // Quick Mode negotiates the NAT-T mode; Cisco UDP encapsulation only
        // changes how the data plane carries ESP afterwards.
        let nat_encapsulation = transport.encapsulation();
        let quick_mode = match quick::establish(
            &self.config,
            session,
            transport,
            nat_encapsulation,
            self.notice_policy(),
        )
        .await?
        {
            Flow::Done(quick_mode) => quick_mode,
            Flow::Redirect => return Ok(Flow::Redirect),
        };
        let encapsulation = if udp_encap_port.is_some() {
            EncapsulationMode::UdpTunnel
        } else {
            nat_encapsulation
        };
        Ok(Flow::Done(Established {
            mode_config,
            quick_mode,
            encapsulation,
            udp_encap_port,
        }))
    }

    fn notice_policy(&self) -> notice::NoticePolicy {
        notice::NoticePolicy {
            ignore_unknown: self.config.ignore_unknown_notices,
            report_responder_lifetime: false,
        }
    }

    async fn handoff(
        self,
        transport: Transport,
        established: Established,
    ) -> Result<Handoff, IKEv1Error> {
        let (esp_socket, esp_peer) = match established.udp_encap_port {
            Some(peer_port) => {
                let local_address = SocketAddrV4::new(
                    *self.config.local_address.ip(),
                    self.config.udp_encap_port,
                );
                info!(
                    "Using Cisco UDP encapsulation from port {} to port {}",
                    local_address.port(),
                    peer_port
                );
                let socket = UdpSocket::bind(local_address).await?;
                let peer = SocketAddrV4::new(*transport.peer().ip(), peer_port);
                (Some(socket), peer)
            }
            None => (None, transport.peer()),
        };
        let encapsulation = established.encapsulation;
        let quick_mode = established.quick_mode;
        info!(
            "IPsec SA established with {}-{}, encapsulation {}",
            quick_mode.cipher, quick_mode.hash, encapsulation
        );
        Ok(Handoff {
            transport,
            kill_packet: quick_mode.kill_packet,
            esp_socket,
            esp_peer,
            encapsulation,
            interface_name: self.config.interface_name,
            outbound: quick_mode.outbound,
            inbound: quick_mode.inbound,
            cipher: quick_mode.cipher.name,
            cipher_id: quick_mode.cipher.ipsec_id,
            hash: quick_mode.hash.name,
            hash_id: quick_mode.hash.ipsec_id,
            mode_config: established.mode_config,
            pid_file: self.config.pid_file,
            script: self.config.script,
        })
    }
}

struct Established {
    mode_config: ModeConfig,
    quick_mode: quick::QuickMode,
    encapsulation: EncapsulationMode,
    udp_encap_port: Option<u16>,
}

async fn resolve_gateway(gateway: &str) -> Result<SocketAddrV4, IKEv1Error> {
    if let Ok(addr) = gateway.parse::<SocketAddrV4>() {
        return Ok(addr);
    }
    if let Ok(ip) = gateway.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, IKE_PORT));
    }
    let addr = net::lookup_host((gateway, IKE_PORT))
        .await?
        .find_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
        .ok_or(IKEv1Error::Configuration("Gateway has no IPv4 address"))?;
    debug!("Resolved gateway {} to {}", gateway, addr);
    Ok(addr)
}

/// Best-effort notification of the gateway after a fatal protocol failure.
async fn teardown(session: &mut Session, transport: &mut Transport, err: &IKEv1Error) {
    let notify = match err.teardown() {
        Teardown::Skip => return,
        Teardown::DeleteOnly => None,
        Teardown::Notify(notify) => Some(notify),
    };
    if !session.has_keys() {
        return;
    }
    let messages = match session.teardown_messages(notify) {
        Ok(messages) => messages,
        Err(err) => {
            warn!("Failed to prepare teardown messages: {}", err);
            return;
        }
    };
    for message in messages {
        if let Err(err) = transport.send(&message).await {
            warn!("Failed to send teardown message: {}", err);
        }
    }
}

enum Teardown {
    Skip,
    DeleteOnly,
    Notify(NotifyType),
}

pub enum IKEv1Error {
    Internal(&'static str),
    Configuration(&'static str),
    Rejected {
        notify: NotifyType,
        context: &'static str,
    },
    PeerNotify(NotifyType),
    AuthenticationFailed(&'static str),
    Format(FormatError),
    Crypto(CryptoError),
    Transport(TransportError),
    Io(io::Error),
}

impl IKEv1Error {
    fn rejected(notify: NotifyType, context: &'static str) -> IKEv1Error {
        Self::Rejected { notify, context }
    }

    fn teardown(&self) -> Teardown {
        match *self {
            Self::Rejected { notify, .. } => Teardown::Notify(notify),
            Self::Format(ref err) => Teardown::Notify(err.notify()),
            Self::PeerNotify(_) => Teardown::DeleteOnly,
            _ => Teardown::Skip,
        }
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(*self, Self::AuthenticationFailed(_))
    }
}

impl fmt::Display for IKEv1Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::Rejected { notify, context } => write!(f, "{}: {}", context, notify),
            Self::PeerNotify(notify) => write!(f, "Gateway sent notice {}", notify),
            Self::AuthenticationFailed(msg) => write!(f, "Authentication failed: {}", msg),
            Self::Format(ref e) => write!(f, "Format error: {}", e),
            Self::Crypto(ref e) => write!(f, "Crypto error: {}", e),
            Self::Transport(ref e) => write!(f, "Transport error: {}", e),
            Self::Io(ref e) => write!(f, "IO error: {}", e),
        }
    }
}

impl fmt::Debug for IKEv1Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for IKEv1Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Format(ref err) => Some(err),
            Self::Crypto(ref err) => Some(err),
            Self::Transport(ref err) => Some(err),
            Self::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<&'static str> for IKEv1Error {
    fn from(msg: &'static str) -> IKEv1Error {
        Self::Internal(msg)
    }
}

impl From<FormatError> for IKEv1Error {
    fn from(err: FormatError) -> IKEv1Error {
        Self::Format(err)
    }
}

impl From<CryptoError> for IKEv1Error {
    fn from(err: CryptoError) -> IKEv1Error {
        Self::Crypto(err)
    }
}

impl From<InitError> for IKEv1Error {
    fn from(err: InitError) -> IKEv1Error {
        Self::Crypto(err.into())
    }
}

impl From<TransportError> for IKEv1Error {
    fn from(err: TransportError) -> IKEv1Error {
        Self::Transport(err)
    }
}

impl From<io::Error> for IKEv1Error {
    fn from(err: io::Error) -> IKEv1Error {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::{
        message::{
            Attribute, ConfigAttribute, ConfigurationAttributes, ConfigurationType, ExchangeType,
            Flags, IpsecAttribute, Notify, Packet, Payload, ProtocolId, SecurityAssociation,
            DOI_IPSEC, SITUATION_IDENTITY_ONLY,
        },
        phase1::testing::{Responded, Responder},
        xauth::tests::ScriptedPrompt,
        *,
    };

    const GATEWAY_SPI: u32 = 0x0badcafe;
    const ASSIGNED_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);

    /// Gateway speaking just enough IKEv1 to complete a pre-shared key
    /// connection without XAUTH.
    struct MockGateway {
        socket: UdpSocket,
        addr: SocketAddrV4,
    }

    impl MockGateway {
        async fn bind() -> MockGateway {
            let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            let addr = match socket.local_addr().unwrap() {
                SocketAddr::V4(addr) => addr,
                SocketAddr::V6(_) => panic!("Gateway is not IPv4"),
            };
            MockGateway { socket, addr }
        }

        fn config(&self) -> Config {
            let mut config = Config::new(&self.addr.to_string(), "vpngroup", "grouppassword");
            config.local_address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
            config
        }

        async fn receive(&self) -> Vec<u8> {
            let mut buf = [0u8; 4096];
            let (len, _) = self.socket.recv_from(&mut buf).await.unwrap();
            buf[..len].to_vec()
        }

        async fn phase1(&self) -> (Session, Responded) {
            let responder = Responder {
                psk: b"grouppassword",
                local_nat_hash: None,
                auth: 1,
            };
            let responded = responder.respond(&self.socket).await;
            let (session, final_message) = responded.session(&self.receive().await);
            assert_eq!(final_message.exchange_type, ExchangeType::AGGRESSIVE);
            (session, responded)
        }

        // Returns the message ID and the requested attribute types.
        async fn mode_config_request(&self, session: &mut Session) -> (u32, Vec<u16>) {
            let verified = session.open(&self.receive().await, None).unwrap();
            assert!(verified.hash_ok);
            assert_eq!(verified.packet.exchange_type, ExchangeType::TRANSACTION);
            match verified.packet.payloads[1] {
                Payload::Attributes(ref request) => (
                    verified.packet.message_id,
                    request
                        .attributes
                        .iter()
                        .map(|attribute| attribute.attribute_type)
                        .collect(),
                ),
                ref payload => panic!("Unexpected payload {}", payload),
            }
        }

        async fn mode_config_reply(
            &self,
            session: &mut Session,
            client_addr: SocketAddr,
            message_id: u32,
            attributes: Vec<Attribute>,
        ) {
            let reply = session
                .seal(
                    ExchangeType::TRANSACTION,
                    message_id,
                    vec![Payload::Attributes(ConfigurationAttributes {
                        cfg_type: ConfigurationType::REPLY,
                        identifier: 20,
                        attributes,
                    })],
                    None,
                    None,
                )
                .unwrap();
            self.socket.send_to(&reply, client_addr).await.unwrap();
        }

        async fn redirect(&self, session: &mut Session, client_addr: SocketAddr) {
            let notice = session
                .seal(
                    ExchangeType::INFORMATIONAL,
                    0x5151,
                    vec![Payload::Notify(Notify {
                        doi: DOI_IPSEC,
                        protocol_id: ProtocolId::ISAKMP,
                        spi: session.cookies().unwrap(),
                        notify_type: NotifyType::CiscoLoadBalance,
                        data: self.addr.ip().octets().to_vec(),
                    })],
                    None,
                    None,
                )
                .unwrap();
            self.socket.send_to(&notice, client_addr).await.unwrap();
        }

        // Accepts the first ESP proposal, returning its encapsulation mode.
        async fn quick_mode(&self, session: &mut Session, client_addr: SocketAddr) -> u16 {
            let verified = session.open(&self.receive().await, None).unwrap();
            assert!(verified.hash_ok);
            let packet = verified.packet;
            assert_eq!(packet.exchange_type, ExchangeType::QUICK);
            let (mut accepted, i_nonce) = match &packet.payloads[1..3] {
                [Payload::SecurityAssociation(sa), Payload::Nonce(nonce)] => {
                    (sa.proposals[0].clone(), nonce.clone())
                }
                _ => panic!("Unexpected Quick Mode layout"),
            };
            let encapsulation = accepted.transforms[0]
                .attributes
                .iter()
                .find(|attribute| attribute.attribute_type == IpsecAttribute::ENCAPSULATION_MODE)
                .and_then(|attribute| attribute.as_basic())
                .unwrap();
            accepted.spi = GATEWAY_SPI.to_be_bytes().to_vec();
            let response = session
                .seal(
                    ExchangeType::QUICK,
                    packet.message_id,
                    vec![
                        Payload::SecurityAssociation(SecurityAssociation {
                            doi: DOI_IPSEC,
                            situation: SITUATION_IDENTITY_ONLY,
                            proposals: vec![accepted],
                        }),
                        Payload::Nonce(vec![0x77; 20]),
                    ],
                    Some(&i_nonce),
                    None,
                )
                .unwrap();
            self.socket.send_to(&response, client_addr).await.unwrap();

            let ack = session.open(&self.receive().await, None).unwrap();
            assert_eq!(ack.packet.message_id, packet.message_id);
            encapsulation
        }

        async fn nothing_received(&self) -> bool {
            let mut buf = [0u8; 4096];
            time::timeout(Duration::from_millis(200), self.socket.recv_from(&mut buf))
                .await
                .is_err()
        }
    }

    fn prompt() -> ScriptedPrompt {
        ScriptedPrompt {
            answers: vec![],
            prompts: vec![],
        }
    }

    fn address_attribute() -> Attribute {
        Attribute::variable(
            ConfigAttribute::INTERNAL_IP4_ADDRESS,
            &ASSIGNED_ADDRESS.octets(),
        )
    }

    #[tokio::test]
    async fn connect_with_cisco_udp_encapsulation() {
        let gateway = MockGateway::bind().await;
        let mut config = gateway.config();
        config.udp_encap = true;
        config.udp_encap_port = 0;
        let gateway_task = tokio::spawn(async move {
            let (mut session, responded) = gateway.phase1().await;
            let client_addr = responded.client_addr;
            let (message_id, requested) = gateway.mode_config_request(&mut session).await;
            assert!(requested.contains(&ConfigAttribute::CISCO_UDP_ENCAP_PORT));
            gateway
                .mode_config_reply(
                    &mut session,
                    client_addr,
                    message_id,
                    vec![
                        address_attribute(),
                        Attribute::basic(ConfigAttribute::CISCO_UDP_ENCAP_PORT, 10000),
                    ],
                )
                .await;
            let encapsulation = gateway.quick_mode(&mut session, client_addr).await;
            (gateway, session, encapsulation)
        });

        let mut handoff = Client::new(config, prompt()).connect().await.unwrap();
        let (gateway, mut session, encapsulation) = gateway_task.await.unwrap();
        // ESP is negotiated in plain tunnel mode; only the data plane is
        // encapsulated.
        assert_eq!(encapsulation, EncapsulationMode::Tunnel.ipsec_id());
        assert_eq!(handoff.encapsulation, EncapsulationMode::UdpTunnel);
        assert_eq!(
            handoff.esp_peer,
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10000)
        );
        assert!(handoff.esp_socket.is_some());
        assert_eq!(handoff.gateway(), gateway.addr);
        assert_eq!(handoff.outbound.spi, GATEWAY_SPI);
        assert_eq!(handoff.mode_config.address, ASSIGNED_ADDRESS);

        handoff.send_kill_packet().await.unwrap();
        let kill = session.open(&gateway.receive().await, None).unwrap();
        assert!(kill.hash_ok);
        assert_eq!(kill.packet.exchange_type, ExchangeType::INFORMATIONAL);
    }

    #[tokio::test]
    async fn redirect_restarts_with_fresh_session() {
        let gateway = MockGateway::bind().await;
        let config = gateway.config();
        let gateway_task = tokio::spawn(async move {
            let (mut session, first) = gateway.phase1().await;
            gateway.mode_config_request(&mut session).await;
            gateway.redirect(&mut session, first.client_addr).await;

            let (mut session, second) = gateway.phase1().await;
            assert_ne!(second.i_cookie, first.i_cookie);
            let client_addr = second.client_addr;
            let (message_id, requested) = gateway.mode_config_request(&mut session).await;
            assert!(!requested.contains(&ConfigAttribute::CISCO_UDP_ENCAP_PORT));
            gateway
                .mode_config_reply(&mut session, client_addr, message_id, vec![address_attribute()])
                .await;
            gateway.quick_mode(&mut session, client_addr).await
        });

        let handoff = Client::new(config, prompt()).connect().await.unwrap();
        let encapsulation = gateway_task.await.unwrap();
        assert_eq!(encapsulation, EncapsulationMode::Tunnel.ipsec_id());
        assert_eq!(handoff.encapsulation, EncapsulationMode::Tunnel);
        assert!(handoff.esp_socket.is_none());
        assert_eq!(handoff.esp_peer, handoff.gateway());
        assert_eq!(handoff.mode_config.address, ASSIGNED_ADDRESS);
    }

    #[tokio::test]
    async fn redirects_are_bounded() {
        let gateway = MockGateway::bind().await;
        let mut config = gateway.config();
        config.max_redirects = 1;
        let gateway_task = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut session, responded) = gateway.phase1().await;
                gateway.mode_config_request(&mut session).await;
                gateway.redirect(&mut session, responded.client_addr).await;
            }
            gateway.nothing_received().await
        });

        let result = Client::new(config, prompt()).connect().await;
        assert!(matches!(result, Err(IKEv1Error::Internal(_))));
        assert!(gateway_task.await.unwrap());
    }

    #[tokio::test]
    async fn rejected_reply_sends_teardown() {
        let gateway = MockGateway::bind().await;
        let config = gateway.config();
        let gateway_task = tokio::spawn(async move {
            let (mut session, responded) = gateway.phase1().await;
            let (message_id, _) = gateway.mode_config_request(&mut session).await;
            gateway
                .mode_config_reply(
                    &mut session,
                    responded.client_addr,
                    message_id,
                    vec![Attribute::variable(
                        ConfigAttribute::INTERNAL_IP4_DNS,
                        &[10, 0, 0, 53],
                    )],
                )
                .await;

            let notify = session.open(&gateway.receive().await, None).unwrap();
            assert!(notify.hash_ok);
            match notify.packet.payloads[1] {
                Payload::Notify(ref notify) => {
                    assert_eq!(notify.notify_type, NotifyType::AttributesNotSupported);
                    assert_eq!(notify.spi, session.cookies().unwrap());
                }
                ref payload => panic!("Unexpected payload {}", payload),
            }
            let delete = session.open(&gateway.receive().await, None).unwrap();
            assert!(delete.hash_ok);
            match delete.packet.payloads[1] {
                Payload::Delete(ref delete) => {
                    assert_eq!(delete.protocol_id, ProtocolId::ISAKMP);
                    assert_eq!(delete.spis, vec![session.cookies().unwrap()]);
                }
                ref payload => panic!("Unexpected payload {}", payload),
            }
        });

        let result = Client::new(config, prompt()).connect().await;
        assert!(matches!(
            result,
            Err(IKEv1Error::Rejected {
                notify: NotifyType::AttributesNotSupported,
                ..
            })
        ));
        gateway_task.await.unwrap();
    }

    #[tokio::test]
    async fn failure_before_keys_sends_nothing() {
        let gateway = MockGateway::bind().await;
        let config = gateway.config();
        let gateway_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (len, client_addr) = gateway.socket.recv_from(&mut buf).await.unwrap();
            let request = Packet::parse(&buf[..len]).unwrap();
            let response = Packet::new(
                request.i_cookie,
                [0x5a; 8],
                ExchangeType::AGGRESSIVE,
                Flags::NONE,
                1,
                vec![Payload::Nonce(vec![0x66; 20])],
            );
            gateway
                .socket
                .send_to(&response.flatten(0), client_addr)
                .await
                .unwrap();
            gateway.nothing_received().await
        });

        let result = Client::new(config, prompt()).connect().await;
        assert!(matches!(
            result,
            Err(IKEv1Error::Rejected {
                notify: NotifyType::InvalidMessageId,
                ..
            })
        ));
        assert!(gateway_task.await.unwrap());
    }

    #[test]
    fn parse_pfs_policy() {
        assert!(matches!("server".parse::<PfsPolicy>(), Ok(PfsPolicy::Server)));
        match "DH5".parse::<PfsPolicy>() {
            Ok(PfsPolicy::Group(group)) => assert_eq!(group.id, Some(Group::Modp1536)),
            _ => panic!("dh5 was not parsed"),
        }
        match "nopfs".parse::<PfsPolicy>() {
            Ok(PfsPolicy::Group(group)) => assert_eq!(group.id, None),
            _ => panic!("nopfs was not parsed"),
        }
        assert!("dh14".parse::<PfsPolicy>().is_err());
    }

    #[test]
    fn phase1_group_must_exist() {
        let mut config = Config::new("192.0.2.1", "group", "secret");
        assert_eq!(config.ike_dh_group.id, Some(Group::Modp1024));
        config.set_ike_dh_group("dh1").unwrap();
        assert_eq!(config.ike_dh_group.ike_id, 1);
        assert!(config.set_ike_dh_group("nopfs").is_err());
        assert!(config.set_ike_dh_group("dh3").is_err());
        assert_eq!(config.ike_dh_group.ike_id, 1);
    }

    #[test]
    fn teardown_depends_on_error() {
        let err = IKEv1Error::rejected(NotifyType::InvalidPayloadType, "test");
        assert!(matches!(
            err.teardown(),
            Teardown::Notify(NotifyType::InvalidPayloadType)
        ));
        let err: IKEv1Error =
            FormatError::new(NotifyType::UnequalPayloadLengths, "truncated").into();
        assert!(matches!(
            err.teardown(),
            Teardown::Notify(NotifyType::UnequalPayloadLengths)
        ));
        let err = IKEv1Error::PeerNotify(NotifyType::NoProposalChosen);
        assert!(matches!(err.teardown(), Teardown::DeleteOnly));
        let err = IKEv1Error::AuthenticationFailed("wrong password");
        assert!(matches!(err.teardown(), Teardown::Skip));
        assert!(err.is_authentication_failure());
        let err: IKEv1Error = TransportError::NoResponse.into();
        assert!(matches!(err.teardown(), Teardown::Skip));
    }

    #[tokio::test]
    async fn resolve_literal_addresses() {
        assert_eq!(
            resolve_gateway("192.0.2.7").await.unwrap(),
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 7), IKE_PORT)
        );
        assert_eq!(
            resolve_gateway("192.0.2.7:1500").await.unwrap(),
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 7), 1500)
        );
    }
}
