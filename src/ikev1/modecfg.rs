use std::net::Ipv4Addr;

use log::{debug, info};

use super::{
    message::{
        Attribute, ConfigAttribute, ConfigurationAttributes, ConfigurationType, ExchangeType,
        NotifyType, Payload,
    },
    notice::{self, Notice, NoticePolicy},
    session::{self, Session},
    transport::Transport,
    Config, Flow, IKEv1Error,
};

const REQUEST_IDENTIFIER: u16 = 20;

/// Settings assigned by the gateway, passed on to the tunnel configuration
/// script.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ModeConfig {
    pub address: Ipv4Addr,
    pub netmask: Option<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub nbns: Vec<Ipv4Addr>,
    pub domain: Option<String>,
    pub banner: Option<String>,
}

pub async fn request(
    config: &Config,
    session: &mut Session,
    transport: &mut Transport,
    policy: NoticePolicy,
) -> Result<Flow<ModeConfig>, IKEv1Error> {
    let message_id = session::random_message_id();
    let request = ConfigurationAttributes {
        cfg_type: ConfigurationType::REQUEST,
        identifier: REQUEST_IDENTIFIER,
        attributes: request_attributes(config),
    };
    let request = session.seal(
        ExchangeType::TRANSACTION,
        message_id,
        vec![Payload::Attributes(request)],
        None,
        None,
    )?;
    let response = transport.send_receive(&request).await?;
    let packet = match notice::filter(session, transport, response, None, policy).await? {
        Notice::Response(packet) => packet,
        Notice::Redirect => return Ok(Flow::Redirect),
        Notice::ResponderLifetime => {
            return Err("Unexpected responder lifetime notice during Mode-Config".into())
        }
    };

    if packet.message_id != message_id {
        return Err(IKEv1Error::rejected(
            NotifyType::InvalidMessageId,
            "Mode-Config response has a different message ID",
        ));
    }
    if packet.exchange_type != ExchangeType::TRANSACTION {
        return Err(IKEv1Error::rejected(
            NotifyType::InvalidExchangeType,
            "Mode-Config response is not a transaction",
        ));
    }
    let reply = match packet.payloads[..] {
        [Payload::Hash(_), Payload::Attributes(ref reply)]
            if reply.cfg_type == ConfigurationType::REPLY =>
        {
            reply
        }
        _ => {
            return Err(IKEv1Error::rejected(
                NotifyType::PayloadMalformed,
                "Mode-Config response must be a single reply",
            ))
        }
    };
    let mode_config = apply_reply(session, &reply.attributes)?;
    Ok(Flow::Done(mode_config))
}

fn request_attributes(config: &Config) -> Vec<Attribute> {
    let mut attributes = vec![
        Attribute::empty(ConfigAttribute::INTERNAL_IP4_ADDRESS),
        Attribute::empty(ConfigAttribute::INTERNAL_IP4_NETMASK),
        Attribute::empty(ConfigAttribute::INTERNAL_IP4_DNS),
        Attribute::empty(ConfigAttribute::INTERNAL_IP4_NBNS),
        Attribute::empty(ConfigAttribute::CISCO_DEF_DOMAIN),
    ];
    if config.udp_encap {
        attributes.push(Attribute::empty(ConfigAttribute::CISCO_UDP_ENCAP_PORT));
    }
    attributes.extend([
        Attribute::empty(ConfigAttribute::CISCO_DO_PFS),
        Attribute::empty(ConfigAttribute::CISCO_BANNER),
        Attribute::variable(
            ConfigAttribute::CISCO_DDNS_HOSTNAME,
            config.hostname.as_bytes(),
        ),
        Attribute::variable(
            ConfigAttribute::APPLICATION_VERSION,
            config.version_string.as_bytes(),
        ),
    ]);
    attributes
}

fn unsupported(context: &'static str) -> IKEv1Error {
    IKEv1Error::rejected(NotifyType::AttributesNotSupported, context)
}

fn ipv4_value(attribute: &Attribute) -> Result<Ipv4Addr, IKEv1Error> {
    match attribute.as_variable() {
        Some(&[a, b, c, d]) => Ok(Ipv4Addr::new(a, b, c, d)),
        _ => Err(unsupported("Mode-Config address is not 4 bytes")),
    }
}

fn text_value(attribute: &Attribute) -> Result<String, IKEv1Error> {
    attribute
        .as_variable()
        .map(|data| String::from_utf8_lossy(data).into_owned())
        .ok_or(unsupported("Mode-Config text attribute is not variable"))
}

/// Validates the gateway's reply, storing the address, PFS and UDP
/// encapsulation settings in the session.
fn apply_reply(session: &mut Session, attributes: &[Attribute]) -> Result<ModeConfig, IKEv1Error> {
    let mut address = None;
    let mut netmask = None;
    let mut dns = vec![];
    let mut nbns = vec![];
    let mut domain = None;
    let mut banner = None;
    let mut server_pfs = None;
    let mut peer_udp_encap_port = None;
    for attribute in attributes.iter() {
        match attribute.attribute_type {
            ConfigAttribute::INTERNAL_IP4_ADDRESS => address = Some(ipv4_value(attribute)?),
            ConfigAttribute::INTERNAL_IP4_NETMASK => {
                if attribute.as_variable().is_some_and(|data| data.is_empty()) {
                    debug!("Ignoring zero length netmask");
                    continue;
                }
                netmask = Some(ipv4_value(attribute)?);
            }
            ConfigAttribute::INTERNAL_IP4_DNS => dns.push(ipv4_value(attribute)?),
            ConfigAttribute::INTERNAL_IP4_NBNS => nbns.push(ipv4_value(attribute)?),
            ConfigAttribute::CISCO_DEF_DOMAIN => domain = Some(text_value(attribute)?),
            ConfigAttribute::CISCO_BANNER => {
                let text = text_value(attribute)?;
                info!("Banner: {}", text);
                banner = Some(text);
            }
            ConfigAttribute::APPLICATION_VERSION => {
                debug!(
                    "Gateway application version: {}",
                    String::from_utf8_lossy(attribute.as_variable().unwrap_or(&[]))
                );
            }
            ConfigAttribute::CISCO_DO_PFS => {
                let value = attribute
                    .as_basic()
                    .ok_or(unsupported("DO_PFS is not a basic attribute"))?;
                debug!("Gateway PFS setting {}", value);
                server_pfs = Some(value != 0);
            }
            ConfigAttribute::CISCO_UDP_ENCAP_PORT => {
                let port = attribute
                    .as_basic()
                    .ok_or(unsupported("UDP_ENCAP_PORT is not a basic attribute"))?;
                debug!("Gateway UDP encapsulation port {}", port);
                peer_udp_encap_port = Some(port);
            }
            attribute_type => {
                debug!("Ignoring unknown Mode-Config attribute {}", attribute_type);
            }
        }
    }
    let address = address.ok_or(unsupported("Mode-Config reply has no address"))?;
    session.internal_address = Some(address);
    if server_pfs.is_some() {
        session.server_pfs = server_pfs;
    }
    if peer_udp_encap_port.is_some() {
        session.peer_udp_encap_port = peer_udp_encap_port;
    }
    Ok(ModeConfig {
        address,
        netmask,
        dns,
        nbns,
        domain,
        banner,
    })
}
