use std::net::Ipv4Addr;

use log::{debug, info};
use rand::Rng;

use super::{
    algorithms::{self, Algorithm, CIPHERS, DEFAULT_DH_GROUP, HASHES},
    crypto::{CipherAlgorithm, HashAlgorithm},
    dh::{DiffieHellman, Group},
    message::{
        Attribute, Delete, ExchangeType, IdentificationType, Identification, IpsecAttribute,
        NotifyType, Packet, Payload, Proposal, ProtocolId, SecurityAssociation, Transform,
        DOI_IPSEC, LIFE_DURATION_SECONDS, LIFE_TYPE_SECONDS, SITUATION_IDENTITY_ONLY,
    },
    notice::{self, Notice, NoticePolicy},
    session::{self, Session},
    transport::{EncapsulationMode, Transport},
    Config, Flow, IKEv1Error, PfsPolicy,
};

const NONCE_LENGTH: usize = 20;
const MAX_ATTEMPTS: usize = 4;
const ESP_SPI_SIZE: usize = 4;
// SPIs below 256 are reserved.
const MIN_SPI: u32 = 256;

/// One direction of the negotiated ESP SA.
pub struct EspSa {
    pub spi: u32,
    pub keymat: Vec<u8>,
}

pub struct QuickMode {
    /// Traffic sent to the gateway.
    pub outbound: EspSa,
    /// Traffic sent to us.
    pub inbound: EspSa,
    pub cipher: &'static Algorithm<CipherAlgorithm>,
    pub hash: &'static Algorithm<HashAlgorithm>,
    /// Encrypted informational message deleting both SAs, sent on shutdown.
    /// Its HASH(1) covers only the message ID and payloads as RFC 2409
    /// section 5.7 requires, without the Quick Mode nonces.
    pub kill_packet: Vec<u8>,
}

fn reject(notify: NotifyType) -> IKEv1Error {
    IKEv1Error::rejected(notify, "Quick Mode response was invalid, check PFS setting")
}

/// Selects the PFS group for Quick Mode, if any.
fn pfs_group(config: &Config, session: &Session) -> Option<(&'static Algorithm<Option<Group>>, Group)> {
    let algorithm = match config.pfs {
        PfsPolicy::Group(algorithm) => algorithm,
        PfsPolicy::Server if session.server_pfs == Some(true) => DEFAULT_DH_GROUP,
        PfsPolicy::Server => return None,
    };
    algorithm.id.map(|group| (algorithm, group))
}

fn esp_proposals(
    spi: u32,
    encapsulation: EncapsulationMode,
    pfs_group: Option<u16>,
    enable_1des: bool,
) -> SecurityAssociation {
    let mut proposals = vec![];
    for cipher in algorithms::proposed_ciphers(enable_1des) {
        for hash in algorithms::proposed_hashes() {
            let mut attributes = vec![];
            if cipher.key_length != 0 {
                attributes.push(Attribute::basic(IpsecAttribute::KEY_LENGTH, cipher.key_length));
            }
            attributes.push(Attribute::basic(
                IpsecAttribute::ENCAPSULATION_MODE,
                encapsulation.ipsec_id(),
            ));
            attributes.push(Attribute::basic(
                IpsecAttribute::AUTHENTICATION_ALGORITHM,
                hash.ipsec_id,
            ));
            if let Some(group) = pfs_group {
                attributes.push(Attribute::basic(IpsecAttribute::GROUP_DESCRIPTION, group));
            }
            attributes.push(Attribute::basic(IpsecAttribute::LIFE_TYPE, LIFE_TYPE_SECONDS));
            attributes.push(Attribute::variable(
                IpsecAttribute::LIFE_DURATION,
                &LIFE_DURATION_SECONDS.to_be_bytes(),
            ));
            proposals.push(Proposal {
                number: proposals.len() as u8,
                protocol_id: ProtocolId::IPSEC_ESP,
                spi: spi.to_be_bytes().to_vec(),
                transforms: vec![Transform {
                    number: 0,
                    transform_id: cipher.ipsec_id as u8,
                    attributes,
                }],
            });
        }
    }
    SecurityAssociation {
        doi: DOI_IPSEC,
        situation: SITUATION_IDENTITY_ONLY,
        proposals,
    }
}

fn identities(address: Ipv4Addr) -> [Payload; 2] {
    [
        Payload::Identification(Identification {
            id_type: IdentificationType::IPV4_ADDR,
            protocol: 0,
            port: 0,
            data: address.octets().to_vec(),
        }),
        Payload::Identification(Identification {
            id_type: IdentificationType::IPV4_ADDR_SUBNET,
            protocol: 0,
            port: 0,
            data: vec![0u8; 8],
        }),
    ]
}

/// Negotiates the ESP SA pair and derives its keys.
pub async fn establish(
    config: &Config,
    session: &mut Session,
    transport: &mut Transport,
    encapsulation: EncapsulationMode,
    policy: NoticePolicy,
) -> Result<Flow<QuickMode>, IKEv1Error> {
    let address = session
        .internal_address
        .ok_or("Quick Mode requires an assigned address")?;
    let pfs = pfs_group(config, session);
    let dh = pfs.map(|(_, group)| DiffieHellman::new(group));
    let pfs_id = pfs.map(|(algorithm, _)| algorithm.ipsec_id);
    if let Some((algorithm, _)) = pfs {
        debug!("Using PFS group {}", algorithm);
    }

    let (inbound_spi, i_nonce) = {
        let mut rng = rand::thread_rng();
        let mut i_nonce = [0u8; NONCE_LENGTH];
        rng.fill(&mut i_nonce);
        (rng.gen_range(MIN_SPI..=u32::MAX), i_nonce)
    };
    let mut payloads = vec![
        Payload::SecurityAssociation(esp_proposals(
            inbound_spi,
            encapsulation,
            pfs_id,
            config.enable_1des,
        )),
        Payload::Nonce(i_nonce.to_vec()),
    ];
    if let Some(ref dh) = dh {
        payloads.push(Payload::KeyExchange(dh.public_key().to_vec()));
    }
    payloads.extend(identities(address));

    let message_id = session::random_message_id();
    let request = session.seal(ExchangeType::QUICK, message_id, payloads, None, None)?;
    let iv_state = session.iv_state()?;
    let policy = NoticePolicy {
        report_responder_lifetime: true,
        ..policy
    };
    let mut attempts = 0;
    let packet = loop {
        if attempts == MAX_ATTEMPTS {
            return Err(IKEv1Error::rejected(
                NotifyType::InvalidMessageId,
                "Quick Mode got no response after responder lifetime notices",
            ));
        }
        attempts += 1;
        let response = transport.send_receive(&request).await?;
        match notice::filter(session, transport, response, Some(&i_nonce), policy).await? {
            Notice::Response(packet) => break packet,
            Notice::Redirect => return Ok(Flow::Redirect),
            Notice::ResponderLifetime => {
                debug!("Gateway sent responder lifetime, resending Quick Mode request");
                session.restore_iv_state(iv_state.clone())?;
            }
        }
    };

    let response = validate_response(&packet, message_id, encapsulation, pfs_id)?;
    let dh_shared = match dh {
        Some(dh) => match response.key_exchange {
            Some(key_exchange) if key_exchange.len() == dh.public_key().len() => {
                Some(dh.shared_secret(key_exchange)?)
            }
            _ => return Err(reject(NotifyType::InvalidKeyInformation)),
        },
        None => None,
    };
    let r_nonce = response.nonce;
    let selected = response.selected;

    let ack = session.seal(
        ExchangeType::QUICK,
        message_id,
        vec![],
        Some(&i_nonce),
        Some(r_nonce),
    )?;
    transport.send(&ack).await?;

    let cookies = session.cookies()?;
    let kill_packet = session.seal(
        ExchangeType::INFORMATIONAL,
        session::random_message_id(),
        vec![
            Payload::Delete(Delete {
                doi: DOI_IPSEC,
                protocol_id: ProtocolId::IPSEC_ESP,
                spi_size: ESP_SPI_SIZE as u8,
                spis: vec![
                    inbound_spi.to_be_bytes().to_vec(),
                    selected.outbound_spi.to_be_bytes().to_vec(),
                ],
            }),
            Payload::Delete(Delete {
                doi: DOI_IPSEC,
                protocol_id: ProtocolId::ISAKMP,
                spi_size: cookies.len() as u8,
                spis: vec![cookies],
            }),
        ],
        None,
        None,
    )?;

    let keymat_length = selected.hash.id.digest_length() + selected.cipher.id.key_length();
    let inbound = EspSa {
        spi: inbound_spi,
        keymat: session.generate_keymat(
            keymat_length,
            inbound_spi,
            dh_shared.as_deref(),
            &i_nonce,
            r_nonce,
        )?,
    };
    let outbound = EspSa {
        spi: selected.outbound_spi,
        keymat: session.generate_keymat(
            keymat_length,
            selected.outbound_spi,
            dh_shared.as_deref(),
            &i_nonce,
            r_nonce,
        )?,
    };
    info!("IPsec SA selected {}-{}", selected.cipher, selected.hash);
    Ok(Flow::Done(QuickMode {
        outbound,
        inbound,
        cipher: selected.cipher,
        hash: selected.hash,
        kill_packet,
    }))
}

struct Selected {
    cipher: &'static Algorithm<CipherAlgorithm>,
    hash: &'static Algorithm<HashAlgorithm>,
    outbound_spi: u32,
}

struct QuickResponse<'a> {
    selected: Selected,
    nonce: &'a [u8],
    key_exchange: Option<&'a [u8]>,
}

fn validate_response(
    packet: &Packet,
    message_id: u32,
    encapsulation: EncapsulationMode,
    pfs_group: Option<u16>,
) -> Result<QuickResponse, IKEv1Error> {
    if packet.message_id != message_id {
        return Err(reject(NotifyType::InvalidMessageId));
    }
    if packet.exchange_type != ExchangeType::QUICK {
        return Err(reject(NotifyType::InvalidExchangeType));
    }
    if !matches!(packet.payloads.get(1), Some(Payload::SecurityAssociation(_))) {
        return Err(reject(NotifyType::InvalidPayloadType));
    }
    let mut selected = None;
    let mut nonce = None;
    let mut key_exchange = None;
    for payload in packet.payloads.iter().skip(1) {
        match payload {
            Payload::SecurityAssociation(sa) => {
                selected = Some(select_esp_transform(sa, encapsulation, pfs_group)?)
            }
            Payload::Notify(_) | Payload::Identification(_) => {}
            Payload::KeyExchange(data) => key_exchange = Some(&data[..]),
            Payload::Nonce(data) => nonce = Some(&data[..]),
            _ => return Err(reject(NotifyType::InvalidPayloadType)),
        }
    }
    let selected = selected.ok_or_else(|| reject(NotifyType::InvalidPayloadType))?;
    let nonce = nonce.ok_or_else(|| reject(NotifyType::InvalidHashInformation))?;
    if pfs_group.is_some() && key_exchange.is_none() {
        return Err(reject(NotifyType::InvalidKeyInformation));
    }
    Ok(QuickResponse {
        selected,
        nonce,
        key_exchange,
    })
}

fn basic_value(attribute: &Attribute) -> Result<u16, IKEv1Error> {
    attribute
        .as_basic()
        .ok_or_else(|| reject(NotifyType::BadProposalSyntax))
}

fn select_esp_transform(
    sa: &SecurityAssociation,
    encapsulation: EncapsulationMode,
    pfs_group: Option<u16>,
) -> Result<Selected, IKEv1Error> {
    if sa.doi != DOI_IPSEC {
        return Err(reject(NotifyType::DoiNotSupported));
    }
    if sa.situation != SITUATION_IDENTITY_ONLY {
        return Err(reject(NotifyType::SituationNotSupported));
    }
    let proposal = match sa.proposals[..] {
        [ref proposal] => proposal,
        _ => return Err(reject(NotifyType::BadProposalSyntax)),
    };
    if proposal.protocol_id != ProtocolId::IPSEC_ESP {
        return Err(reject(NotifyType::InvalidProtocolId));
    }
    let outbound_spi = match proposal.spi[..] {
        [a, b, c, d] => u32::from_be_bytes([a, b, c, d]),
        _ => return Err(reject(NotifyType::InvalidSpi)),
    };
    let transform = match proposal.transforms[..] {
        [ref transform] => transform,
        _ => return Err(reject(NotifyType::BadProposalSyntax)),
    };

    let mut auth = None;
    let mut seen_encapsulation = false;
    let mut seen_group = false;
    let mut key_length = 0;
    for attribute in transform.attributes.iter() {
        match attribute.attribute_type {
            IpsecAttribute::AUTHENTICATION_ALGORITHM => auth = Some(basic_value(attribute)?),
            IpsecAttribute::ENCAPSULATION_MODE => {
                if basic_value(attribute)? != encapsulation.ipsec_id() {
                    return Err(reject(NotifyType::BadProposalSyntax));
                }
                seen_encapsulation = true;
            }
            IpsecAttribute::GROUP_DESCRIPTION => match pfs_group {
                Some(group) if attribute.as_basic() == Some(group) => seen_group = true,
                _ => return Err(reject(NotifyType::BadProposalSyntax)),
            },
            IpsecAttribute::KEY_LENGTH => key_length = basic_value(attribute)?,
            IpsecAttribute::LIFE_TYPE | IpsecAttribute::LIFE_DURATION => {}
            attribute_type => {
                debug!("Unsupported IPsec attribute {}", attribute_type);
                return Err(reject(NotifyType::AttributesNotSupported));
            }
        }
    }
    let auth = match auth {
        Some(auth) if seen_encapsulation && (pfs_group.is_none() || seen_group) => auth,
        _ => return Err(reject(NotifyType::BadProposalSyntax)),
    };
    let hash = HASHES
        .by_ipsec_id(auth, 0)
        .ok_or_else(|| reject(NotifyType::BadProposalSyntax))?;
    let cipher = CIPHERS
        .by_ipsec_id(transform.transform_id as u16, key_length)
        .ok_or_else(|| reject(NotifyType::BadProposalSyntax))?;
    Ok(Selected {
        cipher,
        hash,
        outbound_spi,
    })
}
