use std::{error, fmt};

use log::debug;

pub const ISAKMP_VERSION: u8 = 0x10;
pub const HEADER_LENGTH: usize = 28;
const GENERIC_HEADER_LENGTH: usize = 4;
const ATTRIBUTE_FORMAT_BASIC: u16 = 1 << 15;

pub const DOI_IPSEC: u32 = 1;
pub const SITUATION_IDENTITY_ONLY: u32 = 1;

pub const TRANSFORM_KEY_IKE: u8 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const AGGRESSIVE: ExchangeType = ExchangeType(4);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(5);
    pub const TRANSACTION: ExchangeType = ExchangeType(6);
    pub const QUICK: ExchangeType = ExchangeType(32);

    pub fn from_u8(value: u8) -> ExchangeType {
        ExchangeType(value)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::AGGRESSIVE => write!(f, "Aggressive"),
            Self::INFORMATIONAL => write!(f, "Informational"),
            Self::TRANSACTION => write!(f, "Transaction"),
            Self::QUICK => write!(f, "Quick"),
            _ => write!(f, "Unknown exchange type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const ENCRYPTION: Flags = Flags(1 << 0);
    pub const COMMIT: Flags = Flags(1 << 1);
    pub const AUTHENTICATION_ONLY: Flags = Flags(1 << 2);

    pub fn from_u8(value: u8) -> Flags {
        Flags(value)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has(Flags::ENCRYPTION) {
            f.write_str("E")?;
        }
        if self.has(Flags::COMMIT) {
            f.write_str("C")?;
        }
        if self.has(Flags::AUTHENTICATION_ONLY) {
            f.write_str("A")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(1);
    pub const PROPOSAL: PayloadType = PayloadType(2);
    pub const TRANSFORM: PayloadType = PayloadType(3);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(4);
    pub const IDENTIFICATION: PayloadType = PayloadType(5);
    pub const HASH: PayloadType = PayloadType(8);
    pub const NONCE: PayloadType = PayloadType(10);
    pub const NOTIFY: PayloadType = PayloadType(11);
    pub const DELETE: PayloadType = PayloadType(12);
    pub const VENDOR_ID: PayloadType = PayloadType(13);
    pub const ATTRIBUTES: PayloadType = PayloadType(14);
    pub const NAT_DISCOVERY: PayloadType = PayloadType(20);
    pub const NAT_DISCOVERY_DRAFT: PayloadType = PayloadType(130);
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "None"),
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association"),
            Self::PROPOSAL => write!(f, "Proposal"),
            Self::TRANSFORM => write!(f, "Transform"),
            Self::KEY_EXCHANGE => write!(f, "Key Exchange"),
            Self::IDENTIFICATION => write!(f, "Identification"),
            Self::HASH => write!(f, "Hash"),
            Self::NONCE => write!(f, "Nonce"),
            Self::NOTIFY => write!(f, "Notify"),
            Self::DELETE => write!(f, "Delete"),
            Self::VENDOR_ID => write!(f, "Vendor ID"),
            Self::ATTRIBUTES => write!(f, "Attributes"),
            Self::NAT_DISCOVERY => write!(f, "NAT Discovery"),
            Self::NAT_DISCOVERY_DRAFT => write!(f, "NAT Discovery (draft)"),
            _ => write!(f, "Unknown payload type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProtocolId(u8);

impl ProtocolId {
    pub const ISAKMP: ProtocolId = ProtocolId(1);
    pub const IPSEC_AH: ProtocolId = ProtocolId(2);
    pub const IPSEC_ESP: ProtocolId = ProtocolId(3);

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ISAKMP => write!(f, "ISAKMP"),
            Self::IPSEC_AH => write!(f, "AH"),
            Self::IPSEC_ESP => write!(f, "ESP"),
            _ => write!(f, "Unknown protocol {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IdentificationType(u8);

impl IdentificationType {
    pub const IPV4_ADDR: IdentificationType = IdentificationType(1);
    pub const FQDN: IdentificationType = IdentificationType(2);
    pub const USER_FQDN: IdentificationType = IdentificationType(3);
    pub const IPV4_ADDR_SUBNET: IdentificationType = IdentificationType(4);
    pub const KEY_ID: IdentificationType = IdentificationType(11);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConfigurationType(u8);

impl ConfigurationType {
    pub const REQUEST: ConfigurationType = ConfigurationType(1);
    pub const REPLY: ConfigurationType = ConfigurationType(2);
    pub const SET: ConfigurationType = ConfigurationType(3);
    pub const ACK: ConfigurationType = ConfigurationType(4);
}

impl fmt::Display for ConfigurationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::REQUEST => write!(f, "CFG_REQUEST"),
            Self::REPLY => write!(f, "CFG_REPLY"),
            Self::SET => write!(f, "CFG_SET"),
            Self::ACK => write!(f, "CFG_ACK"),
            _ => write!(f, "Unknown configuration type {}", self.0),
        }
    }
}

// Phase 1 (IKE) transform attributes, RFC 2409 Appendix A.
pub struct IkeAttribute;

impl IkeAttribute {
    pub const ENCRYPTION_ALGORITHM: u16 = 1;
    pub const HASH_ALGORITHM: u16 = 2;
    pub const AUTHENTICATION_METHOD: u16 = 3;
    pub const GROUP_DESCRIPTION: u16 = 4;
    pub const LIFE_TYPE: u16 = 11;
    pub const LIFE_DURATION: u16 = 12;
    pub const KEY_LENGTH: u16 = 14;
}

// Phase 2 (IPsec DOI) transform attributes, RFC 2407 Section 4.5.
pub struct IpsecAttribute;

impl IpsecAttribute {
    pub const LIFE_TYPE: u16 = 1;
    pub const LIFE_DURATION: u16 = 2;
    pub const GROUP_DESCRIPTION: u16 = 3;
    pub const ENCAPSULATION_MODE: u16 = 4;
    pub const AUTHENTICATION_ALGORITHM: u16 = 5;
    pub const KEY_LENGTH: u16 = 6;
}

pub const LIFE_TYPE_SECONDS: u16 = 1;
pub const LIFE_DURATION_SECONDS: u32 = 2147483;

// Mode-Config and XAUTH attributes, including the Cisco Unity private range.
pub struct ConfigAttribute;

impl ConfigAttribute {
    pub const INTERNAL_IP4_ADDRESS: u16 = 1;
    pub const INTERNAL_IP4_NETMASK: u16 = 2;
    pub const INTERNAL_IP4_DNS: u16 = 3;
    pub const INTERNAL_IP4_NBNS: u16 = 4;
    pub const APPLICATION_VERSION: u16 = 7;
    pub const XAUTH_TYPE: u16 = 16520;
    pub const XAUTH_USER_NAME: u16 = 16521;
    pub const XAUTH_USER_PASSWORD: u16 = 16522;
    pub const XAUTH_PASSCODE: u16 = 16523;
    pub const XAUTH_MESSAGE: u16 = 16524;
    pub const XAUTH_CHALLENGE: u16 = 16525;
    pub const XAUTH_DOMAIN: u16 = 16526;
    pub const XAUTH_STATUS: u16 = 16527;
    pub const XAUTH_NEXT_PIN: u16 = 16528;
    pub const XAUTH_ANSWER: u16 = 16529;
    pub const CISCO_BANNER: u16 = 28672;
    pub const CISCO_DEF_DOMAIN: u16 = 28674;
    pub const CISCO_UDP_ENCAP_PORT: u16 = 28677;
    pub const CISCO_DO_PFS: u16 = 28679;
    pub const CISCO_DDNS_HOSTNAME: u16 = 28682;
    pub const XAUTH_CISCOEXT_VENDOR: u16 = 32136;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NotifyType {
    InvalidPayloadType,
    DoiNotSupported,
    SituationNotSupported,
    InvalidCookie,
    InvalidMajorVersion,
    InvalidMinorVersion,
    InvalidExchangeType,
    InvalidFlags,
    InvalidMessageId,
    InvalidProtocolId,
    InvalidSpi,
    InvalidTransformId,
    AttributesNotSupported,
    NoProposalChosen,
    BadProposalSyntax,
    PayloadMalformed,
    InvalidKeyInformation,
    InvalidIdInformation,
    InvalidCertEncoding,
    InvalidCertificate,
    CertTypeUnsupported,
    InvalidCertAuthority,
    InvalidHashInformation,
    AuthenticationFailed,
    InvalidSignature,
    AddressNotification,
    NotifySaLifetime,
    CertificateUnavailable,
    UnsupportedExchangeType,
    UnequalPayloadLengths,
    Connected,
    ResponderLifetime,
    ReplayStatus,
    InitialContact,
    DpdAreYouThere,
    DpdAreYouThereAck,
    CiscoLoadBalance,
    Unknown(u16),
}

impl NotifyType {
    const TABLE: [(NotifyType, u16); 37] = [
        (NotifyType::InvalidPayloadType, 1),
        (NotifyType::DoiNotSupported, 2),
        (NotifyType::SituationNotSupported, 3),
        (NotifyType::InvalidCookie, 4),
        (NotifyType::InvalidMajorVersion, 5),
        (NotifyType::InvalidMinorVersion, 6),
        (NotifyType::InvalidExchangeType, 7),
        (NotifyType::InvalidFlags, 8),
        (NotifyType::InvalidMessageId, 9),
        (NotifyType::InvalidProtocolId, 10),
        (NotifyType::InvalidSpi, 11),
        (NotifyType::InvalidTransformId, 12),
        (NotifyType::AttributesNotSupported, 13),
        (NotifyType::NoProposalChosen, 14),
        (NotifyType::BadProposalSyntax, 15),
        (NotifyType::PayloadMalformed, 16),
        (NotifyType::InvalidKeyInformation, 17),
        (NotifyType::InvalidIdInformation, 18),
        (NotifyType::InvalidCertEncoding, 19),
        (NotifyType::InvalidCertificate, 20),
        (NotifyType::CertTypeUnsupported, 21),
        (NotifyType::InvalidCertAuthority, 22),
        (NotifyType::InvalidHashInformation, 23),
        (NotifyType::AuthenticationFailed, 24),
        (NotifyType::InvalidSignature, 25),
        (NotifyType::AddressNotification, 26),
        (NotifyType::NotifySaLifetime, 27),
        (NotifyType::CertificateUnavailable, 28),
        (NotifyType::UnsupportedExchangeType, 29),
        (NotifyType::UnequalPayloadLengths, 30),
        (NotifyType::Connected, 16384),
        (NotifyType::ResponderLifetime, 24576),
        (NotifyType::ReplayStatus, 24577),
        (NotifyType::InitialContact, 24578),
        (NotifyType::DpdAreYouThere, 36136),
        (NotifyType::DpdAreYouThereAck, 36137),
        (NotifyType::CiscoLoadBalance, 40501),
    ];

    pub fn from_u16(value: u16) -> NotifyType {
        Self::TABLE
            .iter()
            .find(|(_, code)| *code == value)
            .map(|(notify_type, _)| *notify_type)
            .unwrap_or(NotifyType::Unknown(value))
    }

    pub fn value(&self) -> u16 {
        match *self {
            NotifyType::Unknown(value) => value,
            notify_type => Self::TABLE
                .iter()
                .find(|(known, _)| *known == notify_type)
                .map(|(_, code)| *code)
                .unwrap_or(0),
        }
    }
}

impl fmt::Display for NotifyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyType::Unknown(value) => write!(f, "Unknown notify type {}", value),
            notify_type => write!(f, "{:?} ({})", notify_type, notify_type.value()),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AttributeValue {
    Basic(u16),
    Variable(Vec<u8>),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Attribute {
    pub attribute_type: u16,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn basic(attribute_type: u16, value: u16) -> Attribute {
        Attribute {
            attribute_type,
            value: AttributeValue::Basic(value),
        }
    }

    pub fn variable(attribute_type: u16, data: &[u8]) -> Attribute {
        Attribute {
            attribute_type,
            value: AttributeValue::Variable(data.to_vec()),
        }
    }

    pub fn empty(attribute_type: u16) -> Attribute {
        Attribute {
            attribute_type,
            value: AttributeValue::Variable(vec![]),
        }
    }

    pub fn as_basic(&self) -> Option<u16> {
        match self.value {
            AttributeValue::Basic(value) => Some(value),
            AttributeValue::Variable(_) => None,
        }
    }

    pub fn as_variable(&self) -> Option<&[u8]> {
        match self.value {
            AttributeValue::Basic(_) => None,
            AttributeValue::Variable(ref data) => Some(data.as_slice()),
        }
    }

    fn write(&self, dest: &mut Vec<u8>) {
        match self.value {
            AttributeValue::Basic(value) => {
                dest.extend_from_slice(&(self.attribute_type | ATTRIBUTE_FORMAT_BASIC).to_be_bytes());
                dest.extend_from_slice(&value.to_be_bytes());
            }
            AttributeValue::Variable(ref data) => {
                dest.extend_from_slice(&(self.attribute_type & !ATTRIBUTE_FORMAT_BASIC).to_be_bytes());
                dest.extend_from_slice(&(data.len() as u16).to_be_bytes());
                dest.extend_from_slice(data);
            }
        }
    }

    fn read_all(mut data: &[u8]) -> Result<Vec<Attribute>, FormatError> {
        let mut attributes = vec![];
        while !data.is_empty() {
            if data.len() < 4 {
                debug!("Not enough data in attribute header");
                return Err(FormatError::malformed("Not enough data in attribute header"));
            }
            let attribute_type = read_u16(&data[0..2]);
            let value = read_u16(&data[2..4]);
            if attribute_type & ATTRIBUTE_FORMAT_BASIC != 0 {
                attributes.push(Attribute::basic(
                    attribute_type & !ATTRIBUTE_FORMAT_BASIC,
                    value,
                ));
                data = &data[4..];
            } else {
                let end = 4 + value as usize;
                if data.len() < end {
                    debug!(
                        "Attribute {} length {} overflows payload",
                        attribute_type, value
                    );
                    return Err(FormatError::malformed("Attribute length overflows payload"));
                }
                attributes.push(Attribute::variable(attribute_type, &data[4..end]));
                data = &data[end..];
            }
        }
        Ok(attributes)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transform {
    pub number: u8,
    pub transform_id: u8,
    pub attributes: Vec<Attribute>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Proposal {
    pub number: u8,
    pub protocol_id: ProtocolId,
    pub spi: Vec<u8>,
    pub transforms: Vec<Transform>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SecurityAssociation {
    pub doi: u32,
    pub situation: u32,
    pub proposals: Vec<Proposal>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Identification {
    pub id_type: IdentificationType,
    pub protocol: u8,
    pub port: u16,
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Notify {
    pub doi: u32,
    pub protocol_id: ProtocolId,
    pub spi: Vec<u8>,
    pub notify_type: NotifyType,
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Delete {
    pub doi: u32,
    pub protocol_id: ProtocolId,
    pub spi_size: u8,
    pub spis: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ConfigurationAttributes {
    pub cfg_type: ConfigurationType,
    pub identifier: u16,
    pub attributes: Vec<Attribute>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Payload {
    SecurityAssociation(SecurityAssociation),
    KeyExchange(Vec<u8>),
    Identification(Identification),
    Hash(Vec<u8>),
    Nonce(Vec<u8>),
    Notify(Notify),
    Delete(Delete),
    VendorId(Vec<u8>),
    Attributes(ConfigurationAttributes),
    NatDiscovery(Vec<u8>),
    NatDiscoveryDraft(Vec<u8>),
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::SecurityAssociation(_) => PayloadType::SECURITY_ASSOCIATION,
            Payload::KeyExchange(_) => PayloadType::KEY_EXCHANGE,
            Payload::Identification(_) => PayloadType::IDENTIFICATION,
            Payload::Hash(_) => PayloadType::HASH,
            Payload::Nonce(_) => PayloadType::NONCE,
            Payload::Notify(_) => PayloadType::NOTIFY,
            Payload::Delete(_) => PayloadType::DELETE,
            Payload::VendorId(_) => PayloadType::VENDOR_ID,
            Payload::Attributes(_) => PayloadType::ATTRIBUTES,
            Payload::NatDiscovery(_) => PayloadType::NAT_DISCOVERY,
            Payload::NatDiscoveryDraft(_) => PayloadType::NAT_DISCOVERY_DRAFT,
        }
    }

    /// Payload body without the generic payload header, as used in the phase 1
    /// authentication hashes.
    pub fn body(&self) -> Vec<u8> {
        let mut dest = vec![];
        self.write_body(&mut dest);
        dest
    }

    fn write_body(&self, dest: &mut Vec<u8>) {
        match self {
            Payload::SecurityAssociation(sa) => {
                dest.extend_from_slice(&sa.doi.to_be_bytes());
                dest.extend_from_slice(&sa.situation.to_be_bytes());
                for (i, proposal) in sa.proposals.iter().enumerate() {
                    let next = if i + 1 < sa.proposals.len() {
                        PayloadType::PROPOSAL
                    } else {
                        PayloadType::NONE
                    };
                    let start = write_generic_header(dest, next);
                    dest.push(proposal.number);
                    dest.push(proposal.protocol_id.0);
                    dest.push(proposal.spi.len() as u8);
                    dest.push(proposal.transforms.len() as u8);
                    dest.extend_from_slice(&proposal.spi);
                    for (j, transform) in proposal.transforms.iter().enumerate() {
                        let next = if j + 1 < proposal.transforms.len() {
                            PayloadType::TRANSFORM
                        } else {
                            PayloadType::NONE
                        };
                        let start = write_generic_header(dest, next);
                        dest.push(transform.number);
                        dest.push(transform.transform_id);
                        dest.extend_from_slice(&[0, 0]);
                        transform
                            .attributes
                            .iter()
                            .for_each(|attribute| attribute.write(dest));
                        finish_generic_header(dest, start);
                    }
                    finish_generic_header(dest, start);
                }
            }
            Payload::Identification(id) => {
                dest.push(id.id_type.0);
                dest.push(id.protocol);
                dest.extend_from_slice(&id.port.to_be_bytes());
                dest.extend_from_slice(&id.data);
            }
            Payload::Notify(notify) => {
                dest.extend_from_slice(&notify.doi.to_be_bytes());
                dest.push(notify.protocol_id.0);
                dest.push(notify.spi.len() as u8);
                dest.extend_from_slice(&notify.notify_type.value().to_be_bytes());
                dest.extend_from_slice(&notify.spi);
                dest.extend_from_slice(&notify.data);
            }
            Payload::Delete(delete) => {
                dest.extend_from_slice(&delete.doi.to_be_bytes());
                dest.push(delete.protocol_id.0);
                dest.push(delete.spi_size);
                dest.extend_from_slice(&(delete.spis.len() as u16).to_be_bytes());
                delete
                    .spis
                    .iter()
                    .for_each(|spi| dest.extend_from_slice(spi));
            }
            Payload::Attributes(cfg) => {
                dest.push(cfg.cfg_type.0);
                dest.push(0);
                dest.extend_from_slice(&cfg.identifier.to_be_bytes());
                cfg.attributes
                    .iter()
                    .for_each(|attribute| attribute.write(dest));
            }
            Payload::KeyExchange(data)
            | Payload::Hash(data)
            | Payload::Nonce(data)
            | Payload::VendorId(data)
            | Payload::NatDiscovery(data)
            | Payload::NatDiscoveryDraft(data) => dest.extend_from_slice(data),
        }
    }

    fn read(payload_type: PayloadType, data: &[u8]) -> Result<Payload, FormatError> {
        match payload_type {
            PayloadType::SECURITY_ASSOCIATION => {
                Ok(Payload::SecurityAssociation(read_security_association(data)?))
            }
            PayloadType::KEY_EXCHANGE => Ok(Payload::KeyExchange(data.to_vec())),
            PayloadType::HASH => Ok(Payload::Hash(data.to_vec())),
            PayloadType::NONCE => Ok(Payload::Nonce(data.to_vec())),
            PayloadType::VENDOR_ID => Ok(Payload::VendorId(data.to_vec())),
            PayloadType::NAT_DISCOVERY => Ok(Payload::NatDiscovery(data.to_vec())),
            PayloadType::NAT_DISCOVERY_DRAFT => Ok(Payload::NatDiscoveryDraft(data.to_vec())),
            PayloadType::IDENTIFICATION => {
                if data.len() < 4 {
                    return Err(FormatError::malformed("Not enough data in ID payload"));
                }
                Ok(Payload::Identification(Identification {
                    id_type: IdentificationType(data[0]),
                    protocol: data[1],
                    port: read_u16(&data[2..4]),
                    data: data[4..].to_vec(),
                }))
            }
            PayloadType::NOTIFY => {
                if data.len() < 8 {
                    return Err(FormatError::malformed("Not enough data in notify payload"));
                }
                let spi_size = data[5] as usize;
                if data.len() < 8 + spi_size {
                    return Err(FormatError::malformed("Notify SPI overflows payload"));
                }
                Ok(Payload::Notify(Notify {
                    doi: read_u32(&data[0..4]),
                    protocol_id: ProtocolId(data[4]),
                    notify_type: NotifyType::from_u16(read_u16(&data[6..8])),
                    spi: data[8..8 + spi_size].to_vec(),
                    data: data[8 + spi_size..].to_vec(),
                }))
            }
            PayloadType::DELETE => {
                if data.len() < 8 {
                    return Err(FormatError::malformed("Not enough data in delete payload"));
                }
                let spi_size = data[5];
                let num_spis = read_u16(&data[6..8]) as usize;
                let spis_data = &data[8..];
                if spis_data.len() != spi_size as usize * num_spis {
                    return Err(FormatError::malformed("Delete SPI list length mismatch"));
                }
                let spis = if spi_size > 0 {
                    spis_data
                        .chunks(spi_size as usize)
                        .map(|spi| spi.to_vec())
                        .collect()
                } else {
                    vec![]
                };
                Ok(Payload::Delete(Delete {
                    doi: read_u32(&data[0..4]),
                    protocol_id: ProtocolId(data[4]),
                    spi_size,
                    spis,
                }))
            }
            PayloadType::ATTRIBUTES => {
                if data.len() < 4 {
                    return Err(FormatError::malformed(
                        "Not enough data in configuration payload",
                    ));
                }
                Ok(Payload::Attributes(ConfigurationAttributes {
                    cfg_type: ConfigurationType(data[0]),
                    identifier: read_u16(&data[2..4]),
                    attributes: Attribute::read_all(&data[4..])?,
                }))
            }
            _ => {
                debug!("Unsupported payload type {}", payload_type);
                Err(FormatError::new(
                    NotifyType::InvalidPayloadType,
                    "Unsupported payload type",
                ))
            }
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::SecurityAssociation(sa) => {
                write!(f, "SA (DOI {} situation {})", sa.doi, sa.situation)?;
                for proposal in sa.proposals.iter() {
                    write!(
                        f,
                        " [proposal {} {} transforms {}]",
                        proposal.number,
                        proposal.protocol_id,
                        proposal.transforms.len()
                    )?;
                }
                Ok(())
            }
            Payload::Notify(notify) => write!(f, "Notify {}", notify.notify_type),
            Payload::Delete(delete) => {
                write!(f, "Delete {} ({} SPIs)", delete.protocol_id, delete.spis.len())
            }
            Payload::Attributes(cfg) => write!(
                f,
                "{} id {} ({} attributes)",
                cfg.cfg_type,
                cfg.identifier,
                cfg.attributes.len()
            ),
            payload => write!(f, "{}", payload.payload_type()),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Packet {
    pub i_cookie: [u8; 8],
    pub r_cookie: [u8; 8],
    pub exchange_type: ExchangeType,
    pub flags: Flags,
    pub message_id: u32,
    pub payloads: Vec<Payload>,
}

// Parse and write using the layout from RFC 2408, Section 3.
impl Packet {
    pub fn new(
        i_cookie: [u8; 8],
        r_cookie: [u8; 8],
        exchange_type: ExchangeType,
        flags: Flags,
        message_id: u32,
        payloads: Vec<Payload>,
    ) -> Packet {
        Packet {
            i_cookie,
            r_cookie,
            exchange_type,
            flags,
            message_id,
            payloads,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Packet, FormatError> {
        if data.len() < HEADER_LENGTH {
            debug!("Not enough data in ISAKMP header");
            return Err(FormatError::new(
                NotifyType::UnequalPayloadLengths,
                "Not enough data in ISAKMP header",
            ));
        }
        let mut i_cookie = [0u8; 8];
        i_cookie.copy_from_slice(&data[0..8]);
        let mut r_cookie = [0u8; 8];
        r_cookie.copy_from_slice(&data[8..16]);
        let mut next_payload = PayloadType(data[16]);
        let version = data[17];
        if version >> 4 != ISAKMP_VERSION >> 4 {
            debug!("Unsupported ISAKMP version {:02x}", version);
            return Err(FormatError::new(
                NotifyType::InvalidMajorVersion,
                "Unsupported ISAKMP major version",
            ));
        }
        let exchange_type = ExchangeType(data[18]);
        let flags = Flags(data[19]);
        let message_id = read_u32(&data[20..24]);
        let length = read_u32(&data[24..28]) as usize;
        if length > data.len() || length < HEADER_LENGTH {
            debug!(
                "ISAKMP header length {} doesn't match datagram length {}",
                length,
                data.len()
            );
            return Err(FormatError::new(
                NotifyType::UnequalPayloadLengths,
                "ISAKMP header length doesn't match datagram",
            ));
        }

        let mut payloads = vec![];
        let mut remaining = &data[HEADER_LENGTH..length];
        while next_payload != PayloadType::NONE {
            if remaining.len() < GENERIC_HEADER_LENGTH {
                debug!("Not enough data in {} payload header", next_payload);
                return Err(FormatError::malformed("Not enough data in payload header"));
            }
            let payload_length = read_u16(&remaining[2..4]) as usize;
            if payload_length < GENERIC_HEADER_LENGTH || payload_length > remaining.len() {
                debug!(
                    "Payload {} length {} is out of bounds",
                    next_payload, payload_length
                );
                return Err(FormatError::malformed("Payload length is out of bounds"));
            }
            let payload = Payload::read(
                next_payload,
                &remaining[GENERIC_HEADER_LENGTH..payload_length],
            )?;
            payloads.push(payload);
            next_payload = PayloadType(remaining[0]);
            remaining = &remaining[payload_length..];
        }

        Ok(Packet {
            i_cookie,
            r_cookie,
            exchange_type,
            flags,
            message_id,
            payloads,
        })
    }

    /// Serializes the packet; when `block_length` is non-zero, the payload
    /// area is zero-padded to a multiple of the cipher block length.
    pub fn flatten(&self, block_length: usize) -> Vec<u8> {
        let mut dest = Vec::with_capacity(512);
        dest.extend_from_slice(&self.i_cookie);
        dest.extend_from_slice(&self.r_cookie);
        dest.push(
            self.payloads
                .first()
                .map(|payload| payload.payload_type().0)
                .unwrap_or(0),
        );
        dest.push(ISAKMP_VERSION);
        dest.push(self.exchange_type.0);
        dest.push(self.flags.0);
        dest.extend_from_slice(&self.message_id.to_be_bytes());
        dest.extend_from_slice(&[0u8; 4]);
        for (i, payload) in self.payloads.iter().enumerate() {
            let next = self
                .payloads
                .get(i + 1)
                .map(|payload| payload.payload_type())
                .unwrap_or(PayloadType::NONE);
            let start = write_generic_header(&mut dest, next);
            payload.write_body(&mut dest);
            finish_generic_header(&mut dest, start);
        }
        if block_length > 0 {
            let payload_length = dest.len() - HEADER_LENGTH;
            let padding = (block_length - payload_length % block_length) % block_length;
            dest.resize(dest.len() + padding, 0);
        }
        let length = dest.len() as u32;
        dest[24..28].copy_from_slice(&length.to_be_bytes());
        dest
    }

    pub fn first_payload(&self) -> Option<&Payload> {
        self.payloads.first()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} flags [{}] message ID {:08x}:",
            self.exchange_type, self.flags, self.message_id
        )?;
        for payload in self.payloads.iter() {
            write!(f, " {{{}}}", payload)?;
        }
        Ok(())
    }
}

/// Returns the payload chain that follows the first payload in a plaintext
/// packet, walking the generic headers until the last payload.
pub fn payloads_after_first(data: &[u8]) -> Result<&[u8], FormatError> {
    if data.len() < HEADER_LENGTH + GENERIC_HEADER_LENGTH {
        return Err(FormatError::malformed("Not enough data in first payload"));
    }
    let mut next_payload = data[HEADER_LENGTH];
    let first_length = read_u16(&data[HEADER_LENGTH + 2..HEADER_LENGTH + 4]) as usize;
    let start = HEADER_LENGTH + first_length;
    if first_length < GENERIC_HEADER_LENGTH || start > data.len() {
        return Err(FormatError::malformed("First payload length is out of bounds"));
    }
    let mut end = start;
    while next_payload != PayloadType::NONE.0 {
        if data.len() < end + GENERIC_HEADER_LENGTH {
            return Err(FormatError::malformed("Not enough data in payload header"));
        }
        let length = read_u16(&data[end + 2..end + 4]) as usize;
        if length < GENERIC_HEADER_LENGTH || end + length > data.len() {
            return Err(FormatError::malformed("Payload length is out of bounds"));
        }
        next_payload = data[end];
        end += length;
    }
    Ok(&data[start..end])
}

fn read_security_association(data: &[u8]) -> Result<SecurityAssociation, FormatError> {
    if data.len() < 8 {
        return Err(FormatError::malformed("Not enough data in SA payload"));
    }
    let doi = read_u32(&data[0..4]);
    let situation = read_u32(&data[4..8]);
    let mut proposals = vec![];
    let mut remaining = &data[8..];
    let mut next = PayloadType::PROPOSAL;
    while next != PayloadType::NONE {
        if next != PayloadType::PROPOSAL {
            return Err(FormatError::new(
                NotifyType::BadProposalSyntax,
                "Unexpected payload in SA proposal list",
            ));
        }
        let (next_type, body, rest) = read_substructure(remaining)?;
        if body.len() < 4 {
            return Err(FormatError::malformed("Not enough data in proposal"));
        }
        let spi_size = body[2] as usize;
        let num_transforms = body[3] as usize;
        if body.len() < 4 + spi_size {
            return Err(FormatError::malformed("Proposal SPI overflows payload"));
        }
        let transforms = read_transforms(&body[4 + spi_size..])?;
        if transforms.len() != num_transforms {
            debug!(
                "Proposal declares {} transforms, contains {}",
                num_transforms,
                transforms.len()
            );
            return Err(FormatError::new(
                NotifyType::BadProposalSyntax,
                "Proposal transform count mismatch",
            ));
        }
        proposals.push(Proposal {
            number: body[0],
            protocol_id: ProtocolId(body[1]),
            spi: body[4..4 + spi_size].to_vec(),
            transforms,
        });
        next = next_type;
        remaining = rest;
    }
    Ok(SecurityAssociation {
        doi,
        situation,
        proposals,
    })
}

fn read_transforms(mut data: &[u8]) -> Result<Vec<Transform>, FormatError> {
    let mut transforms = vec![];
    if data.is_empty() {
        return Ok(transforms);
    }
    let mut next = PayloadType::TRANSFORM;
    while next != PayloadType::NONE {
        if next != PayloadType::TRANSFORM {
            return Err(FormatError::new(
                NotifyType::BadProposalSyntax,
                "Unexpected payload in transform list",
            ));
        }
        let (next_type, body, rest) = read_substructure(data)?;
        if body.len() < 4 {
            return Err(FormatError::malformed("Not enough data in transform"));
        }
        transforms.push(Transform {
            number: body[0],
            transform_id: body[1],
            attributes: Attribute::read_all(&body[4..])?,
        });
        next = next_type;
        data = rest;
    }
    Ok(transforms)
}

fn read_substructure(data: &[u8]) -> Result<(PayloadType, &[u8], &[u8]), FormatError> {
    if data.len() < GENERIC_HEADER_LENGTH {
        return Err(FormatError::malformed("Not enough data in substructure header"));
    }
    let length = read_u16(&data[2..4]) as usize;
    if length < GENERIC_HEADER_LENGTH || length > data.len() {
        return Err(FormatError::malformed("Substructure length is out of bounds"));
    }
    Ok((
        PayloadType(data[0]),
        &data[GENERIC_HEADER_LENGTH..length],
        &data[length..],
    ))
}

fn write_generic_header(dest: &mut Vec<u8>, next: PayloadType) -> usize {
    let start = dest.len();
    dest.extend_from_slice(&[next.0, 0, 0, 0]);
    start
}

fn finish_generic_header(dest: &mut [u8], start: usize) {
    let length = (dest.len() - start) as u16;
    dest[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
}

fn read_u16(data: &[u8]) -> u16 {
    let mut result = [0u8; 2];
    result.copy_from_slice(&data[0..2]);
    u16::from_be_bytes(result)
}

fn read_u32(data: &[u8]) -> u32 {
    let mut result = [0u8; 4];
    result.copy_from_slice(&data[0..4]);
    u32::from_be_bytes(result)
}

pub struct FormatError {
    notify: NotifyType,
    msg: &'static str,
}

impl FormatError {
    pub fn new(notify: NotifyType, msg: &'static str) -> FormatError {
        FormatError { notify, msg }
    }

    fn malformed(msg: &'static str) -> FormatError {
        FormatError {
            notify: NotifyType::PayloadMalformed,
            msg,
        }
    }

    pub fn notify(&self) -> NotifyType {
        self.notify
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.msg, self.notify)
    }
}

impl fmt::Debug for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for FormatError {}
