use std::{fmt, net::SocketAddrV4};

use log::{debug, info, trace};
use rand::Rng;

use crate::logger::fmt_slice_hex;

use super::{
    algorithms::{
        self, Algorithm, AuthMethod, AUTH_METHODS, CIPHERS, HASHES,
    },
    crypto::{self, CipherAlgorithm, HashAlgorithm, Phase1Inputs},
    dh::DiffieHellman,
    message::{
        Attribute, ExchangeType, Flags, IdentificationType, Identification, IkeAttribute,
        Notify, NotifyType, Packet, Payload, Proposal, ProtocolId, SecurityAssociation,
        Transform, DOI_IPSEC, LIFE_DURATION_SECONDS, LIFE_TYPE_SECONDS, SITUATION_IDENTITY_ONLY,
        TRANSFORM_KEY_IKE,
    },
    session::{IkeSa, Session, COOKIE_LENGTH},
    transport::{EncapsulationMode, Transport},
    Config, IKEv1Error,
};

pub const XAUTH_VENDOR_ID: [u8; 8] = [0x09, 0x00, 0x26, 0x89, 0xdf, 0xd6, 0xb7, 0x12];
pub const UNITY_VENDOR_ID: [u8; 16] = [
    0x12, 0xf5, 0xf2, 0x8c, 0x45, 0x71, 0x68, 0xa9, 0x70, 0x2d, 0x9f, 0xe2, 0x74, 0xcc, 0x01, 0x00,
];
pub const DPD_VENDOR_ID: [u8; 16] = [
    0xaf, 0xca, 0xd7, 0x13, 0x68, 0xa1, 0xf1, 0xc9, 0x6b, 0x86, 0x96, 0xfc, 0x77, 0x57, 0x01, 0x00,
];
// MD5("RFC 3947")
pub const NAT_T_VENDOR_ID: [u8; 16] = [
    0x4a, 0x13, 0x1c, 0x81, 0x07, 0x03, 0x58, 0x45, 0x5c, 0x57, 0x28, 0xf2, 0x0e, 0x95, 0x45, 0x2f,
];
// MD5("draft-ietf-ipsec-nat-t-ike-02\n")
pub const NAT_T_DRAFT_VENDOR_ID: [u8; 16] = [
    0x90, 0xcb, 0x80, 0x91, 0x3e, 0xbb, 0x69, 0x6e, 0x08, 0x63, 0x81, 0xb5, 0xec, 0x42, 0x7b, 0x1f,
];

const NONCE_LENGTH: usize = 20;
const IPPROTO_UDP: u8 = 17;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Init,
    AwaitingResponse,
    KeysDerived,
    Authenticated,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Init => write!(f, "Init"),
            State::AwaitingResponse => write!(f, "AwaitingResponse"),
            State::KeysDerived => write!(f, "KeysDerived"),
            State::Authenticated => write!(f, "Authenticated"),
            State::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome of phase 1.
pub struct Established {
    /// XAUTH was negotiated and the gateway's first XAUTH request is pending.
    pub xauth_request: Option<Vec<u8>>,
}

/// Runs Aggressive Mode with a pre-shared key, leaving the IKE SA in the
/// session.
pub async fn aggressive_mode(
    config: &Config,
    session: &mut Session,
    transport: &mut Transport,
) -> Result<Established, IKEv1Error> {
    let mut exchange = AggressiveMode::new(config)?;
    match exchange.negotiate(session, transport).await {
        Ok(established) => Ok(established),
        Err(err) => {
            exchange.enter(State::Failed);
            Err(err)
        }
    }
}

struct AggressiveMode<'a> {
    config: &'a Config,
    state: State,
    dh: DiffieHellman,
    i_nonce: [u8; NONCE_LENGTH],
}

impl AggressiveMode<'_> {
    fn new(config: &Config) -> Result<AggressiveMode, IKEv1Error> {
        let group = config
            .ike_dh_group
            .id
            .ok_or(IKEv1Error::Configuration("IKE DH group must not be nopfs"))?;
        let mut i_nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill(&mut i_nonce);
        Ok(AggressiveMode {
            config,
            state: State::Init,
            dh: DiffieHellman::new(group),
            i_nonce,
        })
    }

    fn enter(&mut self, state: State) {
        debug!("Aggressive Mode {} -> {}", self.state, state);
        self.state = state;
    }

    fn initial_payloads(&self, local_port: u16) -> Vec<Payload> {
        let mut payloads = vec![
            Payload::SecurityAssociation(ike_proposal(
                self.config.ike_dh_group,
                self.config.enable_1des,
            )),
            Payload::KeyExchange(self.dh.public_key().to_vec()),
            Payload::Nonce(self.i_nonce.to_vec()),
            Payload::Identification(Identification {
                id_type: IdentificationType::KEY_ID,
                protocol: IPPROTO_UDP,
                port: local_port,
                data: self.config.identity.as_bytes().to_vec(),
            }),
            Payload::VendorId(XAUTH_VENDOR_ID.to_vec()),
            Payload::VendorId(UNITY_VENDOR_ID.to_vec()),
        ];
        if !self.config.disable_natt {
            payloads.push(Payload::VendorId(NAT_T_VENDOR_ID.to_vec()));
            payloads.push(Payload::VendorId(NAT_T_DRAFT_VENDOR_ID.to_vec()));
        }
        payloads
    }

    async fn negotiate(
        &mut self,
        session: &mut Session,
        transport: &mut Transport,
    ) -> Result<Established, IKEv1Error> {
        let i_cookie = session.i_cookie();
        let payloads = self.initial_payloads(transport.local_port());
        // Bodies without generic headers, as used in HASH_I and HASH_R.
        let sa_i = payloads[0].body();
        let id_i = payloads[3].body();
        let request = Packet::new(
            i_cookie,
            [0u8; COOKIE_LENGTH],
            ExchangeType::AGGRESSIVE,
            Flags::NONE,
            0,
            payloads,
        );
        debug!("Sending {}", request);
        let request = request.flatten(0);

        self.enter(State::AwaitingResponse);
        let response = transport.send_receive(&request).await?;
        let response = Packet::parse(&response)?;
        debug!("Received {}", response);
        let response = validate_response(
            &response,
            &Expectations {
                i_cookie,
                ike_group: self.config.ike_dh_group.ike_id,
                key_exchange_length: self.dh.public_key().len(),
                disable_natt: self.config.disable_natt,
            },
        )?;
        session.set_r_cookie(response.r_cookie)?;
        let r_cookie = response.r_cookie;
        let negotiated = &response.negotiated;
        let hash = negotiated.hash.id;

        let dh_shared = self.dh.shared_secret(&response.key_exchange)?;
        let keys = crypto::derive_phase1_keys(
            hash,
            negotiated.cipher.id,
            &Phase1Inputs {
                shared_key: self.config.secret.as_bytes(),
                i_nonce: &self.i_nonce,
                r_nonce: &response.nonce,
                dh_shared: &dh_shared,
                i_cookie: &i_cookie,
                r_cookie: &r_cookie,
                i_public_key: self.dh.public_key(),
                r_public_key: &response.key_exchange,
            },
        )?;
        trace!("SKEYID {}", fmt_slice_hex(&keys.skeyid));
        self.enter(State::KeysDerived);

        let prf = hash.prf(&keys.skeyid)?;
        let expected_hash = prf.compute(&[
            &response.key_exchange,
            self.dh.public_key(),
            &r_cookie,
            &i_cookie,
            &sa_i,
            &response.identification,
        ]);
        if expected_hash != response.hash {
            debug!(
                "Expected HASH_R {}, received {}",
                fmt_slice_hex(&expected_hash),
                fmt_slice_hex(&response.hash)
            );
            return Err(IKEv1Error::AuthenticationFailed(
                "hash comparison failed, check group password!",
            ));
        }
        self.enter(State::Authenticated);
        info!(
            "IKE SA selected {}-{}-{}",
            negotiated.auth, negotiated.cipher, negotiated.hash
        );

        let hash_i = prf.compute(&[
            self.dh.public_key(),
            &response.key_exchange,
            &i_cookie,
            &r_cookie,
            &sa_i,
            &id_i,
        ]);
        session.establish(IkeSa::new(
            negotiated.cipher,
            negotiated.hash,
            negotiated.auth,
            &keys,
        )?)?;

        let cookies = session.cookies()?;
        let mut payloads = vec![
            Payload::Hash(hash_i),
            Payload::Notify(Notify {
                doi: DOI_IPSEC,
                protocol_id: ProtocolId::ISAKMP,
                spi: cookies,
                notify_type: NotifyType::InitialContact,
                data: vec![],
            }),
            Payload::VendorId(DPD_VENDOR_ID.to_vec()),
            Payload::VendorId(UNITY_VENDOR_ID.to_vec()),
        ];
        match response.nat_discovery {
            Some(ref nat_discovery) => {
                let peer = transport.peer();
                let local =
                    SocketAddrV4::new(transport.source_address().await?, transport.local_port());
                let natd_peer = nat_discovery_hash(hash, &i_cookie, &r_cookie, peer);
                let natd_local = nat_discovery_hash(hash, &i_cookie, &r_cookie, local);
                payloads.push(nat_discovery.payload(natd_peer.clone()));
                payloads.push(nat_discovery.payload(natd_local.clone()));
                let local_nat = !nat_discovery.matches_local(&natd_local);
                let peer_nat = !nat_discovery.matches_peer(&natd_peer);
                if local_nat || peer_nat {
                    info!(
                        "NAT detected: local end behind NAT: {}, gateway behind NAT: {}",
                        local_nat, peer_nat
                    );
                    transport
                        .enable_nat_traversal(nat_discovery.encapsulation)
                        .await?;
                } else {
                    info!("NAT-T supported, no NAT device detected");
                }
            }
            None if response.nat_traversal_vid => {
                info!("NAT-T supported, gateway sent no NAT discovery payloads")
            }
            None => info!("Gateway doesn't support NAT-T"),
        }

        let final_message = Packet::new(
            i_cookie,
            r_cookie,
            ExchangeType::AGGRESSIVE,
            Flags::ENCRYPTION,
            0,
            payloads,
        );
        debug!("Sending {}", final_message);
        let final_message = session.seal_phase1(&final_message)?;
        let xauth_request = if negotiated.auth.id == AuthMethod::PreSharedKeyXauth {
            Some(transport.send_receive(&final_message).await?)
        } else {
            transport.send(&final_message).await?;
            None
        };
        Ok(Established { xauth_request })
    }
}

/// Proposes every auth × cipher × hash combination for one DH group,
/// strongest first.
pub fn ike_proposal(
    group: &'static Algorithm<Option<super::dh::Group>>,
    enable_1des: bool,
) -> SecurityAssociation {
    let mut transforms = vec![];
    for auth in algorithms::proposed_auth_methods() {
        for cipher in algorithms::proposed_ciphers(enable_1des) {
            for hash in algorithms::proposed_hashes() {
                let mut attributes = vec![];
                if cipher.key_length != 0 {
                    attributes.push(Attribute::basic(IkeAttribute::KEY_LENGTH, cipher.key_length));
                }
                attributes.extend([
                    Attribute::basic(IkeAttribute::ENCRYPTION_ALGORITHM, cipher.ike_id),
                    Attribute::basic(IkeAttribute::HASH_ALGORITHM, hash.ike_id),
                    Attribute::basic(IkeAttribute::AUTHENTICATION_METHOD, auth.ike_id),
                    Attribute::basic(IkeAttribute::GROUP_DESCRIPTION, group.ike_id),
                    Attribute::basic(IkeAttribute::LIFE_TYPE, LIFE_TYPE_SECONDS),
                    Attribute::variable(
                        IkeAttribute::LIFE_DURATION,
                        &LIFE_DURATION_SECONDS.to_be_bytes(),
                    ),
                ]);
                transforms.push(Transform {
                    number: transforms.len() as u8,
                    transform_id: TRANSFORM_KEY_IKE,
                    attributes,
                });
            }
        }
    }
    SecurityAssociation {
        doi: DOI_IPSEC,
        situation: SITUATION_IDENTITY_ONLY,
        proposals: vec![Proposal {
            number: 1,
            protocol_id: ProtocolId::ISAKMP,
            spi: vec![],
            transforms,
        }],
    }
}

pub fn nat_discovery_hash(
    hash: HashAlgorithm,
    i_cookie: &[u8],
    r_cookie: &[u8],
    addr: SocketAddrV4,
) -> Vec<u8> {
    hash.hash(&[
        i_cookie,
        r_cookie,
        &addr.ip().octets(),
        &addr.port().to_be_bytes(),
    ])
}

struct Negotiated {
    cipher: &'static Algorithm<CipherAlgorithm>,
    hash: &'static Algorithm<HashAlgorithm>,
    auth: &'static Algorithm<AuthMethod>,
}

struct NatDiscovery {
    encapsulation: EncapsulationMode,
    // The first NAT-D payload is how the gateway sees us; the rest list the
    // gateway's own addresses.
    local: Vec<u8>,
    peer: Vec<Vec<u8>>,
}

impl NatDiscovery {
    fn payload(&self, hash: Vec<u8>) -> Payload {
        match self.encapsulation {
            EncapsulationMode::UdpTunnelDraft => Payload::NatDiscoveryDraft(hash),
            _ => Payload::NatDiscovery(hash),
        }
    }

    fn matches_local(&self, hash: &[u8]) -> bool {
        self.local == hash
    }

    fn matches_peer(&self, hash: &[u8]) -> bool {
        self.peer.iter().any(|peer| peer == hash)
    }
}

struct Expectations {
    i_cookie: [u8; COOKIE_LENGTH],
    ike_group: u16,
    key_exchange_length: usize,
    disable_natt: bool,
}

struct AggressiveResponse {
    r_cookie: [u8; COOKIE_LENGTH],
    negotiated: Negotiated,
    key_exchange: Vec<u8>,
    nonce: Vec<u8>,
    identification: Vec<u8>,
    hash: Vec<u8>,
    nat_traversal_vid: bool,
    nat_discovery: Option<NatDiscovery>,
}

fn reject(notify: NotifyType) -> IKEv1Error {
    IKEv1Error::rejected(notify, "Aggressive Mode response was invalid")
}

fn validate_response(
    packet: &Packet,
    expect: &Expectations,
) -> Result<AggressiveResponse, IKEv1Error> {
    if packet.i_cookie != expect.i_cookie {
        return Err(reject(NotifyType::InvalidCookie));
    }
    if packet.exchange_type != ExchangeType::AGGRESSIVE {
        return Err(reject(NotifyType::InvalidExchangeType));
    }
    if packet.flags != Flags::NONE {
        return Err(reject(NotifyType::InvalidFlags));
    }
    if packet.message_id != 0 {
        return Err(reject(NotifyType::InvalidMessageId));
    }

    let mut negotiated = None;
    let mut key_exchange = None;
    let mut nonce = None;
    let mut identification = None;
    let mut hash = None;
    let mut nat_traversal_vid = false;
    let mut nat_discovery: Option<NatDiscovery> = None;
    for payload in packet.payloads.iter() {
        match payload {
            Payload::SecurityAssociation(sa) => {
                negotiated = Some(select_ike_transform(sa, expect.ike_group)?)
            }
            Payload::Identification(_) => identification = Some(payload.body()),
            Payload::KeyExchange(data) => key_exchange = Some(data),
            Payload::Nonce(data) => nonce = Some(data),
            Payload::Hash(data) => hash = Some(data),
            Payload::VendorId(data) => {
                if data[..] == XAUTH_VENDOR_ID {
                    debug!("Gateway supports XAUTH");
                } else if data[..] == NAT_T_VENDOR_ID || data[..] == NAT_T_DRAFT_VENDOR_ID {
                    nat_traversal_vid = true;
                } else {
                    debug!("Ignoring vendor ID {}", fmt_slice_hex(data));
                }
            }
            Payload::NatDiscovery(data) | Payload::NatDiscoveryDraft(data) => {
                let digest_length = match negotiated {
                    Some(ref negotiated) if nat_traversal_vid => {
                        negotiated.hash.id.digest_length()
                    }
                    _ => return Err(reject(NotifyType::InvalidPayloadType)),
                };
                if expect.disable_natt {
                    continue;
                }
                if data.len() != digest_length {
                    return Err(reject(NotifyType::PayloadMalformed));
                }
                match nat_discovery {
                    Some(ref mut nat_discovery) => nat_discovery.peer.push(data.clone()),
                    None => {
                        let encapsulation = if let Payload::NatDiscovery(_) = payload {
                            EncapsulationMode::UdpTunnel
                        } else {
                            EncapsulationMode::UdpTunnelDraft
                        };
                        nat_discovery = Some(NatDiscovery {
                            encapsulation,
                            local: data.clone(),
                            peer: vec![],
                        });
                    }
                }
            }
            _ => return Err(reject(NotifyType::InvalidPayloadType)),
        }
    }

    let negotiated = negotiated.ok_or(reject(NotifyType::NoProposalChosen))?;
    let key_exchange = match key_exchange {
        Some(data) if data.len() == expect.key_exchange_length => data.clone(),
        _ => return Err(reject(NotifyType::InvalidKeyInformation)),
    };
    let nonce = nonce
        .ok_or(reject(NotifyType::InvalidHashInformation))?
        .clone();
    let identification = identification.ok_or(reject(NotifyType::InvalidIdInformation))?;
    let hash = match hash {
        Some(data) if data.len() == negotiated.hash.id.digest_length() => data.clone(),
        _ => return Err(reject(NotifyType::InvalidHashInformation)),
    };
    Ok(AggressiveResponse {
        r_cookie: packet.r_cookie,
        negotiated,
        key_exchange,
        nonce,
        identification,
        hash,
        nat_traversal_vid,
        nat_discovery,
    })
}

fn basic_value(attribute: &Attribute) -> Result<u16, IKEv1Error> {
    attribute
        .as_basic()
        .ok_or(reject(NotifyType::BadProposalSyntax))
}

fn select_ike_transform(sa: &SecurityAssociation, ike_group: u16) -> Result<Negotiated, IKEv1Error> {
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
    if proposal.protocol_id != ProtocolId::ISAKMP {
        return Err(reject(NotifyType::InvalidProtocolId));
    }
    if !proposal.spi.is_empty() {
        return Err(reject(NotifyType::InvalidSpi));
    }
    let transform = match proposal.transforms[..] {
        [ref transform] => transform,
        _ => return Err(reject(NotifyType::BadProposalSyntax)),
    };
    if transform.transform_id != TRANSFORM_KEY_IKE {
        return Err(reject(NotifyType::InvalidTransformId));
    }

    let mut cipher = None;
    let mut hash = None;
    let mut auth = None;
    let mut seen_group = false;
    let mut key_length = 0;
    for attribute in transform.attributes.iter() {
        match attribute.attribute_type {
            IkeAttribute::GROUP_DESCRIPTION => {
                if attribute.as_basic() == Some(ike_group) {
                    seen_group = true;
                } else {
                    return Err(reject(NotifyType::BadProposalSyntax));
                }
            }
            IkeAttribute::AUTHENTICATION_METHOD => auth = Some(basic_value(attribute)?),
            IkeAttribute::HASH_ALGORITHM => hash = Some(basic_value(attribute)?),
            IkeAttribute::ENCRYPTION_ALGORITHM => cipher = Some(basic_value(attribute)?),
            IkeAttribute::KEY_LENGTH => key_length = basic_value(attribute)?,
            IkeAttribute::LIFE_TYPE | IkeAttribute::LIFE_DURATION => {}
            attribute_type => {
                debug!("Unsupported IKE attribute {}", attribute_type);
                return Err(reject(NotifyType::AttributesNotSupported));
            }
        }
    }
    let (cipher, hash, auth) = match (cipher, hash, auth) {
        (Some(cipher), Some(hash), Some(auth)) if seen_group => (cipher, hash, auth),
        _ => return Err(reject(NotifyType::BadProposalSyntax)),
    };
    Ok(Negotiated {
        cipher: CIPHERS
            .by_ike_id(cipher, key_length)
            .ok_or(reject(NotifyType::NoProposalChosen))?,
        hash: HASHES
            .by_ike_id(hash, 0)
            .ok_or(reject(NotifyType::NoProposalChosen))?,
        auth: AUTH_METHODS
            .by_ike_id(auth, 0)
            .ok_or(reject(NotifyType::NoProposalChosen))?,
    })
}


#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::net::UdpSocket;

    use super::{testing::Responder, *};
    use crate::ikev1::{
        algorithms::DH_GROUPS,
        message::{AttributeValue, HEADER_LENGTH},
    };

    fn accepted_sa(transform: &Transform) -> SecurityAssociation {
        SecurityAssociation {
            doi: DOI_IPSEC,
            situation: SITUATION_IDENTITY_ONLY,
            proposals: vec![Proposal {
                number: 1,
                protocol_id: ProtocolId::ISAKMP,
                spi: vec![],
                transforms: vec![transform.clone()],
            }],
        }
    }

    fn proposed_transforms(enable_1des: bool) -> Vec<Transform> {
        let sa = ike_proposal(DH_GROUPS.by_name("dh2").unwrap(), enable_1des);
        sa.proposals[0].transforms.clone()
    }

    fn reject_code(result: Result<Negotiated, IKEv1Error>) -> NotifyType {
        match result {
            Err(IKEv1Error::Rejected { notify, .. }) => notify,
            Err(err) => panic!("Unexpected error {}", err),
            Ok(_) => panic!("Transform was accepted"),
        }
    }

    #[test]
    fn proposal_enumerates_combinations() {
        let transforms = proposed_transforms(false);
        assert_eq!(transforms.len(), 2 * 4 * 2);
        assert_eq!(proposed_transforms(true).len(), 2 * 5 * 2);
        for (i, transform) in transforms.iter().enumerate() {
            assert_eq!(transform.number as usize, i);
            assert_eq!(transform.transform_id, TRANSFORM_KEY_IKE);
        }
        let first = &transforms[0].attributes;
        assert_eq!(first[0], Attribute::basic(IkeAttribute::KEY_LENGTH, 256));
        assert_eq!(first[1], Attribute::basic(IkeAttribute::ENCRYPTION_ALGORITHM, 7));
        assert_eq!(first[2], Attribute::basic(IkeAttribute::HASH_ALGORITHM, 2));
        assert_eq!(first[3], Attribute::basic(IkeAttribute::AUTHENTICATION_METHOD, 65001));
        assert_eq!(first[4], Attribute::basic(IkeAttribute::GROUP_DESCRIPTION, 2));
        assert_eq!(
            first[6].value,
            AttributeValue::Variable(LIFE_DURATION_SECONDS.to_be_bytes().to_vec())
        );
        let last = &transforms[transforms.len() - 1].attributes;
        assert_eq!(last[0], Attribute::basic(IkeAttribute::ENCRYPTION_ALGORITHM, 5));
        assert_eq!(last[2], Attribute::basic(IkeAttribute::AUTHENTICATION_METHOD, 1));
    }

    #[test]
    fn select_each_proposed_transform() {
        for transform in proposed_transforms(true).iter() {
            let negotiated = select_ike_transform(&accepted_sa(transform), 2).unwrap();
            let key_length = transform
                .attributes
                .iter()
                .find(|attribute| attribute.attribute_type == IkeAttribute::KEY_LENGTH)
                .and_then(|attribute| attribute.as_basic())
                .unwrap_or(0);
            assert_eq!(negotiated.cipher.key_length, key_length);
        }
    }

    #[test]
    fn reject_invalid_transforms() {
        let transform = proposed_transforms(false)[0].clone();

        let mut sa = accepted_sa(&transform);
        sa.doi = 2;
        assert_eq!(reject_code(select_ike_transform(&sa, 2)), NotifyType::DoiNotSupported);

        let mut sa = accepted_sa(&transform);
        sa.proposals.push(sa.proposals[0].clone());
        assert_eq!(reject_code(select_ike_transform(&sa, 2)), NotifyType::BadProposalSyntax);

        let mut sa = accepted_sa(&transform);
        sa.proposals[0].spi = vec![1, 2, 3, 4];
        assert_eq!(reject_code(select_ike_transform(&sa, 2)), NotifyType::InvalidSpi);

        let mut sa = accepted_sa(&transform);
        sa.proposals[0].transforms[0].transform_id = 2;
        assert_eq!(reject_code(select_ike_transform(&sa, 2)), NotifyType::InvalidTransformId);

        // Group doesn't match the configured one.
        let sa = accepted_sa(&transform);
        assert_eq!(reject_code(select_ike_transform(&sa, 5)), NotifyType::BadProposalSyntax);

        let mut sa = accepted_sa(&transform);
        sa.proposals[0].transforms[0]
            .attributes
            .push(Attribute::basic(99, 1));
        assert_eq!(
            reject_code(select_ike_transform(&sa, 2)),
            NotifyType::AttributesNotSupported
        );

        let mut sa = accepted_sa(&transform);
        sa.proposals[0].transforms[0]
            .attributes
            .retain(|attribute| attribute.attribute_type != IkeAttribute::HASH_ALGORITHM);
        assert_eq!(reject_code(select_ike_transform(&sa, 2)), NotifyType::BadProposalSyntax);

        // AES without a key length is not a known cipher.
        let mut sa = accepted_sa(&transform);
        sa.proposals[0].transforms[0]
            .attributes
            .retain(|attribute| attribute.attribute_type != IkeAttribute::KEY_LENGTH);
        assert_eq!(reject_code(select_ike_transform(&sa, 2)), NotifyType::NoProposalChosen);
    }

    #[test]
    fn nat_discovery_requires_vendor_id() {
        let transform = proposed_transforms(false)[0].clone();
        let expect = Expectations {
            i_cookie: [1; 8],
            ike_group: 2,
            key_exchange_length: 128,
            disable_natt: false,
        };
        let mut packet = Packet::new(
            [1; 8],
            [2; 8],
            ExchangeType::AGGRESSIVE,
            Flags::NONE,
            0,
            vec![
                Payload::SecurityAssociation(accepted_sa(&transform)),
                Payload::NatDiscovery(vec![0; 20]),
            ],
        );
        assert!(matches!(
            validate_response(&packet, &expect),
            Err(IKEv1Error::Rejected {
                notify: NotifyType::InvalidPayloadType,
                ..
            })
        ));

        packet.payloads.insert(1, Payload::VendorId(NAT_T_VENDOR_ID.to_vec()));
        packet.payloads[2] = Payload::NatDiscovery(vec![0; 16]);
        assert!(matches!(
            validate_response(&packet, &expect),
            Err(IKEv1Error::Rejected {
                notify: NotifyType::PayloadMalformed,
                ..
            })
        ));

        packet.payloads[2] = Payload::NatDiscovery(vec![0; 20]);
        assert!(matches!(
            validate_response(&packet, &expect),
            Err(IKEv1Error::Rejected {
                notify: NotifyType::InvalidKeyInformation,
                ..
            })
        ));

        packet.flags = Flags::ENCRYPTION;
        assert!(matches!(
            validate_response(&packet, &expect),
            Err(IKEv1Error::Rejected {
                notify: NotifyType::InvalidFlags,
                ..
            })
        ));
    }

    async fn setup(
        psk: &'static [u8],
        local_nat_hash: Option<Vec<u8>>,
        auth: u16,
    ) -> (Config, Transport, UdpSocket, Responder) {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let gateway_addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("Gateway is not IPv4"),
        };
        let mut config = Config::new(&gateway_addr.to_string(), "vpngroup", "grouppassword");
        config.local_address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let transport = Transport::bind(config.local_address, gateway_addr)
            .await
            .unwrap();
        (
            config,
            transport,
            socket,
            Responder {
                psk,
                local_nat_hash,
                auth,
            },
        )
    }

    #[tokio::test]
    async fn aggressive_mode_with_xauth() {
        let (config, mut transport, socket, responder) =
            setup(b"grouppassword", None, 65001).await;
        let mut session = Session::new();

        let gateway_task = tokio::spawn(async move {
            let responded = responder.respond(&socket).await;
            let mut buf = [0u8; 4096];
            let (len, client_addr) = socket.recv_from(&mut buf).await.unwrap();
            let mut data = buf[..len].to_vec();
            responded
                .message_cipher()
                .decrypt(&mut data[HEADER_LENGTH..], 0, false)
                .unwrap();
            let final_message = Packet::parse(&data).unwrap();
            assert_eq!(final_message.flags, Flags::ENCRYPTION);
            assert_eq!(
                final_message.payloads[0],
                Payload::Hash(responded.expected_hash_i.clone())
            );
            match &final_message.payloads[1] {
                Payload::Notify(notify) => {
                    assert_eq!(notify.notify_type, NotifyType::InitialContact)
                }
                payload => panic!("Unexpected payload {}", payload),
            }
            assert_eq!(
                final_message.payloads[2],
                Payload::VendorId(DPD_VENDOR_ID.to_vec())
            );
            assert_eq!(final_message.payloads.len(), 6);
            socket
                .send_to(b"xauth request", client_addr)
                .await
                .unwrap();
        });

        let established = aggressive_mode(&config, &mut session, &mut transport)
            .await
            .unwrap();
        assert_eq!(established.xauth_request.as_deref(), Some(&b"xauth request"[..]));
        assert_eq!(session.r_cookie().unwrap(), [0x5a; 8]);
        let ike_sa = session.ike_sa().unwrap();
        assert_eq!(ike_sa.cipher().name, "aes256");
        assert_eq!(ike_sa.hash().name, "sha1");
        assert_eq!(ike_sa.auth().id, AuthMethod::PreSharedKeyXauth);
        assert_eq!(transport.encapsulation(), EncapsulationMode::Tunnel);
        gateway_task.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_group_password() {
        let (config, mut transport, socket, responder) =
            setup(b"otherpassword", None, 65001).await;
        let mut session = Session::new();
        let gateway_task = tokio::spawn(async move {
            responder.respond(&socket).await;
        });
        let result = aggressive_mode(&config, &mut session, &mut transport).await;
        assert!(matches!(result, Err(IKEv1Error::AuthenticationFailed(_))));
        assert!(!session.has_keys());
        gateway_task.await.unwrap();
    }

    #[tokio::test]
    async fn nat_detected() {
        let (config, mut transport, socket, responder) =
            setup(b"grouppassword", Some(vec![0xee; 20]), 1).await;
        let mut session = Session::new();
        let gateway_task = tokio::spawn(async move {
            responder.respond(&socket).await;
        });
        let mut exchange = AggressiveMode::new(&config).unwrap();
        assert_eq!(exchange.state, State::Init);
        let established = exchange
            .negotiate(&mut session, &mut transport)
            .await
            .unwrap();
        assert_eq!(exchange.state, State::Authenticated);
        assert!(established.xauth_request.is_none());
        assert_eq!(transport.encapsulation(), EncapsulationMode::UdpTunnel);
        assert_eq!(transport.peer().port(), 4500);
        assert_eq!(session.ike_sa().unwrap().auth().id, AuthMethod::PreSharedKey);
        gateway_task.await.unwrap();
    }
}
