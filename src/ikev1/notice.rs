use std::net::Ipv4Addr;

use log::{debug, info, warn};

use super::{
    message::{ExchangeType, NotifyType, Packet, Payload},
    session::Session,
    transport::Transport,
    IKEv1Error,
};

/// What the filter found in a phase 2 response.
pub enum Notice {
    /// A message for the current exchange.
    Response(Packet),
    /// The gateway redirected us; the transport now points at the new peer.
    Redirect,
    /// A responder lifetime notice, only returned when requested.
    ResponderLifetime,
}

#[derive(Clone, Copy)]
pub struct NoticePolicy {
    pub ignore_unknown: bool,
    pub report_responder_lifetime: bool,
}

/// Decrypts phase 2 responses, consuming informational exchanges until a
/// message for the current exchange arrives.
pub async fn filter(
    session: &mut Session,
    transport: &mut Transport,
    mut data: Vec<u8>,
    nonce: Option<&[u8]>,
    policy: NoticePolicy,
) -> Result<Notice, IKEv1Error> {
    loop {
        let verified = match session.open(&data, nonce) {
            Ok(verified) => verified,
            Err(IKEv1Error::Rejected {
                notify: NotifyType::InvalidCookie,
                ..
            }) => {
                debug!("Response has unexpected cookies, resending last message");
                data = transport.resend_last().await?;
                continue;
            }
            Err(err) => return Err(err),
        };
        let packet = verified.packet;
        if packet.exchange_type != ExchangeType::INFORMATIONAL {
            if !verified.hash_ok {
                return Err(IKEv1Error::rejected(
                    NotifyType::AuthenticationFailed,
                    "phase 2 message hash is not valid",
                ));
            }
            return Ok(Notice::Response(packet));
        }
        if !verified.hash_ok {
            warn!("Informational message has an invalid hash");
        }

        match packet.payloads.get(1) {
            Some(Payload::Notify(notify)) => match notify.notify_type {
                NotifyType::CiscoLoadBalance => {
                    let gateway = match notify.data[..] {
                        [a, b, c, d] => Ipv4Addr::new(a, b, c, d),
                        _ => {
                            return Err(IKEv1Error::rejected(
                                NotifyType::PayloadMalformed,
                                "malformed loadbalance target",
                            ))
                        }
                    };
                    info!("Gateway requested a redirect to {}", gateway);
                    transport.redirect(gateway).await?;
                    return Ok(Notice::Redirect);
                }
                NotifyType::ResponderLifetime if policy.report_responder_lifetime => {
                    debug!("Received responder lifetime notice");
                    return Ok(Notice::ResponderLifetime);
                }
                NotifyType::ResponderLifetime | NotifyType::InitialContact => {
                    debug!("Ignoring {} notice", notify.notify_type);
                }
                notify_type if policy.ignore_unknown => {
                    warn!("Ignoring unexpected notice {}", notify_type);
                }
                notify_type => {
                    warn!("Gateway sent notice {}, giving up", notify_type);
                    return Err(IKEv1Error::PeerNotify(notify_type));
                }
            },
            Some(Payload::Delete(delete)) => {
                debug!(
                    "Ignoring delete for old {} SA ({} SPIs)",
                    delete.protocol_id,
                    delete.spis.len()
                );
            }
            _ => return Ok(Notice::Response(packet)),
        }
        data = transport.receive().await?;
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, SocketAddrV4};

    use tokio::net::UdpSocket;

    use super::*;
    use crate::ikev1::{
        message::{Attribute, ConfigAttribute, ConfigurationAttributes, ConfigurationType, Notify, Delete, ProtocolId, DOI_IPSEC},
        session::testing::session_pair,
        transport::EncapsulationMode,
    };

    const POLICY: NoticePolicy = NoticePolicy {
        ignore_unknown: false,
        report_responder_lifetime: false,
    };

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

    fn notify(notify_type: NotifyType, data: &[u8]) -> Payload {
        Payload::Notify(Notify {
            doi: DOI_IPSEC,
            protocol_id: ProtocolId::ISAKMP,
            spi: vec![],
            notify_type,
            data: data.to_vec(),
        })
    }

    fn transaction() -> Payload {
        Payload::Attributes(ConfigurationAttributes {
            cfg_type: ConfigurationType::SET,
            identifier: 1,
            attributes: vec![Attribute::basic(ConfigAttribute::XAUTH_STATUS, 1)],
        })
    }

    #[tokio::test]
    async fn ignorable_notices_are_skipped() {
        let (mut session, mut gateway) = session_pair("aes128", "sha1");
        let (mut transport, peer, transport_addr) = bind_pair().await;

        let lifetime = gateway
            .seal(
                ExchangeType::INFORMATIONAL,
                100,
                vec![notify(NotifyType::ResponderLifetime, &[])],
                None,
                None,
            )
            .unwrap();
        let contact = gateway
            .seal(
                ExchangeType::INFORMATIONAL,
                101,
                vec![notify(NotifyType::InitialContact, &[])],
                None,
                None,
            )
            .unwrap();
        let delete = gateway
            .seal(
                ExchangeType::INFORMATIONAL,
                102,
                vec![Payload::Delete(Delete {
                    doi: DOI_IPSEC,
                    protocol_id: ProtocolId::IPSEC_ESP,
                    spi_size: 4,
                    spis: vec![vec![1, 2, 3, 4]],
                })],
                None,
                None,
            )
            .unwrap();
        let response = gateway
            .seal(ExchangeType::TRANSACTION, 7, vec![transaction()], None, None)
            .unwrap();
        peer.send_to(&contact, transport_addr).await.unwrap();
        peer.send_to(&delete, transport_addr).await.unwrap();
        peer.send_to(&response, transport_addr).await.unwrap();

        match filter(&mut session, &mut transport, lifetime, None, POLICY)
            .await
            .unwrap()
        {
            Notice::Response(packet) => {
                assert_eq!(packet.exchange_type, ExchangeType::TRANSACTION);
                assert_eq!(packet.payloads[1], transaction());
            }
            _ => panic!("Expected a response"),
        }
    }

    #[tokio::test]
    async fn responder_lifetime_reported_when_requested() {
        let (mut session, mut gateway) = session_pair("3des", "md5");
        let (mut transport, _peer, _) = bind_pair().await;
        let lifetime = gateway
            .seal(
                ExchangeType::INFORMATIONAL,
                100,
                vec![notify(NotifyType::ResponderLifetime, &[])],
                None,
                None,
            )
            .unwrap();
        let policy = NoticePolicy {
            report_responder_lifetime: true,
            ..POLICY
        };
        let notice = filter(&mut session, &mut transport, lifetime, None, policy)
            .await
            .unwrap();
        assert!(matches!(notice, Notice::ResponderLifetime));
    }

    #[tokio::test]
    async fn load_balance_redirects() {
        let (mut session, mut gateway) = session_pair("aes256", "sha1");
        let (mut transport, _peer, _) = bind_pair().await;
        let gateway_port = transport.peer().port();
        transport.enable_nat_traversal(EncapsulationMode::UdpTunnel).await.unwrap();

        let redirect = gateway
            .seal(
                ExchangeType::INFORMATIONAL,
                55,
                vec![notify(NotifyType::CiscoLoadBalance, &[192, 0, 2, 44])],
                None,
                None,
            )
            .unwrap();
        let notice = filter(&mut session, &mut transport, redirect, None, POLICY)
            .await
            .unwrap();
        assert!(matches!(notice, Notice::Redirect));
        assert_eq!(
            transport.peer(),
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 44), gateway_port)
        );
        assert_eq!(transport.encapsulation(), EncapsulationMode::Tunnel);

        let malformed = gateway
            .seal(
                ExchangeType::INFORMATIONAL,
                56,
                vec![notify(NotifyType::CiscoLoadBalance, &[192, 0, 2])],
                None,
                None,
            )
            .unwrap();
        let result = filter(&mut session, &mut transport, malformed, None, POLICY).await;
        assert!(matches!(
            result,
            Err(IKEv1Error::Rejected {
                notify: NotifyType::PayloadMalformed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unknown_notice_policy() {
        let (mut session, mut gateway) = session_pair("aes128", "md5");
        let (mut transport, peer, transport_addr) = bind_pair().await;
        let unknown = gateway
            .seal(
                ExchangeType::INFORMATIONAL,
                9,
                vec![notify(NotifyType::NoProposalChosen, &[])],
                None,
                None,
            )
            .unwrap();
        let result = filter(&mut session, &mut transport, unknown.clone(), None, POLICY).await;
        assert!(matches!(
            result,
            Err(IKEv1Error::PeerNotify(NotifyType::NoProposalChosen))
        ));

        let response = gateway
            .seal(ExchangeType::TRANSACTION, 8, vec![transaction()], None, None)
            .unwrap();
        peer.send_to(&response, transport_addr).await.unwrap();
        let policy = NoticePolicy {
            ignore_unknown: true,
            ..POLICY
        };
        let notice = filter(&mut session, &mut transport, unknown, None, policy)
            .await
            .unwrap();
        assert!(matches!(notice, Notice::Response(_)));
    }

    #[tokio::test]
    async fn bad_hash_is_fatal_outside_informational() {
        let (mut session, _) = session_pair("aes128", "sha1");
        let (_, mut other_keys) = session_pair("aes128", "md5");
        let (mut transport, _peer, _) = bind_pair().await;
        // Same cookies and cipher key length, different PRF.
        let forged = other_keys
            .seal(ExchangeType::TRANSACTION, 3, vec![transaction()], None, None)
            .unwrap();
        let result = filter(&mut session, &mut transport, forged, None, POLICY).await;
        assert!(result.is_err());
    }
}
