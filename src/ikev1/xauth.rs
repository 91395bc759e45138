use log::{debug, info};

use super::{
    message::{
        Attribute, ConfigAttribute, ConfigurationAttributes, ConfigurationType, ExchangeType,
        NotifyType, Packet, Payload,
    },
    notice::{self, Notice, NoticePolicy},
    session::Session,
    transport::Transport,
    Config, Flow, IKEv1Error, Prompt,
};

/// Answers the gateway's XAUTH requests until it sends the final status.
///
/// `request` is the gateway's reply to the last phase 1 message.
pub async fn authenticate(
    config: &Config,
    prompt: &mut dyn Prompt,
    session: &mut Session,
    transport: &mut Transport,
    request: Vec<u8>,
    policy: NoticePolicy,
) -> Result<Flow<()>, IKEv1Error> {
    let mut data = request;
    let (message_id, status) = loop {
        let packet = match notice::filter(session, transport, data, None, policy).await? {
            Notice::Response(packet) => packet,
            Notice::Redirect => return Ok(Flow::Redirect),
            Notice::ResponderLifetime => {
                return Err("Unexpected responder lifetime notice during XAUTH".into())
            }
        };
        let attributes = transaction_attributes(&packet)?;
        if attributes.cfg_type == ConfigurationType::SET {
            break (packet.message_id, attributes.clone());
        } else if attributes.cfg_type != ConfigurationType::REQUEST {
            return Err(IKEv1Error::rejected(
                NotifyType::InvalidPayloadType,
                "expected XAUTH request",
            ));
        }

        let dialog = Dialog {
            config,
            gateway: transport.peer().ip().to_string(),
            seen_answer: attributes
                .attributes
                .iter()
                .any(|attribute| attribute.attribute_type == ConfigAttribute::XAUTH_ANSWER),
        };
        dialog.check_request(&attributes.attributes)?;
        let reply = ConfigurationAttributes {
            cfg_type: ConfigurationType::REPLY,
            identifier: attributes.identifier,
            attributes: dialog.reply(prompt, &attributes.attributes)?,
        };
        let reply = session.seal(
            ExchangeType::TRANSACTION,
            packet.message_id,
            vec![Payload::Attributes(reply)],
            None,
            None,
        )?;
        data = transport.send_receive(&reply).await?;
    };

    let result = match status.attributes[..] {
        [ref attribute] if attribute.attribute_type == ConfigAttribute::XAUTH_STATUS => {
            match attribute.as_basic() {
                Some(result) => result,
                None => {
                    return Err(IKEv1Error::rejected(
                        NotifyType::InvalidPayloadType,
                        "XAUTH status is not a basic attribute",
                    ))
                }
            }
        }
        _ => {
            return Err(IKEv1Error::rejected(
                NotifyType::InvalidPayloadType,
                "XAUTH SET must only contain a status",
            ))
        }
    };
    let ack = ConfigurationAttributes {
        cfg_type: ConfigurationType::ACK,
        ..status
    };
    let ack = session.seal(
        ExchangeType::TRANSACTION,
        message_id,
        vec![Payload::Attributes(ack)],
        None,
        None,
    )?;
    transport.send(&ack).await?;

    if result == 0 {
        return Err(IKEv1Error::AuthenticationFailed(
            "authentication unsuccessful",
        ));
    }
    info!("XAUTH authentication succeeded");
    Ok(Flow::Done(()))
}

/// Returns the attributes of a transaction exchange made of a hash and a
/// single attributes payload.
pub fn transaction_attributes(packet: &Packet) -> Result<&ConfigurationAttributes, IKEv1Error> {
    if packet.exchange_type != ExchangeType::TRANSACTION {
        return Err(IKEv1Error::rejected(
            NotifyType::InvalidExchangeType,
            "expected a transaction exchange",
        ));
    }
    match packet.payloads[..] {
        [Payload::Hash(_), Payload::Attributes(ref attributes)] => Ok(attributes),
        _ => Err(IKEv1Error::rejected(
            NotifyType::InvalidPayloadType,
            "transaction must contain a single attributes payload",
        )),
    }
}

struct Dialog<'a> {
    config: &'a Config,
    gateway: String,
    seen_answer: bool,
}

impl Dialog<'_> {
    fn interactive(&self) -> bool {
        self.seen_answer || self.config.xauth_interactive
    }

    fn check_request(&self, attributes: &[Attribute]) -> Result<(), IKEv1Error> {
        for attribute in attributes.iter() {
            match attribute.attribute_type {
                ConfigAttribute::XAUTH_TYPE => {
                    if attribute.as_basic() != Some(0) {
                        return Err(IKEv1Error::rejected(
                            NotifyType::AttributesNotSupported,
                            "only generic XAUTH is supported",
                        ));
                    }
                }
                ConfigAttribute::XAUTH_USER_NAME
                | ConfigAttribute::XAUTH_USER_PASSWORD
                | ConfigAttribute::XAUTH_PASSCODE
                | ConfigAttribute::XAUTH_DOMAIN
                | ConfigAttribute::XAUTH_ANSWER
                | ConfigAttribute::XAUTH_CISCOEXT_VENDOR => {}
                ConfigAttribute::XAUTH_MESSAGE => {
                    let message = match attribute.as_basic() {
                        Some(value) => String::from_utf8_lossy(&value.to_be_bytes()).into_owned(),
                        None => String::from_utf8_lossy(attribute.as_variable().unwrap_or(&[]))
                            .into_owned(),
                    };
                    let message = message.trim_end_matches('\n');
                    if self.interactive() {
                        info!("{}", message);
                    } else {
                        debug!("XAUTH message: {}", message);
                    }
                }
                attribute_type => {
                    debug!("Unsupported XAUTH attribute {}", attribute_type);
                    return Err(IKEv1Error::rejected(
                        NotifyType::AttributesNotSupported,
                        "XAUTH request is not supported",
                    ));
                }
            }
        }
        Ok(())
    }

    fn username(
        &self,
        prompt: &mut dyn Prompt,
        entered: &mut Option<String>,
    ) -> Result<String, IKEv1Error> {
        if let Some(ref username) = self.config.xauth_username {
            return Ok(username.clone());
        }
        if let Some(username) = entered {
            return Ok(username.clone());
        }
        let username = prompt.read_line(&format!("Username for VPN {}: ", self.gateway))?;
        *entered = Some(username.clone());
        Ok(username)
    }

    fn reply(
        &self,
        prompt: &mut dyn Prompt,
        attributes: &[Attribute],
    ) -> Result<Vec<Attribute>, IKEv1Error> {
        let mut reply = vec![];
        let mut username = None;
        for attribute in attributes.iter() {
            match attribute.attribute_type {
                ConfigAttribute::XAUTH_DOMAIN => {
                    let domain = match self.config.domain {
                        Some(ref domain) if !domain.is_empty() => domain,
                        _ => {
                            return Err(IKEv1Error::Configuration(
                                "Gateway requested a domain, but none is set",
                            ))
                        }
                    };
                    reply.push(Attribute::variable(
                        attribute.attribute_type,
                        domain.as_bytes(),
                    ));
                }
                ConfigAttribute::XAUTH_USER_NAME => {
                    let username = self.username(prompt, &mut username)?;
                    reply.push(Attribute::variable(
                        attribute.attribute_type,
                        username.as_bytes(),
                    ));
                }
                ConfigAttribute::XAUTH_ANSWER
                | ConfigAttribute::XAUTH_USER_PASSWORD
                | ConfigAttribute::XAUTH_PASSCODE => {
                    let secret = match self.config.xauth_password {
                        Some(ref password) if !self.interactive() => password.clone(),
                        _ => {
                            let kind = match attribute.attribute_type {
                                ConfigAttribute::XAUTH_ANSWER => "Answer",
                                ConfigAttribute::XAUTH_USER_PASSWORD => "Password",
                                _ => "Passcode",
                            };
                            let username = self.username(prompt, &mut username)?;
                            prompt.read_secret(&format!(
                                "{} for VPN {}@{}: ",
                                kind, username, self.gateway
                            ))?
                        }
                    };
                    reply.push(Attribute::variable(
                        attribute.attribute_type,
                        secret.as_bytes(),
                    ));
                }
                _ => {}
            }
        }
        Ok(reply)
    }
}
