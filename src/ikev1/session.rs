use std::net::Ipv4Addr;

use log::{debug, trace};
use rand::Rng;

use crate::logger::fmt_slice_hex;

use super::{
    algorithms::{Algorithm, AuthMethod},
    crypto::{self, CipherAlgorithm, HashAlgorithm, InitError, IvState, MessageCipher, Phase1Keys, Prf},
    message::{
        self, Delete, ExchangeType, Flags, Notify, NotifyType, Packet, Payload, ProtocolId,
        DOI_IPSEC, HEADER_LENGTH,
    },
    IKEv1Error,
};

pub const COOKIE_LENGTH: usize = 8;

/// Phase 1 algorithms and keys, established once per session.
pub struct IkeSa {
    cipher: &'static Algorithm<CipherAlgorithm>,
    hash: &'static Algorithm<HashAlgorithm>,
    auth: &'static Algorithm<AuthMethod>,
    skeyid_d: Vec<u8>,
    skeyid_a: Prf,
    message_cipher: MessageCipher,
}

impl IkeSa {
    pub fn new(
        cipher: &'static Algorithm<CipherAlgorithm>,
        hash: &'static Algorithm<HashAlgorithm>,
        auth: &'static Algorithm<AuthMethod>,
        keys: &Phase1Keys,
    ) -> Result<IkeSa, InitError> {
        let skeyid_a = hash.id.prf(&keys.skeyid_a)?;
        let message_cipher =
            MessageCipher::new(cipher.id, hash.id, &keys.encryption_key, &keys.iv);
        Ok(IkeSa {
            cipher,
            hash,
            auth,
            skeyid_d: keys.skeyid_d.clone(),
            skeyid_a,
            message_cipher,
        })
    }

    pub fn cipher(&self) -> &'static Algorithm<CipherAlgorithm> {
        self.cipher
    }

    pub fn hash(&self) -> &'static Algorithm<HashAlgorithm> {
        self.hash
    }

    pub fn auth(&self) -> &'static Algorithm<AuthMethod> {
        self.auth
    }
}

/// A decrypted phase 2 message and the outcome of its integrity check.
pub struct Verified {
    pub packet: Packet,
    pub hash_ok: bool,
}

/// Per-connection state shared by all phases of the handshake.
pub struct Session {
    i_cookie: [u8; COOKIE_LENGTH],
    r_cookie: Option<[u8; COOKIE_LENGTH]>,
    ike_sa: Option<IkeSa>,
    pub server_pfs: Option<bool>,
    pub peer_udp_encap_port: Option<u16>,
    pub internal_address: Option<Ipv4Addr>,
}

impl Session {
    pub fn new() -> Session {
        let mut i_cookie = [0u8; COOKIE_LENGTH];
        rand::thread_rng().fill(&mut i_cookie);
        if i_cookie[0] == 0 {
            i_cookie[0] = 1;
        }
        trace!("Initiator cookie {}", fmt_slice_hex(&i_cookie));
        Session {
            i_cookie,
            r_cookie: None,
            ike_sa: None,
            server_pfs: None,
            peer_udp_encap_port: None,
            internal_address: None,
        }
    }

    pub fn i_cookie(&self) -> [u8; COOKIE_LENGTH] {
        self.i_cookie
    }

    pub fn r_cookie(&self) -> Result<[u8; COOKIE_LENGTH], IKEv1Error> {
        self.r_cookie
            .ok_or(IKEv1Error::Internal("Responder cookie is not known yet"))
    }

    pub fn set_r_cookie(&mut self, r_cookie: [u8; COOKIE_LENGTH]) -> Result<(), IKEv1Error> {
        match self.r_cookie {
            Some(existing) if existing != r_cookie => {
                Err("Responder cookie is already set".into())
            }
            _ => {
                self.r_cookie = Some(r_cookie);
                Ok(())
            }
        }
    }

    /// ISAKMP SA identifier, Ci followed by Cr.
    pub fn cookies(&self) -> Result<Vec<u8>, IKEv1Error> {
        let mut cookies = Vec::with_capacity(COOKIE_LENGTH * 2);
        cookies.extend_from_slice(&self.i_cookie);
        cookies.extend_from_slice(&self.r_cookie()?);
        Ok(cookies)
    }

    pub fn establish(&mut self, ike_sa: IkeSa) -> Result<(), IKEv1Error> {
        if self.ike_sa.is_some() {
            return Err("IKE SA is already established".into());
        }
        self.ike_sa = Some(ike_sa);
        Ok(())
    }

    pub fn has_keys(&self) -> bool {
        self.ike_sa.is_some()
    }

    pub fn ike_sa(&self) -> Result<&IkeSa, IKEv1Error> {
        self.ike_sa
            .as_ref()
            .ok_or(IKEv1Error::Internal("IKE SA is not established"))
    }

    fn ike_sa_mut(&mut self) -> Result<&mut IkeSa, IKEv1Error> {
        self.ike_sa
            .as_mut()
            .ok_or(IKEv1Error::Internal("IKE SA is not established"))
    }

    pub fn iv_state(&self) -> Result<IvState, IKEv1Error> {
        Ok(self.ike_sa()?.message_cipher.iv_state())
    }

    pub fn restore_iv_state(&mut self, state: IvState) -> Result<(), IKEv1Error> {
        self.ike_sa_mut()?.message_cipher.restore_iv_state(state);
        Ok(())
    }

    fn message_header(&self) -> Result<([u8; COOKIE_LENGTH], [u8; COOKIE_LENGTH]), IKEv1Error> {
        Ok((self.i_cookie, self.r_cookie()?))
    }

    /// Encrypts the final Aggressive Mode message and anchors the phase 2 IV
    /// chain on it.
    pub fn seal_phase1(&mut self, packet: &Packet) -> Result<Vec<u8>, IKEv1Error> {
        let ike_sa = self.ike_sa_mut()?;
        let mut data = packet.flatten(ike_sa.message_cipher.block_length());
        trace!("Phase 1 plaintext {}", fmt_slice_hex(&data));
        ike_sa
            .message_cipher
            .encrypt(&mut data[HEADER_LENGTH..], packet.message_id, false)?;
        ike_sa.message_cipher.complete_phase1();
        Ok(data)
    }

    /// Builds an encrypted phase 2 message, prefixed with
    /// HASH = prf(SKEYID_a, M-ID | [Ni] | [Nr] | payloads).
    pub fn seal(
        &mut self,
        exchange_type: ExchangeType,
        message_id: u32,
        payloads: Vec<Payload>,
        i_nonce: Option<&[u8]>,
        r_nonce: Option<&[u8]>,
    ) -> Result<Vec<u8>, IKEv1Error> {
        let (i_cookie, r_cookie) = self.message_header()?;
        let ike_sa = self.ike_sa_mut()?;
        let no_payloads: &[u8] = if payloads.is_empty() { &[0] } else { &[] };
        let mut packet = Packet::new(
            i_cookie,
            r_cookie,
            exchange_type,
            Flags::ENCRYPTION,
            message_id,
            payloads,
        );
        let payload_data = packet.flatten(0);
        let hash = ike_sa.skeyid_a.compute(&[
            no_payloads,
            &message_id.to_be_bytes(),
            i_nonce.unwrap_or(&[]),
            r_nonce.unwrap_or(&[]),
            &payload_data[HEADER_LENGTH..],
        ]);
        packet.payloads.insert(0, Payload::Hash(hash));
        debug!("Sending {}", packet);

        let mut data = packet.flatten(ike_sa.message_cipher.block_length());
        trace!("Phase 2 plaintext {}", fmt_slice_hex(&data));
        let informational = exchange_type == ExchangeType::INFORMATIONAL;
        ike_sa
            .message_cipher
            .encrypt(&mut data[HEADER_LENGTH..], message_id, informational)?;
        Ok(data)
    }

    /// Decrypts and parses a phase 2 message. The nonce is only included in
    /// the hash for non-informational exchanges.
    pub fn open(&mut self, data: &[u8], nonce: Option<&[u8]>) -> Result<Verified, IKEv1Error> {
        let (i_cookie, r_cookie) = self.message_header()?;
        let ike_sa = self.ike_sa_mut()?;
        let block_length = ike_sa.message_cipher.block_length();
        if data.len() <= HEADER_LENGTH || (data.len() - HEADER_LENGTH) % block_length != 0 {
            debug!(
                "Encrypted message length {} is not padded to block length {}",
                data.len(),
                block_length
            );
            return Err(IKEv1Error::rejected(
                NotifyType::UnequalPayloadLengths,
                "encrypted message is too short or not padded",
            ));
        }
        if data[0..COOKIE_LENGTH] != i_cookie || data[COOKIE_LENGTH..COOKIE_LENGTH * 2] != r_cookie
        {
            debug!("Received message with unexpected cookies");
            return Err(IKEv1Error::rejected(
                NotifyType::InvalidCookie,
                "message cookies don't match session",
            ));
        }
        let informational = data[18] == ExchangeType::INFORMATIONAL.value();
        let mut message_id = [0u8; 4];
        message_id.copy_from_slice(&data[20..24]);

        let mut plaintext = data.to_vec();
        ike_sa.message_cipher.decrypt(
            &mut plaintext[HEADER_LENGTH..],
            u32::from_be_bytes(message_id),
            informational,
        )?;
        trace!("Decrypted phase 2 message {}", fmt_slice_hex(&plaintext));
        let packet = Packet::parse(&plaintext)?;
        debug!("Received {}", packet);

        if packet.flags != Flags::ENCRYPTION {
            return Err(IKEv1Error::rejected(
                NotifyType::InvalidFlags,
                "phase 2 message flags are not valid",
            ));
        }
        let received_hash = match packet.first_payload() {
            Some(Payload::Hash(hash)) if hash.len() == ike_sa.hash.id.digest_length() => hash,
            _ => {
                return Err(IKEv1Error::rejected(
                    NotifyType::InvalidHashInformation,
                    "phase 2 message doesn't start with a hash",
                ))
            }
        };
        let nonce = if informational { None } else { nonce };
        let expected_hash = ike_sa.skeyid_a.compute(&[
            &message_id,
            nonce.unwrap_or(&[]),
            message::payloads_after_first(&plaintext)?,
        ]);
        let hash_ok = &expected_hash == received_hash;
        if !hash_ok {
            debug!(
                "Hash mismatch, expected {} received {}",
                fmt_slice_hex(&expected_hash),
                fmt_slice_hex(received_hash)
            );
        }
        Ok(Verified { packet, hash_ok })
    }

    /// Derives ESP key material for one SPI, using the negotiated phase 1
    /// PRF keyed with SKEYID_d.
    pub fn generate_keymat(
        &self,
        length: usize,
        spi: u32,
        dh_shared: Option<&[u8]>,
        i_nonce: &[u8],
        r_nonce: &[u8],
    ) -> Result<Vec<u8>, IKEv1Error> {
        let ike_sa = self.ike_sa()?;
        Ok(crypto::generate_keymat(
            ike_sa.hash.id,
            &ike_sa.skeyid_d,
            length,
            dh_shared,
            ProtocolId::IPSEC_ESP.value(),
            spi,
            i_nonce,
            r_nonce,
        )?)
    }

    /// Informational messages reporting a fatal phase 2 condition: an
    /// optional notify followed by a delete of the ISAKMP SA.
    pub fn teardown_messages(
        &mut self,
        notify: Option<NotifyType>,
    ) -> Result<Vec<Vec<u8>>, IKEv1Error> {
        let cookies = self.cookies()?;
        let mut messages = vec![];
        if let Some(notify_type) = notify {
            let payload = Payload::Notify(Notify {
                doi: DOI_IPSEC,
                protocol_id: ProtocolId::ISAKMP,
                spi: cookies.clone(),
                notify_type,
                data: vec![],
            });
            messages.push(self.seal(
                ExchangeType::INFORMATIONAL,
                random_message_id(),
                vec![payload],
                None,
                None,
            )?);
        }
        let payload = Payload::Delete(Delete {
            doi: DOI_IPSEC,
            protocol_id: ProtocolId::ISAKMP,
            spi_size: cookies.len() as u8,
            spis: vec![cookies],
        });
        messages.push(self.seal(
            ExchangeType::INFORMATIONAL,
            random_message_id(),
            vec![payload],
            None,
            None,
        )?);
        Ok(messages)
    }
}

impl Default for Session {
    fn default() -> Session {
        Session::new()
    }
}

pub fn random_message_id() -> u32 {
    let message_id = rand::thread_rng().gen::<u32>();
    if message_id == 0 {
        1
    } else {
        message_id
    }
}
