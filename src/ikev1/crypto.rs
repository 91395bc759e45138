use aes::{Aes128, Aes192, Aes256};
use cipher::{
    block_padding::NoPadding, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
};
use des::{Des, TdesEde3};
use hmac::{Hmac, Mac};
use log::debug;
use md5::Md5;
use sha1::{Digest, Sha1};
use std::{error, fmt};

type HmacMd5 = Hmac<Md5>;
type HmacSha1 = Hmac<Sha1>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
}

impl HashAlgorithm {
    pub fn digest_length(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 128 / 8,
            HashAlgorithm::Sha1 => 160 / 8,
        }
    }

    pub fn hash(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            HashAlgorithm::Md5 => {
                let mut hasher = Md5::new();
                parts.iter().for_each(|part| hasher.update(part));
                hasher.finalize().to_vec()
            }
            HashAlgorithm::Sha1 => {
                let mut hasher = Sha1::new();
                parts.iter().for_each(|part| hasher.update(part));
                hasher.finalize().to_vec()
            }
        }
    }

    pub fn prf(&self, key: &[u8]) -> Result<Prf, InitError> {
        match self {
            HashAlgorithm::Md5 => {
                let hmac = <HmacMd5 as Mac>::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init HMAC MD5 PRF"))?;
                Ok(Prf::HmacMd5(hmac))
            }
            HashAlgorithm::Sha1 => {
                let hmac = <HmacSha1 as Mac>::new_from_slice(key)
                    .map_err(|_| InitError::new("Failed to init HMAC SHA1 PRF"))?;
                Ok(Prf::HmacSha1(hmac))
            }
        }
    }
}

/// HMAC keyed with a fixed key, computing the negotiated pseudorandom function.
#[derive(Clone)]
pub enum Prf {
    HmacMd5(HmacMd5),
    HmacSha1(HmacSha1),
}

impl Prf {
    pub fn compute(&self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Prf::HmacMd5(ref hmac) => {
                let mut hmac = hmac.clone();
                parts.iter().for_each(|part| hmac.update(part));
                hmac.finalize().into_bytes().to_vec()
            }
            Prf::HmacSha1(ref hmac) => {
                let mut hmac = hmac.clone();
                parts.iter().for_each(|part| hmac.update(part));
                hmac.finalize().into_bytes().to_vec()
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CipherAlgorithm {
    Des,
    TripleDes,
    Aes128,
    Aes192,
    Aes256,
}

impl CipherAlgorithm {
    pub fn key_length(&self) -> usize {
        match self {
            CipherAlgorithm::Des => 64 / 8,
            CipherAlgorithm::TripleDes => 192 / 8,
            CipherAlgorithm::Aes128 => 128 / 8,
            CipherAlgorithm::Aes192 => 192 / 8,
            CipherAlgorithm::Aes256 => 256 / 8,
        }
    }

    pub fn block_length(&self) -> usize {
        match self {
            CipherAlgorithm::Des | CipherAlgorithm::TripleDes => 8,
            CipherAlgorithm::Aes128 | CipherAlgorithm::Aes192 | CipherAlgorithm::Aes256 => 16,
        }
    }

    pub fn encrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
        match self {
            CipherAlgorithm::Des => cbc_encrypt::<Des>(key, iv, data),
            CipherAlgorithm::TripleDes => cbc_encrypt::<TdesEde3>(key, iv, data),
            CipherAlgorithm::Aes128 => cbc_encrypt::<Aes128>(key, iv, data),
            CipherAlgorithm::Aes192 => cbc_encrypt::<Aes192>(key, iv, data),
            CipherAlgorithm::Aes256 => cbc_encrypt::<Aes256>(key, iv, data),
        }
    }

    pub fn decrypt(&self, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError> {
        match self {
            CipherAlgorithm::Des => cbc_decrypt::<Des>(key, iv, data),
            CipherAlgorithm::TripleDes => cbc_decrypt::<TdesEde3>(key, iv, data),
            CipherAlgorithm::Aes128 => cbc_decrypt::<Aes128>(key, iv, data),
            CipherAlgorithm::Aes192 => cbc_decrypt::<Aes192>(key, iv, data),
            CipherAlgorithm::Aes256 => cbc_decrypt::<Aes256>(key, iv, data),
        }
    }
}

fn cbc_encrypt<C>(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockEncryptMut + BlockCipher + KeyInit,
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv).map_err(|err| {
        debug!("Failed to init CBC encryptor: {}", err);
        "Failed to init CBC encryptor"
    })?;
    let msg_len = data.len();
    encryptor
        .encrypt_padded_mut::<NoPadding>(data, msg_len)
        .map_err(|err| {
            debug!("Failed to encrypt CBC message: {}", err);
            "Failed to encrypt CBC message"
        })?;
    Ok(())
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), CryptoError>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv).map_err(|err| {
        debug!("Failed to init CBC decryptor: {}", err);
        "Failed to init CBC decryptor"
    })?;
    decryptor
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|err| {
            debug!("Failed to decrypt CBC message: {}", err);
            "Failed to decrypt CBC message"
        })?;
    Ok(())
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IvState {
    iv: Vec<u8>,
    message_id: u32,
}

/// Phase 1 CBC cipher with the ISAKMP IV chaining rules from RFC 2409
/// Appendix B: every message ID gets its own chain, seeded from the last
/// phase 1 ciphertext block.
pub struct MessageCipher {
    cipher: CipherAlgorithm,
    hash: HashAlgorithm,
    key: Vec<u8>,
    initial_iv: Vec<u8>,
    current: IvState,
}

impl MessageCipher {
    pub fn new(
        cipher: CipherAlgorithm,
        hash: HashAlgorithm,
        key: &[u8],
        iv: &[u8],
    ) -> MessageCipher {
        MessageCipher {
            cipher,
            hash,
            key: key.to_vec(),
            initial_iv: iv.to_vec(),
            current: IvState {
                iv: iv.to_vec(),
                message_id: 0,
            },
        }
    }

    pub fn block_length(&self) -> usize {
        self.cipher.block_length()
    }

    pub fn iv_state(&self) -> IvState {
        self.current.clone()
    }

    pub fn restore_iv_state(&mut self, state: IvState) {
        self.current = state;
    }

    /// Called after the last phase 1 message is encrypted; phase 2 IVs are
    /// derived from its last ciphertext block.
    pub fn complete_phase1(&mut self) {
        self.initial_iv = self.current.iv.clone();
    }

    fn select_iv(&mut self, message_id: u32, informational: bool) -> Result<Vec<u8>, CryptoError> {
        if message_id != self.current.message_id {
            let mut iv = self
                .hash
                .hash(&[&self.initial_iv, &message_id.to_be_bytes()]);
            iv.truncate(self.cipher.block_length());
            if !informational {
                self.current = IvState {
                    iv: iv.clone(),
                    message_id,
                };
            }
            Ok(iv)
        } else if informational {
            Err("Informational exchange reuses an active message ID".into())
        } else {
            Ok(self.current.iv.clone())
        }
    }

    fn check_length(&self, data: &[u8]) -> Result<(), CryptoError> {
        if data.is_empty() || data.len() % self.cipher.block_length() != 0 {
            debug!(
                "Encrypted data length {} is not a multiple of block length {}",
                data.len(),
                self.cipher.block_length()
            );
            Err("Encrypted data is not aligned to block length".into())
        } else {
            Ok(())
        }
    }

    pub fn encrypt(
        &mut self,
        data: &mut [u8],
        message_id: u32,
        informational: bool,
    ) -> Result<(), CryptoError> {
        self.check_length(data)?;
        let iv = self.select_iv(message_id, informational)?;
        self.cipher.encrypt(&self.key, &iv, data)?;
        if !informational {
            self.current.iv = data[data.len() - self.cipher.block_length()..].to_vec();
        }
        Ok(())
    }

    pub fn decrypt(
        &mut self,
        data: &mut [u8],
        message_id: u32,
        informational: bool,
    ) -> Result<(), CryptoError> {
        self.check_length(data)?;
        let iv = self.select_iv(message_id, informational)?;
        let next_iv = data[data.len() - self.cipher.block_length()..].to_vec();
        self.cipher.decrypt(&self.key, &iv, data)?;
        if !informational {
            self.current.iv = next_iv;
        }
        Ok(())
    }
}

pub struct Phase1Inputs<'a> {
    pub shared_key: &'a [u8],
    pub i_nonce: &'a [u8],
    pub r_nonce: &'a [u8],
    pub dh_shared: &'a [u8],
    pub i_cookie: &'a [u8],
    pub r_cookie: &'a [u8],
    pub i_public_key: &'a [u8],
    pub r_public_key: &'a [u8],
}

pub struct Phase1Keys {
    pub skeyid: Vec<u8>,
    pub skeyid_d: Vec<u8>,
    pub skeyid_a: Vec<u8>,
    pub skeyid_e: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Derives the SKEYID family for pre-shared key authentication
/// (RFC 2409 Section 5 and Appendix B).
pub fn derive_phase1_keys(
    hash: HashAlgorithm,
    cipher: CipherAlgorithm,
    inputs: &Phase1Inputs,
) -> Result<Phase1Keys, InitError> {
    let skeyid = hash
        .prf(inputs.shared_key)?
        .compute(&[inputs.i_nonce, inputs.r_nonce]);
    let prf = hash.prf(&skeyid)?;
    let skeyid_d = prf.compute(&[
        inputs.dh_shared,
        inputs.i_cookie,
        inputs.r_cookie,
        &[0],
    ]);
    let skeyid_a = prf.compute(&[
        &skeyid_d,
        inputs.dh_shared,
        inputs.i_cookie,
        inputs.r_cookie,
        &[1],
    ]);
    let skeyid_e = prf.compute(&[
        &skeyid_a,
        inputs.dh_shared,
        inputs.i_cookie,
        inputs.r_cookie,
        &[2],
    ]);

    let key_length = cipher.key_length();
    let encryption_key = if key_length <= skeyid_e.len() {
        skeyid_e[..key_length].to_vec()
    } else {
        let prf = hash.prf(&skeyid_e)?;
        let mut key = Vec::with_capacity(key_length + hash.digest_length());
        let mut block = prf.compute(&[&[0]]);
        key.extend_from_slice(&block);
        while key.len() < key_length {
            block = prf.compute(&[&block]);
            key.extend_from_slice(&block);
        }
        key.truncate(key_length);
        key
    };

    let mut iv = hash.hash(&[inputs.i_public_key, inputs.r_public_key]);
    iv.truncate(cipher.block_length());

    Ok(Phase1Keys {
        skeyid,
        skeyid_d,
        skeyid_a,
        skeyid_e,
        encryption_key,
        iv,
    })
}

/// Generates IPsec key material for one SA (RFC 2409 Section 5.5).
pub fn generate_keymat(
    hash: HashAlgorithm,
    skeyid_d: &[u8],
    length: usize,
    dh_shared: Option<&[u8]>,
    protocol: u8,
    spi: u32,
    i_nonce: &[u8],
    r_nonce: &[u8],
) -> Result<Vec<u8>, InitError> {
    let prf = hash.prf(skeyid_d)?;
    let block_length = hash.digest_length();
    let count = length.div_ceil(block_length);
    let mut keymat = Vec::with_capacity(count * block_length);
    let mut block: Vec<u8> = vec![];
    for _ in 0..count {
        block = prf.compute(&[
            &block,
            dh_shared.unwrap_or(&[]),
            &[protocol],
            &spi.to_be_bytes(),
            i_nonce,
            r_nonce,
        ]);
        keymat.extend_from_slice(&block);
    }
    Ok(keymat)
}

pub fn hash_sha1(data: &[u8]) -> [u8; 160 / 8] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub struct InitError {
    msg: &'static str,
}

impl InitError {
    fn new(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for InitError {}

impl From<&'static str> for InitError {
    fn from(msg: &'static str) -> InitError {
        InitError { msg }
    }
}

pub struct CryptoError {
    msg: &'static str,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl fmt::Debug for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl error::Error for CryptoError {}

impl From<&'static str> for CryptoError {
    fn from(msg: &'static str) -> CryptoError {
        CryptoError { msg }
    }
}

impl From<InitError> for CryptoError {
    fn from(err: InitError) -> CryptoError {
        CryptoError { msg: err.msg }
    }
}
