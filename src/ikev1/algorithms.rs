use std::fmt;

use super::{
    crypto::{CipherAlgorithm, HashAlgorithm},
    dh::Group,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuthMethod {
    PreSharedKey,
    PreSharedKeyXauth,
}

/// Describes an algorithm and the identifiers used to negotiate it in
/// phase 1 (IKE) and phase 2 (IPsec DOI).
#[derive(PartialEq, Eq, Debug)]
pub struct Algorithm<T> {
    pub name: &'static str,
    pub id: T,
    pub ike_id: u16,
    pub ipsec_id: u16,
    pub key_length: u16,
}

impl<T> fmt::Display for Algorithm<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub struct Registry<T: 'static>(&'static [Algorithm<T>]);

impl<T: 'static> Registry<T> {
    pub fn by_name(&self, name: &str) -> Option<&'static Algorithm<T>> {
        self.0
            .iter()
            .find(|algorithm| algorithm.name.eq_ignore_ascii_case(name))
    }

    pub fn by_ike_id(&self, ike_id: u16, key_length: u16) -> Option<&'static Algorithm<T>> {
        self.0
            .iter()
            .find(|algorithm| algorithm.ike_id == ike_id && algorithm.key_length == key_length)
    }

    pub fn by_ipsec_id(&self, ipsec_id: u16, key_length: u16) -> Option<&'static Algorithm<T>> {
        self.0.iter().find(|algorithm| {
            algorithm.ipsec_id == ipsec_id && algorithm.key_length == key_length
        })
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &'static Algorithm<T>> {
        self.0.iter()
    }
}

const DH_GROUP_TABLE: [Algorithm<Option<Group>>; 4] = [
    Algorithm {
        name: "nopfs",
        id: None,
        ike_id: 0,
        ipsec_id: 0,
        key_length: 0,
    },
    Algorithm {
        name: "dh1",
        id: Some(Group::Modp768),
        ike_id: 1,
        ipsec_id: 1,
        key_length: 0,
    },
    Algorithm {
        name: "dh2",
        id: Some(Group::Modp1024),
        ike_id: 2,
        ipsec_id: 2,
        key_length: 0,
    },
    Algorithm {
        name: "dh5",
        id: Some(Group::Modp1536),
        ike_id: 5,
        ipsec_id: 5,
        key_length: 0,
    },
];

pub static DH_GROUPS: Registry<Option<Group>> = Registry(&DH_GROUP_TABLE);

/// MODP 1024, used for phase 1 by default and for PFS when the gateway asks
/// for it.
pub static DEFAULT_DH_GROUP: &Algorithm<Option<Group>> = &DH_GROUP_TABLE[2];

pub static HASHES: Registry<HashAlgorithm> = Registry(&[
    Algorithm {
        name: "md5",
        id: HashAlgorithm::Md5,
        ike_id: 1,
        ipsec_id: 1,
        key_length: 0,
    },
    Algorithm {
        name: "sha1",
        id: HashAlgorithm::Sha1,
        ike_id: 2,
        ipsec_id: 2,
        key_length: 0,
    },
]);

pub static CIPHERS: Registry<CipherAlgorithm> = Registry(&[
    Algorithm {
        name: "des",
        id: CipherAlgorithm::Des,
        ike_id: 1,
        ipsec_id: 2,
        key_length: 0,
    },
    Algorithm {
        name: "3des",
        id: CipherAlgorithm::TripleDes,
        ike_id: 5,
        ipsec_id: 3,
        key_length: 0,
    },
    Algorithm {
        name: "aes128",
        id: CipherAlgorithm::Aes128,
        ike_id: 7,
        ipsec_id: 12,
        key_length: 128,
    },
    Algorithm {
        name: "aes192",
        id: CipherAlgorithm::Aes192,
        ike_id: 7,
        ipsec_id: 12,
        key_length: 192,
    },
    Algorithm {
        name: "aes256",
        id: CipherAlgorithm::Aes256,
        ike_id: 7,
        ipsec_id: 12,
        key_length: 256,
    },
]);

pub static AUTH_METHODS: Registry<AuthMethod> = Registry(&[
    Algorithm {
        name: "psk",
        id: AuthMethod::PreSharedKey,
        ike_id: 1,
        ipsec_id: 0,
        key_length: 0,
    },
    Algorithm {
        name: "psk+xauth",
        id: AuthMethod::PreSharedKeyXauth,
        ike_id: 65001,
        ipsec_id: 0,
        key_length: 0,
    },
]);

/// Ciphers offered in proposals, strongest first; single DES only when
/// explicitly enabled.
pub fn proposed_ciphers(
    enable_1des: bool,
) -> impl Iterator<Item = &'static Algorithm<CipherAlgorithm>> {
    CIPHERS
        .iter()
        .rev()
        .filter(move |cipher| enable_1des || cipher.id != CipherAlgorithm::Des)
}

pub fn proposed_hashes() -> impl Iterator<Item = &'static Algorithm<HashAlgorithm>> {
    HASHES.iter().rev()
}

pub fn proposed_auth_methods() -> impl Iterator<Item = &'static Algorithm<AuthMethod>> {
    AUTH_METHODS.iter().rev()
}
