use crypto_bigint::{
    impl_modulus,
    modular::constant_mod::{Residue, ResidueParams},
    Encoding, Random, Uint, U1024, U1536, U768,
};
use rand::rngs::OsRng;

use super::crypto::InitError;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Group {
    Modp768,
    Modp1024,
    Modp1536,
}

impl Group {
    pub fn key_length_bytes(&self) -> usize {
        match self {
            Group::Modp768 => 768 / 8,
            Group::Modp1024 => 1024 / 8,
            Group::Modp1536 => 1536 / 8,
        }
    }
}

enum PrivateKey {
    Modp768(U768),
    Modp1024(U1024),
    Modp1536(U1536),
}

/// One side of a MODP Diffie-Hellman exchange (RFC 2409 groups 1 and 2,
/// RFC 3526 group 5).
pub struct DiffieHellman {
    group: Group,
    private_key: PrivateKey,
    public_key: Vec<u8>,
}

impl DiffieHellman {
    pub fn new(group: Group) -> DiffieHellman {
        let (private_key, public_key) = match group {
            Group::Modp768 => {
                let private_key = U768::random(&mut OsRng);
                let public_key = generator_pow::<DHModulus768, { U768::LIMBS }>(&private_key);
                (PrivateKey::Modp768(private_key), public_key)
            }
            Group::Modp1024 => {
                let private_key = U1024::random(&mut OsRng);
                let public_key = generator_pow::<DHModulus1024, { U1024::LIMBS }>(&private_key);
                (PrivateKey::Modp1024(private_key), public_key)
            }
            Group::Modp1536 => {
                let private_key = U1536::random(&mut OsRng);
                let public_key = generator_pow::<DHModulus1536, { U1536::LIMBS }>(&private_key);
                (PrivateKey::Modp1536(private_key), public_key)
            }
        };
        DiffieHellman {
            group,
            private_key,
            public_key,
        }
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn shared_secret(&self, other_public_key: &[u8]) -> Result<Vec<u8>, InitError> {
        if other_public_key.len() != self.group.key_length_bytes() {
            return Err("MODP public key length is not valid".into());
        }
        if other_public_key[..other_public_key.len() - 1]
            .iter()
            .all(|b| *b == 0)
            && other_public_key[other_public_key.len() - 1] <= 1
        {
            return Err("MODP public key is degenerate".into());
        }
        let shared = match self.private_key {
            PrivateKey::Modp768(ref private_key) => {
                peer_pow::<DHModulus768, { U768::LIMBS }>(other_public_key, private_key)
            }
            PrivateKey::Modp1024(ref private_key) => {
                peer_pow::<DHModulus1024, { U1024::LIMBS }>(other_public_key, private_key)
            }
            PrivateKey::Modp1536(ref private_key) => {
                peer_pow::<DHModulus1536, { U1536::LIMBS }>(other_public_key, private_key)
            }
        };
        Ok(shared)
    }
}

fn generator_pow<P, const LIMBS: usize>(exponent: &Uint<LIMBS>) -> Vec<u8>
where
    P: ResidueParams<LIMBS>,
    Uint<LIMBS>: Encoding,
{
    let generator = Residue::<P, LIMBS>::new(&Uint::<LIMBS>::from_u8(2));
    generator
        .pow(exponent)
        .retrieve()
        .to_be_bytes()
        .as_ref()
        .to_vec()
}

fn peer_pow<P, const LIMBS: usize>(public_key: &[u8], exponent: &Uint<LIMBS>) -> Vec<u8>
where
    P: ResidueParams<LIMBS>,
    Uint<LIMBS>: Encoding,
{
    let public_key = Uint::<LIMBS>::from_be_slice(public_key);
    Residue::<P, LIMBS>::new(&public_key)
        .pow(exponent)
        .retrieve()
        .to_be_bytes()
        .as_ref()
        .to_vec()
}

impl_modulus!(
    DHModulus768,
    U768,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF"
);

impl_modulus!(
    DHModulus1024,
    U1024,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF"
);

impl_modulus!(
    DHModulus1536,
    U1536,
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB9ED529077096966D670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF"
);
