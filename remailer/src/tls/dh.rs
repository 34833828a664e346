//! Ephemeral Diffie-Hellman over the 1024-bit Oakley group 2 prime

use num_bigint::{BigUint, RandBigInt};
use zeroize::Zeroizing;

use crate::{MixError, MixResult};

/// RFC 2409 group 2 prime
const OAKLEY_GROUP_2: [u8; 128] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED,
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11,
    0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE6, 0x53, 0x81,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Smallest prime accepted from a peer
const MIN_PRIME_BITS: u64 = 1024;

/// Group parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhGroup {
    p: BigUint,
    g: BigUint,
}

impl DhGroup {
    /// Oakley group 2 with generator 2
    pub fn oakley2() -> Self {
        Self { p: BigUint::from_bytes_be(&OAKLEY_GROUP_2), g: BigUint::from(2u32) }
    }

    /// Parameters sent by a peer
    pub fn from_bytes(p: &[u8], g: &[u8]) -> MixResult<Self> {
        let odd = p.last().map_or(false, |b| b & 1 == 1);
        let p = BigUint::from_bytes_be(p);
        let g = BigUint::from_bytes_be(g);
        if p.bits() < MIN_PRIME_BITS || !odd {
            return Err(MixError::Protocol(format!("weak DH prime of {} bits", p.bits())));
        }
        if g < BigUint::from(2u32) || g >= &p - 1u32 {
            return Err(MixError::Protocol("DH generator out of range".into()));
        }
        Ok(Self { p, g })
    }

    /// Prime, big-endian
    pub fn p_bytes(&self) -> Vec<u8> {
        self.p.to_bytes_be()
    }

    /// Generator, big-endian
    pub fn g_bytes(&self) -> Vec<u8> {
        self.g.to_bytes_be()
    }

    /// Fresh key pair in this group
    pub fn generate(&self) -> DhKeyPair {
        let mut rng = rand::thread_rng();
        let private = rng.gen_biguint_range(&BigUint::from(2u32), &(&self.p - 2u32));
        let public = self.g.modpow(&private, &self.p);
        DhKeyPair { group: self.clone(), private, public }
    }
}

/// Ephemeral key pair; the private exponent is wiped on drop
pub struct DhKeyPair {
    group: DhGroup,
    private: BigUint,
    public: BigUint,
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        wipe(&mut self.private);
    }
}

/// Overwrite every limb of `n` with zeros, leaving it zero
fn wipe(n: &mut BigUint) {
    let limbs = n.iter_u32_digits().len();
    n.assign_from_slice(&Zeroizing::new(vec![0u32; limbs]));
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair").field("bits", &self.group.p.bits()).finish_non_exhaustive()
    }
}

impl DhKeyPair {
    /// Public value, big-endian
    pub fn public_bytes(&self) -> Vec<u8> {
        self.public.to_bytes_be()
    }

    /// Shared secret with a peer's public value, leading zeros stripped
    pub fn agree(&self, peer_public: &[u8]) -> MixResult<Zeroizing<Vec<u8>>> {
        let y = BigUint::from_bytes_be(peer_public);
        if y <= BigUint::from(1u32) || y >= &self.group.p - 1u32 {
            return Err(MixError::Protocol("DH public value out of range".into()));
        }
        Ok(Zeroizing::new(y.modpow(&self.private, &self.group.p).to_bytes_be()))
    }
}
