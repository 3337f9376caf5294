//! Thin, `no_std` wrappers around the primitives from spec §4.1: BLAKE2s
//! (+HMAC, for HKDF), the Noise transcript accumulator, and the 12-byte
//! nonce convention data messages and handshake payloads share.

use blake2::digest::generic_array::GenericArray;
use blake2::digest::{Digest, Output};
use blake2::Blake2s256;
use chacha20poly1305::Nonce;
use hmac::SimpleHmac;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type Key = chacha20poly1305::Key;
pub type Mac = noiseguard_types::Mac;

pub(crate) const LABEL_MAC1: [u8; 8] = *b"mac1----";
pub(crate) const LABEL_COOKIE: [u8; 8] = *b"cookie--";

/// `Ci := Hash("Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s")`
const CONSTRUCTION_HASH: [u8; 32] = [
    96, 226, 109, 174, 243, 39, 239, 192, 46, 195, 53, 226, 160, 37, 210, 208, 22, 235, 66, 6, 248,
    114, 119, 245, 45, 56, 209, 152, 139, 120, 205, 54,
];
/// `Hi := Hash(Ci || "WireGuard v1 zx2c4 Jason@zx2c4.com")`
const IDENTIFIER_HASH: [u8; 32] = [
    34, 17, 179, 97, 8, 26, 197, 102, 105, 18, 67, 219, 69, 138, 213, 50, 45, 156, 108, 102, 34,
    147, 232, 183, 14, 225, 156, 101, 186, 7, 158, 243,
];

/// A data-message nonce is the 64-bit counter placed in the low 8 bytes of
/// the 12-byte ChaCha20-Poly1305 nonce; handshake payloads always use
/// counter 0 (each payload is encrypted under a fresh key).
pub(crate) fn nonce(counter: u64) -> Nonce {
    let mut n = Nonce::default();
    n[4..].copy_from_slice(&counter.to_le_bytes());
    n
}

pub fn hash<const M: usize>(msg: [&[u8]; M]) -> Output<Blake2s256> {
    let mut digest = Blake2s256::default();
    for msg in msg {
        digest.update(msg);
    }
    digest.finalize()
}

pub fn mac(key: &[u8], msg: &[u8]) -> Mac {
    use blake2::digest::Mac as _;
    let mut mac = blake2::Blake2sMac::<blake2::digest::consts::U16>::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn hmac<const M: usize>(key: &GenericArray<u8, blake2::digest::consts::U32>, msg: [&[u8]; M]) -> Output<Blake2s256> {
    use hmac::Mac as _;
    let mut hmac = <SimpleHmac<Blake2s256> as hmac::Mac>::new_from_slice(key).unwrap();
    for msg in msg {
        hmac.update(msg);
    }
    hmac.finalize().into_bytes()
}

/// HKDF-BLAKE2s (spec §4.1): derives up to 3 outputs from `(ck, input)` by
/// iterating `HMAC(HMAC(ck, input), ...)`.
pub(crate) fn hkdf<const N: usize, const M: usize>(
    key: &Key,
    msg: [&[u8]; M],
) -> [Output<Blake2s256>; N] {
    assert!(N <= 3);

    let mut output = [Output::<Blake2s256>::default(); N];
    if N == 0 {
        return output;
    }

    let t0 = hmac(key, msg);
    let mut ti = hmac(&t0, [&[1]]);
    output[0] = ti;
    for i in 1..N as u8 {
        ti = hmac(&t0, [&ti, &[i + 1]]);
        output[i as usize] = ti;
    }
    output
}

/// The Noise handshake transcript: chaining key `ck` and running hash `h`
/// (spec §4.1 "Initialization"). Zeroized on drop and by `split`, since it
/// carries derived key material throughout the handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HandshakeState {
    hash: Key,
    chain: Key,
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self {
            chain: GenericArray::from(CONSTRUCTION_HASH),
            hash: GenericArray::from(IDENTIFIER_HASH),
        }
    }
}

impl HandshakeState {
    pub fn mix_chain(&mut self, b: &[u8]) {
        let [c] = hkdf(&self.chain, [b]);
        self.chain = c;
    }

    /// `mix_dh`: fails (returns `None`) if the DH output is the all-zero
    /// point, per spec §4.1.
    pub fn mix_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Option<()> {
        let prk = sk.diffie_hellman(pk);
        if prk.as_bytes() == &[0u8; 32] {
            return None;
        }
        let [c] = hkdf(&self.chain, [prk.as_bytes()]);
        self.chain = c;
        Some(())
    }

    pub fn mix_key_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Option<Key> {
        let prk = sk.diffie_hellman(pk);
        if prk.as_bytes() == &[0u8; 32] {
            return None;
        }
        let [c, k] = hkdf(&self.chain, [prk.as_bytes()]);
        self.chain = c;
        Some(k)
    }

    /// `mix_psk`: `(ck, temp_hash, key) <- HKDF3(ck, psk)`, then `mix_hash(temp_hash)`.
    pub fn mix_key_and_hash(&mut self, b: &[u8]) -> Key {
        let [c, t, k] = hkdf(&self.chain, [b]);
        self.chain = c;
        self.mix_hash(&t);
        k
    }

    pub fn mix_hash(&mut self, b: &[u8]) {
        self.hash = hash([&self.hash, b]);
    }

    pub fn hash(&self) -> &Key {
        &self.hash
    }

    /// `begin_session`'s final HKDF2(ck, empty) producing (first, second).
    pub fn split(&mut self) -> (Key, Key) {
        let [k1, k2] = hkdf(&self.chain, []);
        self.zeroize();
        (k1, k2)
    }
}
