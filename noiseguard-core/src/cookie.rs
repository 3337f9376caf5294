//! Checker (responder side) and Maker (initiator side) of the MAC1/MAC2
//! cookie-reply mechanism (spec §4.2).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use noiseguard_crypto::{CookieSecret, CryptoError, HasMac, Key};
use noiseguard_types::Cookie;
use parking_lot::Mutex;
use rand_core::{CryptoRng, RngCore};

pub const COOKIE_SECRET_MAX_AGE: Duration = Duration::from_secs(120);
pub const COOKIE_SECRET_LATENCY: Duration = Duration::from_secs(5);

/// Server side: validates MAC1 cheaply, and MAC2 (proof of address) only
/// when the handshake worker has decided the interface is under load.
pub struct Checker {
    mac1_key: Key,
    cookie_key: Key,
    secret: Mutex<(CookieSecret, Instant)>,
    pub rate_limiter: crate::ratelimit::RateLimiter,
}

impl Checker {
    pub fn new(local_public: &noiseguard_crypto::NoisePublicKey, rng: &mut (impl CryptoRng + RngCore)) -> Self {
        let mut secret = CookieSecret::default();
        secret.generate(rng);
        Self {
            mac1_key: noiseguard_crypto::mac1_key(local_public),
            cookie_key: noiseguard_crypto::cookie_key(local_public),
            secret: Mutex::new((secret, Instant::now())),
            rate_limiter: crate::ratelimit::RateLimiter::new(rng),
        }
    }

    fn current_secret(&self, rng: &mut (impl CryptoRng + RngCore)) -> CookieSecret {
        let mut guard = self.secret.lock();
        if guard.1.elapsed() > COOKIE_SECRET_MAX_AGE {
            let mut fresh = CookieSecret::default();
            fresh.generate(rng);
            *guard = (fresh, Instant::now());
        }
        guard.0.clone()
    }

    /// `Ok(None)`: accepted outright. `Ok(Some(cookie))`: MAC2 didn't
    /// validate (or wasn't present) while under load — caller should send
    /// a cookie reply built from the returned cookie. `Err`: reject.
    pub fn verify<'m, M: HasMac>(
        &self,
        msg: &'m mut M,
        under_load: bool,
        addr: SocketAddr,
        rng: &mut (impl CryptoRng + RngCore),
    ) -> Result<Option<Cookie>, CryptoError> {
        msg.verify_mac1(&self.mac1_key)?;

        if !under_load {
            return Ok(None);
        }

        let secret = self.current_secret(rng);
        let cookie = secret.cookie_for(addr);
        if msg.verify_mac2(&cookie).is_err() {
            return Ok(Some(cookie));
        }

        if self.rate_limiter.allow(addr.ip()) {
            Ok(None)
        } else {
            Err(CryptoError::Rejected)
        }
    }

    pub fn cookie_key(&self) -> &Key {
        &self.cookie_key
    }
}

/// Client side: caches a server-issued cookie for `COOKIE_SECRET_MAX_AGE -
/// COOKIE_SECRET_LATENCY`, and tracks the last MAC1 sent (used as AD when
/// decrypting a cookie reply).
pub struct Maker {
    mac1_key: Key,
    cookie_key: Key,
    last_mac1: Mutex<Option<[u8; 16]>>,
    cached: Mutex<Option<(Cookie, Instant)>>,
}

impl Maker {
    pub fn new(peer_public: &noiseguard_crypto::NoisePublicKey) -> Self {
        Self {
            mac1_key: noiseguard_crypto::mac1_key(peer_public),
            cookie_key: noiseguard_crypto::cookie_key(peer_public),
            last_mac1: Mutex::new(None),
            cached: Mutex::new(None),
        }
    }

    pub fn mac1_key(&self) -> &Key {
        &self.mac1_key
    }

    pub fn record_mac1(&self, mac1: [u8; 16]) {
        *self.last_mac1.lock() = Some(mac1);
    }

    /// Returns a fresh cookie if one is cached and not yet stale.
    pub fn current_cookie(&self) -> Option<Cookie> {
        let guard = self.cached.lock();
        let (cookie, at) = (*guard)?;
        if at.elapsed() < COOKIE_SECRET_MAX_AGE - COOKIE_SECRET_LATENCY {
            Some(cookie)
        } else {
            None
        }
    }

    pub fn consume_cookie_reply(
        &self,
        mut reply: noiseguard_types::EncryptedCookie,
        nonce: &[u8; 24],
    ) -> Result<(), CryptoError> {
        let aad = self
            .last_mac1
            .lock()
            .ok_or(CryptoError::Rejected)?;
        let cookie = noiseguard_crypto::decrypt_cookie(&mut reply, &self.cookie_key, nonce, &aad)?;
        *self.cached.lock() = Some((cookie, Instant::now()));
        Ok(())
    }
}
