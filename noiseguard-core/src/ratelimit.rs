//! Sharded per-source-address token-bucket rate limiter (spec §4.2
//! "Rate limiter"). Two independent tables, one per family, each a fixed
//! 8192-bucket hashtable salted with a per-table SipHash-1-3 secret.

use std::hash::Hasher;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use siphasher::sip::SipHasher13;

pub const RATELIMIT_SIZE: usize = 8192;
pub const RATELIMIT_SIZE_MAX: usize = 65536;
const INITIATIONS_BURSTABLE: u64 = 5;
/// `10^9/20` ns = 50ms worth of tokens per accepted initiation.
const INITIATION_COST: u64 = 1_000_000_000 / 20;
const TOKEN_MAX: u64 = INITIATIONS_BURSTABLE * INITIATION_COST;
const ELEMENT_TIMEOUT: Duration = Duration::from_secs(1);

struct Bucket {
    key: u64,
    tokens: u64,
    last_time: Instant,
}

struct Table {
    secret: (u64, u64),
    buckets: std::collections::HashMap<usize, Vec<Bucket>>,
    count: usize,
}

impl Table {
    fn new(secret: (u64, u64)) -> Self {
        Self {
            secret,
            buckets: std::collections::HashMap::new(),
            count: 0,
        }
    }

    fn hash_of(&self, key: u64) -> usize {
        let mut h = SipHasher13::new_with_keys(self.secret.0, self.secret.1);
        h.write_u64(key);
        (h.finish() as usize) % RATELIMIT_SIZE
    }

    fn probe(&mut self, key: u64, now: Instant) -> bool {
        let slot = self.hash_of(key);
        let chain = self.buckets.entry(slot).or_default();

        if let Some(b) = chain.iter_mut().find(|b| b.key == key) {
            let elapsed = now.duration_since(b.last_time);
            b.tokens = (b.tokens + elapsed.as_nanos().min(u64::MAX as u128) as u64).min(TOKEN_MAX);
            b.last_time = now;
            if b.tokens < INITIATION_COST {
                return false;
            }
            b.tokens -= INITIATION_COST;
            return true;
        }

        if self.count >= RATELIMIT_SIZE_MAX {
            return false;
        }
        chain.push(Bucket {
            key,
            tokens: TOKEN_MAX - INITIATION_COST,
            last_time: now,
        });
        self.count += 1;
        true
    }

    fn gc(&mut self, now: Instant) {
        for chain in self.buckets.values_mut() {
            let before = chain.len();
            chain.retain(|b| now.duration_since(b.last_time) < ELEMENT_TIMEOUT);
            self.count -= before - chain.len();
        }
        self.buckets.retain(|_, chain| !chain.is_empty());
    }
}

pub struct RateLimiter {
    v4: Mutex<Table>,
    v6: Mutex<Table>,
}

impl RateLimiter {
    pub fn new(rng: &mut impl rand_core::RngCore) -> Self {
        Self {
            v4: Mutex::new(Table::new((rng.next_u64(), rng.next_u64()))),
            v6: Mutex::new(Table::new((rng.next_u64(), rng.next_u64()))),
        }
    }

    /// Keys by `IPv4/32` (whole address) or `IPv6/64` (first 8 bytes).
    pub fn allow(&self, addr: IpAddr) -> bool {
        let now = Instant::now();
        match addr {
            IpAddr::V4(v4) => self.v4.lock().probe(u32::from(v4) as u64, now),
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&octets[..8]);
                self.v6.lock().probe(u64::from_be_bytes(prefix), now)
            }
        }
    }

    pub fn gc(&self) {
        let now = Instant::now();
        self.v4.lock().gc(now);
        self.v6.lock().gc(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn burst_then_refill_scenario() {
        let mut rng = rand::thread_rng();
        let rl = RateLimiter::new(&mut rng);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();

        for _ in 0..INITIATIONS_BURSTABLE {
            assert!(rl.allow(ip));
            assert!(rl.allow(other));
        }
        assert!(!rl.allow(ip));

        sleep(Duration::from_nanos(INITIATION_COST));
        assert!(rl.allow(ip));
        assert!(!rl.allow(ip));

        sleep(Duration::from_nanos(INITIATION_COST * 2));
        assert!(rl.allow(ip));
        assert!(rl.allow(other));
    }
}
