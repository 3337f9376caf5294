//! Small helpers shared by `noiseguard-crypto` and `noiseguard-core` that
//! don't belong to either: a replay-window bitmap, a jittered duration
//! helper for the timer state machine, and the project's `ahash`-based
//! `BuildHasher` for non-adversarial internal maps.
#![no_std]

use core::time::Duration;
use rand_core::RngCore;

pub use ahash::RandomState as AHashState;

/// Total width of the receive counter window, in bits (spec §3: "receive
/// counter window (2^13 bits wide, word-granular backtrack array)").
const WINDOW_BITS: u64 = 1 << 13;
const WORD_BITS: u64 = u64::BITS as u64;
const WORDS: usize = (WINDOW_BITS / WORD_BITS) as usize;

/// "Too old" threshold used by `ReplayWindow::check` (spec §4.1 Counter):
/// `COUNTER_WINDOW = 2^13 - word_bits`. Kept one word narrower than the
/// bitmap itself so the word holding the current top counter is never the
/// one a stale low counter could alias back into.
pub const COUNTER_WINDOW: u64 = WINDOW_BITS - WORD_BITS;

/// Replay-protected receive counter window (spec §4.1 "Counter").
///
/// `counter_recv` is the highest counter ever accepted; `backtrack` is a
/// word-granular bitmap of the last `WINDOW_BITS` counters relative to it.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    counter_recv: u64,
    backtrack: [u64; WORDS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            counter_recv: 0,
            backtrack: [0; WORDS],
        }
    }

    /// Returns `true` if `recv` is a fresh counter value within the window
    /// and records it as seen. `reject_after_messages` is the keypair's
    /// hard counter ceiling (`REJECT_AFTER_MESSAGES`); above it the keypair
    /// is exhausted regardless of window position.
    pub fn check(&mut self, recv: u64, reject_after_messages: u64) -> bool {
        if recv >= reject_after_messages {
            return false;
        }
        // First-ever packet (counter_recv still at its initial 0) is only
        // ever "too old" once something has actually moved the window, so
        // this also correctly admits recv == 0 as the very first packet.
        if self.counter_recv > 0 && recv + COUNTER_WINDOW < self.counter_recv {
            return false;
        }

        let word = (recv / WORD_BITS) as usize % WORDS;
        let bit = 1u64 << (recv % WORD_BITS);

        if recv > self.counter_recv {
            let old_word = (self.counter_recv / WORD_BITS) as usize;
            let new_word = (recv / WORD_BITS) as usize;
            let to_clear = new_word.saturating_sub(old_word).min(WORDS);
            for i in 1..=to_clear {
                self.backtrack[(old_word + i) % WORDS] = 0;
            }
            self.counter_recv = recv;
        }

        if self.backtrack[word] & bit != 0 {
            return false;
        }
        self.backtrack[word] |= bit;
        true
    }
}

/// `base + uniform(0, max_jitter)`, used by the timer state machine for
/// `REKEY_TIMEOUT_JITTER`-style randomized arm times.
pub fn jittered(base: Duration, max_jitter: Duration, rng: &mut impl RngCore) -> Duration {
    if max_jitter.is_zero() {
        return base;
    }
    let span_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let offset = rng.next_u64() % span_nanos.max(1);
    base + Duration::from_nanos(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_in_order_counters() {
        let mut w = ReplayWindow::new();
        assert!(w.check(0, u64::MAX));
        assert!(!w.check(0, u64::MAX));
        assert!(w.check(1, u64::MAX));
        assert!(!w.check(1, u64::MAX));
    }

    #[test]
    fn accepts_reordered_counters_within_window() {
        let mut w = ReplayWindow::new();
        assert!(w.check(9, u64::MAX));
        assert!(w.check(8, u64::MAX));
        assert!(w.check(7, u64::MAX));
        assert!(!w.check(7, u64::MAX));
    }

    #[test]
    fn scenario_from_spec_counter_window() {
        let mut w = ReplayWindow::new();
        assert!(w.check(0, u64::MAX));
        assert!(!w.check(0, u64::MAX));
        assert!(w.check(1, u64::MAX));
        assert!(!w.check(1, u64::MAX));
        assert!(w.check(9, u64::MAX));
        assert!(w.check(8, u64::MAX));
        assert!(w.check(7, u64::MAX));
        assert!(!w.check(7, u64::MAX));

        let top = COUNTER_WINDOW;
        assert!(w.check(top, u64::MAX));
        assert!(w.check(top - 1, u64::MAX));
        assert!(w.check(top - 2, u64::MAX));
        assert!(w.check(2, u64::MAX));
        assert!(!w.check(2, u64::MAX));

        assert!(w.check(top + 16, u64::MAX));
        assert!(!w.check(3, u64::MAX));
        assert!(!w.check(top + 16, u64::MAX));
    }

    #[test]
    fn rejects_at_reject_after_messages() {
        let mut w = ReplayWindow::new();
        assert!(!w.check(100, 100));
        assert!(w.check(99, 100));
    }
}
