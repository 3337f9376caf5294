//! Per-peer timer/event state machine (spec §4.5). Callouts are modeled as
//! `Option<Instant>` deadlines rather than real OS timers: a single ticking
//! task in [`crate::device`] sweeps every peer's timers on a short period
//! and fires whichever callouts have come due. This keeps the same event
//! table and callout semantics the spec describes without pulling in a
//! per-peer OS timer per callout.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const REKEY_TIMEOUT_JITTER_MAX: Duration = Duration::from_millis(334);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const NEW_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15); // REKEY_TIMEOUT + KEEPALIVE_TIMEOUT
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REKEY_AFTER_TIME_RECV: Duration = Duration::from_secs(165);
/// `⌊90/REKEY_TIMEOUT⌋`
pub const MAX_TIMER_HANDSHAKES: u32 = 18;

#[derive(Default)]
struct Callout {
    deadline: Mutex<Option<Instant>>,
}

impl Callout {
    fn arm(&self, at: Instant) {
        *self.deadline.lock() = Some(at);
    }
    fn cancel(&self) {
        *self.deadline.lock() = None;
    }
    fn is_pending(&self) -> bool {
        self.deadline.lock().is_some()
    }
    /// Takes the deadline if it has passed, clearing it.
    fn take_if_due(&self, now: Instant) -> bool {
        let mut guard = self.deadline.lock();
        match *guard {
            Some(d) if d <= now => {
                *guard = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct PeerTimers {
    pub enabled: AtomicBool,
    pub need_another_keepalive: AtomicBool,
    pub persistent_keepalive_interval: AtomicU16,
    pub handshake_retries: AtomicU32,

    new_handshake: Callout,
    send_keepalive: Callout,
    retry_handshake: Callout,
    zero_key_material: Callout,
    persistent_keepalive: Callout,
}

/// Which callout came due; `device`'s ticking task maps these to actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueCallout {
    NewHandshake,
    SendKeepalive,
    RetryHandshake,
    ZeroKeyMaterial,
    PersistentKeepalive,
}

impl PeerTimers {
    pub fn due(&self, now: Instant) -> Vec<DueCallout> {
        let mut due = Vec::new();
        if self.new_handshake.take_if_due(now) {
            due.push(DueCallout::NewHandshake);
        }
        if self.send_keepalive.take_if_due(now) {
            due.push(DueCallout::SendKeepalive);
        }
        if self.retry_handshake.take_if_due(now) {
            due.push(DueCallout::RetryHandshake);
        }
        if self.zero_key_material.take_if_due(now) {
            due.push(DueCallout::ZeroKeyMaterial);
        }
        if self.persistent_keepalive.take_if_due(now) {
            due.push(DueCallout::PersistentKeepalive);
        }
        due
    }

    fn jittered(&self, base: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        noiseguard_utils::jittered(base, REKEY_TIMEOUT_JITTER_MAX, &mut rng)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// `enable` event: the caller is still expected to separately run the
    /// `persistent_keepalive` action per the event table.
    pub fn on_enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn on_disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.need_another_keepalive.store(false, Ordering::Release);
        self.new_handshake.cancel();
        self.send_keepalive.cancel();
        self.retry_handshake.cancel();
        self.zero_key_material.cancel();
        self.persistent_keepalive.cancel();
    }

    pub fn on_data_sent(&self) {
        if self.is_enabled() && !self.new_handshake.is_pending() {
            self.new_handshake
                .arm(Instant::now() + self.jittered(NEW_HANDSHAKE_TIMEOUT));
        }
    }

    pub fn on_data_received(&self) {
        if !self.is_enabled() {
            return;
        }
        if !self.send_keepalive.is_pending() {
            self.send_keepalive.arm(Instant::now() + KEEPALIVE_TIMEOUT);
        } else {
            self.need_another_keepalive.store(true, Ordering::Release);
        }
    }

    pub fn on_any_authenticated_packet_sent(&self) {
        self.send_keepalive.cancel();
    }

    pub fn on_any_authenticated_packet_received(&self) {
        self.new_handshake.cancel();
    }

    pub fn on_any_authenticated_packet_traversal(&self) {
        if !self.is_enabled() {
            return;
        }
        let interval = self.persistent_keepalive_interval.load(Ordering::Acquire);
        if interval > 0 {
            self.persistent_keepalive
                .arm(Instant::now() + Duration::from_secs(interval as u64));
        }
    }

    pub fn on_handshake_initiated(&self) {
        if self.is_enabled() {
            self.retry_handshake
                .arm(Instant::now() + self.jittered(REKEY_TIMEOUT));
        }
    }

    pub fn on_handshake_complete(&self) {
        if self.is_enabled() {
            self.retry_handshake.cancel();
            self.handshake_retries.store(0, Ordering::Release);
            // `send_keepalive` action runs immediately; the device ticking
            // loop arms the 0-delay callout for uniformity.
            self.send_keepalive.arm(Instant::now());
        }
    }

    pub fn on_session_derived(&self) {
        if self.is_enabled() {
            self.zero_key_material
                .arm(Instant::now() + REJECT_AFTER_TIME * 3);
        }
    }

    /// Returns `true` if an initiation should actually be sent (mirrors
    /// `want_initiation`'s `initiation_expired` gate; caller supplies it
    /// since it depends on peer state this module doesn't own).
    pub fn on_want_initiation(&self) {
        if self.is_enabled() {
            self.handshake_retries.store(0, Ordering::Release);
        }
    }

    /// `retry_handshake` callout body (spec §4.5). Returns whether a new
    /// initiation attempt should be made, or `false` if the handshake gave
    /// up and key material should be scheduled for zeroization.
    pub fn retry_handshake_fired(&self) -> bool {
        let retries = self.handshake_retries.fetch_add(1, Ordering::AcqRel) + 1;
        if retries <= MAX_TIMER_HANDSHAKES {
            true
        } else {
            self.send_keepalive.cancel();
            if self.is_enabled() {
                self.zero_key_material
                    .arm(Instant::now() + REJECT_AFTER_TIME * 3);
            }
            false
        }
    }
}
