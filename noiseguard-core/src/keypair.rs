//! A single derived session keypair and the three-slot current/previous/next
//! rotation that holds them per remote (spec §4.1 `begin_session`, "Counter").

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use noiseguard_crypto::{DecryptionKey, EncryptionKey};
use noiseguard_utils::ReplayWindow;
use parking_lot::Mutex;

/// `2^60`: above this send-counter value a session is due for a rekey.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
/// `2^64 - 2^13 - 1`: above this value the keypair is exhausted outright.
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13) - 1;

pub struct Keypair {
    encrypt: EncryptionKey,
    decrypt: DecryptionKey,
    pub is_initiator: bool,
    can_send: AtomicBool,
    created_at: Instant,
    send_counter: AtomicU64,
    recv_window: Mutex<ReplayWindow>,
    pub remote_index: u32,
    pub local_index: u32,
}

impl Keypair {
    pub fn new(
        send_key: noiseguard_crypto::Key,
        recv_key: noiseguard_crypto::Key,
        is_initiator: bool,
        remote_index: u32,
        local_index: u32,
    ) -> Self {
        Self {
            encrypt: EncryptionKey::new(send_key),
            decrypt: DecryptionKey::new(recv_key),
            is_initiator,
            can_send: AtomicBool::new(true),
            created_at: Instant::now(),
            send_counter: AtomicU64::new(0),
            recv_window: Mutex::new(ReplayWindow::new()),
            remote_index,
            local_index,
        }
    }

    pub fn can_send(&self) -> bool {
        self.can_send.load(Ordering::Acquire)
    }

    pub fn mark_unsendable(&self) {
        self.can_send.store(false, Ordering::Release);
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Reserves the next send counter. Returns `None` (and disables further
    /// sends) once the keypair is exhausted.
    pub fn reserve_send_counter(&self) -> Option<u64> {
        let counter = self.send_counter.fetch_add(1, Ordering::AcqRel);
        if counter >= REJECT_AFTER_MESSAGES {
            self.mark_unsendable();
            return None;
        }
        Some(counter)
    }

    pub fn encrypt_in_place(&self, counter: u64, buf: &mut [u8]) -> noiseguard_types::Tag {
        self.encrypt.encrypt(counter, buf)
    }

    /// Validates `counter` against the replay window and, on success, opens
    /// `buf` in place.
    pub fn decrypt_in_place(
        &self,
        counter: u64,
        buf: &mut [u8],
        tag: &noiseguard_types::Tag,
    ) -> Result<(), crate::error::DatapathDrop> {
        if !self
            .recv_window
            .lock()
            .check(counter, REJECT_AFTER_MESSAGES)
        {
            return Err(crate::error::DatapathDrop::CounterReplay);
        }
        self.decrypt
            .decrypt(counter, buf, tag)
            .map_err(|_| crate::error::DatapathDrop::AeadFailure)
    }

    /// §4.1 "Freshness decisions", send side.
    pub fn should_refresh_send(&self) -> bool {
        self.can_send()
            && (self.send_counter.load(Ordering::Acquire) > REKEY_AFTER_MESSAGES
                || (self.is_initiator && self.age() > crate::timers::REKEY_AFTER_TIME))
    }

    /// §4.1 "Freshness decisions", receive side: only the original
    /// initiator rekeys on a receive-side timeout, since the responder has
    /// no transcript to re-derive from on its own.
    pub fn should_refresh_recv(&self) -> bool {
        self.is_initiator && self.age() > crate::timers::REKEY_AFTER_TIME_RECV
    }
}

/// The per-remote three-slot rotation (spec §4.1 `begin_session`).
#[derive(Default)]
pub struct KeypairSlots {
    pub previous: Option<std::sync::Arc<Keypair>>,
    pub current: Option<std::sync::Arc<Keypair>>,
    pub next: Option<std::sync::Arc<Keypair>>,
}

impl KeypairSlots {
    /// Initiator path: the newly derived keypair is immediately usable
    /// because it was derived from a response we just consumed.
    pub fn rotate_initiator(&mut self, new: std::sync::Arc<Keypair>) {
        self.previous = self.next.take().or_else(|| self.current.take());
        self.current = Some(new);
        self.next = None;
    }

    /// Responder path: not usable until a data packet decrypts against it
    /// and confirms the initiator has the key too.
    pub fn rotate_responder(&mut self, new: std::sync::Arc<Keypair>) {
        self.previous = None;
        self.next = Some(new);
    }

    /// §4.1 "Received-with confirmation": promotes `next` on first
    /// successful decrypt against it.
    pub fn confirm_next(&mut self) -> bool {
        let Some(next) = self.next.take() else {
            return false;
        };
        self.previous = self.current.take();
        self.current = Some(next);
        true
    }

    pub fn clear(&mut self) {
        self.previous = None;
        self.current = None;
        self.next = None;
    }
}
