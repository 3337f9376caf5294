//! The five queue roles and the packet descriptor they carry (spec §4.4).
//!
//! `handshake`, `encrypt_parallel`, and `decrypt_parallel` are plain bounded
//! `flume` channels: that's exactly "a mutex, a FIFO, a length" with an
//! async-aware pop, and it's the crate the rest of the workspace already
//! reaches for. The per-peer `staged`/`encrypt_serial`/`decrypt_serial`
//! queues need order-preserving peek-then-pop and drop-oldest-on-overflow,
//! which a channel alone can't give us, so those stay a `Mutex<VecDeque<_>>`
//! with a `Notify` to wake their worker.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::keypair::Keypair;

pub const MAX_QUEUED_HANDSHAKES: usize = 4096;
pub const MAX_QUEUED_PKT: usize = 1024;
pub const MAX_STAGED_PKT: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    Uncrypted,
    Crypted,
    Dead,
}

/// A queued packet. `buf` holds plaintext before encryption, ciphertext
/// (header + AEAD output) after; `state` is the handoff signal between the
/// crypto worker and the serial worker draining the same descriptor off two
/// queues at once.
pub struct PacketDescriptor {
    pub buf: Vec<u8>,
    pub endpoint: Option<SocketAddr>,
    pub keypair: Option<Arc<Keypair>>,
    pub counter: Option<u64>,
    pub family: Option<Family>,
    pub mtu_hint: u16,
    pub state: PacketState,
    /// The peer this descriptor belongs to; inbound decrypt needs it to
    /// check the decrypted inner source against the allowed-IPs table.
    pub peer_id: Option<crate::peer::PeerId>,
    /// Set by `queue_both` to the owning peer's serial queue notifier, so a
    /// crypto worker can wake the right serial worker without needing to
    /// know which peer a descriptor belongs to.
    pub ready_notify: Option<Arc<Notify>>,
}

impl PacketDescriptor {
    pub fn outbound(buf: Vec<u8>, mtu_hint: u16) -> Self {
        Self {
            buf,
            endpoint: None,
            keypair: None,
            counter: None,
            family: None,
            mtu_hint,
            state: PacketState::Uncrypted,
            peer_id: None,
            ready_notify: None,
        }
    }

    pub fn inbound(
        buf: Vec<u8>,
        endpoint: SocketAddr,
        keypair: Arc<Keypair>,
        peer_id: crate::peer::PeerId,
    ) -> Self {
        Self {
            buf,
            endpoint: Some(endpoint),
            keypair: Some(keypair),
            counter: None,
            family: None,
            mtu_hint: 0,
            state: PacketState::Uncrypted,
            peer_id: Some(peer_id),
            ready_notify: None,
        }
    }
}

pub type PacketRef = Arc<Mutex<PacketDescriptor>>;

/// A raw handshake datagram pending the handshake worker (spec §4.4
/// "Inbound pipeline" step 1).
pub struct HandshakeDatagram {
    pub addr: SocketAddr,
    pub buf: Vec<u8>,
}

/// Interface-wide queues: `handshake`, `encrypt_parallel`, `decrypt_parallel`.
pub struct InterfaceQueues {
    pub handshake_tx: flume::Sender<HandshakeDatagram>,
    pub handshake_rx: flume::Receiver<HandshakeDatagram>,
    pub encrypt_parallel_tx: flume::Sender<PacketRef>,
    pub encrypt_parallel_rx: flume::Receiver<PacketRef>,
    pub decrypt_parallel_tx: flume::Sender<PacketRef>,
    pub decrypt_parallel_rx: flume::Receiver<PacketRef>,
}

impl Default for InterfaceQueues {
    fn default() -> Self {
        let (handshake_tx, handshake_rx) = flume::bounded(MAX_QUEUED_HANDSHAKES);
        let (encrypt_parallel_tx, encrypt_parallel_rx) = flume::bounded(MAX_QUEUED_PKT);
        let (decrypt_parallel_tx, decrypt_parallel_rx) = flume::bounded(MAX_QUEUED_PKT);
        Self {
            handshake_tx,
            handshake_rx,
            encrypt_parallel_tx,
            encrypt_parallel_rx,
            decrypt_parallel_tx,
            decrypt_parallel_rx,
        }
    }
}

/// A bounded order-preserving per-peer queue. `staged` drops the oldest
/// entry on overflow; `encrypt_serial`/`decrypt_serial` reuse the same type
/// since admission to them is already gated by `queue_both`.
pub struct SerialQueue {
    inner: Mutex<VecDeque<PacketRef>>,
    cap: usize,
    pub notify: Arc<Notify>,
}

impl SerialQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap.min(64))),
            cap,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_room(&self) -> bool {
        self.len() < self.cap
    }

    /// Pushes if there's room. Returns `false` if the queue is full.
    pub fn try_push(&self, pkt: PacketRef) -> bool {
        let mut guard = self.inner.lock();
        if guard.len() >= self.cap {
            return false;
        }
        guard.push_back(pkt);
        drop(guard);
        self.notify.notify_one();
        true
    }

    /// Pushes, evicting the oldest entry first if full (`staged`'s
    /// overflow policy).
    pub fn push_drop_oldest(&self, pkt: PacketRef) {
        let mut guard = self.inner.lock();
        if guard.len() >= self.cap {
            guard.pop_front();
        }
        guard.push_back(pkt);
        drop(guard);
        self.notify.notify_one();
    }

    /// Atomically empties the queue, returning everything that was in it
    /// (`peer_send_staged`'s "atomically delist").
    pub fn drain_all(&self) -> Vec<PacketRef> {
        self.inner.lock().drain(..).collect()
    }

    /// Pops the head only if it is no longer `Uncrypted`; otherwise leaves
    /// it in place and returns `None` (the serial worker's wait-for-ready).
    pub fn pop_ready(&self) -> Option<PacketRef> {
        let mut guard = self.inner.lock();
        match guard.front() {
            Some(pkt) if pkt.lock().state != PacketState::Uncrypted => guard.pop_front(),
            _ => None,
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Per-peer queues: `staged`, `encrypt_serial`, `decrypt_serial`.
pub struct PeerQueues {
    pub staged: Arc<SerialQueue>,
    pub encrypt_serial: Arc<SerialQueue>,
    pub decrypt_serial: Arc<SerialQueue>,
}

impl Default for PeerQueues {
    fn default() -> Self {
        Self {
            staged: Arc::new(SerialQueue::new(MAX_STAGED_PKT)),
            encrypt_serial: Arc::new(SerialQueue::new(MAX_QUEUED_PKT)),
            decrypt_serial: Arc::new(SerialQueue::new(MAX_QUEUED_PKT)),
        }
    }
}

/// Inserts `pkt` onto both `parallel` (a channel) and `serial` (the peer's
/// ordered queue) only if both currently have room (spec §4.4 `queue_both`).
pub fn queue_both(
    parallel: &flume::Sender<PacketRef>,
    serial: &Arc<SerialQueue>,
    pkt: PacketRef,
) -> bool {
    if parallel.is_full() || !serial.has_room() {
        return false;
    }
    pkt.lock().ready_notify = Some(serial.notify.clone());
    if !serial.try_push(pkt.clone()) {
        return false;
    }
    if parallel.try_send(pkt.clone()).is_err() {
        // Room check raced with another producer; undo the serial admission
        // rather than leave a descriptor parked there forever.
        serial_remove(serial, &pkt);
        return false;
    }
    true
}

/// Best-effort removal used only by `queue_both`'s backoff path above.
fn serial_remove(serial: &SerialQueue, pkt: &PacketRef) {
    let mut guard = serial.inner.lock();
    if let Some(pos) = guard.iter().rposition(|p| Arc::ptr_eq(p, pkt)) {
        guard.remove(pos);
    }
}
