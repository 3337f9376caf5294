//! A remote peer: identity, handshake transcript, keypair slots, counters,
//! and the bits the timer state machine and queues hang off of (spec §3
//! "Remote/peer").

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Instant;

use noiseguard_crypto::{HandshakeState, NoisePublicKey as PublicKey};
use parking_lot::{Mutex, RwLock};

use crate::cookie::Maker;
use crate::keypair::KeypairSlots;
use crate::timers::PeerTimers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Dead,
    Initiator,
    Responder,
}

/// In-flight handshake transcript plus the bookkeeping needed to reject
/// replayed or flooded initiations (spec §4.1 "Consume initiation").
#[derive(Default)]
pub struct HandshakeSlot {
    pub role: Option<HandshakeRole>,
    pub state: Option<HandshakeState>,
    pub ephemeral: Option<x25519_dalek::StaticSecret>,
    pub local_index: u32,
    pub remote_index: u32,
    pub last_timestamp: Option<[u8; 12]>,
}

impl HandshakeSlot {
    pub fn clear(&mut self) {
        self.role = None;
        self.state = None;
        self.ephemeral = None;
    }
}

pub struct Peer {
    pub id: PeerId,
    pub public_key: PublicKey,
    pub static_static: RwLock<[u8; 32]>,
    pub preshared_key: noiseguard_crypto::Key,
    pub description: RwLock<String>,

    pub handshake: Mutex<HandshakeSlot>,
    pub keypairs: Mutex<KeypairSlots>,
    pub maker: Maker,

    pub last_sent_initiation: Mutex<Option<Instant>>,
    pub last_received_initiation: Mutex<Option<Instant>>,

    pub persistent_keepalive_interval: AtomicU16,
    pub endpoint: RwLock<Option<SocketAddr>>,

    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub last_handshake: RwLock<Option<std::time::SystemTime>>,

    pub timers: PeerTimers,
}

impl Peer {
    pub fn new(id: PeerId, public_key: PublicKey, preshared_key: Option<noiseguard_crypto::Key>) -> Self {
        Self {
            id,
            public_key,
            static_static: RwLock::new([0; 32]),
            preshared_key: preshared_key.unwrap_or_default(),
            description: RwLock::new(String::new()),
            handshake: Mutex::new(HandshakeSlot::default()),
            keypairs: Mutex::new(KeypairSlots::default()),
            maker: Maker::new(&public_key),
            last_sent_initiation: Mutex::new(None),
            last_received_initiation: Mutex::new(None),
            persistent_keepalive_interval: AtomicU16::new(0),
            endpoint: RwLock::new(None),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake: RwLock::new(None),
            timers: PeerTimers::default(),
        }
    }

    pub fn add_tx(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_rx(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn current_keypair(&self) -> Option<std::sync::Arc<crate::keypair::Keypair>> {
        self.keypairs.lock().current.clone()
    }

    pub fn static_peer_config(&self) -> noiseguard_crypto::StaticPeerConfig {
        noiseguard_crypto::StaticPeerConfig::new(self.public_key, Some(self.preshared_key))
    }

    /// §4.1 "Create initiation" precondition: last-sent initiation older
    /// than `REKEY_TIMEOUT`.
    pub fn initiation_expired(&self, rekey_timeout: std::time::Duration) -> bool {
        match *self.last_sent_initiation.lock() {
            None => true,
            Some(t) => t.elapsed() > rekey_timeout,
        }
    }
}
