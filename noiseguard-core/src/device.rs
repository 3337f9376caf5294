//! Ties a local [`Identity`], a peer set, the allowed-IPs table, the cookie
//! checker, and the queues from [`crate::queue`] together into the
//! interface-wide object the datapath pipeline (§4.4) and the timer sweep
//! (§4.5) both operate on.
//!
//! Socket binds and TUN file descriptors are deliberately not here (spec §1
//! treats them as external collaborators): `Device` only needs a
//! [`DatapathIo`] implementation to hand ciphertext to a socket and
//! plaintext to the L3 stack.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use ip_network::IpNetwork;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use zerocopy::AsBytes;

use crate::allowed_ips::AllowedIps;
use crate::cookie::Checker;
use crate::error::{ConfigError, DatapathDrop};
use crate::handshake;
use crate::identity::{self, Identity, IndexEntry};
use crate::peer::{HandshakeRole, Peer, PeerId};
use crate::queue::{
    queue_both, Family, HandshakeDatagram, InterfaceQueues, PacketDescriptor, PacketRef, PacketState,
};
use crate::timers::DueCallout;

/// `if_wg.c`'s `wg_mtu`: `1 <= mtu <= IF_MAXMTU - 80`. We don't have a real
/// link MTU ceiling to mirror, so `IF_MAXMTU` stands in at 65535.
pub const MAX_MTU: u32 = 65535 - 80;
const MAX_LOOPS: u32 = 8;

/// A small fixed-size bank of per-shard counters summed on read, modeled
/// after the original's `counters_pcpu` array rather than a single
/// contended atomic (SPEC_FULL "Per-CPU counters as a real type").
#[derive(Default)]
pub struct PerCpuCounter {
    shards: Vec<AtomicU64>,
}

impl PerCpuCounter {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn shard(&self) -> &AtomicU64 {
        // Thread-local shard id isn't available without std::thread_local
        // boilerplate this crate has no other use for; hash the current
        // thread id instead, which spreads writers just as well.
        let tid = std::thread::current().id();
        let idx = format!("{tid:?}").bytes().fold(0usize, |a, b| a.wrapping_add(b as usize));
        &self.shards[idx % self.shards.len()]
    }

    pub fn add(&self, n: u64) {
        self.shard().fetch_add(n, Ordering::Relaxed);
    }

    pub fn sum(&self) -> u64 {
        self.shards.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }
}

#[derive(Default)]
pub struct InterfaceCounters {
    pub opackets: PerCpuCounter,
    pub obytes: PerCpuCounter,
    pub oerrors: PerCpuCounter,
    pub ipackets: PerCpuCounter,
    pub ibytes: PerCpuCounter,
    pub ierrors: PerCpuCounter,
}

impl InterfaceCounters {
    fn new(shards: usize) -> Self {
        Self {
            opackets: PerCpuCounter::new(shards),
            obytes: PerCpuCounter::new(shards),
            oerrors: PerCpuCounter::new(shards),
            ipackets: PerCpuCounter::new(shards),
            ibytes: PerCpuCounter::new(shards),
            ierrors: PerCpuCounter::new(shards),
        }
    }
}

/// The external collaborators §1 carves out: a datagram send primitive and
/// an L3 inject primitive. `noiseguard-tun` provides the real
/// socket/TUN-backed implementation; tests use an in-memory one.
pub trait DatapathIo: Send + Sync + 'static {
    fn send_datagram(&self, family: Family, addr: SocketAddr, buf: &[u8]) -> bool;
    fn inject_l3(&self, peer: PeerId, buf: &[u8]);
}

pub struct Device<IO: DatapathIo> {
    pub identity: Identity,
    pub allowed_ips: RwLock<AllowedIps>,
    pub checker: Checker,
    pub queues: InterfaceQueues,
    pub counters: InterfaceCounters,
    pub io: Arc<IO>,

    peers: RwLock<AHashMap<PeerId, Arc<Peer>>>,
    peer_queues: RwLock<AHashMap<PeerId, Arc<crate::queue::PeerQueues>>>,
    next_peer_id: AtomicU32,
    mtu: AtomicU32,
    port: AtomicU32,
    fwmark: RwLock<Option<u32>>,
    loop_tag: u64,
}

impl<IO: DatapathIo> Device<IO> {
    pub fn new(io: Arc<IO>) -> Self {
        let mut rng = OsRng;
        let dummy_public = noiseguard_crypto::NoisePublicKey::from([0u8; 32]);
        Self {
            identity: Identity::default(),
            allowed_ips: RwLock::new(AllowedIps::new()),
            checker: Checker::new(&dummy_public, &mut rng),
            queues: InterfaceQueues::default(),
            counters: InterfaceCounters::new(num_cpus::get()),
            io,
            peers: RwLock::new(AHashMap::new()),
            peer_queues: RwLock::new(AHashMap::new()),
            next_peer_id: AtomicU32::new(1),
            mtu: AtomicU32::new(1420),
            port: AtomicU32::new(0),
            fwmark: RwLock::new(None),
            loop_tag: rand::random(),
        }
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port as u32, Ordering::Relaxed);
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed) as u16
    }

    /// `SO_MARK`/`SO_USER_COOKIE` mirror (SPEC_FULL "Socket option
    /// mirroring"): stored here so `get_config` can report it, applied to
    /// the real socket by `noiseguard-tun`.
    pub fn set_fwmark(&self, mark: Option<u32>) {
        *self.fwmark.write() = mark;
    }

    pub fn fwmark(&self) -> Option<u32> {
        *self.fwmark.read()
    }

    /// Re-derives the cookie checker's keys; call after `set_private_key`
    /// changes the local identity (the key depends on the local public key).
    pub fn set_private_key(&self, key: noiseguard_crypto::NoiseStaticSecret) {
        self.identity.set_private_key(key);
        let peers: Vec<_> = self.peers.read().values().cloned().collect();
        identity::recompute_all_ss(&self.identity, &peers);
    }

    pub fn set_mtu(&self, mtu: u32) -> Result<(), ConfigError> {
        if mtu == 0 || mtu > MAX_MTU {
            return Err(ConfigError::InvalidMtu { max: MAX_MTU });
        }
        self.mtu.store(mtu, Ordering::Relaxed);
        Ok(())
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    pub fn add_peer(&self, public_key: noiseguard_crypto::NoisePublicKey, preshared_key: Option<noiseguard_crypto::Key>) -> Arc<Peer> {
        let id = PeerId(self.next_peer_id.fetch_add(1, Ordering::Relaxed) as u64);
        let peer = Arc::new(Peer::new(id, public_key, preshared_key));
        if let Some(private) = self.identity.private_key() {
            *peer.static_static.write() = identity::precompute_ss(&private, &public_key);
        }
        self.identity.register_peer_public(public_key, id);
        self.peers.write().insert(id, peer.clone());
        self.peer_queues
            .write()
            .insert(id, Arc::new(crate::queue::PeerQueues::default()));
        peer
    }

    pub fn remove_peer(&self, id: PeerId) {
        if let Some(peer) = self.peers.write().remove(&id) {
            self.identity.forget_peer_public(&peer.public_key);
        }
        self.allowed_ips.write().remove_all(id);
        self.peer_queues.write().remove(&id);
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    pub fn peer_by_public(&self, public: &noiseguard_crypto::NoisePublicKey) -> Option<Arc<Peer>> {
        let id = self.identity.peer_by_public(public)?;
        self.peer(id)
    }

    pub fn add_allowed_ip(&self, peer: PeerId, net: IpNetwork) {
        self.allowed_ips.write().insert(peer, net);
    }

    fn peer_queues(&self, id: PeerId) -> Option<Arc<crate::queue::PeerQueues>> {
        self.peer_queues.read().get(&id).cloned()
    }

    /// Public handle to a peer's queues, used by [`crate::workers`]'s
    /// per-peer serial workers.
    pub fn peer_queues_handle(&self, id: PeerId) -> Option<Arc<crate::queue::PeerQueues>> {
        self.peer_queues(id)
    }

    /// Outbound §4.4 step 1: L3 hands us a plaintext packet plus its
    /// destination address (already demultiplexed from whatever framing the
    /// TUN layer uses).
    pub fn send_outbound(&self, dest: IpAddr, plaintext: Vec<u8>) -> Result<(), DatapathDrop> {
        let peer_id = self
            .allowed_ips
            .read()
            .longest_match(dest)
            .ok_or(DatapathDrop::NoRoute)?;
        let peer = self.peer(peer_id).ok_or(DatapathDrop::NoRoute)?;
        if peer.endpoint.read().is_none() {
            return Err(DatapathDrop::NoEndpoint);
        }
        let queues = self.peer_queues(peer_id).ok_or(DatapathDrop::NoRoute)?;

        let mtu = self.mtu().min(65535) as u16;
        let pkt: PacketRef = Arc::new(parking_lot::Mutex::new(PacketDescriptor::outbound(plaintext, mtu)));
        queues.staged.push_drop_oldest(pkt);
        self.peer_send_staged(&peer, &queues);
        Ok(())
    }

    /// §4.4 `peer_send_staged`.
    pub fn peer_send_staged(&self, peer: &Arc<Peer>, queues: &crate::queue::PeerQueues) {
        let staged = queues.staged.drain_all();
        if staged.is_empty() {
            return;
        }
        let Some(kp) = peer.current_keypair().filter(|k| k.can_send()) else {
            for pkt in staged {
                queues.staged.push_drop_oldest(pkt);
            }
            peer.timers.on_want_initiation();
            return;
        };

        for pkt in staged {
            let Some(counter) = kp.reserve_send_counter() else {
                // Exhausted mid-batch: re-enlist everything left and bail,
                // matching the spec's "any reservation fails" rollback.
                queues.staged.push_drop_oldest(pkt);
                peer.timers.on_want_initiation();
                return;
            };
            {
                let mut guard = pkt.lock();
                guard.keypair = Some(kp.clone());
                guard.counter = Some(counter);
            }
            if !queue_both(&self.queues.encrypt_parallel_tx, &queues.encrypt_serial, pkt) {
                self.counters.oerrors.add(1);
            }
        }
    }

    /// Inbound §4.4 step 1: the UDP upcall hands us one datagram.
    pub fn recv_datagram(&self, addr: SocketAddr, buf: Vec<u8>) -> Result<(), DatapathDrop> {
        if buf.len() < 4 {
            return Ok(());
        }
        let msg_type = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        match msg_type {
            noiseguard_types::MSG_FIRST if buf.len() == core::mem::size_of::<noiseguard_types::HandshakeInit>() => {
                self.enqueue_handshake(addr, buf)
            }
            noiseguard_types::MSG_SECOND if buf.len() == core::mem::size_of::<noiseguard_types::HandshakeResp>() => {
                self.enqueue_handshake(addr, buf)
            }
            noiseguard_types::MSG_COOKIE if buf.len() == core::mem::size_of::<noiseguard_types::CookieMessage>() => {
                self.enqueue_handshake(addr, buf)
            }
            noiseguard_types::MSG_DATA if buf.len() >= 32 => self.recv_data(addr, buf),
            _ => Ok(()),
        }
    }

    fn enqueue_handshake(&self, addr: SocketAddr, buf: Vec<u8>) -> Result<(), DatapathDrop> {
        self.queues
            .handshake_tx
            .try_send(HandshakeDatagram { addr, buf })
            .map_err(|_| DatapathDrop::QueueFull)
    }

    fn recv_data(&self, addr: SocketAddr, buf: Vec<u8>) -> Result<(), DatapathDrop> {
        let receiver = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let entry = self
            .identity
            .lookup_index(receiver)
            .ok_or(DatapathDrop::UnknownReceiverIndex)?;
        let IndexEntry::Keypair(peer_id, kp) = entry else {
            return Err(DatapathDrop::UnknownReceiverIndex);
        };
        let Some(peer) = self.peer(peer_id) else {
            return Err(DatapathDrop::UnknownReceiverIndex);
        };
        let Some(queues) = self.peer_queues(peer_id) else {
            return Err(DatapathDrop::UnknownReceiverIndex);
        };

        let pkt: PacketRef = Arc::new(parking_lot::Mutex::new(PacketDescriptor::inbound(buf, addr, kp, peer_id)));
        if !queue_both(&self.queues.decrypt_parallel_tx, &queues.decrypt_serial, pkt) {
            self.counters.ierrors.add(1);
        }
        let _ = peer;
        Ok(())
    }

    /// Loop-detection tag carried on re-encapsulated traffic; bounded by
    /// `MAX_LOOPS` (§4.4 step 1). Not wired to any real nested-tunnel path
    /// yet since this crate has no routing-through-self reentry, but kept
    /// so `noiseguard-tun` has a stable counter to stamp.
    pub fn loop_tag(&self) -> u64 {
        self.loop_tag
    }

    pub const MAX_LOOPS: u32 = MAX_LOOPS;

    /// One sweep of every peer's timer callouts; `noiseguard-tun` drives
    /// this from a periodic tick (teacher's `tokio::time::interval`
    /// pattern in its demo binary).
    pub fn tick_timers(&self) {
        let peers: Vec<_> = self.peers.read().values().cloned().collect();
        let now = std::time::Instant::now();
        for peer in &peers {
            let Some(queues) = self.peer_queues(peer.id) else {
                continue;
            };
            for due in peer.timers.due(now) {
                self.fire_callout(peer, &queues, due);
            }
        }
    }

    fn fire_callout(&self, peer: &Arc<Peer>, queues: &crate::queue::PeerQueues, due: DueCallout) {
        match due {
            DueCallout::NewHandshake => self.want_initiation(peer),
            DueCallout::RetryHandshake => {
                if peer.timers.retry_handshake_fired() {
                    self.want_initiation(peer);
                } else {
                    queues.staged.clear();
                }
            }
            DueCallout::SendKeepalive => self.emit_keepalive(peer, queues),
            DueCallout::PersistentKeepalive => {
                if peer.timers.persistent_keepalive_interval.load(Ordering::Acquire) > 0 {
                    self.emit_keepalive(peer, queues);
                }
            }
            DueCallout::ZeroKeyMaterial => peer.keypairs.lock().clear(),
        }
    }

    fn emit_keepalive(&self, peer: &Arc<Peer>, queues: &crate::queue::PeerQueues) {
        if queues.staged.is_empty() {
            let pkt = Arc::new(parking_lot::Mutex::new(PacketDescriptor::outbound(Vec::new(), self.mtu() as u16)));
            queues.staged.push_drop_oldest(pkt);
        }
        self.peer_send_staged(peer, queues);
    }

    fn want_initiation(&self, peer: &Arc<Peer>) {
        peer.timers.on_want_initiation();
        if !peer.initiation_expired(handshake::REKEY_TIMEOUT) {
            return;
        }
        let Some(private) = self.identity.private_key() else {
            return;
        };
        let initiator = noiseguard_crypto::StaticInitiatorConfig::new(private);
        let mut rng = OsRng;
        if let Ok(msg) = handshake::create_initiation(&self.identity, &initiator, peer, &mut rng) {
            if let Some(addr) = *peer.endpoint.read() {
                let family = if addr.is_ipv4() { Family::V4 } else { Family::V6 };
                if self.io.send_datagram(family, addr, msg.as_bytes()) {
                    self.counters.opackets.add(1);
                }
            }
        }
    }
}
