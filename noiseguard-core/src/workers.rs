//! Worker-pool bodies for the five queue roles (spec §4.4).
//!
//! Dispatch across the `N` crypto workers rides on plain `flume`: cloning a
//! receiver and awaiting it concurrently from several tasks already gives
//! the "whichever worker is free next" distribution the spec's manual
//! last-CPU round-robin counter is there to approximate, without needing an
//! unsynchronized counter of our own.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use noiseguard_crypto::HasMac;
use noiseguard_types::{CookieMessage, DataHeader, HandshakeInit, HandshakeResp, Tag};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use zerocopy::{AsBytes, FromBytes};

use crate::device::{DatapathIo, Device};
use crate::handshake;
use crate::identity::IndexEntry;
use crate::peer::PeerId;
use crate::queue::{Family, PacketState};

const UNDERLOAD_PROBE: usize = crate::queue::MAX_QUEUED_HANDSHAKES / 8;
const UNDERLOAD_TIMEOUT: Duration = Duration::from_secs(1);

/// Latches `is_underload` true for `UNDERLOAD_TIMEOUT` past the last
/// instant the handshake queue looked congested (spec §9 "`is_underload`
/// latch": never replace with a purely instantaneous check).
#[derive(Default)]
struct UnderloadLatch {
    until: Mutex<Option<Instant>>,
}

impl UnderloadLatch {
    fn probe(&self, queue_len: usize, now: Instant) -> bool {
        if queue_len >= UNDERLOAD_PROBE {
            *self.until.lock() = Some(now + UNDERLOAD_TIMEOUT);
            return true;
        }
        matches!(*self.until.lock(), Some(t) if t > now)
    }
}

/// Spawns the interface-wide handshake worker and `N = num_cpus` encrypt
/// and decrypt workers. Per-peer serial workers are spawned separately, one
/// pair per peer, by [`spawn_peer_workers`].
pub fn spawn_workers<IO: DatapathIo>(device: Arc<Device<IO>>) {
    tokio::spawn(handshake_worker(device.clone()));
    for _ in 0..num_cpus::get().max(1) {
        tokio::spawn(encrypt_worker(device.clone()));
        tokio::spawn(decrypt_worker(device.clone()));
    }
}

/// Spawns `peer`'s serial-out and serial-in workers. Call once per peer,
/// right after `Device::add_peer` (spec: "pinned to one randomly chosen
/// worker taskqueue at peer creation" — here, just its own tokio task).
pub fn spawn_peer_workers<IO: DatapathIo>(device: Arc<Device<IO>>, peer_id: PeerId) {
    tokio::spawn(serial_out_worker(device.clone(), peer_id));
    tokio::spawn(serial_in_worker(device, peer_id));
}

async fn handshake_worker<IO: DatapathIo>(device: Arc<Device<IO>>) {
    let latch = UnderloadLatch::default();
    while let Ok(datagram) = device.queues.handshake_rx.recv_async().await {
        let queue_len = device.queues.handshake_rx.len();
        let under_load = latch.probe(queue_len, Instant::now());
        handle_handshake_datagram(&device, datagram.addr, datagram.buf, under_load).await;
    }
}

async fn handle_handshake_datagram<IO: DatapathIo>(
    device: &Arc<Device<IO>>,
    addr: std::net::SocketAddr,
    mut buf: Vec<u8>,
    under_load: bool,
) {
    let Some(private) = device.identity.private_key() else {
        return;
    };
    let msg_type = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let mut rng = OsRng;
    let family = if addr.is_ipv4() { Family::V4 } else { Family::V6 };

    match msg_type {
        noiseguard_types::MSG_FIRST => {
            let Some(init) = HandshakeInit::mut_from(&mut buf[..]) else { return };
            match device.checker.verify(init, under_load, addr, &mut rng) {
                Err(_) => {}
                Ok(Some(cookie)) => {
                    send_cookie_reply(device, addr, family, init.sender.get(), init.get_mac1(), cookie, &mut rng)
                }
                Ok(None) => {
                    let initiator = noiseguard_crypto::StaticInitiatorConfig::new(private);
                    let lookup = |k: &noiseguard_crypto::NoisePublicKey| device.peer_by_public(k);
                    let Ok(peer) = handshake::consume_initiation(&device.identity, &initiator, init, lookup, &mut rng)
                    else {
                        return;
                    };
                    *peer.endpoint.write() = Some(addr);
                    if let Ok((resp, _kp)) = handshake::create_response(&device.identity, &peer, init, &mut rng) {
                        if device.io.send_datagram(family, addr, resp.as_bytes()) {
                            device.counters.opackets.add(1);
                        }
                    }
                }
            }
        }
        noiseguard_types::MSG_SECOND => {
            let Some(resp) = HandshakeResp::mut_from(&mut buf[..]) else { return };
            match device.checker.verify(resp, under_load, addr, &mut rng) {
                Err(_) => {}
                Ok(Some(cookie)) => {
                    send_cookie_reply(device, addr, family, resp.sender.get(), resp.get_mac1(), cookie, &mut rng)
                }
                Ok(None) => {
                    let Some(IndexEntry::Handshake(peer_id)) = device.identity.lookup_index(resp.receiver.get())
                    else {
                        return;
                    };
                    let Some(peer) = device.peer(peer_id) else { return };
                    let initiator = noiseguard_crypto::StaticInitiatorConfig::new(private);
                    if handshake::consume_response(&device.identity, &initiator, &peer, resp).is_ok() {
                        *peer.endpoint.write() = Some(addr);
                        if let Some(queues) = device.peer_queues_handle(peer_id) {
                            device.peer_send_staged(&peer, &queues);
                        }
                    }
                }
            }
        }
        noiseguard_types::MSG_COOKIE => {
            let Some(msg) = CookieMessage::mut_from(&mut buf[..]) else { return };
            let Some(IndexEntry::Handshake(peer_id) | IndexEntry::Keypair(peer_id, _)) =
                device.identity.lookup_index(msg.receiver.get())
            else {
                return;
            };
            let Some(peer) = device.peer(peer_id) else { return };
            let _ = peer.maker.consume_cookie_reply(msg.cookie, &msg.nonce);
        }
        _ => {}
    }
}

fn send_cookie_reply<IO: DatapathIo>(
    device: &Arc<Device<IO>>,
    addr: std::net::SocketAddr,
    family: Family,
    receiver_index: u32,
    aad_mac1: &noiseguard_types::Mac,
    cookie: noiseguard_types::Cookie,
    rng: &mut OsRng,
) {
    use rand_core::RngCore;
    let mut nonce = [0u8; 24];
    rng.fill_bytes(&mut nonce);
    let encrypted = noiseguard_crypto::encrypt_cookie(cookie, device.checker.cookie_key(), &nonce, aad_mac1);
    let mut reply = [0u8; 64];
    reply[0..4].copy_from_slice(&noiseguard_types::MSG_COOKIE.to_le_bytes());
    reply[4..8].copy_from_slice(&receiver_index.to_le_bytes());
    reply[8..32].copy_from_slice(&nonce);
    reply[32..64].copy_from_slice(encrypted.as_bytes());
    device.io.send_datagram(family, addr, &reply);
}

async fn encrypt_worker<IO: DatapathIo>(device: Arc<Device<IO>>) {
    while let Ok(pkt) = device.queues.encrypt_parallel_rx.recv_async().await {
        let ready_notify = {
            let mut guard = pkt.lock();
            let notify = guard.ready_notify.clone();
            let ready = match (guard.keypair.clone(), guard.counter) {
                (Some(kp), Some(counter)) => Some((kp, counter)),
                _ => None,
            };
            let Some((kp, counter)) = ready else {
                guard.state = PacketState::Dead;
                drop(guard);
                if let Some(n) = notify {
                    n.notify_one();
                }
                continue;
            };

            let pad_to = guard.buf.len().next_multiple_of(16);
            guard.buf.resize(pad_to, 0);
            let tag: Tag = kp.encrypt_in_place(counter, &mut guard.buf);

            let mut framed = Vec::with_capacity(16 + guard.buf.len() + 16);
            let header = DataHeader {
                msg_type: noiseguard_types::MSG_DATA.into(),
                receiver: kp.remote_index.into(),
                counter: counter.into(),
            };
            framed.extend_from_slice(header.as_bytes());
            framed.append(&mut guard.buf);
            framed.extend_from_slice(&tag.0);
            guard.buf = framed;
            guard.state = PacketState::Crypted;
            notify
        };
        if let Some(n) = ready_notify {
            n.notify_one();
        }
    }
}

async fn decrypt_worker<IO: DatapathIo>(device: Arc<Device<IO>>) {
    while let Ok(pkt) = device.queues.decrypt_parallel_rx.recv_async().await {
        let ready_notify = {
            let mut guard = pkt.lock();
            let notify = guard.ready_notify.clone();
            let Some(kp) = guard.keypair.clone() else {
                guard.state = PacketState::Dead;
                drop(guard);
                if let Some(n) = notify {
                    n.notify_one();
                }
                continue;
            };
            if guard.buf.len() < 32 {
                guard.state = PacketState::Dead;
                drop(guard);
                if let Some(n) = notify {
                    n.notify_one();
                }
                continue;
            }

            let counter = u64::from_le_bytes(guard.buf[8..16].try_into().unwrap());
            let tag = Tag(guard.buf[guard.buf.len() - 16..].try_into().unwrap());
            let body_end = guard.buf.len() - 16;
            let mut plaintext = guard.buf[16..body_end].to_vec();

            match kp.decrypt_in_place(counter, &mut plaintext, &tag) {
                Ok(()) => {
                    let accepted = plaintext.is_empty() || check_inner_source(&device, &plaintext, guard.peer_id);
                    guard.buf = plaintext;
                    guard.state = if accepted { PacketState::Crypted } else { PacketState::Dead };
                }
                Err(_) => {
                    guard.state = PacketState::Dead;
                    device.counters.ierrors.add(1);
                }
            }
            notify
        };
        if let Some(n) = ready_notify {
            n.notify_one();
        }
    }
}

fn check_inner_source<IO: DatapathIo>(device: &Arc<Device<IO>>, plaintext: &[u8], expected: Option<PeerId>) -> bool {
    let Some(expected) = expected else { return false };
    let Some(src) = parse_inner_source(plaintext) else {
        return false;
    };
    device.allowed_ips.read().longest_match(src) == Some(expected)
}

fn parse_inner_source(buf: &[u8]) -> Option<IpAddr> {
    if buf.is_empty() {
        return None;
    }
    match buf[0] >> 4 {
        4 if buf.len() >= 20 => Some(IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]))),
        6 if buf.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[8..24]);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Serial-out worker (spec §4.4 "Outbound pipeline" step 4): drains
/// `peer`'s `encrypt_serial` queue strictly in order, sending only packets
/// that made it to `CRYPTED`.
async fn serial_out_worker<IO: DatapathIo>(device: Arc<Device<IO>>, peer_id: PeerId) {
    loop {
        let Some(peer) = device.peer(peer_id) else { return };
        let Some(queues) = device.peer_queues_handle(peer_id) else { return };
        queues.encrypt_serial.notify.notified().await;

        while let Some(pkt) = queues.encrypt_serial.pop_ready() {
            let guard = pkt.lock();
            if guard.state != PacketState::Crypted {
                device.counters.oerrors.add(1);
                continue;
            }
            let Some(addr) = *peer.endpoint.read() else {
                device.counters.oerrors.add(1);
                continue;
            };
            let family = if addr.is_ipv4() { Family::V4 } else { Family::V6 };
            let is_keepalive = guard.buf.len() <= 32;
            let kp = guard.keypair.clone();
            let len = guard.buf.len() as u64;
            let sent = device.io.send_datagram(family, addr, &guard.buf);
            drop(guard);

            if sent {
                device.counters.opackets.add(1);
                device.counters.obytes.add(len);
                peer.add_tx(len);
                if !is_keepalive {
                    peer.timers.on_data_sent();
                }
                peer.timers.on_any_authenticated_packet_sent();
                peer.timers.on_any_authenticated_packet_traversal();
                if kp.is_some_and(|k| k.should_refresh_send()) {
                    peer.timers.on_want_initiation();
                }
            } else {
                device.counters.oerrors.add(1);
            }
        }
    }
}

/// Serial-in worker (spec §4.4 "Inbound pipeline" step 3).
async fn serial_in_worker<IO: DatapathIo>(device: Arc<Device<IO>>, peer_id: PeerId) {
    loop {
        let Some(peer) = device.peer(peer_id) else { return };
        let Some(queues) = device.peer_queues_handle(peer_id) else { return };
        queues.decrypt_serial.notify.notified().await;

        while let Some(pkt) = queues.decrypt_serial.pop_ready() {
            let guard = pkt.lock();
            if guard.state != PacketState::Crypted {
                device.counters.ierrors.add(1);
                continue;
            }
            let plaintext = guard.buf.clone();
            let kp = guard.keypair.clone();
            let addr = guard.endpoint;
            drop(guard);

            if peer.keypairs.lock().confirm_next() {
                peer.timers.on_handshake_complete();
            }
            peer.timers.on_any_authenticated_packet_received();
            peer.timers.on_any_authenticated_packet_traversal();
            if let Some(addr) = addr {
                *peer.endpoint.write() = Some(addr);
            }

            device.counters.ipackets.add(1);
            device.counters.ibytes.add(plaintext.len() as u64);
            peer.add_rx(plaintext.len() as u64);

            if !plaintext.is_empty() {
                device.io.inject_l3(peer_id, &plaintext);
            }
            if kp.is_some_and(|k| k.should_refresh_recv()) {
                peer.timers.on_want_initiation();
            }
        }
    }
}
