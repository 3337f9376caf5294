//! Drives the Noise_IKpsk2 exchange end to end: create/consume initiation,
//! create/consume response, and `begin_session` (spec §4.1).

use std::sync::Arc;
use std::time::{Duration, Instant};

use noiseguard_crypto::{
    decrypt_handshake_init, decrypt_handshake_resp, encrypt_handshake_init, encrypt_handshake_resp,
    CryptoError, HandshakeState, HasMac, StaticInitiatorConfig, StaticPeerConfig,
};
use noiseguard_types::{HandshakeInit, HandshakeResp};
use rand_core::{CryptoRng, RngCore};
use tai64::Tai64N;
use x25519_dalek::StaticSecret;

use crate::identity::Identity;
use crate::keypair::Keypair;
use crate::peer::{HandshakeRole, Peer};

/// `REJECT_INTERVAL = 1/50s` rounded down to a power-of-two nanosecond
/// mask, used to limit timing side channels in the handshake timestamp
/// (spec §9 "TAI64N masking").
const REJECT_INTERVAL_MASK_BITS: u32 = 24; // floor(log2(1e9/50)) == 24

fn masked_now() -> Tai64N {
    let mut bytes = Tai64N::now().to_bytes();
    let nanos = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    let masked = nanos & !((1u32 << REJECT_INTERVAL_MASK_BITS) - 1);
    bytes[8..12].copy_from_slice(&masked.to_be_bytes());
    Tai64N::from_slice(&bytes).expect("12-byte TAI64N round trip")
}

/// Create an initiation. Preconditions (identity present, retry timeout
/// elapsed) are the caller's responsibility (`peer.initiation_expired`).
pub fn create_initiation(
    identity: &Identity,
    initiator: &StaticInitiatorConfig,
    peer: &Arc<Peer>,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<HandshakeInit, CryptoError> {
    let mut hs = HandshakeState::default();
    let esk_i = StaticSecret::random_from_rng(&mut *rng);
    let peer_cfg = StaticPeerConfig::new(peer.public_key, Some(peer.preshared_key));

    let sender = identity.assign_handshake_index(peer.id, rng);
    let cookie = peer.maker.current_cookie();

    let msg = encrypt_handshake_init(&mut hs, initiator, &peer_cfg, &esk_i, masked_now(), sender, cookie.as_ref())?;
    peer.maker.record_mac1(*msg.get_mac1());

    let mut slot = peer.handshake.lock();
    slot.role = Some(HandshakeRole::Initiator);
    slot.state = Some(hs);
    slot.ephemeral = Some(esk_i);
    slot.local_index = sender;
    drop(slot);

    *peer.last_sent_initiation.lock() = Some(Instant::now());
    peer.timers.on_handshake_initiated();

    Ok(msg)
}

/// Consume an initiation whose static key decrypts to a known peer.
/// Returns the matched peer with its handshake slot populated as RESPONDER.
pub fn consume_initiation(
    identity: &Identity,
    receiver: &StaticInitiatorConfig,
    init: &mut HandshakeInit,
    lookup: impl FnOnce(&x25519_dalek::PublicKey) -> Option<Arc<Peer>>,
    rng: &mut impl RngCore,
) -> Result<Arc<Peer>, CryptoError> {
    let mut hs = HandshakeState::default();
    // `decrypt_handshake_init` needs the remote static key to recompute
    // `mix_ss`, but we don't know who the remote is until after decrypting
    // `es`; retry against the real peer's `ss` once identified.
    let decrypted = decrypt_handshake_init(init, &mut hs, receiver)?;
    let remote_static = decrypted.static_key();
    let timestamp = *decrypted.timestamp();
    let sender_idx = decrypted.sender();

    let peer = lookup(&remote_static).ok_or(CryptoError::Rejected)?;

    let stale = {
        let slot = peer.handshake.lock();
        matches!(slot.last_timestamp, Some(prev) if timestamp <= prev)
    };
    if stale {
        return Err(CryptoError::Rejected);
    }
    if let Some(last_recv) = *peer.last_received_initiation.lock() {
        if last_recv.elapsed() < crate::timers::REKEY_TIMEOUT {
            return Err(CryptoError::Rejected);
        }
    }

    let local_index = identity.assign_handshake_index(peer.id, rng);

    let mut slot = peer.handshake.lock();
    slot.role = Some(HandshakeRole::Responder);
    slot.state = Some(hs);
    slot.remote_index = sender_idx;
    slot.local_index = local_index;
    slot.last_timestamp = Some(timestamp);
    drop(slot);

    *peer.last_received_initiation.lock() = Some(Instant::now());

    Ok(peer)
}

/// Create a response to a peer whose handshake slot is RESPONDER.
pub fn create_response(
    identity: &Identity,
    peer: &Arc<Peer>,
    init: &HandshakeInit,
    rng: &mut (impl CryptoRng + RngCore),
) -> Result<(HandshakeResp, Arc<Keypair>), CryptoError> {
    use noiseguard_crypto::DecryptedHandshakeInit;

    let esk_r = StaticSecret::random_from_rng(&mut *rng);
    let peer_cfg = StaticPeerConfig::new(peer.public_key, Some(peer.preshared_key));

    let mut slot = peer.handshake.lock();
    let mut hs = slot.state.take().ok_or(CryptoError::Rejected)?;
    let local_index = slot.local_index;
    let remote_index = slot.remote_index;
    drop(slot);

    let decrypted: &DecryptedHandshakeInit = zerocopy::transmute_ref!(init);

    let resp = encrypt_handshake_resp(&mut hs, decrypted, &esk_r, &peer_cfg, local_index, None)?;
    let (first, second) = hs.split();

    // Responder's (send, recv) is (second, first): the initiator's is
    // (first, second), and the two sides must agree on which derived key
    // is used to send and which to receive.
    let kp = Arc::new(Keypair::new(second, first, false, remote_index, local_index));

    identity.promote_to_keypair(local_index, peer.id, kp.clone());
    let mut slot = peer.handshake.lock();
    slot.clear();
    drop(slot);

    peer.keypairs.lock().rotate_responder(kp.clone());
    peer.timers.on_session_derived();

    Ok((resp, kp))
}

/// Consume a response for a peer whose handshake slot is INITIATOR.
pub fn consume_response(
    identity: &Identity,
    initiator: &StaticInitiatorConfig,
    peer: &Arc<Peer>,
    resp: &mut HandshakeResp,
) -> Result<Arc<Keypair>, CryptoError> {
    let peer_cfg = StaticPeerConfig::new(peer.public_key, Some(peer.preshared_key));

    let mut slot = peer.handshake.lock();
    if slot.role != Some(HandshakeRole::Initiator) {
        return Err(CryptoError::Rejected);
    }
    let mut hs = slot.state.take().ok_or(CryptoError::Rejected)?;
    let esk_i = slot.ephemeral.take().ok_or(CryptoError::Rejected)?;
    let local_index = slot.local_index;
    drop(slot);

    decrypt_handshake_resp(resp, &mut hs, initiator, &peer_cfg, &esk_i)?;
    let (send, recv) = hs.split();

    // Initiator's (send, recv) is (first, second) from the split.
    let kp = Arc::new(Keypair::new(send, recv, true, resp.sender.get(), local_index));

    identity.promote_to_keypair(local_index, peer.id, kp.clone());
    peer.handshake.lock().clear();
    peer.keypairs.lock().rotate_initiator(kp.clone());
    peer.timers.on_handshake_complete();
    peer.timers.on_session_derived();
    *peer.last_handshake.write() = Some(std::time::SystemTime::now());

    Ok(kp)
}

pub const REKEY_TIMEOUT: Duration = crate::timers::REKEY_TIMEOUT;
