//! End-to-end handshake round trip across two independent interfaces
//! (spec §8 scenario 6 "Handshake roles").

use std::sync::Arc;

use noiseguard_core::{handshake, Identity, Peer, PeerId};
use noiseguard_crypto::{NoisePublicKey, NoiseStaticSecret, StaticInitiatorConfig};
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;

struct Side {
    identity: Identity,
    peer: Arc<Peer>,
}

fn make_side(local_secret: StaticSecret, remote_public: NoisePublicKey) -> Side {
    let identity = Identity::default();
    identity.set_private_key(NoiseStaticSecret::from(local_secret.to_bytes()));
    let peer = Arc::new(Peer::new(PeerId(1), remote_public, None));
    Side { identity, peer }
}

#[test]
fn handshake_round_trip_yields_interoperable_keypairs() {
    let mut rng = OsRng;
    let secret_a = StaticSecret::random_from_rng(&mut rng);
    let secret_b = StaticSecret::random_from_rng(&mut rng);
    let public_a = NoisePublicKey::from(&secret_a);
    let public_b = NoisePublicKey::from(&secret_b);

    let a = make_side(secret_a.clone(), public_b);
    let b = make_side(secret_b.clone(), public_a);

    let initiator_cfg_a = StaticInitiatorConfig::new(secret_a);
    let initiator_cfg_b = StaticInitiatorConfig::new(secret_b);

    let mut init = handshake::create_initiation(&a.identity, &initiator_cfg_a, &a.peer, &mut rng)
        .expect("A creates an initiation");

    let peer_a_on_b = b.peer.clone();
    let matched = handshake::consume_initiation(
        &b.identity,
        &initiator_cfg_b,
        &mut init,
        |_static_key| Some(peer_a_on_b.clone()),
        &mut rng,
    )
    .expect("B consumes A's initiation");
    assert!(Arc::ptr_eq(&matched, &b.peer));

    let (mut resp, kp_b) = handshake::create_response(&b.identity, &b.peer, &init, &mut rng)
        .expect("B creates a response");

    let kp_a = handshake::consume_response(&a.identity, &initiator_cfg_a, &a.peer, &mut resp)
        .expect("A consumes B's response");

    // B's keypair starts in `next` until a decrypt against it succeeds.
    assert!(b.peer.keypairs.lock().next.is_some());

    // A → B: encrypt with A's send key, decrypt with B's still-pending key.
    let mut buf = b"hello from A".to_vec();
    let counter = kp_a.reserve_send_counter().expect("fresh keypair has room");
    let tag = kp_a.encrypt_in_place(counter, &mut buf);
    kp_b.decrypt_in_place(counter, &mut buf, &tag)
        .expect("B decrypts what A encrypted: A.send == B.recv");
    assert_eq!(buf, b"hello from A");

    assert!(b.peer.keypairs.lock().confirm_next());
    assert!(b.peer.keypairs.lock().next.is_none());

    // B → A: encrypt with B's send key, decrypt with A's current key.
    let mut buf = b"hello from B".to_vec();
    let counter = kp_b.reserve_send_counter().expect("fresh keypair has room");
    let tag = kp_b.encrypt_in_place(counter, &mut buf);
    kp_a.decrypt_in_place(counter, &mut buf, &tag)
        .expect("A decrypts what B encrypted: B.send == A.recv");
    assert_eq!(buf, b"hello from B");
}

#[test]
fn keepalive_decrypts_to_empty_plaintext() {
    let mut rng = OsRng;
    let secret_a = StaticSecret::random_from_rng(&mut rng);
    let secret_b = StaticSecret::random_from_rng(&mut rng);
    let public_a = NoisePublicKey::from(&secret_a);
    let public_b = NoisePublicKey::from(&secret_b);

    let a = make_side(secret_a.clone(), public_b);
    let b = make_side(secret_b.clone(), public_a);
    let initiator_cfg_a = StaticInitiatorConfig::new(secret_a);
    let initiator_cfg_b = StaticInitiatorConfig::new(secret_b);

    let mut init = handshake::create_initiation(&a.identity, &initiator_cfg_a, &a.peer, &mut rng).unwrap();
    let peer_a_on_b = b.peer.clone();
    handshake::consume_initiation(&b.identity, &initiator_cfg_b, &mut init, |_| Some(peer_a_on_b.clone()), &mut rng)
        .unwrap();
    let (mut resp, kp_b) = handshake::create_response(&b.identity, &b.peer, &init, &mut rng).unwrap();
    let kp_a = handshake::consume_response(&a.identity, &initiator_cfg_a, &a.peer, &mut resp).unwrap();

    let mut buf: Vec<u8> = Vec::new();
    let counter = kp_a.reserve_send_counter().unwrap();
    let tag = kp_a.encrypt_in_place(counter, &mut buf);
    assert!(buf.is_empty());

    kp_b.decrypt_in_place(counter, &mut buf, &tag)
        .expect("keepalive decrypts on B");
    assert!(buf.is_empty(), "keepalive produces zero-length plaintext");
}
