//! Cookie/MAC2 validation under load, end to end (spec §8 scenario 5
//! "Cookie MAC validation").

use std::sync::Arc;

use noiseguard_core::{handshake, Checker, Identity, Peer, PeerId};
use noiseguard_crypto::{encrypt_cookie, HasMac, NoisePublicKey, NoiseStaticSecret, StaticInitiatorConfig};
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;

#[test]
fn cookie_round_trip_then_accepted_then_rejected_on_address_change() {
    let mut rng = OsRng;
    let secret_a = StaticSecret::random_from_rng(&mut rng);
    let secret_b = StaticSecret::random_from_rng(&mut rng);
    let public_a = NoisePublicKey::from(&secret_a);
    let public_b = NoisePublicKey::from(&secret_b);

    let identity_a = Identity::default();
    identity_a.set_private_key(NoiseStaticSecret::from(secret_a.to_bytes()));
    let peer_b_on_a = Arc::new(Peer::new(PeerId(1), public_b, None));
    let initiator_cfg_a = StaticInitiatorConfig::new(secret_a);

    let checker_b = Checker::new(&public_b, &mut rng);

    let addr1: std::net::SocketAddr = "203.0.113.9:51820".parse().unwrap();
    let addr2: std::net::SocketAddr = "198.51.100.4:51820".parse().unwrap();

    // With no cached cookie, MAC2 is absent/null: under load this is EAGAIN
    // (a cookie reply is owed), never an outright reject.
    let mut init = handshake::create_initiation(&identity_a, &initiator_cfg_a, &peer_b_on_a, &mut rng).unwrap();
    let cookie = checker_b
        .verify(&mut init, true, addr1, &mut rng)
        .expect("under load with no mac2 yields EAGAIN, not a hard reject")
        .expect("a cookie must be offered");

    let aad = *init.get_mac1();
    let nonce: [u8; 24] = {
        let mut n = [0u8; 24];
        rng.try_fill_bytes(&mut n).unwrap();
        n
    };
    let encrypted = encrypt_cookie(cookie, checker_b.cookie_key(), &nonce, &aad);
    peer_b_on_a
        .maker
        .consume_cookie_reply(encrypted, &nonce)
        .expect("maker accepts the reply it asked for");
    assert!(peer_b_on_a.maker.current_cookie().is_some());

    // A retries with the now-cached cookie: MAC2 validates, so this is
    // accepted outright from the same source address.
    let mut retry = handshake::create_initiation(&identity_a, &initiator_cfg_a, &peer_b_on_a, &mut rng).unwrap();
    let verdict = checker_b.verify(&mut retry, true, addr1, &mut rng).unwrap();
    assert!(verdict.is_none(), "a valid mac2 from the cookie's own address is accepted");

    // The same message replayed from a different source address fails
    // mac2 again (the cookie is address-bound) and gets another EAGAIN.
    let mut retry2 = handshake::create_initiation(&identity_a, &initiator_cfg_a, &peer_b_on_a, &mut rng).unwrap();
    let verdict = checker_b.verify(&mut retry2, true, addr2, &mut rng).unwrap();
    assert!(verdict.is_some(), "changing the source address invalidates mac2 again");
}
