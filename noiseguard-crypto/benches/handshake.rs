use noiseguard_crypto::{
    decrypt_handshake_init, encrypt_handshake_init, HandshakeState, StaticInitiatorConfig,
    StaticPeerConfig,
};
use tai64::Tai64N;
use x25519_dalek::StaticSecret;

fn main() {
    divan::main();
}

#[divan::bench]
fn initiate(bencher: divan::Bencher) {
    let responder = StaticSecret::random_from_rng(rand::thread_rng());
    let initiator = StaticInitiatorConfig::new(StaticSecret::random_from_rng(rand::thread_rng()));
    let peer = StaticPeerConfig::new(x25519_dalek::PublicKey::from(&responder), None);
    let esk_i = StaticSecret::random_from_rng(rand::thread_rng());

    bencher.bench(|| {
        let mut hs = HandshakeState::default();
        encrypt_handshake_init(&mut hs, &initiator, &peer, &esk_i, Tai64N::now(), 1, None).unwrap()
    });
}

#[divan::bench]
fn respond(bencher: divan::Bencher) {
    let responder = StaticInitiatorConfig::new(StaticSecret::random_from_rng(rand::thread_rng()));
    let initiator = StaticInitiatorConfig::new(StaticSecret::random_from_rng(rand::thread_rng()));
    let peer = StaticPeerConfig::new(
        x25519_dalek::PublicKey::from(&responder.private_key),
        None,
    );
    let esk_i = StaticSecret::random_from_rng(rand::thread_rng());

    bencher
        .with_inputs(|| {
            let mut hs = HandshakeState::default();
            let msg = encrypt_handshake_init(
                &mut hs,
                &initiator,
                &peer,
                &esk_i,
                Tai64N::now(),
                1,
                None,
            )
            .unwrap();
            (msg, HandshakeState::default())
        })
        .bench_refs(|(msg, hs)| decrypt_handshake_init(msg, hs, &responder).unwrap());
}
