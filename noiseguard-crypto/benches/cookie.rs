use noiseguard_crypto::encrypt_cookie;
use noiseguard_types::Cookie;
use rand::RngCore;

fn main() {
    divan::main();
}

#[divan::bench]
fn encrypt(bencher: divan::Bencher) {
    let key = Default::default();
    let mut rng = rand::thread_rng();

    bencher
        .with_inputs(|| {
            let mut nonce = [0u8; 24];
            rng.fill_bytes(&mut nonce);
            (Cookie([0x11; 16]), nonce)
        })
        .bench_values(|(cookie, nonce)| encrypt_cookie(cookie, &key, &nonce, b"mac1"));
}
