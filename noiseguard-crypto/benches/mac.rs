fn main() {
    divan::main();
}

#[divan::bench]
fn mac16(bencher: divan::Bencher) {
    let key = [0x42u8; 32];
    bencher
        .with_inputs(|| [0u8; 148])
        .bench_refs(|msg| noiseguard_crypto::mac(&key, msg));
}
