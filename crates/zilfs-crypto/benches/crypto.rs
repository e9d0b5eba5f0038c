use zilfs_crypto::aead::counter_nonce;
use zilfs_crypto::{encrypt, fractal_kdf, onion_decrypt, onion_encrypt, Label, SecretKey};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn layer_keys(n: usize) -> Vec<SecretKey> {
    (0..n)
        .map(|i| SecretKey::from_bytes([0x40 + i as u8; 32]))
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_aead_seal(bencher: divan::Bencher, size: usize) {
    let key = SecretKey::from_bytes([0xABu8; 32]);
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            encrypt(
                divan::black_box(&key),
                &counter_nonce(1),
                b"bench",
                divan::black_box(&data),
            )
            .unwrap()
        });
}

#[divan::bench(args = [1, 2, 4])]
fn bench_onion_seal_64k(bencher: divan::Bencher, layers: usize) {
    let keys = layer_keys(layers);
    let data = make_data(65536);
    bencher
        .counter(divan::counter::BytesCount::new(data.len()))
        .bench(|| onion_encrypt(divan::black_box(&data), &keys, b"bench").unwrap());
}

#[divan::bench(args = [1, 2, 4])]
fn bench_onion_open_64k(bencher: divan::Bencher, layers: usize) {
    let keys = layer_keys(layers);
    let sealed = onion_encrypt(&make_data(65536), &keys, b"bench").unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(65536usize))
        .bench(|| onion_decrypt(divan::black_box(&sealed), &keys, b"bench").unwrap());
}

#[divan::bench]
fn bench_fractal_subkey(bencher: divan::Bencher) {
    let seed = [0x11u8; 32];
    bencher.bench(|| fractal_kdf(divan::black_box(&seed), Label::Object, divan::black_box(0xDEAD_BEEF)).unwrap());
}

fn main() {
    divan::main();
}
