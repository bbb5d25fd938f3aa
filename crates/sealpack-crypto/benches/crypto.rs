use std::io::Cursor;

use sealpack_crypto::{
    decrypt_chunk, encrypt_chunk, generate_data_key, DecryptOptions, EncryptOptions, KeyPair,
    Pipeline,
};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_chunk(bencher: divan::Bencher, size: usize) {
    let data_key = generate_data_key();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            encrypt_chunk(
                divan::black_box(&data_key),
                0,
                true,
                divan::black_box(&data),
            )
            .unwrap()
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_chunk(bencher: divan::Bencher, size: usize) {
    let data_key = generate_data_key();
    let data = make_data(size);
    let encrypted = encrypt_chunk(&data_key, 0, true, &data).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            decrypt_chunk(
                divan::black_box(&data_key),
                0,
                true,
                divan::black_box(&encrypted.sealed),
            )
            .unwrap()
        });
}

#[divan::bench(args = [1, 4])]
fn bench_pipeline_roundtrip(bencher: divan::Bencher, workers: usize) {
    const SIZE: usize = 4 * 1024 * 1024;
    let recipient = KeyPair::generate();
    let data = make_data(SIZE);
    let options = EncryptOptions {
        workers,
        ..EncryptOptions::default()
    };
    bencher
        .counter(divan::counter::BytesCount::new(SIZE))
        .bench(|| {
            let mut sealed = Vec::with_capacity(SIZE + SIZE / 64);
            Pipeline::new()
                .encrypt(
                    Cursor::new(divan::black_box(&data)),
                    &mut sealed,
                    &[recipient.public],
                    &options,
                )
                .unwrap();
            let mut plain = Vec::with_capacity(SIZE);
            Pipeline::new()
                .decrypt(
                    Cursor::new(&sealed),
                    &mut plain,
                    &recipient.private,
                    &DecryptOptions::default(),
                )
                .unwrap();
            plain
        });
}

fn main() {
    divan::main();
}
