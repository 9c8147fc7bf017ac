//! Cryptographic envelope benchmarks.
//!
//! Seal/open throughput at the typical segment size dominates the per-packet
//! cost of the datagram substrate.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use phantom::crypto::{derive_subkey, derive_user_id, generate_psk, EnvelopeCipher};

fn bench_seal(c: &mut Criterion) {
    let cipher = EnvelopeCipher::new(&generate_psk(), 30).unwrap();
    let plaintext = vec![0u8; 1200];

    let mut group = c.benchmark_group("envelope_seal");
    group.throughput(Throughput::Bytes(1200));
    group.bench_function("1200_bytes", |b| {
        b.iter(|| black_box(cipher.seal(&plaintext).unwrap()))
    });
    group.finish();
}

fn bench_open(c: &mut Criterion) {
    let psk = generate_psk();
    let sealer = EnvelopeCipher::new(&psk, 30).unwrap();
    let plaintext = vec![0u8; 1200];

    let mut group = c.benchmark_group("envelope_open");
    group.throughput(Throughput::Bytes(1200));
    group.bench_function("1200_bytes", |b| {
        b.iter_batched(
            || {
                // Each iteration needs a fresh opener: the replay ledger
                // rejects a second open of the same bytes by design.
                let opener = EnvelopeCipher::new(&psk, 30).unwrap();
                (opener, sealer.seal(&plaintext).unwrap())
            },
            |(opener, sealed)| black_box(opener.open(&sealed).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_kdf(c: &mut Criterion) {
    let psk = [0x42u8; 32];

    c.bench_function("derive_user_id", |b| {
        b.iter(|| black_box(derive_user_id(&psk)))
    });
    c.bench_function("derive_subkey", |b| {
        let mut window = 0i64;
        b.iter(|| {
            window += 1;
            black_box(derive_subkey(&psk, window))
        })
    });
}

criterion_group!(benches, bench_seal, bench_open, bench_kdf);
criterion_main!(benches);
