use criterion::{black_box, criterion_group, criterion_main, Criterion};
use plexus_core::sortition::binomial_weight;
use plexus_core::vote::{SortitionMessage, VoteType};
use plexus_core::VrfSortition;
use plexus_crypto::vrf::VrfKeypair;

fn bench_binomial_weight(c: &mut Criterion) {
    let hash = plexus_crypto::keccak256(b"credential");

    c.bench_function("binomial_weight stake=100", |b| {
        b.iter(|| binomial_weight(black_box(100), black_box(10_000), black_box(500), &hash))
    });

    c.bench_function("binomial_weight stake=100000", |b| {
        b.iter(|| binomial_weight(black_box(100_000), black_box(1_000_000), black_box(1000), &hash))
    });
}

fn bench_credential(c: &mut Criterion) {
    let keypair = VrfKeypair::from_seed(&[7u8; 32]);
    let address = [0x11u8; 20];

    c.bench_function("sortition generate + weigh", |b| {
        b.iter(|| {
            let message = SortitionMessage::new(VoteType::Cert, 1000, 2, 3);
            let sortition = VrfSortition::generate(&keypair, message);
            sortition.calculate_weight(black_box(50), 10_000, 500, &address)
        })
    });
}

criterion_group!(benches, bench_binomial_weight, bench_credential);
criterion_main!(benches);
