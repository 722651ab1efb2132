//! Index operation benchmarks, single-rank and over the thread mesh.

use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use keymesh::{Key, KeyIndex, KeySpan, SelfComm};
use keymesh_inproc::create_comms;

const SPAN: KeySpan = KeySpan {
    first: 0,
    last: 1 << 30,
};

fn bench_generate_single_rank(c: &mut Criterion) {
    c.bench_function("generate_4096_single_rank", |b| {
        b.iter_batched(
            || KeyIndex::new(SelfComm, &[SPAN]).unwrap(),
            |mut index| index.generate_new_keys(&[4096]).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

fn bench_update_single_rank(c: &mut Criterion) {
    let keys: Vec<Key> = (0..4096).collect();
    c.bench_function("update_add_4096_single_rank", |b| {
        b.iter_batched(
            || KeyIndex::new(SelfComm, &[SPAN]).unwrap(),
            |mut index| index.update_keys(&keys, &[]).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

fn bench_query_single_rank(c: &mut Criterion) {
    let mut index = KeyIndex::new(SelfComm, &[SPAN]).unwrap();
    let keys: Vec<Key> = (0..4096).collect();
    index.update_keys(&keys, &[]).unwrap();

    c.bench_function("query_4096_single_rank", |b| {
        b.iter(|| index.query_keys(black_box(&keys)))
    });
}

fn bench_generate_four_ranks(c: &mut Criterion) {
    c.bench_function("generate_1024_each_four_ranks", |b| {
        b.iter(|| {
            let handles: Vec<_> = create_comms(4)
                .into_iter()
                .map(|comm| {
                    thread::spawn(move || {
                        let mut index = KeyIndex::new(comm, &[SPAN]).unwrap();
                        index.generate_new_keys(&[1024]).unwrap()
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
}

criterion_group!(
    benches,
    bench_generate_single_rank,
    bench_update_single_rank,
    bench_query_single_rank,
    bench_generate_four_ranks
);
criterion_main!(benches);
