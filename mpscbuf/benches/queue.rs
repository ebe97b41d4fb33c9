use std::hint::black_box;

use mpscbuf::{Consumer, Producer};

fn main() {
    divan::main();
}

#[global_allocator]
static ALLOC: divan::AllocProfiler = divan::AllocProfiler::system();

fn setup(block_capacity: usize) -> (Producer<[u64; 4]>, Consumer<[u64; 4]>) {
    let consumer = Consumer::new(block_capacity).unwrap();
    let producer = consumer.registry().producer(0);
    (producer, consumer)
}

#[divan::bench(args = [64, 1024, 16 * 1024])]
fn bench_push(bencher: divan::Bencher, block_capacity: usize) {
    bencher
        .with_inputs(|| setup(block_capacity))
        .bench_values(|(mut producer, consumer)| {
            for i in 0..10_000u64 {
                producer.push(black_box([i; 4]));
            }
            (producer, consumer)
        });
}

#[divan::bench(args = [1, 4, 16])]
fn bench_reserve_group(bencher: divan::Bencher, group: usize) {
    let (mut producer, mut consumer) = setup(16 * 1024);
    bencher.bench_local(move || {
        for _ in 0..1000 {
            let mut reserved = producer.reserve(group);
            for i in 0..group as u64 {
                let _ = reserved.write([i; 4]);
            }
        }
        consumer.drain(usize::MAX, |_, v| {
            black_box(v);
        })
    });
}

#[divan::bench(threads = [1, 2, 4, 8])]
fn bench_concurrent_producers(bencher: divan::Bencher) {
    let consumer = Consumer::<[u64; 4]>::new(4096).unwrap();
    let registry = consumer.registry();
    bencher.bench(|| {
        let mut producer = registry.producer(0);
        for i in 0..1000u64 {
            producer.push(black_box([i; 4]));
        }
    });
}
