use crate::Consumer;
use loom::{model::Builder, thread};

fn model<F: Fn() + Sync + Send + 'static>(f: F) {
    let mut builder = Builder::new();
    if builder.preemption_bound.is_none() {
        builder.preemption_bound = Some(3);
    }
    builder.check(f);
}

#[test]
fn test_two_producers_across_blocks() {
    model(|| {
        let mut consumer = Consumer::<(u64, u64)>::new(2).unwrap();
        let registry = consumer.registry();
        let per_producer = 3;

        let handles: Vec<_> = (0..2u64)
            .map(|tag| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let mut producer = registry.producer(tag);
                    for i in 0..per_producer {
                        producer.push((tag, i));
                    }
                })
            })
            .collect();

        let mut next = [0u64; 2];
        let mut check = |tag: u64, (t, i): (u64, u64)| {
            assert_eq!(tag, t);
            assert_eq!(next[t as usize], i);
            next[t as usize] += 1;
        };

        consumer.drain(usize::MAX, &mut check);
        for handle in handles {
            handle.join().unwrap();
        }
        consumer.drain(usize::MAX, &mut check);

        assert_eq!(next, [per_producer; 2]);
        assert_eq!(consumer.producers(), 0);
    });
}

#[test]
fn test_grouped_write_is_atomic() {
    model(|| {
        let mut consumer = Consumer::<u32>::new(4).unwrap();
        let registry = consumer.registry();

        let handle = thread::spawn(move || {
            let mut producer = registry.producer(0);
            let mut reserved = producer.reserve(3);
            for v in 0..3 {
                reserved.write(v).unwrap();
            }
        });

        let mut seen = Vec::new();
        consumer.drain(usize::MAX, |_, v| seen.push(v));
        assert!(seen.is_empty() || seen == [0, 1, 2]);

        handle.join().unwrap();
        consumer.drain(usize::MAX, |_, v| seen.push(v));
        assert_eq!(seen, [0, 1, 2]);
    });
}

#[test]
fn test_write_after_close() {
    model(|| {
        let consumer = Consumer::<u32>::new(2).unwrap();
        let registry = consumer.registry();

        let handle = thread::spawn(move || {
            let mut producer = registry.producer(0);
            for v in 0..3 {
                producer.push(v);
            }
        });
        drop(consumer);
        handle.join().unwrap();
    });
}
