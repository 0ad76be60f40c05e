use std::hint::black_box;
use std::sync::Arc;

use bufferhub::{BufferHub, BufferSpec, ConsumerBuffer, Fence, MemfdAllocator, ProducerBuffer};

fn main() {
    divan::main();
}

#[global_allocator]
static ALLOC: divan::AllocProfiler = divan::AllocProfiler::system();

fn setup_buffer(consumers: usize, metadata_size: usize) -> (ProducerBuffer, Vec<ConsumerBuffer>) {
    let hub = Arc::new(BufferHub::new(MemfdAllocator::default()));
    let broker = hub.connect();
    let spec = BufferSpec::new(256, 256, 1, 0).with_metadata_size(metadata_size);

    let producer = ProducerBuffer::create(broker.clone(), &spec).unwrap();
    let consumers = (0..consumers)
        .map(|_| ConsumerBuffer::import(broker.clone(), producer.create_consumer().unwrap()).unwrap())
        .collect();

    (producer, consumers)
}

#[divan::bench(args = [1, 4, 16, 63])]
fn bench_async_cycle(bencher: divan::Bencher, consumers: usize) {
    let (mut producer, mut consumers) = setup_buffer(consumers, 64);
    let metadata = [7u8; 64];
    let mut read = [0u8; 64];

    bencher.bench_local(move || {
        producer.post_async(Fence::invalid(), &metadata).unwrap();
        for consumer in consumers.iter_mut() {
            black_box(consumer.acquire_async(&mut read).unwrap());
            consumer.release_async(Fence::invalid()).unwrap();
        }
        black_box(producer.gain_async().unwrap());
    });
}

#[divan::bench(args = [1, 4, 16])]
fn bench_brokered_cycle(bencher: divan::Bencher, consumers: usize) {
    let (mut producer, mut consumers) = setup_buffer(consumers, 64);
    let metadata = [7u8; 64];
    let mut read = [0u8; 64];

    bencher.bench_local(move || {
        producer.post(Fence::invalid(), &metadata).unwrap();
        for consumer in consumers.iter_mut() {
            black_box(consumer.acquire(&mut read).unwrap());
            consumer.release(Fence::invalid()).unwrap();
        }
        black_box(producer.gain().unwrap());
    });
}

#[divan::bench(args = [2, 8])]
fn bench_cycle_with_fences(bencher: divan::Bencher, consumers: usize) {
    let (mut producer, mut consumers) = setup_buffer(consumers, 8);
    let mut read = [0u8; 8];

    bencher.bench_local(move || {
        let (fence, signal) = Fence::new().unwrap();
        producer.post_async(fence, &[1u8; 8]).unwrap();
        signal.signal().unwrap();

        for consumer in consumers.iter_mut() {
            let fence = consumer.acquire_async(&mut read).unwrap();
            fence.wait(None).unwrap();
            let (release, signal) = Fence::new().unwrap();
            consumer.release_async(release).unwrap();
            signal.signal().unwrap();
        }

        let fence = producer.gain_async().unwrap();
        black_box(fence.wait(None).unwrap());
    });
}
