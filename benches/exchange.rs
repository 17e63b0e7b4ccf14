use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slotq::{Array, DataQueue, ElementType, QueueConfig, Template, Wait};
use std::thread;

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_get_round_trip");

    for side in [32usize, 128, 300] {
        let image_t = Template::new(ElementType::F32, vec![side, side, 3]);
        let label_t = Template::new(ElementType::F32, vec![1024, 25]);
        let queue = DataQueue::create(
            &format!("bench_rt_{}_{}", side, std::process::id()),
            image_t.clone(),
            label_t.clone(),
            QueueConfig::with_capacity(8),
        )
        .expect("create");
        let image = Array::zeros(&image_t);
        let label = Array::zeros(&label_t);

        group.throughput(Throughput::Bytes(
            (image_t.byte_len() + label_t.byte_len()) as u64,
        ));
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, _| {
            b.iter(|| {
                queue
                    .put(&image, &label, b"meta", Wait::NonBlocking)
                    .expect("put");
                black_box(queue.get(Wait::NonBlocking).expect("get"));
            })
        });
    }
    group.finish();
}

fn bench_producer_consumer(c: &mut Criterion) {
    const ITEMS: u64 = 1_000;

    let image_t = Template::new(ElementType::U8, vec![300, 300, 3]);
    let label_t = Template::new(ElementType::F32, vec![8732, 25]);
    let name = format!("bench_pc_{}", std::process::id());
    let queue = DataQueue::create(&name, image_t.clone(), label_t.clone(), QueueConfig::with_capacity(16))
        .expect("create");

    let mut group = c.benchmark_group("producer_consumer");
    group.sample_size(10);
    group.throughput(Throughput::Elements(ITEMS));
    group.bench_function("1_producer_1_consumer", |b| {
        b.iter(|| {
            let name = name.clone();
            let (image_t, label_t) = (image_t.clone(), label_t.clone());
            let producer = thread::spawn(move || {
                let q = DataQueue::open(&name).expect("open");
                let image = Array::zeros(&image_t);
                let label = Array::zeros(&label_t);
                for _ in 0..ITEMS {
                    q.put(&image, &label, &[], Wait::Forever).expect("put");
                }
            });
            for _ in 0..ITEMS {
                black_box(queue.get(Wait::Forever).expect("get"));
            }
            producer.join().expect("producer join");
        })
    });
    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_producer_consumer);
criterion_main!(benches);
