//! Produce/consume throughput for standalone buffers and listener fan-in.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use msgbuf::{Buffer, BufferConfig, Listener, Value};

fn bench_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");
    group.throughput(Throughput::Elements(1));

    let msg = [Value::Integer(42), Value::Bytes(b"payload".to_vec())];

    group.bench_function("add_then_next", |bench| {
        let mut b = Buffer::new(BufferConfig::default()).unwrap();
        bench.iter(|| {
            b.add_msg(&msg).unwrap();
            b.next_msg(None).unwrap()
        });
    });

    group.bench_function("add_then_next_bounded", |bench| {
        let mut b = Buffer::new(BufferConfig::new(4096, 1.0)).unwrap();
        bench.iter(|| {
            b.add_msg(&msg).unwrap();
            b.next_msg(None).unwrap()
        });
    });

    group.finish();
}

fn bench_listener(c: &mut Criterion) {
    let mut group = c.benchmark_group("listener");
    group.throughput(Throughput::Elements(1));

    for buffers in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("fan_in", buffers),
            &buffers,
            |bench, &buffers| {
                let mut l = Listener::new(None).unwrap();
                let mut attached: Vec<Buffer> = (0..buffers)
                    .map(|_| l.new_buffer(BufferConfig::default()).unwrap())
                    .collect();
                let msg = [Value::Integer(7)];
                let mut turn = 0usize;
                bench.iter(|| {
                    attached[turn % buffers].add_msg(&msg).unwrap();
                    turn += 1;
                    l.next_msg(None).unwrap()
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_buffer, bench_listener);
criterion_main!(benches);
