use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use multiwriter::sink::test_support::VecSink;
use multiwriter::{GzipWriter, StripedWriter};

fn bench_striped_writer(c: &mut Criterion) {
    let mut group = c.benchmark_group("striped_writer");

    for num_threads in [1, 4, 8].iter() {
        let writes_per_thread = 20_000u64;
        group.throughput(Throughput::Elements(writes_per_thread * *num_threads as u64));

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{num_threads}_threads")),
            num_threads,
            |b, &n| {
                b.iter(|| {
                    let writer = Arc::new(StripedWriter::new(VecSink::new()));
                    let handles: Vec<_> = (0..n)
                        .map(|_| {
                            let writer = Arc::clone(&writer);
                            thread::spawn(move || {
                                for _ in 0..writes_per_thread {
                                    writer.write(black_box(b"0123456789")).unwrap();
                                }
                            })
                        })
                        .collect();
                    for h in handles {
                        h.join().unwrap();
                    }
                    writer.flush().unwrap();
                });
            },
        );
    }

    group.finish();
}

fn bench_gzip_writer(c: &mut Criterion) {
    let mut group = c.benchmark_group("gzip_writer");

    let chunk = vec![b'x'; 1024];
    let chunks = 512usize;
    group.throughput(Throughput::Bytes((chunk.len() * chunks) as u64));

    for threads in [1, 4].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{threads}_compressors")), threads, |b, &t| {
            b.iter(|| {
                let mut writer = GzipWriter::builder(VecSink::new()).threads(t).build().unwrap();
                for _ in 0..chunks {
                    writer.write(black_box(&chunk)).unwrap();
                }
                writer.close().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_striped_writer, bench_gzip_writer);
criterion_main!(benches);
