//! Ring buffer benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ptyio::ring_buffer::{RingBuffer, CHUNK_SIZE};

fn bench_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");

    // Shell output arrives in small bursts
    let burst = vec![b'x'; 512];
    let total = burst.len() * 256;
    group.throughput(Throughput::Bytes(total as u64));

    group.bench_function("write_then_read", |b| {
        let mut out = vec![0u8; total];
        b.iter(|| {
            let mut buffer = RingBuffer::new();
            for _ in 0..256 {
                buffer.write(black_box(&burst));
            }
            black_box(buffer.read(&mut out))
        })
    });

    group.finish();
}

fn bench_reserve_unreserve(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");
    group.throughput(Throughput::Bytes(CHUNK_SIZE as u64));

    // The read pump reserves a chunk and gives most of it back
    group.bench_function("reserve_unreserve", |b| {
        let mut buffer = RingBuffer::new();
        b.iter(|| {
            let slot = buffer.reserve(black_box(CHUNK_SIZE));
            slot[..64].fill(b'a');
            buffer.unreserve(CHUNK_SIZE - 64);
            buffer.free(64);
        })
    });

    group.finish();
}

fn bench_read_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer");

    let lines = "drwxr-xr-x  2 user user 4096 Jan  1 00:00 directory\r\n".repeat(200);
    group.throughput(Throughput::Bytes(lines.len() as u64));

    group.bench_function("read_line", |b| {
        let mut line = vec![0u8; 256];
        b.iter(|| {
            let mut buffer = RingBuffer::new();
            buffer.write(lines.as_bytes());
            let mut count = 0;
            while buffer.can_read_line() {
                buffer.read_line(&mut line);
                count += 1;
            }
            black_box(count)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_write_read,
    bench_reserve_unreserve,
    bench_read_line
);
criterion_main!(benches);
