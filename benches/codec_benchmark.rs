use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use bytes::BytesMut;
use stompd::core::frame::{encode_frame, header, try_decode_frame, DEFAULT_MAX_FRAME_SIZE};
use stompd::core::subscription::AckMode;
use stompd::core::topics::TopicListener;
use stompd::{Command, Frame, MemoryQueueStorage, QueueManager, TopicRegistry};

fn create_send_frame(payload_size: usize) -> Frame {
    Frame::new(Command::Send)
        .with_header(header::DESTINATION, "/queue/bench")
        .with_header(header::CONTENT_TYPE, "application/octet-stream")
        .with_header("x-trace", "a:b\nc") // exercises header escaping
        .with_body(vec![b'x'; payload_size])
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for &size in [64usize, 1024, 16 * 1024].iter() {
        let frame = create_send_frame(size);
        let mut encoded = BytesMut::new();
        encode_frame(&frame, &mut encoded);

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, frame| {
            let mut buf = BytesMut::with_capacity(encoded.len());
            b.iter(|| {
                buf.clear();
                encode_frame(black_box(frame), &mut buf);
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut src = encoded.clone();
                black_box(try_decode_frame(&mut src, DEFAULT_MAX_FRAME_SIZE).unwrap());
            });
        });
    }

    group.finish();
}

fn bench_queue_manager(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue_manager");
    group.throughput(Throughput::Elements(1000));

    group.bench_function("enqueue_dequeue_1000", |b| {
        let manager = QueueManager::new(Arc::new(MemoryQueueStorage::new()));
        let frame = create_send_frame(256);
        b.to_async(&rt).iter(|| async {
            for _ in 0..1000 {
                manager.enqueue("/queue/bench", frame.clone()).await.unwrap();
            }
            while let Some(f) = manager.dequeue("/queue/bench").await.unwrap() {
                black_box(f);
            }
        });
    });

    group.finish();
}

fn bench_topic_broadcast(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("topic_broadcast");

    for &subscribers in [1usize, 16, 256].iter() {
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::new("fanout", subscribers),
            &subscribers,
            |b, &subscribers| {
                let registry = TopicRegistry::default();
                let receivers: Vec<_> = (0..subscribers)
                    .map(|i| {
                        let (tx, rx) = flume::bounded(1024);
                        registry.subscribe(
                            "/topic/bench",
                            TopicListener {
                                session_id: format!("s{i}"),
                                client_subscription: "1".to_string(),
                                ack: AckMode::Auto,
                                sender: tx,
                            },
                        );
                        rx
                    })
                    .collect();
                let frame = create_send_frame(256);

                b.to_async(&rt).iter(|| async {
                    black_box(registry.broadcast("/topic/bench", &frame).await);
                    for rx in &receivers {
                        rx.drain().for_each(drop);
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_codec,
    bench_queue_manager,
    bench_topic_broadcast
);
criterion_main!(benches);
