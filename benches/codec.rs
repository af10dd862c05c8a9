use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mill_loop::{
    codec::command,
    prelude::*,
    RingBuffer,
};
use std::{
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

fn bench_header_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_decode");
    let codec = HeaderCodec::new();

    for size in [16usize, 512, 4096, 65535] {
        let wire = codec
            .encode(&HeaderFrame::new(command::DATA, vec![0xAB; size]))
            .unwrap();
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &wire, |b, wire| {
            let mut buf = RingBuffer::with_capacity(wire.len());
            b.iter(|| {
                buf.append(wire);
                black_box(codec.decode(&mut buf).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_header_decode_batched(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_decode_batched");
    let codec = HeaderCodec::new();
    let frames = 64;

    let mut wire = Vec::new();
    for _ in 0..frames {
        wire.extend_from_slice(
            &codec
                .encode(&HeaderFrame::new(command::DATA, vec![0x11; 128]))
                .unwrap(),
        );
    }
    group.throughput(Throughput::Elements(frames as u64));
    group.bench_function("64x128", |b| {
        let mut buf = RingBuffer::with_capacity(wire.len());
        b.iter(|| {
            buf.append(&wire);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                black_box(frame);
            }
        });
    });
    group.finish();
}

fn bench_versioned_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("versioned_codec");
    let codec = VersionedCodec::new();
    let frame = VersionedFrame::new(command::DATA, vec![0x42; 1024]);

    group.throughput(Throughput::Bytes(1024));
    group.bench_function("encode_1k", |b| {
        b.iter(|| black_box(codec.encode(black_box(&frame)).unwrap()));
    });
    group.bench_function("decode_1k", |b| {
        let wire = codec.encode(&frame).unwrap();
        let mut buf = RingBuffer::with_capacity(wire.len());
        b.iter(|| {
            buf.append(&wire);
            black_box(codec.decode(&mut buf).unwrap());
        });
    });
    group.finish();
}

struct Echo;

impl EventHandler for Echo {
    type Frame = HeaderFrame;

    fn react(
        &self,
        frame: HeaderFrame,
        _conn: &mut Connection<HeaderFrame>,
    ) -> (Option<HeaderFrame>, Action) {
        (Some(HeaderFrame::new(command::PONG, frame.body)), Action::None)
    }
}

fn bench_echo_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("echo_round_trip");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    for multicore in [false, true] {
        let config = ServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .multicore(multicore)
            .num_event_loop(2)
            .build();
        let handle = Server::new(config, Echo, HeaderCodec::new())
            .start()
            .unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).unwrap();
        client.set_nodelay(true).unwrap();
        let request = HeaderCodec::new()
            .encode(&HeaderFrame::new(command::DATA, vec![7u8; 256]))
            .unwrap();
        let mut reply = vec![0u8; request.len()];

        let label = if multicore { "multicore" } else { "single_loop" };
        group.throughput(Throughput::Bytes(request.len() as u64));
        group.bench_function(label, |b| {
            b.iter(|| {
                client.write_all(&request).unwrap();
                client.read_exact(&mut reply).unwrap();
                black_box(&reply);
            });
        });
    }
    group.finish();
}

criterion_group!(
    codec_benches,
    bench_header_decode,
    bench_header_decode_batched,
    bench_versioned_codec
);
criterion_group!(server_benches, bench_echo_round_trip);
criterion_main!(codec_benches, server_benches);
