use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use criterion::{Criterion, criterion_group, criterion_main};
use micro_engine::codec::{Framing, HeadEncoder, HeadPart, RequestDecoder};
use micro_engine::websocket::{Frame, FrameCodec, OpCode};
use tokio_util::codec::{Decoder, Encoder};

fn bench_request_decoder(c: &mut Criterion) {
    let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

    c.bench_function("decode_simple_request", |b| {
        b.iter(|| {
            let mut decoder = RequestDecoder::new();
            let mut bytes = BytesMut::from(&request[..]);
            black_box(decoder.decode(&mut bytes).unwrap());
        });
    });

    let pipelined = b"POST /submit HTTP/1.1\r\nHost: localhost\r\nContent-Length: 11\r\n\r\nhello worldGET /next HTTP/1.1\r\nHost: localhost\r\n\r\n";

    c.bench_function("decode_pipelined_requests", |b| {
        b.iter(|| {
            let mut decoder = RequestDecoder::new();
            let mut bytes = BytesMut::from(&pipelined[..]);
            while let Some(item) = decoder.decode(&mut bytes).unwrap() {
                black_box(item);
            }
        });
    });
}

fn bench_head_encoder(c: &mut Criterion) {
    let date = b"Sun, 18 Oct 2026 08:00:00 GMT";

    c.bench_function("encode_response_head", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(256);
            let mut encoder = HeadEncoder;
            encoder.encode(HeadPart::Status("200 OK"), &mut buf).unwrap();
            encoder.encode(HeadPart::Header(b"Content-Type", b"text/plain"), &mut buf).unwrap();
            encoder
                .encode(HeadPart::Finish { date: Some(date), framing: Framing::Length(12), close: false }, &mut buf)
                .unwrap();
            black_box(buf);
        });
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let payload = Bytes::from(vec![b'x'; 1024]);

    let mut masked = BytesMut::new();
    FrameCodec::client(1 << 20).encode(Frame::new(OpCode::Binary, payload.clone()), &mut masked).unwrap();

    c.bench_function("decode_masked_frame_1k", |b| {
        b.iter(|| {
            let mut codec = FrameCodec::server(1 << 20);
            let mut bytes = masked.clone();
            black_box(codec.decode(&mut bytes).unwrap());
        });
    });

    c.bench_function("encode_frame_1k", |b| {
        b.iter(|| {
            let mut codec = FrameCodec::server(1 << 20);
            let mut buf = BytesMut::with_capacity(1100);
            codec.encode(Frame::new(OpCode::Binary, payload.clone()), &mut buf).unwrap();
            black_box(buf);
        });
    });
}

criterion_group!(benches, bench_request_decoder, bench_head_encoder, bench_frame_codec);
criterion_main!(benches);
