// Criterion benchmarks for the remora-common codec path
//
// Run benchmarks with:
//   cargo bench -p remora-common
//
// For detailed output with plots:
//   cargo bench -p remora-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use remora_common::{
    ChunkHeader, ChunkType, ControllerInfo, Converter, Param, ParamValue, Request, Response,
    ServiceInfo, SessionControlMessage, Status,
};
use serde_json::json;

fn request_with(value: serde_json::Value) -> Request {
    Request::new(
        "5f2b8c0e1d7a4b3c9e6f0a1b2c3d4e5f",
        vec![Param {
            order: 0,
            type_name: "object".to_string(),
            value: ParamValue::Value(value),
        }],
    )
    .with_nonce(42)
}

fn bench_request_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encoding");
    let converter = Converter::new();

    let small = request_with(json!({"value": 42}));
    let medium = request_with(json!({"values": [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]}));
    let data: Vec<String> = (0..100).map(|i| format!("item_{}", i)).collect();
    let large = request_with(json!({ "data": data }));

    group.bench_function("encode_small", |b| {
        b.iter(|| converter.encode(black_box(&small)));
    });

    group.bench_function("encode_medium", |b| {
        b.iter(|| converter.encode(black_box(&medium)));
    });

    group.bench_function("encode_large", |b| {
        b.iter(|| converter.encode(black_box(&large)));
    });

    group.finish();
}

fn bench_request_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_decoding");
    let converter = Converter::new();

    let small = converter.encode(&request_with(json!({"value": 42}))).unwrap();
    let data: Vec<String> = (0..100).map(|i| format!("item_{}", i)).collect();
    let large = converter.encode(&request_with(json!({ "data": data }))).unwrap();

    group.bench_function("decode_small", |b| {
        b.iter(|| converter.decode::<Request>(black_box(&small)));
    });

    group.bench_function("decode_large", |b| {
        b.iter(|| converter.decode::<Request>(black_box(&large)));
    });

    group.finish();
}

fn bench_response_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_encoding");
    let converter = Converter::new();

    let success = Response::success(json!({"result": 42})).with_nonce(1);
    let error = Response::error(Status::InternalServerError, "handler failed").with_nonce(1);
    let control = Response::control(SessionControlMessage::chunk(
        "0123456789abcdef0123456789abcdef",
        ChunkHeader {
            sequence: 17,
            size_in_bytes: 65536,
            chunk_type: ChunkType::Continue,
        },
    ));

    group.bench_function("encode_success", |b| {
        b.iter(|| converter.encode(black_box(&success)));
    });

    group.bench_function("encode_error", |b| {
        b.iter(|| converter.encode(black_box(&error)));
    });

    group.bench_function("encode_chunk_control", |b| {
        b.iter(|| converter.encode(black_box(&control)));
    });

    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("service_fingerprint");

    let service = ServiceInfo::new("storage", "2.1")
        .with_provider("acme")
        .with_param("region", "eu-west")
        .with_controller(ControllerInfo::new("BlobController", "1"))
        .with_controller(ControllerInfo::new("MetaController", "3"));

    group.bench_function("fingerprint", |b| {
        b.iter(|| black_box(&service).fingerprint());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_request_encoding,
    bench_request_decoding,
    bench_response_encoding,
    bench_fingerprint,
);
criterion_main!(benches);
