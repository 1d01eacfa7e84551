use bytes::BytesMut;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use gap_server_codec::{
    BLOCK_DATA, Key, PeerId, decode,
    message::{Query, Reply},
    wrapper::fold_hash,
};

fn criterion_benchmark(c: &mut Criterion) {
    let query = Query {
        block_type: BLOCK_DATA,
        priority: 10,
        ttl: 30_000,
        return_to: PeerId([7u8; 64]),
        keys: vec![Key([1u8; 64]), Key([2u8; 64])],
    };

    let query_bytes = query.to_bytes();

    let mut reply_bytes = BytesMut::new();
    let payload = vec![0xabu8; 1024];
    Reply::encode(&Key([3u8; 64]), &payload, &mut reply_bytes).unwrap();

    c.bench_function("decode_query", |b| {
        b.iter(|| decode(black_box(&query_bytes)).unwrap())
    });

    c.bench_function("encode_query", |b| {
        b.iter(|| {
            let mut bytes = BytesMut::with_capacity(query.size());
            black_box(&query).encode(&mut bytes);
            bytes
        })
    });

    c.bench_function("decode_reply", |b| {
        b.iter(|| Reply::decode(black_box(&reply_bytes)).unwrap())
    });

    c.bench_function("fold_hash_1k", |b| {
        b.iter(|| fold_hash(black_box(&payload)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
