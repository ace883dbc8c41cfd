//! Benchmarks for the hot paths of a lookup: packet codec, cache, answers

use std::net::Ipv4Addr;
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sipdns::dns::answer::parse_addr_response;
use sipdns::dns::cache::{CacheKey, ResponseCache};
use sipdns::dns::protocol::{DnsPacket, DnsRecord, QueryType, ResultCode, TransientTtl, CLASS_IN};
use sipdns::dns::settings::ResolverSettings;

fn cname_response(hops: usize, addrs: usize) -> DnsPacket {
    let names: Vec<String> = (0..=hops).map(|i| format!("host{}.example.com", i)).collect();
    let mut response = DnsPacket::query(0x1234, &names[0], QueryType::A, CLASS_IN).reply(ResultCode::NOERROR);

    for pair in names.windows(2) {
        response.answers.push(DnsRecord::Cname {
            domain: pair[0].clone(),
            host: pair[1].clone(),
            ttl: TransientTtl(300),
        });
    }
    for i in 0..addrs {
        response.answers.push(DnsRecord::A {
            domain: names[hops].clone(),
            addr: Ipv4Addr::new(192, 0, 2, i as u8),
            ttl: TransientTtl(60),
        });
    }

    response
}

fn srv_response(targets: usize) -> DnsPacket {
    let name = "_sip._udp.example.com";
    let mut response = DnsPacket::query(0x4321, name, QueryType::Srv, CLASS_IN).reply(ResultCode::NOERROR);

    for i in 0..targets {
        response.answers.push(DnsRecord::Srv {
            domain: name.to_string(),
            priority: (i / 2) as u16,
            weight: 10,
            port: 5060,
            host: format!("sip{}.example.com", i),
            ttl: TransientTtl(600),
        });
        response.resources.push(DnsRecord::A {
            domain: format!("sip{}.example.com", i),
            addr: Ipv4Addr::new(198, 51, 100, i as u8),
            ttl: TransientTtl(600),
        });
    }

    response
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for &targets in &[1usize, 4, 8] {
        let packet = srv_response(targets);
        let bytes = packet.to_bytes().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode_srv", targets), &packet, |b, packet| {
            b.iter(|| black_box(packet.to_bytes().unwrap()))
        });
        group.bench_with_input(BenchmarkId::new("parse_srv", targets), &bytes, |b, bytes| {
            b.iter(|| black_box(DnsPacket::from_bytes(bytes).unwrap()))
        });
    }

    let query = DnsPacket::query(1, "sip.example.com", QueryType::A, CLASS_IN);
    group.bench_function("encode_query", |b| b.iter(|| black_box(query.to_bytes().unwrap())));

    group.finish();
}

fn bench_answers(c: &mut Criterion) {
    let mut group = c.benchmark_group("answers");

    for &hops in &[0usize, 4, 8] {
        let packet = cname_response(hops, 4);
        group.bench_with_input(BenchmarkId::new("cname_chain", hops), &packet, |b, packet| {
            b.iter(|| black_box(parse_addr_response(packet).unwrap()))
        });
    }

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let settings = ResolverSettings::default();
    let now = Instant::now();

    let mut cache = ResponseCache::new();
    let mut keys = Vec::new();
    for i in 0..512 {
        let mut response = cname_response(1, 2);
        response.questions[0].name = format!("host{}.example.net", i);
        let key = CacheKey::for_packet(&response).unwrap();
        cache.store(key.clone(), &response, now, &settings);
        keys.push(key);
    }

    c.bench_function("cache_hit", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(cache.lookup(&keys[i], now))
        })
    });

    let missing = CacheKey::new("missing.example.net", QueryType::A, CLASS_IN);
    c.bench_function("cache_miss", |b| b.iter(|| black_box(cache.lookup(&missing, now))));

    let response = cname_response(0, 4);
    c.bench_function("cache_store", |b| {
        let mut fresh = ResponseCache::new();
        b.iter(|| {
            let key = CacheKey::for_packet(&response).unwrap();
            black_box(fresh.store(key, &response, now, &settings))
        })
    });
}

criterion_group!(benches, bench_codec, bench_answers, bench_cache);
criterion_main!(benches);
