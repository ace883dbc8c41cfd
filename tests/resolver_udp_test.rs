//! Resolver tests against fake nameservers on the loopback interface
//!
//! Each fake nameserver is a UDP socket on its own thread that answers
//! queries through a handler closure. The resolver runs on real sockets
//! with a `ResolverThread` driving it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sipdns::dns::protocol::{DnsPacket, DnsRecord, QueryType, ResultCode, TransientTtl, CLASS_IN};
use sipdns::dns::query::QueryResult;
use sipdns::dns::resolver::{Resolver, ResolverThread};
use sipdns::dns::settings::ResolverSettings;
use sipdns::dns::srv::{SrvOptions, SrvResult};
use sipdns::dns::timer::SystemClock;
use sipdns::dns::transport::UdpTransport;

const WAIT: Duration = Duration::from_secs(5);

struct FakeNameserver {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeNameserver {
    fn start<H>(handler: H) -> FakeNameserver
    where
        H: Fn(&DnsPacket) -> Option<DnsPacket> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind fake nameserver");
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("set read timeout");
        let addr = socket.local_addr().expect("local addr");

        let queries = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let counter = queries.clone();
        let flag = stop.clone();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 512];
            while !flag.load(Ordering::Acquire) {
                let (len, src) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(_) => continue,
                };
                let query = match DnsPacket::from_bytes(&buf[..len]) {
                    Ok(query) => query,
                    Err(_) => continue,
                };
                counter.fetch_add(1, Ordering::SeqCst);

                if let Some(response) = handler(&query) {
                    let bytes = response.to_bytes().expect("encode response");
                    let _ = socket.send_to(&bytes, src);
                }
            }
        });

        FakeNameserver {
            addr,
            queries,
            stop,
            handle: Some(handle),
        }
    }

    /// A nameserver that reads queries and never answers
    fn silent() -> FakeNameserver {
        FakeNameserver::start(|_| None)
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Drop for FakeNameserver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn settings() -> ResolverSettings {
    ResolverSettings {
        qretr_delay_ms: 200,
        qretr_count: 2,
        ..ResolverSettings::default()
    }
}

fn resolver(nameservers: &[SocketAddr]) -> (Resolver, ResolverThread) {
    let transport = UdpTransport::bind().expect("bind resolver transport");
    let resolver = Resolver::new(
        "udp-test",
        settings(),
        nameservers,
        Arc::new(transport),
        Arc::new(SystemClock),
    )
    .expect("create resolver");
    let thread = ResolverThread::spawn(resolver.clone(), Duration::from_millis(10)).expect("spawn thread");

    (resolver, thread)
}

fn lookup(resolver: &Resolver, name: &str, qtype: QueryType) -> QueryResult {
    let (tx, rx) = channel();
    resolver
        .start_query(name, qtype, CLASS_IN, move |result| {
            let _ = tx.send(result);
        })
        .expect("start query");

    rx.recv_timeout(WAIT).expect("callback within deadline")
}

fn srv_lookup(resolver: &Resolver, domain: &str) -> SrvResult {
    let (tx, rx) = channel();
    resolver
        .srv_resolve(domain, "_sip._udp.", 5060, SrvOptions::default(), move |result| {
            let _ = tx.send(result);
        })
        .expect("start srv resolution");

    rx.recv_timeout(WAIT).expect("callback within deadline")
}

fn a_record(domain: &str, addr: Ipv4Addr, ttl: u32) -> DnsRecord {
    DnsRecord::A {
        domain: domain.to_string(),
        addr,
        ttl: TransientTtl(ttl),
    }
}

/// A small zone: SRV for `example.com`, an address-only answer for the SRV
/// name of `fallback.example.com`, NXDOMAIN for everything else
fn example_zone(query: &DnsPacket) -> Option<DnsPacket> {
    let question = query.questions.first()?;

    let response = match (question.name.as_str(), question.qtype) {
        ("sip1.example.com", QueryType::A) => {
            let mut response = query.reply(ResultCode::NOERROR);
            response
                .answers
                .push(a_record("sip1.example.com", Ipv4Addr::new(192, 0, 2, 1), 300));
            response
        }
        ("_sip._udp.example.com", QueryType::Srv) => {
            let mut response = query.reply(ResultCode::NOERROR);
            response.answers.push(DnsRecord::Srv {
                domain: "_sip._udp.example.com".to_string(),
                priority: 10,
                weight: 60,
                port: 5070,
                host: "sip1.example.com".to_string(),
                ttl: TransientTtl(300),
            });
            response
        }
        ("short.example.com", QueryType::A) => {
            let mut response = query.reply(ResultCode::NOERROR);
            response
                .answers
                .push(a_record("short.example.com", Ipv4Addr::new(192, 0, 2, 30), 1));
            response
        }
        // no SRV published, the answer carries an address instead
        ("_sip._udp.fallback.example.com", QueryType::Srv) => {
            let mut response = query.reply(ResultCode::NOERROR);
            response.answers.push(a_record(
                "_sip._udp.fallback.example.com",
                Ipv4Addr::new(192, 0, 2, 99),
                300,
            ));
            response
        }
        ("fallback.example.com", QueryType::A) => {
            let mut response = query.reply(ResultCode::NOERROR);
            response
                .answers
                .push(a_record("fallback.example.com", Ipv4Addr::new(192, 0, 2, 20), 300));
            response
        }
        _ => query.reply(ResultCode::NXDOMAIN),
    };

    Some(response)
}

#[test]
fn test_a_lookup_and_cache() {
    let server = FakeNameserver::start(example_zone);
    let (resolver, _thread) = resolver(&[server.addr]);

    let packet = lookup(&resolver, "sip1.example.com", QueryType::A).expect("answer");
    assert_eq!(1, packet.answers.len());
    assert_eq!(1, server.queries());

    // served from the cache, the nameserver sees nothing new
    let packet = lookup(&resolver, "sip1.example.com", QueryType::A).expect("cached answer");
    assert_eq!(1, packet.answers.len());
    assert_eq!(1, server.queries());
    assert_eq!(1, resolver.cached_count());

    resolver.destroy();
}

#[test]
fn test_cache_expiry() {
    let server = FakeNameserver::start(example_zone);
    let (resolver, _thread) = resolver(&[server.addr]);

    lookup(&resolver, "short.example.com", QueryType::A).expect("answer");
    assert_eq!(1, server.queries());

    thread::sleep(Duration::from_millis(1100));

    lookup(&resolver, "short.example.com", QueryType::A).expect("fresh answer");
    assert_eq!(2, server.queries());

    resolver.destroy();
}

#[test]
fn test_nxdomain() {
    let server = FakeNameserver::start(example_zone);
    let (resolver, _thread) = resolver(&[server.addr]);

    let err = lookup(&resolver, "nothing.example.com", QueryType::A).unwrap_err();
    assert_eq!(Some(ResultCode::NXDOMAIN), err.rcode());

    resolver.destroy();
}

#[test]
fn test_silent_nameserver_times_out() {
    let server = FakeNameserver::silent();
    let (resolver, _thread) = resolver(&[server.addr]);

    let err = lookup(&resolver, "sip1.example.com", QueryType::A).unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(0, resolver.pending_count());

    let counters = resolver.snapshot().counters;
    assert_eq!(2, counters.queries_sent);
    assert_eq!(1, counters.timeouts);

    resolver.destroy();
}

#[test]
fn test_failover_to_answering_nameserver() {
    let dead = FakeNameserver::silent();
    let live = FakeNameserver::start(example_zone);
    let (resolver, _thread) = resolver(&[dead.addr, live.addr]);

    let packet = lookup(&resolver, "sip1.example.com", QueryType::A).expect("answer");
    assert_eq!(1, packet.answers.len());
    assert!(live.queries() >= 1);

    let snapshot = resolver.snapshot();
    assert!(snapshot.counters.responses >= 1);
    assert!(snapshot.counters.queries_sent >= 2);

    resolver.destroy();
}

#[test]
fn test_srv_resolution() {
    let server = FakeNameserver::start(example_zone);
    let (resolver, _thread) = resolver(&[server.addr]);

    let record = srv_lookup(&resolver, "example.com").expect("srv record");
    assert_eq!(1, record.entries.len());

    let entry = &record.entries[0];
    assert_eq!(10, entry.priority);
    assert_eq!(5070, entry.port);
    assert_eq!("sip1.example.com", entry.server.name);
    assert_eq!(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))], entry.server.addrs);

    resolver.destroy();
}

#[test]
fn test_srv_fallback() {
    let server = FakeNameserver::start(example_zone);
    let (resolver, _thread) = resolver(&[server.addr]);

    let record = srv_lookup(&resolver, "fallback.example.com").expect("fallback record");
    assert_eq!(1, record.entries.len());

    let entry = &record.entries[0];
    assert_eq!(0, entry.priority);
    assert_eq!(0, entry.weight);
    assert_eq!(5060, entry.port);
    assert_eq!(vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 20))], entry.server.addrs);

    // the SRV query and one A query for the bare domain
    assert_eq!(2, server.queries());

    resolver.destroy();
}

#[test]
fn test_destroy_stops_thread() {
    let server = FakeNameserver::silent();
    let (resolver, mut thread) = resolver(&[server.addr]);

    let (tx, rx) = channel();
    resolver
        .start_query("sip1.example.com", QueryType::A, CLASS_IN, move |result| {
            let _ = tx.send(result);
        })
        .expect("start query");

    resolver.destroy();
    thread.stop();

    // the callback is dropped without being called
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(resolver.is_destroyed());
}
