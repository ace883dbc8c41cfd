//! SRV resolution of SIP servers
//!
//! Resolving `_sip._udp.example.com` is a two stage affair. The SRV query
//! names the targets with their priority, weight and port. Targets whose
//! addresses did not come along in the additional section get their own A
//! (and optionally AAAA) query, all running in parallel, and the caller hears
//! back once every one of them has finished.
//!
//! When the domain has no SRV records at all, the domain itself is looked up
//! with an A (or AAAA) query and used on the default port, as RFC 3263
//! prescribes for SIP. An error answer to the SRV query is final and does not
//! trigger this fallback.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_derive::Serialize;

use crate::dns::answer::{self, AddrRecord, MAX_ADDRS};
use crate::dns::protocol::{DnsPacket, DnsRecord, QueryType, CLASS_IN};
use crate::dns::query::{QueryError, QueryHandle, QueryResult};
use crate::dns::resolver::{Resolver, ResolverError, WeakResolver};

/// Most targets taken from a single SRV answer
pub const MAX_SRV_ENTRIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrvOptions {
    /// Look up A records of the bare domain when it has no SRV records
    pub fallback_a: bool,
    /// Look up AAAA records of the bare domain when it has no SRV records
    pub fallback_aaaa: bool,
    /// Also ask for AAAA records of the targets
    pub resolve_aaaa: bool,
    /// Ask for AAAA records of the targets and nothing else, implies
    /// `resolve_aaaa`
    pub aaaa_only: bool,
}

impl Default for SrvOptions {
    fn default() -> Self {
        SrvOptions {
            fallback_a: true,
            fallback_aaaa: false,
            resolve_aaaa: false,
            aaaa_only: false,
        }
    }
}

impl SrvOptions {
    pub fn normalized(mut self) -> SrvOptions {
        if self.aaaa_only {
            self.resolve_aaaa = true;
        }
        self
    }

    pub fn falls_back(&self) -> bool {
        self.fallback_a || self.fallback_aaaa
    }

    /// What the bare domain is resolved with once the SRV lookup came back
    /// empty
    pub fn for_fallback(&self) -> SrvOptions {
        SrvOptions {
            fallback_a: false,
            fallback_aaaa: false,
            resolve_aaaa: self.fallback_aaaa,
            aaaa_only: self.fallback_aaaa && !self.fallback_a,
        }
    }

    /// Address queries to send for a target
    pub fn address_types(&self) -> Vec<QueryType> {
        let mut types = Vec::with_capacity(2);
        if !self.aaaa_only {
            types.push(QueryType::A);
        }
        if self.resolve_aaaa {
            types.push(QueryType::Aaaa);
        }
        types
    }

    pub fn accepts(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(_) => !self.aaaa_only,
            IpAddr::V6(_) => self.resolve_aaaa,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SrvEntry {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub server: AddrRecord,
}

/// Resolved servers, in the order they should be tried
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SrvRecord {
    pub entries: Vec<SrvEntry>,
}

pub type SrvResult = std::result::Result<SrvRecord, QueryError>;

type SrvCallback = Box<dyn FnOnce(SrvResult) + Send>;

/// The SRV owner name for `domain` under `service`, e.g. `_sip._udp.`
pub fn srv_query_name(domain: &str, service: &str) -> String {
    if service.is_empty() {
        domain.to_string()
    } else if service.ends_with('.') {
        format!("{}{}", service, domain)
    } else {
        format!("{}.{}", service, domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SrvTarget {
    priority: u16,
    weight: u16,
    port: u16,
    name: String,
    alias: Option<String>,
    addrs: Vec<IpAddr>,
}

impl SrvTarget {
    fn new(priority: u16, weight: u16, port: u16, name: &str) -> SrvTarget {
        SrvTarget {
            priority,
            weight,
            port,
            name: name.to_string(),
            alias: None,
            addrs: Vec::new(),
        }
    }

    fn add_addr(&mut self, addr: IpAddr) {
        if self.addrs.len() < MAX_ADDRS && !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }
}

fn targets_from_answer(packet: &DnsPacket) -> Vec<SrvTarget> {
    packet
        .answers
        .iter()
        .filter_map(|rec| match *rec {
            DnsRecord::Srv {
                priority,
                weight,
                port,
                ref host,
                ..
            } if !host.is_empty() && host != "." => Some(SrvTarget::new(priority, weight, port, host)),
            _ => None,
        })
        .take(MAX_SRV_ENTRIES)
        .collect()
}

/// Order targets by priority, and by weighted random choice within a
/// priority (RFC 2782).
fn order_targets(mut targets: Vec<SrvTarget>) -> Vec<SrvTarget> {
    // zero weights go first within a priority
    targets.sort_by_key(|t| (t.priority, t.weight != 0));

    let mut ordered = Vec::with_capacity(targets.len());
    while !targets.is_empty() {
        let priority = targets[0].priority;
        let split = targets
            .iter()
            .position(|t| t.priority != priority)
            .unwrap_or_else(|| targets.len());
        let mut group: Vec<SrvTarget> = targets.drain(..split).collect();

        while !group.is_empty() {
            let total: u32 = group.iter().map(|t| u32::from(t.weight)).sum();
            let pick = if total == 0 {
                0
            } else {
                rand::random::<u32>() % (total + 1)
            };

            let mut running = 0;
            let index = group
                .iter()
                .position(|t| {
                    running += u32::from(t.weight);
                    running >= pick
                })
                .unwrap_or(0);

            ordered.push(group.remove(index));
        }
    }

    ordered
}

/// Take target addresses the nameserver already sent along
fn fill_from_packet(targets: &mut [SrvTarget], packet: &DnsPacket, options: &SrvOptions) {
    let records: Vec<DnsRecord> = packet
        .answers
        .iter()
        .chain(packet.resources.iter())
        .cloned()
        .collect();

    for target in targets.iter_mut() {
        let owner = match answer::follow_cname_chain(&records, &target.name) {
            Ok(owner) => owner.to_string(),
            Err(_) => continue,
        };

        for addr in answer::addresses_for(&records, &owner) {
            if options.accepts(&addr) {
                target.add_addr(addr);
            }
        }
        if !target.addrs.is_empty() && !owner.eq_ignore_ascii_case(&target.name) {
            target.alias = Some(owner);
        }
    }
}

struct SrvJob {
    query_name: String,
    domain: String,
    default_port: u16,
    options: SrvOptions,
    targets: Vec<SrvTarget>,
    outstanding: usize,
    last_error: Option<QueryError>,
    callback: Option<SrvCallback>,
}

impl SrvJob {
    /// Hand out the callback together with the final result, once
    fn complete(&mut self, error: Option<QueryError>) -> Option<(SrvCallback, SrvResult)> {
        let callback = self.callback.take()?;

        let result = match error {
            Some(e) => Err(e),
            None => {
                let entries: Vec<SrvEntry> = self
                    .targets
                    .iter()
                    .filter(|t| !t.addrs.is_empty())
                    .map(|t| SrvEntry {
                        priority: t.priority,
                        weight: t.weight,
                        port: t.port,
                        server: AddrRecord {
                            name: t.name.clone(),
                            alias: t.alias.clone(),
                            addrs: t.addrs.clone(),
                        },
                    })
                    .collect();

                if entries.is_empty() {
                    Err(self.last_error.take().unwrap_or(QueryError::NoAnswerRecord))
                } else {
                    Ok(SrvRecord { entries })
                }
            }
        };

        match result {
            Ok(ref record) => log::debug!(
                "SRV resolution of {} found {} server(s)",
                self.query_name,
                record.entries.len()
            ),
            Err(ref e) => log::debug!("SRV resolution of {} failed: {}", self.query_name, e),
        }

        Some((callback, result))
    }
}

fn finish(job: &Mutex<SrvJob>, error: Option<QueryError>) {
    let completed = job.lock().complete(error);

    if let Some((callback, result)) = completed {
        callback(result);
    }
}

fn on_addr_response(job: &Mutex<SrvJob>, index: usize, qtype: QueryType, result: QueryResult) {
    let completed = {
        let mut job = job.lock();

        match result.and_then(|packet| answer::parse_addr_response(&packet)) {
            Ok(record) => {
                let target = &mut job.targets[index];
                if target.alias.is_none() {
                    target.alias = record.alias;
                }
                for addr in record.addrs {
                    let wanted = match qtype {
                        QueryType::Aaaa => addr.is_ipv6(),
                        _ => addr.is_ipv4(),
                    };
                    if wanted {
                        target.add_addr(addr);
                    }
                }
            }
            Err(e) => {
                log::debug!(
                    "{} lookup of SRV target {} failed: {}",
                    qtype,
                    job.targets[index].name,
                    e
                );
                job.last_error = Some(e);
            }
        }

        job.outstanding = job.outstanding.saturating_sub(1);
        if job.outstanding == 0 {
            job.complete(None)
        } else {
            None
        }
    };

    if let Some((callback, result)) = completed {
        callback(result);
    }
}

fn on_srv_response(resolver: &WeakResolver, job: &Arc<Mutex<SrvJob>>, result: QueryResult) {
    let packet = match result {
        Ok(packet) if packet.header.truncated_message => return finish(job, Some(QueryError::Truncated)),
        Ok(packet) => packet,
        Err(e) => return finish(job, Some(e)),
    };

    let (lookups, names) = {
        let mut state = job.lock();

        let mut targets = order_targets(targets_from_answer(&packet));
        if targets.is_empty() {
            if !state.options.falls_back() {
                drop(state);
                return finish(job, Some(QueryError::NoAnswerRecord));
            }

            log::debug!(
                "no SRV records for {}, looking up {} directly",
                state.query_name,
                state.domain
            );
            state.options = state.options.for_fallback();
            targets.push(SrvTarget::new(0, 0, state.default_port, &state.domain));
        } else {
            fill_from_packet(&mut targets, &packet, &state.options);
        }

        for target in targets.iter_mut() {
            if let Ok(addr) = target.name.parse::<IpAddr>() {
                if state.options.accepts(&addr) {
                    target.add_addr(addr);
                }
            }
        }

        let types = state.options.address_types();
        let mut lookups = Vec::new();
        for (index, target) in targets.iter().enumerate() {
            if target.addrs.is_empty() {
                lookups.extend(types.iter().map(|&qtype| (index, qtype)));
            }
        }

        let names: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
        state.targets = targets;
        state.outstanding = lookups.len();

        (lookups, names)
    };

    if lookups.is_empty() {
        return finish(job, None);
    }

    let resolver = match resolver.upgrade() {
        Some(resolver) => resolver,
        None => return,
    };

    for (index, qtype) in lookups {
        let sub_job = job.clone();
        let started = resolver.start_query(&names[index], qtype, CLASS_IN, move |result| {
            on_addr_response(&sub_job, index, qtype, result)
        });

        if let Err(e) = started {
            log::warn!("could not look up SRV target {}: {}", names[index], e);
            on_addr_response(job, index, qtype, Err(QueryError::Rejected(e.to_string())));
        }
    }
}

impl Resolver {
    /// Resolve the servers for `service` in `domain`
    ///
    /// `callback` runs once with every target that got at least one address,
    /// or with the error that left none.
    pub fn srv_resolve<F>(
        &self,
        domain: &str,
        service: &str,
        default_port: u16,
        options: SrvOptions,
        callback: F,
    ) -> std::result::Result<QueryHandle, ResolverError>
    where
        F: FnOnce(SrvResult) + Send + 'static,
    {
        let query_name = srv_query_name(domain.trim_end_matches('.'), service);

        let job = Arc::new(Mutex::new(SrvJob {
            query_name: query_name.clone(),
            domain: domain.trim_end_matches('.').to_string(),
            default_port,
            options: options.normalized(),
            targets: Vec::new(),
            outstanding: 0,
            last_error: None,
            callback: Some(Box::new(callback)),
        }));

        let resolver = self.downgrade();
        self.start_query(&query_name, QueryType::Srv, CLASS_IN, move |result| {
            on_srv_response(&resolver, &job, result)
        })
    }
}

#[cfg(test)]
mod tests {

    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::*;
    use crate::dns::protocol::{ResultCode, TransientTtl};
    use crate::dns::resolver::tests::{a_answer, ns, Harness, NS0};
    use crate::dns::settings::ResolverSettings;

    fn srv_collector() -> (Arc<Mutex<Vec<SrvResult>>>, impl FnOnce(SrvResult) + Send + 'static) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();

        (results, move |result| sink.lock().push(result))
    }

    fn srv_answer(query: &DnsPacket, targets: &[(u16, u16, u16, &str)]) -> DnsPacket {
        let mut response = query.reply(ResultCode::NOERROR);
        for &(priority, weight, port, host) in targets {
            response.answers.push(DnsRecord::Srv {
                domain: query.questions[0].name.clone(),
                priority,
                weight,
                port,
                host: host.to_string(),
                ttl: TransientTtl(300),
            });
        }

        response
    }

    /// Answer every query sent so far with the address mapped to its name
    fn answer_sent(h: &Harness, addrs: &HashMap<&str, &str>) -> Vec<DnsPacket> {
        let mut queries = Vec::new();
        for (payload, dest) in h.transport.take_sent() {
            let query = DnsPacket::from_bytes(&payload).unwrap();
            match addrs.get(query.questions[0].name.as_str()) {
                Some(addr) => h.respond(dest, &a_answer(&query, addr, 60)),
                None => h.respond(dest, &query.reply(ResultCode::NXDOMAIN)),
            }
            queries.push(query);
        }

        queries
    }

    fn aaaa_answer(query: &DnsPacket, addr: &str) -> DnsPacket {
        let mut response = query.reply(ResultCode::NOERROR);
        response.answers.push(DnsRecord::Aaaa {
            domain: query.questions[0].name.clone(),
            addr: addr.parse().unwrap(),
            ttl: TransientTtl(60),
        });

        response
    }

    fn start(h: &Harness, options: SrvOptions) -> Arc<Mutex<Vec<SrvResult>>> {
        let (results, callback) = srv_collector();
        h.resolver
            .srv_resolve("example.com", "_sip._udp.", 5060, options, callback)
            .unwrap();

        results
    }

    #[test]
    fn test_query_name() {
        assert_eq!("_sip._udp.example.com", srv_query_name("example.com", "_sip._udp."));
        assert_eq!("_sip._tcp.example.com", srv_query_name("example.com", "_sip._tcp"));
        assert_eq!("example.com", srv_query_name("example.com", ""));
    }

    #[test]
    fn test_additional_section_is_used() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(&h, SrvOptions::default());

        let query = h.last_query_to(ns(NS0));
        assert_eq!("_sip._udp.example.com", query.questions[0].name);
        assert_eq!(QueryType::Srv, query.questions[0].qtype);

        let mut response = srv_answer(&query, &[(1, 2, 5061, "sip1.example.com")]);
        response.resources.push(DnsRecord::A {
            domain: "sip1.example.com".to_string(),
            addr: "10.0.0.1".parse().unwrap(),
            ttl: TransientTtl(300),
        });
        h.transport.take_sent();
        h.respond(ns(NS0), &response);
        h.pump();

        // nothing left to look up
        assert!(h.transport.take_sent().is_empty());

        let results = results.lock();
        let record = results[0].as_ref().unwrap();
        assert_eq!(1, record.entries.len());
        assert_eq!(1, record.entries[0].priority);
        assert_eq!(2, record.entries[0].weight);
        assert_eq!(5061, record.entries[0].port);
        assert_eq!("sip1.example.com", record.entries[0].server.name);
        assert_eq!(vec!["10.0.0.1".parse::<IpAddr>().unwrap()], record.entries[0].server.addrs);
    }

    #[test]
    fn test_targets_are_looked_up() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(&h, SrvOptions::default());

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(
            ns(NS0),
            &srv_answer(
                &query,
                &[(10, 0, 5060, "backup.example.com"), (1, 0, 5061, "primary.example.com")],
            ),
        );
        h.pump();
        assert!(results.lock().is_empty());

        let mut addrs = HashMap::new();
        addrs.insert("primary.example.com", "10.0.0.1");
        addrs.insert("backup.example.com", "10.0.0.2");
        let lookups = answer_sent(&h, &addrs);
        assert_eq!(2, lookups.len());
        assert!(lookups.iter().all(|q| q.questions[0].qtype == QueryType::A));

        h.pump();
        {
            let results = results.lock();
            let record = results[0].as_ref().unwrap();
            let names: Vec<&str> = record.entries.iter().map(|e| e.server.name.as_str()).collect();
            assert_eq!(vec!["primary.example.com", "backup.example.com"], names);
            assert_eq!(5061, record.entries[0].port);
        }

        // everything is cached now
        let (again, callback) = srv_collector();
        h.resolver
            .srv_resolve("example.com", "_sip._udp.", 5060, SrvOptions::default(), callback)
            .unwrap();
        h.pump();
        assert!(h.transport.take_sent().is_empty());
        assert_eq!(2, again.lock()[0].as_ref().unwrap().entries.len());
    }

    #[test]
    fn test_fallback_to_bare_domain() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(&h, SrvOptions::default());

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(ns(NS0), &query.reply(ResultCode::NOERROR));
        h.pump();

        let mut addrs = HashMap::new();
        addrs.insert("example.com", "10.0.0.5");
        let lookups = answer_sent(&h, &addrs);
        assert_eq!(1, lookups.len());
        assert_eq!("example.com", lookups[0].questions[0].name);
        assert_eq!(QueryType::A, lookups[0].questions[0].qtype);

        h.pump();
        let results = results.lock();
        let record = results[0].as_ref().unwrap();
        assert_eq!(1, record.entries.len());
        assert_eq!(0, record.entries[0].priority);
        assert_eq!(5060, record.entries[0].port);
        assert_eq!("example.com", record.entries[0].server.name);
    }

    #[test]
    fn test_no_fallback_when_disabled() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(
            &h,
            SrvOptions {
                fallback_a: false,
                ..SrvOptions::default()
            },
        );

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(ns(NS0), &query.reply(ResultCode::NOERROR));
        h.pump();

        assert!(h.transport.take_sent().is_empty());
        let results = results.lock();
        match results[0] {
            Err(QueryError::NoAnswerRecord) => {}
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_answer_is_final() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(&h, SrvOptions::default());

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(ns(NS0), &query.reply(ResultCode::NXDOMAIN));
        h.pump();

        assert!(h.transport.take_sent().is_empty());
        assert_eq!(
            Some(ResultCode::NXDOMAIN),
            results.lock()[0].as_ref().unwrap_err().rcode()
        );
    }

    #[test]
    fn test_timeout_is_final() {
        let settings = ResolverSettings {
            qretr_delay_ms: 100,
            qretr_count: 1,
            ..ResolverSettings::default()
        };
        let h = Harness::new(settings);
        let results = start(&h, SrvOptions::default());

        h.advance(Duration::from_millis(100));
        assert!(results.lock()[0].as_ref().unwrap_err().is_timeout());
    }

    #[test]
    fn test_truncated_answer() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(&h, SrvOptions::default());

        let query = h.last_query_to(ns(NS0));
        let mut response = srv_answer(&query, &[(1, 0, 5060, "sip1.example.com")]);
        response.header.truncated_message = true;
        h.respond(ns(NS0), &response);
        h.pump();

        let results = results.lock();
        match results[0] {
            Err(QueryError::Truncated) => {}
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_ip_literal_target() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(&h, SrvOptions::default());

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(ns(NS0), &srv_answer(&query, &[(1, 0, 5062, "192.0.2.10")]));
        h.pump();

        assert!(h.transport.take_sent().is_empty());
        let results = results.lock();
        let record = results[0].as_ref().unwrap();
        assert_eq!(vec!["192.0.2.10".parse::<IpAddr>().unwrap()], record.entries[0].server.addrs);
    }

    #[test]
    fn test_failed_targets_are_dropped() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(&h, SrvOptions::default());

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(
            ns(NS0),
            &srv_answer(&query, &[(1, 0, 5060, "dead.example.com"), (2, 0, 5060, "alive.example.com")]),
        );
        h.pump();

        let mut addrs = HashMap::new();
        addrs.insert("alive.example.com", "10.0.0.3");
        answer_sent(&h, &addrs);
        h.pump();

        let results = results.lock();
        let record = results[0].as_ref().unwrap();
        assert_eq!(1, record.entries.len());
        assert_eq!("alive.example.com", record.entries[0].server.name);
    }

    #[test]
    fn test_all_targets_failing_reports_last_error() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(&h, SrvOptions::default());

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(ns(NS0), &srv_answer(&query, &[(1, 0, 5060, "dead.example.com")]));
        h.pump();

        answer_sent(&h, &HashMap::new());
        h.pump();

        assert_eq!(
            Some(ResultCode::NXDOMAIN),
            results.lock()[0].as_ref().unwrap_err().rcode()
        );
    }

    #[test]
    fn test_aaaa_lookups() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(
            &h,
            SrvOptions {
                resolve_aaaa: true,
                ..SrvOptions::default()
            },
        );

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(ns(NS0), &srv_answer(&query, &[(1, 0, 5060, "dual.example.com")]));
        h.pump();

        let sent: Vec<(Vec<u8>, SocketAddr)> = h.transport.take_sent();
        assert_eq!(2, sent.len());
        for (payload, dest) in sent {
            let query = DnsPacket::from_bytes(&payload).unwrap();
            let mut response = query.reply(ResultCode::NOERROR);
            match query.questions[0].qtype {
                QueryType::Aaaa => response.answers.push(DnsRecord::Aaaa {
                    domain: "dual.example.com".to_string(),
                    addr: "2001:db8::5".parse().unwrap(),
                    ttl: TransientTtl(60),
                }),
                _ => response.answers.push(DnsRecord::A {
                    domain: "dual.example.com".to_string(),
                    addr: "10.0.0.5".parse().unwrap(),
                    ttl: TransientTtl(60),
                }),
            }
            h.respond(dest, &response);
        }
        h.pump();

        let results = results.lock();
        let server = &results[0].as_ref().unwrap().entries[0].server;
        assert_eq!(1, server.ipv4().count());
        assert_eq!(1, server.ipv6().count());
    }

    #[test]
    fn test_aaaa_only_lookups() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(
            &h,
            SrvOptions {
                aaaa_only: true,
                ..SrvOptions::default()
            },
        );

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        let mut response = srv_answer(&query, &[(1, 0, 5060, "v6.example.com")]);
        // an IPv4 address in the additional section does not count
        response.resources.push(DnsRecord::A {
            domain: "v6.example.com".to_string(),
            addr: "10.0.0.6".parse().unwrap(),
            ttl: TransientTtl(300),
        });
        h.respond(ns(NS0), &response);
        h.pump();

        let sent = h.transport.take_sent();
        assert_eq!(1, sent.len());
        let (payload, dest) = &sent[0];
        let lookup = DnsPacket::from_bytes(payload).unwrap();
        assert_eq!("v6.example.com", lookup.questions[0].name);
        assert_eq!(QueryType::Aaaa, lookup.questions[0].qtype);

        h.respond(*dest, &aaaa_answer(&lookup, "2001:db8::6"));
        h.pump();

        let results = results.lock();
        let server = &results[0].as_ref().unwrap().entries[0].server;
        assert_eq!(vec!["2001:db8::6".parse::<IpAddr>().unwrap()], server.addrs);
    }

    #[test]
    fn test_aaaa_only_skips_ipv4_literal() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(
            &h,
            SrvOptions {
                aaaa_only: true,
                ..SrvOptions::default()
            },
        );

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(
            ns(NS0),
            &srv_answer(&query, &[(1, 0, 5060, "192.0.2.10"), (2, 0, 5060, "2001:db8::10")]),
        );
        h.pump();

        let lookups: Vec<DnsPacket> = h
            .transport
            .take_sent()
            .iter()
            .map(|(payload, _)| DnsPacket::from_bytes(payload).unwrap())
            .collect();
        assert_eq!(1, lookups.len());
        assert_eq!("192.0.2.10", lookups[0].questions[0].name);
        assert_eq!(QueryType::Aaaa, lookups[0].questions[0].qtype);

        h.respond(ns(NS0), &lookups[0].reply(ResultCode::NXDOMAIN));
        h.pump();

        let results = results.lock();
        let record = results[0].as_ref().unwrap();
        assert_eq!(1, record.entries.len());
        assert_eq!(vec!["2001:db8::10".parse::<IpAddr>().unwrap()], record.entries[0].server.addrs);
    }

    #[test]
    fn test_fallback_aaaa() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(
            &h,
            SrvOptions {
                fallback_a: false,
                fallback_aaaa: true,
                ..SrvOptions::default()
            },
        );

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(ns(NS0), &query.reply(ResultCode::NOERROR));
        h.pump();

        let sent = h.transport.take_sent();
        assert_eq!(1, sent.len());
        let (payload, dest) = &sent[0];
        let lookup = DnsPacket::from_bytes(payload).unwrap();
        assert_eq!("example.com", lookup.questions[0].name);
        assert_eq!(QueryType::Aaaa, lookup.questions[0].qtype);

        h.respond(*dest, &aaaa_answer(&lookup, "2001:db8::1"));
        h.pump();

        let results = results.lock();
        let record = results[0].as_ref().unwrap();
        assert_eq!(1, record.entries.len());
        assert_eq!(5060, record.entries[0].port);
        assert_eq!(vec!["2001:db8::1".parse::<IpAddr>().unwrap()], record.entries[0].server.addrs);
    }

    #[test]
    fn test_fallback_a_and_aaaa() {
        let h = Harness::new(ResolverSettings::default());
        let results = start(
            &h,
            SrvOptions {
                fallback_aaaa: true,
                ..SrvOptions::default()
            },
        );

        let query = h.last_query_to(ns(NS0));
        h.transport.take_sent();
        h.respond(ns(NS0), &query.reply(ResultCode::NOERROR));
        h.pump();

        let sent = h.transport.take_sent();
        let mut qtypes = Vec::new();
        for (payload, dest) in &sent {
            let lookup = DnsPacket::from_bytes(payload).unwrap();
            assert_eq!("example.com", lookup.questions[0].name);
            qtypes.push(lookup.questions[0].qtype);
            match lookup.questions[0].qtype {
                QueryType::Aaaa => h.respond(*dest, &aaaa_answer(&lookup, "2001:db8::1")),
                _ => h.respond(*dest, &a_answer(&lookup, "10.0.0.1", 60)),
            }
        }
        assert_eq!(vec![QueryType::A, QueryType::Aaaa], qtypes);
        h.pump();

        let results = results.lock();
        let server = &results[0].as_ref().unwrap().entries[0].server;
        assert_eq!(1, server.ipv4().count());
        assert_eq!(1, server.ipv6().count());
    }

    #[test]
    fn test_option_rules() {
        let aaaa_only = SrvOptions {
            aaaa_only: true,
            ..SrvOptions::default()
        }
        .normalized();
        assert!(aaaa_only.resolve_aaaa);
        assert_eq!(vec![QueryType::Aaaa], aaaa_only.address_types());
        assert!(!aaaa_only.accepts(&"10.0.0.1".parse().unwrap()));

        assert_eq!(vec![QueryType::A], SrvOptions::default().address_types());
        assert!(!SrvOptions::default().accepts(&"2001:db8::1".parse().unwrap()));

        // the fallback does not inherit how targets were resolved
        let fallback = SrvOptions {
            resolve_aaaa: true,
            ..SrvOptions::default()
        }
        .for_fallback();
        assert_eq!(vec![QueryType::A], fallback.address_types());

        let fallback = SrvOptions {
            fallback_a: false,
            fallback_aaaa: true,
            ..SrvOptions::default()
        }
        .for_fallback();
        assert_eq!(vec![QueryType::Aaaa], fallback.address_types());

        let none = SrvOptions {
            fallback_a: false,
            ..SrvOptions::default()
        };
        assert!(!none.falls_back());
    }

    #[test]
    fn test_order_targets() {
        let targets = vec![
            SrvTarget::new(20, 5, 5060, "c.example.com"),
            SrvTarget::new(10, 0, 5060, "a.example.com"),
            SrvTarget::new(10, 60, 5060, "b.example.com"),
            SrvTarget::new(10, 40, 5060, "d.example.com"),
        ];

        for _ in 0..20 {
            let ordered = order_targets(targets.clone());
            assert_eq!(4, ordered.len());
            let priorities: Vec<u16> = ordered.iter().map(|t| t.priority).collect();
            assert_eq!(vec![10, 10, 10, 20], priorities);
            assert_eq!("c.example.com", ordered[3].name);
        }
    }

    #[test]
    fn test_entry_limit() {
        let query = DnsPacket::query(1, "_sip._udp.example.com", QueryType::Srv, CLASS_IN);
        let hosts: Vec<String> = (0..12).map(|i| format!("s{}.example.com", i)).collect();
        let targets: Vec<(u16, u16, u16, &str)> = hosts.iter().map(|h| (1, 0, 5060, h.as_str())).collect();

        assert_eq!(MAX_SRV_ENTRIES, targets_from_answer(&srv_answer(&query, &targets)).len());
    }
}
