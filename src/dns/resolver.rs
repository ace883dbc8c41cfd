//! The stub resolver
//!
//! A `Resolver` owns a nameserver registry, a response cache and the set of
//! queries in flight. Nothing happens in the background on its own: the
//! owner calls `handle_events` in a loop, or hands the resolver to a
//! `ResolverThread` that does so. Each call runs callbacks that are ready,
//! fires expired retransmission timers and reads incoming responses.
//!
//! All state sits behind one lock. Callbacks always run after that lock has
//! been released, so a callback is free to start new queries on the same
//! resolver.

use std::cmp::min;
use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};
use parking_lot::Mutex;
use serde_derive::Serialize;

use crate::dns::buffer::BytePacketBuffer;
use crate::dns::cache::{CacheKey, CacheStats, CachedResponse, ResponseCache};
use crate::dns::nameserver::{ModeSnapshot, NameserverRegistry, NameserverSnapshot};
use crate::dns::protocol::{DnsPacket, ProtocolError, QueryType};
use crate::dns::query::{
    packet_result, Delivery, PendingQuery, QueryCallback, QueryError, QueryHandle, QueryResult, ResponseAction,
    RetransmitTimer, TimeoutAction,
};
use crate::dns::settings::{ResolverConfig, ResolverSettings, SettingsError, MAX_NAMESERVERS};
use crate::dns::timer::{Clock, SystemClock, TimerHeap};
use crate::dns::transport::{Transport, UdpTransport};

#[derive(Debug, Display, From, Error)]
pub enum ResolverError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Settings(SettingsError),
    #[display(fmt = "invalid domain name `{}`", _0)]
    #[from(ignore)]
    InvalidName(#[error(not(source))] String),
    #[display(fmt = "packet has no question")]
    MissingQuestion,
    #[display(fmt = "no nameservers configured")]
    NoNameservers,
    #[display(fmt = "at most {} nameservers are supported", MAX_NAMESERVERS)]
    TooManyNameservers,
    #[display(fmt = "too many queries in flight")]
    Busy,
    #[display(fmt = "resolver has been destroyed")]
    Destroyed,
}

type Result<T> = std::result::Result<T, ResolverError>;

/// Datagrams read per `handle_events` call at most
const MAX_DATAGRAMS_PER_POLL: usize = 64;

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim_end_matches('.');

    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_NAME_LEN
        && trimmed
            .split('.')
            .all(|label| !label.is_empty() && label.len() <= MAX_LABEL_LEN);

    if valid {
        Ok(())
    } else {
        Err(ResolverError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResolverCounters {
    pub queries_sent: u64,
    pub send_failures: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub cache_hits: u64,
}

/// Point-in-time view of a resolver, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ResolverSnapshot {
    pub name: String,
    pub mode: ModeSnapshot,
    pub nameservers: Vec<NameserverSnapshot>,
    pub pending_queries: usize,
    pub armed_timers: usize,
    pub cache: Vec<CachedResponse>,
    pub cache_stats: CacheStats,
    pub counters: ResolverCounters,
    pub settings: ResolverSettings,
}

/// Send the query to `addr` and arm its retransmission timer
///
/// A failed send still counts as a transmission, so an unreachable
/// nameserver burns through its retries like a silent one.
fn transmit(
    transport: &dyn Transport,
    timers: &mut TimerHeap<RetransmitTimer>,
    counters: &mut ResolverCounters,
    query: &mut PendingQuery,
    addr: SocketAddr,
    now: Instant,
) {
    match transport.send_to(&query.payload, addr) {
        Ok(_) => {
            counters.queries_sent += 1;
            log::debug!(
                "sent query {} for {} {} to {}",
                query.id,
                query.key.name,
                query.key.qtype,
                addr
            );
        }
        Err(e) => {
            counters.send_failures += 1;
            log::warn!("failed to send query {} to {}: {}", query.id, addr, e);
        }
    }

    let timer = timers.schedule(
        now + query.retr_delay,
        RetransmitTimer { id: query.id, addr },
    );
    query.note_transmit(addr, timer, now);
}

struct ResolverState {
    settings: ResolverSettings,
    nameservers: NameserverRegistry,
    cache: ResponseCache,
    pending: HashMap<u16, PendingQuery>,
    by_key: HashMap<CacheKey, u16>,
    timers: TimerHeap<RetransmitTimer>,
    ready: Vec<Delivery>,
    counters: ResolverCounters,
    destroyed: bool,
}

impl ResolverState {
    fn allocate_id(&self) -> Result<u16> {
        // id zero is never used
        if self.pending.len() >= usize::from(u16::MAX) - 1 {
            return Err(ResolverError::Busy);
        }

        loop {
            let id = rand::random::<u16>();
            if id != 0 && !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    fn start_query(
        &mut self,
        name: &str,
        qtype: QueryType,
        qclass: u16,
        callback: QueryCallback,
        now: Instant,
        transport: &dyn Transport,
    ) -> Result<QueryHandle> {
        if self.destroyed {
            return Err(ResolverError::Destroyed);
        }

        let key = CacheKey::new(name, qtype, qclass);

        if let Some(packet) = self.cache.lookup(&key, now) {
            log::debug!("cache hit for {} {}", key.name, qtype);
            self.counters.cache_hits += 1;
            self.ready.push(Delivery::new(vec![callback], packet_result(packet)));
            return Ok(QueryHandle::Cached);
        }

        if let Some(&id) = self.by_key.get(&key) {
            if let Some(query) = self.pending.get_mut(&id) {
                log::debug!("joining query {} for {} {}", id, key.name, qtype);
                query.callbacks.push(callback);
                return Ok(QueryHandle::Coalesced { id });
            }
        }

        if self.nameservers.is_empty() {
            return Err(ResolverError::NoNameservers);
        }

        let id = self.allocate_id()?;
        let payload = DnsPacket::query(id, &key.name, qtype, qclass).to_bytes()?;
        let mut query = PendingQuery::new(
            id,
            key.clone(),
            payload,
            self.settings.qretr_count,
            self.settings.qretr_delay(),
            callback,
        );

        for addr in self.nameservers.select(now) {
            transmit(
                transport,
                &mut self.timers,
                &mut self.counters,
                &mut query,
                addr,
                now,
            );
        }

        self.by_key.insert(key, id);
        self.pending.insert(id, query);

        Ok(QueryHandle::Sent { id })
    }

    fn on_timer(&mut self, timer: RetransmitTimer, now: Instant, transport: &dyn Transport) -> Option<Delivery> {
        let bad_ttl = self.settings.bad_ns_ttl();
        let query = self.pending.get_mut(&timer.id)?;
        let mut delivery = None;

        match query.on_timeout(timer.addr) {
            TimeoutAction::Ignore => {}
            TimeoutAction::Retransmit => {
                log::debug!(
                    "no answer from {} for query {}, retransmitting ({}/{})",
                    timer.addr,
                    query.id,
                    query.transmits(timer.addr) + 1,
                    query.retr_count
                );
                transmit(
                    transport,
                    &mut self.timers,
                    &mut self.counters,
                    query,
                    timer.addr,
                    now,
                );
            }
            TimeoutAction::Exhausted => {
                self.nameservers.record_exhausted(timer.addr, now, bad_ttl);

                if !query.is_completed() && query.all_exhausted() {
                    let others: Vec<SocketAddr> = self
                        .nameservers
                        .select(now)
                        .into_iter()
                        .filter(|addr| !query.has_candidate(*addr))
                        .collect();

                    if !others.is_empty() && query.widen() {
                        log::info!(
                            "query {} for {} got no answer, trying {} other nameserver(s)",
                            query.id,
                            query.key.name,
                            others.len()
                        );
                        for addr in others {
                            transmit(
                                transport,
                                &mut self.timers,
                                &mut self.counters,
                                query,
                                addr,
                                now,
                            );
                        }
                    } else {
                        log::warn!(
                            "query {} for {} {} timed out",
                            query.id,
                            query.key.name,
                            query.key.qtype
                        );
                        self.counters.timeouts += 1;
                        if self.by_key.get(&query.key) == Some(&query.id) {
                            self.by_key.remove(&query.key);
                        }
                        delivery = Some(Delivery::new(query.complete(), Err(QueryError::Timeout)));
                    }
                }
            }
        }

        self.retire(timer.id);
        delivery
    }

    fn on_datagram(&mut self, bytes: &[u8], src: SocketAddr, now: Instant) -> Option<Delivery> {
        let good_ttl = self.settings.good_ns_ttl();
        let bad_ttl = self.settings.bad_ns_ttl();

        let packet = match DnsPacket::from_bytes(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("discarding malformed datagram from {}: {}", src, e);
                self.nameservers
                    .record_response(src, None, None, now, good_ttl, bad_ttl);
                return None;
            }
        };

        if !packet.header.response {
            log::debug!("discarding non-response datagram from {}", src);
            return None;
        }

        let id = packet.header.id;
        let query = match self.pending.get_mut(&id) {
            Some(query) => query,
            None => {
                log::debug!("discarding response {} from {}, no such query", id, src);
                return None;
            }
        };

        if let Some(key) = CacheKey::for_packet(&packet) {
            if key != query.key {
                log::debug!(
                    "discarding response {} from {}, question {} {} does not match",
                    id,
                    src,
                    key.name,
                    key.qtype
                );
                return None;
            }
        }

        let (timer, rtt, first) = match query.on_response(src, now) {
            ResponseAction::NotCandidate => {
                log::debug!("discarding response {} from unexpected source {}", id, src);
                return None;
            }
            ResponseAction::First { timer, rtt } => (timer, rtt, true),
            ResponseAction::Late { timer, rtt } => (timer, rtt, false),
        };

        if let Some(timer) = timer {
            self.timers.cancel(timer);
        }
        self.counters.responses += 1;
        self.nameservers.record_response(
            src,
            Some(packet.header.rescode),
            Some(rtt),
            now,
            good_ttl,
            bad_ttl,
        );

        let mut delivery = None;
        if first {
            log::debug!(
                "query {} for {} answered by {} with {} in {}ms",
                id,
                query.key.name,
                src,
                packet.header.rescode,
                rtt.as_millis()
            );

            let callbacks = query.complete();
            if self.by_key.get(&query.key) == Some(&id) {
                self.by_key.remove(&query.key);
            }
            self.cache
                .store(query.key.clone(), &packet, now, &self.settings);

            delivery = Some(Delivery::new(callbacks, packet_result(packet)));
        } else {
            log::debug!("late response {} from {}", id, src);
        }

        self.retire(id);
        delivery
    }

    /// Forget a query once it has completed and no nameserver is left to hear from
    fn retire(&mut self, id: u16) {
        let done = match self.pending.get(&id) {
            Some(query) => query.is_completed() && query.all_settled(),
            None => false,
        };

        if done {
            self.pending.remove(&id);
        }
    }
}

struct Inner {
    name: String,
    state: Mutex<ResolverState>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
}

/// Handle to a resolver instance, clones share the same resolver
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

/// A resolver handle that does not keep the resolver alive
#[derive(Clone)]
pub struct WeakResolver {
    inner: Weak<Inner>,
}

impl WeakResolver {
    pub fn upgrade(&self) -> Option<Resolver> {
        self.inner.upgrade().map(|inner| Resolver { inner })
    }
}

impl Resolver {
    pub fn new(
        name: &str,
        settings: ResolverSettings,
        nameservers: &[SocketAddr],
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Resolver> {
        settings.validate()?;
        if nameservers.len() > MAX_NAMESERVERS {
            return Err(ResolverError::TooManyNameservers);
        }

        log::info!(
            "creating resolver {} with {} nameserver(s)",
            name,
            nameservers.len()
        );

        let state = ResolverState {
            settings,
            nameservers: NameserverRegistry::new(nameservers),
            cache: ResponseCache::new(),
            pending: HashMap::new(),
            by_key: HashMap::new(),
            timers: TimerHeap::new(),
            ready: Vec::new(),
            counters: ResolverCounters::default(),
            destroyed: false,
        };

        Ok(Resolver {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(state),
                transport,
                clock,
            }),
        })
    }

    /// A resolver on fresh UDP sockets, set up from configuration
    pub fn from_config(name: &str, config: &ResolverConfig) -> Result<Resolver> {
        let nameservers = config.nameserver_addrs()?;
        let transport = UdpTransport::bind()?;

        Resolver::new(
            name,
            config.settings.clone(),
            &nameservers,
            Arc::new(transport),
            Arc::new(SystemClock),
        )
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn downgrade(&self) -> WeakResolver {
        WeakResolver {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn settings(&self) -> ResolverSettings {
        self.inner.state.lock().settings.clone()
    }

    /// Replace the settings; queries already in flight keep the old ones
    pub fn set_settings(&self, settings: ResolverSettings) -> Result<()> {
        settings.validate()?;
        log::info!("resolver {} settings updated: {:?}", self.inner.name, settings);
        self.inner.state.lock().settings = settings;

        Ok(())
    }

    pub fn nameservers(&self) -> Vec<SocketAddr> {
        self.inner.state.lock().nameservers.addrs()
    }

    /// Replace the nameserver list and start probing again from scratch
    pub fn set_nameservers(&self, nameservers: &[SocketAddr]) -> Result<()> {
        if nameservers.is_empty() {
            return Err(ResolverError::NoNameservers);
        }
        if nameservers.len() > MAX_NAMESERVERS {
            return Err(ResolverError::TooManyNameservers);
        }

        let mut state = self.inner.state.lock();
        if state.destroyed {
            return Err(ResolverError::Destroyed);
        }

        log::info!(
            "resolver {} nameservers set to {:?}",
            self.inner.name,
            nameservers
        );
        state.nameservers.set_nameservers(nameservers);

        Ok(())
    }

    /// Start resolving `name`
    ///
    /// `callback` runs exactly once, from a later `handle_events` call, unless
    /// the resolver is destroyed first. That holds for cache hits too.
    pub fn start_query<F>(&self, name: &str, qtype: QueryType, qclass: u16, callback: F) -> Result<QueryHandle>
    where
        F: FnOnce(QueryResult) + Send + 'static,
    {
        validate_name(name)?;

        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        state.start_query(
            name,
            qtype,
            qclass,
            Box::new(callback),
            now,
            &*self.inner.transport,
        )
    }

    /// Put a response into the cache as if a nameserver had sent it
    pub fn add_entry(&self, packet: &DnsPacket) -> Result<()> {
        let key = CacheKey::for_packet(packet).ok_or(ResolverError::MissingQuestion)?;
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        if state.destroyed {
            return Err(ResolverError::Destroyed);
        }

        let ResolverState {
            ref mut cache,
            ref settings,
            ..
        } = *state;
        if cache.store(key.clone(), packet, now, settings).is_none() {
            log::debug!("entry for {} {} was not cached", key.name, key.qtype);
        }

        Ok(())
    }

    pub fn cached_count(&self) -> usize {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        state.cache.purge_expired(now);

        state.cache.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    pub fn snapshot(&self) -> ResolverSnapshot {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        let (mode, nameservers) = state.nameservers.snapshot(now);

        ResolverSnapshot {
            name: self.inner.name.clone(),
            mode,
            nameservers,
            pending_queries: state.pending.len(),
            armed_timers: state.timers.len(),
            cache: state.cache.list(now),
            cache_stats: state.cache.stats(),
            counters: state.counters,
            settings: state.settings.clone(),
        }
    }

    /// Write the resolver's state to the log
    pub fn dump(&self) {
        let snapshot = self.snapshot();

        log::info!("resolver {} dump", snapshot.name);
        log::info!("  mode: {:?}", snapshot.mode);
        for ns in &snapshot.nameservers {
            log::info!(
                "  nameserver {}: {:?} (bad for {:?}s, rtt {:?}ms)",
                ns.addr,
                ns.health,
                ns.bad_for_secs,
                ns.rtt_ms
            );
        }
        log::info!(
            "  {} pending queries, {} armed timers",
            snapshot.pending_queries,
            snapshot.armed_timers
        );
        log::info!("  {} cached responses", snapshot.cache.len());
        for entry in &snapshot.cache {
            log::info!(
                "    {} {}: {} answers, {}s left",
                entry.key.name,
                entry.key.qtype,
                entry.answers,
                entry.remaining_secs
            );
        }
    }

    /// Cancel every query and timer and drop the cache
    ///
    /// No callback runs after this returns. Further calls to `start_query`
    /// fail with `ResolverError::Destroyed`.
    pub fn destroy(&self) {
        let (pending, ready) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }

            state.destroyed = true;
            state.timers.clear();
            state.by_key.clear();
            state.cache.clear();

            (mem::take(&mut state.pending), mem::take(&mut state.ready))
        };

        log::info!(
            "resolver {} destroyed, {} pending queries cancelled",
            self.inner.name,
            pending.len()
        );

        // callbacks are dropped outside the lock, their captures may hold
        // resolver handles
        drop(pending);
        drop(ready);
    }

    /// Run one round of the event loop
    ///
    /// Waits at most `max_wait` for a datagram, less if a timer is due
    /// sooner. Returns the number of callbacks that ran.
    pub fn handle_events(&self, max_wait: Duration) -> usize {
        let mut count = self.run_ready();
        count += self.fire_timers();

        let wait = {
            let now = self.inner.clock.now();
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return count;
            }

            if !state.ready.is_empty() {
                Duration::from_secs(0)
            } else {
                match state.timers.next_deadline() {
                    Some(deadline) => min(max_wait, deadline.saturating_duration_since(now)),
                    None => max_wait,
                }
            }
        };

        let mut buffer = BytePacketBuffer::new();
        let mut timeout = wait;
        for _ in 0..MAX_DATAGRAMS_PER_POLL {
            match self.inner.transport.recv_from(&mut buffer.buf, timeout) {
                Ok(Some((len, src))) => {
                    let now = self.inner.clock.now();
                    let delivery = {
                        let mut state = self.inner.state.lock();
                        if state.destroyed {
                            return count;
                        }
                        state.on_datagram(&buffer.buf[..len], src, now)
                    };
                    count += self.dispatch(delivery);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("resolver {} receive failed: {}", self.inner.name, e);
                    break;
                }
            }

            timeout = Duration::from_secs(0);
        }

        count += self.fire_timers();
        count += self.run_ready();

        count
    }

    fn fire_timers(&self) -> usize {
        let now = self.inner.clock.now();

        let deliveries: Vec<Delivery> = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return 0;
            }

            let expired = state.timers.poll_expired(now);
            expired
                .into_iter()
                .filter_map(|timer| state.on_timer(timer, now, &*self.inner.transport))
                .collect()
        };

        self.dispatch(deliveries)
    }

    fn run_ready(&self) -> usize {
        let ready = mem::take(&mut self.inner.state.lock().ready);
        self.dispatch(ready)
    }

    fn dispatch<I>(&self, deliveries: I) -> usize
    where
        I: IntoIterator<Item = Delivery>,
    {
        let mut count = 0;
        for delivery in deliveries {
            // a callback may have destroyed the resolver
            if self.is_destroyed() {
                break;
            }
            count += delivery.run();
        }

        count
    }
}

/// A thread that keeps calling `handle_events` on a resolver
///
/// The thread stops when `stop` is called, when the handle is dropped, or
/// once the resolver is destroyed.
pub struct ResolverThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ResolverThread {
    pub fn spawn(resolver: Resolver, poll_interval: Duration) -> Result<ResolverThread> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let handle = Builder::new()
            .name(format!("{}-events", resolver.name()))
            .spawn(move || {
                log::debug!("resolver {} event thread started", resolver.name());
                while !flag.load(Ordering::Acquire) && !resolver.is_destroyed() {
                    resolver.handle_events(poll_interval);
                }
                log::debug!("resolver {} event thread stopped", resolver.name());
            })?;

        Ok(ResolverThread {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("resolver event thread panicked");
            }
        }
    }
}

impl Drop for ResolverThread {
    fn drop(&mut self) {
        self.stop();
    }
}
