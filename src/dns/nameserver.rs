//! Nameserver registry and the resolver-wide failover state machine
//!
//! The resolver starts out probing: a new query goes to every configured
//! nameserver. The first nameserver to give an acceptable answer becomes the
//! active one and gets all new queries until its window runs out, at which
//! point the next query goes to every nameserver again. A nameserver that lets a query run out
//! of retransmissions, or that refuses to serve us, is marked bad for a while.
//! Bad nameservers still get queries, they are only sent to last.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_derive::Serialize;

use crate::dns::protocol::ResultCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NameserverHealth {
    Good,
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverMode {
    Probing,
    Active { index: usize, until: Instant },
}

#[derive(Debug, Clone)]
pub struct Nameserver {
    pub addr: SocketAddr,
    health: NameserverHealth,
    bad_until: Option<Instant>,
    rtt: Option<Duration>,
}

impl Nameserver {
    fn new(addr: SocketAddr) -> Nameserver {
        Nameserver {
            addr,
            health: NameserverHealth::Good,
            bad_until: None,
            rtt: None,
        }
    }

    /// Health as of `now`, a bad mark lapses once `bad_until` has passed
    pub fn health(&self, now: Instant) -> NameserverHealth {
        match (self.health, self.bad_until) {
            (NameserverHealth::Bad, Some(until)) if now >= until => NameserverHealth::Good,
            (health, _) => health,
        }
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NameserverSnapshot {
    pub addr: SocketAddr,
    pub health: NameserverHealth,
    pub bad_for_secs: Option<u64>,
    pub rtt_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ModeSnapshot {
    Probing,
    Active { nameserver: SocketAddr, remaining_secs: u64 },
}

#[derive(Debug)]
pub struct NameserverRegistry {
    servers: Vec<Nameserver>,
    mode: ResolverMode,
}

impl NameserverRegistry {
    pub fn new(addrs: &[SocketAddr]) -> NameserverRegistry {
        NameserverRegistry {
            servers: addrs.iter().copied().map(Nameserver::new).collect(),
            mode: ResolverMode::Probing,
        }
    }

    /// Replace the nameserver list, forgetting all health and failover state
    pub fn set_nameservers(&mut self, addrs: &[SocketAddr]) {
        self.servers = addrs.iter().copied().map(Nameserver::new).collect();
        self.mode = ResolverMode::Probing;
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.servers.iter().map(|ns| ns.addr).collect()
    }

    pub fn get(&self, index: usize) -> Option<&Nameserver> {
        self.servers.get(index)
    }

    pub fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.servers.iter().position(|ns| ns.addr == addr)
    }

    /// Current mode, with an expired active window already reverted
    pub fn mode(&mut self, now: Instant) -> ResolverMode {
        if let ResolverMode::Active { index, until } = self.mode {
            if now >= until {
                log::info!(
                    "active nameserver {} window expired, probing again",
                    self.servers[index].addr
                );
                self.mode = ResolverMode::Probing;
            }
        }

        self.mode
    }

    /// Nameservers a new query should be sent to
    ///
    /// One nameserver while one is active, otherwise all of them with the
    /// currently bad ones last.
    pub fn select(&mut self, now: Instant) -> Vec<SocketAddr> {
        if let ResolverMode::Active { index, .. } = self.mode(now) {
            return vec![self.servers[index].addr];
        }

        let (good, bad): (Vec<&Nameserver>, Vec<&Nameserver>) = self
            .servers
            .iter()
            .partition(|ns| ns.health(now) == NameserverHealth::Good);

        good.into_iter().chain(bad).map(|ns| ns.addr).collect()
    }

    /// Account for a datagram received from `addr`
    ///
    /// `rescode` is `None` when the datagram could not be parsed. `rtt` is set
    /// when the datagram answered a query we sent to this nameserver.
    pub fn record_response(
        &mut self,
        addr: SocketAddr,
        rescode: Option<ResultCode>,
        rtt: Option<Duration>,
        now: Instant,
        good_ttl: Duration,
        bad_ttl: Duration,
    ) {
        let index = match self.index_of(addr) {
            Some(index) => index,
            None => return,
        };

        let refused = match rescode {
            None => true,
            Some(ResultCode::REFUSED) | Some(ResultCode::NOTAUTH) => true,
            Some(_) => false,
        };

        if refused {
            log::warn!("nameserver {} answered with {:?}, marking bad", addr, rescode);
            self.mark_bad(index, now, bad_ttl);
            return;
        }

        {
            let ns = &mut self.servers[index];
            ns.health = NameserverHealth::Good;
            ns.bad_until = None;
            if rtt.is_some() {
                ns.rtt = rtt;
            }
        }

        if self.mode(now) == ResolverMode::Probing {
            log::info!(
                "nameserver {} is now active for {}s",
                addr,
                good_ttl.as_secs()
            );
            self.mode = ResolverMode::Active {
                index,
                until: now + good_ttl,
            };
        }
    }

    /// A query ran out of retransmissions on `addr` without an answer
    pub fn record_exhausted(&mut self, addr: SocketAddr, now: Instant, bad_ttl: Duration) {
        if let Some(index) = self.index_of(addr) {
            log::warn!("nameserver {} did not answer, marking bad", addr);
            self.mark_bad(index, now, bad_ttl);
        }
    }

    fn mark_bad(&mut self, index: usize, now: Instant, bad_ttl: Duration) {
        let ns = &mut self.servers[index];
        ns.health = NameserverHealth::Bad;
        ns.bad_until = Some(now + bad_ttl);

        if let ResolverMode::Active { index: active, .. } = self.mode {
            if active == index {
                log::info!("active nameserver {} failed, probing again", ns.addr);
                self.mode = ResolverMode::Probing;
            }
        }
    }

    pub fn snapshot(&mut self, now: Instant) -> (ModeSnapshot, Vec<NameserverSnapshot>) {
        let mode = match self.mode(now) {
            ResolverMode::Probing => ModeSnapshot::Probing,
            ResolverMode::Active { index, until } => ModeSnapshot::Active {
                nameserver: self.servers[index].addr,
                remaining_secs: until.saturating_duration_since(now).as_secs(),
            },
        };

        let servers = self
            .servers
            .iter()
            .map(|ns| NameserverSnapshot {
                addr: ns.addr,
                health: ns.health(now),
                bad_for_secs: match ns.health(now) {
                    NameserverHealth::Bad => ns
                        .bad_until
                        .map(|until| until.saturating_duration_since(now).as_secs()),
                    NameserverHealth::Good => None,
                },
                rtt_ms: ns.rtt.map(|rtt| rtt.as_millis() as u64),
            })
            .collect();

        (mode, servers)
    }
}
