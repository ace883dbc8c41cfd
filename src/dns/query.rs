//! In-flight queries and what their callbacks receive
//!
//! A `PendingQuery` knows which nameservers it was sent to and how far each
//! of them got. The resolver drives it through two transitions, a
//! retransmission timer firing (`on_timeout`) and a datagram arriving
//! (`on_response`), and acts on what they return.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use derive_more::{Display, Error};

use crate::dns::cache::CacheKey;
use crate::dns::protocol::{DnsPacket, ResultCode};
use crate::dns::timer::TimerId;

/// Why a query produced no usable answer
#[derive(Debug, Clone, Display, Error)]
pub enum QueryError {
    /// The nameserver answered with an error rcode, the response is kept
    #[display(fmt = "nameserver answered {}", rcode)]
    Rcode {
        rcode: ResultCode,
        packet: Box<DnsPacket>,
    },
    #[display(fmt = "no nameserver answered")]
    Timeout,
    #[display(fmt = "no usable record in the answer")]
    NoAnswerRecord,
    #[display(fmt = "CNAME chain too long")]
    CnameLoop,
    #[display(fmt = "response was truncated")]
    Truncated,
    #[display(fmt = "query could not be started: {}", _0)]
    Rejected(#[error(not(source))] String),
}

impl QueryError {
    pub fn rcode(&self) -> Option<ResultCode> {
        match *self {
            QueryError::Rcode { rcode, .. } => Some(rcode),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(*self, QueryError::Timeout)
    }
}

pub type QueryResult = std::result::Result<DnsPacket, QueryError>;

pub type QueryCallback = Box<dyn FnOnce(QueryResult) + Send>;

/// Turn a response into what a callback gets: the packet, or the rcode
/// error carrying it.
pub fn packet_result(packet: DnsPacket) -> QueryResult {
    if packet.header.rescode.is_error() {
        Err(QueryError::Rcode {
            rcode: packet.header.rescode,
            packet: Box::new(packet),
        })
    } else {
        Ok(packet)
    }
}

/// What `start_query` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryHandle {
    /// Answered from the cache, the callback runs on the next poll
    Cached,
    /// Attached to an identical query already in flight
    Coalesced { id: u16 },
    /// Sent to the network under a new transaction id
    Sent { id: u16 },
}

/// Callbacks ready to run, paired with their result
pub struct Delivery {
    callbacks: Vec<QueryCallback>,
    result: QueryResult,
}

impl Delivery {
    pub fn new(callbacks: Vec<QueryCallback>, result: QueryResult) -> Delivery {
        Delivery { callbacks, result }
    }

    /// Run every callback, returning how many ran
    pub fn run(self) -> usize {
        let count = self.callbacks.len();
        let mut callbacks = self.callbacks;

        if let Some(last) = callbacks.pop() {
            for callback in callbacks {
                callback(self.result.clone());
            }
            last(self.result);
        }

        count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Waiting(TimerId),
    Answered,
    Exhausted,
}

#[derive(Debug)]
struct Candidate {
    addr: SocketAddr,
    transmits: u32,
    last_sent: Instant,
    state: CandidateState,
}

/// Payload of a retransmission timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitTimer {
    pub id: u16,
    pub addr: SocketAddr,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Send the query to this nameserver again
    Retransmit,
    /// The nameserver used up its transmissions
    Exhausted,
    /// Stale timer, nothing to do
    Ignore,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseAction {
    /// The first answer to this query
    First { timer: Option<TimerId>, rtt: Duration },
    /// An answer after the query completed, only good for health tracking
    Late { timer: Option<TimerId>, rtt: Duration },
    /// Not from a nameserver this query was sent to
    NotCandidate,
}

pub struct PendingQuery {
    pub id: u16,
    pub key: CacheKey,
    pub payload: Vec<u8>,
    pub retr_count: u32,
    pub retr_delay: Duration,
    pub callbacks: Vec<QueryCallback>,
    completed: bool,
    widened: bool,
    candidates: Vec<Candidate>,
}

impl PendingQuery {
    pub fn new(
        id: u16,
        key: CacheKey,
        payload: Vec<u8>,
        retr_count: u32,
        retr_delay: Duration,
        callback: QueryCallback,
    ) -> PendingQuery {
        PendingQuery {
            id,
            key,
            payload,
            retr_count,
            retr_delay,
            callbacks: vec![callback],
            completed: false,
            widened: false,
            candidates: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Mark the query as answered or failed, handing back its callbacks
    pub fn complete(&mut self) -> Vec<QueryCallback> {
        self.completed = true;
        self.callbacks.drain(..).collect()
    }

    pub fn has_candidate(&self, addr: SocketAddr) -> bool {
        self.candidates.iter().any(|c| c.addr == addr)
    }

    /// Whether the query was already widened to more nameservers once
    pub fn widen(&mut self) -> bool {
        let first = !self.widened;
        self.widened = true;
        first
    }

    /// Record a transmission to `addr` with its freshly armed timer
    pub fn note_transmit(&mut self, addr: SocketAddr, timer: TimerId, now: Instant) {
        match self.candidates.iter_mut().find(|c| c.addr == addr) {
            Some(candidate) => {
                candidate.transmits += 1;
                candidate.last_sent = now;
                candidate.state = CandidateState::Waiting(timer);
            }
            None => self.candidates.push(Candidate {
                addr,
                transmits: 1,
                last_sent: now,
                state: CandidateState::Waiting(timer),
            }),
        }
    }

    pub fn transmits(&self, addr: SocketAddr) -> u32 {
        self.candidates
            .iter()
            .find(|c| c.addr == addr)
            .map(|c| c.transmits)
            .unwrap_or(0)
    }

    pub fn on_timeout(&mut self, addr: SocketAddr) -> TimeoutAction {
        let retr_count = self.retr_count;
        let candidate = match self.candidates.iter_mut().find(|c| c.addr == addr) {
            Some(candidate) => candidate,
            None => return TimeoutAction::Ignore,
        };

        match candidate.state {
            CandidateState::Waiting(_) if candidate.transmits < retr_count => TimeoutAction::Retransmit,
            CandidateState::Waiting(_) => {
                candidate.state = CandidateState::Exhausted;
                TimeoutAction::Exhausted
            }
            CandidateState::Answered | CandidateState::Exhausted => TimeoutAction::Ignore,
        }
    }

    pub fn on_response(&mut self, addr: SocketAddr, now: Instant) -> ResponseAction {
        let completed = self.completed;
        let candidate = match self.candidates.iter_mut().find(|c| c.addr == addr) {
            Some(candidate) => candidate,
            None => return ResponseAction::NotCandidate,
        };

        let rtt = now.saturating_duration_since(candidate.last_sent);
        let timer = match candidate.state {
            CandidateState::Waiting(timer) => Some(timer),
            CandidateState::Answered | CandidateState::Exhausted => None,
        };
        candidate.state = CandidateState::Answered;

        // a nameserver that ran out of retransmissions may still answer
        // before the query gives up
        if completed {
            ResponseAction::Late { timer, rtt }
        } else {
            ResponseAction::First { timer, rtt }
        }
    }

    /// Every candidate has answered or given up
    pub fn all_settled(&self) -> bool {
        self.candidates.iter().all(|c| match c.state {
            CandidateState::Waiting(_) => false,
            CandidateState::Answered | CandidateState::Exhausted => true,
        })
    }

    pub fn all_exhausted(&self) -> bool {
        self.candidates.iter().all(|c| c.state == CandidateState::Exhausted)
    }
}
