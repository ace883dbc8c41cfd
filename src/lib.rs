//! sipdns
//!
//! An asynchronous stub DNS resolver for SIP user agents and proxies.
//!
//! # Features
//!
//! * Queries go to every configured nameserver until one answers, then to
//!   that one alone for a while
//! * Per-nameserver retransmission with configurable delay and count
//! * Response caching honouring the smallest TTL in an answer
//! * SRV resolution with parallel A/AAAA lookups and A fallback
//!
//! # Architecture
//!
//! The resolver does no work on its own. Callers drive it by calling
//! `Resolver::handle_events`, or by spawning a `ResolverThread`:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use sipdns::dns::protocol::{QueryType, CLASS_IN};
//! use sipdns::dns::resolver::{Resolver, ResolverThread};
//! use sipdns::dns::settings::{NameserverConfig, ResolverConfig};
//!
//! let mut config = ResolverConfig::default();
//! config.nameservers.push(NameserverConfig::new("192.0.2.53", 53));
//!
//! let resolver = Resolver::from_config("sip", &config).unwrap();
//! let _thread = ResolverThread::spawn(resolver.clone(), Duration::from_millis(20)).unwrap();
//!
//! resolver
//!     .start_query("sip.example.com", QueryType::A, CLASS_IN, |result| {
//!         println!("{:?}", result.map(|packet| packet.answers));
//!     })
//!     .unwrap();
//! ```

/// DNS protocol handling and the resolver
pub mod dns;
