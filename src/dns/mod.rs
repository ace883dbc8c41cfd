//! Stub DNS resolver
//!
//! This module provides an asynchronous stub resolver for SIP endpoints:
//! * DNS packet parsing and serialization
//! * Nameserver failover between probing and a single active nameserver
//! * Per-nameserver retransmission of queries in flight
//! * Response caching with TTL support
//! * SRV resolution with A or AAAA fallback
//!
//! # Module Structure
//!
//! * `protocol` - DNS protocol definitions and packet handling
//! * `resolver` - The resolver, its event loop and background thread
//! * `srv` - SRV resolution on top of the resolver
//! * `cache` - DNS response caching with TTL support
//! * `nameserver` - Nameserver health and failover state
//! * `buffer` - Low-level packet buffer operations

/// Extracting addresses from responses
pub mod answer;

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS response caching with TTL support
pub mod cache;

/// Tracing subscriber setup for binaries
pub mod logging;

/// Nameserver health and the failover state machine
pub mod nameserver;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// Queries in flight and their results
pub mod query;

/// The stub resolver
pub mod resolver;

/// Resolver settings and configuration files
pub mod settings;

/// SRV resolution
pub mod srv;

/// Timers and clocks
pub mod timer;

/// Datagram transport to the nameservers
pub mod transport;
