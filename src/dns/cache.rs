//! DNS Response Cache
//!
//! Keeps whole response packets keyed by the question that produced them,
//! each living for the smallest TTL found in its answer section. Since a
//! CNAME chain is answered inside a single response, the chain's hops are
//! all part of that minimum: a CNAME with TTL 1000 pointing at an A record
//! with TTL 1 is cached for one second.
//!
//! # Rules
//!
//! * Truncated responses are never cached
//! * Error responses drop whatever was cached for the key
//! * Negative answers (error rcode or empty answer section) live for
//!   `invalid_ttl`, which defaults to zero, i.e. they are not cached
//! * Lifetimes are clamped to `cache_max_ttl`
//! * Expired entries are evicted lazily on lookup, and when the cache is
//!   full
//!
//! The cache is not synchronized on its own, it lives inside the resolver's
//! locked state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde_derive::Serialize;

use crate::dns::protocol::{DnsPacket, QueryType};
use crate::dns::settings::ResolverSettings;

/// Cache key: lower-cased name without trailing dot, type and class
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl CacheKey {
    pub fn new(name: &str, qtype: QueryType, qclass: u16) -> CacheKey {
        CacheKey {
            name: name.trim_end_matches('.').to_lowercase(),
            qtype,
            qclass,
        }
    }

    /// Key for the first question of a packet
    pub fn for_packet(packet: &DnsPacket) -> Option<CacheKey> {
        packet
            .first_question()
            .map(|q| CacheKey::new(&q.name, q.qtype, q.qclass))
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    packet: DnsPacket,
    expires: Instant,
    stored_at: DateTime<Local>,
    hits: u32,
}

/// One cache entry as reported by `ResponseCache::list`
#[derive(Clone, Debug, Serialize)]
pub struct CachedResponse {
    pub key: CacheKey,
    pub answers: usize,
    pub remaining_secs: u64,
    pub stored_at: DateTime<Local>,
    pub hits: u32,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_hits: u64,
    pub total_misses: u64,
}

#[derive(Default)]
pub struct ResponseCache {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl ResponseCache {
    pub fn new() -> ResponseCache {
        ResponseCache::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Return a live entry for `key`, evicting it if it has expired
    pub fn lookup(&mut self, key: &CacheKey, now: Instant) -> Option<DnsPacket> {
        let expired = match self.entries.get_mut(key) {
            Some(entry) if entry.expires > now => {
                entry.hits += 1;
                self.hits += 1;
                return Some(entry.packet.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            log::debug!("cache entry for {} {} expired", key.name, key.qtype);
            self.entries.remove(key);
        }
        self.misses += 1;

        None
    }

    /// Store a response under `key`, returning the lifetime it was given
    ///
    /// Returns `None` when the response was not cached at all.
    pub fn store(
        &mut self,
        key: CacheKey,
        packet: &DnsPacket,
        now: Instant,
        settings: &ResolverSettings,
    ) -> Option<Duration> {
        if packet.header.truncated_message {
            log::debug!("not caching truncated response for {}", key.name);
            return None;
        }

        let ttl = if packet.header.rescode.is_error() {
            self.entries.remove(&key);
            settings.invalid_ttl
        } else {
            match packet.min_answer_ttl() {
                Some(ttl) => ttl,
                None => settings.invalid_ttl,
            }
        };
        let ttl = ttl.min(settings.cache_max_ttl);

        if ttl == 0 || settings.max_cache_entries == 0 {
            self.entries.remove(&key);
            return None;
        }

        if !self.entries.contains_key(&key) && self.entries.len() >= settings.max_cache_entries {
            self.make_room(now, settings.max_cache_entries);
        }

        let mut stored = packet.clone();
        stored.authorities.clear();
        stored.resources.clear();
        stored.header.authoritative_entries = 0;
        stored.header.resource_entries = 0;

        let lifetime = Duration::from_secs(u64::from(ttl));
        log::debug!("caching {} {} for {}s", key.name, key.qtype, ttl);

        self.entries.insert(
            key,
            CacheEntry {
                packet: stored,
                expires: now + lifetime,
                stored_at: Local::now(),
                hits: 0,
            },
        );

        Some(lifetime)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires > now);

        before - self.entries.len()
    }

    fn make_room(&mut self, now: Instant, max_entries: usize) {
        self.purge_expired(now);

        while self.entries.len() >= max_entries {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires)
                .map(|(key, _)| key.clone());

            match victim {
                Some(key) => {
                    log::debug!("cache full, evicting {} {}", key.name, key.qtype);
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn list(&self, now: Instant) -> Vec<CachedResponse> {
        let mut list: Vec<CachedResponse> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires > now)
            .map(|(key, entry)| CachedResponse {
                key: key.clone(),
                answers: entry.packet.answers.len(),
                remaining_secs: entry.expires.saturating_duration_since(now).as_secs(),
                stored_at: entry.stored_at,
                hits: entry.hits,
            })
            .collect();

        list.sort_by(|a, b| a.key.name.cmp(&b.key.name));
        list
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.entries.len(),
            total_hits: self.hits,
            total_misses: self.misses,
        }
    }
}
