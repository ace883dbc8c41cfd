//! Extracting addresses from A and AAAA responses

use std::net::IpAddr;

use serde_derive::Serialize;

use crate::dns::protocol::{DnsPacket, DnsRecord};
use crate::dns::query::QueryError;

/// Longest CNAME chain followed inside a single response
pub const MAX_CNAME_HOPS: usize = 8;

/// Most addresses kept for a single name
pub const MAX_ADDRS: usize = 8;

/// The addresses a name resolved to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddrRecord {
    /// The name that was asked for
    pub name: String,
    /// Where the CNAME chain ended, if there was one
    pub alias: Option<String>,
    pub addrs: Vec<IpAddr>,
}

impl AddrRecord {
    pub fn ipv4(&self) -> impl Iterator<Item = &IpAddr> {
        self.addrs.iter().filter(|addr| addr.is_ipv4())
    }

    pub fn ipv6(&self) -> impl Iterator<Item = &IpAddr> {
        self.addrs.iter().filter(|addr| addr.is_ipv6())
    }
}

fn address_of(record: &DnsRecord, owner: &str) -> Option<IpAddr> {
    match *record {
        DnsRecord::A {
            ref domain, addr, ..
        } if domain.eq_ignore_ascii_case(owner) => Some(IpAddr::V4(addr)),
        DnsRecord::Aaaa {
            ref domain, addr, ..
        } if domain.eq_ignore_ascii_case(owner) => Some(IpAddr::V6(addr)),
        _ => None,
    }
}

fn cname_of<'a>(record: &'a DnsRecord, owner: &str) -> Option<&'a str> {
    match *record {
        DnsRecord::Cname {
            ref domain,
            ref host,
            ..
        } if domain.eq_ignore_ascii_case(owner) => Some(host),
        _ => None,
    }
}

/// Follow the CNAME chain starting at `name` through `records`, returning
/// the name that owns the addresses.
pub fn follow_cname_chain<'a>(records: &'a [DnsRecord], name: &'a str) -> Result<&'a str, QueryError> {
    let mut target = name;

    for _ in 0..=MAX_CNAME_HOPS {
        if records.iter().any(|rec| address_of(rec, target).is_some()) {
            return Ok(target);
        }

        match records.iter().find_map(|rec| cname_of(rec, target)) {
            Some(next) => target = next,
            None => return Ok(target),
        }
    }

    log::warn!("CNAME chain for {} is longer than {} hops", name, MAX_CNAME_HOPS);
    Err(QueryError::CnameLoop)
}

/// Addresses owned by `owner` in `records`, at most `MAX_ADDRS` of them
pub fn addresses_for(records: &[DnsRecord], owner: &str) -> Vec<IpAddr> {
    records
        .iter()
        .filter_map(|rec| address_of(rec, owner))
        .take(MAX_ADDRS)
        .collect()
}

/// Parse the response to an A or AAAA query
///
/// The chain is followed from the question name. Both address families are
/// accepted, whichever the answer carries.
pub fn parse_addr_response(packet: &DnsPacket) -> Result<AddrRecord, QueryError> {
    if packet.header.rescode.is_error() {
        return Err(QueryError::Rcode {
            rcode: packet.header.rescode,
            packet: Box::new(packet.clone()),
        });
    }

    let name = match packet.first_question() {
        Some(question) => question.name.as_str(),
        None => return Err(QueryError::NoAnswerRecord),
    };

    let owner = follow_cname_chain(&packet.answers, name)?;
    let addrs = addresses_for(&packet.answers, owner);
    if addrs.is_empty() {
        return Err(QueryError::NoAnswerRecord);
    }

    Ok(AddrRecord {
        name: name.to_string(),
        alias: if owner.eq_ignore_ascii_case(name) {
            None
        } else {
            Some(owner.to_string())
        },
        addrs,
    })
}
