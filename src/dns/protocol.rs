//! DNS wire format: packets, headers, questions and records

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// The Internet class, the only one a stub resolver ever asks for
pub const CLASS_IN: u16 = 1;

/// Record types the resolver asks for or reads back
///
/// Any other type number survives a parse as `Unknown`, so it can be written
/// back out unchanged.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,     // 1
    Ns,    // 2
    Cname, // 5
    Soa,   // 6
    Aaaa,  // 28
    Srv,   // 33
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            _ => QueryType::Unknown(num),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            QueryType::Unknown(x) => write!(f, "TYPE{}", x),
            QueryType::A => write!(f, "A"),
            QueryType::Ns => write!(f, "NS"),
            QueryType::Cname => write!(f, "CNAME"),
            QueryType::Soa => write!(f, "SOA"),
            QueryType::Aaaa => write!(f, "AAAA"),
            QueryType::Srv => write!(f, "SRV"),
        }
    }
}

/// A TTL that does not take part in record comparison, so that two records
/// with the same data compare equal regardless of how long they may live.
#[derive(Copy, Clone, Debug, Eq, Serialize, Deserialize)]
pub struct TransientTtl(pub u32);

impl PartialEq<TransientTtl> for TransientTtl {
    fn eq(&self, _: &TransientTtl) -> bool {
        true
    }
}

impl PartialOrd<TransientTtl> for TransientTtl {
    fn partial_cmp(&self, other: &TransientTtl) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransientTtl {
    fn cmp(&self, _: &TransientTtl) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for TransientTtl {
    fn hash<H>(&self, _: &mut H)
    where
        H: Hasher,
    {
        // ttl does not take part in hashing either
    }
}

/// `DnsRecord` is the primary representation of a DNS record
///
/// Only the types a stub resolver acts upon are decoded, and those are
/// always written back as class IN. Everything else is kept as `Unknown`
/// with its class and raw rdata, so it is written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        class: u16,
        data: Vec<u8>,
        ttl: TransientTtl,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    }, // 1
    Ns {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 2
    Cname {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: TransientTtl,
    }, // 6
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    }, // 28
    Srv {
        domain: String,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
        ttl: TransientTtl,
    }, // 33
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        let data_start = buffer.pos();

        let record = match qtype {
            QueryType::A => {
                let raw_addr = buffer.read_u32()?;
                let addr = Ipv4Addr::from(raw_addr);

                DnsRecord::A {
                    domain,
                    addr,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Aaaa => {
                let mut segments = [0u16; 8];
                for segment in segments.iter_mut() {
                    *segment = buffer.read_u16()?;
                }

                DnsRecord::Aaaa {
                    domain,
                    addr: Ipv6Addr::from(segments),
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Ns => {
                let mut ns = String::new();
                buffer.read_qname(&mut ns)?;

                DnsRecord::Ns {
                    domain,
                    host: ns,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Cname => {
                let mut cname = String::new();
                buffer.read_qname(&mut cname)?;

                DnsRecord::Cname {
                    domain,
                    host: cname,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Srv => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;

                let mut srv = String::new();
                buffer.read_qname(&mut srv)?;

                DnsRecord::Srv {
                    domain,
                    priority,
                    weight,
                    port,
                    host: srv,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;

                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                let serial = buffer.read_u32()?;
                let refresh = buffer.read_u32()?;
                let retry = buffer.read_u32()?;
                let expire = buffer.read_u32()?;
                let minimum = buffer.read_u32()?;

                DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial,
                    refresh,
                    retry,
                    expire,
                    minimum,
                    ttl: TransientTtl(ttl),
                }
            }
            QueryType::Unknown(_) => {
                let data = buffer.get_range(data_start, data_len as usize)?.to_vec();

                DnsRecord::Unknown {
                    domain,
                    qtype: qtype_num,
                    class,
                    data,
                    ttl: TransientTtl(ttl),
                }
            }
        };

        // rdata length is authoritative, whatever the parser above consumed
        buffer.seek(data_start + data_len as usize)?;

        Ok(record)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::A.to_num())?;
                buffer.write_u16(CLASS_IN)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(4)?;

                for octet in &addr.octets() {
                    buffer.write_u8(*octet)?;
                }
            }
            DnsRecord::Aaaa {
                ref domain,
                ref addr,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Aaaa.to_num())?;
                buffer.write_u16(CLASS_IN)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(16)?;

                for segment in &addr.segments() {
                    buffer.write_u16(*segment)?;
                }
            }
            DnsRecord::Ns {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Ns.to_num())?;
                buffer.write_u16(CLASS_IN)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Cname {
                ref domain,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Cname.to_num())?;
                buffer.write_u16(CLASS_IN)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Srv {
                ref domain,
                priority,
                weight,
                port,
                ref host,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Srv.to_num())?;
                buffer.write_u16(CLASS_IN)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Soa {
                ref domain,
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(QueryType::Soa.to_num())?;
                buffer.write_u16(CLASS_IN)?;
                buffer.write_u32(ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Unknown {
                ref domain,
                qtype,
                class,
                ref data,
                ttl: TransientTtl(ttl),
            } => {
                buffer.write_qname(domain)?;
                buffer.write_u16(qtype)?;
                buffer.write_u16(class)?;
                buffer.write_u32(ttl)?;
                buffer.write_u16(data.len() as u16)?;

                for b in data {
                    buffer.write_u8(*b)?;
                }
            }
        }

        Ok(buffer.pos() - start_pos)
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Ns { .. } => QueryType::Ns,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Srv { .. } => QueryType::Srv,
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Unknown { qtype, .. } => QueryType::Unknown(qtype),
        }
    }

    pub fn get_domain(&self) -> &str {
        match *self {
            DnsRecord::A { ref domain, .. }
            | DnsRecord::Aaaa { ref domain, .. }
            | DnsRecord::Ns { ref domain, .. }
            | DnsRecord::Cname { ref domain, .. }
            | DnsRecord::Srv { ref domain, .. }
            | DnsRecord::Soa { ref domain, .. }
            | DnsRecord::Unknown { ref domain, .. } => domain,
        }
    }

    pub fn get_ttl(&self) -> u32 {
        match *self {
            DnsRecord::A {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Aaaa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Ns {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Cname {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Srv {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Soa {
                ttl: TransientTtl(ttl),
                ..
            }
            | DnsRecord::Unknown {
                ttl: TransientTtl(ttl),
                ..
            } => ttl,
        }
    }
}

/// The result code for a DNS query (RFC 1035 and RFC 2136)
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
    YXDOMAIN = 6,
    YXRRSET = 7,
    NXRRSET = 8,
    NOTAUTH = 9,
    NOTZONE = 10,
}

impl ResultCode {
    /// Rcodes outside the known range are reported as SERVFAIL, so that an
    /// unrecognised code can never be mistaken for success.
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            0 => ResultCode::NOERROR,
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            6 => ResultCode::YXDOMAIN,
            7 => ResultCode::YXRRSET,
            8 => ResultCode::NXRRSET,
            9 => ResultCode::NOTAUTH,
            10 => ResultCode::NOTZONE,
            _ => ResultCode::SERVFAIL,
        }
    }

    pub fn is_error(&self) -> bool {
        *self != ResultCode::NOERROR
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | ((self.opcode & 0x0F) << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DnsHeader:")?;
        writeln!(f, "\tid: {0}", self.id)?;
        writeln!(f, "\trecursion_desired: {0}", self.recursion_desired)?;
        writeln!(f, "\ttruncated_message: {0}", self.truncated_message)?;
        writeln!(f, "\tresponse: {0}", self.response)?;
        writeln!(f, "\trescode: {}", self.rescode)?;
        writeln!(f, "\tquestions: {0}", self.questions)?;
        writeln!(f, "\tanswers: {0}", self.answers)?;
        writeln!(f, "\tauthoritative_entries: {0}", self.authoritative_entries)?;
        writeln!(f, "\tresource_entries: {0}", self.resource_entries)?;

        Ok(())
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn binary_len(&self) -> usize {
        self.name
            .split('.')
            .filter(|x| !x.is_empty())
            .map(|x| x.len() + 1)
            .fold(1, |x, y| x + y)
            + 4
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(self.qclass)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.qclass = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.qtype)
    }
}

/// Representation of a complete DNS packet
///
/// Used both for the queries the resolver sends and for the responses it
/// hands to callers and keeps in the cache.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    /// Build a recursion-desired query for a single question
    pub fn query(id: u16, qname: &str, qtype: QueryType, qclass: u16) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = id;
        packet.header.recursion_desired = true;
        packet.header.questions = 1;

        let mut question = DnsQuestion::new(qname.to_string(), qtype);
        question.qclass = qclass;
        packet.questions.push(question);

        packet
    }

    /// Build an empty response to this packet, echoing id and questions
    pub fn reply(&self, rescode: ResultCode) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = self.header.id;
        packet.header.response = true;
        packet.header.recursion_desired = self.header.recursion_desired;
        packet.header.recursion_available = true;
        packet.header.rescode = rescode;
        packet.questions = self.questions.clone();

        packet
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new("".to_string(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DnsPacket> {
        let mut buffer = VectorPacketBuffer::from_bytes(bytes);
        DnsPacket::from_buffer(&mut buffer)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buffer = VectorPacketBuffer::new();
        self.write(&mut buffer, 0xFFFF)?;

        Ok(buffer.into_bytes())
    }

    pub fn first_question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }

    /// Smallest TTL of all answer records, `None` for an empty answer section
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.answers.iter().map(DnsRecord::get_ttl).min()
    }

    /// Serialize the packet, dropping trailing records that would push it
    /// past `max_size` and setting the truncation bit if that happens.
    pub fn write<T: PacketBuffer>(&self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();
        let mut header = self.header.clone();

        let mut size = header.binary_len();
        for question in &self.questions {
            size += question.binary_len();
            question.write(&mut test_buffer)?;
        }

        header.answers = 0;
        header.authoritative_entries = 0;
        header.resource_entries = 0;

        let mut record_count = self.answers.len() + self.authorities.len() + self.resources.len();

        for (i, rec) in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .enumerate()
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                record_count = i;
                header.truncated_message = true;
                break;
            } else if i < self.answers.len() {
                header.answers += 1;
            } else if i < self.answers.len() + self.authorities.len() {
                header.authoritative_entries += 1;
            } else {
                header.resource_entries += 1;
            }
        }

        header.questions = self.questions.len() as u16;

        header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }
}
