//! DNS wire format parser and serializer (RFC 1035).
//! Names are carried as fully-qualified strings with their trailing dot and
//! original letter case, so a name read from a packet is written back unchanged.

use rustc_hash::FxHashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

use crate::records::{DnsRecord, RData, RecordClass, RecordType};

#[derive(Error, Debug)]
pub enum DnsParseError {
    #[error("Packet truncated at offset {0}")]
    Truncated(usize),
    #[error("Name compression loop detected")]
    CompressionLoop,
    #[error("Invalid UTF-8 in name")]
    InvalidUtf8,
    #[error("Packet too short: {0} bytes")]
    TooShort(usize),
    #[error("Name too long (exceeds 255 bytes)")]
    NameTooLong,
    #[error("Label too long: {0} bytes (max 63)")]
    LabelTooLong(usize),
    #[error("Label contains a '.' byte")]
    DotInLabel,
}

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;
const RCODE_MASK: u16 = 0x000F;

/// Largest UDP reply allowed without EDNS0 (RFC 1035 §4.2.1)
pub const MAX_PLAIN_UDP_SIZE: usize = 512;

/// Parsed DNS header (12 bytes)
#[derive(Debug, Clone)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qd_count: u16,
    pub an_count: u16,
    pub ns_count: u16,
    pub ar_count: u16,
}

/// A DNS question. `name` keeps its trailing dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl DnsQuestion {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        Self {
            name: name.to_string(),
            qtype,
            qclass: RecordClass::IN,
        }
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.qclass, self.qtype)
    }
}

/// A complete DNS message, query or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authority: Vec<DnsRecord>,
    pub additional: Vec<DnsRecord>,
}

impl DnsMessage {
    /// A standard recursive query for a single question.
    pub fn query(id: u16, question: DnsQuestion) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            questions: vec![question],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// An empty NOERROR response to `query`: same id, opcode, RD bit and question section.
    pub fn reply_to(query: &DnsMessage) -> Self {
        Self {
            id: query.id,
            flags: FLAG_QR | FLAG_RA | (query.flags & (OPCODE_MASK | FLAG_RD)),
            questions: query.questions.clone(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }
    pub fn is_authoritative(&self) -> bool {
        self.flags & FLAG_AA != 0
    }
    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }
    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }
    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    pub fn set_authoritative(&mut self, authoritative: bool) {
        if authoritative {
            self.flags |= FLAG_AA;
        } else {
            self.flags &= !FLAG_AA;
        }
    }

    pub fn set_rcode(&mut self, rcode: u8) {
        self.flags = (self.flags & !RCODE_MASK) | (rcode as u16 & RCODE_MASK);
    }

    /// Payload size the sender accepts over UDP (EDNS0 OPT class, never below 512).
    pub fn udp_payload_limit(&self) -> usize {
        self.additional
            .iter()
            .find(|r| r.rtype == RecordType::OPT)
            .map(|opt| (opt.class.to_u16() as usize).max(MAX_PLAIN_UDP_SIZE))
            .unwrap_or(MAX_PLAIN_UDP_SIZE)
    }

    /// Parse a message from raw bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, DnsParseError> {
        parse_message(buf)
    }

    /// Encode to wire format, compressing owner names and well-known rdata names.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::default();

        enc.buf.extend_from_slice(&self.id.to_be_bytes());
        enc.buf.extend_from_slice(&self.flags.to_be_bytes());
        enc.buf.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        enc.buf.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        enc.buf.extend_from_slice(&(self.authority.len() as u16).to_be_bytes());
        enc.buf.extend_from_slice(&(self.additional.len() as u16).to_be_bytes());

        for q in &self.questions {
            enc.name(&q.name);
            enc.buf.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
            enc.buf.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
        }

        for record in self.answers.iter().chain(&self.authority).chain(&self.additional) {
            enc.record(record);
        }

        enc.buf
    }

    /// Encode for UDP: if the message exceeds `max_size`, send only the header and
    /// question with TC set so the client retries over TCP.
    pub fn to_udp_bytes(&self, max_size: usize) -> Vec<u8> {
        let bytes = self.to_bytes();
        if bytes.len() <= max_size {
            return bytes;
        }
        let truncated = Self {
            id: self.id,
            flags: self.flags | FLAG_TC,
            questions: self.questions.clone(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };
        truncated.to_bytes()
    }
}

/// Parse a DNS name from the wire format with pointer compression support.
/// Returns (fqdn, offset just past the name at the original position).
pub fn parse_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), DnsParseError> {
    let mut name = String::with_capacity(64);
    let mut jumped = false;
    let mut end_offset = 0;
    let mut jumps = 0;
    const MAX_JUMPS: usize = 10;

    loop {
        if offset >= buf.len() {
            return Err(DnsParseError::Truncated(offset));
        }

        let len = buf[offset] as usize;

        // Pointer (compression)
        if len & 0xC0 == 0xC0 {
            if offset + 1 >= buf.len() {
                return Err(DnsParseError::Truncated(offset));
            }
            if !jumped {
                end_offset = offset + 2;
            }
            offset = ((len & 0x3F) << 8) | (buf[offset + 1] as usize);
            jumped = true;
            jumps += 1;
            if jumps > MAX_JUMPS {
                return Err(DnsParseError::CompressionLoop);
            }
            continue;
        }

        // End of name
        if len == 0 {
            if !jumped {
                end_offset = offset + 1;
            }
            break;
        }

        // RFC 1035: labels must be ≤63 octets
        if len > 63 {
            return Err(DnsParseError::LabelTooLong(len));
        }

        offset += 1;
        if offset + len > buf.len() {
            return Err(DnsParseError::Truncated(offset));
        }

        let raw = &buf[offset..offset + len];
        // The dotted form could not be re-encoded as the same labels
        if raw.contains(&b'.') {
            return Err(DnsParseError::DotInLabel);
        }
        let label = std::str::from_utf8(raw).map_err(|_| DnsParseError::InvalidUtf8)?;
        name.push_str(label);
        name.push('.');
        offset += len;

        // RFC 1035 §2.3.4: 253 characters plus the trailing dot
        if name.len() > 254 {
            return Err(DnsParseError::NameTooLong);
        }
    }

    if name.is_empty() {
        name.push('.');
    }

    Ok((name, end_offset))
}

/// Encode a DNS name into uncompressed wire format labels.
/// Every name written comes from `parse_name` or a validated policy file,
/// so labels are already within the 63-byte limit.
pub fn encode_name(name: &str, buf: &mut Vec<u8>) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        debug_assert!(label.len() <= 63);
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Message writer that remembers where each name suffix was written.
#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
    names: FxHashMap<String, u16>,
}

impl Encoder {
    /// Pointers only reach the first 16 KiB of a message.
    const MAX_POINTER: usize = 0x3FFF;

    fn name(&mut self, name: &str) {
        let labels: Vec<&str> = name.split('.').filter(|l| !l.is_empty()).collect();

        for i in 0..labels.len() {
            let suffix = labels[i..].join(".");
            if let Some(&ptr) = self.names.get(&suffix) {
                self.buf.extend_from_slice(&(0xC000 | ptr).to_be_bytes());
                return;
            }
            if self.buf.len() <= Self::MAX_POINTER {
                self.names.insert(suffix, self.buf.len() as u16);
            }
            debug_assert!(labels[i].len() <= 63);
            self.buf.push(labels[i].len() as u8);
            self.buf.extend_from_slice(labels[i].as_bytes());
        }
        self.buf.push(0);
    }

    fn record(&mut self, record: &DnsRecord) {
        self.name(&record.name);
        self.buf.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
        self.buf.extend_from_slice(&record.class.to_u16().to_be_bytes());
        self.buf.extend_from_slice(&record.ttl.to_be_bytes());

        let len_pos = self.buf.len();
        self.buf.extend_from_slice(&[0, 0]); // RDLENGTH, patched below
        self.rdata(&record.rdata);
        let rdlength = (self.buf.len() - len_pos - 2) as u16;
        self.buf[len_pos..len_pos + 2].copy_from_slice(&rdlength.to_be_bytes());
    }

    fn rdata(&mut self, rdata: &RData) {
        match rdata {
            RData::A(ip) => self.buf.extend_from_slice(&ip.octets()),
            RData::AAAA(ip) => self.buf.extend_from_slice(&ip.octets()),
            RData::CNAME(name) | RData::PTR(name) | RData::NS(name) => self.name(name),
            RData::MX { preference, exchange } => {
                self.buf.extend_from_slice(&preference.to_be_bytes());
                self.name(exchange);
            }
            RData::TXT(strings) => {
                for s in strings {
                    let len = s.len().min(255);
                    self.buf.push(len as u8);
                    self.buf.extend_from_slice(&s[..len]);
                }
                if strings.is_empty() {
                    self.buf.push(0);
                }
            }
            RData::SOA { mname, rname, serial, refresh, retry, expire, minimum } => {
                self.name(mname);
                self.name(rname);
                self.buf.extend_from_slice(&serial.to_be_bytes());
                self.buf.extend_from_slice(&refresh.to_be_bytes());
                self.buf.extend_from_slice(&retry.to_be_bytes());
                self.buf.extend_from_slice(&expire.to_be_bytes());
                self.buf.extend_from_slice(&minimum.to_be_bytes());
            }
            RData::SRV { priority, weight, port, target } => {
                self.buf.extend_from_slice(&priority.to_be_bytes());
                self.buf.extend_from_slice(&weight.to_be_bytes());
                self.buf.extend_from_slice(&port.to_be_bytes());
                // RFC 2782: SRV targets are never compressed
                encode_name(target, &mut self.buf);
            }
            RData::Raw(data) => self.buf.extend_from_slice(data),
        }
    }
}

/// Parse a DNS header from bytes.
fn parse_header(buf: &[u8]) -> Result<DnsHeader, DnsParseError> {
    if buf.len() < 12 {
        return Err(DnsParseError::TooShort(buf.len()));
    }
    Ok(DnsHeader {
        id: u16::from_be_bytes([buf[0], buf[1]]),
        flags: u16::from_be_bytes([buf[2], buf[3]]),
        qd_count: u16::from_be_bytes([buf[4], buf[5]]),
        an_count: u16::from_be_bytes([buf[6], buf[7]]),
        ns_count: u16::from_be_bytes([buf[8], buf[9]]),
        ar_count: u16::from_be_bytes([buf[10], buf[11]]),
    })
}

/// Parse a full DNS message into its four sections.
pub fn parse_message(buf: &[u8]) -> Result<DnsMessage, DnsParseError> {
    let header = parse_header(buf)?;
    let mut offset = 12;
    let mut questions = Vec::with_capacity(header.qd_count as usize);

    for _ in 0..header.qd_count {
        let (name, new_offset) = parse_name(buf, offset)?;
        offset = new_offset;

        if offset + 4 > buf.len() {
            return Err(DnsParseError::Truncated(offset));
        }

        let qtype = RecordType::from_u16(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
        let qclass = RecordClass::from_u16(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
        offset += 4;

        questions.push(DnsQuestion { name, qtype, qclass });
    }

    let mut sections: [Vec<DnsRecord>; 3] = Default::default();
    let counts = [header.an_count, header.ns_count, header.ar_count];

    for (section, count) in sections.iter_mut().zip(counts) {
        for _ in 0..count {
            if offset >= buf.len() {
                break;
            }
            let (record, new_offset) = parse_record(buf, offset)?;
            offset = new_offset;
            section.push(record);
        }
    }

    let [answers, authority, additional] = sections;

    Ok(DnsMessage {
        id: header.id,
        flags: header.flags,
        questions,
        answers,
        authority,
        additional,
    })
}

fn parse_record(buf: &[u8], offset: usize) -> Result<(DnsRecord, usize), DnsParseError> {
    let (name, mut offset) = parse_name(buf, offset)?;

    if offset + 10 > buf.len() {
        return Err(DnsParseError::Truncated(offset));
    }

    let rtype = RecordType::from_u16(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
    let class = RecordClass::from_u16(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
    let ttl = u32::from_be_bytes([buf[offset + 4], buf[offset + 5], buf[offset + 6], buf[offset + 7]]);
    let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
    offset += 10;

    if offset + rdlength > buf.len() {
        return Err(DnsParseError::Truncated(offset));
    }

    let rdata = parse_rdata(buf, offset, rdlength, rtype)?;

    Ok((DnsRecord { name, rtype, class, ttl, rdata }, offset + rdlength))
}

fn parse_rdata(buf: &[u8], offset: usize, rdlength: usize, rtype: RecordType) -> Result<RData, DnsParseError> {
    let raw = || RData::Raw(buf[offset..offset + rdlength].to_vec());

    match rtype {
        RecordType::A => {
            if rdlength != 4 {
                return Ok(raw());
            }
            Ok(RData::A(Ipv4Addr::new(
                buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3],
            )))
        }
        RecordType::AAAA => {
            if rdlength != 16 {
                return Ok(raw());
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[offset..offset + 16]);
            Ok(RData::AAAA(Ipv6Addr::from(octets)))
        }
        RecordType::CNAME => Ok(RData::CNAME(parse_name(buf, offset)?.0)),
        RecordType::PTR => Ok(RData::PTR(parse_name(buf, offset)?.0)),
        RecordType::NS => Ok(RData::NS(parse_name(buf, offset)?.0)),
        RecordType::MX => {
            if rdlength < 3 {
                return Ok(raw());
            }
            let preference = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let (exchange, _) = parse_name(buf, offset + 2)?;
            Ok(RData::MX { preference, exchange })
        }
        RecordType::TXT => {
            // One or more <length><string> pairs
            let mut strings = Vec::new();
            let mut pos = offset;
            let end = offset + rdlength;
            while pos < end {
                let len = buf[pos] as usize;
                pos += 1;
                if pos + len > end {
                    return Ok(raw());
                }
                strings.push(buf[pos..pos + len].to_vec());
                pos += len;
            }
            Ok(RData::TXT(strings))
        }
        RecordType::SOA => {
            let (mname, new_offset) = parse_name(buf, offset)?;
            let (rname, new_offset) = parse_name(buf, new_offset)?;
            if new_offset + 20 > buf.len() {
                return Ok(raw());
            }
            let o = new_offset;
            Ok(RData::SOA {
                mname,
                rname,
                serial: u32::from_be_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]),
                refresh: u32::from_be_bytes([buf[o + 4], buf[o + 5], buf[o + 6], buf[o + 7]]),
                retry: u32::from_be_bytes([buf[o + 8], buf[o + 9], buf[o + 10], buf[o + 11]]),
                expire: u32::from_be_bytes([buf[o + 12], buf[o + 13], buf[o + 14], buf[o + 15]]),
                minimum: u32::from_be_bytes([buf[o + 16], buf[o + 17], buf[o + 18], buf[o + 19]]),
            })
        }
        RecordType::SRV => {
            if rdlength < 7 {
                return Ok(raw());
            }
            let (target, _) = parse_name(buf, offset + 6)?;
            Ok(RData::SRV {
                priority: u16::from_be_bytes([buf[offset], buf[offset + 1]]),
                weight: u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]),
                port: u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]),
                target,
            })
        }
        _ => Ok(raw()),
    }
}

/// FORMERR reply built from the header of a packet we could not make sense of.
/// Returns `None` when there is not even a header to answer.
pub fn format_error_response(query_bytes: &[u8]) -> Option<Vec<u8>> {
    let header = parse_header(query_bytes).ok()?;
    let flags = FLAG_QR | (header.flags & (OPCODE_MASK | FLAG_RD)) | RCODE_FORMERR as u16;

    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&header.id.to_be_bytes());
    buf.extend_from_slice(&flags.to_be_bytes());
    buf.extend_from_slice(&[0u8; 8]); // all section counts zero
    Some(buf)
}

// RCODE constants
pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_NXDOMAIN: u8 = 3;
