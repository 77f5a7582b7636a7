//! Synthesized address answers for constant and client-echo domains.

use std::net::IpAddr;

use crate::config::ConstSource;
use crate::records::{DnsRecord, RecordType};

/// Constant answers are never cached: they change whenever the policy file does.
pub const CONST_TTL: u32 = 0;

/// One record per address whose family matches `qtype`; others are skipped.
pub fn build(name: &str, qtype: RecordType, ips: &[IpAddr]) -> Vec<DnsRecord> {
    ips.iter()
        .filter_map(|ip| match (ip, qtype) {
            (IpAddr::V4(v4), RecordType::A) => Some(DnsRecord::a(name, *v4, CONST_TTL)),
            (IpAddr::V6(v6), RecordType::AAAA) => Some(DnsRecord::aaaa(name, *v6, CONST_TTL)),
            _ => None,
        })
        .collect()
}

/// Answers for a const-answer source; `Client` echoes the querying address.
pub fn build_from_source(name: &str, qtype: RecordType, source: &ConstSource, client: IpAddr) -> Vec<DnsRecord> {
    match source {
        ConstSource::Static(ips) => build(name, qtype, ips),
        ConstSource::Client => build(name, qtype, &[client.to_canonical()]),
    }
}
