use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Declares `RecordType` with its wire code and mnemonic; other codes map to `Unknown`.
macro_rules! record_types {
    ($($variant:ident = $code:literal),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum RecordType {
            $($variant,)+
            Unknown(u16),
        }

        impl RecordType {
            pub fn from_u16(val: u16) -> Self {
                match val {
                    $($code => Self::$variant,)+
                    other => Self::Unknown(other),
                }
            }

            pub fn to_u16(self) -> u16 {
                match self {
                    $(Self::$variant => $code,)+
                    Self::Unknown(v) => v,
                }
            }
        }

        impl fmt::Display for RecordType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$variant => f.write_str(stringify!($variant)),)+
                    Self::Unknown(v) => write!(f, "TYPE{}", v),
                }
            }
        }
    };
}

record_types! {
    A = 1,
    NS = 2,
    CNAME = 5,
    SOA = 6,
    PTR = 12,
    MX = 15,
    TXT = 16,
    AAAA = 28,
    SRV = 33,
    OPT = 41,
}

impl RecordType {
    /// A or AAAA: the only types constant answers apply to.
    pub fn is_address(self) -> bool {
        matches!(self, Self::A | Self::AAAA)
    }
}

/// Record class. Only IN is named; the OPT pseudo-record reuses the field
/// for its payload size, so every other value is carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    IN,
    Unknown(u16),
}

impl RecordClass {
    pub fn from_u16(val: u16) -> Self {
        if val == 1 { Self::IN } else { Self::Unknown(val) }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::IN => 1,
            Self::Unknown(v) => v,
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IN => f.write_str("IN"),
            Self::Unknown(v) => write!(f, "CLASS{}", v),
        }
    }
}

/// DNS resource record data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    CNAME(String),
    PTR(String),
    NS(String),
    MX { preference: u16, exchange: String },
    /// Character strings, kept as sent
    TXT(Vec<Vec<u8>>),
    SOA {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// Raw bytes for everything else (OPT, HTTPS, ...)
    Raw(Vec<u8>),
}

/// A complete DNS resource record. `name` is a fully-qualified name with its trailing dot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: RecordClass,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsRecord {
    pub fn a(name: &str, ip: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::A,
            class: RecordClass::IN,
            ttl,
            rdata: RData::A(ip),
        }
    }

    pub fn aaaa(name: &str, ip: Ipv6Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::AAAA,
            class: RecordClass::IN,
            ttl,
            rdata: RData::AAAA(ip),
        }
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::CNAME,
            class: RecordClass::IN,
            ttl,
            rdata: RData::CNAME(target.to_string()),
        }
    }

    /// The address carried by an A/AAAA record.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.rdata {
            RData::A(ip) => Some(IpAddr::V4(ip)),
            RData::AAAA(ip) => Some(IpAddr::V6(ip)),
            _ => None,
        }
    }
}
