//! Decoded DNS message model.
//!
//! The engine is codec-agnostic: it consumes and produces [`DnsMessage`]
//! values and never touches wire bytes. The host pairs it with any DNS
//! packer/parser that can fill in and read out these fields. The only wire
//! concern kept here is [`DnsMessage::encoded_len`], an uncompressed size
//! estimate the send scheduler uses to respect the outgoing frame budget.


pub mod name;
pub mod question;
pub mod resource;

use std::fmt;

pub use name::Name;
pub use question::Question;
pub use resource::{RData, Resource};

// A Type is a type of DNS request and response.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum DnsType {
    A = 1,
    Ns = 2,
    Cname = 5,
    Soa = 6,
    Ptr = 12,
    Mx = 15,
    Txt = 16,
    Aaaa = 28,
    Srv = 33,

    /// Question-only wildcard matching any record type.
    Any = 255,

    #[default]
    Unsupported = 0,
}

impl From<u16> for DnsType {
    fn from(v: u16) -> Self {
        match v {
            1 => DnsType::A,
            2 => DnsType::Ns,
            5 => DnsType::Cname,
            6 => DnsType::Soa,
            12 => DnsType::Ptr,
            15 => DnsType::Mx,
            16 => DnsType::Txt,
            28 => DnsType::Aaaa,
            33 => DnsType::Srv,
            255 => DnsType::Any,
            _ => DnsType::Unsupported,
        }
    }
}

impl From<DnsType> for u16 {
    fn from(v: DnsType) -> Self {
        v as u16
    }
}

impl fmt::Display for DnsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            DnsType::A => "A",
            DnsType::Ns => "NS",
            DnsType::Cname => "CNAME",
            DnsType::Soa => "SOA",
            DnsType::Ptr => "PTR",
            DnsType::Mx => "MX",
            DnsType::Txt => "TXT",
            DnsType::Aaaa => "AAAA",
            DnsType::Srv => "SRV",
            DnsType::Any => "ANY",
            _ => "Unsupported",
        };
        write!(f, "{s}")
    }
}

/// A DNS class.
///
/// Link-local internet records use [`DNSCLASS_INET`]. On mDNS responses the
/// top bit of the class word is the cache-flush bit ([`CLASS_CACHE_FLUSH`]),
/// telling receivers to discard previously cached records of the same name
/// and type.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct DnsClass(pub u16);

/// Internet class (IN), the class of virtually all mDNS traffic.
pub const DNSCLASS_INET: DnsClass = DnsClass(1);

/// mDNS cache-flush bit, bit 15 of the class word (RFC 6762 section 10.2).
pub const CLASS_CACHE_FLUSH: u16 = 0x8000;

impl DnsClass {
    /// This class with the cache-flush bit set.
    pub fn with_cache_flush(self) -> DnsClass {
        DnsClass(self.0 | CLASS_CACHE_FLUSH)
    }

    /// Whether the cache-flush bit is set.
    pub fn cache_flush(self) -> bool {
        self.0 & CLASS_CACHE_FLUSH != 0
    }
}

impl fmt::Display for DnsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == DNSCLASS_INET {
            write!(f, "ClassINET")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Header bits of a decoded message.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    /// qr bit: false for queries, true for responses.
    pub response: bool,
    /// aa bit; always set on mDNS responses.
    pub authoritative: bool,
    pub truncated: bool,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Header{{id: {}, response: {}, authoritative: {}}}",
            self.id, self.response, self.authoritative
        )
    }
}

// Wire length of a DNS header: six uint16 fields, no padding.
const HEADER_LEN: usize = 12;

/// A decoded DNS message: header bits plus the four record sections.
///
/// Inbound, the host codec produces one of these per received datagram.
/// Outbound, the engine fills one in and the host codec packs it. The
/// `add_*` builder methods append to the sections, and
/// [`DnsMessage::encoded_len`] tracks the running uncompressed size.
#[derive(Default, Debug, Clone)]
pub struct DnsMessage {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Resource>,
    pub authorities: Vec<Resource>,
    pub additionals: Vec<Resource>,
}

impl DnsMessage {
    pub fn add_question(&mut self, question: Question) {
        self.questions.push(question);
    }

    pub fn add_answer(&mut self, resource: Resource) {
        self.answers.push(resource);
    }

    pub fn add_authority(&mut self, resource: Resource) {
        self.authorities.push(resource);
    }

    pub fn add_additional(&mut self, resource: Resource) {
        self.additionals.push(resource);
    }

    /// Whether any section carries an entry.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
            && self.answers.is_empty()
            && self.authorities.is_empty()
            && self.additionals.is_empty()
    }

    /// Encoded size of the message, assuming no name compression.
    ///
    /// A codec using compression will pack the message smaller than this,
    /// so a frame budget enforced against this estimate is conservative.
    pub fn encoded_len(&self) -> usize {
        let mut len = HEADER_LEN;
        len += self.questions.iter().map(Question::wire_len).sum::<usize>();
        len += self.answers.iter().map(Resource::wire_len).sum::<usize>();
        len += self.authorities.iter().map(Resource::wire_len).sum::<usize>();
        len += self.additionals.iter().map(Resource::wire_len).sum::<usize>();
        len
    }
}

impl fmt::Display for DnsMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DnsMessage{{{}, qd: {}, an: {}, ns: {}, ar: {}}}",
            self.header,
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len()
        )
    }
}
