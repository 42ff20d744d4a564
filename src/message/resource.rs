use std::fmt;
use std::net::Ipv4Addr;

use bytes::Bytes;

use super::name::Name;
use super::{DnsClass, DnsType};

/// Decoded resource data.
///
/// The host codec decodes the record types the engine reasons about
/// (A, NS, CNAME, PTR, SRV); anything else arrives as `Raw` bytes.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub enum RData {
    /// No data has been attached to the record yet.
    #[default]
    Empty,
    /// Opaque rdata bytes (TXT, AAAA and every type without a decoded form).
    Raw(Bytes),
    /// A record host address.
    A(Ipv4Addr),
    /// NS, CNAME or PTR target name.
    Host(Name),
    /// SRV service location.
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: Name,
    },
}

impl RData {
    /// Uncompressed wire length of the rdata.
    pub fn wire_len(&self) -> usize {
        match self {
            RData::Empty => 0,
            RData::Raw(data) => data.len(),
            RData::A(_) => 4,
            RData::Host(target) => target.wire_len(),
            RData::Srv { target, .. } => 6 + target.wire_len(),
        }
    }
}

impl fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RData::Empty => write!(f, "-"),
            RData::Raw(data) => write!(f, "{} raw bytes", data.len()),
            RData::A(ip) => write!(f, "{ip}"),
            RData::Host(target) => write!(f, "{target}"),
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => write!(f, "{target}:{port} prio {priority} weight {weight}"),
        }
    }
}

/// A resource record of a message's answer, authority or additional section.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: Name,
    pub typ: DnsType,
    pub class: DnsClass,
    pub ttl: u32,
    pub rdata: RData,
}

impl Resource {
    /// Uncompressed wire length: name, the fixed type/class/ttl/rdlength
    /// fields, and the rdata.
    pub fn wire_len(&self) -> usize {
        self.name.wire_len() + 10 + self.rdata.wire_len()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Resource{{{} {} ttl {} = {}}}",
            self.typ, self.name, self.ttl, self.rdata
        )
    }
}
