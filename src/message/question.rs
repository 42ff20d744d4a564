use std::fmt;

use super::name::Name;
use super::{DnsClass, DnsType};

/// A single entry of a message's question section.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub typ: DnsType,
    pub class: DnsClass,
}

impl Question {
    /// Uncompressed wire length: name plus type and class words.
    pub fn wire_len(&self) -> usize {
        self.name.wire_len() + 4
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Question{{Name: {}, Type: {}, Class: {}}}",
            self.name, self.typ, self.class
        )
    }
}
