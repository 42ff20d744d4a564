use std::fmt;

/// A DNS domain name in dotted ASCII text form.
///
/// Names are carried as text; wire encoding and compression are the host
/// codec's concern. A trailing dot is accepted and ignored for length and
/// equality purposes. Name comparisons throughout the engine are
/// case-insensitive (RFC 6762 section 16).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Name {
    pub data: String,
}

impl Name {
    pub fn new(data: &str) -> Self {
        Name {
            data: data.to_string(),
        }
    }

    /// Uncompressed wire length of this name: one length octet per label
    /// plus the terminating root octet.
    pub fn wire_len(&self) -> usize {
        let trimmed = self.data.strip_suffix('.').unwrap_or(&self.data);
        if trimmed.is_empty() {
            1
        } else {
            trimmed.len() + 2
        }
    }

    /// Case-insensitive equality on the text form.
    pub fn equal_fold(&self, other: &Name) -> bool {
        self.data.eq_ignore_ascii_case(&other.data)
    }
}

impl From<&str> for Name {
    fn from(data: &str) -> Self {
        Name::new(data)
    }
}

impl From<String> for Name {
    fn from(data: String) -> Self {
        Name { data }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data)
    }
}
