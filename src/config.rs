//! MdnsConfiguration for the mDNS engine.

use std::time::Duration;

/// Default maximum encoded size of one outgoing datagram. Leaves room for
/// IP and UDP headers within a standard Ethernet MTU.
pub(crate) const DEFAULT_FRAME_SIZE: usize = 1472;

/// Default interval between brute-force cache sweeps. Expiry is normally
/// driven by the entries themselves; the sweep is a rarely needed backstop.
pub(crate) const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(86_400);

/// MdnsConfiguration for an [`Mdns`](crate::Mdns) engine instance.
///
/// ```rust
/// use mdnsd::MdnsConfig;
/// use std::time::Duration;
///
/// let config = MdnsConfig::new()
///     .with_frame_size(4000)
///     .with_gc_interval(Duration::from_secs(3600));
/// ```
#[derive(Clone, Debug)]
pub struct MdnsConfig {
    /// DNS class the engine publishes under and answers for.
    ///
    /// Class 1 (IN) for anything link-local; inbound questions and answers
    /// of any other class are ignored.
    pub class: u16,

    /// Maximum encoded size of one outgoing datagram.
    ///
    /// The send scheduler stops filling a frame once the next record would
    /// push the uncompressed encoding past this limit, leaving the rest for
    /// the following datagram.
    pub frame_size: usize,

    /// Interval between full cache sweeps.
    pub gc_interval: Duration,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            class: 1,
            frame_size: DEFAULT_FRAME_SIZE,
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }
}

impl MdnsConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the DNS class the engine serves. A value of zero keeps the
    /// default Internet class.
    pub fn with_class(mut self, class: u16) -> Self {
        if class != 0 {
            self.class = class;
        }
        self
    }

    /// Set the maximum encoded size of one outgoing datagram.
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Set the interval between full cache sweeps.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }
}
