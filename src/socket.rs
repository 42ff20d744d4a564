//! Host-side socket helper.
//!
//! The engine never opens sockets; this builder is a convenience for hosts
//! that want the standard mDNS socket without spelling out the socket2
//! incantations.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::proto::{MDNS_MULTICAST_IPV4, MDNS_PORT};

/// Builder for a UDP socket configured for mDNS.
///
/// The resulting socket is bound to port 5353 (unless overridden), has
/// `SO_REUSEADDR`/`SO_REUSEPORT` set so it can coexist with other mDNS
/// stacks on the machine, is non-blocking for async use, and has joined
/// the 224.0.0.251 multicast group.
///
/// ```rust,ignore
/// use mdnsd::MulticastSocket;
///
/// let std_socket = MulticastSocket::new().into_std()?;
/// let socket = tokio::net::UdpSocket::from_std(std_socket)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct MulticastSocket {
    port: Option<u16>,
    interface: Option<Ipv4Addr>,
}

impl MulticastSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to a port other than 5353. Peers answer such a socket with
    /// direct unicast replies instead of multicast.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Join the multicast group on one interface instead of all of them.
    /// Pair this with one engine instance per interface.
    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Build the configured `std::net::UdpSocket`.
    pub fn into_std(self) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;

        let port = self.port.unwrap_or(MDNS_PORT);
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        socket.bind(&bind_addr.into())?;

        let interface = self.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket.join_multicast_v4(&MDNS_MULTICAST_IPV4, &interface)?;

        Ok(socket.into())
    }
}
