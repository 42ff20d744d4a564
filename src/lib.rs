//! # mdnsd
//!
//! A sans-I/O implementation of an embeddable Multicast DNS (mDNS)
//! participant for Rust.
//!
//! One [`Mdns`] instance both publishes resource records on the local link
//! and resolves continuous queries about records published by others,
//! hiding the protocol's retransmit timing, duplicate suppression, probing,
//! conflict detection and cache maintenance behind a small API.
//!
//! ## Sans-I/O design
//!
//! The engine implements [`sansio::Protocol`] and performs no I/O at all:
//!
//! - **No sockets**: the caller binds the multicast socket (see
//!   [`MulticastSocket`]) and moves datagrams in and out.
//! - **No clock**: time enters only through `handle_read()` and
//!   `handle_timeout()`; the caller sleeps according to `poll_timeout()`.
//! - **No codec**: datagrams cross the boundary as decoded
//!   [`DnsMessage`] values; any DNS wire packer/parser can be paired with
//!   the engine.
//! - **No callbacks**: answers, expirations and name conflicts are drained
//!   from `poll_event()` as [`MdnsEvent`]s.
//!
//! ## Publishing
//!
//! ```rust
//! use mdnsd::{DnsType, Mdns, MdnsConfig};
//! use sansio::Protocol;
//! use std::net::Ipv4Addr;
//! use std::time::Instant;
//!
//! let mut mdns = Mdns::new(MdnsConfig::default());
//!
//! // Claim a hostname; unique records are probed before they are announced.
//! let host = mdns.alloc_unique("mybox.local", DnsType::A, 120);
//! mdns.set_ip(host, Ipv4Addr::new(192, 168, 1, 9));
//!
//! // The first probe is due immediately.
//! mdns.handle_timeout(Instant::now()).unwrap();
//! let probe = mdns.poll_write().expect("probe datagram");
//! assert!(!probe.message.header.response);
//! assert_eq!(probe.transport.peer_addr.to_string(), "224.0.0.251:5353");
//! ```
//!
//! ## Resolving
//!
//! ```rust
//! use mdnsd::{DnsType, Mdns, MdnsConfig, MdnsEvent};
//! use sansio::Protocol;
//! use std::time::Instant;
//!
//! let mut mdns = Mdns::new(MdnsConfig::default());
//! let browse = mdns.query("_http._tcp.local", DnsType::Ptr);
//!
//! // The question goes out on the next output tick ...
//! mdns.handle_timeout(Instant::now()).unwrap();
//! assert!(mdns.poll_write().is_some());
//!
//! // ... and answers later arrive as events:
//! while let Some(event) = mdns.poll_event() {
//!     match event {
//!         MdnsEvent::QueryAnswered(query, answer) if query == browse => {
//!             if answer.ttl == 0 {
//!                 // record went away
//!             }
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Event loop pattern
//!
//! ```text
//! loop {
//!     while let Some(pkt) = mdns.poll_write() {
//!         socket.send_to(&codec_pack(&pkt.message), pkt.transport.peer_addr);
//!     }
//!     select! {
//!         (bytes, src) = socket.recv_from() => {
//!             mdns.handle_read(tagged(codec_parse(&bytes), src, Instant::now()));
//!         }
//!         _ = sleep_until(mdns.poll_timeout()) => {}
//!     }
//!     mdns.handle_timeout(Instant::now());
//!     while let Some(event) = mdns.poll_event() { /* ... */ }
//! }
//! ```
//!
//! Everything runs on the caller's thread; between calls the engine is
//! inert. Run one instance per network interface.
//!
//! ## Protocol details
//!
//! - Multicast group 224.0.0.251, port 5353 (IPv4)
//! - Unique records probe four times at 250 ms spacing before announcing
//!   with the cache-flush bit set
//! - Announcements repeat four times, two seconds apart; retiring a record
//!   broadcasts it once more with ttl 0 (the goodbye)
//! - Shared answers are jittered by 20-120 ms and suppressed when the
//!   querier already carries them as known answers
//! - Queriers on a source port other than 5353 get a direct unicast reply

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub(crate) mod config;
pub mod message;
pub(crate) mod proto;
pub(crate) mod socket;

pub use config::MdnsConfig;
pub use message::{
    CLASS_CACHE_FLUSH, DNSCLASS_INET, DnsClass, DnsMessage, DnsType, Header, Name, Question,
    RData, Resource,
};
pub use proto::{
    Answer, MDNS_DEST_ADDR, MDNS_MULTICAST_IPV4, MDNS_PORT, Mdns, MdnsEvent, QueryHandle,
    RecordHandle, TaggedDnsMessage,
};
pub use socket::MulticastSocket;
