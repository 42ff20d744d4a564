//! Sans-I/O mDNS engine.
//!
//! [`Mdns`] is a single-process Multicast DNS participant: it publishes
//! resource records on the local link and resolves continuous queries about
//! records published by others, implementing the retransmit timing,
//! duplicate suppression, probing, conflict detection and cache maintenance
//! the protocol requires. It performs no I/O and never reads the clock on
//! its own; the host owns the socket and feeds time in through
//! [`handle_read`](sansio::Protocol::handle_read) and
//! [`handle_timeout`](sansio::Protocol::handle_timeout).
//!
//! # Host loop
//!
//! ```text
//! loop {
//!     while let Some(pkt) = mdns.poll_write() {
//!         let bytes = codec_pack(&pkt.message);
//!         socket.send_to(&bytes, pkt.transport.peer_addr);
//!     }
//!     select! {
//!         (bytes, src) = socket.recv_from() => {
//!             let message = codec_parse(&bytes);
//!             mdns.handle_read(tagged(message, src, Instant::now()));
//!         }
//!         _ = sleep_until(mdns.poll_timeout()) => {}
//!     }
//!     mdns.handle_timeout(Instant::now());
//!     while let Some(event) = mdns.poll_event() {
//!         // QueryAnswered / RecordConflict
//!     }
//! }
//! ```
//!
//! Datagrams cross the boundary already decoded: the engine consumes and
//! produces [`DnsMessage`] values tagged with transport context, and the
//! host pairs it with whatever DNS wire codec it likes.
//!
//! # State
//!
//! Four indices share the engine: locally published records (shared and
//! unique), the cache of records learned from peers, and the registry of
//! continuous queries, each hash-bucketed by case-folded name, plus a LIFO
//! of pending unicast replies. The send scheduler drains five queues in
//! strict priority order, one datagram per pass, honoring the frame budget
//! and the pause/probe/publish/query-retry deadlines.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::{Index, IndexMut};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use slab::Slab;

use shared::error::{Error, Result};
use shared::{TransportContext, TransportMessage, TransportProtocol};

use crate::config::MdnsConfig;
use crate::message::{
    CLASS_CACHE_FLUSH, DnsClass, DnsMessage, DnsType, Name, Question, RData, Resource,
};

/// The mDNS multicast group address (224.0.0.251).
pub const MDNS_MULTICAST_IPV4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The standard mDNS port (5353).
pub const MDNS_PORT: u16 = 5353;

/// mDNS multicast destination address (224.0.0.251:5353).
pub const MDNS_DEST_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(MDNS_MULTICAST_IPV4), MDNS_PORT);

/// A decoded datagram tagged with transport context, as consumed and
/// produced by the engine.
pub type TaggedDnsMessage = TransportMessage<DnsMessage>;

// Bucket counts of the name indices; distinct primes, the cache index
// being the largest of the three tables.
const SPRIME: usize = 107;
const LPRIME: usize = 1009;

// Probe rounds a unique record goes through before it may be announced,
// and the `unique` value of a record whose claim survived them.
const PROBE_ATTEMPTS: u8 = 4;
const UNIQUE_ESTABLISHED: u8 = PROBE_ATTEMPTS + 1;

/// Spacing between probe rounds.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);

// Times a record is announced per (re)publish, and the spacing between
// the repeats.
const PUBLISH_TRIES: u8 = 4;
const PUBLISH_RETRY_INTERVAL: Duration = Duration::from_secs(2);

// Shared-record answers are held back by a random delay in this range so
// identical answers from other hosts can suppress ours.
const ANSWER_JITTER_MIN_MS: u64 = 20;
const ANSWER_JITTER_MAX_MS: u64 = 120;

/// Query retries per round before giving up on a name until its cache
/// entries near expiry.
const QUERY_TRIES: u8 = 3;

/// Cached entries expire at half their advertised lifetime plus this pad,
/// forcing a re-query well before the data actually lapses.
const CACHE_LIFETIME_PAD: Duration = Duration::from_secs(8);

/// How far ahead of a cache entry's expiry its query wakes up to refresh.
const REFRESH_LEAD: Duration = Duration::from_secs(7);

/// Known answers with less remaining lifetime than this are not repeated
/// back in outgoing queries.
const KNOWN_ANSWER_MIN_TTL: Duration = Duration::from_secs(8);

/// Handle of a locally published record.
///
/// Returned by [`Mdns::alloc_shared`] and [`Mdns::alloc_unique`] and valid
/// until the record is retired by [`Mdns::done`] or a conflict.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RecordHandle(pub usize);

/// Handle of a registered continuous query.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct QueryHandle(pub usize);

#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
struct CacheHandle(usize);

impl Index<RecordHandle> for Slab<PublishedRecord> {
    type Output = PublishedRecord;
    fn index(&self, rh: RecordHandle) -> &PublishedRecord {
        &self[rh.0]
    }
}

impl IndexMut<RecordHandle> for Slab<PublishedRecord> {
    fn index_mut(&mut self, rh: RecordHandle) -> &mut PublishedRecord {
        &mut self[rh.0]
    }
}

impl Index<QueryHandle> for Slab<QueryState> {
    type Output = QueryState;
    fn index(&self, qh: QueryHandle) -> &QueryState {
        &self[qh.0]
    }
}

impl IndexMut<QueryHandle> for Slab<QueryState> {
    fn index_mut(&mut self, qh: QueryHandle) -> &mut QueryState {
        &mut self[qh.0]
    }
}

impl Index<CacheHandle> for Slab<CacheEntry> {
    type Output = CacheEntry;
    fn index(&self, ch: CacheHandle) -> &CacheEntry {
        &self[ch.0]
    }
}

impl IndexMut<CacheHandle> for Slab<CacheEntry> {
    fn index_mut(&mut self, ch: CacheHandle) -> &mut CacheEntry {
        &mut self[ch.0]
    }
}

/// The body of a record: name, type, lifetime and decoded data.
///
/// For locally published records `ttl` is the advertised lifetime in
/// seconds (zero once the record is being retired). For answers delivered
/// through [`MdnsEvent::QueryAnswered`], a `ttl` of zero means the record
/// is going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: Name,
    pub typ: DnsType,
    pub ttl: u32,
    pub rdata: RData,
}

impl Answer {
    /// Uncompressed wire size of this record in an answer section.
    fn wire_len(&self) -> usize {
        self.name.wire_len() + 10 + self.rdata.wire_len()
    }
}

/// Events emitted by the engine, drained through
/// [`poll_event`](sansio::Protocol::poll_event).
#[derive(Debug)]
pub enum MdnsEvent {
    /// A registered query was answered, or a previously delivered answer
    /// changed or is going away (`answer.ttl == 0`).
    ///
    /// A host no longer interested in the name stops the query with
    /// [`Mdns::cancel_query`].
    QueryAnswered(QueryHandle, Answer),

    /// Another host claimed a name one of our unique records owns.
    ///
    /// The record has already been withdrawn when this event is delivered;
    /// the owner is expected to pick a new name and register again.
    RecordConflict(RecordHandle, Name, DnsType),
}

// Which send queue a published record currently sits on, if any. A record
// is on at most one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SendQueue {
    Idle,
    Now,
    Paused,
    Publish,
}

#[derive(Debug)]
struct PublishedRecord {
    answer: Answer,
    /// 0 for shared records; probe round 1..=4 while claiming the name;
    /// `UNIQUE_ESTABLISHED` once the claim survived probing.
    unique: u8,
    /// Announcements sent since the last publish.
    tries: u8,
    queue: SendQueue,
}

impl PublishedRecord {
    fn probing(&self) -> bool {
        self.unique > 0 && self.unique < UNIQUE_ESTABLISHED
    }
}

#[derive(Debug)]
struct CacheEntry {
    answer: Answer,
    /// Absolute expiry; deliberately earlier than the advertised lifetime
    /// so the owning query re-asks while the data is still good.
    expires_at: Instant,
    /// The query to notify when this entry changes or expires.
    query: Option<QueryHandle>,
}

#[derive(Debug)]
struct QueryState {
    name: String,
    typ: DnsType,
    tries: u8,
    /// When to send the next question; `None` while dormant.
    next_try: Option<Instant>,
}

// Snapshot of a record taken when a legacy (non-5353) querier asked for
// it, so the reply cannot dangle if the record is retired in between.
#[derive(Debug)]
struct UnicastAnswer {
    id: u16,
    to: SocketAddr,
    answer: Answer,
}

/// Generates a hash code for a name.
///
/// The classic ELF hash over the case-folded bytes; all three name indices
/// bucket with it.
fn name_hash(name: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in name.bytes() {
        hash = (hash << 4).wrapping_add(byte.to_ascii_lowercase() as u32);
        let g = hash & 0xf000_0000;
        if g != 0 {
            hash ^= g >> 24;
        }
        hash &= !g;
    }
    hash
}

fn small_bucket(name: &str) -> usize {
    name_hash(name) as usize % SPRIME
}

fn large_bucket(name: &str) -> usize {
    name_hash(name) as usize % LPRIME
}

// A search type of ANY matches every record type.
fn type_matches(search: DnsType, found: DnsType) -> bool {
    search == DnsType::Any || search == found
}

/// Type-aware equality between a decoded resource and a record body.
///
/// Names compare case-insensitively. A resource of type ANY matches on the
/// name alone; SRV compares the target plus priority, weight and port;
/// NS/CNAME/PTR compare the target name; everything else compares the raw
/// rdata.
fn match_answer(res: &Resource, answer: &Answer) -> bool {
    if !res.name.equal_fold(&answer.name) {
        return false;
    }
    if res.typ == DnsType::Any {
        return true;
    }
    if res.typ != answer.typ {
        return false;
    }

    match (&res.rdata, &answer.rdata) {
        (RData::A(a), RData::A(b)) => a == b,
        (RData::Host(a), RData::Host(b)) => a.equal_fold(b),
        (
            RData::Srv {
                priority: a_prio,
                weight: a_weight,
                port: a_port,
                target: a_target,
            },
            RData::Srv {
                priority: b_prio,
                weight: b_weight,
                port: b_port,
                target: b_target,
            },
        ) => a_prio == b_prio && a_weight == b_weight && a_port == b_port && a_target.equal_fold(b_target),
        (RData::Raw(a), RData::Raw(b)) => a == b,
        (RData::Empty, RData::Empty) => true,
        _ => false,
    }
}

fn answer_resource(answer: &Answer, class: DnsClass, ttl: u32) -> Resource {
    Resource {
        name: answer.name.clone(),
        typ: answer.typ,
        class,
        ttl,
        rdata: answer.rdata.clone(),
    }
}

fn min_instant(a: Option<Instant>, b: Instant) -> Option<Instant> {
    Some(match a {
        Some(a) => a.min(b),
        None => b,
    })
}

/// Sans-I/O mDNS engine; see the crate docs for the host loop pattern.
pub struct Mdns {
    config: MdnsConfig,
    class: DnsClass,
    frame_size: usize,

    /// Frozen time, advanced only at the I/O boundaries.
    now: Instant,

    shutting_down: bool,
    closed: bool,

    // Locally published records and their name index.
    records: Slab<PublishedRecord>,
    published: Vec<Vec<RecordHandle>>,

    // Records learned from peers and their name index.
    cache: Slab<CacheEntry>,
    cache_buckets: Vec<Vec<CacheHandle>>,

    // Continuous queries and their name index.
    queries: Slab<QueryState>,
    query_buckets: Vec<Vec<QueryHandle>>,

    // Send queues. `probing` holds unique records mid-claim; the other
    // three hold records awaiting an answer or announcement slot.
    probing: VecDeque<RecordHandle>,
    a_now: VecDeque<RecordHandle>,
    a_paused: VecDeque<RecordHandle>,
    a_publish: VecDeque<RecordHandle>,
    uanswers: Vec<UnicastAnswer>,

    // Deadlines; meaningful only while the matching queue is non-empty.
    pause_at: Instant,
    probe_at: Instant,
    publish_at: Instant,
    /// Earliest `next_try` over all non-dormant queries.
    checkqlist: Option<Instant>,
    /// Next brute-force cache sweep.
    expire_all_at: Instant,

    write_outs: VecDeque<TaggedDnsMessage>,
    event_outs: VecDeque<MdnsEvent>,
}

impl Mdns {
    /// Create a new engine for the given class of names and frame size.
    pub fn new(config: MdnsConfig) -> Self {
        let now = Instant::now();
        Self {
            class: DnsClass(config.class),
            frame_size: config.frame_size,
            now,
            shutting_down: false,
            closed: false,
            records: Slab::new(),
            published: vec![Vec::new(); SPRIME],
            cache: Slab::new(),
            cache_buckets: vec![Vec::new(); LPRIME],
            queries: Slab::new(),
            query_buckets: vec![Vec::new(); SPRIME],
            probing: VecDeque::new(),
            a_now: VecDeque::new(),
            a_paused: VecDeque::new(),
            a_publish: VecDeque::new(),
            uanswers: Vec::new(),
            pause_at: now,
            probe_at: now,
            publish_at: now,
            checkqlist: None,
            expire_all_at: now + config.gc_interval,
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
            config,
        }
    }

    // ---- publishing ----

    /// Create a new shared record: advertised without a uniqueness claim,
    /// so several hosts may serve the same name.
    ///
    /// Nothing is sent until data is attached with one of the `set_*`
    /// methods.
    pub fn alloc_shared(&mut self, name: &str, typ: DnsType, ttl: u32) -> RecordHandle {
        let rh = RecordHandle(self.records.insert(PublishedRecord {
            answer: Answer {
                name: Name::new(name),
                typ,
                ttl,
                rdata: RData::Empty,
            },
            unique: 0,
            tries: 0,
            queue: SendQueue::Idle,
        }));
        self.published[small_bucket(name)].push(rh);
        rh
    }

    /// Create a new unique record.
    ///
    /// The record immediately enters the probe phase to verify nobody else
    /// claims the name; announcements start once four probe rounds pass
    /// without an objection. If another host turns out to own the name, a
    /// [`MdnsEvent::RecordConflict`] is emitted and the record is dropped.
    ///
    /// Check [`cached_answers`](Mdns::cached_answers) first to avoid
    /// probing a name already known to be taken.
    pub fn alloc_unique(&mut self, name: &str, typ: DnsType, ttl: u32) -> RecordHandle {
        let rh = self.alloc_shared(name, typ, ttl);
        self.records[rh].unique = 1;
        self.probing.push_back(rh);
        self.probe_at = self.now;
        log::debug!("probing {} {}", typ, name);
        rh
    }

    /// Retire a record.
    ///
    /// A record still probing is dropped on the spot. An announced record
    /// is broadcast one last time with a ttl of zero (the goodbye) and then
    /// dropped; the handle is invalid from here on.
    pub fn done(&mut self, rh: RecordHandle) {
        if !self.records.contains(rh.0) {
            return;
        }
        if self.records[rh].probing() {
            self.probing.retain(|&h| h != rh);
            self.destroy_record(rh);
            return;
        }
        self.records[rh].answer.ttl = 0;
        self.send_record(rh);
    }

    /// Set/update raw rdata bytes and publish the record.
    pub fn set_raw(&mut self, rh: RecordHandle, data: &[u8]) {
        if let Some(rec) = self.records.get_mut(rh.0) {
            rec.answer.rdata = RData::Raw(Bytes::copy_from_slice(data));
            self.publish_record(rh);
        }
    }

    /// Set/update the target name (NS/CNAME/PTR) and publish the record.
    pub fn set_host(&mut self, rh: RecordHandle, target: &str) {
        if let Some(rec) = self.records.get_mut(rh.0) {
            rec.answer.rdata = RData::Host(Name::new(target));
            self.publish_record(rh);
        }
    }

    /// Set/update the host address of an A record and publish it.
    pub fn set_ip(&mut self, rh: RecordHandle, ip: Ipv4Addr) {
        if let Some(rec) = self.records.get_mut(rh.0) {
            rec.answer.rdata = RData::A(ip);
            self.publish_record(rh);
        }
    }

    /// Set/update the service data of an SRV record and publish it.
    pub fn set_srv(
        &mut self,
        rh: RecordHandle,
        priority: u16,
        weight: u16,
        port: u16,
        target: &str,
    ) {
        if let Some(rec) = self.records.get_mut(rh.0) {
            rec.answer.rdata = RData::Srv {
                priority,
                weight,
                port,
                target: Name::new(target),
            };
            self.publish_record(rh);
        }
    }

    /// The current body of a published record, or `None` once it has been
    /// retired.
    pub fn published_answer(&self, rh: RecordHandle) -> Option<&Answer> {
        self.records.get(rh.0).map(|rec| &rec.answer)
    }

    // ---- querying ----

    /// Register a continuous query for a name and type (ANY matches every
    /// type on the name).
    ///
    /// The question goes out on the next output tick and is retried a few
    /// times; afterwards the query sleeps until its cached answers near
    /// expiry and re-asks on its own. Answers, changes and expirations
    /// arrive as [`MdnsEvent::QueryAnswered`]. Registering the same name
    /// and type again returns the existing handle.
    pub fn query(&mut self, name: &str, typ: DnsType) -> QueryHandle {
        if let Some(qh) = self.lookup_query(name, typ) {
            return qh;
        }

        let qh = QueryHandle(self.queries.insert(QueryState {
            name: name.to_string(),
            typ,
            tries: 0,
            next_try: None,
        }));
        self.query_buckets[small_bucket(name)].push(qh);

        // Adopt whatever the cache already holds for this name.
        for ch in self.matching_cache(name, typ) {
            self.cache[ch].query = Some(qh);
        }
        self.query_reset(qh);

        // New question, send it out right away.
        self.queries[qh].next_try = Some(self.now);
        self.checkqlist = min_instant(self.checkqlist, self.now);

        log::trace!("query {} {}", typ, name);
        qh
    }

    /// Unregister a continuous query. No further events are delivered for
    /// the handle.
    pub fn cancel_query(&mut self, qh: QueryHandle) {
        if !self.queries.contains(qh.0) {
            return;
        }
        let (name, typ) = {
            let q = &self.queries[qh];
            (q.name.clone(), q.typ)
        };
        for ch in self.matching_cache(&name, typ) {
            if self.cache[ch].query == Some(qh) {
                self.cache[ch].query = None;
            }
        }
        self.query_buckets[small_bucket(&name)].retain(|&h| h != qh);
        self.queries.remove(qh.0);
    }

    /// Number of registered continuous queries.
    pub fn pending_query_count(&self) -> usize {
        self.queries.len()
    }

    /// Iterate the cached answers matching a name and type (ANY matches
    /// every type on the name).
    pub fn cached_answers<'a>(
        &'a self,
        name: &str,
        typ: DnsType,
    ) -> impl Iterator<Item = &'a Answer> + 'a {
        let name = name.to_string();
        self.cache_buckets[large_bucket(&name)]
            .iter()
            .copied()
            .filter_map(move |ch| {
                let answer = &self.cache[ch].answer;
                if type_matches(typ, answer.typ) && answer.name.data.eq_ignore_ascii_case(&name) {
                    Some(answer)
                } else {
                    None
                }
            })
    }

    // ---- lifecycle ----

    /// Begin a graceful shutdown: every published record is re-queued with
    /// a ttl of zero so subsequent output ticks broadcast the goodbyes.
    /// Inbound traffic is ignored from here on.
    pub fn shutdown(&mut self) {
        self.a_now.clear();
        self.a_paused.clear();
        self.a_publish.clear();
        self.probing.clear();

        let handles: Vec<RecordHandle> = self.records.iter().map(|(i, _)| RecordHandle(i)).collect();
        for rh in handles {
            let rec = &mut self.records[rh];
            rec.answer.ttl = 0;
            rec.queue = SendQueue::Now;
            self.a_now.push_back(rh);
        }

        self.shutting_down = true;
        log::debug!("shutting down, {} goodbyes queued", self.a_now.len());
    }

    /// React to a network or interface change (RFC 6762 section 10.1).
    ///
    /// The cache is emptied (queries attached to dropped entries hear a
    /// going-away answer), every query re-asks immediately, unique records
    /// return to the probe phase, and shared records are re-published.
    pub fn flush(&mut self) {
        for (_, entry) in self.cache.iter_mut() {
            entry.expires_at = self.now;
        }
        for idx in 0..LPRIME {
            self.expire_cache_bucket(idx);
        }

        let qhs: Vec<QueryHandle> = self.queries.iter().map(|(i, _)| QueryHandle(i)).collect();
        for qh in qhs {
            let q = &mut self.queries[qh];
            q.tries = 0;
            q.next_try = Some(self.now);
        }
        if !self.queries.is_empty() {
            self.checkqlist = Some(self.now);
        }

        self.a_now.clear();
        self.a_paused.clear();
        self.a_publish.clear();
        self.probing.clear();
        self.uanswers.clear();

        let handles: Vec<RecordHandle> = self.records.iter().map(|(i, _)| RecordHandle(i)).collect();
        for rh in handles {
            let rec = &mut self.records[rh];
            rec.queue = SendQueue::Idle;
            rec.tries = 0;
            if rec.unique > 0 {
                rec.unique = 1;
                self.probing.push_back(rh);
                self.probe_at = self.now;
            } else {
                self.publish_record(rh);
            }
        }
    }

    // ---- record scheduling ----

    // Queue a record for (re)publication: full announcement cycle from the
    // top. Ignored while the record is still probing; the probe completion
    // publishes it.
    fn publish_record(&mut self, rh: RecordHandle) {
        if self.records[rh].probing() {
            return;
        }
        self.records[rh].tries = 0;
        self.publish_at = self.now;
        self.enqueue(rh, SendQueue::Publish);
    }

    // Get a record on the wire as soon as the protocol allows.
    fn send_record(&mut self, rh: RecordHandle) {
        if self.shutting_down {
            self.enqueue(rh, SendQueue::Now);
            return;
        }
        if self.records[rh].tries < PUBLISH_TRIES {
            // Announcements are still owed; bring the retry forward.
            self.publish_at = self.now;
            self.enqueue(rh, SendQueue::Publish);
            return;
        }
        if self.records[rh].unique > 0 {
            self.enqueue(rh, SendQueue::Now);
            return;
        }
        // Shared answers wait out a random pause; if a peer answers the
        // same question first we suppress ours.
        let jitter = rand::rng().random_range(ANSWER_JITTER_MIN_MS..=ANSWER_JITTER_MAX_MS);
        self.pause_at = self.now + Duration::from_millis(jitter);
        self.enqueue(rh, SendQueue::Paused);
    }

    // Move a record onto a send queue, off whichever one it was on.
    fn enqueue(&mut self, rh: RecordHandle, target: SendQueue) {
        let current = self.records[rh].queue;
        if current == target {
            return;
        }
        match current {
            SendQueue::Now => self.a_now.retain(|&h| h != rh),
            SendQueue::Paused => self.a_paused.retain(|&h| h != rh),
            SendQueue::Publish => self.a_publish.retain(|&h| h != rh),
            SendQueue::Idle => {}
        }
        match target {
            SendQueue::Now => self.a_now.push_back(rh),
            SendQueue::Paused => self.a_paused.push_back(rh),
            SendQueue::Publish => self.a_publish.push_back(rh),
            SendQueue::Idle => {}
        }
        self.records[rh].queue = target;
    }

    fn destroy_record(&mut self, rh: RecordHandle) {
        if !self.records.contains(rh.0) {
            return;
        }
        let rec = self.records.remove(rh.0);
        self.published[small_bucket(&rec.answer.name.data)].retain(|&h| h != rh);
        self.probing.retain(|&h| h != rh);
        self.a_now.retain(|&h| h != rh);
        self.a_paused.retain(|&h| h != rh);
        self.a_publish.retain(|&h| h != rh);
    }

    // Another host owns this name: tell the owner and withdraw the record.
    fn conflict(&mut self, rh: RecordHandle) {
        let (name, typ) = {
            let answer = &self.records[rh].answer;
            (answer.name.clone(), answer.typ)
        };
        log::warn!("conflict on {} {}", typ, name);
        self.event_outs
            .push_back(MdnsEvent::RecordConflict(rh, name, typ));
        self.done(rh);
    }

    // ---- index lookups ----

    fn matching_records(&self, name: &str, typ: DnsType) -> Vec<RecordHandle> {
        self.published[small_bucket(name)]
            .iter()
            .copied()
            .filter(|&rh| {
                let answer = &self.records[rh].answer;
                type_matches(typ, answer.typ) && answer.name.data.eq_ignore_ascii_case(name)
            })
            .collect()
    }

    fn matching_cache(&self, name: &str, typ: DnsType) -> Vec<CacheHandle> {
        self.cache_buckets[large_bucket(name)]
            .iter()
            .copied()
            .filter(|&ch| {
                let answer = &self.cache[ch].answer;
                type_matches(typ, answer.typ) && answer.name.data.eq_ignore_ascii_case(name)
            })
            .collect()
    }

    // First query interested in the name; a query registered for ANY
    // matches every type.
    fn lookup_query(&self, name: &str, typ: DnsType) -> Option<QueryHandle> {
        self.query_buckets[small_bucket(name)]
            .iter()
            .copied()
            .find(|&qh| {
                let q = &self.queries[qh];
                (q.typ == DnsType::Any || q.typ == typ) && q.name.eq_ignore_ascii_case(name)
            })
    }

    // ---- query bookkeeping ----

    // Recompute when the query should wake up: shortly before the earliest
    // of its cached answers would expire, or dormant without any.
    fn query_reset(&mut self, qh: QueryHandle) {
        self.queries[qh].tries = 0;
        let (name, typ) = {
            let q = &self.queries[qh];
            (q.name.clone(), q.typ)
        };
        let mut next: Option<Instant> = None;
        for ch in self.matching_cache(&name, typ) {
            let refresh = self.cache[ch].expires_at - REFRESH_LEAD;
            next = min_instant(next, refresh);
        }
        self.queries[qh].next_try = next;
        if let Some(t) = next {
            self.checkqlist = min_instant(self.checkqlist, t);
        }
    }

    // Hand a cached entry to its query, as a going-away answer once the
    // entry's lifetime is spent.
    fn deliver_cached(&mut self, ch: CacheHandle) {
        let Some(qh) = self.cache[ch].query else {
            return;
        };
        if !self.queries.contains(qh.0) {
            self.cache[ch].query = None;
            return;
        }
        let mut answer = self.cache[ch].answer.clone();
        if self.now >= self.cache[ch].expires_at {
            answer.ttl = 0;
        }
        self.event_outs.push_back(MdnsEvent::QueryAnswered(qh, answer));
    }

    // ---- cache ----

    fn cache_add_resource(&mut self, res: &Resource) {
        let idx = large_bucket(&res.name.data);

        if res.class.0 == self.class.0 | CLASS_CACHE_FLUSH {
            // The sender claims the name; everything we held for it is stale.
            for ch in self.matching_cache(&res.name.data, res.typ) {
                self.cache[ch].expires_at = self.now;
            }
            self.expire_cache_bucket(idx);
        }

        if res.ttl == 0 {
            // Goodbye: the matching record is going away.
            for ch in self.matching_cache(&res.name.data, res.typ) {
                if match_answer(res, &self.cache[ch].answer) {
                    self.cache[ch].expires_at = self.now;
                }
            }
            self.expire_cache_bucket(idx);
            return;
        }

        let answer = Answer {
            name: res.name.clone(),
            typ: res.typ,
            ttl: res.ttl,
            rdata: res.rdata.clone(),
        };
        let expires_at = self.now + Duration::from_secs((res.ttl / 2) as u64) + CACHE_LIFETIME_PAD;

        // An identical record refreshes the entry we have instead of
        // growing a duplicate.
        let existing = self
            .matching_cache(&res.name.data, res.typ)
            .into_iter()
            .find(|&ch| match_answer(res, &self.cache[ch].answer));
        let ch = match existing {
            Some(ch) => {
                let entry = &mut self.cache[ch];
                entry.answer = answer;
                entry.expires_at = expires_at;
                ch
            }
            None => {
                let ch = CacheHandle(self.cache.insert(CacheEntry {
                    answer,
                    expires_at,
                    query: None,
                }));
                self.cache_buckets[idx].push(ch);
                ch
            }
        };

        if self.cache[ch].query.is_none() {
            self.cache[ch].query = self.lookup_query(&res.name.data, res.typ);
        }
        if self.cache[ch].query.is_some() {
            self.deliver_cached(ch);
        }
    }

    // Drop every spent entry in one bucket, notifying attached queries.
    fn expire_cache_bucket(&mut self, idx: usize) {
        let expired: Vec<CacheHandle> = self.cache_buckets[idx]
            .iter()
            .copied()
            .filter(|&ch| self.now >= self.cache[ch].expires_at)
            .collect();
        for ch in expired {
            self.deliver_cached(ch);
            self.cache_buckets[idx].retain(|&h| h != ch);
            self.cache.remove(ch.0);
        }
    }

    fn cache_gc(&mut self) {
        for idx in 0..LPRIME {
            self.expire_cache_bucket(idx);
        }
        self.expire_all_at = self.now + self.config.gc_interval;
    }

    // ---- input ----

    fn process_message(&mut self, msg: &DnsMessage, src: SocketAddr) {
        if self.shutting_down {
            return;
        }
        if msg.header.response {
            self.process_answers(msg);
        } else {
            self.process_questions(msg, src);
        }
    }

    // A peer asked questions; answer the ones we publish for, unless the
    // peer told us it already knows the answer.
    fn process_questions(&mut self, msg: &DnsMessage, src: SocketAddr) {
        for question in &msg.questions {
            if question.class.0 != self.class.0 {
                continue;
            }
            let matches = self.matching_records(&question.name.data, question.typ);
            let Some(&first) = matches.first() else {
                continue;
            };

            if src.port() != MDNS_PORT {
                // Legacy querier on an ephemeral port wants a direct reply.
                self.uanswers.push(UnicastAnswer {
                    id: msg.header.id,
                    to: src,
                    answer: self.records[first].answer.clone(),
                });
            }

            for rh in matches {
                if !self.records.contains(rh.0) {
                    continue;
                }

                if self.records[rh].probing() {
                    // A probe for the same name: the peer's tentative data
                    // rides in the authority section. Someone announcing
                    // different data wins unless our own data is there too.
                    let (have_match, may_conflict) = {
                        let answer = &self.records[rh].answer;
                        let mut have_match = false;
                        let mut may_conflict = false;
                        for ns in &msg.authorities {
                            if ns.ttl == 0
                                || ns.typ != answer.typ
                                || !ns.name.equal_fold(&answer.name)
                            {
                                continue;
                            }
                            if match_answer(ns, answer) {
                                have_match = true;
                            } else {
                                may_conflict = true;
                            }
                        }
                        (have_match, may_conflict)
                    };
                    if may_conflict && !have_match {
                        self.conflict(rh);
                    }
                    continue;
                }

                // Known-answer suppression: stay quiet if the querier
                // already carries our answer.
                let known = {
                    let answer = &self.records[rh].answer;
                    msg.answers.iter().any(|an| {
                        type_matches(question.typ, an.typ)
                            && an.name.equal_fold(&question.name)
                            && match_answer(an, answer)
                    })
                };
                if !known {
                    self.send_record(rh);
                }
            }
        }
    }

    // A peer responded; check its answers against our unique claims and
    // feed them to the cache.
    fn process_answers(&mut self, msg: &DnsMessage) {
        for an in &msg.answers {
            let matches = self.matching_records(&an.name.data, an.typ);

            let mut have_match = false;
            let mut may_conflict = false;
            for &rh in &matches {
                let rec = &self.records[rh];
                if rec.unique > 0 {
                    if match_answer(an, &rec.answer) {
                        have_match = true;
                    } else {
                        may_conflict = true;
                    }
                }
            }
            if may_conflict && !have_match && an.ttl > 0 {
                for &rh in &matches {
                    if !self.records.contains(rh.0) {
                        continue;
                    }
                    let mismatch = {
                        let rec = &self.records[rh];
                        rec.unique > 0 && !match_answer(an, &rec.answer)
                    };
                    if mismatch {
                        self.conflict(rh);
                    }
                }
            }

            self.cache_add_resource(an);
        }
    }

    // ---- output ----

    // Copy records off the immediate or paused queue into the message
    // while the frame budget allows; a record alone in the frame may
    // exceed the budget rather than wedge the queue.
    fn drain_answers(&mut self, msg: &mut DnsMessage, paused: bool) -> usize {
        let mut sent = 0;
        loop {
            let front = if paused {
                self.a_paused.front()
            } else {
                self.a_now.front()
            };
            let Some(&rh) = front else {
                break;
            };

            let len = self.records[rh].answer.wire_len();
            if msg.encoded_len() + len >= self.frame_size && !msg.is_empty() {
                break;
            }

            if paused {
                self.a_paused.pop_front();
            } else {
                self.a_now.pop_front();
            }

            let rec = &mut self.records[rh];
            rec.queue = SendQueue::Idle;
            let class = if rec.unique > 0 {
                self.class.with_cache_flush()
            } else {
                self.class
            };
            let ttl = rec.answer.ttl;
            msg.add_answer(answer_resource(&rec.answer, class, ttl));
            sent += 1;

            if ttl == 0 {
                // Goodbye sent, the record's life ends here.
                self.destroy_record(rh);
            }
        }
        sent
    }

    // One scheduler pass: build at most one outgoing datagram, in strict
    // priority order. Returns `None` when nothing was due.
    fn run_output_pass(&mut self) -> Option<TaggedDnsMessage> {
        let mut msg = DnsMessage::default();
        msg.header.response = true;
        msg.header.authoritative = true;

        // Pending unicast replies first, one per datagram, echoing the
        // querier's message id.
        if let Some(unicast) = self.uanswers.pop() {
            msg.header.id = unicast.id;
            msg.add_question(Question {
                name: unicast.answer.name.clone(),
                typ: unicast.answer.typ,
                class: self.class,
            });
            let ttl = unicast.answer.ttl;
            msg.add_answer(answer_resource(&unicast.answer, self.class, ttl));
            log::trace!("unicast reply to {}", unicast.to);
            return Some(self.tag(msg, unicast.to));
        }

        let mut emitted = 0;

        // Immediate answers.
        emitted += self.drain_answers(&mut msg, false);

        // Publish retries, if due; re-arm the deadline for whatever is left.
        if !self.a_publish.is_empty() && self.now >= self.publish_at {
            let mut idx = 0;
            while idx < self.a_publish.len() {
                let rh = self.a_publish[idx];
                let len = self.records[rh].answer.wire_len();
                if msg.encoded_len() + len >= self.frame_size && !msg.is_empty() {
                    break;
                }

                let rec = &mut self.records[rh];
                rec.tries += 1;
                let class = if rec.unique > 0 {
                    self.class.with_cache_flush()
                } else {
                    self.class
                };
                let ttl = rec.answer.ttl;
                let tries = rec.tries;
                msg.add_answer(answer_resource(&rec.answer, class, ttl));
                emitted += 1;

                if ttl != 0 && tries < PUBLISH_TRIES {
                    idx += 1;
                    continue;
                }
                let _ = self.a_publish.remove(idx);
                self.records[rh].queue = SendQueue::Idle;
                if ttl == 0 {
                    self.destroy_record(rh);
                }
            }
            if !self.a_publish.is_empty() {
                self.publish_at = self.now + PUBLISH_RETRY_INTERVAL;
            }
        }

        // During shutdown only the goodbyes above go out.
        if self.shutting_down {
            return if emitted > 0 {
                Some(self.tag(msg, MDNS_DEST_ADDR))
            } else {
                None
            };
        }

        // Shared answers whose random pause has elapsed.
        if !self.a_paused.is_empty() && self.now >= self.pause_at {
            emitted += self.drain_answers(&mut msg, true);
        }

        if emitted > 0 {
            return Some(self.tag(msg, MDNS_DEST_ADDR));
        }

        // Everything below is question traffic.
        msg.header.response = false;
        msg.header.authoritative = false;

        // Probe round: ask for each claimed name, carry the tentative
        // answers in the authority section.
        if !self.probing.is_empty() && self.now >= self.probe_at {
            let probing: Vec<RecordHandle> = self.probing.iter().copied().collect();
            for &rh in &probing {
                msg.add_question(Question {
                    name: self.records[rh].answer.name.clone(),
                    typ: DnsType::Any,
                    class: self.class,
                });
            }
            for &rh in &probing {
                let rec = &mut self.records[rh];
                rec.unique += 1;
                let ttl = rec.answer.ttl;
                msg.add_authority(answer_resource(&rec.answer, self.class, ttl));
                emitted += 1;
            }

            // Claims that survived all four rounds graduate to publishing,
            // one probe interval from now.
            let complete: Vec<RecordHandle> = self
                .probing
                .iter()
                .copied()
                .filter(|&rh| self.records[rh].unique > PROBE_ATTEMPTS)
                .collect();
            let promoted = !complete.is_empty();
            for rh in complete {
                self.probing.retain(|&h| h != rh);
                log::debug!("{} probed, announcing", self.records[rh].answer.name);
                self.publish_record(rh);
            }
            if promoted {
                self.publish_at = self.now + PROBE_INTERVAL;
            }

            if emitted > 0 {
                self.probe_at = self.now + PROBE_INTERVAL;
                return Some(self.tag(msg, MDNS_DEST_ADDR));
            }
        }

        // Query retries and refreshes.
        if matches!(self.checkqlist, Some(t) if self.now >= t) {
            self.checkqlist = None;
            let mut nextbest: Option<Instant> = None;
            let qhs: Vec<QueryHandle> = self.queries.iter().map(|(i, _)| QueryHandle(i)).collect();

            // Ask first, and track the earliest wake-up among the rest.
            for &qh in &qhs {
                let q = &self.queries[qh];
                match q.next_try {
                    Some(t) if t <= self.now && q.tries < QUERY_TRIES => {
                        msg.add_question(Question {
                            name: Name::new(&q.name),
                            typ: q.typ,
                            class: self.class,
                        });
                    }
                    Some(t) => nextbest = min_instant(nextbest, t),
                    None => {}
                }
            }

            // Bump the retry counters and pack known answers alongside.
            for &qh in &qhs {
                let due = matches!(self.queries[qh].next_try, Some(t) if t <= self.now);
                if !due {
                    continue;
                }

                if self.queries[qh].tries == QUERY_TRIES {
                    // This round is spent; drop what expired and sleep
                    // until the survivors need refreshing.
                    let name = self.queries[qh].name.clone();
                    self.expire_cache_bucket(large_bucket(&name));
                    self.query_reset(qh);
                    continue;
                }

                emitted += 1;
                let (name, typ) = {
                    let q = &mut self.queries[qh];
                    q.tries += 1;
                    let next = self.now + Duration::from_secs(q.tries as u64);
                    q.next_try = Some(next);
                    nextbest = min_instant(nextbest, next);
                    (q.name.clone(), q.typ)
                };

                // Known answers with real lifetime left ride along so
                // responders can keep quiet.
                for ch in self.matching_cache(&name, typ) {
                    let entry = &self.cache[ch];
                    if entry.expires_at <= self.now + KNOWN_ANSWER_MIN_TTL {
                        continue;
                    }
                    let remaining = (entry.expires_at - self.now).as_secs() as u32;
                    let known = answer_resource(&entry.answer, self.class, remaining);
                    if msg.encoded_len() + known.wire_len() >= self.frame_size {
                        break;
                    }
                    msg.add_answer(known);
                }
            }

            self.checkqlist = match (self.checkqlist, nextbest) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            };
        }

        if self.now > self.expire_all_at {
            self.cache_gc();
        }

        if emitted > 0 {
            Some(self.tag(msg, MDNS_DEST_ADDR))
        } else {
            None
        }
    }

    // Work that must go out at the frozen `now` without waiting for the
    // host to sleep first.
    fn immediate_work_pending(&self) -> bool {
        !self.uanswers.is_empty()
            || !self.a_now.is_empty()
            || (!self.a_publish.is_empty() && self.now >= self.publish_at)
            || (!self.shutting_down && !self.a_paused.is_empty() && self.now >= self.pause_at)
            || (!self.probing.is_empty() && self.now >= self.probe_at)
            || (!self.queries.is_empty() && matches!(self.checkqlist, Some(t) if self.now >= t))
    }

    fn tag(&self, message: DnsMessage, peer_addr: SocketAddr) -> TaggedDnsMessage {
        TransportMessage {
            now: self.now,
            transport: TransportContext {
                local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                peer_addr,
                transport_protocol: TransportProtocol::UDP,
                ecn: None,
            },
            message,
        }
    }
}

impl sansio::Protocol<TaggedDnsMessage, (), ()> for Mdns {
    type Rout = ();
    type Wout = TaggedDnsMessage;
    type Eout = MdnsEvent;
    type Error = Error;

    /// Process one received datagram, already decoded by the host codec.
    ///
    /// Questions we publish an answer for schedule a response (unicast when
    /// the source port is not 5353); answers are screened for conflicts
    /// with our unique records and fed to the cache, fanning out to
    /// registered queries as [`MdnsEvent::QueryAnswered`].
    fn handle_read(&mut self, msg: TaggedDnsMessage) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        self.now = msg.now;
        self.process_message(&msg.message, msg.transport.peer_addr);
        Ok(())
    }

    /// The engine produces no read output; answers surface as events.
    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    /// Not used; records are published through the `alloc_*`/`set_*` API.
    fn handle_write(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    /// Next outgoing datagram, with its destination in
    /// `transport.peer_addr`: the multicast group, or a querier's own
    /// address for unicast replies.
    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.write_outs.pop_front()
    }

    /// Not used.
    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    /// Next engine event.
    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.event_outs.pop_front()
    }

    /// Advance the clock and run the send scheduler.
    ///
    /// Builds every datagram due at `now` into the write queue: unicast
    /// replies, immediate and un-paused answers, publish retries, probe
    /// rounds, query retries with their known answers, and the periodic
    /// cache sweep.
    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        self.now = now;
        loop {
            if let Some(pkt) = self.run_output_pass() {
                self.write_outs.push_back(pkt);
                continue;
            }
            if !self.immediate_work_pending() {
                break;
            }
        }
        Ok(())
    }

    /// When `handle_timeout` next needs to run.
    ///
    /// Immediately while unicast replies or immediate answers wait;
    /// otherwise the earliest of the pause, probe, publish and query-retry
    /// deadlines, and as a last resort the next cache sweep.
    fn poll_timeout(&mut self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        if !self.uanswers.is_empty() || !self.a_now.is_empty() {
            return Some(self.now);
        }
        if !self.a_paused.is_empty() {
            return Some(self.pause_at);
        }
        if !self.probing.is_empty() {
            return Some(self.probe_at);
        }
        if !self.a_publish.is_empty() {
            return Some(self.publish_at);
        }
        if let Some(t) = self.checkqlist {
            return Some(t);
        }
        Some(self.expire_all_at)
    }

    /// Drop all state and refuse further I/O.
    ///
    /// For a graceful exit call [`Mdns::shutdown`] first and drain the
    /// goodbye datagrams before closing.
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.records.clear();
        for bucket in &mut self.published {
            bucket.clear();
        }
        self.cache.clear();
        for bucket in &mut self.cache_buckets {
            bucket.clear();
        }
        self.queries.clear();
        for bucket in &mut self.query_buckets {
            bucket.clear();
        }
        self.probing.clear();
        self.a_now.clear();
        self.a_paused.clear();
        self.a_publish.clear();
        self.uanswers.clear();
        self.checkqlist = None;
        self.write_outs.clear();
        self.event_outs.clear();
        Ok(())
    }
}

#[cfg(test)]
mod mdns_test;
