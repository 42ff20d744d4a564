use super::*;
use sansio::Protocol;

fn new_conn() -> Mdns {
    Mdns::new(MdnsConfig::default())
}

fn src(ip: [u8; 4], port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])), port)
}

fn inbound(message: DnsMessage, peer: SocketAddr, now: Instant) -> TaggedDnsMessage {
    TransportMessage {
        now,
        transport: TransportContext {
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MDNS_PORT),
            peer_addr: peer,
            transport_protocol: TransportProtocol::UDP,
            ecn: None,
        },
        message,
    }
}

fn a_resource(name: &str, ttl: u32, ip: [u8; 4]) -> Resource {
    Resource {
        name: Name::new(name),
        typ: DnsType::A,
        class: DnsClass(1),
        ttl,
        rdata: RData::A(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
    }
}

fn question(name: &str, typ: DnsType) -> Question {
    Question {
        name: Name::new(name),
        typ,
        class: DnsClass(1),
    }
}

fn response_with(answers: Vec<Resource>) -> DnsMessage {
    let mut msg = DnsMessage::default();
    msg.header.response = true;
    msg.header.authoritative = true;
    msg.answers = answers;
    msg
}

fn drain(conn: &mut Mdns) -> Vec<TaggedDnsMessage> {
    let mut out = Vec::new();
    while let Some(pkt) = conn.poll_write() {
        out.push(pkt);
    }
    out
}

#[test]
fn test_probe_then_publish() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_unique("unique-host.local", DnsType::A, 120);
    conn.set_ip(rh, Ipv4Addr::new(192, 168, 1, 44));

    // Four probe rounds, 250 ms apart.
    for step in 0..4u32 {
        conn.handle_timeout(t0 + PROBE_INTERVAL * step).unwrap();
        let pkts = drain(&mut conn);
        assert_eq!(pkts.len(), 1, "probe round {step}");
        let msg = &pkts[0].message;
        assert!(!msg.header.response);
        assert!(!msg.header.authoritative);
        assert_eq!(msg.questions.len(), 1);
        assert_eq!(msg.questions[0].typ, DnsType::Any);
        assert_eq!(msg.questions[0].name.data, "unique-host.local");
        assert_eq!(msg.authorities.len(), 1);
        assert_eq!(msg.authorities[0].typ, DnsType::A);
        assert_eq!(msg.authorities[0].ttl, 120);
        assert_eq!(pkts[0].transport.peer_addr, MDNS_DEST_ADDR);
    }

    // The claim survived; the next tick announces with the cache-flush bit.
    conn.handle_timeout(t0 + PROBE_INTERVAL * 4).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    let msg = &pkts[0].message;
    assert!(msg.header.response);
    assert!(msg.header.authoritative);
    assert_eq!(msg.answers.len(), 1);
    assert_eq!(msg.answers[0].class.0, 0x8001);
    assert_eq!(msg.answers[0].ttl, 120);
    assert_eq!(conn.records[rh].unique, UNIQUE_ESTABLISHED);
    assert!(conn.probing.is_empty());
}

#[test]
fn test_probe_conflict() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_unique("unique-host.local", DnsType::A, 120);
    conn.set_ip(rh, Ipv4Addr::new(10, 0, 0, 1));

    conn.handle_timeout(t0).unwrap();
    assert_eq!(drain(&mut conn).len(), 1);

    // A peer probes the same name with different data before our fourth
    // round: its tentative answer rides in the authority section.
    let mut msg = DnsMessage::default();
    msg.add_question(question("unique-host.local", DnsType::A));
    msg.add_authority(a_resource("unique-host.local", 120, [10, 0, 0, 99]));
    conn.handle_read(inbound(msg, src([192, 168, 1, 7], MDNS_PORT), t0 + PROBE_INTERVAL))
        .unwrap();

    match conn.poll_event() {
        Some(MdnsEvent::RecordConflict(handle, name, typ)) => {
            assert_eq!(handle, rh);
            assert_eq!(name.data, "unique-host.local");
            assert_eq!(typ, DnsType::A);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(conn.poll_event().is_none());
    assert!(conn.published_answer(rh).is_none());

    // No further probes for the dead record.
    conn.handle_timeout(t0 + PROBE_INTERVAL * 2).unwrap();
    assert!(drain(&mut conn).is_empty());
}

#[test]
fn test_shared_publish_retries() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_shared("_http._tcp.local", DnsType::Ptr, 120);
    conn.set_host(rh, "web.local");

    // Announcements repeat four times, two seconds apart, then stop.
    for step in 0..4u32 {
        conn.handle_timeout(t0 + PUBLISH_RETRY_INTERVAL * step).unwrap();
        let pkts = drain(&mut conn);
        assert_eq!(pkts.len(), 1, "announce {step}");
        let msg = &pkts[0].message;
        assert!(msg.header.response);
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(msg.answers[0].typ, DnsType::Ptr);
        assert_eq!(msg.answers[0].class.0, 1, "shared records carry no cache-flush bit");
        assert_eq!(msg.answers[0].rdata, RData::Host(Name::new("web.local")));
    }
    assert_eq!(conn.records[rh].tries, PUBLISH_TRIES);
    assert!(conn.a_publish.is_empty());

    conn.handle_timeout(t0 + PUBLISH_RETRY_INTERVAL * 4).unwrap();
    assert!(drain(&mut conn).is_empty());
}

#[test]
fn test_goodbye_roundtrip() {
    let mut conn = new_conn();
    let t0 = conn.now;

    // Alloc followed by done, nothing published in between: one goodbye
    // leaves and the store returns to its pre-alloc state.
    let rh = conn.alloc_shared("ephemeral.local", DnsType::Txt, 120);
    conn.done(rh);

    conn.handle_timeout(t0).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].message.answers.len(), 1);
    assert_eq!(pkts[0].message.answers[0].ttl, 0);
    assert!(conn.published_answer(rh).is_none());
    assert!(conn.records.is_empty());

    conn.handle_timeout(t0 + Duration::from_secs(1)).unwrap();
    assert!(drain(&mut conn).is_empty());
}

#[test]
fn test_goodbye_after_announce() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_shared("_http._tcp.local", DnsType::Ptr, 120);
    conn.set_host(rh, "web.local");
    conn.handle_timeout(t0).unwrap();
    assert_eq!(drain(&mut conn).len(), 1);

    conn.done(rh);
    conn.handle_timeout(t0 + Duration::from_millis(100)).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].message.answers[0].ttl, 0);
    assert!(conn.records.is_empty());
}

#[test]
fn test_answer_jitter_and_suppression() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_shared("_ipp._tcp.local", DnsType::Ptr, 4500);
    conn.set_host(rh, "printer.local");

    // Work through the announcement cycle first.
    for step in 0..4u32 {
        conn.handle_timeout(t0 + PUBLISH_RETRY_INTERVAL * step).unwrap();
        drain(&mut conn);
    }
    assert_eq!(conn.records[rh].tries, PUBLISH_TRIES);

    // A peer asks and doesn't know the answer: we schedule a jittered reply.
    let t1 = t0 + Duration::from_secs(10);
    let mut query = DnsMessage::default();
    query.add_question(question("_ipp._tcp.local", DnsType::Ptr));
    conn.handle_read(inbound(query, src([192, 168, 1, 7], MDNS_PORT), t1))
        .unwrap();

    assert_eq!(conn.a_paused.len(), 1);
    assert!(conn.pause_at >= t1 + Duration::from_millis(ANSWER_JITTER_MIN_MS));
    assert!(conn.pause_at <= t1 + Duration::from_millis(ANSWER_JITTER_MAX_MS));

    // Nothing goes out before the pause elapses ...
    conn.handle_timeout(t1).unwrap();
    assert!(drain(&mut conn).is_empty());

    // ... and the answer follows once it has.
    conn.handle_timeout(t1 + Duration::from_millis(150)).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].message.answers.len(), 1);
    assert_eq!(pkts[0].message.answers[0].typ, DnsType::Ptr);

    // Same question carrying our answer as a known answer: suppressed.
    let t2 = t1 + Duration::from_secs(5);
    let mut query = DnsMessage::default();
    query.add_question(question("_ipp._tcp.local", DnsType::Ptr));
    query.add_answer(Resource {
        name: Name::new("_ipp._tcp.local"),
        typ: DnsType::Ptr,
        class: DnsClass(1),
        ttl: 4500,
        rdata: RData::Host(Name::new("printer.local")),
    });
    conn.handle_read(inbound(query, src([192, 168, 1, 7], MDNS_PORT), t2))
        .unwrap();

    assert!(conn.a_paused.is_empty());
    conn.handle_timeout(t2 + Duration::from_millis(200)).unwrap();
    assert!(drain(&mut conn).is_empty());
}

#[test]
fn test_unicast_reply() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_shared("camera.local", DnsType::A, 120);
    conn.set_ip(rh, Ipv4Addr::new(192, 168, 1, 77));
    for step in 0..4u32 {
        conn.handle_timeout(t0 + PUBLISH_RETRY_INTERVAL * step).unwrap();
        drain(&mut conn);
    }

    // A legacy querier on an ephemeral port gets a direct reply echoing
    // its message id, ahead of any multicast traffic.
    let legacy = src([192, 168, 1, 5], 54321);
    let t1 = t0 + Duration::from_secs(10);
    let mut query = DnsMessage::default();
    query.header.id = 0x4242;
    query.add_question(question("camera.local", DnsType::A));
    conn.handle_read(inbound(query, legacy, t1)).unwrap();

    conn.handle_timeout(t1).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].transport.peer_addr, legacy);
    let msg = &pkts[0].message;
    assert_eq!(msg.header.id, 0x4242);
    assert!(msg.header.response);
    assert!(msg.header.authoritative);
    assert_eq!(msg.questions.len(), 1);
    assert_eq!(msg.answers.len(), 1);
    assert_eq!(msg.answers[0].rdata, RData::A(Ipv4Addr::new(192, 168, 1, 77)));

    // The jittered multicast answer still follows on its own schedule.
    conn.handle_timeout(t1 + Duration::from_millis(150)).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].transport.peer_addr, MDNS_DEST_ADDR);
}

#[test]
fn test_unicast_replies_are_lifo() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_shared("camera.local", DnsType::A, 120);
    conn.set_ip(rh, Ipv4Addr::new(192, 168, 1, 77));

    let first = src([192, 168, 1, 5], 1111);
    let second = src([192, 168, 1, 6], 2222);
    for peer in [first, second] {
        let mut query = DnsMessage::default();
        query.add_question(question("camera.local", DnsType::A));
        conn.handle_read(inbound(query, peer, t0)).unwrap();
    }

    assert_eq!(conn.uanswers.len(), 2);
    conn.handle_timeout(t0).unwrap();
    let pkts = drain(&mut conn);
    assert!(pkts.len() >= 2);
    assert_eq!(pkts[0].transport.peer_addr, second);
    assert_eq!(pkts[1].transport.peer_addr, first);
}

#[test]
fn test_query_fanout() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let qh = conn.query("host.local", DnsType::A);

    // The question goes out immediately.
    conn.handle_timeout(t0).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    let msg = &pkts[0].message;
    assert!(!msg.header.response);
    assert_eq!(msg.questions.len(), 1);
    assert_eq!(msg.questions[0].typ, DnsType::A);

    // A response arrives; the query hears about it with the advertised ttl
    // and the cache holds one entry expiring at half-lifetime plus pad.
    let t1 = t0 + Duration::from_millis(500);
    let answer = a_resource("host.local", 60, [10, 1, 2, 3]);
    conn.handle_read(inbound(response_with(vec![answer]), src([10, 1, 2, 3], MDNS_PORT), t1))
        .unwrap();

    match conn.poll_event() {
        Some(MdnsEvent::QueryAnswered(handle, answer)) => {
            assert_eq!(handle, qh);
            assert_eq!(answer.ttl, 60);
            assert_eq!(answer.rdata, RData::A(Ipv4Addr::new(10, 1, 2, 3)));
        }
        other => panic!("expected answer, got {other:?}"),
    }
    assert!(conn.poll_event().is_none());

    assert_eq!(conn.cache.len(), 1);
    let (_, entry) = conn.cache.iter().next().unwrap();
    assert_eq!(entry.expires_at, t1 + Duration::from_secs(38));
    assert_eq!(entry.query, Some(qh));
    assert_eq!(conn.cached_answers("host.local", DnsType::A).count(), 1);
}

#[test]
fn test_query_retry_carries_known_answers() {
    let mut conn = new_conn();
    let t0 = conn.now;

    conn.query("host.local", DnsType::A);
    conn.handle_timeout(t0).unwrap();
    drain(&mut conn);

    let answer = a_resource("host.local", 60, [10, 1, 2, 3]);
    conn.handle_read(inbound(response_with(vec![answer]), src([10, 1, 2, 3], MDNS_PORT), t0))
        .unwrap();
    conn.poll_event();

    // The first retry repeats the question with the cached record as a
    // known answer, ttl counted down to its remaining lifetime.
    conn.handle_timeout(t0 + Duration::from_secs(1)).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    let msg = &pkts[0].message;
    assert!(!msg.header.response);
    assert_eq!(msg.questions.len(), 1);
    assert_eq!(msg.answers.len(), 1);
    assert!(msg.answers[0].ttl >= 36 && msg.answers[0].ttl <= 38);
}

#[test]
fn test_query_retry_backoff() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let qh = conn.query("nowhere.local", DnsType::A);

    // Retries back off by one more second each round.
    for at in [t0, t0 + Duration::from_secs(1), t0 + Duration::from_secs(3)] {
        conn.handle_timeout(at).unwrap();
        let pkts = drain(&mut conn);
        assert_eq!(pkts.len(), 1);
        assert_eq!(pkts[0].message.questions.len(), 1);
    }
    assert_eq!(conn.queries[qh].tries, QUERY_TRIES);

    // The round is spent and the cache is empty: the query goes dormant.
    conn.handle_timeout(t0 + Duration::from_secs(6)).unwrap();
    assert!(drain(&mut conn).is_empty());
    assert_eq!(conn.queries[qh].next_try, None);
    assert_eq!(conn.checkqlist, None);
}

#[test]
fn test_query_register_unregister_roundtrip() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let answer = a_resource("host.local", 120, [10, 1, 2, 3]);
    conn.handle_read(inbound(response_with(vec![answer]), src([10, 1, 2, 3], MDNS_PORT), t0))
        .unwrap();

    let qh = conn.query("host.local", DnsType::A);
    assert_eq!(conn.pending_query_count(), 1);
    // Registering the same name and type again returns the same query.
    assert_eq!(conn.query("host.local", DnsType::A), qh);
    assert_eq!(conn.pending_query_count(), 1);

    let (_, entry) = conn.cache.iter().next().unwrap();
    assert_eq!(entry.query, Some(qh));

    conn.cancel_query(qh);
    assert_eq!(conn.pending_query_count(), 0);
    let (_, entry) = conn.cache.iter().next().unwrap();
    assert_eq!(entry.query, None);
    assert!(conn.query_buckets.iter().all(|bucket| bucket.is_empty()));
}

#[test]
fn test_cache_dedup_and_refresh() {
    let mut conn = new_conn();
    let t0 = conn.now;
    let peer = src([10, 1, 2, 3], MDNS_PORT);

    let answer = a_resource("host.local", 60, [10, 1, 2, 3]);
    conn.handle_read(inbound(response_with(vec![answer.clone()]), peer, t0))
        .unwrap();
    assert_eq!(conn.cache.len(), 1);

    // The identical record again, longer lifetime: still one entry, the
    // ttl reflecting the latter.
    let mut refreshed = answer;
    refreshed.ttl = 90;
    let t1 = t0 + Duration::from_secs(5);
    conn.handle_read(inbound(response_with(vec![refreshed]), peer, t1))
        .unwrap();
    assert_eq!(conn.cache.len(), 1);
    let (_, entry) = conn.cache.iter().next().unwrap();
    assert_eq!(entry.answer.ttl, 90);
    assert_eq!(entry.expires_at, t1 + Duration::from_secs(53));
}

#[test]
fn test_cache_flush_bit_replaces() {
    let mut conn = new_conn();
    let t0 = conn.now;
    let peer = src([10, 1, 2, 3], MDNS_PORT);

    conn.handle_read(inbound(
        response_with(vec![a_resource("host.local", 120, [10, 0, 0, 1])]),
        peer,
        t0,
    ))
    .unwrap();

    // A record with the cache-flush bit evicts everything we held for the
    // name and type before the new data lands.
    let mut flush = a_resource("host.local", 120, [10, 0, 0, 2]);
    flush.class = DnsClass(1).with_cache_flush();
    conn.handle_read(inbound(response_with(vec![flush]), peer, t0 + Duration::from_secs(1)))
        .unwrap();

    let answers: Vec<&Answer> = conn.cached_answers("host.local", DnsType::A).collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].rdata, RData::A(Ipv4Addr::new(10, 0, 0, 2)));
}

#[test]
fn test_inbound_goodbye_expires_entry() {
    let mut conn = new_conn();
    let t0 = conn.now;
    let peer = src([10, 1, 2, 3], MDNS_PORT);

    let qh = conn.query("host.local", DnsType::A);
    conn.handle_read(inbound(
        response_with(vec![a_resource("host.local", 120, [10, 0, 0, 1])]),
        peer,
        t0,
    ))
    .unwrap();
    match conn.poll_event() {
        Some(MdnsEvent::QueryAnswered(_, answer)) => assert_eq!(answer.ttl, 120),
        other => panic!("expected answer, got {other:?}"),
    }

    // The peer retires the record: the query hears a going-away answer and
    // the entry is gone.
    let mut goodbye = a_resource("host.local", 0, [10, 0, 0, 1]);
    goodbye.ttl = 0;
    conn.handle_read(inbound(response_with(vec![goodbye]), peer, t0 + Duration::from_secs(2)))
        .unwrap();
    match conn.poll_event() {
        Some(MdnsEvent::QueryAnswered(handle, answer)) => {
            assert_eq!(handle, qh);
            assert_eq!(answer.ttl, 0);
        }
        other => panic!("expected going-away answer, got {other:?}"),
    }
    assert!(conn.cache.is_empty());
}

#[test]
fn test_established_unique_conflict() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_unique("unique-host.local", DnsType::A, 120);
    conn.set_ip(rh, Ipv4Addr::new(10, 0, 0, 1));
    for step in 0..5u32 {
        conn.handle_timeout(t0 + PROBE_INTERVAL * step).unwrap();
        drain(&mut conn);
    }
    assert_eq!(conn.records[rh].unique, UNIQUE_ESTABLISHED);

    // A peer responds claiming our established name with different data.
    let t1 = t0 + Duration::from_secs(5);
    conn.handle_read(inbound(
        response_with(vec![a_resource("unique-host.local", 120, [10, 0, 0, 99])]),
        src([192, 168, 1, 7], MDNS_PORT),
        t1,
    ))
    .unwrap();

    assert!(matches!(
        conn.poll_event(),
        Some(MdnsEvent::RecordConflict(handle, _, _)) if handle == rh
    ));

    // The withdrawal is announced as a goodbye.
    conn.handle_timeout(t1).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].message.answers[0].ttl, 0);
    assert!(conn.records.is_empty());
}

#[test]
fn test_frame_limit_leaves_queue() {
    let mut conn = Mdns::new(MdnsConfig::default().with_frame_size(120));
    let data = [0u8; 40];
    for name in ["svc-a.local", "svc-b.local", "svc-c.local"] {
        let rh = conn.alloc_shared(name, DnsType::Txt, 120);
        conn.set_raw(rh, &data);
    }
    conn.shutdown();
    assert_eq!(conn.a_now.len(), 3);

    // One pass fills one frame; the rest of the queue stays put.
    let pkt = conn.run_output_pass().expect("first frame");
    assert_eq!(pkt.message.answers.len(), 1);
    assert!(pkt.message.encoded_len() < 120);
    assert_eq!(conn.a_now.len(), 2);

    // Driving the scheduler drains the remainder into further frames.
    conn.handle_timeout(conn.now).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 2);
    assert!(pkts.iter().all(|p| p.message.encoded_len() < 120));
    assert!(conn.a_now.is_empty());
}

#[test]
fn test_shutdown_queues_goodbyes() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let shared = conn.alloc_shared("_http._tcp.local", DnsType::Ptr, 120);
    conn.set_host(shared, "web.local");
    let unique = conn.alloc_unique("unique-host.local", DnsType::A, 120);
    conn.set_ip(unique, Ipv4Addr::new(10, 0, 0, 1));
    conn.handle_timeout(t0).unwrap();
    drain(&mut conn);

    conn.shutdown();
    // Every record sits on the immediate queue with a zero ttl.
    assert!(conn.probing.is_empty());
    assert!(conn.a_publish.is_empty());
    assert_eq!(conn.a_now.len(), 2);
    for (_, rec) in conn.records.iter() {
        assert_eq!(rec.answer.ttl, 0);
        assert_eq!(rec.queue, SendQueue::Now);
    }

    // Inbound traffic is ignored now.
    let mut query = DnsMessage::default();
    query.add_question(question("_http._tcp.local", DnsType::Ptr));
    conn.handle_read(inbound(query, src([192, 168, 1, 7], 54321), t0)).unwrap();
    assert!(conn.uanswers.is_empty());

    // The goodbyes drain out and the store empties.
    conn.handle_timeout(t0 + Duration::from_millis(1)).unwrap();
    let pkts = drain(&mut conn);
    assert!(!pkts.is_empty());
    assert!(pkts.iter().flat_map(|p| &p.message.answers).all(|an| an.ttl == 0));
    assert!(conn.records.is_empty());
}

#[test]
fn test_flush_reprobes_and_requeries() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let unique = conn.alloc_unique("unique-host.local", DnsType::A, 120);
    conn.set_ip(unique, Ipv4Addr::new(10, 0, 0, 1));
    let shared = conn.alloc_shared("_http._tcp.local", DnsType::Ptr, 120);
    conn.set_host(shared, "web.local");
    for step in 0..5u32 {
        conn.handle_timeout(t0 + PROBE_INTERVAL * step).unwrap();
        drain(&mut conn);
    }
    assert_eq!(conn.records[unique].unique, UNIQUE_ESTABLISHED);

    let qh = conn.query("host.local", DnsType::A);
    let t1 = t0 + Duration::from_secs(2);
    conn.handle_read(inbound(
        response_with(vec![a_resource("host.local", 120, [10, 0, 0, 9])]),
        src([10, 0, 0, 9], MDNS_PORT),
        t1,
    ))
    .unwrap();
    conn.poll_event();
    assert_eq!(conn.cache.len(), 1);

    conn.flush();

    // The cache is gone and its query heard the goodbye.
    assert!(conn.cache.is_empty());
    assert!(matches!(
        conn.poll_event(),
        Some(MdnsEvent::QueryAnswered(handle, answer)) if handle == qh && answer.ttl == 0
    ));

    // Unique records probe again, shared records republish, queries re-ask.
    assert_eq!(conn.records[unique].unique, 1);
    assert!(conn.probing.contains(&unique));
    assert_eq!(conn.records[shared].queue, SendQueue::Publish);
    assert_eq!(conn.queries[qh].tries, 0);
    assert_eq!(conn.queries[qh].next_try, Some(conn.now));
}

#[test]
fn test_bucket_invariants() {
    let mut conn = new_conn();
    let t0 = conn.now;

    for name in ["a.local", "b.local", "c.local", "Mixed-Case.Local"] {
        conn.alloc_shared(name, DnsType::A, 120);
        conn.query(name, DnsType::A);
    }
    conn.handle_read(inbound(
        response_with(vec![
            a_resource("a.local", 120, [10, 0, 0, 1]),
            a_resource("d.local", 120, [10, 0, 0, 2]),
        ]),
        src([10, 0, 0, 1], MDNS_PORT),
        t0,
    ))
    .unwrap();

    for (idx, bucket) in conn.published.iter().enumerate() {
        for &rh in bucket {
            assert_eq!(small_bucket(&conn.records[rh].answer.name.data), idx);
        }
    }
    for (idx, bucket) in conn.query_buckets.iter().enumerate() {
        for &qh in bucket {
            assert_eq!(small_bucket(&conn.queries[qh].name), idx);
        }
    }
    for (idx, bucket) in conn.cache_buckets.iter().enumerate() {
        for &ch in bucket {
            assert_eq!(large_bucket(&conn.cache[ch].answer.name.data), idx);
        }
    }
}

#[test]
fn test_record_on_at_most_one_queue() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let rh = conn.alloc_shared("svc.local", DnsType::Txt, 120);
    conn.set_raw(rh, b"v=1");
    assert_eq!(conn.records[rh].queue, SendQueue::Publish);

    // Retiring the record moves it, never duplicates it.
    conn.done(rh);
    let on_queues = conn.a_now.iter().chain(conn.a_paused.iter()).chain(conn.a_publish.iter());
    assert_eq!(on_queues.filter(|&&h| h == rh).count(), 1);

    conn.handle_timeout(t0).unwrap();
    drain(&mut conn);
    assert!(conn.records.is_empty());
}

#[test]
fn test_name_hash_folds_case() {
    assert_eq!(name_hash("Printer.Local"), name_hash("printer.local"));
    assert_ne!(name_hash("printer.local"), name_hash("scanner.local"));
}

#[test]
fn test_poll_timeout_priorities() {
    let mut conn = new_conn();
    let t0 = conn.now;

    // Idle: only the periodic cache sweep remains.
    assert_eq!(conn.poll_timeout(), Some(conn.expire_all_at));

    // A fresh query wants an immediate tick.
    conn.query("host.local", DnsType::A);
    assert_eq!(conn.poll_timeout(), Some(t0));

    // Probing outranks the query-retry deadline.
    let rh = conn.alloc_unique("unique-host.local", DnsType::A, 120);
    conn.set_ip(rh, Ipv4Addr::new(10, 0, 0, 1));
    assert_eq!(conn.poll_timeout(), Some(conn.probe_at));

    // Pending unicast replies outrank everything.
    let mut query = DnsMessage::default();
    query.add_question(question("unique-host.local", DnsType::A));
    conn.handle_read(inbound(query, src([10, 0, 0, 2], 40000), t0)).unwrap();
    assert_eq!(conn.uanswers.len(), 1);
    assert_eq!(conn.poll_timeout(), Some(conn.now));
}

#[test]
fn test_multiple_probes_share_a_datagram() {
    let mut conn = new_conn();
    let t0 = conn.now;

    let a = conn.alloc_unique("box.local", DnsType::A, 120);
    conn.set_ip(a, Ipv4Addr::new(10, 0, 0, 1));
    let srv = conn.alloc_unique("_ssh._tcp.box.local", DnsType::Srv, 120);
    conn.set_srv(srv, 0, 0, 22, "box.local");

    conn.handle_timeout(t0).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].message.questions.len(), 2);
    assert_eq!(pkts[0].message.authorities.len(), 2);

    for step in 1..4u32 {
        conn.handle_timeout(t0 + PROBE_INTERVAL * step).unwrap();
        drain(&mut conn);
    }
    conn.handle_timeout(t0 + PROBE_INTERVAL * 4).unwrap();
    let pkts = drain(&mut conn);
    assert_eq!(pkts.len(), 1);
    assert_eq!(pkts[0].message.answers.len(), 2);
    assert!(pkts[0].message.answers.iter().all(|an| an.class.cache_flush()));
}

#[test]
fn test_close_refuses_io() {
    let mut conn = new_conn();
    let t0 = conn.now;
    conn.query("host.local", DnsType::A);

    conn.close().unwrap();
    assert_eq!(conn.pending_query_count(), 0);
    assert!(conn.poll_timeout().is_none());
    assert!(conn.poll_write().is_none());
    assert!(conn.poll_event().is_none());

    let msg = DnsMessage::default();
    assert_eq!(
        conn.handle_read(inbound(msg, src([10, 0, 0, 1], MDNS_PORT), t0)),
        Err(Error::ErrConnectionClosed)
    );
    assert_eq!(conn.handle_timeout(t0), Err(Error::ErrConnectionClosed));
}
