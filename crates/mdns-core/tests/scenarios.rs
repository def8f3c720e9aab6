//! End-to-end protocol scenarios, driven on a virtual clock: the
//! engine performs no I/O and takes explicit `now` values, so every
//! timer fires exactly when the test says time has passed.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::SeedableRng;

use mdns_core::entry::ServiceSpec;
use mdns_core::event::*;
use mdns_core::server::{Server, ServerConfig};
use mdns_types::protocol::types::test_util::*;
use mdns_types::protocol::types::*;
use mdns_types::txt::TxtList;

const IFACE: IfIndex = IfIndex(1);
const OUR_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
const PEER_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77));

struct Harness {
    server: Server,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        let config = ServerConfig {
            host_name: "mybox".to_string(),
            ..ServerConfig::default()
        };
        let mut server = Server::with_rng(config, SmallRng::seed_from_u64(7)).unwrap();
        let start = Instant::now();
        server
            .interface_added(IFACE, Protocol::V4, OUR_ADDR, start)
            .unwrap();
        Self { server, now: start }
    }

    /// Step the clock forward, firing every timer at its own
    /// deadline.
    fn advance_to(&mut self, target: Instant) {
        while let Some(deadline) = self.server.next_timeout() {
            if deadline > target {
                break;
            }
            self.server.handle_timeout(deadline);
        }
        self.now = target;
    }

    fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        self.advance_to(target);
    }

    /// Let the host-group probe/announce cycle finish and throw its
    /// traffic away.
    fn settle(&mut self) {
        self.advance(Duration::from_secs(3));
        self.transmits();
        self.events();
    }

    fn transmits(&mut self) -> Vec<Transmit> {
        let mut out = Vec::new();
        while let Some(t) = self.server.poll_transmit() {
            out.push(t);
        }
        out
    }

    fn events(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Some(e) = self.server.poll_event() {
            out.push(e);
        }
        out
    }

    fn recv(&mut self, message: &Message, src: SocketAddr) {
        let octets = message.to_octets().unwrap();
        self.server
            .handle_packet(IFACE, Protocol::V4, src, &octets, self.now);
    }

    fn recv_from_peer(&mut self, message: &Message) {
        self.recv(message, SocketAddr::new(PEER_ADDR, MDNS_PORT));
    }
}

fn parse(transmits: &[Transmit]) -> Vec<Message> {
    transmits
        .iter()
        .map(|t| Message::from_octets(&t.octets).unwrap())
        .collect()
}

fn peer_response(answers: Vec<ResourceRecord>) -> Message {
    let mut message = Message::response(0);
    message.answers = answers;
    message
}

// ---------------------------------------------------------------------
// spec scenarios

/// Commit a group with one A record and leave the link silent: three
/// probes 250ms apart, establishment at 750ms, announcements at 750ms
/// and 1750ms with the cache-flush bit.
#[test]
fn successful_announce() {
    let mut h = Harness::new();
    h.settle();

    let group = h.server.entry_group_new().unwrap();
    h.server
        .entry_group_add_record(
            group,
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
    let t0 = h.now;
    h.server.entry_group_commit(group, t0).unwrap();

    // probe 1 at once
    h.advance_to(t0);
    let probes = parse(&h.transmits());
    assert_eq!(1, probes.len());
    assert!(!probes[0].header.is_response);
    assert_eq!(1, probes[0].questions.len());
    assert_eq!(QueryType::Wildcard, probes[0].questions[0].qtype);
    assert_eq!(domain("foo.local."), probes[0].questions[0].name);
    assert_eq!(1, probes[0].authority.len());

    // nothing between the probes
    h.advance(Duration::from_millis(249));
    assert!(h.transmits().is_empty());

    // probes 2 and 3 at 250 and 500
    h.advance_to(t0 + Duration::from_millis(250));
    assert_eq!(1, h.transmits().len());
    h.advance_to(t0 + Duration::from_millis(500));
    assert_eq!(1, h.transmits().len());

    // established at 750, with the first announcement
    h.advance_to(t0 + Duration::from_millis(749));
    assert!(h.transmits().is_empty());
    assert!(h.events().is_empty());

    h.advance_to(t0 + Duration::from_millis(750));
    let events = h.events();
    assert!(events.contains(&ServerEvent::EntryGroup {
        group,
        state: EntryGroupState::Established,
    }));
    let announces = parse(&h.transmits());
    assert_eq!(1, announces.len());
    assert!(announces[0].header.is_response);
    assert_eq!(1, announces[0].answers.len());
    assert!(announces[0].answers[0].cache_flush);
    assert_eq!(120, announces[0].answers[0].ttl);

    // the second announcement a second later, then silence
    h.advance_to(t0 + Duration::from_millis(1750));
    let announces = parse(&h.transmits());
    assert_eq!(1, announces.len());
    assert!(announces[0].header.is_response);

    h.advance(Duration::from_secs(5));
    assert!(h.transmits().is_empty());
}

/// A peer's probe asserts `foo.local -> 10.0.0.7` while we probe for
/// `10.0.0.5`: `00 00 00 07` outranks `00 00 00 05`, so we lose, the
/// group reports `Collision`, and nothing is announced.
#[test]
fn probe_conflict_yields_to_lexicographic_winner() {
    let mut h = Harness::new();
    h.settle();

    let group = h.server.entry_group_new().unwrap();
    h.server
        .entry_group_add_record(
            group,
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
    let t0 = h.now;
    h.server.entry_group_commit(group, t0).unwrap();
    h.advance_to(t0);
    h.transmits();

    // the peer's simultaneous probe
    let mut peer_probe = Message::query();
    peer_probe
        .questions
        .push(Question::new(domain("foo.local."), QueryType::Wildcard));
    peer_probe
        .authority
        .push(a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 7)));
    h.recv_from_peer(&peer_probe);

    let events = h.events();
    assert!(events.contains(&ServerEvent::EntryGroup {
        group,
        state: EntryGroupState::Collision,
    }));
    assert_eq!(
        EntryGroupState::Collision,
        h.server.entry_group_state(group).unwrap()
    );

    // no further probes, no announcements
    h.advance(Duration::from_secs(3));
    assert!(h.transmits().is_empty());
}

/// The reverse outcome: our payload outranks the peer's, so we keep
/// probing and establish on schedule.
#[test]
fn probe_conflict_won_keeps_registering() {
    let mut h = Harness::new();
    h.settle();

    let group = h.server.entry_group_new().unwrap();
    h.server
        .entry_group_add_record(
            group,
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
    let t0 = h.now;
    h.server.entry_group_commit(group, t0).unwrap();
    h.advance_to(t0);
    h.transmits();

    let mut peer_probe = Message::query();
    peer_probe
        .questions
        .push(Question::new(domain("foo.local."), QueryType::Wildcard));
    peer_probe
        .authority
        .push(a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 3)));
    h.recv_from_peer(&peer_probe);

    h.advance_to(t0 + Duration::from_millis(750));
    let events = h.events();
    assert!(events.contains(&ServerEvent::EntryGroup {
        group,
        state: EntryGroupState::Established,
    }));
}

/// A query whose known-answer section already holds our PTR with 80
/// of 120 seconds remaining is not answered; once the known answer's
/// lifetime falls under half, it is.
#[test]
fn known_answer_suppression() {
    let mut h = Harness::new();
    h.settle();

    let group = h.server.entry_group_new().unwrap();
    h.server
        .entry_group_add_record(
            group,
            ptr_record("_http._tcp.local.", "web._http._tcp.local."),
            false,
            None,
            None,
        )
        .unwrap();
    h.server.entry_group_commit(group, h.now).unwrap();
    h.advance(Duration::from_secs(3));
    h.transmits();
    h.events();

    // known answer with 80s remaining: suppressed
    let mut query = Message::query();
    query.questions.push(Question::new(
        domain("_http._tcp.local."),
        QueryType::Record(RecordType::PTR),
    ));
    let mut known = ptr_record("_http._tcp.local.", "web._http._tcp.local.");
    known.ttl = 80;
    query.answers.push(known);
    h.recv_from_peer(&query);

    h.advance(Duration::from_millis(200));
    assert!(h.transmits().is_empty());

    // known answer with 50s remaining: below half, answered
    let mut query = Message::query();
    query.questions.push(Question::new(
        domain("_http._tcp.local."),
        QueryType::Record(RecordType::PTR),
    ));
    let mut known = ptr_record("_http._tcp.local.", "web._http._tcp.local.");
    known.ttl = 50;
    query.answers.push(known);
    h.recv_from_peer(&query);

    h.advance(Duration::from_millis(200));
    let responses = parse(&h.transmits());
    assert_eq!(1, responses.len());
    assert_eq!(1, responses[0].answers.len());
    assert_eq!(
        domain("_http._tcp.local."),
        responses[0].answers[0].name
    );
}

/// A peer multicasts our own pending question just before our
/// departure: the departure is skipped; the next one, past the
/// one-second window, goes out.
#[test]
fn duplicate_question_suppression() {
    let mut h = Harness::new();
    h.settle();

    let pattern = KeyPattern::new(
        domain("_printer._tcp.local."),
        QueryType::Record(RecordType::PTR),
    );
    let browser = h
        .server
        .record_browser_new(pattern.clone(), None, None, h.now)
        .unwrap();

    // the peer asks the same question before our initial departure
    // fires
    let mut peer_query = Message::query();
    peer_query.questions.push(pattern.to_question(false));
    h.recv_from_peer(&peer_query);

    h.advance(Duration::from_millis(200));
    let queries: Vec<Message> = parse(&h.transmits())
        .into_iter()
        .filter(|m| !m.header.is_response)
        .collect();
    assert!(queries.is_empty());

    // the re-query one second later is not suppressed
    h.advance(Duration::from_millis(1500));
    let queries: Vec<Message> = parse(&h.transmits())
        .into_iter()
        .filter(|m| !m.header.is_response)
        .collect();
    assert_eq!(1, queries.len());
    assert_eq!(domain("_printer._tcp.local."), queries[0].questions[0].name);

    h.server.browser_free(browser);
}

/// A goodbye (TTL 0) for a cached record produces exactly one REMOVE
/// within a second, and nothing after.
#[test]
fn goodbye_emits_one_remove() {
    let mut h = Harness::new();
    h.settle();

    let pattern = KeyPattern::new(
        domain("_http._tcp.local."),
        QueryType::Record(RecordType::PTR),
    );
    let browser = h
        .server
        .record_browser_new(pattern, None, None, h.now)
        .unwrap();
    h.advance(Duration::from_millis(10));
    h.transmits();
    h.events();

    let rr = ptr_record("_http._tcp.local.", "web._http._tcp.local.");
    h.recv_from_peer(&peer_response(vec![rr.clone()]));

    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Browser {
            browser: b,
            event: BrowserEvent::New(BrowserItem::Record(r)),
            ..
        } if *b == browser && r.same_identity(&rr)
    )));

    // the goodbye
    let mut goodbye = rr.clone();
    goodbye.ttl = 0;
    h.recv_from_peer(&peer_response(vec![goodbye]));

    // no REMOVE before the one-second grace
    let early: usize = h
        .events()
        .iter()
        .filter(|e| {
            matches!(
                e,
                ServerEvent::Browser {
                    event: BrowserEvent::Remove(_),
                    ..
                }
            )
        })
        .count();
    assert_eq!(0, early);

    h.advance(Duration::from_millis(1100));
    let removes: usize = h
        .events()
        .iter()
        .filter(|e| {
            matches!(
                e,
                ServerEvent::Browser {
                    event: BrowserEvent::Remove(_),
                    ..
                }
            )
        })
        .count();
    assert_eq!(1, removes);

    // and never again
    h.advance(Duration::from_secs(10));
    assert!(h.events().iter().all(|e| !matches!(
        e,
        ServerEvent::Browser {
            event: BrowserEvent::Remove(_),
            ..
        }
    )));

    h.server.browser_free(browser);
}

/// A query from a source port other than 5353 gets a unicast reply
/// with the query id and question echoed, TTLs capped at 10, and no
/// cache-flush bit.
#[test]
fn legacy_unicast_reply() {
    let mut h = Harness::new();
    h.settle();

    let group = h.server.entry_group_new().unwrap();
    h.server
        .entry_group_add_record(
            group,
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
    h.server.entry_group_commit(group, h.now).unwrap();
    h.advance(Duration::from_secs(3));
    h.transmits();
    h.events();

    let legacy_src = SocketAddr::new(PEER_ADDR, 9999);
    let mut query = Message::query();
    query.header.id = 0x4242;
    query.questions.push(Question::new(
        domain("foo.local."),
        QueryType::Record(RecordType::A),
    ));
    h.recv(&query, legacy_src);

    let transmits = h.transmits();
    assert_eq!(1, transmits.len());
    assert_eq!(Some(legacy_src), transmits[0].dest);

    let reply = Message::from_octets(&transmits[0].octets).unwrap();
    assert_eq!(0x4242, reply.header.id);
    assert!(reply.header.is_response);
    assert_eq!(1, reply.questions.len());
    assert_eq!(domain("foo.local."), reply.questions[0].name);
    assert_eq!(1, reply.answers.len());
    assert!(reply.answers[0].ttl <= 10);
    assert!(!reply.answers[0].cache_flush);
}

// ---------------------------------------------------------------------
// browsing and resolving

/// A browser seeds from the cache, reports new arrivals, and flags
/// the all-for-now point about a second in.
#[test]
fn browser_lifecycle() {
    let mut h = Harness::new();
    h.settle();

    // something is already in the cache before the browser starts
    let existing = ptr_record("_http._tcp.local.", "old._http._tcp.local.");
    h.recv_from_peer(&peer_response(vec![existing.clone()]));

    let t0 = h.now;
    let browser = h
        .server
        .service_browser_new("_http._tcp", None, None, None, t0)
        .unwrap();

    // the seed is delivered synchronously
    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Browser {
            browser: b,
            event: BrowserEvent::New(BrowserItem::Service { name, .. }),
            ..
        } if *b == browser && name == "old"
    )));

    // the first query departure drains the cache view
    h.advance_to(t0);
    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Browser {
            browser: b,
            event: BrowserEvent::CacheExhausted,
            ..
        } if *b == browser
    )));

    // a peer answers with a new instance
    let fresh = ptr_record("_http._tcp.local.", "new._http._tcp.local.");
    h.recv_from_peer(&peer_response(vec![fresh]));
    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Browser {
            event: BrowserEvent::New(BrowserItem::Service { name, .. }),
            ..
        } if name == "new"
    )));

    // a refresh of the same instance is not re-reported
    let refresh = ptr_record("_http._tcp.local.", "new._http._tcp.local.");
    h.recv_from_peer(&peer_response(vec![refresh]));
    assert!(h.events().is_empty());

    // all-for-now at about a second
    h.advance(Duration::from_millis(1100));
    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::Browser {
            browser: b,
            event: BrowserEvent::AllForNow,
            scope: None,
        } if *b == browser
    )));

    // freeing guarantees silence
    h.server.browser_free(browser);
    h.advance(Duration::from_secs(5));
    assert!(h.events().is_empty());
}

/// A service resolver assembles SRV + TXT + A into one FOUND event.
#[test]
fn service_resolver_found() {
    let mut h = Harness::new();
    h.settle();

    let resolver = h
        .server
        .service_resolver_new("Web", "_http._tcp", None, None, None, h.now)
        .unwrap();
    h.advance(Duration::from_millis(10));
    h.transmits();

    let mut txt = TxtList::new();
    txt.push_pair("path", b"/index.html").unwrap();
    let mut txt_rr = txt_record("Web._http._tcp.local.", &[]);
    txt_rr.data = RecordData::TXT { strings: txt };

    h.recv_from_peer(&peer_response(vec![
        srv_record("Web._http._tcp.local.", 8080, "peerbox.local."),
        txt_rr,
        a_record("peerbox.local.", Ipv4Addr::new(192, 168, 1, 77)),
    ]));

    let events = h.events();
    let found = events.iter().find_map(|e| match e {
        ServerEvent::Resolver {
            resolver: r,
            event: ResolverEvent::ServiceFound(service),
        } if *r == resolver => Some(service.clone()),
        _ => None,
    });
    let service = found.expect("no ServiceFound event");
    assert_eq!("Web", service.name);
    assert_eq!("_http._tcp", service.service_type);
    assert_eq!(domain("peerbox.local."), service.host);
    assert_eq!(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77)), service.address);
    assert_eq!(8080, service.port);
    assert_eq!(Some(&b"/index.html"[..]), service.txt.lookup("path"));

    // no timeout after a successful resolution
    h.advance(Duration::from_secs(2));
    assert!(!h
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::Resolver { event: ResolverEvent::Timeout, .. })));

    h.server.resolver_free(resolver);
}

/// A resolver that hears nothing reports a timeout after about a
/// second.
#[test]
fn service_resolver_timeout() {
    let mut h = Harness::new();
    h.settle();

    let resolver = h
        .server
        .service_resolver_new("Ghost", "_http._tcp", None, None, None, h.now)
        .unwrap();

    h.advance(Duration::from_millis(900));
    assert!(h.events().is_empty());

    h.advance(Duration::from_millis(200));
    let events = h.events();
    assert!(events.contains(&ServerEvent::Resolver {
        resolver,
        event: ResolverEvent::Timeout,
    }));
}

/// Publishing a service makes it answerable: a PTR query for the type
/// returns the pointer plus nothing the querier already knows.
#[test]
fn published_service_answers_queries() {
    let mut h = Harness::new();
    h.settle();

    let group = h.server.entry_group_new().unwrap();
    let spec = ServiceSpec {
        name: "Files".to_string(),
        service_type: "_smb._tcp".to_string(),
        domain: None,
        host: None,
        port: 445,
        txt: TxtList::new(),
    };
    h.server.entry_group_add_service(group, &spec).unwrap();
    h.server.entry_group_commit(group, h.now).unwrap();
    h.advance(Duration::from_secs(3));
    h.transmits();
    h.events();

    let mut query = Message::query();
    query.questions.push(Question::new(
        domain("_smb._tcp.local."),
        QueryType::Record(RecordType::PTR),
    ));
    h.recv_from_peer(&query);

    h.advance(Duration::from_millis(200));
    let responses = parse(&h.transmits());
    assert_eq!(1, responses.len());
    let ptr = &responses[0].answers[0];
    assert_eq!(domain("_smb._tcp.local."), ptr.name);
    match &ptr.data {
        RecordData::PTR { ptrdname } => {
            assert_eq!(domain("Files._smb._tcp.local."), *ptrdname);
        }
        other => panic!("unexpected data {other:?}"),
    }
}

/// A conflicting assertion against our established host name renames
/// the host and re-probes.
#[test]
fn host_name_collision_renames() {
    let mut h = Harness::new();
    h.settle();
    assert_eq!("mybox.local.", h.server.host_name().to_dotted_string());

    let mut conflict = a_record("mybox.local.", Ipv4Addr::new(10, 9, 9, 9));
    conflict.cache_flush = true;
    h.recv_from_peer(&peer_response(vec![conflict]));

    let events = h.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::HostNameChanged { name } if name.to_dotted_string() == "mybox-2.local."
    )));
    assert_eq!("mybox-2.local.", h.server.host_name().to_dotted_string());

    // the renamed records go through a fresh probe cycle
    h.advance_to(h.now);
    let probes = parse(&h.transmits());
    assert!(probes
        .iter()
        .any(|m| !m.header.is_response
            && m.questions.iter().any(|q| q.name == domain("mybox-2.local."))));
}

/// The same record on two interfaces browses independently: NEW is
/// reported once per interface.
#[test]
fn per_interface_browse_events() {
    let mut h = Harness::new();
    h.server
        .interface_added(
            IfIndex(2),
            Protocol::V4,
            IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1)),
            h.now,
        )
        .unwrap();
    h.settle();

    let pattern = KeyPattern::new(
        domain("_http._tcp.local."),
        QueryType::Record(RecordType::PTR),
    );
    let browser = h
        .server
        .record_browser_new(pattern, None, None, h.now)
        .unwrap();
    h.advance(Duration::from_millis(10));
    h.events();

    let rr = ptr_record("_http._tcp.local.", "web._http._tcp.local.");
    let octets = peer_response(vec![rr.clone()]).to_octets().unwrap();
    let src = SocketAddr::new(PEER_ADDR, MDNS_PORT);
    h.server
        .handle_packet(IfIndex(1), Protocol::V4, src, &octets, h.now);
    h.server
        .handle_packet(IfIndex(2), Protocol::V4, src, &octets, h.now);

    let news: Vec<(IfIndex, Protocol)> = h
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::Browser {
                browser: b,
                scope: Some(scope),
                event: BrowserEvent::New(_),
            } if b == browser => Some(scope),
            _ => None,
        })
        .collect();
    assert_eq!(2, news.len());
    assert!(news.contains(&(IfIndex(1), Protocol::V4)));
    assert!(news.contains(&(IfIndex(2), Protocol::V4)));
}

/// Packets from our own address are ignored entirely.
#[test]
fn own_packets_are_ignored() {
    let mut h = Harness::new();
    h.settle();

    let pattern = KeyPattern::new(
        domain("_http._tcp.local."),
        QueryType::Record(RecordType::PTR),
    );
    let browser = h
        .server
        .record_browser_new(pattern, None, None, h.now)
        .unwrap();
    h.advance(Duration::from_millis(10));
    h.events();

    let rr = ptr_record("_http._tcp.local.", "web._http._tcp.local.");
    h.recv(
        &peer_response(vec![rr]),
        SocketAddr::new(OUR_ADDR, MDNS_PORT),
    );
    assert!(h.events().is_empty());

    h.server.browser_free(browser);
}
