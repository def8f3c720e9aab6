//! The server shell: owns the interfaces, the shared time-event
//! queue, the entry groups, the browsers and resolvers, routes
//! incoming packets to per-interface state, and exposes the sans-IO
//! poll surface the embedding event loop drives.

use rand::rngs::SmallRng;
use rand::SeedableRng;
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use mdns_types::error::Error;
use mdns_types::names;
use mdns_types::names::DomainBrowserKind;
use mdns_types::protocol::types::*;

use crate::browse::{BrowserKind, BrowserOwner, RecordBrowser};
use crate::cache::{CacheDelta, RecordCache};
use crate::entry::{
    ConflictVerdict, EntryGroup, ServiceSpec, ANNOUNCE_COUNT, ANNOUNCE_INTERVAL, PROBE_COUNT,
    PROBE_INTERVAL,
};
use crate::event::*;
use crate::query::QueryScheduler;
use crate::resolve::{Resolver, ResolverAction, ResolverKind};
use crate::respond::{self, ResponseDest, ResponseScheduler};
use crate::timeq::TimeEventQueue;

/// UDP payload budget per interface family: Ethernet MTU minus the
/// IP and UDP headers.
const BUDGET_V4: usize = 1500 - 20 - 8;
const BUDGET_V6: usize = 1500 - 40 - 8;

/// The timer tokens flowing through the shared queue.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum Timeout {
    CacheEntry {
        iface: IfIndex,
        proto: Protocol,
        entry: usize,
    },
    QueryJob {
        iface: IfIndex,
        proto: Protocol,
        job: usize,
    },
    QueryFollowUp {
        iface: IfIndex,
        proto: Protocol,
        job: usize,
    },
    ResponseJob {
        iface: IfIndex,
        proto: Protocol,
        job: usize,
    },
    GroupStep {
        group: usize,
    },
    BrowserAllForNow {
        browser: usize,
    },
    ResolverTimeout {
        resolver: usize,
    },
}

/// Tunables of a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The machine's name: a single label, no dots.
    pub host_name: String,

    /// The domain to publish under and browse in.
    pub domain: String,

    /// TTL for published service records.
    pub record_ttl: u32,

    /// TTL for published address records.
    pub host_ttl: u32,

    /// How long resolvers wait for a complete answer.
    pub resolver_timeout: Duration,

    /// How long after a browser starts it declares "all for now".
    pub browse_window: Duration,

    /// Cap on simultaneously live browsers plus resolvers.
    pub max_objects: usize,

    /// Cap on simultaneously live entry groups.
    pub max_entry_groups: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_name: "announced".to_string(),
            domain: "local".to_string(),
            record_ttl: DEFAULT_TTL,
            host_ttl: DEFAULT_TTL_HOST_NAME,
            resolver_timeout: Duration::from_secs(1),
            browse_window: Duration::from_secs(1),
            max_objects: 1024,
            max_entry_groups: 256,
        }
    }
}

/// The per-interface, per-family machinery.
#[derive(Debug)]
struct Interface {
    addr: IpAddr,
    budget: usize,
    cache: RecordCache,
    queries: QueryScheduler,
    responses: ResponseScheduler,
}

/// The protocol engine.  Performs no I/O: see the crate docs for the
/// driving contract.
pub struct Server {
    config: ServerConfig,
    host_name: DomainName,
    domain: DomainName,

    interfaces: HashMap<(IfIndex, Protocol), Interface>,
    timeq: TimeEventQueue<Timeout>,
    groups: Slab<EntryGroup>,
    browsers: Slab<RecordBrowser>,
    resolvers: Slab<Resolver>,

    /// The implicit group carrying our address and reverse-pointer
    /// records.
    host_group: usize,

    events: VecDeque<ServerEvent>,
    transmits: VecDeque<Transmit>,
    rng: SmallRng,
    next_generation: u64,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        Self::with_rng(config, SmallRng::from_entropy())
    }

    /// Like `new` with a caller-supplied RNG; tests use a seeded one
    /// so jitter is reproducible.
    pub fn with_rng(config: ServerConfig, rng: SmallRng) -> Result<Self, Error> {
        if !names::is_valid_host_name(&config.host_name) {
            return Err(Error::InvalidHostName);
        }
        let domain =
            DomainName::from_dotted_string(&config.domain).ok_or(Error::InvalidDomainName)?;
        let host_name = fqdn(&config.host_name, &domain)?;

        let mut groups = Slab::new();
        let host_group = groups.insert(EntryGroup::new(0, true));

        Ok(Self {
            config,
            host_name,
            domain,
            interfaces: HashMap::new(),
            timeq: TimeEventQueue::new(),
            groups,
            browsers: Slab::new(),
            resolvers: Slab::new(),
            host_group,
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            rng,
            next_generation: 1,
        })
    }

    /// The fully qualified name this host answers for.
    pub fn host_name(&self) -> &DomainName {
        &self.host_name
    }

    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    // ------------------------------------------------------------------
    // the poll surface

    /// The deadline the event loop should sleep until.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timeq.next_deadline()
    }

    /// Fire every timer due at or before `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(token) = self.timeq.pop_due(now) {
            self.dispatch(token, now);
        }
    }

    /// Next outbound datagram, if any.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next subscriber event, if any.
    pub fn poll_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    /// Feed one received datagram into the engine.
    pub fn handle_packet(
        &mut self,
        iface: IfIndex,
        proto: Protocol,
        src: SocketAddr,
        octets: &[u8],
        now: Instant,
    ) {
        let Some(ifs) = self.interfaces.get(&(iface, proto)) else {
            tracing::debug!(%iface, %proto, "packet on unknown interface, dropping");
            return;
        };
        if src.ip() == ifs.addr {
            // our own multicast, reflected back
            return;
        }

        let message = match Message::from_octets_lenient(octets) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%iface, %proto, ?src, ?error, "malformed packet, dropping");
                return;
            }
        };

        // RFC 6762 section 18: silently ignore messages with an
        // opcode or rcode other than zero
        if message.header.opcode != Opcode::Standard || message.header.rcode != Rcode::NoError {
            tracing::debug!(%iface, %proto, ?src, "non-standard opcode/rcode, dropping");
            return;
        }

        if message.header.is_response {
            self.handle_response_packet(iface, proto, src, &message, now);
        } else {
            self.handle_query_packet(iface, proto, src, &message, now);
        }
    }

    // ------------------------------------------------------------------
    // interfaces

    /// The interface monitor reports a usable link.
    pub fn interface_added(
        &mut self,
        iface: IfIndex,
        proto: Protocol,
        addr: IpAddr,
        now: Instant,
    ) -> Result<(), Error> {
        if Protocol::of(addr) != proto {
            return Err(Error::InvalidAddress);
        }
        if self.interfaces.contains_key(&(iface, proto)) {
            return Err(Error::InvalidInterface);
        }

        tracing::info!(%iface, %proto, %addr, "interface added");
        self.interfaces.insert(
            (iface, proto),
            Interface {
                addr,
                budget: match proto {
                    Protocol::V4 => BUDGET_V4,
                    Protocol::V6 => BUDGET_V6,
                },
                cache: RecordCache::new(iface, proto),
                queries: QueryScheduler::new(iface, proto),
                responses: ResponseScheduler::new(iface, proto),
            },
        );

        // open the standing query jobs of existing browsers here too
        let browser_indices: Vec<usize> = self.browsers.iter().map(|(i, _)| i).collect();
        for index in browser_indices {
            let pattern = self.browsers[index].pattern.clone();
            let in_scope = {
                let browser = &self.browsers[index];
                browser.iface.map_or(true, |i| i == iface)
                    && browser.proto.map_or(true, |p| p == proto)
            };
            if in_scope {
                let ifs = self.interfaces.get_mut(&(iface, proto)).unwrap();
                let job = ifs.queries.add_job(&pattern, false, now, &mut self.timeq);
                self.browsers[index].query_jobs.push((iface, proto, job));
            }
        }

        // our address records change: re-register the host group
        self.rebuild_host_group(now);

        // established groups re-announce on a link change
        let group_indices: Vec<usize> = self
            .groups
            .iter()
            .filter(|(index, group)| {
                *index != self.host_group && group.state() == EntryGroupState::Established
            })
            .map(|(index, _)| index)
            .collect();
        for index in group_indices {
            self.restart_announcing(index, now);
        }

        Ok(())
    }

    /// The interface monitor reports a link gone.
    pub fn interface_removed(&mut self, iface: IfIndex, proto: Protocol, now: Instant) {
        let Some(mut ifs) = self.interfaces.remove(&(iface, proto)) else {
            return;
        };
        tracing::info!(%iface, %proto, "interface removed");

        let deltas = ifs.cache.clear(now, &mut self.timeq);
        ifs.queries.clear(&mut self.timeq);
        ifs.responses.clear(&mut self.timeq);
        for (_, browser) in &mut self.browsers {
            browser
                .query_jobs
                .retain(|(i, p, _)| !(*i == iface && *p == proto));
        }
        self.route_deltas(iface, proto, deltas, now);

        self.rebuild_host_group(now);
    }

    // ------------------------------------------------------------------
    // entry groups

    pub fn entry_group_new(&mut self) -> Result<EntryGroupId, Error> {
        if self.groups.len() >= self.config.max_entry_groups {
            return Err(Error::TooManyObjects);
        }
        let generation = self.bump_generation();
        let index = self.groups.insert(EntryGroup::new(generation, false));
        Ok(EntryGroupId { index, generation })
    }

    pub fn entry_group_state(&self, id: EntryGroupId) -> Result<EntryGroupState, Error> {
        self.group_ref(id).map(EntryGroup::state)
    }

    pub fn entry_group_add_record(
        &mut self,
        id: EntryGroupId,
        record: ResourceRecord,
        unique: bool,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
    ) -> Result<(), Error> {
        self.group_mut(id)?.add_record(record, unique, iface, proto)
    }

    /// Register a DNS-SD service in a group.
    pub fn entry_group_add_service(
        &mut self,
        id: EntryGroupId,
        spec: &ServiceSpec,
    ) -> Result<(), Error> {
        let default_domain = self.config.domain.clone();
        let default_host = self.host_name.clone();
        let ttl = self.config.record_ttl;
        self.group_mut(id)?
            .add_service(spec, &default_domain, &default_host, ttl)
    }

    /// Start probing the group's records.
    pub fn entry_group_commit(&mut self, id: EntryGroupId, now: Instant) -> Result<(), Error> {
        let index = id.index;
        let group = self.group_mut(id)?;
        if group.state() != EntryGroupState::Uncommitted {
            return Err(Error::BadState);
        }
        self.commit_group(index, now);
        Ok(())
    }

    /// Withdraw the group's records and return it to `Uncommitted`,
    /// empty.
    pub fn entry_group_reset(&mut self, id: EntryGroupId, now: Instant) -> Result<(), Error> {
        let index = id.index;
        self.group_mut(id)?;
        self.withdraw_group(index, now);
        let group = &mut self.groups[index];
        group.entries.clear();
        group.state = EntryGroupState::Uncommitted;
        group.step = 0;
        Ok(())
    }

    /// Withdraw and destroy the group.  No further events for it will
    /// be seen.
    pub fn entry_group_free(&mut self, id: EntryGroupId, now: Instant) {
        if self.group_mut(id).is_err() {
            return;
        }
        self.withdraw_group(id.index, now);
        self.groups.remove(id.index);
        self.events.retain(|event| event.entry_group() != Some(id));
    }

    // ------------------------------------------------------------------
    // browsers

    /// Watch the link for records matching a pattern.
    pub fn record_browser_new(
        &mut self,
        pattern: KeyPattern,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        now: Instant,
    ) -> Result<BrowserId, Error> {
        self.check_object_cap()?;
        let (index, outputs) =
            self.create_browser(pattern, iface, proto, BrowserKind::Records, BrowserOwner::User, now);
        self.route_outputs(index, outputs, now);
        Ok(self.browser_id(index))
    }

    /// Browse for instances of a service type, e.g. `"_ipp._tcp"`.
    pub fn service_browser_new(
        &mut self,
        service_type: &str,
        domain: Option<&str>,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        now: Instant,
    ) -> Result<BrowserId, Error> {
        self.check_object_cap()?;
        let domain_str = domain.unwrap_or(&self.config.domain).to_string();
        let type_name = names::service_type_name(service_type, &domain_str)?;
        let domain_name =
            DomainName::from_dotted_string(&domain_str).ok_or(Error::InvalidDomainName)?;

        let pattern = KeyPattern::new(type_name, QueryType::Record(RecordType::PTR));
        let kind = BrowserKind::Service {
            service_type: service_type.to_string(),
            domain: domain_name,
        };
        let (index, outputs) =
            self.create_browser(pattern, iface, proto, kind, BrowserOwner::User, now);
        self.route_outputs(index, outputs, now);
        Ok(self.browser_id(index))
    }

    /// Browse for the service types present on the link.
    pub fn service_type_browser_new(
        &mut self,
        domain: Option<&str>,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        now: Instant,
    ) -> Result<BrowserId, Error> {
        self.check_object_cap()?;
        let domain_str = domain.unwrap_or(&self.config.domain).to_string();
        let name = names::service_type_enumeration_name(&domain_str)?;
        let domain_name =
            DomainName::from_dotted_string(&domain_str).ok_or(Error::InvalidDomainName)?;

        let pattern = KeyPattern::new(name, QueryType::Record(RecordType::PTR));
        let kind = BrowserKind::ServiceType {
            domain: domain_name,
        };
        let (index, outputs) =
            self.create_browser(pattern, iface, proto, kind, BrowserOwner::User, now);
        self.route_outputs(index, outputs, now);
        Ok(self.browser_id(index))
    }

    /// Browse for browsing/registering domains advertised on the
    /// link.
    pub fn domain_browser_new(
        &mut self,
        kind: DomainBrowserKind,
        domain: Option<&str>,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        now: Instant,
    ) -> Result<BrowserId, Error> {
        self.check_object_cap()?;
        let domain_str = domain.unwrap_or(&self.config.domain);
        let name = names::domain_enumeration_name(kind, domain_str)?;

        let pattern = KeyPattern::new(name, QueryType::Record(RecordType::PTR));
        let (index, outputs) =
            self.create_browser(pattern, iface, proto, BrowserKind::Domain, BrowserOwner::User, now);
        self.route_outputs(index, outputs, now);
        Ok(self.browser_id(index))
    }

    /// Clear a browser's memory and re-deliver everything the cache
    /// holds, without restarting its query schedule.
    pub fn browser_restart(&mut self, id: BrowserId, now: Instant) -> Result<(), Error> {
        self.browser_check(id)?;
        self.restart_browser(id.index, now);
        Ok(())
    }

    /// Destroy a browser.  No further events for it will be seen.
    pub fn browser_free(&mut self, id: BrowserId) {
        if self.browser_check(id).is_err() {
            return;
        }
        self.free_browser(id.index);
        self.events.retain(|event| event.browser() != Some(id));
    }

    // ------------------------------------------------------------------
    // resolvers

    /// Resolve a service instance to host, port, address, and TXT
    /// data.
    pub fn service_resolver_new(
        &mut self,
        name: &str,
        service_type: &str,
        domain: Option<&str>,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        now: Instant,
    ) -> Result<ResolverId, Error> {
        self.check_object_cap()?;
        let domain_str = domain.unwrap_or(&self.config.domain).to_string();
        let service_name = names::service_name(name, service_type, &domain_str)?;
        let domain_name =
            DomainName::from_dotted_string(&domain_str).ok_or(Error::InvalidDomainName)?;

        let generation = self.bump_generation();
        let resolver = self.resolvers.insert(Resolver::new(
            generation,
            ResolverKind::Service {
                name: name.to_string(),
                service_type: service_type.to_string(),
                domain: domain_name,
                srv_browser: 0,
                txt_browser: 0,
                address_browsers: Vec::new(),
                srv: None,
                txt: None,
                address: None,
            },
        ));
        self.resolvers[resolver].iface = iface;
        self.resolvers[resolver].proto = proto;

        let srv_pattern =
            KeyPattern::new(service_name.clone(), QueryType::Record(RecordType::SRV));
        let txt_pattern = KeyPattern::new(service_name, QueryType::Record(RecordType::TXT));
        let (srv_browser, srv_outputs) = self.create_browser(
            srv_pattern,
            iface,
            proto,
            BrowserKind::Records,
            BrowserOwner::Resolver(resolver),
            now,
        );
        let (txt_browser, txt_outputs) = self.create_browser(
            txt_pattern,
            iface,
            proto,
            BrowserKind::Records,
            BrowserOwner::Resolver(resolver),
            now,
        );
        if let ResolverKind::Service {
            srv_browser: s,
            txt_browser: t,
            ..
        } = &mut self.resolvers[resolver].kind
        {
            *s = srv_browser;
            *t = txt_browser;
        }

        self.arm_resolver_timeout(resolver, now);
        self.route_outputs(srv_browser, srv_outputs, now);
        self.route_outputs(txt_browser, txt_outputs, now);
        Ok(self.resolver_id(resolver))
    }

    /// Resolve a host name to an address.
    pub fn host_name_resolver_new(
        &mut self,
        name: &str,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        now: Instant,
    ) -> Result<ResolverId, Error> {
        self.check_object_cap()?;
        let host = DomainName::from_dotted_string(name).ok_or(Error::InvalidHostName)?;

        let generation = self.bump_generation();
        let resolver = self.resolvers.insert(Resolver::new(
            generation,
            ResolverKind::HostName {
                name: host.clone(),
                address_browsers: Vec::new(),
            },
        ));
        self.resolvers[resolver].iface = iface;
        self.resolvers[resolver].proto = proto;

        self.open_address_browsers(resolver, &host, now);
        self.arm_resolver_timeout(resolver, now);
        Ok(self.resolver_id(resolver))
    }

    /// Resolve an address back to a host name, via `in-addr.arpa` /
    /// `ip6.arpa`.
    pub fn address_resolver_new(
        &mut self,
        address: IpAddr,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        now: Instant,
    ) -> Result<ResolverId, Error> {
        self.check_object_cap()?;
        let name = names::reverse_lookup_name(address);

        let generation = self.bump_generation();
        let resolver = self.resolvers.insert(Resolver::new(
            generation,
            ResolverKind::Address {
                address,
                ptr_browser: 0,
                found: None,
            },
        ));
        self.resolvers[resolver].iface = iface;
        self.resolvers[resolver].proto = proto;

        let pattern = KeyPattern::new(name, QueryType::Record(RecordType::PTR));
        let (ptr_browser, outputs) = self.create_browser(
            pattern,
            iface,
            proto,
            BrowserKind::Records,
            BrowserOwner::Resolver(resolver),
            now,
        );
        if let ResolverKind::Address { ptr_browser: p, .. } = &mut self.resolvers[resolver].kind {
            *p = ptr_browser;
        }

        self.arm_resolver_timeout(resolver, now);
        self.route_outputs(ptr_browser, outputs, now);
        Ok(self.resolver_id(resolver))
    }

    /// Destroy a resolver and its browsers.  No further events for it
    /// will be seen.
    pub fn resolver_free(&mut self, id: ResolverId) {
        match self.resolvers.get(id.index) {
            Some(resolver) if resolver.generation == id.generation => {}
            _ => return,
        }

        let resolver = self.resolvers.remove(id.index);
        for browser in resolver.owned_browsers() {
            self.free_browser(browser);
        }
        if let Some(timer) = resolver.timer {
            self.timeq.cancel(timer);
        }
        self.events.retain(|event| event.resolver() != Some(id));
    }

    // ------------------------------------------------------------------
    // timer dispatch

    fn dispatch(&mut self, token: Timeout, now: Instant) {
        match token {
            Timeout::CacheEntry {
                iface,
                proto,
                entry,
            } => {
                let Some(ifs) = self.interfaces.get_mut(&(iface, proto)) else {
                    return;
                };
                let Interface { cache, queries, .. } = ifs;
                let outcome = cache.handle_timer(entry, now, &mut self.timeq, &mut self.rng);
                if let Some(pattern) = outcome.maintenance_query {
                    queries.one_shot(&pattern, now, &mut self.timeq, &mut self.rng);
                }
                self.route_deltas(iface, proto, outcome.deltas, now);
            }
            Timeout::QueryJob { iface, proto, job } => {
                let Some(ifs) = self.interfaces.get_mut(&(iface, proto)) else {
                    return;
                };
                let Interface {
                    cache,
                    queries,
                    budget,
                    ..
                } = ifs;
                let budget = *budget;
                let outcome =
                    queries.handle_timer(job, now, cache, &mut self.timeq, &mut self.rng, budget);
                for octets in outcome.packets {
                    self.transmits.push_back(Transmit {
                        iface,
                        proto,
                        dest: None,
                        octets,
                    });
                }
                if outcome.first_departure {
                    self.note_first_departure(iface, proto, job, now);
                }
            }
            Timeout::QueryFollowUp { iface, proto, job } => {
                let Some(ifs) = self.interfaces.get_mut(&(iface, proto)) else {
                    return;
                };
                let budget = ifs.budget;
                let packets =
                    ifs.queries
                        .handle_follow_up(job, now, &mut self.timeq, &mut self.rng, budget);
                for octets in packets {
                    self.transmits.push_back(Transmit {
                        iface,
                        proto,
                        dest: None,
                        octets,
                    });
                }
            }
            Timeout::ResponseJob { iface, proto, job } => {
                let Some(ifs) = self.interfaces.get_mut(&(iface, proto)) else {
                    return;
                };
                let budget = ifs.budget;
                for (dest, octets) in ifs.responses.handle_timer(job, now, budget) {
                    self.transmits.push_back(Transmit {
                        iface,
                        proto,
                        dest,
                        octets,
                    });
                }
            }
            Timeout::GroupStep { group } => self.group_step(group, now),
            Timeout::BrowserAllForNow { browser } => {
                if let Some(b) = self.browsers.get_mut(browser) {
                    b.all_for_now_timer = None;
                    self.route_browser_output(browser, None, BrowserEvent::AllForNow, now);
                }
            }
            Timeout::ResolverTimeout { resolver } => {
                if let Some(r) = self.resolvers.get_mut(resolver) {
                    let generation = r.generation;
                    if let Some(event) = r.handle_timeout() {
                        self.events.push_back(ServerEvent::Resolver {
                            resolver: ResolverId {
                                index: resolver,
                                generation,
                            },
                            event,
                        });
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // incoming packets

    fn handle_query_packet(
        &mut self,
        iface: IfIndex,
        proto: Protocol,
        src: SocketAddr,
        message: &Message,
        now: Instant,
    ) {
        let legacy = src.port() != MDNS_PORT;
        let mut legacy_answers: Vec<ResourceRecord> = Vec::new();

        for question in &message.questions {
            tracing::debug!(%iface, %proto, %question, %legacy, "question");

            if !legacy && !question.unicast_response {
                if let Some(ifs) = self.interfaces.get_mut(&(iface, proto)) {
                    ifs.queries.on_peer_question(&question.pattern(), now);
                }
            }

            // local records matching the question, minus those the
            // querier already knows with at least half their lifetime
            // ahead of them
            let mut answers: Vec<(ResourceRecord, bool)> = Vec::new();
            for (_, group) in &self.groups {
                answers.extend(group.answers_for(question, iface, proto));
            }
            answers.retain(|(rr, _)| {
                !message.answers.iter().any(|known| {
                    known.same_identity(rr) && u64::from(known.ttl) * 2 >= u64::from(rr.ttl)
                })
            });

            if answers.is_empty() {
                continue;
            }

            if legacy {
                for (rr, _) in answers {
                    if !legacy_answers.iter().any(|existing| existing.same_identity(&rr)) {
                        legacy_answers.push(rr);
                    }
                }
            } else {
                let sole_authority = answers.iter().all(|(_, unique)| *unique);
                let fast = sole_authority || question.unicast_response;
                let dest = if question.unicast_response {
                    ResponseDest::Unicast(src)
                } else {
                    ResponseDest::Multicast
                };
                let records = answers.into_iter().map(|(rr, _)| rr).collect();
                if let Some(ifs) = self.interfaces.get_mut(&(iface, proto)) {
                    ifs.responses.schedule(
                        records,
                        dest,
                        fast,
                        now,
                        &mut self.timeq,
                        &mut self.rng,
                    );
                }
            }
        }

        if legacy && !legacy_answers.is_empty() {
            let reply = respond::legacy_reply(message, &legacy_answers);
            if let Some(ifs) = self.interfaces.get(&(iface, proto)) {
                match reply.to_packets(ifs.budget) {
                    Ok(packets) => {
                        for octets in packets {
                            self.transmits.push_back(Transmit {
                                iface,
                                proto,
                                dest: Some(src),
                                octets,
                            });
                        }
                    }
                    Err(error) => {
                        tracing::warn!(?error, "could not serialise legacy reply");
                    }
                }
            }
        }

        // tentative records in a peer's probe tie-break against ours
        for rr in &message.authority {
            self.check_conflict(rr, true, now);
        }
    }

    fn handle_response_packet(
        &mut self,
        iface: IfIndex,
        proto: Protocol,
        src: SocketAddr,
        message: &Message,
        now: Instant,
    ) {
        for rr in message.answers.iter().chain(message.additional.iter()) {
            if rr.rclass != RecordClass::IN {
                continue;
            }

            self.check_conflict(rr, false, now);

            let Some(ifs) = self.interfaces.get_mut(&(iface, proto)) else {
                return;
            };
            let deltas =
                ifs.cache
                    .handle_response_record(rr, src.ip(), now, &mut self.timeq, &mut self.rng);
            self.route_deltas(iface, proto, deltas, now);
        }
    }

    // ------------------------------------------------------------------
    // entry-group machinery

    fn commit_group(&mut self, index: usize, now: Instant) {
        let group = &mut self.groups[index];
        if group.entries.is_empty() {
            // nothing to probe for
            group.state = EntryGroupState::Established;
            self.emit_group_state(index);
            return;
        }
        group.state = EntryGroupState::Registering;
        group.step = 0;
        if let Some(timer) = group.timer.take() {
            self.timeq.cancel(timer);
        }
        group.timer = Some(self.timeq.schedule(now, Timeout::GroupStep { group: index }));
    }

    fn group_step(&mut self, index: usize, now: Instant) {
        let Some(group) = self.groups.get_mut(index) else {
            return;
        };
        group.timer = None;

        match group.state {
            EntryGroupState::Registering => {
                if group.step < PROBE_COUNT {
                    group.step += 1;
                    group.timer = Some(
                        self.timeq
                            .schedule(now + PROBE_INTERVAL, Timeout::GroupStep { group: index }),
                    );
                    self.send_group_probes(index);
                } else {
                    // three probes unanswered: the names are ours
                    self.groups[index].state = EntryGroupState::Established;
                    self.groups[index].step = PROBE_COUNT + 1;
                    self.emit_group_state(index);
                    self.groups[index].timer = Some(
                        self.timeq
                            .schedule(now + ANNOUNCE_INTERVAL, Timeout::GroupStep { group: index }),
                    );
                    self.send_group_announcement(index, now);
                }
            }
            EntryGroupState::Established => {
                group.step += 1;
                if group.step < PROBE_COUNT + ANNOUNCE_COUNT {
                    group.timer = Some(
                        self.timeq
                            .schedule(now + ANNOUNCE_INTERVAL, Timeout::GroupStep { group: index }),
                    );
                }
                self.send_group_announcement(index, now);
            }
            _ => {}
        }
    }

    /// Begin the announcement schedule anew, e.g. after a link
    /// change.
    fn restart_announcing(&mut self, index: usize, now: Instant) {
        let group = &mut self.groups[index];
        if group.state != EntryGroupState::Established {
            return;
        }
        group.step = PROBE_COUNT;
        if let Some(timer) = group.timer.take() {
            self.timeq.cancel(timer);
        }
        group.timer = Some(self.timeq.schedule(now, Timeout::GroupStep { group: index }));
    }

    fn send_group_probes(&mut self, index: usize) {
        let keys: Vec<(IfIndex, Protocol)> = self.interfaces.keys().copied().collect();
        for (iface, proto) in keys {
            let Some(message) = self.groups[index].probe_message(iface, proto) else {
                continue;
            };
            let budget = self.interfaces[&(iface, proto)].budget;
            match message.to_packets(budget) {
                Ok(packets) => {
                    for octets in packets {
                        self.transmits.push_back(Transmit {
                            iface,
                            proto,
                            dest: None,
                            octets,
                        });
                    }
                }
                Err(error) => {
                    tracing::warn!(?error, "could not serialise probe");
                }
            }
        }
    }

    fn send_group_announcement(&mut self, index: usize, now: Instant) {
        let keys: Vec<(IfIndex, Protocol)> = self.interfaces.keys().copied().collect();
        for (iface, proto) in keys {
            let Some(message) = self.groups[index].announce_message(iface, proto) else {
                continue;
            };
            let ifs = self.interfaces.get_mut(&(iface, proto)).unwrap();
            for rr in &message.answers {
                ifs.responses.note_multicast(rr, now);
            }
            match message.to_packets(ifs.budget) {
                Ok(packets) => {
                    for octets in packets {
                        self.transmits.push_back(Transmit {
                            iface,
                            proto,
                            dest: None,
                            octets,
                        });
                    }
                }
                Err(error) => {
                    tracing::warn!(?error, "could not serialise announcement");
                }
            }
        }
    }

    /// Send goodbyes for a group that is leaving the air.
    fn withdraw_group(&mut self, index: usize, _now: Instant) {
        if let Some(timer) = self.groups[index].timer.take() {
            self.timeq.cancel(timer);
        }
        if self.groups[index].state != EntryGroupState::Established {
            return;
        }

        let keys: Vec<(IfIndex, Protocol)> = self.interfaces.keys().copied().collect();
        for (iface, proto) in keys {
            let Some(message) = self.groups[index].goodbye_message(iface, proto) else {
                continue;
            };
            let budget = self.interfaces[&(iface, proto)].budget;
            match message.to_packets(budget) {
                Ok(packets) => {
                    for octets in packets {
                        self.transmits.push_back(Transmit {
                            iface,
                            proto,
                            dest: None,
                            octets,
                        });
                    }
                }
                Err(error) => {
                    tracing::warn!(?error, "could not serialise goodbye");
                }
            }
        }
    }

    fn check_conflict(&mut self, rr: &ResourceRecord, from_probe: bool, now: Instant) {
        let indices: Vec<usize> = self.groups.iter().map(|(index, _)| index).collect();
        for index in indices {
            let verdict = self.groups[index].conflict_with(rr);
            if verdict != ConflictVerdict::Lost {
                continue;
            }
            if self.groups[index].state == EntryGroupState::Established && from_probe {
                // a prober touching our established name: we defend
                // by answering, they must yield
                continue;
            }
            tracing::info!(record = %rr, "conflict lost, withdrawing");
            self.group_collision(index, now);
        }
    }

    fn group_collision(&mut self, index: usize, now: Instant) {
        {
            let group = &mut self.groups[index];
            if let Some(timer) = group.timer.take() {
                self.timeq.cancel(timer);
            }
            group.state = EntryGroupState::Collision;
        }

        if self.groups[index].is_host_group {
            // rename ourselves and try again
            let new_label = names::alternative_host_name(&self.config.host_name);
            tracing::info!(old = %self.config.host_name, new = %new_label, "host name collision, renaming");
            self.config.host_name = new_label;
            if let Ok(host_name) = fqdn(&self.config.host_name, &self.domain) {
                self.host_name = host_name;
            }
            self.rebuild_host_group(now);
            self.events.push_back(ServerEvent::HostNameChanged {
                name: self.host_name.clone(),
            });
        } else {
            self.emit_group_state(index);
        }
    }

    fn emit_group_state(&mut self, index: usize) {
        let group = &self.groups[index];
        if group.is_host_group {
            return;
        }
        self.events.push_back(ServerEvent::EntryGroup {
            group: EntryGroupId {
                index,
                generation: group.generation,
            },
            state: group.state,
        });
    }

    /// Re-derive the implicit host group from the current interface
    /// set and re-probe it.
    fn rebuild_host_group(&mut self, now: Instant) {
        self.withdraw_group(self.host_group, now);
        {
            let host_group = self.host_group;
            let group = &mut self.groups[host_group];
            group.entries.clear();
            group.state = EntryGroupState::Uncommitted;
            group.step = 0;
        }

        let host_ttl = self.config.host_ttl;
        let host_name = self.host_name.clone();
        let interfaces: Vec<(IfIndex, Protocol, IpAddr)> = self
            .interfaces
            .iter()
            .map(|((iface, proto), ifs)| (*iface, *proto, ifs.addr))
            .collect();

        for (iface, proto, addr) in interfaces {
            let data = match addr {
                IpAddr::V4(address) => RecordData::A { address },
                IpAddr::V6(address) => RecordData::AAAA { address },
            };
            let group = &mut self.groups[self.host_group];
            let _ = group.add_record(
                ResourceRecord {
                    name: host_name.clone(),
                    data,
                    rclass: RecordClass::IN,
                    cache_flush: false,
                    ttl: host_ttl,
                },
                true,
                Some(iface),
                Some(proto),
            );
            let _ = group.add_record(
                ResourceRecord {
                    name: names::reverse_lookup_name(addr),
                    data: RecordData::PTR {
                        ptrdname: host_name.clone(),
                    },
                    rclass: RecordClass::IN,
                    cache_flush: false,
                    ttl: host_ttl,
                },
                true,
                Some(iface),
                Some(proto),
            );
        }

        if !self.groups[self.host_group].entries.is_empty() {
            self.commit_group(self.host_group, now);
        }
    }

    // ------------------------------------------------------------------
    // browser and resolver machinery

    /// Create a browser: open its query jobs on every in-scope
    /// interface, seed it from the caches, arm its "all for now"
    /// timer.  The seed events are returned for the caller to route
    /// once ownership wiring is complete.
    fn create_browser(
        &mut self,
        pattern: KeyPattern,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        kind: BrowserKind,
        owner: BrowserOwner,
        now: Instant,
    ) -> (usize, Vec<(IfIndex, Protocol, BrowserEvent)>) {
        let generation = self.bump_generation();
        let index = self.browsers.insert(RecordBrowser::new(
            generation, pattern, iface, proto, kind, owner,
        ));

        let mut outputs = Vec::new();
        let keys: Vec<(IfIndex, Protocol)> = self.interfaces.keys().copied().collect();
        for (i, p) in keys {
            let in_scope = iface.map_or(true, |want| want == i) && proto.map_or(true, |want| want == p);
            if !in_scope {
                continue;
            }

            let pattern = self.browsers[index].pattern.clone();
            let ifs = self.interfaces.get_mut(&(i, p)).unwrap();
            let job = ifs.queries.add_job(&pattern, false, now, &mut self.timeq);
            self.browsers[index].query_jobs.push((i, p, job));

            for rr in ifs.cache.matching(&pattern, now) {
                let delta = CacheDelta::New(rr);
                if let Some(event) = self.browsers[index].handle_delta(i, p, &delta) {
                    outputs.push((i, p, event));
                }
            }
        }

        self.browsers[index].all_for_now_timer = Some(self.timeq.schedule(
            now + self.config.browse_window,
            Timeout::BrowserAllForNow { browser: index },
        ));

        (index, outputs)
    }

    fn restart_browser(&mut self, index: usize, now: Instant) {
        self.browsers[index].restart();

        let keys: Vec<(IfIndex, Protocol)> = self.interfaces.keys().copied().collect();
        let mut outputs = Vec::new();
        for (i, p) in keys {
            let browser = &self.browsers[index];
            let in_scope =
                browser.iface.map_or(true, |want| want == i) && browser.proto.map_or(true, |want| want == p);
            if !in_scope {
                continue;
            }
            let pattern = browser.pattern.clone();
            let ifs = &self.interfaces[&(i, p)];
            for rr in ifs.cache.matching(&pattern, now) {
                let delta = CacheDelta::New(rr);
                if let Some(event) = self.browsers[index].handle_delta(i, p, &delta) {
                    outputs.push((i, p, event));
                }
            }
        }
        self.route_outputs(index, outputs, now);
    }

    fn free_browser(&mut self, index: usize) {
        let Some(browser) = self.browsers.try_remove(index) else {
            return;
        };
        for (iface, proto, job) in browser.query_jobs {
            if let Some(ifs) = self.interfaces.get_mut(&(iface, proto)) {
                ifs.queries.remove_job(job, &mut self.timeq);
            }
        }
        if let Some(timer) = browser.all_for_now_timer {
            self.timeq.cancel(timer);
        }
    }

    /// Feed cache deltas to every browser watching them.
    fn route_deltas(
        &mut self,
        iface: IfIndex,
        proto: Protocol,
        deltas: Vec<CacheDelta>,
        now: Instant,
    ) {
        if deltas.is_empty() {
            return;
        }

        // snapshot: a routed event may create or free browsers
        let indices: Vec<usize> = self.browsers.iter().map(|(index, _)| index).collect();
        for delta in deltas {
            let key = match &delta {
                CacheDelta::New(rr) | CacheDelta::Remove(rr) => rr.key(),
            };
            for &index in &indices {
                let Some(browser) = self.browsers.get_mut(index) else {
                    continue;
                };
                if !browser.watches(iface, proto, &key) {
                    continue;
                }
                if let Some(event) = browser.handle_delta(iface, proto, &delta) {
                    self.route_browser_output(index, Some((iface, proto)), event, now);
                }
            }
        }
    }

    fn route_outputs(
        &mut self,
        index: usize,
        outputs: Vec<(IfIndex, Protocol, BrowserEvent)>,
        now: Instant,
    ) {
        for (iface, proto, event) in outputs {
            self.route_browser_output(index, Some((iface, proto)), event, now);
        }
    }

    /// Deliver one browser event to its consumer: the user's event
    /// queue, or the owning resolver.
    fn route_browser_output(
        &mut self,
        index: usize,
        scope: Option<(IfIndex, Protocol)>,
        event: BrowserEvent,
        now: Instant,
    ) {
        let Some(browser) = self.browsers.get(index) else {
            return;
        };
        let owner = browser.owner;
        let generation = browser.generation;

        match owner {
            BrowserOwner::User => {
                self.events.push_back(ServerEvent::Browser {
                    browser: BrowserId { index, generation },
                    scope,
                    event,
                });
            }
            BrowserOwner::Resolver(resolver) => {
                let Some(r) = self.resolvers.get_mut(resolver) else {
                    return;
                };
                let actions = r.handle_browser_event(index, &event);
                self.apply_resolver_actions(resolver, actions, now);
            }
        }
    }

    fn apply_resolver_actions(&mut self, resolver: usize, actions: Vec<ResolverAction>, now: Instant) {
        for action in actions {
            match action {
                ResolverAction::Emit(event) => {
                    let r = &mut self.resolvers[resolver];
                    if r.reported {
                        if let Some(timer) = r.timer.take() {
                            self.timeq.cancel(timer);
                        }
                    }
                    let generation = r.generation;
                    self.events.push_back(ServerEvent::Resolver {
                        resolver: ResolverId {
                            index: resolver,
                            generation,
                        },
                        event,
                    });
                }
                ResolverAction::WatchAddresses(target) => {
                    // retarget: the old address browsers are stale
                    let old = if let ResolverKind::Service {
                        address_browsers, ..
                    } = &mut self.resolvers[resolver].kind
                    {
                        std::mem::take(address_browsers)
                    } else {
                        Vec::new()
                    };
                    for browser in old {
                        self.free_browser(browser);
                    }
                    self.open_address_browsers(resolver, &target, now);
                }
                ResolverAction::RestartBrowse(browser) => {
                    self.arm_resolver_timeout(resolver, now);
                    if self.browsers.get(browser).is_some() {
                        self.restart_browser(browser, now);
                    }
                }
            }
        }
    }

    /// Open A and AAAA browsers on a name for a resolver.
    fn open_address_browsers(&mut self, resolver: usize, name: &DomainName, now: Instant) {
        let iface = self.resolvers[resolver].iface;
        let proto = self.resolvers[resolver].proto;

        let mut created = Vec::new();
        for rtype in [RecordType::A, RecordType::AAAA] {
            let pattern = KeyPattern::new(name.clone(), QueryType::Record(rtype));
            let (index, outputs) = self.create_browser(
                pattern,
                iface,
                proto,
                BrowserKind::Records,
                BrowserOwner::Resolver(resolver),
                now,
            );
            created.push((index, outputs));
        }

        match &mut self.resolvers[resolver].kind {
            ResolverKind::Service {
                address_browsers, ..
            }
            | ResolverKind::HostName {
                address_browsers, ..
            } => {
                address_browsers.extend(created.iter().map(|(index, _)| *index));
            }
            ResolverKind::Address { .. } => {}
        }

        for (index, outputs) in created {
            self.route_outputs(index, outputs, now);
        }
    }

    fn arm_resolver_timeout(&mut self, resolver: usize, now: Instant) {
        let deadline = now + self.config.resolver_timeout;
        let r = &mut self.resolvers[resolver];
        if let Some(timer) = r.timer.take() {
            self.timeq.cancel(timer);
        }
        r.timer = Some(
            self.timeq
                .schedule(deadline, Timeout::ResolverTimeout { resolver }),
        );
    }

    /// A query job departed for the first time: the browsers it feeds
    /// have now seen everything the cache held.
    fn note_first_departure(&mut self, iface: IfIndex, proto: Protocol, job: usize, now: Instant) {
        let matching: Vec<usize> = self
            .browsers
            .iter()
            .filter(|(_, browser)| {
                !browser.sent_cache_exhausted
                    && browser.query_jobs.contains(&(iface, proto, job))
            })
            .map(|(index, _)| index)
            .collect();

        for index in matching {
            self.browsers[index].sent_cache_exhausted = true;
            self.route_browser_output(
                index,
                Some((iface, proto)),
                BrowserEvent::CacheExhausted,
                now,
            );
        }
    }

    // ------------------------------------------------------------------
    // small helpers

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn check_object_cap(&self) -> Result<(), Error> {
        if self.browsers.len() + self.resolvers.len() >= self.config.max_objects {
            Err(Error::TooManyObjects)
        } else {
            Ok(())
        }
    }

    fn browser_id(&self, index: usize) -> BrowserId {
        BrowserId {
            index,
            generation: self.browsers[index].generation,
        }
    }

    fn resolver_id(&self, index: usize) -> ResolverId {
        ResolverId {
            index,
            generation: self.resolvers[index].generation,
        }
    }

    fn browser_check(&self, id: BrowserId) -> Result<(), Error> {
        match self.browsers.get(id.index) {
            Some(browser)
                if browser.generation == id.generation && browser.owner == BrowserOwner::User =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidObject),
        }
    }

    fn group_ref(&self, id: EntryGroupId) -> Result<&EntryGroup, Error> {
        match self.groups.get(id.index) {
            Some(group) if group.generation == id.generation && !group.is_host_group => Ok(group),
            _ => Err(Error::InvalidObject),
        }
    }

    fn group_mut(&mut self, id: EntryGroupId) -> Result<&mut EntryGroup, Error> {
        match self.groups.get_mut(id.index) {
            Some(group) if group.generation == id.generation && !group.is_host_group => Ok(group),
            _ => Err(Error::InvalidObject),
        }
    }
}

fn fqdn(host: &str, domain: &DomainName) -> Result<DomainName, Error> {
    let label = Label::try_from(host.as_bytes()).map_err(|_| Error::InvalidHostName)?;
    domain.prepend_label(label).ok_or(Error::InvalidHostName)
}
