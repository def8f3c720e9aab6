//! Locally registered records, bundled into entry groups that probe
//! the link for conflicts, announce themselves, defend their names,
//! and say goodbye when withdrawn.

use std::time::Duration;

use mdns_types::error::Error;
use mdns_types::names;
use mdns_types::protocol::types::*;
use mdns_types::txt::TxtList;

use crate::event::{EntryGroupState, IfIndex, Protocol};
use crate::timeq::TimeEventId;

/// Gap between the three probe queries (RFC 6762 section 8.1).
pub const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// How many probes go out before the group is established.
pub const PROBE_COUNT: u8 = 3;

/// Gap between the two announcements (RFC 6762 section 8.3).
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// How many announcements an establishment sends.
pub const ANNOUNCE_COUNT: u8 = 2;

/// Per-group record limit, to bound what one commit can put on the
/// air.
pub const GROUP_ENTRIES_MAX: usize = 32;

/// One record within a group, with its publication options.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub record: ResourceRecord,

    /// The record's key is asserted to be ours alone: probes defend
    /// it and announcements set the cache-flush bit.
    pub unique: bool,

    /// Restrict publication to one interface / protocol; `None`
    /// means everywhere.
    pub iface: Option<IfIndex>,
    pub proto: Option<Protocol>,
}

impl GroupEntry {
    pub fn applies_to(&self, iface: IfIndex, proto: Protocol) -> bool {
        self.iface.map_or(true, |i| i == iface) && self.proto.map_or(true, |p| p == proto)
    }
}

/// What to publish: a DNS-SD service.  Expanded into PTR + SRV + TXT
/// records plus the service-type enumeration pointer.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Instance name, e.g. `"Living Room Printer"`.
    pub name: String,

    /// Service type, e.g. `"_ipp._tcp"`.
    pub service_type: String,

    /// Domain to register under; defaults to the server's.
    pub domain: Option<String>,

    /// Host to point the SRV record at; defaults to the server's
    /// host name.
    pub host: Option<DomainName>,

    pub port: u16,
    pub txt: TxtList,
}

/// A bundle of records moving through probe/announce together.
#[derive(Debug)]
pub struct EntryGroup {
    pub(crate) generation: u64,
    pub(crate) state: EntryGroupState,
    pub(crate) entries: Vec<GroupEntry>,

    /// Probe/announce progress: 0..PROBE_COUNT are probes, then
    /// PROBE_COUNT..PROBE_COUNT+ANNOUNCE_COUNT are announcements.
    pub(crate) step: u8,

    pub(crate) timer: Option<TimeEventId>,

    /// The implicit group carrying the server's own address records.
    pub(crate) is_host_group: bool,
}

impl EntryGroup {
    pub(crate) fn new(generation: u64, is_host_group: bool) -> Self {
        Self {
            generation,
            state: EntryGroupState::Uncommitted,
            entries: Vec::new(),
            step: 0,
            timer: None,
            is_host_group,
        }
    }

    pub fn state(&self) -> EntryGroupState {
        self.state
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a record while the group is uncommitted.
    pub(crate) fn add_record(
        &mut self,
        record: ResourceRecord,
        unique: bool,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
    ) -> Result<(), Error> {
        if self.state != EntryGroupState::Uncommitted {
            return Err(Error::BadState);
        }
        if self.entries.len() >= GROUP_ENTRIES_MAX {
            return Err(Error::TooManyEntries);
        }
        if record.ttl == 0 {
            return Err(Error::InvalidTtl);
        }
        if record.rclass != RecordClass::IN {
            return Err(Error::InvalidRecord);
        }
        if record.name.is_root() {
            return Err(Error::InvalidRecord);
        }

        // two entries may share a key only if neither claims it
        // uniquely with different data
        for existing in &self.entries {
            if existing.record.key() == record.key()
                && (existing.unique || unique)
                && existing.record.data != record.data
            {
                return Err(Error::LocalCollision);
            }
        }

        self.entries.push(GroupEntry {
            record,
            unique,
            iface,
            proto,
        });
        Ok(())
    }

    /// Expand a service into its records and add them.
    pub(crate) fn add_service(
        &mut self,
        spec: &ServiceSpec,
        default_domain: &str,
        default_host: &DomainName,
        ttl: u32,
    ) -> Result<(), Error> {
        if spec.port == 0 {
            return Err(Error::InvalidPort);
        }
        let domain = spec.domain.as_deref().unwrap_or(default_domain);
        let service_name = names::service_name(&spec.name, &spec.service_type, domain)?;
        let type_name = names::service_type_name(&spec.service_type, domain)?;
        let enumeration_name = names::service_type_enumeration_name(domain)?;
        let host = spec.host.clone().unwrap_or_else(|| default_host.clone());

        // the browsing pointer: shared, many instances per type
        self.add_record(
            ResourceRecord {
                name: type_name.clone(),
                data: RecordData::PTR {
                    ptrdname: service_name.clone(),
                },
                rclass: RecordClass::IN,
                cache_flush: false,
                ttl,
            },
            false,
            None,
            None,
        )?;

        // where the instance lives: unique to us
        self.add_record(
            ResourceRecord {
                name: service_name.clone(),
                data: RecordData::SRV {
                    priority: 0,
                    weight: 0,
                    port: spec.port,
                    target: host,
                },
                rclass: RecordClass::IN,
                cache_flush: false,
                ttl,
            },
            true,
            None,
            None,
        )?;

        self.add_record(
            ResourceRecord {
                name: service_name,
                data: RecordData::TXT {
                    strings: spec.txt.clone(),
                },
                rclass: RecordClass::IN,
                cache_flush: false,
                ttl,
            },
            true,
            None,
            None,
        )?;

        // make the type itself discoverable
        self.add_record(
            ResourceRecord {
                name: enumeration_name,
                data: RecordData::PTR { ptrdname: type_name },
                rclass: RecordClass::IN,
                cache_flush: false,
                ttl,
            },
            false,
            None,
            None,
        )
    }

    /// The probe for one interface: every key as a question, every
    /// proposed record in the authority section (RFC 6762 section
    /// 8.2).  `None` if nothing in the group applies there.
    pub(crate) fn probe_message(&self, iface: IfIndex, proto: Protocol) -> Option<Message> {
        let mut message = Message::query();

        for entry in &self.entries {
            if !entry.applies_to(iface, proto) {
                continue;
            }
            if !message
                .questions
                .iter()
                .any(|q| q.name == entry.record.name)
            {
                message
                    .questions
                    .push(Question::new(entry.record.name.clone(), QueryType::Wildcard));
            }
            let mut tentative = entry.record.clone();
            tentative.cache_flush = false;
            message.authority.push(tentative);
        }

        if message.questions.is_empty() {
            None
        } else {
            Some(message)
        }
    }

    /// The announcement for one interface: all records as answers,
    /// cache-flush set on unique ones.
    pub(crate) fn announce_message(&self, iface: IfIndex, proto: Protocol) -> Option<Message> {
        let mut message = Message::response(0);

        for entry in &self.entries {
            if !entry.applies_to(iface, proto) {
                continue;
            }
            let mut rr = entry.record.clone();
            rr.cache_flush = entry.unique;
            message.answers.push(rr);
        }

        if message.answers.is_empty() {
            None
        } else {
            Some(message)
        }
    }

    /// The goodbye for one interface: all records with TTL 0.
    pub(crate) fn goodbye_message(&self, iface: IfIndex, proto: Protocol) -> Option<Message> {
        let mut message = Message::response(0);

        for entry in &self.entries {
            if !entry.applies_to(iface, proto) {
                continue;
            }
            let mut rr = entry.record.clone();
            rr.cache_flush = false;
            rr.ttl = 0;
            message.answers.push(rr);
        }

        if message.answers.is_empty() {
            None
        } else {
            Some(message)
        }
    }

    /// Local records matching a question, for answering peers.  Only
    /// established groups answer.
    pub(crate) fn answers_for(
        &self,
        question: &Question,
        iface: IfIndex,
        proto: Protocol,
    ) -> Vec<(ResourceRecord, bool)> {
        if self.state != EntryGroupState::Established {
            return Vec::new();
        }

        self.entries
            .iter()
            .filter(|entry| entry.applies_to(iface, proto) && entry.record.matches(question))
            .map(|entry| {
                let mut rr = entry.record.clone();
                rr.cache_flush = entry.unique;
                (rr, entry.unique)
            })
            .collect()
    }

    /// How an incoming record bears on this group.
    pub(crate) fn conflict_with(&self, incoming: &ResourceRecord) -> ConflictVerdict {
        for entry in &self.entries {
            if entry.record.key() != incoming.key() {
                continue;
            }
            if entry.record.same_identity(incoming) {
                // someone else asserting our exact data is not a
                // conflict
                continue;
            }
            if !entry.unique {
                // shared records tolerate other owners
                continue;
            }

            return match self.state {
                EntryGroupState::Registering => {
                    match entry.record.lexicographical_cmp(incoming) {
                        std::cmp::Ordering::Less => ConflictVerdict::Lost,
                        // we outrank them; they must yield
                        _ => ConflictVerdict::Won,
                    }
                }
                EntryGroupState::Established => ConflictVerdict::Lost,
                _ => ConflictVerdict::None,
            };
        }

        ConflictVerdict::None
    }
}

/// The outcome of a tie-break against an incoming record.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ConflictVerdict {
    None,
    Won,
    Lost,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdns_types::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    fn group() -> EntryGroup {
        EntryGroup::new(0, false)
    }

    #[test]
    fn add_record_validates() {
        let mut g = group();

        let mut zero_ttl = a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5));
        zero_ttl.ttl = 0;
        assert_eq!(
            Err(Error::InvalidTtl),
            g.add_record(zero_ttl, true, None, None)
        );

        assert_eq!(
            Ok(()),
            g.add_record(
                a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
                true,
                None,
                None
            )
        );

        // same key, different data, unique: a local collision
        assert_eq!(
            Err(Error::LocalCollision),
            g.add_record(
                a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 6)),
                true,
                None,
                None
            )
        );
    }

    #[test]
    fn add_record_only_while_uncommitted() {
        let mut g = group();
        g.add_record(
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
        g.state = EntryGroupState::Registering;

        assert_eq!(
            Err(Error::BadState),
            g.add_record(
                a_record("bar.local.", Ipv4Addr::new(10, 0, 0, 6)),
                true,
                None,
                None
            )
        );
    }

    #[test]
    fn probe_message_shape() {
        let mut g = group();
        g.add_record(
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
        g.add_record(
            aaaa_record("foo.local.", "fe80::1".parse().unwrap()),
            true,
            None,
            None,
        )
        .unwrap();

        let probe = g.probe_message(IfIndex(1), Protocol::V4).unwrap();
        // one ANY question for the shared name, both records tentative
        assert_eq!(1, probe.questions.len());
        assert_eq!(QueryType::Wildcard, probe.questions[0].qtype);
        assert_eq!(2, probe.authority.len());
        assert!(probe.authority.iter().all(|rr| !rr.cache_flush));
        assert!(!probe.header.is_response);
    }

    #[test]
    fn announce_message_sets_flush_on_unique() {
        let mut g = group();
        g.add_record(
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
        g.add_record(
            ptr_record("_http._tcp.local.", "web._http._tcp.local."),
            false,
            None,
            None,
        )
        .unwrap();

        let announce = g.announce_message(IfIndex(1), Protocol::V4).unwrap();
        assert_eq!(2, announce.answers.len());
        let a = announce
            .answers
            .iter()
            .find(|rr| rr.data.rtype() == RecordType::A)
            .unwrap();
        let ptr = announce
            .answers
            .iter()
            .find(|rr| rr.data.rtype() == RecordType::PTR)
            .unwrap();
        assert!(a.cache_flush);
        assert!(!ptr.cache_flush);
    }

    #[test]
    fn goodbye_zeroes_ttls() {
        let mut g = group();
        g.add_record(
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();

        let goodbye = g.goodbye_message(IfIndex(1), Protocol::V4).unwrap();
        assert!(goodbye.answers.iter().all(|rr| rr.ttl == 0));
    }

    #[test]
    fn interface_scoping() {
        let mut g = group();
        g.add_record(
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            Some(IfIndex(2)),
            Some(Protocol::V4),
        )
        .unwrap();

        assert!(g.probe_message(IfIndex(1), Protocol::V4).is_none());
        assert!(g.probe_message(IfIndex(2), Protocol::V6).is_none());
        assert!(g.probe_message(IfIndex(2), Protocol::V4).is_some());
    }

    #[test]
    fn tiebreak_verdicts_while_registering() {
        let mut g = group();
        g.add_record(
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
        g.state = EntryGroupState::Registering;

        // 10.0.0.7 beats 10.0.0.5 bytewise
        let stronger = a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(ConflictVerdict::Lost, g.conflict_with(&stronger));

        let weaker = a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(ConflictVerdict::Won, g.conflict_with(&weaker));

        // identical data is no conflict at all
        let same = a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(ConflictVerdict::None, g.conflict_with(&same));

        // unrelated names neither
        let other = a_record("bar.local.", Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(ConflictVerdict::None, g.conflict_with(&other));
    }

    #[test]
    fn established_unique_records_always_lose_to_asserted_conflicts() {
        let mut g = group();
        g.add_record(
            a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 5)),
            true,
            None,
            None,
        )
        .unwrap();
        g.state = EntryGroupState::Established;

        let conflicting = a_record("foo.local.", Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(ConflictVerdict::Lost, g.conflict_with(&conflicting));
    }

    #[test]
    fn add_service_expands_to_four_records() {
        let mut g = group();
        let spec = ServiceSpec {
            name: "Web Server".to_string(),
            service_type: "_http._tcp".to_string(),
            domain: None,
            host: None,
            port: 8080,
            txt: TxtList::new(),
        };
        g.add_service(&spec, "local", &domain("mybox.local."), 120)
            .unwrap();

        assert_eq!(4, g.entries.len());

        let srv = g
            .entries
            .iter()
            .find(|e| e.record.data.rtype() == RecordType::SRV)
            .unwrap();
        assert!(srv.unique);
        assert_eq!(
            "Web Server._http._tcp.local.",
            srv.record.name.to_dotted_string()
        );
        match &srv.record.data {
            RecordData::SRV { port, target, .. } => {
                assert_eq!(8080, *port);
                assert_eq!(domain("mybox.local."), *target);
            }
            other => panic!("unexpected data {other:?}"),
        }

        let enumeration = g
            .entries
            .iter()
            .find(|e| e.record.name == domain("_services._dns-sd._udp.local."))
            .unwrap();
        assert!(!enumeration.unique);
        match &enumeration.record.data {
            RecordData::PTR { ptrdname } => {
                assert_eq!(domain("_http._tcp.local."), *ptrdname);
            }
            other => panic!("unexpected data {other:?}"),
        }
    }

    #[test]
    fn add_service_rejects_port_zero() {
        let mut g = group();
        let spec = ServiceSpec {
            name: "X".to_string(),
            service_type: "_http._tcp".to_string(),
            domain: None,
            host: None,
            port: 0,
            txt: TxtList::new(),
        };
        assert_eq!(
            Err(Error::InvalidPort),
            g.add_service(&spec, "local", &domain("mybox.local."), 120)
        );
    }
}
