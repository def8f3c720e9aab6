//! The record browser: a long-lived subscription to a key pattern,
//! fed by the cache, deduplicating into NEW / REMOVE events.  The
//! service, service-type, and domain browsers are the same machine
//! with a different event payload.

use bytes::Bytes;
use std::collections::HashSet;

use mdns_types::protocol::types::*;

use crate::cache::CacheDelta;
use crate::event::{BrowserEvent, BrowserItem, IfIndex, Protocol};
use crate::timeq::TimeEventId;

/// What payload a browser's events carry.
#[derive(Debug, Clone)]
pub(crate) enum BrowserKind {
    /// Raw records.
    Records,

    /// Service instances under `<type>.<domain>`.
    Service {
        service_type: String,
        domain: DomainName,
    },

    /// Service types under `_services._dns-sd._udp.<domain>`.
    ServiceType { domain: DomainName },

    /// Domains under `<mode>._dns-sd._udp.<domain>`.
    Domain,
}

/// Who consumes a browser's events.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum BrowserOwner {
    /// The embedding, via `poll_event`.
    User,

    /// A resolver, by slab index; its events never reach the user
    /// directly.
    Resolver(usize),
}

/// The identity a browser deduplicates on: where the record was seen
/// plus its key and payload.
type Surfaced = (IfIndex, Protocol, RecordKey, Bytes);

#[derive(Debug)]
pub struct RecordBrowser {
    pub(crate) generation: u64,
    pub(crate) pattern: KeyPattern,
    pub(crate) iface: Option<IfIndex>,
    pub(crate) proto: Option<Protocol>,
    pub(crate) kind: BrowserKind,
    pub(crate) owner: BrowserOwner,

    /// Records already reported NEW and not yet reported REMOVE.
    surfaced: HashSet<Surfaced>,

    /// The query jobs feeding this browser, one per interface.
    pub(crate) query_jobs: Vec<(IfIndex, Protocol, usize)>,

    pub(crate) all_for_now_timer: Option<TimeEventId>,
    pub(crate) sent_cache_exhausted: bool,
}

impl RecordBrowser {
    pub(crate) fn new(
        generation: u64,
        pattern: KeyPattern,
        iface: Option<IfIndex>,
        proto: Option<Protocol>,
        kind: BrowserKind,
        owner: BrowserOwner,
    ) -> Self {
        Self {
            generation,
            pattern,
            iface,
            proto,
            kind,
            owner,
            surfaced: HashSet::new(),
            query_jobs: Vec::new(),
            all_for_now_timer: None,
            sent_cache_exhausted: false,
        }
    }

    pub(crate) fn watches(&self, iface: IfIndex, proto: Protocol, key: &RecordKey) -> bool {
        self.iface.map_or(true, |i| i == iface)
            && self.proto.map_or(true, |p| p == proto)
            && self.pattern.matches(key)
    }

    /// Fold a cache delta into the surfaced set.  A refresh of a
    /// known record produces nothing; a removal of an unknown record
    /// produces nothing; everything else produces exactly one event.
    pub(crate) fn handle_delta(
        &mut self,
        iface: IfIndex,
        proto: Protocol,
        delta: &CacheDelta,
    ) -> Option<BrowserEvent> {
        match delta {
            CacheDelta::New(rr) => {
                let id = surfaced_id(iface, proto, rr);
                if self.surfaced.insert(id) {
                    Some(BrowserEvent::New(self.item_for(rr)?))
                } else {
                    None
                }
            }
            CacheDelta::Remove(rr) => {
                let id = surfaced_id(iface, proto, rr);
                if self.surfaced.remove(&id) {
                    Some(BrowserEvent::Remove(self.item_for(rr)?))
                } else {
                    None
                }
            }
        }
    }

    /// Forget everything surfaced, ahead of a re-seed from the cache.
    pub(crate) fn restart(&mut self) {
        self.surfaced.clear();
    }

    /// Shape a record into this browser's payload.  `None` for
    /// records that slipped through the pattern but do not carry what
    /// the composite layer needs (e.g. a non-PTR answer to a PTR
    /// browse).
    fn item_for(&self, rr: &ResourceRecord) -> Option<BrowserItem> {
        match &self.kind {
            BrowserKind::Records => Some(BrowserItem::Record(rr.clone())),
            BrowserKind::Service {
                service_type,
                domain,
            } => {
                let ptrdname = ptr_target(rr)?;
                let instance = ptrdname.labels.first()?;
                if instance.is_empty() {
                    return None;
                }
                Some(BrowserItem::Service {
                    name: instance.to_string_lossy(),
                    service_type: service_type.clone(),
                    domain: domain.clone(),
                })
            }
            BrowserKind::ServiceType { domain } => {
                let ptrdname = ptr_target(rr)?;
                // the type is whatever sits above the domain,
                // normally two labels like `_ipp._tcp`
                if !ptrdname.is_subdomain_of(domain) {
                    return None;
                }
                let type_labels = &ptrdname.labels[..ptrdname.labels.len() - domain.labels.len()];
                if type_labels.is_empty() {
                    return None;
                }
                let service_type = type_labels
                    .iter()
                    .map(Label::to_string_lossy)
                    .collect::<Vec<_>>()
                    .join(".");
                Some(BrowserItem::ServiceType {
                    service_type,
                    domain: domain.clone(),
                })
            }
            BrowserKind::Domain => Some(BrowserItem::Domain(ptr_target(rr)?.clone())),
        }
    }
}

fn ptr_target(rr: &ResourceRecord) -> Option<&DomainName> {
    match &rr.data {
        RecordData::PTR { ptrdname } => Some(ptrdname),
        _ => None,
    }
}

fn surfaced_id(iface: IfIndex, proto: Protocol, rr: &ResourceRecord) -> Surfaced {
    (iface, proto, rr.key(), rr.data.canonical_rdata())
}
