//! The types crossing the engine boundary: interface identifiers,
//! outbound datagrams, generation-tagged object handles, and the
//! events delivered to subscribers.

use bytes::BytesMut;
use std::net::{IpAddr, SocketAddr};

use mdns_types::protocol::types::{DomainName, ResourceRecord};
use mdns_types::txt::TxtList;

/// An OS network interface, by index.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct IfIndex(pub u32);

impl std::fmt::Display for IfIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// An address family.  Each interface runs an independent engine
/// instance per family it speaks.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Protocol {
    V4,
    V6,
}

impl Protocol {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Protocol::V4,
            IpAddr::V6(_) => Protocol::V6,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Protocol::V4 => write!(f, "IPv4"),
            Protocol::V6 => write!(f, "IPv6"),
        }
    }
}

/// An outbound datagram.  A `dest` of `None` means the multicast
/// group of the interface's family.
#[derive(Debug)]
pub struct Transmit {
    pub iface: IfIndex,
    pub proto: Protocol,
    pub dest: Option<SocketAddr>,
    pub octets: BytesMut,
}

/// Handle to an entry group owned by the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EntryGroupId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// Handle to a record browser (or one of the composite browsers
/// layered on it) owned by the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BrowserId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// Handle to a resolver owned by the server.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResolverId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// The lifecycle of an entry group.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EntryGroupState {
    /// Records may be added; nothing is on the air.
    Uncommitted,

    /// Probing the link for conflicts.
    Registering,

    /// Probes completed without conflict; records are announced and
    /// defended.
    Established,

    /// A peer outranked one of the records.  Rename and re-commit.
    Collision,
}

/// What a browser saw.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BrowserEvent {
    New(BrowserItem),
    Remove(BrowserItem),

    /// One query/response round-trip has passed: what has been
    /// reported so far is probably all there is, for now.
    AllForNow,

    /// Everything the cache already knew has been delivered and the
    /// first query has gone out.
    CacheExhausted,
}

/// The payload of a browser event, shaped by the browser's kind.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BrowserItem {
    /// A raw record browser saw a record.
    Record(ResourceRecord),

    /// A service browser saw a service instance.
    Service {
        name: String,
        service_type: String,
        domain: DomainName,
    },

    /// A service-type browser saw a service type.
    ServiceType {
        service_type: String,
        domain: DomainName,
    },

    /// A domain browser saw a browsing/registering domain.
    Domain(DomainName),
}

/// A fully resolved service.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResolvedService {
    pub name: String,
    pub service_type: String,
    pub domain: DomainName,
    pub host: DomainName,
    pub address: IpAddr,
    pub port: u16,
    pub txt: TxtList,
}

/// What a resolver concluded.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResolverEvent {
    ServiceFound(ResolvedService),
    HostNameFound { name: DomainName, address: IpAddr },
    AddressFound { address: IpAddr, name: DomainName },

    /// The lookup window closed without a complete answer.
    Timeout,
}

/// Events delivered to the embedding.  Drain with
/// [`crate::server::Server::poll_event`] after every call into the
/// engine; freeing an object synchronously drops its queued events,
/// so a freed handle is never seen here.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ServerEvent {
    EntryGroup {
        group: EntryGroupId,
        state: EntryGroupState,
    },

    /// The implicit host group collided and the server renamed
    /// itself; records for the new name are being probed.
    HostNameChanged { name: DomainName },

    Browser {
        browser: BrowserId,

        /// Where the record was seen; `None` for browser-wide events
        /// (`AllForNow`, `CacheExhausted`).
        scope: Option<(IfIndex, Protocol)>,

        event: BrowserEvent,
    },

    Resolver {
        resolver: ResolverId,
        event: ResolverEvent,
    },
}

impl ServerEvent {
    /// The browser this event belongs to, if any.
    pub(crate) fn browser(&self) -> Option<BrowserId> {
        match self {
            ServerEvent::Browser { browser, .. } => Some(*browser),
            _ => None,
        }
    }

    /// The resolver this event belongs to, if any.
    pub(crate) fn resolver(&self) -> Option<ResolverId> {
        match self {
            ServerEvent::Resolver { resolver, .. } => Some(*resolver),
            _ => None,
        }
    }

    /// The entry group this event belongs to, if any.
    pub(crate) fn entry_group(&self) -> Option<EntryGroupId> {
        match self {
            ServerEvent::EntryGroup { group, .. } => Some(*group),
            _ => None,
        }
    }
}
