//! Resolvers: small state machines composing record browsers into
//! "give me the whole answer" lookups - a service's SRV + TXT +
//! address, a host's address, an address's host.

use std::net::IpAddr;

use mdns_types::protocol::types::*;
use mdns_types::txt::TxtList;

use crate::event::{BrowserEvent, BrowserItem, ResolvedService, ResolverEvent};
use crate::timeq::TimeEventId;

/// What a resolver asks the server to do after digesting an event.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum ResolverAction {
    /// Deliver this to the user.
    Emit(ResolverEvent),

    /// Open address browsers on this SRV target.
    WatchAddresses(DomainName),

    /// The watched record vanished: restart the given owned browser
    /// and re-arm the timeout to look for a replacement.
    RestartBrowse(usize),
}

#[derive(Debug)]
pub(crate) enum ResolverKind {
    Service {
        name: String,
        service_type: String,
        domain: DomainName,

        srv_browser: usize,
        txt_browser: usize,
        address_browsers: Vec<usize>,

        srv: Option<(u16, u16, u16, DomainName)>,
        txt: Option<TxtList>,
        address: Option<IpAddr>,
    },

    HostName {
        name: DomainName,
        address_browsers: Vec<usize>,
    },

    Address {
        address: IpAddr,
        ptr_browser: usize,
        found: Option<DomainName>,
    },
}

#[derive(Debug)]
pub struct Resolver {
    pub(crate) generation: u64,
    pub(crate) kind: ResolverKind,
    pub(crate) timer: Option<TimeEventId>,

    /// Scope inherited by every browser this resolver opens.
    pub(crate) iface: Option<crate::event::IfIndex>,
    pub(crate) proto: Option<crate::event::Protocol>,

    /// A complete answer has been delivered; the timeout is spent.
    pub(crate) reported: bool,
}

impl Resolver {
    pub(crate) fn new(generation: u64, kind: ResolverKind) -> Self {
        Self {
            generation,
            kind,
            timer: None,
            iface: None,
            proto: None,
            reported: false,
        }
    }

    /// Indices of all record browsers this resolver owns.
    pub(crate) fn owned_browsers(&self) -> Vec<usize> {
        match &self.kind {
            ResolverKind::Service {
                srv_browser,
                txt_browser,
                address_browsers,
                ..
            } => {
                let mut owned = vec![*srv_browser, *txt_browser];
                owned.extend(address_browsers.iter().copied());
                owned
            }
            ResolverKind::HostName {
                address_browsers, ..
            } => address_browsers.clone(),
            ResolverKind::Address { ptr_browser, .. } => vec![*ptr_browser],
        }
    }

    /// Digest an event from one of the owned browsers.
    pub(crate) fn handle_browser_event(
        &mut self,
        browser: usize,
        event: &BrowserEvent,
    ) -> Vec<ResolverAction> {
        let record = match event {
            BrowserEvent::New(BrowserItem::Record(rr)) => Some((rr, true)),
            BrowserEvent::Remove(BrowserItem::Record(rr)) => Some((rr, false)),
            _ => None,
        };
        let Some((rr, is_new)) = record else {
            return Vec::new();
        };

        let mut actions = Vec::new();

        match &mut self.kind {
            ResolverKind::Service {
                srv,
                txt,
                address,
                address_browsers,
                ..
            } => match &rr.data {
                RecordData::SRV {
                    priority,
                    weight,
                    port,
                    target,
                } => {
                    if is_new {
                        let target_changed =
                            srv.as_ref().map_or(true, |(_, _, _, old)| old != target);
                        *srv = Some((*priority, *weight, *port, target.clone()));
                        if target_changed {
                            // addresses of the old target are stale
                            *address = None;
                            actions.push(ResolverAction::WatchAddresses(target.clone()));
                        }
                    } else if srv.as_ref().map_or(false, |(_, _, _, old)| old == target) {
                        *srv = None;
                        self.reported = false;
                    }
                }
                RecordData::TXT { strings } => {
                    if is_new {
                        *txt = Some(strings.clone());
                    } else if txt.as_ref() == Some(strings) {
                        *txt = None;
                        self.reported = false;
                    }
                }
                RecordData::A { address: a } => {
                    if address_browsers.contains(&browser) {
                        if is_new {
                            *address = Some(IpAddr::V4(*a));
                        } else if *address == Some(IpAddr::V4(*a)) {
                            *address = None;
                            self.reported = false;
                        }
                    }
                }
                RecordData::AAAA { address: a } => {
                    if address_browsers.contains(&browser) {
                        if is_new {
                            *address = Some(IpAddr::V6(*a));
                        } else if *address == Some(IpAddr::V6(*a)) {
                            *address = None;
                            self.reported = false;
                        }
                    }
                }
                _ => {}
            },
            ResolverKind::HostName { name, .. } => {
                let found = match &rr.data {
                    RecordData::A { address } if is_new => Some(IpAddr::V4(*address)),
                    RecordData::AAAA { address } if is_new => Some(IpAddr::V6(*address)),
                    _ => None,
                };
                if let Some(address) = found {
                    if !self.reported {
                        self.reported = true;
                        actions.push(ResolverAction::Emit(ResolverEvent::HostNameFound {
                            name: name.clone(),
                            address,
                        }));
                    }
                }
                return actions;
            }
            ResolverKind::Address {
                address,
                ptr_browser,
                found,
            } => {
                if let RecordData::PTR { ptrdname } = &rr.data {
                    if is_new {
                        if found.is_none() {
                            *found = Some(ptrdname.clone());
                            self.reported = true;
                            actions.push(ResolverAction::Emit(ResolverEvent::AddressFound {
                                address: *address,
                                name: ptrdname.clone(),
                            }));
                        }
                    } else if found.as_ref() == Some(ptrdname) {
                        // the name went away: look for a replacement
                        *found = None;
                        self.reported = false;
                        actions.push(ResolverAction::RestartBrowse(*ptr_browser));
                    }
                }
                return actions;
            }
        }

        // service resolvers complete when all three parts are in
        if let ResolverKind::Service {
            name,
            service_type,
            domain,
            srv,
            txt,
            address,
            ..
        } = &self.kind
        {
            if !self.reported {
                if let (Some((_, _, port, target)), Some(txt), Some(address)) =
                    (srv.as_ref(), txt.as_ref(), address.as_ref())
                {
                    self.reported = true;
                    actions.push(ResolverAction::Emit(ResolverEvent::ServiceFound(
                        ResolvedService {
                            name: name.clone(),
                            service_type: service_type.clone(),
                            domain: domain.clone(),
                            host: target.clone(),
                            address: *address,
                            port: *port,
                            txt: txt.clone(),
                        },
                    )));
                }
            }
        }

        actions
    }

    /// The lookup window closed.
    pub(crate) fn handle_timeout(&mut self) -> Option<ResolverEvent> {
        self.timer = None;
        if self.reported {
            None
        } else {
            Some(ResolverEvent::Timeout)
        }
    }
}
