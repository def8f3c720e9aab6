//! Helpers for the names DNS-SD traffics in: service types like
//! `_ipp._tcp`, full service names, reverse-lookup names, and the
//! alternative-name generator used to recover from collisions.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::Error;
use crate::protocol::types::{DomainName, Label, LABEL_MAX_LEN};

/// A single host label is valid if it is a non-empty label without
/// dots: the machine name, not a FQDN.
pub fn is_valid_host_name(s: &str) -> bool {
    !s.is_empty() && s.len() <= LABEL_MAX_LEN && !s.contains('.') && !s.contains('\\')
}

pub fn is_valid_domain_name(s: &str) -> bool {
    DomainName::from_dotted_string(s).is_some()
}

/// A service instance name is a single DNS label; dots and
/// backslashes are permitted in presentation (they are escaped on the
/// wire) but the octet budget still applies.
pub fn is_valid_service_instance(s: &str) -> bool {
    !s.is_empty() && s.len() <= LABEL_MAX_LEN
}

/// A service type is `_app._tcp` or `_app._udp`, per RFC 6763
/// section 7, optionally preceded by a subtype as in
/// `_printer._sub._http._tcp`.
pub fn is_valid_service_type(s: &str) -> bool {
    let labels: Vec<&str> = s.split('.').collect();

    let base = match labels.len() {
        2 => &labels[..],
        4 if labels[1] == "_sub" => {
            if !is_valid_service_instance(labels[0]) {
                return false;
            }
            &labels[2..]
        }
        _ => return false,
    };

    let app = base[0];
    let proto = base[1];

    app.len() >= 2
        && app.len() <= 16
        && app.starts_with('_')
        && app[1..]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && (proto == "_tcp" || proto == "_udp")
}

/// Build the full name `instance.type.domain` of a service, with the
/// instance as a single (possibly dot-containing) label.
pub fn service_name(instance: &str, service_type: &str, domain: &str) -> Result<DomainName, Error> {
    if !is_valid_service_instance(instance) {
        return Err(Error::InvalidServiceName);
    }
    if !is_valid_service_type(service_type) {
        return Err(Error::InvalidServiceType);
    }
    let suffix = service_type_name(service_type, domain)?;

    // length checked by is_valid_service_instance
    let label = Label::try_from(instance.as_bytes()).map_err(|_| Error::InvalidServiceName)?;
    suffix.prepend_label(label).ok_or(Error::InvalidServiceName)
}

/// Build the name `type.domain` that service browsers watch.
pub fn service_type_name(service_type: &str, domain: &str) -> Result<DomainName, Error> {
    if !is_valid_service_type(service_type) {
        return Err(Error::InvalidServiceType);
    }
    let full = format!("{service_type}.{domain}");
    DomainName::from_dotted_string(&full).ok_or(Error::InvalidDomainName)
}

/// The name service-type browsers watch:
/// `_services._dns-sd._udp.<domain>`.
pub fn service_type_enumeration_name(domain: &str) -> Result<DomainName, Error> {
    let full = format!("_services._dns-sd._udp.{domain}");
    DomainName::from_dotted_string(&full).ok_or(Error::InvalidDomainName)
}

/// Which flavour of domain enumeration a domain browser performs, per
/// RFC 6763 section 11.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DomainBrowserKind {
    Browse,
    BrowseDefault,
    Register,
    RegisterDefault,
    BrowseLegacy,
}

impl DomainBrowserKind {
    fn label(self) -> &'static str {
        match self {
            DomainBrowserKind::Browse => "b",
            DomainBrowserKind::BrowseDefault => "db",
            DomainBrowserKind::Register => "r",
            DomainBrowserKind::RegisterDefault => "dr",
            DomainBrowserKind::BrowseLegacy => "lb",
        }
    }
}

/// The name a domain browser watches, e.g. `b._dns-sd._udp.local`.
pub fn domain_enumeration_name(kind: DomainBrowserKind, domain: &str) -> Result<DomainName, Error> {
    let full = format!("{}._dns-sd._udp.{domain}", kind.label());
    DomainName::from_dotted_string(&full).ok_or(Error::InvalidDomainName)
}

/// The `in-addr.arpa` name for an IPv4 address.
#[allow(clippy::missing_panics_doc)]
pub fn reverse_lookup_name_v4(address: Ipv4Addr) -> DomainName {
    let [a, b, c, d] = address.octets();
    // infallible: the generated string is always a valid name
    DomainName::from_dotted_string(&format!("{d}.{c}.{b}.{a}.in-addr.arpa.")).unwrap()
}

/// The `ip6.arpa` name for an IPv6 address: nibbles in reverse order.
/// The deprecated `ip6.int` tree is intentionally not supported.
#[allow(clippy::missing_panics_doc)]
pub fn reverse_lookup_name_v6(address: Ipv6Addr) -> DomainName {
    let mut name = String::with_capacity(72);
    for octet in address.octets().iter().rev() {
        name.push_str(&format!("{:x}.{:x}.", octet & 0x0f, octet >> 4));
    }
    name.push_str("ip6.arpa.");
    // infallible: the generated string is always a valid name
    DomainName::from_dotted_string(&name).unwrap()
}

/// The reverse-lookup name for either address family.
pub fn reverse_lookup_name(address: std::net::IpAddr) -> DomainName {
    match address {
        std::net::IpAddr::V4(v4) => reverse_lookup_name_v4(v4),
        std::net::IpAddr::V6(v6) => reverse_lookup_name_v6(v6),
    }
}

/// The next candidate host name after a collision: `foo` becomes
/// `foo-2`, `foo-2` becomes `foo-3`.  A suffix that is empty, not all
/// digits, or zero-led is not a counter.
pub fn alternative_host_name(s: &str) -> String {
    if let Some(idx) = s.rfind('-') {
        if let Some(n) = counter_suffix(&s[idx + 1..]) {
            return format!("{}-{}", &s[..idx], n + 1);
        }
    }
    format!("{s}-2")
}

/// The next candidate service name after a collision: `Web Server`
/// becomes `Web Server #2`, `Web Server #2` becomes `Web Server #3`.
pub fn alternative_service_name(s: &str) -> String {
    if let Some(idx) = s.rfind(" #") {
        if let Some(n) = counter_suffix(&s[idx + 2..]) {
            return format!("{} #{}", &s[..idx], n + 1);
        }
    }
    format!("{s} #2")
}

fn counter_suffix(suffix: &str) -> Option<u32> {
    if suffix.is_empty() || suffix.starts_with('0') || !suffix.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_service_types() {
        assert!(is_valid_service_type("_http._tcp"));
        assert!(is_valid_service_type("_ipp._tcp"));
        assert!(is_valid_service_type("_sleep-proxy._udp"));
        assert!(is_valid_service_type("_printer._sub._http._tcp"));
    }

    #[test]
    fn invalid_service_types() {
        assert!(!is_valid_service_type("http._tcp"));
        assert!(!is_valid_service_type("_http._sctp"));
        assert!(!is_valid_service_type("_http"));
        assert!(!is_valid_service_type("_way-too-long-for-a-type._tcp"));
        assert!(!is_valid_service_type("_a._b._http._tcp"));
    }

    #[test]
    fn service_name_instance_is_one_label() {
        let name = service_name("Dr. Smith", "_http._tcp", "local").unwrap();
        assert_eq!(5, name.labels.len());
        assert_eq!(b"Dr. Smith".as_slice(), &name.labels[0].octets()[..]);
        assert_eq!("Dr\\. Smith._http._tcp.local.", name.to_dotted_string());
    }

    #[test]
    fn service_name_rejects_bad_input() {
        assert_eq!(
            Err(Error::InvalidServiceType),
            service_name("Web", "_http._quic", "local")
        );
        assert_eq!(
            Err(Error::InvalidServiceName),
            service_name("", "_http._tcp", "local")
        );
    }

    #[test]
    fn reverse_v4() {
        assert_eq!(
            "5.0.0.10.in-addr.arpa.",
            reverse_lookup_name_v4(Ipv4Addr::new(10, 0, 0, 5)).to_dotted_string()
        );
    }

    #[test]
    fn reverse_v6_is_arpa_nibbles() {
        let name = reverse_lookup_name_v6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        let s = name.to_dotted_string();
        assert!(s.ends_with("ip6.arpa."));
        assert!(s.starts_with("1.0.0.0."));
        assert_eq!(34, name.labels.len());
    }

    #[test]
    fn alternative_host_names() {
        assert_eq!("fruit-2", alternative_host_name("fruit"));
        assert_eq!("fruit-3", alternative_host_name("fruit-2"));
        assert_eq!("fruit-10", alternative_host_name("fruit-9"));
        // a zero-led or non-numeric suffix is part of the name
        assert_eq!("fruit-07-2", alternative_host_name("fruit-07"));
        assert_eq!("fruit-x-2", alternative_host_name("fruit-x"));
        assert_eq!("--2", alternative_host_name("-"));
    }

    #[test]
    fn alternative_service_names() {
        assert_eq!("Files #2", alternative_service_name("Files"));
        assert_eq!("Files #3", alternative_service_name("Files #2"));
        assert_eq!("Files #100", alternative_service_name("Files #99"));
        assert_eq!("Files #0 #2", alternative_service_name("Files #0"));
        assert_eq!("Files # #2", alternative_service_name("Files #"));
    }

    #[test]
    fn alternative_names_terminate_in_one_step() {
        // applying once always yields a name the generator treats as
        // counted, so repeated collisions only bump the counter
        let once = alternative_service_name("Files");
        let twice = alternative_service_name(&once);
        assert_eq!("Files #2", once);
        assert_eq!("Files #3", twice);
    }
}
