//! The DNS message format used on the wire, with the Multicast DNS
//! extensions of RFC 6762: the cache-flush bit on resource records,
//! the unicast-response bit on questions, and size-budgeted packet
//! assembly with rollback.

pub mod deserialise;
pub mod serialise;
pub mod types;
