//! The Multicast DNS / DNS-SD protocol engine.
//!
//! This crate performs no I/O.  The embedding event loop feeds
//! incoming datagrams to [`server::Server::handle_packet`], fires
//! timers via [`server::Server::handle_timeout`] using
//! [`server::Server::next_timeout`] as its sleep deadline, and drains
//! outgoing datagrams and subscriber events with
//! [`server::Server::poll_transmit`] and
//! [`server::Server::poll_event`].  All entry points take the current
//! time explicitly, so tests drive the whole engine on a virtual
//! clock.

#![warn(clippy::pedantic)]
// False positives for `bytes::Bytes`
#![allow(clippy::mutable_key_type)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod browse;
pub mod cache;
pub mod entry;
pub mod event;
pub mod query;
pub mod resolve;
pub mod respond;
pub mod server;
pub mod timeq;
