//! The answering side of the engine: deferred, coalesced, rate
//! limited responses to questions heard on the link, plus the legacy
//! unicast reply shape for queriers that are not real mDNS speakers.

use bytes::{Bytes, BytesMut};
use rand::rngs::SmallRng;
use rand::Rng;
use slab::Slab;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mdns_types::protocol::types::*;

use crate::event::{IfIndex, Protocol};
use crate::server::Timeout;
use crate::timeq::{TimeEventId, TimeEventQueue};

/// Random defer before answering a shared question (RFC 6762
/// section 6), in milliseconds.
const DEFER_MIN_MS: u64 = 20;
const DEFER_MAX_MS: u64 = 120;

/// Defer when we are the sole authority or the querier asked for
/// unicast: answer almost immediately.
const FAST_DEFER_MAX_MS: u64 = 20;

/// The same record is not multicast more than once a second (RFC
/// 6762 section 6).
const RATE_LIMIT: Duration = Duration::from_secs(1);

/// TTL cap on legacy unicast replies (RFC 6762 section 6.7).
const LEGACY_TTL_MAX: u32 = 10;

/// Where a response is headed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResponseDest {
    Multicast,
    Unicast(SocketAddr),
}

#[derive(Debug)]
struct ResponseJob {
    records: Vec<ResourceRecord>,
    dest: ResponseDest,
    timer: TimeEventId,
}

/// The deferred answers of one interface.
#[derive(Debug)]
pub struct ResponseScheduler {
    iface: IfIndex,
    proto: Protocol,
    jobs: Slab<ResponseJob>,

    /// The one multicast packet currently pending; new multicast
    /// answers coalesce into it.
    pending_multicast: Option<usize>,

    /// When each record was last multicast, by identity.
    last_multicast: HashMap<(RecordKey, Bytes), Instant>,
}

impl ResponseScheduler {
    pub fn new(iface: IfIndex, proto: Protocol) -> Self {
        Self {
            iface,
            proto,
            jobs: Slab::new(),
            pending_multicast: None,
            last_multicast: HashMap::new(),
        }
    }

    /// Queue answers for emission after the protocol's random defer.
    /// `fast` selects the 0-20ms window used for unique-authority
    /// records and unicast-requested replies.
    pub fn schedule(
        &mut self,
        records: Vec<ResourceRecord>,
        dest: ResponseDest,
        fast: bool,
        now: Instant,
        timeq: &mut TimeEventQueue<Timeout>,
        rng: &mut SmallRng,
    ) {
        if records.is_empty() {
            return;
        }

        let due = now + defer(fast, rng);
        let is_multicast = dest == ResponseDest::Multicast;

        if is_multicast {
            if let Some(index) = self.pending_multicast {
                // coalesce into the pending packet, keeping the
                // earlier deadline
                let job = &mut self.jobs[index];
                for rr in records {
                    if !job.records.iter().any(|existing| existing.same_identity(&rr)) {
                        job.records.push(rr);
                    }
                }
                let earlier = timeq.deadline(job.timer).map_or(due, |at| at.min(due));
                timeq.update(job.timer, earlier);
                return;
            }
        }

        let index = self.jobs.vacant_key();
        let timer = timeq.schedule(
            due,
            Timeout::ResponseJob {
                iface: self.iface,
                proto: self.proto,
                job: index,
            },
        );
        self.jobs.insert(ResponseJob {
            records,
            dest,
            timer,
        });
        if is_multicast {
            self.pending_multicast = Some(index);
        }
    }

    /// A defer timer fired: emit the packet(s).
    ///
    /// Multicast packets apply the per-record rate limit here, at the
    /// last minute; records suppressed by it are silently dropped
    /// from the packet.
    pub fn handle_timer(
        &mut self,
        index: usize,
        now: Instant,
        budget: usize,
    ) -> Vec<(Option<SocketAddr>, BytesMut)> {
        let Some(job) = self.jobs.try_remove(index) else {
            return Vec::new();
        };
        if self.pending_multicast == Some(index) {
            self.pending_multicast = None;
        }

        let (records, dest) = match job.dest {
            ResponseDest::Multicast => {
                let mut kept = Vec::new();
                for rr in job.records {
                    if self.rate_limited(&rr, now) {
                        tracing::debug!(iface = %self.iface, proto = %self.proto, record = %rr, "rate limited, dropping from response");
                        continue;
                    }
                    self.note_multicast(&rr, now);
                    kept.push(rr);
                }
                (kept, None)
            }
            ResponseDest::Unicast(addr) => (job.records, Some(addr)),
        };

        if records.is_empty() {
            return Vec::new();
        }

        let mut message = Message::response(0);
        message.answers = records;
        match message.to_packets(budget) {
            Ok(packets) => packets.into_iter().map(|octets| (dest, octets)).collect(),
            Err(error) => {
                tracing::warn!(iface = %self.iface, proto = %self.proto, ?error, "could not serialise response");
                Vec::new()
            }
        }
    }

    /// Whether the rate limit forbids multicasting this record now.
    /// Goodbyes are never held back.
    pub fn rate_limited(&self, rr: &ResourceRecord, now: Instant) -> bool {
        if rr.ttl == 0 {
            return false;
        }
        match self.last_multicast.get(&identity(rr)) {
            Some(last) => now.saturating_duration_since(*last) < RATE_LIMIT,
            None => false,
        }
    }

    /// Stamp a record as having been multicast; announces and probes
    /// emitted elsewhere in the engine go through this too.
    pub fn note_multicast(&mut self, rr: &ResourceRecord, now: Instant) {
        if self.last_multicast.len() > 256 {
            self.last_multicast
                .retain(|_, last| now.saturating_duration_since(*last) < RATE_LIMIT);
        }
        self.last_multicast.insert(identity(rr), now);
    }

    /// Drop all pending jobs, cancelling their timers.
    pub fn clear(&mut self, timeq: &mut TimeEventQueue<Timeout>) {
        for (_, job) in &self.jobs {
            timeq.cancel(job.timer);
        }
        self.jobs.clear();
        self.pending_multicast = None;
        self.last_multicast.clear();
    }
}

fn identity(rr: &ResourceRecord) -> (RecordKey, Bytes) {
    (rr.key(), rr.data.canonical_rdata())
}

fn defer(fast: bool, rng: &mut SmallRng) -> Duration {
    if fast {
        Duration::from_millis(rng.gen_range(0..=FAST_DEFER_MAX_MS))
    } else {
        Duration::from_millis(rng.gen_range(DEFER_MIN_MS..=DEFER_MAX_MS))
    }
}

/// The reply to a legacy (source port != 5353) query: the query id
/// and question section echoed back, TTLs capped, no cache-flush
/// bits, sent unicast (RFC 6762 section 6.7).
pub fn legacy_reply(query: &Message, answers: &[ResourceRecord]) -> Message {
    let mut message = Message::response(query.header.id);
    message.questions = query.questions.clone();
    message.answers = answers
        .iter()
        .map(|rr| {
            let mut rr = rr.clone();
            rr.ttl = rr.ttl.min(LEGACY_TTL_MAX);
            rr.cache_flush = false;
            rr
        })
        .collect();
    message
}
