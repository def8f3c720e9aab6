//! The per-interface cache of records observed on the link, with
//! TTL-driven expiry, cache-flush handling, goodbye handling, and the
//! maintenance queries that try to refresh a record before it dies.

use rand::rngs::SmallRng;
use rand::Rng;
use slab::Slab;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use mdns_types::protocol::types::*;

use crate::event::{IfIndex, Protocol};
use crate::server::Timeout;
use crate::timeq::TimeEventQueue;

/// Upper bound on records held per interface cache.  Overflow evicts
/// the entry closest to expiry.
pub const CACHE_RECORDS_MAX: usize = 4096;

/// How long a record marked by the cache-flush bit survives unless it
/// is re-asserted (RFC 6762 section 10.2).
const FLUSH_DELAY: Duration = Duration::from_secs(1);

/// How long after a goodbye the record is actually dropped.
const GOODBYE_DELAY: Duration = Duration::from_secs(1);

/// Percentages of the TTL at which a cache-maintenance query goes
/// out if no refresh has arrived (RFC 6762 section 5.2).
const MAINTENANCE_STAGES: [u32; 4] = [80, 85, 90, 95];

/// What happened in the cache, for the browser layer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CacheDelta {
    New(ResourceRecord),
    Remove(ResourceRecord),
}

/// What a fired cache timer asks the server to do.
#[derive(Debug, Default)]
pub struct CacheTimerOutcome {
    /// Ask the link to refresh this key before its records expire.
    pub maintenance_query: Option<KeyPattern>,

    /// Records that left the cache.
    pub deltas: Vec<CacheDelta>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum EntryState {
    Valid,

    /// Superseded by a cache-flush assertion; dies at `expires`
    /// unless re-asserted first.
    FlushPending,

    /// Said goodbye; dies at `expires`, and is already invisible to
    /// lookups.
    GoodbyePending,
}

#[derive(Debug)]
struct CacheEntry {
    /// The record as received; `ttl` is the original lifetime, the
    /// absolute deadline lives in `expires`.
    record: ResourceRecord,

    /// Which peer asserted the record.
    origin: IpAddr,

    arrived: Instant,
    expires: Instant,
    state: EntryState,

    /// Index of the next entry of `MAINTENANCE_STAGES` to run.
    stage: usize,

    timer: crate::timeq::TimeEventId,
}

impl CacheEntry {
    fn is_live(&self) -> bool {
        self.state != EntryState::GoodbyePending
    }

    /// The remaining lifetime, in whole seconds.
    fn remaining(&self, now: Instant) -> u32 {
        self.expires
            .saturating_duration_since(now)
            .as_secs()
            .try_into()
            .unwrap_or(u32::MAX)
    }

    /// The record with its TTL rewritten to the remaining lifetime.
    fn to_record(&self, now: Instant) -> ResourceRecord {
        let mut record = self.record.clone();
        record.ttl = self.remaining(now);
        record
    }
}

/// The records one interface has heard, indexed by key.
///
/// INVARIANT: the indices in `by_key` are exactly the keys of
/// `entries`, and every entry is listed under its own record key.
#[derive(Debug)]
pub struct RecordCache {
    iface: IfIndex,
    proto: Protocol,
    entries: Slab<CacheEntry>,
    by_key: HashMap<RecordKey, Vec<usize>>,
}

impl RecordCache {
    pub fn new(iface: IfIndex, proto: Protocol) -> Self {
        Self {
            iface,
            proto,
            entries: Slab::new(),
            by_key: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All live records matching a pattern, with remaining TTLs.
    pub fn matching(&self, pattern: &KeyPattern, now: Instant) -> Vec<ResourceRecord> {
        let mut records = Vec::new();
        for (key, indices) in &self.by_key {
            if pattern.matches(key) {
                for index in indices {
                    let entry = &self.entries[*index];
                    if entry.is_live() {
                        records.push(entry.to_record(now));
                    }
                }
            }
        }
        records
    }

    /// The known-answer list for an outgoing question: matching live
    /// records whose remaining TTL is at least half the original (RFC
    /// 6762 section 7.1).
    pub fn known_answers(&self, pattern: &KeyPattern, now: Instant) -> Vec<ResourceRecord> {
        let mut records = Vec::new();
        for (key, indices) in &self.by_key {
            if pattern.matches(key) {
                for index in indices {
                    let entry = &self.entries[*index];
                    if entry.is_live() && u64::from(entry.remaining(now)) * 2 >= u64::from(entry.record.ttl)
                    {
                        records.push(entry.to_record(now));
                    }
                }
            }
        }
        records
    }

    /// Process one record from a response seen on the link.
    pub fn handle_response_record(
        &mut self,
        rr: &ResourceRecord,
        origin: IpAddr,
        now: Instant,
        timeq: &mut TimeEventQueue<Timeout>,
        rng: &mut SmallRng,
    ) -> Vec<CacheDelta> {
        let key = rr.key();
        let mut deltas = Vec::new();

        if rr.ttl == 0 {
            // a goodbye: drop the record in a second, exactly once
            if let Some(indices) = self.by_key.get(&key) {
                for index in indices.clone() {
                    let iface = self.iface;
                    let proto = self.proto;
                    let entry = &mut self.entries[index];
                    if entry.record.data == rr.data && entry.is_live() {
                        entry.state = EntryState::GoodbyePending;
                        entry.expires = now + GOODBYE_DELAY;
                        if !timeq.update(entry.timer, entry.expires) {
                            entry.timer = timeq.schedule(
                                entry.expires,
                                Timeout::CacheEntry {
                                    iface,
                                    proto,
                                    entry: index,
                                },
                            );
                        }
                    }
                }
            }
            return deltas;
        }

        if rr.cache_flush {
            // the sender asserts unique ownership: everything else it
            // previously told us about this key dies in a second
            // unless re-asserted (RFC 6762 section 10.2)
            if let Some(indices) = self.by_key.get(&key) {
                for index in indices.clone() {
                    let entry = &mut self.entries[index];
                    if entry.origin == origin
                        && entry.record.data != rr.data
                        && entry.state == EntryState::Valid
                    {
                        entry.state = EntryState::FlushPending;
                        entry.expires = now + FLUSH_DELAY;
                        timeq.update(entry.timer, entry.expires);
                    }
                }
            }
        }

        // refresh in place, or insert and report NEW.  The flush bit
        // is consumed here: stored records never carry it.
        if let Some(index) = self.find(&key, &rr.data) {
            let expires = now + Duration::from_secs(u64::from(rr.ttl));
            let entry = &mut self.entries[index];
            entry.record.ttl = rr.ttl;
            entry.origin = origin;
            entry.arrived = now;
            entry.expires = expires;
            entry.state = EntryState::Valid;
            entry.stage = 0;
            let next = next_deadline_for(now, rr.ttl, 0, rng);
            timeq.update(entry.timer, next);
        } else {
            if self.entries.len() >= CACHE_RECORDS_MAX {
                if let Some(delta) = self.evict_nearest_expiry(timeq, now) {
                    deltas.push(delta);
                }
            }

            let vacant = self.entries.vacant_key();
            let timer = timeq.schedule(
                next_deadline_for(now, rr.ttl, 0, rng),
                Timeout::CacheEntry {
                    iface: self.iface,
                    proto: self.proto,
                    entry: vacant,
                },
            );
            let mut stored = rr.clone();
            stored.cache_flush = false;
            let index = self.entries.insert(CacheEntry {
                record: stored.clone(),
                origin,
                arrived: now,
                expires: now + Duration::from_secs(u64::from(rr.ttl)),
                state: EntryState::Valid,
                stage: 0,
                timer,
            });
            self.by_key.entry(key).or_default().push(index);

            deltas.push(CacheDelta::New(stored));
        }

        deltas
    }

    /// A cache timer fired for `index`.
    pub fn handle_timer(
        &mut self,
        index: usize,
        now: Instant,
        timeq: &mut TimeEventQueue<Timeout>,
        rng: &mut SmallRng,
    ) -> CacheTimerOutcome {
        let mut outcome = CacheTimerOutcome::default();
        let Some(entry) = self.entries.get_mut(index) else {
            return outcome;
        };

        match entry.state {
            EntryState::FlushPending | EntryState::GoodbyePending => {
                let record = entry.to_record(now);
                if let Some(delta) = self.remove(index, record, true, now) {
                    outcome.deltas.push(delta);
                }
            }
            EntryState::Valid => {
                if entry.stage < MAINTENANCE_STAGES.len() && now < entry.expires {
                    // ask the link to refresh this record
                    outcome.maintenance_query = Some(KeyPattern {
                        name: entry.record.name.clone(),
                        qclass: QueryClass::Record(entry.record.rclass),
                        qtype: QueryType::Record(entry.record.data.rtype()),
                    });
                    entry.stage += 1;
                    let next = if entry.stage < MAINTENANCE_STAGES.len() {
                        next_deadline_for(entry.arrived, entry.record.ttl, entry.stage, rng)
                    } else {
                        entry.expires
                    };
                    entry.timer = timeq.schedule(
                        next.max(now),
                        Timeout::CacheEntry {
                            iface: self.iface,
                            proto: self.proto,
                            entry: index,
                        },
                    );
                } else {
                    // no refresh arrived: the record is gone
                    let record = entry.to_record(now);
                    if let Some(delta) = self.remove(index, record, true, now) {
                        outcome.deltas.push(delta);
                    }
                }
            }
        }

        outcome
    }

    /// Drop everything, e.g. because the interface went away.
    pub fn clear(&mut self, now: Instant, timeq: &mut TimeEventQueue<Timeout>) -> Vec<CacheDelta> {
        let mut deltas = Vec::new();
        let indices: Vec<usize> = self.entries.iter().map(|(index, _)| index).collect();
        for index in indices {
            let entry = &self.entries[index];
            let live = entry.is_live();
            let record = entry.to_record(now);
            timeq.cancel(entry.timer);
            if let Some(delta) = self.remove(index, record, live, now) {
                deltas.push(delta);
            }
        }
        deltas
    }

    fn find(&self, key: &RecordKey, data: &RecordData) -> Option<usize> {
        self.by_key.get(key).and_then(|indices| {
            indices
                .iter()
                .copied()
                .find(|index| self.entries[*index].record.data == *data)
        })
    }

    fn remove(
        &mut self,
        index: usize,
        record: ResourceRecord,
        emit_remove: bool,
        _now: Instant,
    ) -> Option<CacheDelta> {
        let entry = self.entries.remove(index);
        let key = entry.record.key();
        if let Some(indices) = self.by_key.get_mut(&key) {
            indices.retain(|i| *i != index);
            if indices.is_empty() {
                self.by_key.remove(&key);
            }
        }

        if emit_remove {
            Some(CacheDelta::Remove(record))
        } else {
            None
        }
    }

    fn evict_nearest_expiry(
        &mut self,
        timeq: &mut TimeEventQueue<Timeout>,
        now: Instant,
    ) -> Option<CacheDelta> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.expires)
            .map(|(index, _)| index)?;
        let entry = &self.entries[victim];
        let live = entry.is_live();
        let record = entry.to_record(now);
        timeq.cancel(entry.timer);
        tracing::debug!(iface = %self.iface, proto = %self.proto, %record, "cache full, evicting");
        self.remove(victim, record, live, now)
    }
}

/// When the timer for maintenance stage `stage` should fire: the
/// stage's percentage of the TTL past arrival, plus up to 2% jitter.
fn next_deadline_for(arrived: Instant, ttl: u32, stage: usize, rng: &mut SmallRng) -> Instant {
    let ttl_millis = u64::from(ttl) * 1000;
    let point = ttl_millis * u64::from(MAINTENANCE_STAGES[stage]) / 100;
    let jitter = if ttl_millis >= 100 {
        rng.gen_range(0..=ttl_millis / 50)
    } else {
        0
    };
    arrived + Duration::from_millis(point + jitter)
}
