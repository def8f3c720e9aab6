//! The outgoing-question side of the engine: one job per key
//! pattern, emitting immediately and then backing off exponentially,
//! with known-answer suppression from the cache, truncated
//! continuation packets, and suppression of questions the link has
//! just heard from someone else.

use bytes::BytesMut;
use rand::rngs::SmallRng;
use rand::Rng;
use slab::Slab;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use mdns_types::protocol::serialise::WritableBuffer;
use mdns_types::protocol::types::*;

use crate::cache::RecordCache;
use crate::event::{IfIndex, Protocol};
use crate::server::Timeout;
use crate::timeq::{TimeEventId, TimeEventQueue};

/// First re-query interval; doubles on every departure.
const INTERVAL_MIN: Duration = Duration::from_secs(1);

/// Back-off ceiling (RFC 6762 section 5.2).
const INTERVAL_MAX: Duration = Duration::from_secs(3600);

/// Jitter applied to every scheduled departure, in milliseconds.
const JITTER_MIN_MS: u64 = 20;
const JITTER_MAX_MS: u64 = 120;

/// A truncated known-answer list continues this long after the first
/// packet (RFC 6762 section 7.2).
const FOLLOW_UP_MIN_MS: u64 = 400;
const FOLLOW_UP_MAX_MS: u64 = 500;

/// A question someone else multicast within this window suppresses
/// our own identical question (RFC 6762 section 7.3).
const DUPLICATE_WINDOW: Duration = Duration::from_secs(1);

/// What a fired query timer produced.
#[derive(Debug, Default)]
pub struct QueryTimerOutcome {
    /// Zero or one packet; zero when the question was suppressed.
    pub packets: Vec<BytesMut>,

    /// This was the job's first departure, suppressed or not; the
    /// browser layer uses it to report the cache as exhausted.
    pub first_departure: bool,

    pub pattern: Option<KeyPattern>,
}

#[derive(Debug)]
struct QueryJob {
    pattern: KeyPattern,
    unicast_response: bool,

    /// How many subscribers share this job.
    refs: usize,

    /// Gap to the next departure after the upcoming one.
    interval: Duration,

    timer: TimeEventId,

    /// Known answers that did not fit the last packet, awaiting a
    /// follow-up.
    pending_known_answers: Vec<ResourceRecord>,

    /// The armed continuation timer, if the last packet truncated.
    /// INVARIANT: `Some` exactly when `pending_known_answers` is
    /// non-empty, so retiring the job can always disarm it.
    follow_up: Option<TimeEventId>,

    departed_once: bool,

    /// Emit once and retire; used for cache-maintenance queries.
    /// Retirement waits for any pending continuation to drain.
    one_shot: bool,
}

/// The query jobs of one interface.
#[derive(Debug)]
pub struct QueryScheduler {
    iface: IfIndex,
    proto: Protocol,
    jobs: Slab<QueryJob>,

    /// INVARIANT: maps each live job's pattern to its index, and
    /// nothing else.
    by_pattern: HashMap<KeyPattern, usize>,

    /// When the link last heard each question from a peer.
    peer_questions: HashMap<KeyPattern, Instant>,
}

impl QueryScheduler {
    pub fn new(iface: IfIndex, proto: Protocol) -> Self {
        Self {
            iface,
            proto,
            jobs: Slab::new(),
            by_pattern: HashMap::new(),
            peer_questions: HashMap::new(),
        }
    }

    /// Subscribe to a pattern.  The first departure is immediate;
    /// subsequent ones back off.  Subscriptions to the same pattern
    /// share one job.
    pub fn add_job(
        &mut self,
        pattern: &KeyPattern,
        unicast_response: bool,
        now: Instant,
        timeq: &mut TimeEventQueue<Timeout>,
    ) -> usize {
        if let Some(index) = self.by_pattern.get(pattern) {
            let job = &mut self.jobs[*index];
            job.refs += 1;
            job.unicast_response |= unicast_response;
            return *index;
        }

        let index = self.jobs.vacant_key();
        let timer = timeq.schedule(
            now,
            Timeout::QueryJob {
                iface: self.iface,
                proto: self.proto,
                job: index,
            },
        );
        self.jobs.insert(QueryJob {
            pattern: pattern.clone(),
            unicast_response,
            refs: 1,
            interval: INTERVAL_MIN,
            timer,
            pending_known_answers: Vec::new(),
            follow_up: None,
            departed_once: false,
            one_shot: false,
        });
        self.by_pattern.insert(pattern.clone(), index);
        index
    }

    /// Drop one subscription to a job.
    pub fn remove_job(&mut self, index: usize, timeq: &mut TimeEventQueue<Timeout>) {
        let Some(job) = self.jobs.get_mut(index) else {
            return;
        };
        job.refs -= 1;
        if job.refs == 0 {
            self.retire(index, timeq);
        }
    }

    /// Remove a job and disarm both its timers, so no stale token can
    /// fire against a reused slot.
    fn retire(&mut self, index: usize, timeq: &mut TimeEventQueue<Timeout>) {
        let job = self.jobs.remove(index);
        timeq.cancel(job.timer);
        if let Some(follow_up) = job.follow_up {
            timeq.cancel(follow_up);
        }
        self.by_pattern.remove(&job.pattern);
    }

    /// Ask the link once about a key, soon; used by the cache to
    /// refresh records nearing expiry.  A standing job for the same
    /// pattern makes this a no-op.
    pub fn one_shot(
        &mut self,
        pattern: &KeyPattern,
        now: Instant,
        timeq: &mut TimeEventQueue<Timeout>,
        rng: &mut SmallRng,
    ) {
        if self.by_pattern.contains_key(pattern) {
            return;
        }

        let index = self.jobs.vacant_key();
        let timer = timeq.schedule(
            now + jitter(rng),
            Timeout::QueryJob {
                iface: self.iface,
                proto: self.proto,
                job: index,
            },
        );
        self.jobs.insert(QueryJob {
            pattern: pattern.clone(),
            unicast_response: false,
            refs: 1,
            interval: INTERVAL_MIN,
            timer,
            pending_known_answers: Vec::new(),
            follow_up: None,
            departed_once: false,
            one_shot: true,
        });
        self.by_pattern.insert(pattern.clone(), index);
    }

    /// Note a question some other host just multicast.
    pub fn on_peer_question(&mut self, pattern: &KeyPattern, now: Instant) {
        if self.peer_questions.len() > 64 {
            self.peer_questions
                .retain(|_, last| now.saturating_duration_since(*last) < DUPLICATE_WINDOW);
        }
        self.peer_questions.insert(pattern.clone(), now);
    }

    fn duplicate_suppressed(&self, job: &QueryJob, now: Instant) -> bool {
        if job.unicast_response {
            return false;
        }
        match self.peer_questions.get(&job.pattern) {
            Some(last) => now.saturating_duration_since(*last) < DUPLICATE_WINDOW,
            None => false,
        }
    }

    /// A departure timer fired.
    pub fn handle_timer(
        &mut self,
        index: usize,
        now: Instant,
        cache: &RecordCache,
        timeq: &mut TimeEventQueue<Timeout>,
        rng: &mut SmallRng,
        budget: usize,
    ) -> QueryTimerOutcome {
        let mut outcome = QueryTimerOutcome::default();
        let Some(job) = self.jobs.get(index) else {
            return outcome;
        };

        let suppressed = self.duplicate_suppressed(job, now);
        let job = &mut self.jobs[index];
        outcome.first_departure = !job.departed_once;
        outcome.pattern = Some(job.pattern.clone());
        job.departed_once = true;

        if suppressed {
            tracing::debug!(iface = %self.iface, proto = %self.proto, pattern = %job.pattern, "question suppressed, peer just asked it");
        } else {
            let question = job.pattern.to_question(job.unicast_response);
            let known_answers = cache.known_answers(&job.pattern, now);
            let (packet, leftover) = build_query_packet(&question, &known_answers, budget);
            outcome.packets.push(packet);

            // a fresh departure carries the whole current known-answer
            // list, superseding any continuation still pending
            if let Some(old) = job.follow_up.take() {
                timeq.cancel(old);
                job.pending_known_answers.clear();
            }

            if !leftover.is_empty() {
                job.pending_known_answers = leftover;
                job.follow_up = Some(timeq.schedule(
                    now + Duration::from_millis(rng.gen_range(FOLLOW_UP_MIN_MS..=FOLLOW_UP_MAX_MS)),
                    Timeout::QueryFollowUp {
                        iface: self.iface,
                        proto: self.proto,
                        job: index,
                    },
                ));
            }
        }

        if job.one_shot {
            // a pending continuation keeps the job alive; the
            // follow-up handler retires it once the leftovers drain
            if job.pending_known_answers.is_empty() {
                self.retire(index, timeq);
            }
        } else {
            let next = now + job.interval + jitter(rng);
            job.interval = (job.interval * 2).min(INTERVAL_MAX);
            job.timer = timeq.schedule(
                next,
                Timeout::QueryJob {
                    iface: self.iface,
                    proto: self.proto,
                    job: index,
                },
            );
        }

        outcome
    }

    /// A follow-up timer fired: send the known answers that did not
    /// fit, possibly truncating again.
    pub fn handle_follow_up(
        &mut self,
        index: usize,
        now: Instant,
        timeq: &mut TimeEventQueue<Timeout>,
        rng: &mut SmallRng,
        budget: usize,
    ) -> Vec<BytesMut> {
        let Some(job) = self.jobs.get_mut(index) else {
            return Vec::new();
        };
        job.follow_up = None;
        if job.pending_known_answers.is_empty() {
            return Vec::new();
        }

        let known_answers = std::mem::take(&mut job.pending_known_answers);
        let (packet, leftover) = build_follow_up_packet(&known_answers, budget);

        if !leftover.is_empty() {
            job.pending_known_answers = leftover;
            job.follow_up = Some(timeq.schedule(
                now + Duration::from_millis(rng.gen_range(FOLLOW_UP_MIN_MS..=FOLLOW_UP_MAX_MS)),
                Timeout::QueryFollowUp {
                    iface: self.iface,
                    proto: self.proto,
                    job: index,
                },
            ));
        } else if job.one_shot {
            self.retire(index, timeq);
        }

        vec![packet]
    }

    /// Drop all jobs and history, cancelling their timers.
    pub fn clear(&mut self, timeq: &mut TimeEventQueue<Timeout>) {
        for (_, job) in &self.jobs {
            timeq.cancel(job.timer);
            if let Some(follow_up) = job.follow_up {
                timeq.cancel(follow_up);
            }
        }
        self.jobs.clear();
        self.by_pattern.clear();
        self.peer_questions.clear();
    }
}

fn jitter(rng: &mut SmallRng) -> Duration {
    Duration::from_millis(rng.gen_range(JITTER_MIN_MS..=JITTER_MAX_MS))
}

/// Build a query packet: the question plus as many known answers as
/// fit the budget.  Overflow sets TC and returns the leftovers.
fn build_query_packet(
    question: &Question,
    known_answers: &[ResourceRecord],
    budget: usize,
) -> (BytesMut, Vec<ResourceRecord>) {
    let mut buffer = WritableBuffer::with_limit(budget);
    Message::query().header.serialise(&mut buffer);
    buffer.write_u16(1);
    buffer.write_u16(0);
    buffer.write_u16(0);
    buffer.write_u16(0);

    // a bare question always fits any sane budget
    let _ = question.serialise(&mut buffer);

    let (ancount, leftover) = append_answers(&mut buffer, known_answers);
    buffer.set_u16_at(6, ancount);
    if !leftover.is_empty() {
        buffer.or_u8_at(2, HEADER_MASK_TC);
    }

    (buffer.octets, leftover)
}

/// Build a known-answer continuation packet: no questions, just
/// answers.
fn build_follow_up_packet(
    known_answers: &[ResourceRecord],
    budget: usize,
) -> (BytesMut, Vec<ResourceRecord>) {
    let mut buffer = WritableBuffer::with_limit(budget);
    Message::query().header.serialise(&mut buffer);
    buffer.write_u16(0);
    buffer.write_u16(0);
    buffer.write_u16(0);
    buffer.write_u16(0);

    let (ancount, leftover) = append_answers(&mut buffer, known_answers);
    buffer.set_u16_at(6, ancount);
    if !leftover.is_empty() {
        buffer.or_u8_at(2, HEADER_MASK_TC);
    }

    (buffer.octets, leftover)
}

fn append_answers(
    buffer: &mut WritableBuffer,
    records: &[ResourceRecord],
) -> (u16, Vec<ResourceRecord>) {
    let mut count = 0;
    for (i, rr) in records.iter().enumerate() {
        if rr.serialise(buffer).is_err() {
            return (count, records[i..].to_vec());
        }
        count += 1;
    }
    (count, Vec::new())
}
