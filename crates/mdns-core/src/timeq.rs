//! The time-event queue every protocol timer runs through: probe
//! retries, announce repetitions, cache expiry, response defers,
//! query back-off.  A min-heap on absolute expiry time, with ties
//! broken by insertion order.

use priority_queue::PriorityQueue;
use slab::Slab;
use std::cmp::Reverse;
use std::time::Instant;

/// Handle to a scheduled event.  Generation-tagged: a handle kept
/// after its event fired or was cancelled is recognised as stale
/// rather than touching an unrelated event that reused the slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TimeEventId {
    index: usize,
    generation: u64,
}

/// A queue of `(absolute time, token)` pairs.
///
/// The embedding pops due tokens with [`TimeEventQueue::pop_due`] and
/// dispatches on them; handlers are free to schedule, update, and
/// cancel events - including re-scheduling the one that just fired -
/// since nothing is borrowed from the queue while a handler runs.
#[derive(Debug)]
pub struct TimeEventQueue<T> {
    events: Slab<(u64, T)>,

    /// INVARIANT: the keys in here are exactly the keys in `events`.
    queue: PriorityQueue<usize, Reverse<(Instant, u64)>>,

    next_generation: u64,

    /// Monotonic tie-breaker: equal deadlines fire in schedule order.
    next_seq: u64,
}

impl<T> Default for TimeEventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeEventQueue<T> {
    pub fn new() -> Self {
        Self {
            events: Slab::new(),
            queue: PriorityQueue::new(),
            next_generation: 0,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Arm an event at an absolute time.
    pub fn schedule(&mut self, at: Instant, token: T) -> TimeEventId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        let index = self.events.insert((generation, token));
        self.queue.push(index, Reverse((at, seq)));

        TimeEventId { index, generation }
    }

    /// Re-arm an event at a new time.  Returns false for a stale
    /// handle.  The event moves to the back of its new deadline's
    /// insertion order.
    pub fn update(&mut self, id: TimeEventId, at: Instant) -> bool {
        match self.events.get(id.index) {
            Some((generation, _)) if *generation == id.generation => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.queue.change_priority(&id.index, Reverse((at, seq)));
                true
            }
            _ => false,
        }
    }

    /// Disarm an event.  Returns false for a stale handle.
    pub fn cancel(&mut self, id: TimeEventId) -> bool {
        match self.events.get(id.index) {
            Some((generation, _)) if *generation == id.generation => {
                self.queue.remove(&id.index);
                self.events.remove(id.index);
                true
            }
            _ => false,
        }
    }

    /// The earliest armed deadline: what the event loop sleeps until.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|(_, Reverse((at, _)))| *at)
    }

    /// The deadline a specific event is armed for, if the handle is
    /// current.
    pub fn deadline(&self, id: TimeEventId) -> Option<Instant> {
        match self.events.get(id.index) {
            Some((generation, _)) if *generation == id.generation => self
                .queue
                .get_priority(&id.index)
                .map(|Reverse((at, _))| *at),
            _ => None,
        }
    }

    /// Take the next event due at or before `now`, in non-decreasing
    /// time order, ties in insertion order.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        match self.queue.peek() {
            Some((_, Reverse((at, _)))) if *at <= now => {
                let (index, _) = self.queue.pop().unwrap();
                let (_, token) = self.events.remove(index);
                Some(token)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fires_in_time_order() {
        let mut queue = TimeEventQueue::new();
        let base = Instant::now();

        queue.schedule(base + Duration::from_millis(30), "c");
        queue.schedule(base + Duration::from_millis(10), "a");
        queue.schedule(base + Duration::from_millis(20), "b");

        let now = base + Duration::from_secs(1);
        assert_eq!(Some("a"), queue.pop_due(now));
        assert_eq!(Some("b"), queue.pop_due(now));
        assert_eq!(Some("c"), queue.pop_due(now));
        assert_eq!(None, queue.pop_due(now));
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        let mut queue = TimeEventQueue::new();
        let at = Instant::now() + Duration::from_millis(10);

        for i in 0..10 {
            queue.schedule(at, i);
        }

        for i in 0..10 {
            assert_eq!(Some(i), queue.pop_due(at));
        }
    }

    #[test]
    fn nothing_fires_early() {
        let mut queue = TimeEventQueue::new();
        let base = Instant::now();

        queue.schedule(base + Duration::from_millis(50), ());
        assert_eq!(None, queue.pop_due(base));
        assert_eq!(None, queue.pop_due(base + Duration::from_millis(49)));
        assert_eq!(Some(()), queue.pop_due(base + Duration::from_millis(50)));
    }

    #[test]
    fn cancel_removes_event() {
        let mut queue = TimeEventQueue::new();
        let base = Instant::now();

        let keep = queue.schedule(base, "keep");
        let drop = queue.schedule(base, "drop");

        assert!(queue.cancel(drop));
        assert_eq!(Some("keep"), queue.pop_due(base));
        assert_eq!(None, queue.pop_due(base));

        // both handles are now stale
        assert!(!queue.cancel(drop));
        assert!(!queue.cancel(keep));
    }

    #[test]
    fn update_moves_deadline() {
        let mut queue = TimeEventQueue::new();
        let base = Instant::now();

        let id = queue.schedule(base + Duration::from_millis(10), "moved");
        queue.schedule(base + Duration::from_millis(20), "fixed");

        assert!(queue.update(id, base + Duration::from_millis(30)));
        assert_eq!(Some(base + Duration::from_millis(20)), queue.next_deadline());

        let now = base + Duration::from_secs(1);
        assert_eq!(Some("fixed"), queue.pop_due(now));
        assert_eq!(Some("moved"), queue.pop_due(now));
    }

    #[test]
    fn stale_handle_does_not_touch_reused_slot() {
        let mut queue = TimeEventQueue::new();
        let base = Instant::now();

        let old = queue.schedule(base, "old");
        assert_eq!(Some("old"), queue.pop_due(base));

        // the slab slot is reused by a fresh event
        let _new = queue.schedule(base + Duration::from_millis(5), "new");
        assert!(!queue.cancel(old));
        assert!(!queue.update(old, base));
        assert_eq!(Some("new"), queue.pop_due(base + Duration::from_millis(5)));
    }

    #[test]
    fn handler_may_reschedule_while_draining() {
        let mut queue = TimeEventQueue::new();
        let base = Instant::now();
        let now = base + Duration::from_millis(100);

        queue.schedule(base, 0u32);

        // a "handler" that re-schedules a successor, still due, twice
        let mut fired = Vec::new();
        while let Some(n) = queue.pop_due(now) {
            fired.push(n);
            if n < 2 {
                queue.schedule(base + Duration::from_millis(u64::from(n) + 1), n + 1);
            }
        }

        assert_eq!(vec![0, 1, 2], fired);
        assert_eq!(None, queue.next_deadline());
    }

    #[test]
    fn next_deadline_tracks_earliest() {
        let mut queue: TimeEventQueue<()> = TimeEventQueue::new();
        let base = Instant::now();

        assert_eq!(None, queue.next_deadline());
        queue.schedule(base + Duration::from_millis(20), ());
        queue.schedule(base + Duration::from_millis(10), ());
        assert_eq!(Some(base + Duration::from_millis(10)), queue.next_deadline());
    }
}
