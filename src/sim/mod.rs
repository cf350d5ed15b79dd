//! Cooperative discrete-event runtime.
//!
//! Single-threaded: events are drawn from a priority queue ordered by virtual
//! time and delivered one at a time, so callbacks run to completion and no
//! state is ever shared across threads. Events scheduled for the same instant
//! fire in scheduling order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::net::{AppEvent, NetEvent, Network};

/// Identifies an application instance attached to the runtime.
pub type AppId = usize;

/// Handle for a scheduled event, usable with [`EventQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

/// Everything the event loop knows how to deliver.
#[derive(Debug)]
pub enum Event {
    /// Internal transport event (delivery, connect completion, ...).
    Net(NetEvent),
    /// Application timer scheduled through [`Ctx::schedule`].
    Timer { app: AppId, token: u64 },
}

#[derive(Debug)]
struct Scheduled {
    at_ns: i64,
    id: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at_ns == other.at_ns && self.id == other.id
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at_ns, self.id).cmp(&(other.at_ns, other.id))
    }
}

/// Virtual clock plus the pending event set.
#[derive(Debug, Default)]
pub struct EventQueue {
    now_ns: i64,
    heap: BinaryHeap<Reverse<Scheduled>>,
    next_id: u64,
    cancelled: HashSet<u64>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time in nanoseconds since the simulation epoch.
    pub fn now_ns(&self) -> i64 {
        self.now_ns
    }

    /// Schedules `event` to fire `delay_ns` from now. A zero delay fires after
    /// every event already queued for the current instant.
    pub fn schedule(&mut self, delay_ns: i64, event: Event) -> EventId {
        debug_assert!(delay_ns >= 0, "events cannot be scheduled in the past");
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse(Scheduled {
            at_ns: self.now_ns + delay_ns.max(0),
            id,
            event,
        }));
        EventId(id)
    }

    /// Cancels a previously scheduled event. Harmless if it already fired.
    pub fn cancel(&mut self, id: EventId) {
        self.cancelled.insert(id.0);
    }

    /// Pops the next live event, advancing the clock to its fire time.
    pub fn pop(&mut self) -> Option<(i64, Event)> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            debug_assert!(entry.at_ns >= self.now_ns);
            self.now_ns = entry.at_ns;
            return Some((entry.at_ns, entry.event));
        }
        None
    }

    /// Fire time of the next live event without popping it.
    pub fn peek_time(&mut self) -> Option<i64> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.cancelled.contains(&entry.id) {
                let id = entry.id;
                self.heap.pop();
                self.cancelled.remove(&id);
                continue;
            }
            return Some(entry.at_ns);
        }
        None
    }
}

/// Hands out independent, reproducible uniform random streams.
///
/// Every component that needs randomness draws from its own stream so that a
/// fixed scenario seed always replays the same run regardless of how many
/// other components consume random values.
#[derive(Debug, Clone, Copy)]
pub struct RngStreams {
    base_seed: u64,
}

impl RngStreams {
    pub fn new(base_seed: u64) -> Self {
        Self { base_seed }
    }

    /// Returns the stream with the given index.
    pub fn stream(&self, index: u64) -> SmallRng {
        // splitmix64 spreads consecutive indices across the seed space.
        let mut z = self.base_seed ^ index.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        SmallRng::seed_from_u64(z ^ (z >> 31))
    }
}

/// Execution context handed to application callbacks.
///
/// Callbacks never block; they issue non-blocking operations against the
/// transport, optionally schedule timers, and return.
pub struct Ctx<'a> {
    pub net: &'a mut Network,
    pub queue: &'a mut EventQueue,
    /// The application the current callback belongs to.
    pub app: AppId,
}

impl Ctx<'_> {
    pub fn now_ns(&self) -> i64 {
        self.queue.now_ns()
    }

    /// Schedules a timer for the current application.
    pub fn schedule(&mut self, delay_ns: i64, token: u64) -> EventId {
        self.queue.schedule(delay_ns, Event::Timer { app: self.app, token })
    }
}

/// Callback surface every simulated application implements.
pub trait Application {
    fn handle(&mut self, ctx: &mut Ctx<'_>, event: AppEvent);
}
