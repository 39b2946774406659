//! Clock and one-shot callback scheduling.
//!
//! The transport never sleeps: every wait is a deadline that the owner of the
//! stack turns into a call back into it. `EventQueue` is a virtual clock that
//! delivers scheduled events in time order, with ties broken by scheduling
//! order so runs are reproducible.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

pub trait Scheduler<E> {
    fn now(&self) -> Instant;
    fn schedule(&mut self, delay: Duration, event: E) -> TimerHandle;
    /// Returns false if the event already fired or was cancelled.
    fn cancel(&mut self, handle: TimerHandle) -> bool;
}

#[derive(Debug)]
struct Scheduled<E> {
    at: Instant,
    handle: TimerHandle,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, reverse so the earliest pops first.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.handle.cmp(&self.handle))
    }
}

#[derive(Debug)]
pub struct EventQueue<E> {
    now: Instant,
    pending: BinaryHeap<Scheduled<E>>,
    cancelled: HashSet<TimerHandle>,
    next_handle: u64,
}

impl<E> EventQueue<E> {
    pub fn new(start: Instant) -> Self {
        Self {
            now: start,
            pending: BinaryHeap::new(),
            cancelled: HashSet::new(),
            next_handle: 0,
        }
    }

    /// Times in the past are delivered at the current time.
    pub fn schedule_at(&mut self, at: Instant, event: E) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        self.pending.push(Scheduled {
            at: at.max(self.now),
            handle,
            event,
        });
        handle
    }

    fn discard_cancelled(&mut self) {
        while let Some(head) = self.pending.peek() {
            if !self.cancelled.remove(&head.handle) {
                break;
            }
            self.pending.pop();
        }
    }

    pub fn peek_time(&mut self) -> Option<Instant> {
        self.discard_cancelled();
        self.pending.peek().map(|head| head.at)
    }

    /// Advances the clock to the next event and returns it.
    pub fn pop(&mut self) -> Option<(Instant, E)> {
        self.discard_cancelled();
        let next = self.pending.pop()?;
        self.now = next.at;
        Some((next.at, next.event))
    }

    /// Like `pop`, but leaves events after `deadline` queued and moves the clock to `deadline`.
    pub fn pop_until(&mut self, deadline: Instant) -> Option<(Instant, E)> {
        match self.peek_time() {
            Some(at) if at <= deadline => self.pop(),
            _ => {
                self.now = self.now.max(deadline);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Scheduler<E> for EventQueue<E> {
    fn now(&self) -> Instant {
        self.now
    }

    fn schedule(&mut self, delay: Duration, event: E) -> TimerHandle {
        let at = self.now + delay;
        self.schedule_at(at, event)
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        if handle.0 >= self.next_handle {
            return false;
        }
        if !self.pending.iter().any(|s| s.handle == handle) {
            return false;
        }
        self.cancelled.insert(handle)
    }
}
