// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

// Spec: a fixed-size table of eight callback sources (main loop, VIC raster,
// VIC redraw, frame, CIA1 timer A/B, CIA2 timer A/B), kept sorted by absolute
// deadline through a singly-linked free-index chain anchored by a sentinel
// at index 0. Since there are only eight sources a linear scan on insert
// beats any general-purpose heap, both in code size and in practice.

/// Number of distinct callback sources the scheduler knows about.
pub const NUM_SOURCES: usize = 8;

const SENTINEL: usize = 0;

/// Fixed enumeration of callback sources. The discriminants double as slot
/// indices into the scheduler's internal tables (slot 0 is the sentinel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Main = 1,
    Raster = 2,
    Redraw = 3,
    Frame = 4,
    Timer1A = 5,
    Timer1B = 6,
    Timer2A = 7,
    Timer2B = 8,
}

/// A scheduler callback. Invoked with the scheduler itself so it may
/// re-register (e.g. a raster callback scheduling next line's callback).
/// Any other component state the callback needs is captured by the closure.
pub type Callback = Box<dyn FnMut(&mut Scheduler)>;

pub struct Scheduler {
    next: [usize; NUM_SOURCES + 1],
    deadline: [i64; NUM_SOURCES + 1],
    callback: Vec<Option<Callback>>,
    now: i64,
    time_left: i64,
}

impl Scheduler {
    pub fn new() -> Self {
        let mut callback = Vec::with_capacity(NUM_SOURCES + 1);
        for _ in 0..=NUM_SOURCES {
            callback.push(None);
        }
        Scheduler {
            next: [SENTINEL; NUM_SOURCES + 1],
            deadline: [0; NUM_SOURCES + 1],
            callback,
            now: 0,
            time_left: i64::max_value(),
        }
    }

    /// Current absolute cycle count.
    pub fn clock(&self) -> i64 {
        self.now
    }

    /// Cycles remaining until the earliest active deadline. The CPU consumes
    /// this after each instruction via `advance`.
    pub fn time_left(&self) -> i64 {
        self.time_left
    }

    /// Register `callback` to fire at `absolute_deadline`. Passing `None`
    /// cancels any scheduled entry for `source`.
    pub fn register(&mut self, source: Source, callback: Option<Callback>, absolute_deadline: i64) {
        let idx = source as usize;
        self.splice_out(idx);
        self.deadline[idx] = absolute_deadline;
        self.callback[idx] = callback;
        if self.callback[idx].is_some() {
            self.insert_sorted(idx, absolute_deadline);
        }
        self.recompute_time_left();
    }

    /// Convenience for `register(source, None, _)`.
    pub fn cancel(&mut self, source: Source) {
        self.register(source, None, 0);
    }

    pub fn is_active(&self, source: Source) -> bool {
        self.callback[source as usize].is_some()
    }

    pub fn deadline_of(&self, source: Source) -> i64 {
        self.deadline[source as usize]
    }

    /// Charge `n` cycles, consumed by the CPU after every instruction
    /// (including page-crossing penalties and bad-line surcharges).
    pub fn advance(&mut self, n: i64) {
        self.now += n;
        self.time_left -= n;
    }

    /// Fire all callbacks whose deadline has been reached, in non-decreasing
    /// deadline order. A callback may register new work at any deadline; if
    /// that deadline has already passed it fires before this call returns.
    pub fn drain(&mut self) {
        while self.time_left <= 0 {
            let head = self.next[SENTINEL];
            if head == SENTINEL {
                // Nothing scheduled: stop decrementing into the past.
                self.time_left = i64::max_value();
                break;
            }
            let head_deadline = self.deadline[head];
            let successor = self.next[head];
            self.next[SENTINEL] = successor;
            self.next[head] = SENTINEL;
            self.time_left = if successor != SENTINEL {
                self.time_left + (self.deadline[successor] - head_deadline)
            } else {
                i64::max_value()
            };
            if let Some(mut cb) = self.callback[head].take() {
                cb(self);
            }
        }
    }

    fn splice_out(&mut self, idx: usize) {
        let mut prev = SENTINEL;
        let mut cur = self.next[SENTINEL];
        while cur != SENTINEL {
            if cur == idx {
                self.next[prev] = self.next[cur];
                self.next[cur] = SENTINEL;
                return;
            }
            prev = cur;
            cur = self.next[cur];
        }
    }

    fn insert_sorted(&mut self, idx: usize, deadline: i64) {
        let mut prev = SENTINEL;
        let mut cur = self.next[SENTINEL];
        while cur != SENTINEL && self.deadline[cur] <= deadline {
            prev = cur;
            cur = self.next[cur];
        }
        self.next[idx] = cur;
        self.next[prev] = idx;
    }

    fn recompute_time_left(&mut self) {
        let head = self.next[SENTINEL];
        self.time_left = if head != SENTINEL {
            self.deadline[head] - self.now
        } else {
            i64::max_value()
        };
    }

    /// Invariant check used by tests: the head of the chain always holds the
    /// minimum deadline among active entries, and the chain is sorted.
    #[cfg(test)]
    fn is_sorted_and_head_is_min(&self) -> bool {
        let mut cur = self.next[SENTINEL];
        let mut last_deadline = i64::min_value();
        let mut seen = 0;
        while cur != SENTINEL {
            if self.deadline[cur] < last_deadline {
                return false;
            }
            last_deadline = self.deadline[cur];
            cur = self.next[cur];
            seen += 1;
            if seen > NUM_SOURCES {
                return false; // cycle in the chain
            }
        }
        true
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn new_scheduler_has_no_pending_work() {
        let s = Scheduler::new();
        assert_eq!(i64::max_value(), s.time_left());
        assert_eq!(0, s.clock());
    }

    #[test]
    fn register_sets_head_to_earliest_deadline() {
        let mut s = Scheduler::new();
        s.register(Source::Frame, Some(Box::new(|_| {})), 1000);
        s.register(Source::Raster, Some(Box::new(|_| {})), 63);
        assert_eq!(63, s.time_left());
        assert!(s.is_sorted_and_head_is_min());
    }

    #[test]
    fn cancel_removes_entry() {
        let mut s = Scheduler::new();
        s.register(Source::Raster, Some(Box::new(|_| {})), 63);
        s.cancel(Source::Raster);
        assert!(!s.is_active(Source::Raster));
        assert_eq!(i64::max_value(), s.time_left());
    }

    #[test]
    fn drain_fires_due_callbacks_in_deadline_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut s = Scheduler::new();
        {
            let order = order.clone();
            s.register(Source::Frame, Some(Box::new(move |_| order.borrow_mut().push("frame")) ), 100);
        }
        {
            let order = order.clone();
            s.register(Source::Raster, Some(Box::new(move |_| order.borrow_mut().push("raster"))), 50);
        }
        s.advance(100);
        s.drain();
        assert_eq!(vec!["raster", "frame"], *order.borrow());
    }

    #[test]
    fn callback_can_reregister_itself_and_fire_again_at_same_instant() {
        let count = Rc::new(RefCell::new(0));
        let mut s = Scheduler::new();
        fn make_cb(count: Rc<RefCell<i32>>) -> Callback {
            Box::new(move |s: &mut Scheduler| {
                *count.borrow_mut() += 1;
                if *count.borrow() < 3 {
                    // Re-register at a deadline already in the past relative
                    // to `now`; it must fire again before the CPU runs.
                    let now = s.clock();
                    s.register(Source::Raster, Some(make_cb(count.clone())), now);
                }
            })
        }
        s.register(Source::Raster, Some(make_cb(count.clone())), 10);
        s.advance(10);
        s.drain();
        assert_eq!(3, *count.borrow());
    }

    #[test]
    fn time_left_matches_head_deadline_minus_now() {
        let mut s = Scheduler::new();
        s.register(Source::Raster, Some(Box::new(|_| {})), 63);
        s.advance(10);
        assert_eq!(53, s.time_left());
    }
}
