//! Timer wheel adapter (§4.6): one-shot callbacks at relative delays,
//! consulted by the event loop every iteration.
//!
//! The returned [`TimerHandle`] owns the registration the way a C
//! destructor would, translated into ownership: holding an `Rc<RefCell<..>>`
//! back into the wheel and removing its entry on `Drop` is the idiomatic
//! Rust shape of "destroying the handle before it fires cancels it" — no
//! Pending/Complete discriminant is needed here because there is no shared
//! scratch arena to protect, only a map entry to remove at most once.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::host::Host;

pub(crate) type TimerCallback = Box<dyn FnOnce(&mut Host) -> TimerResult>;

/// What a fired timer callback reports back to the wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerResult {
    /// The callback's work is finished; `in_timer` is decremented immediately.
    Done,
    /// The callback kicked off further async work (typically `send_outreq`);
    /// `in_timer` stays incremented until `Host::timer_complete` is called.
    Pending,
}

struct Entry {
    deadline: Instant,
    callback: TimerCallback,
}

pub(crate) struct TimerWheelInner {
    next_id: u64,
    entries: HashMap<u64, Entry>,
    in_timer: usize,
}

impl TimerWheelInner {
    fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
            in_timer: 0,
        }
    }

    fn cancel(&mut self, id: u64) {
        self.entries.remove(&id);
    }
}

/// Shared handle to the timer wheel, held by [`Host`].
#[derive(Clone)]
pub(crate) struct TimerWheel(Rc<RefCell<TimerWheelInner>>);

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self(Rc::new(RefCell::new(TimerWheelInner::new())))
    }

    pub(crate) fn schedule(
        &self,
        delay: Duration,
        callback: impl FnOnce(&mut Host) -> TimerResult + 'static,
    ) -> TimerHandle {
        let mut inner = self.0.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                deadline: Instant::now() + delay,
                callback: Box::new(callback),
            },
        );
        TimerHandle {
            id,
            wheel: Rc::downgrade(&self.0),
        }
    }

    /// The earliest pending deadline, if any timers are scheduled. The event
    /// loop sleeps until this instant as one of its `select!` branches.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.0
            .borrow()
            .entries
            .values()
            .map(|e| e.deadline)
            .min()
    }

    /// Removes and returns every entry whose deadline has passed, bumping
    /// `in_timer` for each one removed this way. Callbacks are returned
    /// rather than invoked here so the caller can run them against `&mut
    /// Host` without this `RefCell` borrow overlapping that call.
    pub(crate) fn take_due(&self, now: Instant) -> Vec<TimerCallback> {
        let mut inner = self.0.borrow_mut();
        let due_ids: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut callbacks = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            if let Some(entry) = inner.entries.remove(&id) {
                inner.in_timer += 1;
                callbacks.push(entry.callback);
            }
        }
        callbacks
    }

    pub(crate) fn timer_complete(&self) {
        let mut inner = self.0.borrow_mut();
        inner.in_timer = inner.in_timer.saturating_sub(1);
    }

    #[cfg(test)]
    pub(crate) fn in_timer(&self) -> usize {
        self.0.borrow().in_timer
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.0.borrow().entries.len()
    }
}

/// Owns a scheduled timer's registration; dropping it before it fires
/// cancels it.
pub struct TimerHandle {
    id: u64,
    wheel: Weak<RefCell<TimerWheelInner>>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(wheel) = self.wheel.upgrade() {
            wheel.borrow_mut().cancel(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc as StdRc;

    #[test]
    fn dropping_a_handle_before_it_fires_cancels_it() {
        let wheel = TimerWheel::new();
        let handle = wheel.schedule(Duration::from_secs(60), |_| TimerResult::Done);
        assert_eq!(wheel.pending_count(), 1);
        drop(handle);
        assert_eq!(wheel.pending_count(), 0);
    }

    #[test]
    fn take_due_only_returns_expired_entries() {
        let wheel = TimerWheel::new();
        let fired = StdRc::new(RefCell::new(false));
        let fired_clone = fired.clone();
        let _h1 = wheel.schedule(Duration::from_millis(0), move |_| {
            *fired_clone.borrow_mut() = true;
            TimerResult::Done
        });
        let _h2 = wheel.schedule(Duration::from_secs(60), |_| TimerResult::Done);

        let due = wheel.take_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(due.len(), 1);
        assert_eq!(wheel.pending_count(), 1);
    }

    #[test]
    fn pending_timer_keeps_in_timer_incremented_until_complete() {
        let wheel = TimerWheel::new();
        let _h = wheel.schedule(Duration::from_millis(0), |_| TimerResult::Pending);
        let due = wheel.take_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(due.len(), 1);
        assert_eq!(wheel.in_timer(), 1);
        wheel.timer_complete();
        assert_eq!(wheel.in_timer(), 0);
    }

    #[test]
    fn next_deadline_tracks_the_earliest_entry() {
        let wheel = TimerWheel::new();
        let _h1 = wheel.schedule(Duration::from_secs(10), |_| TimerResult::Done);
        let _h2 = wheel.schedule(Duration::from_secs(1), |_| TimerResult::Done);
        let deadline = wheel.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_secs(2));
    }
}
