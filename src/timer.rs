//! One-shot and repeating deadline timers.

use crate::event_loop::{EventLoop, LoopInner};
use crate::handle::{HandleCore, Slot};

use log::trace;

use std::cell::Cell;
use std::cmp::Ordering;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Heap entry for one armed wait; ordered by deadline, ties broken by
/// insertion sequence so equal deadlines fire in arm order.
pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    pub(crate) seq: u64,
    pub(crate) token: usize,
    pub(crate) gen: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

pub(crate) struct TimerDriver {
    pub(crate) waiting: bool,
    pub(crate) gen: u64,
    repeat: Option<Duration>,
    handler: Option<Box<dyn FnMut()>>,
    pub(crate) closing: bool,
    pub(crate) on_close: Option<crate::handle::CloseHandler>,
    pub(crate) bound: Rc<Cell<Option<usize>>>,
}

/// A timer bound to one event loop.
///
/// Idle until [`start_wait`](DeadlineTimer::start_wait) arms it; fires on
/// the loop thread. A one-shot wait disarms itself before the handler runs,
/// so the handler may re-arm. Timers carry no cancellation of other
/// operations; compose timeouts by racing a timer against the operation and
/// closing the handle on expiry.
#[derive(Clone)]
pub struct DeadlineTimer {
    core: HandleCore,
}

impl DeadlineTimer {
    pub fn new(lp: &EventLoop) -> DeadlineTimer {
        DeadlineTimer {
            core: HandleCore::new(lp.inner().clone()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Whether a wait is currently armed.
    pub fn is_waiting(&self) -> bool {
        match self.core.token() {
            Some(token) => matches!(
                self.core.inner.slots.borrow().get(token),
                Some(Slot::Timer(d)) if d.waiting
            ),
            None => false,
        }
    }

    /// Arms the timer: `handler` fires after `timeout`, then every `repeat`
    /// until [`stop_wait`](DeadlineTimer::stop_wait) when one is given.
    /// Arming an already waiting timer restarts it with the new parameters.
    /// Auto-opens a closed timer; arming a closing timer is a contract
    /// violation.
    pub fn start_wait<F>(&self, timeout: Duration, repeat: Option<Duration>, handler: F)
    where
        F: FnMut() + 'static,
    {
        let inner = self.core.inner.clone();
        let token = match self.core.token() {
            Some(token) => token,
            None => self.core.install(Slot::Timer(TimerDriver {
                waiting: false,
                gen: 0,
                repeat: None,
                handler: None,
                closing: false,
                on_close: None,
                bound: self.core.bound.clone(),
            })),
        };
        let gen = inner.next_gen();
        {
            let mut slots = inner.slots.borrow_mut();
            let Some(Slot::Timer(d)) = slots.get_mut(token) else {
                debug_assert!(false, "timer slot vanished");
                return;
            };
            if d.closing {
                debug_assert!(false, "start_wait() on a closing timer");
                return;
            }
            // A new generation orphans any entry already in the heap.
            d.gen = gen;
            d.waiting = true;
            d.repeat = repeat;
            d.handler = Some(Box::new(handler));
        }
        inner.push_timer(Instant::now() + timeout, token, gen);
        trace!("timer {} armed for {:?} (repeat {:?})", token, timeout, repeat);
    }

    /// Cancels the armed wait; no-op when idle.
    pub fn stop_wait(&self) {
        let Some(token) = self.core.token() else { return };
        let inner = &self.core.inner;
        let gen = inner.next_gen();
        let mut slots = inner.slots.borrow_mut();
        if let Some(Slot::Timer(d)) = slots.get_mut(token) {
            if d.closing {
                return;
            }
            d.waiting = false;
            d.gen = gen;
            d.handler = None;
            d.repeat = None;
        }
    }

    /// Begins the close sequence; `on_close` fires on the loop once the
    /// slot is released.
    pub fn close<F>(&self, on_close: F)
    where
        F: FnOnce() + 'static,
    {
        self.core.close(Box::new(on_close));
    }
}

/// Fires every due timer. One-shot waits disarm before their handler runs;
/// repeating waits schedule the next deadline first, so a handler stopping
/// or re-arming the timer wins over the stale entry by generation.
pub(crate) fn run_expired(inner: &Rc<LoopInner>) {
    let now = Instant::now();
    loop {
        let entry = {
            let mut heap = inner.timers.borrow_mut();
            match heap.peek() {
                Some(head) if head.0.deadline <= now => heap.pop().map(|rev| rev.0),
                _ => None,
            }
        };
        let Some(entry) = entry else { break };

        let mut handler = {
            let mut slots = inner.slots.borrow_mut();
            let Some(Slot::Timer(d)) = slots.get_mut(entry.token) else {
                continue;
            };
            if d.closing || !d.waiting || d.gen != entry.gen {
                continue;
            }
            if let Some(period) = d.repeat {
                inner.push_timer(now + period, entry.token, entry.gen);
            } else {
                d.waiting = false;
            }
            d.handler.take()
        };

        if let Some(h) = handler.as_mut() {
            h();
        }

        // Hand the handler back unless the callback replaced or stopped it.
        if let Some(h) = handler {
            let mut slots = inner.slots.borrow_mut();
            if let Some(Slot::Timer(d)) = slots.get_mut(entry.token) {
                if d.handler.is_none() && d.waiting && !d.closing {
                    d.handler = Some(h);
                }
            }
        }
    }
}

/// Poll timeout until the earliest live deadline; `None` when no timer is
/// armed. Orphaned heap entries are discarded along the way.
pub(crate) fn next_timeout(inner: &LoopInner, now: Instant) -> Option<Duration> {
    loop {
        let head = {
            let heap = inner.timers.borrow();
            heap.peek().map(|rev| (rev.0.deadline, rev.0.token, rev.0.gen))
        };
        let (deadline, token, gen) = head?;
        let live = {
            let slots = inner.slots.borrow();
            matches!(
                slots.get(token),
                Some(Slot::Timer(d)) if !d.closing && d.waiting && d.gen == gen
            )
        };
        if live {
            return Some(deadline.saturating_duration_since(now));
        }
        inner.timers.borrow_mut().pop();
    }
}
