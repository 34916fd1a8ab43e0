//! Cross-thread wake requests.
//!
//! An [`AsyncRequest`] is the one handle whose trigger may come from another
//! thread: cloneable [`AsyncSignal`]s mark it pending and wake the loop, and
//! the stored handler runs on the loop thread. Concurrent wakes coalesce:
//! the handler observes at least one invocation per burst, not one per wake.
//! An open request always counts as active and keeps the loop alive until it
//! is closed.

use crate::event_loop::{EventLoop, LoopInner, PostQueue, Posted};
use crate::handle::{CloseHandler, HandleCore, Slot};

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct AsyncDriver {
    pub(crate) gen: u64,
    handler: Option<Box<dyn FnMut()>>,
    pending: Arc<AtomicBool>,
    pub(crate) closing: bool,
    pub(crate) on_close: Option<CloseHandler>,
    pub(crate) bound: Rc<Cell<Option<usize>>>,
}

/// A loop-bound handle whose handler can be triggered from any thread.
#[derive(Clone)]
pub struct AsyncRequest {
    core: HandleCore,
}

impl AsyncRequest {
    /// Opens the request on `lp`; `handler` runs on the loop thread for
    /// every coalesced burst of wakes.
    pub fn new<F>(lp: &EventLoop, handler: F) -> AsyncRequest
    where
        F: FnMut() + 'static,
    {
        let core = HandleCore::new(lp.inner().clone());
        let gen = core.inner.next_gen();
        core.install(Slot::Async(AsyncDriver {
            gen,
            handler: Some(Box::new(handler)),
            pending: Arc::new(AtomicBool::new(false)),
            closing: false,
            on_close: None,
            bound: core.bound.clone(),
        }));
        AsyncRequest { core }
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// A `Send + Sync` trigger for this request. Wakes sent after the
    /// request closes are ignored.
    pub fn signal(&self) -> AsyncSignal {
        let bound = self.core.token().and_then(|token| {
            let slots = self.core.inner.slots.borrow();
            match slots.get(token) {
                Some(Slot::Async(d)) if !d.closing => Some((token, d.gen, d.pending.clone())),
                _ => None,
            }
        });
        debug_assert!(bound.is_some(), "signal() on a closed async request");
        match bound {
            Some((token, gen, pending)) => AsyncSignal {
                shared: self.core.inner.shared.clone(),
                token,
                gen,
                pending,
            },
            // Inert signal: permanently "pending" so wake() never enqueues.
            None => AsyncSignal {
                shared: self.core.inner.shared.clone(),
                token: usize::MAX,
                gen: 0,
                pending: Arc::new(AtomicBool::new(true)),
            },
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

/// Thread-safe trigger for one [`AsyncRequest`].
#[derive(Clone)]
pub struct AsyncSignal {
    shared: Arc<PostQueue>,
    token: usize,
    gen: u64,
    pending: Arc<AtomicBool>,
}

impl AsyncSignal {
    /// Marks the request pending and wakes its loop. Wakes issued while a
    /// previous one is still undelivered coalesce into a single handler
    /// invocation.
    pub fn wake(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.shared.push(Posted::Async {
                token: self.token,
                gen: self.gen,
            });
        }
    }
}

/// Runs the handler for a delivered wake, dropping stale deliveries aimed
/// at a closed (or reallocated) slot.
pub(crate) fn fire(inner: &Rc<LoopInner>, token: usize, gen: u64) {
    let mut handler = {
        let mut slots = inner.slots.borrow_mut();
        let Some(Slot::Async(d)) = slots.get_mut(token) else {
            return;
        };
        if d.closing || d.gen != gen {
            return;
        }
        // Clear before running so wakes from inside the handler re-arm.
        d.pending.store(false, Ordering::Release);
        d.handler.take()
    };

    if let Some(h) = handler.as_mut() {
        h();
    }

    if let Some(h) = handler {
        let mut slots = inner.slots.borrow_mut();
        if let Some(Slot::Async(d)) = slots.get_mut(token) {
            if d.handler.is_none() && !d.closing {
                d.handler = Some(h);
            }
        }
    }
}
