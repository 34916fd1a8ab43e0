//! Shared handle-lifecycle machinery.
//!
//! Every user-facing handle is a cheap clonable reference into its loop: an
//! `Rc` to the loop internals plus a shared cell holding the slab slot the
//! handle currently occupies (or `None` while closed). The loop's slab holds
//! the single owning reference to each driver, so a handle that frees itself
//! from inside its own close callback never leaves a dangling dispatch
//! target: the slot is dropped only after that callback has returned.
//!
//! Lifecycle: Closed → Open (slot allocated, native resource bound on first
//! use) → Closing (`close()`: source deregistered at once, queued requests
//! canceled, finalization deferred to the loop) → Closed (slot freed, close
//! callback fired, handle may open again).

use crate::async_request::AsyncDriver;
use crate::error::ErrorCode;
use crate::event_loop::LoopInner;
use crate::tcp::{AcceptorDriver, TcpDriver};
use crate::timer::TimerDriver;
use crate::udp::UdpDriver;
use crate::Buffer;

use log::trace;
use mio::Registry;

use std::cell::Cell;
use std::rc::Rc;

pub(crate) type CloseHandler = Box<dyn FnOnce()>;

/// Loop-owned driver state for one handle.
pub(crate) enum Slot {
    Tcp(TcpDriver),
    Acceptor(AcceptorDriver),
    Udp(UdpDriver),
    Timer(TimerDriver),
    Async(AsyncDriver),
}

/// A queued request canceled by a close; delivered with
/// [`ErrorCode::CANCELED`] before the close callback runs.
pub(crate) enum Canceled {
    Op(Box<dyn FnOnce(ErrorCode)>),
    Transfer {
        cb: Box<dyn FnOnce(ErrorCode, Vec<Buffer>)>,
        bufs: Vec<Buffer>,
    },
}

impl Canceled {
    fn deliver(self) {
        match self {
            Canceled::Op(cb) => cb(ErrorCode::CANCELED),
            Canceled::Transfer { cb, bufs } => cb(ErrorCode::CANCELED, bufs),
        }
    }
}

impl Slot {
    /// Whether this handle keeps the loop's default run mode alive: an
    /// operation in flight, an armed read or timer, a listener, a pending
    /// close. Idle-open stream and datagram handles do not hold the loop;
    /// an open async request always does.
    pub(crate) fn is_active(&self) -> bool {
        match self {
            Slot::Tcp(d) => d.is_active(),
            Slot::Acceptor(d) => d.listening || d.closing,
            Slot::Udp(d) => d.is_active(),
            Slot::Timer(d) => d.waiting || d.closing,
            Slot::Async(_) => true,
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        match self {
            Slot::Tcp(d) => d.closing,
            Slot::Acceptor(d) => d.closing,
            Slot::Udp(d) => d.closing,
            Slot::Timer(d) => d.closing,
            Slot::Async(d) => d.closing,
        }
    }

    /// Enters the Closing state: stores the close callback and detaches the
    /// native source from the poller so no further readiness is dispatched.
    fn begin_close(&mut self, registry: &Registry, on_close: CloseHandler) {
        match self {
            Slot::Tcp(d) => {
                d.closing = true;
                d.on_close = Some(on_close);
                if let Some(stream) = d.stream.as_mut() {
                    let _ = registry.deregister(stream);
                }
            }
            Slot::Acceptor(d) => {
                d.closing = true;
                d.on_close = Some(on_close);
                if let Some(listener) = d.listener.as_mut() {
                    let _ = registry.deregister(listener);
                }
            }
            Slot::Udp(d) => {
                d.closing = true;
                d.on_close = Some(on_close);
                let _ = registry.deregister(&mut d.socket);
            }
            Slot::Timer(d) => {
                d.closing = true;
                d.on_close = Some(on_close);
            }
            Slot::Async(d) => {
                d.closing = true;
                d.on_close = Some(on_close);
            }
        }
    }

    /// Pulls out every queued request so it can be canceled outside the
    /// slot borrow.
    fn drain_canceled(&mut self) -> Vec<Canceled> {
        match self {
            Slot::Tcp(d) => d.drain_canceled(),
            Slot::Udp(d) => d.drain_canceled(),
            Slot::Acceptor(_) | Slot::Timer(_) | Slot::Async(_) => Vec::new(),
        }
    }

    /// Consumes the slot, yielding the handle binding to clear and the
    /// close callback to fire. Dropping the slot releases the native
    /// resource.
    fn finish_close(self) -> (Rc<Cell<Option<usize>>>, Option<CloseHandler>) {
        match self {
            Slot::Tcp(d) => (d.bound, d.on_close),
            Slot::Acceptor(d) => (d.bound, d.on_close),
            Slot::Udp(d) => (d.bound, d.on_close),
            Slot::Timer(d) => (d.bound, d.on_close),
            Slot::Async(d) => (d.bound, d.on_close),
        }
    }
}

/// The reference half of a handle: which loop, and which slot (if open).
#[derive(Clone)]
pub(crate) struct HandleCore {
    pub(crate) inner: Rc<LoopInner>,
    pub(crate) bound: Rc<Cell<Option<usize>>>,
}

impl HandleCore {
    pub(crate) fn new(inner: Rc<LoopInner>) -> HandleCore {
        HandleCore {
            inner,
            bound: Rc::new(Cell::new(None)),
        }
    }

    pub(crate) fn token(&self) -> Option<usize> {
        self.bound.get()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.token().is_some()
    }

    /// Allocates the loop slot for this handle (the Closed to Open edge).
    pub(crate) fn install(&self, slot: Slot) -> usize {
        debug_assert!(self.token().is_none(), "handle is already open");
        let token = self.inner.slots.borrow_mut().insert(slot);
        self.bound.set(Some(token));
        trace!("handle {} opened", token);
        token
    }

    /// Begins the close sequence. The native source stops dispatching
    /// immediately; the slot is freed and `on_close` fires on the loop,
    /// never synchronously within this call.
    pub(crate) fn close(&self, on_close: CloseHandler) {
        let Some(token) = self.token() else {
            debug_assert!(false, "close() on a handle that is not open");
            return;
        };
        {
            let mut slots = self.inner.slots.borrow_mut();
            let Some(slot) = slots.get_mut(token) else {
                debug_assert!(false, "handle slot vanished before close()");
                return;
            };
            if slot.is_closing() {
                debug_assert!(false, "close() while a close is already pending");
                return;
            }
            slot.begin_close(&self.inner.registry, on_close);
        }
        trace!("handle {} closing", token);
        self.inner.schedule_finalize(token);
    }
}

/// Completes every pending close: cancels queued requests, drops the slot
/// (releasing the native resource), clears the handle binding, then fires
/// the close callback, which may reopen the handle or close others.
pub(crate) fn finalize_closes(inner: &Rc<LoopInner>) {
    while let Some(token) = inner.pop_finalizing() {
        inner.purge_ready(token);
        let canceled = {
            let mut slots = inner.slots.borrow_mut();
            match slots.get_mut(token) {
                Some(slot) => slot.drain_canceled(),
                None => continue,
            }
        };
        for op in canceled {
            op.deliver();
        }
        let slot = inner.slots.borrow_mut().try_remove(token);
        if let Some(slot) = slot {
            let (bound, on_close) = slot.finish_close();
            bound.set(None);
            trace!("handle {} closed", token);
            if let Some(cb) = on_close {
                cb();
            }
        }
    }
}
