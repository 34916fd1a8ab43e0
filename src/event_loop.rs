//! The single-threaded reactor.
//!
//! An [`EventLoop`] wraps one OS readiness poller (epoll on Linux, kqueue on
//! macOS/BSD, IOCP on Windows, via `mio`) and owns the driver state of every
//! handle bound to it in a slab of slots. [`EventLoop::run`] pumps readiness
//! on the calling thread and invokes completion handlers synchronously
//! within that thread; handlers may issue further operations or close their
//! handle, which completes asynchronously through a final close callback.
//!
//! Exactly one thread runs the loop and its callbacks; the loop and every
//! handle are `!Send`. The only cross-thread entry points are
//! [`LoopProxy::post`], [`LoopProxy::post_quit`] and
//! [`AsyncSignal::wake`](crate::AsyncSignal::wake), all backed by a
//! mutex-protected queue and the poller's wake primitive.

use crate::async_request;
use crate::config::NetConfig;
use crate::handle::{self, Slot};
use crate::timer::{self, TimerEntry};

use log::trace;
use mio::{Events, Poll, Registry, Token, Waker};
use slab::Slab;

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Token reserved for the cross-thread wake primitive; slab slots never
/// reach it.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// How long one call to [`EventLoop::run`] keeps pumping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Pump until no active handles remain or the loop is stopped.
    Default,
    /// Process one batch, blocking until something is ready.
    Once,
    /// Process whatever is ready right now and return immediately.
    NoWait,
}

/// Work enqueued from other threads (or from the loop thread itself via
/// `post`), drained FIFO per wake batch.
pub(crate) enum Posted {
    Call(Box<dyn FnOnce() + Send>),
    Async { token: usize, gen: u64 },
    Quit,
}

pub(crate) struct PostQueue {
    queue: Mutex<VecDeque<Posted>>,
    waker: Waker,
}

impl PostQueue {
    pub(crate) fn push(&self, item: Posted) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(item);
        let _ = self.waker.wake();
    }

    fn drain(&self) -> Vec<Posted> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.drain(..).collect()
    }

    fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }
}

/// Readiness synthesized by an issue path so the first I/O attempt does not
/// wait for an OS edge.
struct Ready {
    token: usize,
    readable: bool,
    writable: bool,
}

pub(crate) struct LoopInner {
    pub(crate) registry: Registry,
    poll: RefCell<Poll>,
    pub(crate) slots: RefCell<Slab<Slot>>,
    pub(crate) timers: RefCell<BinaryHeap<Reverse<TimerEntry>>>,
    timer_seq: Cell<u64>,
    gen_counter: Cell<u64>,
    ready: RefCell<VecDeque<Ready>>,
    finalizing: RefCell<VecDeque<usize>>,
    pub(crate) shared: Arc<PostQueue>,
    stop: Cell<bool>,
    running: Cell<bool>,
    pub(crate) config: NetConfig,
}

impl LoopInner {
    /// Monotonic generation stamp; stale cross-thread signals and timer
    /// entries are detected by comparing against the slot's current value.
    pub(crate) fn next_gen(&self) -> u64 {
        let gen = self.gen_counter.get().wrapping_add(1);
        self.gen_counter.set(gen);
        gen
    }

    pub(crate) fn schedule_ready(&self, token: usize, readable: bool, writable: bool) {
        self.ready.borrow_mut().push_back(Ready {
            token,
            readable,
            writable,
        });
    }

    pub(crate) fn schedule_finalize(&self, token: usize) {
        self.finalizing.borrow_mut().push_back(token);
    }

    pub(crate) fn pop_finalizing(&self) -> Option<usize> {
        self.finalizing.borrow_mut().pop_front()
    }

    /// Drops queued synthetic readiness for a slot that is going away, so a
    /// reused slab key cannot receive a stale kick.
    pub(crate) fn purge_ready(&self, token: usize) {
        self.ready.borrow_mut().retain(|r| r.token != token);
    }

    pub(crate) fn push_timer(&self, deadline: Instant, token: usize, gen: u64) {
        let seq = self.timer_seq.get().wrapping_add(1);
        self.timer_seq.set(seq);
        self.timers.borrow_mut().push(Reverse(TimerEntry {
            deadline,
            seq,
            token,
            gen,
        }));
    }

    pub(crate) fn request_stop(&self) {
        self.stop.set(true);
    }

    fn posted_pending(&self) -> bool {
        !self.shared.is_empty()
    }

    fn work_pending(&self) -> bool {
        !self.ready.borrow().is_empty()
            || !self.finalizing.borrow().is_empty()
            || self.posted_pending()
    }

    /// Whether anything keeps the loop alive: an active handle, a close
    /// waiting to finalize, or queued work.
    fn alive(&self) -> bool {
        self.work_pending() || self.slots.borrow().iter().any(|(_, slot)| slot.is_active())
    }
}

/// Sends work to a loop from any thread.
///
/// Obtained from [`EventLoop::proxy`]; cheap to clone. Posted callbacks run
/// on the loop thread, FIFO within one wake batch; there is no ordering
/// guarantee across batches.
#[derive(Clone)]
pub struct LoopProxy {
    shared: Arc<PostQueue>,
}

impl LoopProxy {
    /// Enqueues `f` to run on the loop thread and wakes the loop.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(Posted::Call(Box::new(f)));
    }

    /// Requests the loop to exit after the iteration that observes this.
    pub fn post_quit(&self) {
        self.shared.push(Posted::Quit);
    }
}

/// The reactor: owns the poller and every handle slot bound to it.
pub struct EventLoop {
    inner: Rc<LoopInner>,
    events: RefCell<Events>,
}

impl EventLoop {
    /// Creates an independent loop with the default configuration.
    ///
    /// Loops are always explicit dependencies: construct one at process (or
    /// worker-thread) entry and pass it to the handles that need it.
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_config(NetConfig::default())
    }

    /// Creates an independent loop with the given configuration; sockets
    /// opened on this loop inherit its socket options.
    pub fn with_config(config: NetConfig) -> io::Result<EventLoop> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let events_capacity = config.events_capacity.max(1);
        trace!("event loop created (batch capacity {})", events_capacity);
        Ok(EventLoop {
            inner: Rc::new(LoopInner {
                registry,
                poll: RefCell::new(poll),
                slots: RefCell::new(Slab::with_capacity(16)),
                timers: RefCell::new(BinaryHeap::new()),
                timer_seq: Cell::new(0),
                gen_counter: Cell::new(0),
                ready: RefCell::new(VecDeque::new()),
                finalizing: RefCell::new(VecDeque::new()),
                shared: Arc::new(PostQueue {
                    queue: Mutex::new(VecDeque::new()),
                    waker,
                }),
                stop: Cell::new(false),
                running: Cell::new(false),
                config,
            }),
            events: RefCell::new(Events::with_capacity(events_capacity)),
        })
    }

    pub(crate) fn inner(&self) -> &Rc<LoopInner> {
        &self.inner
    }

    /// A `Send + Sync` handle for posting work from other threads.
    pub fn proxy(&self) -> LoopProxy {
        LoopProxy {
            shared: self.inner.shared.clone(),
        }
    }

    /// Enqueues `f` to run on the loop thread; may be called from any
    /// context that holds the loop (see [`LoopProxy::post`] for the
    /// cross-thread form).
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.shared.push(Posted::Call(Box::new(f)));
    }

    /// Requests exit after the current iteration.
    pub fn stop(&self) {
        self.inner.request_stop();
    }

    /// Whether any active handle remains bound to this loop.
    pub fn has_active_handles(&self) -> bool {
        self.inner.alive()
    }

    /// Pumps readiness and invokes completion handlers on the calling
    /// thread. Returns whether active handles remain.
    ///
    /// `RunMode::Default` returns once nothing keeps the loop alive or
    /// after [`stop`](EventLoop::stop); `Once` processes a single blocking
    /// batch; `NoWait` never blocks.
    pub fn run(&self, mode: RunMode) -> io::Result<bool> {
        if self.inner.running.replace(true) {
            debug_assert!(false, "run() is not re-entrant");
            return Ok(self.inner.alive());
        }
        struct Reset<'a>(&'a Cell<bool>);
        impl Drop for Reset<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }
        let _reset = Reset(&self.inner.running);
        self.inner.stop.set(false);

        match mode {
            RunMode::Default => {
                while !self.inner.stop.get() && self.inner.alive() {
                    self.turn(true)?;
                }
            }
            // An empty loop has nothing to block on.
            RunMode::Once => self.turn(self.inner.alive())?,
            RunMode::NoWait => self.turn(false)?,
        }
        Ok(self.inner.alive())
    }

    /// One loop iteration: poll, posted batch, readiness dispatch,
    /// synthesized readiness, due timers, close finalization.
    fn turn(&self, block: bool) -> io::Result<()> {
        let inner = &self.inner;

        let timeout = if !block || inner.work_pending() {
            Some(Duration::ZERO)
        } else {
            timer::next_timeout(inner, Instant::now())
        };

        {
            let mut events = self.events.borrow_mut();
            let mut poll = inner.poll.borrow_mut();
            if let Err(err) = poll.poll(&mut events, timeout) {
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }

        // Cross-thread batch first: FIFO within the batch, callbacks run
        // with no loop borrows held.
        for item in inner.shared.drain() {
            match item {
                Posted::Call(f) => f(),
                Posted::Async { token, gen } => async_request::fire(inner, token, gen),
                Posted::Quit => inner.stop.set(true),
            }
        }

        // Copy the batch out so no borrow lives across handler calls.
        let batch: Vec<(usize, bool, bool)> = {
            let events = self.events.borrow();
            events
                .iter()
                .filter(|ev| ev.token() != WAKER_TOKEN)
                .map(|ev| {
                    let readable = ev.is_readable() || ev.is_read_closed() || ev.is_error();
                    let writable = ev.is_writable() || ev.is_write_closed() || ev.is_error();
                    (ev.token().0, readable, writable)
                })
                .collect()
        };
        for (token, readable, writable) in batch {
            trace!(
                "event token={} readable={} writable={}",
                token,
                readable,
                writable
            );
            dispatch(inner, token, readable, writable);
        }

        // Kicks queued by issue paths and by the handlers above.
        loop {
            let next = inner.ready.borrow_mut().pop_front();
            let Some(ready) = next else { break };
            dispatch(inner, ready.token, ready.readable, ready.writable);
        }

        timer::run_expired(inner);
        handle::finalize_closes(inner);
        Ok(())
    }
}

/// Routes readiness for one slot to its driver. Write readiness first, so a
/// finished connect is observed before any read attempt.
pub(crate) fn dispatch(inner: &Rc<LoopInner>, token: usize, readable: bool, writable: bool) {
    enum Kind {
        Tcp,
        Acceptor,
        Udp,
        Inert,
    }
    let kind = match inner.slots.borrow().get(token) {
        Some(Slot::Tcp(_)) => Kind::Tcp,
        Some(Slot::Acceptor(_)) => Kind::Acceptor,
        Some(Slot::Udp(_)) => Kind::Udp,
        Some(Slot::Timer(_)) | Some(Slot::Async(_)) | None => Kind::Inert,
    };
    match kind {
        Kind::Tcp => {
            if writable {
                crate::tcp::socket_writable(inner, token);
            }
            if readable {
                crate::tcp::socket_readable(inner, token);
            }
        }
        Kind::Acceptor => {
            if readable {
                crate::tcp::acceptor_readable(inner, token);
            }
        }
        Kind::Udp => {
            if writable {
                crate::udp::flush_sends(inner, token);
            }
            if readable {
                crate::udp::socket_readable(inner, token);
            }
        }
        Kind::Inert => {}
    }
}
