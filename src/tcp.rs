//! Asynchronous TCP stream sockets and acceptors
//!
//! This module provides the stream half of the transport: a [`TcpSocket`]
//! that connects, reads and writes through completion callbacks, and a
//! [`TcpAcceptor`] that listens and hands inbound connections to a
//! [`TcpSocket`] chosen by the application. All completion handlers run on
//! the loop thread and never synchronously within the call that issued the
//! operation.
//!
//! # Key Properties
//!
//! - **Non-Blocking**: issuing an operation returns immediately; the OS
//!   rejecting outright is a synchronous `io::Error`, everything else is
//!   delivered to the handler as an [`ErrorCode`]
//! - **Scatter/Gather Writes**: 1..N buffers submitted as one logical
//!   write; the same buffers come back through the handler
//! - **Overlapping Writes**: each `write` queues its own request; any
//!   number may be outstanding, completing FIFO
//! - **Distinguished EOF**: the peer closing its end is reported as
//!   [`ErrorCode::EOF`], a normal terminal signal
//!
//! # Examples
//!
//! ## Echo client
//!
//! ```rust,no_run
//! use meridian_sockets::{Endpoint, EventLoop, ReadPolicy, RunMode, TcpSocket};
//!
//! fn main() -> std::io::Result<()> {
//!     let lp = EventLoop::new()?;
//!     let sock = TcpSocket::new(&lp);
//!
//!     let reader = sock.clone();
//!     let writer = sock.clone();
//!     sock.connect(Endpoint::parse("127.0.0.1:8080"), move |err| {
//!         if err.is_error() {
//!             eprintln!("connect failed: {}", err);
//!             return;
//!         }
//!         writer.write(vec![b"hello".to_vec()], |err, _bufs| {
//!             if err.is_error() {
//!                 eprintln!("write failed: {}", err);
//!             }
//!         });
//!         let me = reader.clone();
//!         reader.start_read(vec![0u8; 4096], ReadPolicy::Continuous, move |err, data| {
//!             if err.is_eof() {
//!                 me.close(|| {});
//!             } else if err.is_ok() {
//!                 println!("read {} bytes", data.len());
//!             }
//!         });
//!     })?;
//!
//!     lp.run(RunMode::Default)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Echo server
//!
//! ```rust,no_run
//! use meridian_sockets::{Endpoint, EventLoop, ReadPolicy, RunMode, TcpAcceptor, TcpSocket};
//!
//! fn main() -> std::io::Result<()> {
//!     let lp = EventLoop::new()?;
//!     let acceptor = TcpAcceptor::new(&lp);
//!     acceptor.bind(Endpoint::from_port(8080))?;
//!
//!     let conn = TcpSocket::new(&lp);
//!     let acc = acceptor.clone();
//!     let sock = conn.clone();
//!     acceptor.listen(128, move |err| {
//!         if err.is_error() {
//!             return;
//!         }
//!         // The pending connection is dropped unless accepted here.
//!         if acc.accept(&sock).is_ok() {
//!             let writer = sock.clone();
//!             sock.start_read(vec![0u8; 4096], ReadPolicy::Continuous, move |err, data| {
//!                 if err.is_ok() {
//!                     writer.write(vec![data.to_vec()], |_err, _bufs| {});
//!                 }
//!             });
//!         }
//!     })?;
//!
//!     lp.run(RunMode::Default)?;
//!     Ok(())
//! }
//! ```

use crate::config::{self, NetConfig, ReadPolicy};
use crate::endpoint::Endpoint;
use crate::error::ErrorCode;
use crate::event_loop::{EventLoop, LoopInner};
use crate::handle::{Canceled, CloseHandler, HandleCore, Slot};
use crate::raw;
use crate::Buffer;

use log::{debug, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TcpState {
    /// Slot allocated, no native stream yet (or a failed connect released
    /// it).
    Open,
    Connecting,
    Connected,
}

struct WriteRequest {
    bufs: Vec<Buffer>,
    written: usize,
    cb: Box<dyn FnOnce(ErrorCode, Vec<Buffer>)>,
}

pub(crate) struct TcpDriver {
    pub(crate) stream: Option<TcpStream>,
    state: TcpState,
    on_connect: Option<Box<dyn FnOnce(ErrorCode)>>,
    on_read: Option<Box<dyn FnMut(ErrorCode, &[u8])>>,
    read_buf: Option<Buffer>,
    read_policy: ReadPolicy,
    reading: bool,
    write_queue: VecDeque<WriteRequest>,
    shutdown_cb: Option<Box<dyn FnOnce(ErrorCode)>>,
    shutdown_done: bool,
    cfg: NetConfig,
    pub(crate) closing: bool,
    pub(crate) on_close: Option<CloseHandler>,
    pub(crate) bound: Rc<Cell<Option<usize>>>,
}

impl TcpDriver {
    fn new(bound: Rc<Cell<Option<usize>>>, cfg: NetConfig) -> TcpDriver {
        TcpDriver {
            stream: None,
            state: TcpState::Open,
            on_connect: None,
            on_read: None,
            read_buf: None,
            read_policy: ReadPolicy::Continuous,
            reading: false,
            write_queue: VecDeque::new(),
            shutdown_cb: None,
            shutdown_done: false,
            cfg,
            closing: false,
            on_close: None,
            bound,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state == TcpState::Connecting
            || self.reading
            || !self.write_queue.is_empty()
            || self.shutdown_cb.is_some()
            || self.closing
    }

    pub(crate) fn drain_canceled(&mut self) -> Vec<Canceled> {
        let mut out = Vec::new();
        if let Some(cb) = self.on_connect.take() {
            out.push(Canceled::Op(cb));
        }
        for req in self.write_queue.drain(..) {
            out.push(Canceled::Transfer {
                cb: req.cb,
                bufs: req.bufs,
            });
        }
        if let Some(cb) = self.shutdown_cb.take() {
            out.push(Canceled::Op(cb));
        }
        out
    }
}

/// An asynchronous TCP stream socket bound to one event loop.
///
/// Clones are cheap references to the same underlying handle. See the
/// [module documentation](self) for usage.
#[derive(Clone)]
pub struct TcpSocket {
    core: HandleCore,
    cfg: NetConfig,
}

impl TcpSocket {
    /// Creates a closed socket on `lp`, inheriting the loop's socket
    /// options.
    pub fn new(lp: &EventLoop) -> TcpSocket {
        let cfg = lp.inner().config.clone();
        TcpSocket {
            core: HandleCore::new(lp.inner().clone()),
            cfg,
        }
    }

    /// Creates a closed socket with its own socket options.
    pub fn with_config(lp: &EventLoop, cfg: NetConfig) -> TcpSocket {
        TcpSocket {
            core: HandleCore::new(lp.inner().clone()),
            cfg,
        }
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Allocates the loop slot without connecting; valid only from Closed.
    /// `connect` auto-opens, so calling this is optional.
    pub fn open(&self) {
        if self.core.is_open() {
            debug_assert!(false, "open() on a socket that is already open");
            return;
        }
        self.core
            .install(Slot::Tcp(TcpDriver::new(self.core.bound.clone(), self.cfg.clone())));
    }

    /// Starts a connect to `endpoint`. Valid from Open or Closed
    /// (auto-opens). Never blocks: an outright OS rejection is returned
    /// synchronously; anything later, success or handshake failure, is
    /// delivered to `on_connect` on the loop.
    pub fn connect<F>(&self, endpoint: Endpoint, on_connect: F) -> io::Result<()>
    where
        F: FnOnce(ErrorCode) + 'static,
    {
        let inner = self.core.inner.clone();
        let token = match self.core.token() {
            Some(token) => token,
            None => self
                .core
                .install(Slot::Tcp(TcpDriver::new(self.core.bound.clone(), self.cfg.clone()))),
        };
        {
            let mut slots = inner.slots.borrow_mut();
            let Some(Slot::Tcp(d)) = slots.get_mut(token) else {
                debug_assert!(false, "socket slot vanished");
                return Err(io::ErrorKind::InvalidInput.into());
            };
            if d.closing {
                debug_assert!(false, "connect() on a closing socket");
                return Err(io::ErrorKind::InvalidInput.into());
            }
            if d.state != TcpState::Open {
                debug_assert!(false, "connect() with a connect already pending or established");
                return Err(io::ErrorKind::InvalidInput.into());
            }
        }

        let mut stream = TcpStream::connect(SocketAddr::from(endpoint))?;
        if let Err(err) = config::apply_stream(raw::os_socket(&stream), &self.cfg) {
            warn!("socket options not applied: {}", err);
        }
        inner
            .registry
            .register(&mut stream, Token(token), Interest::READABLE | Interest::WRITABLE)?;

        let mut slots = inner.slots.borrow_mut();
        let Some(Slot::Tcp(d)) = slots.get_mut(token) else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        d.stream = Some(stream);
        d.state = TcpState::Connecting;
        d.on_connect = Some(Box::new(on_connect));
        trace!("socket {} connecting to {}", token, endpoint);
        Ok(())
    }

    /// Arms reception. `on_read` receives `(error, data)` per arrival;
    /// under [`ReadPolicy::Continuous`] it keeps firing until
    /// [`stop_read`](TcpSocket::stop_read) or close, under
    /// [`ReadPolicy::Oneshot`] it fires once and must be re-issued. The
    /// peer closing its end arrives as [`ErrorCode::EOF`] with no data.
    pub fn start_read<F>(&self, buf: Buffer, policy: ReadPolicy, on_read: F)
    where
        F: FnMut(ErrorCode, &[u8]) + 'static,
    {
        let Some(token) = self.core.token() else {
            debug_assert!(false, "start_read() on a socket that is not open");
            return;
        };
        if buf.is_empty() {
            debug_assert!(false, "start_read() with an empty buffer");
            return;
        }
        {
            let mut slots = self.core.inner.slots.borrow_mut();
            let Some(Slot::Tcp(d)) = slots.get_mut(token) else {
                debug_assert!(false, "socket slot vanished");
                return;
            };
            if d.closing {
                debug_assert!(false, "start_read() on a closing socket");
                return;
            }
            if d.state != TcpState::Connected {
                debug_assert!(false, "start_read() before the socket is connected");
                return;
            }
            if d.reading {
                debug_assert!(false, "start_read() while a read is already armed");
                return;
            }
            d.reading = true;
            d.read_policy = policy;
            d.read_buf = Some(buf);
            d.on_read = Some(Box::new(on_read));
        }
        self.core.inner.schedule_ready(token, true, false);
    }

    /// Disarms reception; no-op if nothing is armed.
    pub fn stop_read(&self) {
        let Some(token) = self.core.token() else { return };
        let mut slots = self.core.inner.slots.borrow_mut();
        if let Some(Slot::Tcp(d)) = slots.get_mut(token) {
            if d.closing {
                return;
            }
            d.reading = false;
            d.on_read = None;
            d.read_buf = None;
        }
    }

    /// Submits `bufs` as one logical write. `on_write` fires with the same
    /// buffers once the OS has accepted every byte (or with the error that
    /// stopped it). Writes may overlap; they complete FIFO.
    pub fn write<F>(&self, bufs: Vec<Buffer>, on_write: F)
    where
        F: FnOnce(ErrorCode, Vec<Buffer>) + 'static,
    {
        let Some(token) = self.core.token() else {
            debug_assert!(false, "write() on a socket that is not open");
            return;
        };
        if bufs.is_empty() || bufs.iter().any(|b| b.is_empty()) {
            debug_assert!(false, "write() with an empty buffer");
            return;
        }
        {
            let mut slots = self.core.inner.slots.borrow_mut();
            let Some(Slot::Tcp(d)) = slots.get_mut(token) else {
                debug_assert!(false, "socket slot vanished");
                return;
            };
            if d.closing {
                debug_assert!(false, "write() on a closing socket");
                return;
            }
            if d.state != TcpState::Connected {
                debug_assert!(false, "write() before the socket is connected");
                return;
            }
            if d.shutdown_cb.is_some() || d.shutdown_done {
                debug_assert!(false, "write() after shutdown()");
                return;
            }
            d.write_queue.push_back(WriteRequest {
                bufs,
                written: 0,
                cb: Box::new(on_write),
            });
        }
        self.core.inner.schedule_ready(token, false, true);
    }

    /// Half-closes the write side once every queued write has drained;
    /// `on_shutdown` fires with the outcome. Reads remain possible until
    /// the peer closes its end.
    pub fn shutdown<F>(&self, on_shutdown: F)
    where
        F: FnOnce(ErrorCode) + 'static,
    {
        let Some(token) = self.core.token() else {
            debug_assert!(false, "shutdown() on a socket that is not open");
            return;
        };
        {
            let mut slots = self.core.inner.slots.borrow_mut();
            let Some(Slot::Tcp(d)) = slots.get_mut(token) else {
                debug_assert!(false, "socket slot vanished");
                return;
            };
            if d.closing {
                debug_assert!(false, "shutdown() on a closing socket");
                return;
            }
            if d.state != TcpState::Connected {
                debug_assert!(false, "shutdown() before the socket is connected");
                return;
            }
            if d.shutdown_cb.is_some() || d.shutdown_done {
                debug_assert!(false, "shutdown() already requested");
                return;
            }
            d.shutdown_cb = Some(Box::new(on_shutdown));
        }
        self.core.inner.schedule_ready(token, false, true);
    }

    /// Begins the close sequence: the socket stops dispatching at once,
    /// queued writes cancel with [`ErrorCode::CANCELED`], and `on_close`
    /// fires on the loop once the native socket is released. The handle may
    /// be opened again afterwards.
    pub fn close<F>(&self, on_close: F)
    where
        F: FnOnce() + 'static,
    {
        self.core.close(Box::new(on_close));
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.with_stream(|s| s.local_addr().map(Endpoint::from_socket_addr))
    }

    pub fn remote_endpoint(&self) -> io::Result<Endpoint> {
        self.with_stream(|s| s.peer_addr().map(Endpoint::from_socket_addr))
    }

    fn with_stream<R>(&self, f: impl FnOnce(&TcpStream) -> io::Result<R>) -> io::Result<R> {
        let Some(token) = self.core.token() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let slots = self.core.inner.slots.borrow();
        match slots.get(token) {
            Some(Slot::Tcp(d)) => match d.stream.as_ref() {
                Some(stream) => f(stream),
                None => Err(io::ErrorKind::NotConnected.into()),
            },
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

/// An asynchronous TCP acceptor bound to one event loop.
///
/// `bind` then `listen`; each inbound connection fires the accept handler,
/// which must call [`accept`](TcpAcceptor::accept) synchronously to keep
/// the connection; a pending connection not accepted within the handler is
/// dropped.
#[derive(Clone)]
pub struct TcpAcceptor {
    core: HandleCore,
    cfg: NetConfig,
}

pub(crate) struct AcceptorDriver {
    /// Bound but not yet listening; owns the descriptor until `listen`.
    pre: Option<std::net::TcpListener>,
    pub(crate) listener: Option<TcpListener>,
    on_accept: Option<Box<dyn FnMut(ErrorCode)>>,
    pending: Option<(TcpStream, SocketAddr)>,
    pub(crate) listening: bool,
    cfg: NetConfig,
    pub(crate) closing: bool,
    pub(crate) on_close: Option<CloseHandler>,
    pub(crate) bound: Rc<Cell<Option<usize>>>,
}

impl TcpAcceptor {
    /// Creates a closed acceptor on `lp`, inheriting the loop's socket
    /// options.
    pub fn new(lp: &EventLoop) -> TcpAcceptor {
        let cfg = lp.inner().config.clone();
        TcpAcceptor {
            core: HandleCore::new(lp.inner().clone()),
            cfg,
        }
    }

    /// Creates a closed acceptor with its own socket options.
    pub fn with_config(lp: &EventLoop, cfg: NetConfig) -> TcpAcceptor {
        TcpAcceptor {
            core: HandleCore::new(lp.inner().clone()),
            cfg,
        }
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Binds the listening address (with `SO_REUSEADDR`); port 0 requests
    /// an ephemeral port, readable back through
    /// [`local_endpoint`](TcpAcceptor::local_endpoint).
    pub fn bind(&self, endpoint: Endpoint) -> io::Result<()> {
        if self.core.is_open() {
            debug_assert!(false, "bind() on an acceptor that is already bound");
            return Err(io::ErrorKind::InvalidInput.into());
        }
        let fd = raw::socket(raw::Type::Stream)?;
        // Owns the descriptor from here; dropped on any error below.
        let pre = unsafe { raw::tcp_listener_from_os(fd) };
        raw::set_reuse_addr(fd, true)?;
        if let Err(err) = config::apply_stream(fd, &self.cfg) {
            warn!("socket options not applied: {}", err);
        }
        raw::bind_endpoint(fd, endpoint)?;
        let token = self.core.install(Slot::Acceptor(AcceptorDriver {
            pre: Some(pre),
            listener: None,
            on_accept: None,
            pending: None,
            listening: false,
            cfg: self.cfg.clone(),
            closing: false,
            on_close: None,
            bound: self.core.bound.clone(),
        }));
        trace!("acceptor {} bound to {}", token, endpoint);
        Ok(())
    }

    /// Starts listening. `on_accept` fires once per inbound connection; the
    /// handler keeps the connection only by calling
    /// [`accept`](TcpAcceptor::accept) before it returns.
    pub fn listen<F>(&self, backlog: i32, on_accept: F) -> io::Result<()>
    where
        F: FnMut(ErrorCode) + 'static,
    {
        let Some(token) = self.core.token() else {
            debug_assert!(false, "listen() before bind()");
            return Err(io::ErrorKind::InvalidInput.into());
        };
        let inner = &self.core.inner;
        let mut slots = inner.slots.borrow_mut();
        let Some(Slot::Acceptor(d)) = slots.get_mut(token) else {
            debug_assert!(false, "acceptor slot vanished");
            return Err(io::ErrorKind::InvalidInput.into());
        };
        if d.closing {
            debug_assert!(false, "listen() on a closing acceptor");
            return Err(io::ErrorKind::InvalidInput.into());
        }
        if d.listening {
            debug_assert!(false, "listen() on an acceptor that is already listening");
            return Err(io::ErrorKind::InvalidInput.into());
        }
        let Some(pre) = d.pre.take() else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        raw::listen_raw(raw::os_socket(&pre), backlog)?;
        let mut listener = TcpListener::from_std(pre);
        inner
            .registry
            .register(&mut listener, Token(token), Interest::READABLE)?;
        d.listener = Some(listener);
        d.listening = true;
        d.on_accept = Some(Box::new(on_accept));
        trace!("acceptor {} listening (backlog {})", token, backlog);
        Ok(())
    }

    /// Adopts the pending inbound connection into `socket`, which becomes
    /// Connected. Valid only synchronously within the accept handler.
    pub fn accept(&self, socket: &TcpSocket) -> io::Result<()> {
        let inner = &self.core.inner;
        let Some(atoken) = self.core.token() else {
            debug_assert!(false, "accept() on an acceptor that is not open");
            return Err(io::ErrorKind::InvalidInput.into());
        };
        let pending = {
            let mut slots = inner.slots.borrow_mut();
            match slots.get_mut(atoken) {
                Some(Slot::Acceptor(d)) => d.pending.take(),
                _ => None,
            }
        };
        let Some((mut stream, peer)) = pending else {
            debug_assert!(false, "accept() outside an accept handler");
            return Err(io::ErrorKind::InvalidInput.into());
        };

        let token = match socket.core.token() {
            Some(token) => token,
            None => socket.core.install(Slot::Tcp(TcpDriver::new(
                socket.core.bound.clone(),
                socket.cfg.clone(),
            ))),
        };
        {
            let slots = inner.slots.borrow();
            let valid = matches!(
                slots.get(token),
                Some(Slot::Tcp(d)) if !d.closing && d.state == TcpState::Open && d.stream.is_none()
            );
            if !valid {
                debug_assert!(false, "accept() into a socket that is already in use");
                return Err(io::ErrorKind::InvalidInput.into());
            }
        }
        if let Err(err) = config::apply_stream(raw::os_socket(&stream), &socket.cfg) {
            warn!("socket options not applied: {}", err);
        }
        inner
            .registry
            .register(&mut stream, Token(token), Interest::READABLE | Interest::WRITABLE)?;
        let mut slots = inner.slots.borrow_mut();
        if let Some(Slot::Tcp(d)) = slots.get_mut(token) {
            d.stream = Some(stream);
            d.state = TcpState::Connected;
        }
        trace!("acceptor {} accepted {} into socket {}", atoken, peer, token);
        Ok(())
    }

    /// Begins the close sequence; no accept handler fires after this call,
    /// even for a connection racing in concurrently.
    pub fn close<F>(&self, on_close: F)
    where
        F: FnOnce() + 'static,
    {
        self.core.close(Box::new(on_close));
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        let Some(token) = self.core.token() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let slots = self.core.inner.slots.borrow();
        match slots.get(token) {
            Some(Slot::Acceptor(d)) => {
                if let Some(pre) = d.pre.as_ref() {
                    raw::local_endpoint(raw::os_socket(pre))
                } else if let Some(listener) = d.listener.as_ref() {
                    listener.local_addr().map(Endpoint::from_socket_addr)
                } else {
                    Err(io::ErrorKind::NotConnected.into())
                }
            }
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

/// Decides a connect attempt's fate on write readiness: `None` while still
/// in flight.
fn connect_outcome(stream: &TcpStream) -> Option<ErrorCode> {
    match stream.take_error() {
        Ok(Some(err)) => return Some(ErrorCode::from_io(&err)),
        Ok(None) => {}
        Err(err) => return Some(ErrorCode::from_io(&err)),
    }
    match stream.peer_addr() {
        Ok(_) => Some(ErrorCode::OK),
        Err(err)
            if err.kind() == io::ErrorKind::NotConnected
                || err.kind() == io::ErrorKind::WouldBlock =>
        {
            None
        }
        Err(err) => Some(ErrorCode::from_io(&err)),
    }
}

/// Builds the iovec list for whatever part of a request the OS has not yet
/// taken.
fn remaining_slices<'a>(bufs: &'a [Buffer], mut skip: usize) -> Vec<io::IoSlice<'a>> {
    let mut slices = Vec::with_capacity(bufs.len());
    for buf in bufs {
        if skip >= buf.len() {
            skip -= buf.len();
            continue;
        }
        slices.push(io::IoSlice::new(&buf[skip..]));
        skip = 0;
    }
    slices
}

/// Write readiness: finish a pending connect, then flush the write queue.
pub(crate) fn socket_writable(inner: &Rc<LoopInner>, token: usize) {
    let finished = {
        let mut slots = inner.slots.borrow_mut();
        let Some(Slot::Tcp(d)) = slots.get_mut(token) else { return };
        if d.closing {
            return;
        }
        if d.state == TcpState::Connecting {
            let outcome = d.stream.as_ref().and_then(connect_outcome);
            match outcome {
                None => return,
                Some(code) => {
                    let cb = d.on_connect.take();
                    if code.is_ok() {
                        d.state = TcpState::Connected;
                        trace!("socket {} connected", token);
                    } else {
                        // The descriptor of a failed connect is unusable; a
                        // retry provisions a fresh one.
                        if let Some(mut stream) = d.stream.take() {
                            let _ = inner.registry.deregister(&mut stream);
                        }
                        d.state = TcpState::Open;
                        debug!("socket {} connect failed: {}", token, code);
                    }
                    cb.map(|cb| (cb, code))
                }
            }
        } else {
            None
        }
    };
    if let Some((cb, code)) = finished {
        cb(code);
    }
    flush_writes(inner, token);
}

/// Flushes queued writes until the OS pushes back, completing requests
/// FIFO; once the queue drains, performs a requested half-close.
fn flush_writes(inner: &Rc<LoopInner>, token: usize) {
    let mut completed: Vec<(Box<dyn FnOnce(ErrorCode, Vec<Buffer>)>, Vec<Buffer>, ErrorCode)> =
        Vec::new();
    let mut shutdown: Option<(Box<dyn FnOnce(ErrorCode)>, ErrorCode)> = None;

    loop {
        let mut slots = inner.slots.borrow_mut();
        let Some(Slot::Tcp(d)) = slots.get_mut(token) else { break };
        if d.closing || d.state != TcpState::Connected {
            break;
        }
        let Some(stream) = d.stream.as_ref() else { break };

        if let Some(req) = d.write_queue.front_mut() {
            let total: usize = req.bufs.iter().map(|b| b.len()).sum();
            let slices = remaining_slices(&req.bufs, req.written);
            let mut s: &TcpStream = stream;
            match s.write_vectored(&slices) {
                Ok(n) => {
                    req.written += n;
                    if req.written >= total {
                        let req = d.write_queue.pop_front().expect("non-empty write queue");
                        completed.push((req.cb, req.bufs, ErrorCode::OK));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    let req = d.write_queue.pop_front().expect("non-empty write queue");
                    completed.push((req.cb, req.bufs, ErrorCode::from_io(&err)));
                }
            }
        } else if let Some(cb) = d.shutdown_cb.take() {
            let code = match stream.shutdown(std::net::Shutdown::Write) {
                Ok(()) => ErrorCode::OK,
                Err(err) => ErrorCode::from_io(&err),
            };
            d.shutdown_done = true;
            shutdown = Some((cb, code));
            break;
        } else {
            break;
        }
    }

    for (cb, bufs, code) in completed {
        cb(code, bufs);
    }
    if let Some((cb, code)) = shutdown {
        cb(code);
    }
}

/// Read readiness: drain the stream into the armed buffer, delivering each
/// chunk to the read handler until the OS pushes back, EOF, or the policy
/// disarms.
pub(crate) fn socket_readable(inner: &Rc<LoopInner>, token: usize) {
    let taken = {
        let mut slots = inner.slots.borrow_mut();
        let Some(Slot::Tcp(d)) = slots.get_mut(token) else { return };
        if d.closing || !d.reading || d.state != TcpState::Connected {
            return;
        }
        match (d.on_read.take(), d.read_buf.take()) {
            (Some(cb), Some(buf)) => Some((cb, buf, d.read_policy)),
            (cb, buf) => {
                // Already mid-delivery further up the stack.
                d.on_read = cb;
                d.read_buf = buf;
                None
            }
        }
    };
    let Some((mut cb, mut buf, policy)) = taken else { return };

    loop {
        let result = {
            let mut slots = inner.slots.borrow_mut();
            let Some(Slot::Tcp(d)) = slots.get_mut(token) else { break };
            if d.closing || !d.reading || d.on_read.is_some() {
                // Stopped or re-armed with a new handler from inside the
                // previous delivery.
                break;
            }
            let Some(stream) = d.stream.as_ref() else { break };
            let mut s: &TcpStream = stream;
            s.read(&mut buf[..])
        };
        match result {
            Ok(0) => {
                if let Some(Slot::Tcp(d)) = inner.slots.borrow_mut().get_mut(token) {
                    d.reading = false;
                }
                cb(ErrorCode::EOF, &[]);
                break;
            }
            Ok(n) => {
                let oneshot = policy == ReadPolicy::Oneshot;
                if oneshot {
                    if let Some(Slot::Tcp(d)) = inner.slots.borrow_mut().get_mut(token) {
                        d.reading = false;
                    }
                }
                cb(ErrorCode::OK, &buf[..n]);
                if oneshot {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                if let Some(Slot::Tcp(d)) = inner.slots.borrow_mut().get_mut(token) {
                    d.reading = false;
                }
                cb(ErrorCode::from_io(&err), &[]);
                break;
            }
        }
    }

    // Hand the armed pieces back unless the handler replaced them.
    let mut slots = inner.slots.borrow_mut();
    if let Some(Slot::Tcp(d)) = slots.get_mut(token) {
        if d.reading && !d.closing {
            if d.on_read.is_none() {
                d.on_read = Some(cb);
            }
            if d.read_buf.is_none() {
                d.read_buf = Some(buf);
            }
        }
    }
}

/// Accept readiness: drain the backlog, stashing each connection for the
/// handler to adopt; connections the handler leaves behind are dropped.
pub(crate) fn acceptor_readable(inner: &Rc<LoopInner>, token: usize) {
    enum Step {
        Deliver(Box<dyn FnMut(ErrorCode)>, ErrorCode, bool),
        Retry,
        Stop,
    }
    loop {
        let step = {
            let mut slots = inner.slots.borrow_mut();
            let Some(Slot::Acceptor(d)) = slots.get_mut(token) else { return };
            if d.closing || !d.listening {
                return;
            }
            let Some(listener) = d.listener.as_ref() else { return };
            match listener.accept() {
                Ok((stream, peer)) => {
                    if d.cfg.tcp_nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    d.pending = Some((stream, peer));
                    match d.on_accept.take() {
                        Some(cb) => Step::Deliver(cb, ErrorCode::OK, false),
                        None => {
                            // Re-entrant dispatch while a delivery is
                            // already on the stack; drop the extra one.
                            d.pending = None;
                            Step::Stop
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Step::Stop,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => Step::Retry,
                Err(err) => match d.on_accept.take() {
                    Some(cb) => Step::Deliver(cb, ErrorCode::from_io(&err), true),
                    None => Step::Stop,
                },
            }
        };
        match step {
            Step::Deliver(mut cb, code, stop) => {
                cb(code);
                let mut slots = inner.slots.borrow_mut();
                if let Some(Slot::Acceptor(d)) = slots.get_mut(token) {
                    if let Some((_, peer)) = d.pending.take() {
                        debug!("acceptor {}: connection from {} not accepted, dropping", token, peer);
                    }
                    if d.on_accept.is_none() && d.listening && !d.closing {
                        d.on_accept = Some(cb);
                    }
                    if d.closing || !d.listening {
                        return;
                    }
                } else {
                    return;
                }
                if stop {
                    return;
                }
            }
            Step::Retry => {}
            Step::Stop => return,
        }
    }
}
