//! Asynchronous UDP datagram sockets.

use crate::config::{self, NetConfig, ReadPolicy};
use crate::endpoint::Endpoint;
use crate::error::ErrorCode;
use crate::event_loop::{EventLoop, LoopInner};
use crate::handle::{Canceled, CloseHandler, HandleCore, Slot};
use crate::raw;
use crate::Buffer;

use log::{trace, warn};
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Interest, Token};

use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::rc::Rc;

struct SendRequest {
    to: Endpoint,
    bufs: Vec<Buffer>,
    cb: Box<dyn FnOnce(ErrorCode, Vec<Buffer>)>,
}

pub(crate) struct UdpDriver {
    pub(crate) socket: MioUdpSocket,
    on_receive: Option<Box<dyn FnMut(ErrorCode, &[u8], Endpoint, bool)>>,
    recv_buf: Option<Buffer>,
    recv_policy: ReadPolicy,
    receiving: bool,
    send_queue: VecDeque<SendRequest>,
    pub(crate) closing: bool,
    pub(crate) on_close: Option<CloseHandler>,
    pub(crate) bound: Rc<Cell<Option<usize>>>,
}

impl UdpDriver {
    pub(crate) fn is_active(&self) -> bool {
        self.receiving || !self.send_queue.is_empty() || self.closing
    }

    pub(crate) fn drain_canceled(&mut self) -> Vec<Canceled> {
        self.send_queue
            .drain(..)
            .map(|req| Canceled::Transfer {
                cb: req.cb,
                bufs: req.bufs,
            })
            .collect()
    }
}

/// A connectionless datagram socket bound to one event loop.
///
/// Receives report the sender and whether the OS truncated an oversized
/// datagram (`partial`; the remainder is unrecoverable, not an error).
/// Sends are fire-and-forget: the handler fires once the OS accepts the
/// datagram, with no delivery guarantee. An unbound socket auto-binds the
/// wildcard address on its first send.
#[derive(Clone)]
pub struct UdpSocket {
    core: HandleCore,
    cfg: NetConfig,
}

impl UdpSocket {
    /// Creates a closed socket on `lp`, inheriting the loop's socket
    /// options.
    pub fn new(lp: &EventLoop) -> UdpSocket {
        let cfg = lp.inner().config.clone();
        UdpSocket {
            core: HandleCore::new(lp.inner().clone()),
            cfg,
        }
    }

    /// Creates a closed socket with its own socket options.
    pub fn with_config(lp: &EventLoop, cfg: NetConfig) -> UdpSocket {
        UdpSocket {
            core: HandleCore::new(lp.inner().clone()),
            cfg,
        }
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    /// Binds the socket; `reuse_addr` applies `SO_REUSEADDR` before the
    /// bind. Port 0 requests an ephemeral port.
    pub fn bind(&self, endpoint: Endpoint, reuse_addr: bool) -> io::Result<()> {
        if self.core.is_open() {
            debug_assert!(false, "bind() on a socket that is already bound");
            return Err(io::ErrorKind::InvalidInput.into());
        }
        let fd = raw::socket(raw::Type::Dgram)?;
        // Owns the descriptor from here; dropped on any error below.
        let std_socket = unsafe { raw::udp_from_os(fd) };
        if reuse_addr {
            raw::set_reuse_addr(fd, true)?;
        }
        if let Err(err) = config::apply_datagram(fd, &self.cfg) {
            warn!("socket options not applied: {}", err);
        }
        raw::bind_endpoint(fd, endpoint)?;

        let socket = MioUdpSocket::from_std(std_socket);
        let inner = self.core.inner.clone();
        let token = self.core.install(Slot::Udp(UdpDriver {
            socket,
            on_receive: None,
            recv_buf: None,
            recv_policy: ReadPolicy::Continuous,
            receiving: false,
            send_queue: VecDeque::new(),
            closing: false,
            on_close: None,
            bound: self.core.bound.clone(),
        }));
        let registered = {
            let mut slots = inner.slots.borrow_mut();
            match slots.get_mut(token) {
                Some(Slot::Udp(d)) => inner.registry.register(
                    &mut d.socket,
                    Token(token),
                    Interest::READABLE | Interest::WRITABLE,
                ),
                _ => Err(io::ErrorKind::InvalidInput.into()),
            }
        };
        if let Err(err) = registered {
            // Roll the open back; the dropped slot closes the descriptor.
            inner.slots.borrow_mut().try_remove(token);
            self.core.bound.set(None);
            return Err(err);
        }
        trace!("udp socket {} bound to {}", token, endpoint);
        Ok(())
    }

    /// Joins `group` on the local interface `iface`.
    pub fn join_multicast_group(&self, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
        self.with_socket(|s| raw::join_multicast(raw::os_socket(s), group, iface))
    }

    /// Leaves `group` on the local interface `iface`.
    pub fn leave_multicast_group(&self, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
        self.with_socket(|s| raw::leave_multicast(raw::os_socket(s), group, iface))
    }

    /// Arms reception. `on_receive` gets `(error, data, sender, partial)`
    /// per datagram; `partial` marks an OS-truncated oversized datagram.
    /// Spurious zero-length wakes with no sender are dropped silently.
    pub fn start_receive<F>(&self, buf: Buffer, policy: ReadPolicy, on_receive: F)
    where
        F: FnMut(ErrorCode, &[u8], Endpoint, bool) + 'static,
    {
        let Some(token) = self.core.token() else {
            debug_assert!(false, "start_receive() on a socket that is not bound");
            return;
        };
        if buf.is_empty() {
            debug_assert!(false, "start_receive() with an empty buffer");
            return;
        }
        {
            let mut slots = self.core.inner.slots.borrow_mut();
            let Some(Slot::Udp(d)) = slots.get_mut(token) else {
                debug_assert!(false, "socket slot vanished");
                return;
            };
            if d.closing {
                debug_assert!(false, "start_receive() on a closing socket");
                return;
            }
            if d.receiving {
                debug_assert!(false, "start_receive() while reception is already armed");
                return;
            }
            d.receiving = true;
            d.recv_policy = policy;
            d.recv_buf = Some(buf);
            d.on_receive = Some(Box::new(on_receive));
        }
        self.core.inner.schedule_ready(token, true, false);
    }

    /// Disarms reception; no-op if nothing is armed.
    pub fn stop_receive(&self) {
        let Some(token) = self.core.token() else { return };
        let mut slots = self.core.inner.slots.borrow_mut();
        if let Some(Slot::Udp(d)) = slots.get_mut(token) {
            if d.closing {
                return;
            }
            d.receiving = false;
            d.on_receive = None;
            d.recv_buf = None;
        }
    }

    /// Queues one datagram assembled from `bufs` for `to`. Fire-and-forget:
    /// `on_send` fires when the OS accepts it (or with the error), with no
    /// delivery guarantee. Auto-binds the wildcard address when unbound.
    pub fn send<F>(&self, to: Endpoint, bufs: Vec<Buffer>, on_send: F) -> io::Result<()>
    where
        F: FnOnce(ErrorCode, Vec<Buffer>) + 'static,
    {
        if !self.core.is_open() {
            self.bind(Endpoint::from_port(0), false)?;
        }
        let Some(token) = self.core.token() else {
            return Err(io::ErrorKind::InvalidInput.into());
        };
        if bufs.is_empty() {
            debug_assert!(false, "send() with no buffers");
            return Err(io::ErrorKind::InvalidInput.into());
        }
        {
            let mut slots = self.core.inner.slots.borrow_mut();
            let Some(Slot::Udp(d)) = slots.get_mut(token) else {
                debug_assert!(false, "socket slot vanished");
                return Err(io::ErrorKind::InvalidInput.into());
            };
            if d.closing {
                debug_assert!(false, "send() on a closing socket");
                return Err(io::ErrorKind::InvalidInput.into());
            }
            d.send_queue.push_back(SendRequest {
                to,
                bufs,
                cb: Box::new(on_send),
            });
        }
        self.core.inner.schedule_ready(token, false, true);
        Ok(())
    }

    /// Begins the close sequence: queued sends cancel with
    /// [`ErrorCode::CANCELED`] and `on_close` fires on the loop once the
    /// native socket is released. The handle may be bound again afterwards.
    pub fn close<F>(&self, on_close: F)
    where
        F: FnOnce() + 'static,
    {
        self.core.close(Box::new(on_close));
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.with_socket(|s| s.local_addr().map(Endpoint::from_socket_addr))
    }

    fn with_socket<R>(&self, f: impl FnOnce(&MioUdpSocket) -> io::Result<R>) -> io::Result<R> {
        let Some(token) = self.core.token() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let slots = self.core.inner.slots.borrow();
        match slots.get(token) {
            Some(Slot::Udp(d)) => f(&d.socket),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

/// Read readiness: drain arrived datagrams into the armed buffer,
/// delivering each to the handler until the OS pushes back or the policy
/// disarms. Zero-length wakes with no sender are spurious and skipped.
pub(crate) fn socket_readable(inner: &Rc<LoopInner>, token: usize) {
    let taken = {
        let mut slots = inner.slots.borrow_mut();
        let Some(Slot::Udp(d)) = slots.get_mut(token) else { return };
        if d.closing || !d.receiving {
            return;
        }
        match (d.on_receive.take(), d.recv_buf.take()) {
            (Some(cb), Some(buf)) => Some((cb, buf, d.recv_policy)),
            (cb, buf) => {
                d.on_receive = cb;
                d.recv_buf = buf;
                None
            }
        }
    };
    let Some((mut cb, mut buf, policy)) = taken else { return };

    loop {
        let result = {
            let mut slots = inner.slots.borrow_mut();
            let Some(Slot::Udp(d)) = slots.get_mut(token) else { break };
            if d.closing || !d.receiving || d.on_receive.is_some() {
                break;
            }
            raw::recv_from_trunc(&d.socket, &mut buf[..])
        };
        match result {
            Ok((0, None, _)) => {
                trace!("udp socket {}: spurious empty wake dropped", token);
            }
            Ok((n, sender, partial)) => {
                let oneshot = policy == ReadPolicy::Oneshot;
                if oneshot {
                    if let Some(Slot::Udp(d)) = inner.slots.borrow_mut().get_mut(token) {
                        d.receiving = false;
                    }
                }
                cb(
                    ErrorCode::OK,
                    &buf[..n.min(buf.len())],
                    sender.unwrap_or_default(),
                    partial,
                );
                if oneshot {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                cb(ErrorCode::from_io(&err), &[], Endpoint::default(), false);
                break;
            }
        }
    }

    let mut slots = inner.slots.borrow_mut();
    if let Some(Slot::Udp(d)) = slots.get_mut(token) {
        if d.receiving && !d.closing {
            if d.on_receive.is_none() {
                d.on_receive = Some(cb);
            }
            if d.recv_buf.is_none() {
                d.recv_buf = Some(buf);
            }
        }
    }
}

/// Write readiness: push queued datagrams until the OS pushes back. A
/// datagram send is all-or-nothing, so each attempt completes its request.
pub(crate) fn flush_sends(inner: &Rc<LoopInner>, token: usize) {
    let mut completed: Vec<(Box<dyn FnOnce(ErrorCode, Vec<Buffer>)>, Vec<Buffer>, ErrorCode)> =
        Vec::new();
    loop {
        let mut slots = inner.slots.borrow_mut();
        let Some(Slot::Udp(d)) = slots.get_mut(token) else { break };
        if d.closing {
            break;
        }
        let Some(req) = d.send_queue.front() else { break };
        match raw::send_to_vectored(&d.socket, &req.bufs, req.to) {
            Ok(_) => {
                let req = d.send_queue.pop_front().expect("non-empty send queue");
                completed.push((req.cb, req.bufs, ErrorCode::OK));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                let req = d.send_queue.pop_front().expect("non-empty send queue");
                completed.push((req.cb, req.bufs, ErrorCode::from_io(&err)));
            }
        }
    }
    for (cb, bufs, code) in completed {
        cb(code, bufs);
    }
}
