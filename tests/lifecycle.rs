//! Handle lifecycle: close/reopen, contract-violation assertions, and the
//! close-vs-inbound-connection race.

use anyhow::Result;
use meridian_sockets::{
    DeadlineTimer, Endpoint, EventLoop, ReadPolicy, RunMode, TcpAcceptor, TcpSocket, UdpSocket,
};
use std::cell::Cell;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

fn loopback() -> Endpoint {
    Endpoint::new(Ipv4Addr::LOCALHOST, 0)
}

#[test]
fn handle_reopens_after_close_callback() -> Result<()> {
    let lp = EventLoop::new()?;
    let socket = UdpSocket::new(&lp);
    let closes = Rc::new(Cell::new(0usize));

    socket.bind(loopback(), false)?;
    let first_at = socket.local_endpoint()?;
    {
        let closes = closes.clone();
        socket.close(move || closes.set(closes.get() + 1));
    }
    lp.run(RunMode::Default)?;
    assert_eq!(closes.get(), 1);
    assert!(!socket.is_open());

    // Same handle, fresh native resource.
    socket.bind(loopback(), false)?;
    let second_at = socket.local_endpoint()?;
    assert_ne!(second_at.port(), 0);
    assert!(first_at.port() != 0);
    {
        let closes = closes.clone();
        socket.close(move || closes.set(closes.get() + 1));
    }
    lp.run(RunMode::Default)?;
    assert_eq!(closes.get(), 2);
    Ok(())
}

#[test]
fn close_callback_is_never_synchronous() -> Result<()> {
    let lp = EventLoop::new()?;
    let timer = DeadlineTimer::new(&lp);
    timer.start_wait(Duration::from_secs(60), None, || {});

    let closed = Rc::new(Cell::new(false));
    {
        let closed = closed.clone();
        timer.close(move || closed.set(true));
    }
    // Deferred to the loop, not run within close().
    assert!(!closed.get());
    lp.run(RunMode::Default)?;
    assert!(closed.get());
    Ok(())
}

#[test]
#[should_panic(expected = "close() while a close is already pending")]
fn double_close_asserts() {
    let lp = EventLoop::new().unwrap();
    let timer = DeadlineTimer::new(&lp);
    timer.start_wait(Duration::from_secs(60), None, || {});
    timer.close(|| {});
    timer.close(|| {});
}

#[test]
#[should_panic(expected = "start_wait() on a closing timer")]
fn arming_a_closing_timer_asserts() {
    let lp = EventLoop::new().unwrap();
    let timer = DeadlineTimer::new(&lp);
    timer.start_wait(Duration::from_secs(60), None, || {});
    timer.close(|| {});
    timer.start_wait(Duration::from_millis(1), None, || {});
}

#[test]
#[should_panic(expected = "write() on a socket that is not open")]
fn write_on_closed_socket_asserts() {
    let lp = EventLoop::new().unwrap();
    let socket = TcpSocket::new(&lp);
    socket.write(vec![b"x".to_vec()], |_err, _bufs| {});
}

#[test]
#[should_panic(expected = "start_read() with an empty buffer")]
fn zero_length_read_buffer_asserts() {
    let lp = EventLoop::new().unwrap();
    let socket = TcpSocket::new(&lp);
    socket.open();
    socket.start_read(Vec::new(), ReadPolicy::Continuous, |_err, _data| {});
}

#[test]
#[should_panic(expected = "bind() on a socket that is already bound")]
fn rebinding_a_bound_udp_socket_asserts() {
    let lp = EventLoop::new().unwrap();
    let socket = UdpSocket::new(&lp);
    socket.bind(loopback(), false).unwrap();
    let _ = socket.bind(loopback(), false);
}

#[test]
fn closing_acceptor_suppresses_racing_connection() -> Result<()> {
    let lp = EventLoop::new()?;
    let acceptor = TcpAcceptor::new(&lp);
    acceptor.bind(loopback())?;
    let at = acceptor.local_endpoint()?;

    let accepts = Rc::new(Cell::new(0usize));
    {
        let accepts = accepts.clone();
        acceptor.listen(16, move |_err| accepts.set(accepts.get() + 1))?;
    }

    // Land a connection in the backlog while the loop is not running; the
    // kernel completes the handshake without an accept.
    let addr = SocketAddr::from(at);
    let racer = std::thread::spawn(move || std::net::TcpStream::connect(addr));

    // The connect either completes against the backlog or is torn down by
    // the close below; both are fine, the accept handler must stay silent.
    let _ = racer.join().expect("connect thread");

    acceptor.close(|| {});
    lp.run(RunMode::Default)?;
    assert_eq!(accepts.get(), 0, "no accept callback after close()");
    Ok(())
}

#[test]
fn run_reports_active_handles() -> Result<()> {
    let lp = EventLoop::new()?;
    assert_eq!(lp.run(RunMode::Default)?, false, "empty loop has nothing to do");

    let timer = DeadlineTimer::new(&lp);
    timer.start_wait(Duration::from_secs(60), None, || {});
    assert_eq!(lp.run(RunMode::NoWait)?, true, "armed timer keeps the loop alive");

    timer.stop_wait();
    assert_eq!(lp.run(RunMode::NoWait)?, false, "idle timer does not hold the loop");

    timer.close(|| {});
    lp.run(RunMode::Default)?;
    Ok(())
}
