//! UDP loopback tests: datagram round trip, sender reporting, truncation.

use anyhow::Result;
use meridian_sockets::{Endpoint, EventLoop, ReadPolicy, RunMode, UdpSocket};
use std::cell::{Cell, RefCell};
use std::net::Ipv4Addr;
use std::rc::Rc;

fn loopback() -> Endpoint {
    Endpoint::new(Ipv4Addr::LOCALHOST, 0)
}

#[test]
fn datagram_round_trip_reports_sender() -> Result<()> {
    let lp = EventLoop::new()?;

    let receiver = UdpSocket::new(&lp);
    receiver.bind(loopback(), false)?;
    let receiver_at = receiver.local_endpoint()?;

    let sender = UdpSocket::new(&lp);
    sender.bind(loopback(), false)?;
    let sender_at = sender.local_endpoint()?;

    let deliveries = Rc::new(Cell::new(0usize));
    {
        let count = deliveries.clone();
        let rx = receiver.clone();
        let tx = sender.clone();
        receiver.start_receive(vec![0u8; 64], ReadPolicy::Continuous, move |err, data, from, partial| {
            assert!(err.is_ok(), "receive error: {}", err);
            assert_eq!(data, b"0123456789");
            assert_eq!(data.len(), 10);
            assert!(!partial);
            assert_eq!(from, sender_at, "sender endpoint must match the bound address");
            count.set(count.get() + 1);
            rx.close(|| {});
            tx.close(|| {});
        });
    }

    sender.send(receiver_at, vec![b"0123456789".to_vec()], |err, bufs| {
        assert!(err.is_ok(), "send error: {}", err);
        assert_eq!(bufs.len(), 1);
    })?;

    let alive = lp.run(RunMode::Default)?;
    assert!(!alive);
    assert_eq!(deliveries.get(), 1);
    Ok(())
}

#[test]
fn scatter_send_arrives_as_one_datagram() -> Result<()> {
    let lp = EventLoop::new()?;

    let receiver = UdpSocket::new(&lp);
    receiver.bind(loopback(), false)?;
    let receiver_at = receiver.local_endpoint()?;

    let sender = UdpSocket::new(&lp);
    sender.bind(loopback(), false)?;

    let payloads = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
    {
        let seen = payloads.clone();
        let rx = receiver.clone();
        let tx = sender.clone();
        receiver.start_receive(vec![0u8; 64], ReadPolicy::Continuous, move |err, data, _from, partial| {
            assert!(err.is_ok());
            assert!(!partial);
            seen.borrow_mut().push(data.to_vec());
            rx.close(|| {});
            tx.close(|| {});
        });
    }

    // Three buffers, one datagram on the wire.
    sender.send(
        receiver_at,
        vec![b"head-".to_vec(), b"body-".to_vec(), b"tail".to_vec()],
        |err, bufs| {
            assert!(err.is_ok());
            assert_eq!(bufs.len(), 3);
        },
    )?;

    lp.run(RunMode::Default)?;
    assert_eq!(*payloads.borrow(), vec![b"head-body-tail".to_vec()]);
    Ok(())
}

#[test]
fn oversized_datagram_is_flagged_partial() -> Result<()> {
    let lp = EventLoop::new()?;

    let receiver = UdpSocket::new(&lp);
    receiver.bind(loopback(), false)?;
    let receiver_at = receiver.local_endpoint()?;

    let sender = UdpSocket::new(&lp);
    sender.bind(loopback(), false)?;

    let outcomes = Rc::new(RefCell::new(Vec::<(usize, bool)>::new()));
    {
        let seen = outcomes.clone();
        let rx = receiver.clone();
        let tx = sender.clone();
        // A 4-byte window for a 10-byte datagram: truncation, not error.
        receiver.start_receive(vec![0u8; 4], ReadPolicy::Continuous, move |err, data, _from, partial| {
            assert!(err.is_ok(), "truncation must not be an error: {}", err);
            seen.borrow_mut().push((data.len(), partial));
            rx.close(|| {});
            tx.close(|| {});
        });
    }

    sender.send(receiver_at, vec![b"0123456789".to_vec()], |err, _| {
        assert!(err.is_ok());
    })?;

    lp.run(RunMode::Default)?;
    assert_eq!(*outcomes.borrow(), vec![(4, true)]);
    Ok(())
}

#[test]
fn send_on_unbound_socket_auto_binds() -> Result<()> {
    let lp = EventLoop::new()?;

    let receiver = UdpSocket::new(&lp);
    receiver.bind(loopback(), false)?;
    let receiver_at = receiver.local_endpoint()?;

    let deliveries = Rc::new(Cell::new(0usize));
    let sender = UdpSocket::new(&lp);
    assert!(!sender.is_open());
    {
        let count = deliveries.clone();
        let rx = receiver.clone();
        let tx = sender.clone();
        receiver.start_receive(vec![0u8; 16], ReadPolicy::Continuous, move |err, data, _from, _partial| {
            assert!(err.is_ok());
            assert_eq!(data, b"hi");
            count.set(count.get() + 1);
            rx.close(|| {});
            tx.close(|| {});
        });
    }

    sender.send(receiver_at, vec![b"hi".to_vec()], |err, _| assert!(err.is_ok()))?;
    assert!(sender.is_open(), "send must have bound the wildcard address");

    lp.run(RunMode::Default)?;
    assert_eq!(deliveries.get(), 1);
    Ok(())
}
