//! Cross-thread entry points: posted callbacks and async wake signals.

use anyhow::Result;
use meridian_sockets::{AsyncRequest, EventLoop, RunMode};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[test]
fn post_from_another_thread_runs_on_loop_thread() -> Result<()> {
    let lp = EventLoop::new()?;

    // An open async request keeps the default run mode alive until we are
    // done observing the post.
    let keepalive = AsyncRequest::new(&lp, || {});

    let counter = Arc::new(AtomicUsize::new(0));
    let loop_thread = thread::current().id();
    let proxy = lp.proxy();
    let worker = {
        let counter = counter.clone();
        thread::spawn(move || {
            proxy.post(move || {
                assert_eq!(
                    thread::current().id(),
                    loop_thread,
                    "posted callback must run on the loop thread"
                );
                counter.fetch_add(1, Ordering::SeqCst);
            });
            proxy.post_quit();
        })
    };

    let alive = lp.run(RunMode::Default)?;
    worker.join().expect("worker");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(alive, "the async request is still open");

    keepalive.close(|| {});
    let alive = lp.run(RunMode::Default)?;
    assert!(!alive);
    Ok(())
}

#[test]
fn posted_callbacks_run_fifo_within_a_batch() -> Result<()> {
    let lp = EventLoop::new()?;
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let order = order.clone();
        lp.post(move || order.lock().unwrap().push(i));
    }
    lp.run(RunMode::Default)?;
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn async_signal_wakes_handler_on_loop_thread() -> Result<()> {
    let lp = EventLoop::new()?;

    let fired = Rc::new(Cell::new(0usize));
    let slot: Rc<Cell<Option<AsyncRequest>>> = Rc::new(Cell::new(None));
    let request = {
        let fired = fired.clone();
        let slot = slot.clone();
        AsyncRequest::new(&lp, move || {
            fired.set(fired.get() + 1);
            if let Some(request) = slot.take() {
                request.close(|| {});
            }
        })
    };
    slot.set(Some(request.clone()));

    let signal = request.signal();
    let late_signal = request.signal();
    thread::spawn(move || signal.wake()).join().expect("waker thread");

    lp.run(RunMode::Default)?;
    assert_eq!(fired.get(), 1);
    assert!(!request.is_open());

    // Wakes aimed at a closed request are ignored, not delivered.
    late_signal.wake();
    lp.run(RunMode::NoWait)?;
    assert_eq!(fired.get(), 1);
    Ok(())
}

#[test]
fn concurrent_wakes_coalesce() -> Result<()> {
    let lp = EventLoop::new()?;

    let fired = Rc::new(Cell::new(0usize));
    let request = {
        let fired = fired.clone();
        AsyncRequest::new(&lp, move || fired.set(fired.get() + 1))
    };

    let signal = request.signal();
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let signal = signal.clone();
            thread::spawn(move || signal.wake())
        })
        .collect();
    for worker in workers {
        worker.join().expect("waker thread");
    }

    lp.run(RunMode::NoWait)?;
    let burst = fired.get();
    assert!(burst >= 1, "at least one delivery per burst");
    assert!(burst <= 8, "at most one delivery per wake");

    request.close(|| {});
    lp.run(RunMode::Default)?;
    Ok(())
}
